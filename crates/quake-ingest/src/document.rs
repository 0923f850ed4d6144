//! Structural validation of incoming documents
//!
//! The first of two parsing phases. A document must be a JSON object holding
//! a `features` array; anything inside a feature is read leniently, with every
//! declared property captured as text. Typed coercion happens later in
//! [`crate::flatten`], so a wrongly typed field never fails a document here.

use serde_json::{Map, Value};

use crate::error::{IngestError, Result};
use crate::models::{EventProperties, FeatureRecord, PROPERTY_FIELDS};

/// A structurally valid document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDocument {
    pub features: Vec<FeatureRecord>,
}

/// Parse raw bytes into a [`ParsedDocument`]
///
/// Fails with [`IngestError::Parse`] naming the offending JSON path when the
/// payload is not JSON, the top level is not an object, or `features` is
/// missing or not an array.
pub fn parse_document(bytes: &[u8]) -> Result<ParsedDocument> {
    let root: Value = serde_json::from_slice(bytes)
        .map_err(|e| IngestError::parse("$", format!("invalid JSON: {}", e)))?;

    let mut root = match root {
        Value::Object(map) => map,
        other => {
            return Err(IngestError::parse(
                "$",
                format!("expected an object, found {}", kind(&other)),
            ))
        },
    };

    let features = match root.remove("features") {
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(IngestError::parse(
                "$.features",
                format!("expected an array, found {}", kind(&other)),
            ))
        },
        None => return Err(IngestError::parse("$.features", "missing")),
    };

    Ok(ParsedDocument {
        features: features.iter().map(read_feature).collect(),
    })
}

/// Read one `features[]` element; non-objects become an empty record that the
/// flattener drops for lacking an id
fn read_feature(value: &Value) -> FeatureRecord {
    let Some(obj) = value.as_object() else {
        return FeatureRecord::default();
    };

    let id = obj.get("id").and_then(scalar_text).filter(|id| !id.is_empty());

    let properties = obj
        .get("properties")
        .and_then(Value::as_object)
        .map(read_properties)
        .unwrap_or_default();

    let coordinates = obj
        .get("geometry")
        .and_then(|g| g.get("coordinates"))
        .and_then(Value::as_array)
        .map(|coords| coords.iter().map(Value::as_f64).collect())
        .unwrap_or_default();

    FeatureRecord {
        id,
        properties,
        coordinates,
    }
}

fn read_properties(obj: &Map<String, Value>) -> EventProperties {
    let mut props = EventProperties::default();
    for key in PROPERTY_FIELDS {
        props.set(key, obj.get(key).and_then(as_text));
    }
    props
}

/// Any non-null value as text; objects and arrays become compact JSON
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(_) | Value::Bool(_) | Value::Array(_) | Value::Object(_) => {
            Some(value.to_string())
        },
    }
}

/// Strings and numbers only; used for keys
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl EventProperties {
    /// Assign a declared property by its JSON key; unknown keys are ignored
    pub fn set(&mut self, key: &str, value: Option<String>) {
        let slot = match key {
            "mag" => &mut self.mag,
            "place" => &mut self.place,
            "time" => &mut self.time,
            "status" => &mut self.status,
            "tsunami" => &mut self.tsunami,
            "type" => &mut self.event_type,
            "url" => &mut self.url,
            "detail" => &mut self.detail,
            "felt" => &mut self.felt,
            "cdi" => &mut self.cdi,
            "mmi" => &mut self.mmi,
            "alert" => &mut self.alert,
            "sig" => &mut self.sig,
            "net" => &mut self.net,
            "code" => &mut self.code,
            "ids" => &mut self.ids,
            "sources" => &mut self.sources,
            "types" => &mut self.types,
            "nst" => &mut self.nst,
            "dmin" => &mut self.dmin,
            "rms" => &mut self.rms,
            "gap" => &mut self.gap,
            "magType" => &mut self.mag_type,
            "title" => &mut self.title,
            _ => return,
        };
        *slot = value;
    }
}
