//! Flattening of parsed documents into typed event records
//!
//! The second parsing phase. Each feature becomes one [`FlatEventRecord`]:
//! declared properties copied as text, coordinates split into
//! longitude/latitude/depth, and six fields coerced to numbers or timestamps.
//! A coercion failure nulls that one field and records a
//! [`CoercionWarning`]; it never drops the record.

use chrono::{DateTime, Utc};
use quake_common::types::from_epoch_seconds;

use crate::document::ParsedDocument;
use crate::models::{CoercionWarning, DroppedFeature, FeatureRecord, FlatEventRecord};

/// Output of flattening one document
#[derive(Debug, Clone, Default)]
pub struct Flattened {
    pub records: Vec<FlatEventRecord>,
    pub warnings: Vec<CoercionWarning>,
    pub dropped: Vec<DroppedFeature>,
}

/// Flatten every feature of `doc`, stamping each record with `load_ts`
pub fn flatten_document(doc: &ParsedDocument, load_ts: DateTime<Utc>) -> Flattened {
    let mut out = Flattened::default();

    for (index, feature) in doc.features.iter().enumerate() {
        match feature.id.as_deref() {
            Some(id) => {
                let record = flatten_feature(id, feature, load_ts, &mut out.warnings);
                out.records.push(record);
            },
            None => out.dropped.push(DroppedFeature {
                index,
                reason: "missing id".to_string(),
            }),
        }
    }

    out
}

fn flatten_feature(
    id: &str,
    feature: &FeatureRecord,
    load_ts: DateTime<Utc>,
    warnings: &mut Vec<CoercionWarning>,
) -> FlatEventRecord {
    let props = &feature.properties;
    let mut coerce = |field: &'static str, raw: &Option<String>| -> Option<f64> {
        let raw = raw.as_deref()?;
        let parsed = parse_double(raw);
        if parsed.is_none() {
            warnings.push(CoercionWarning {
                id: id.to_string(),
                field,
                raw: raw.to_string(),
            });
        }
        parsed
    };

    let mag = coerce("mag", &props.mag);
    let nst = coerce("nst", &props.nst);
    let sig = coerce("sig", &props.sig);
    let tsunami = coerce("tsunami", &props.tsunami);
    let felt = coerce("felt", &props.felt);
    let time = props.time.as_deref().and_then(|raw| {
        let ts = epoch_millis_to_timestamp(raw);
        if ts.is_none() {
            warnings.push(CoercionWarning {
                id: id.to_string(),
                field: "time",
                raw: raw.to_string(),
            });
        }
        ts
    });

    let coord = |i: usize| feature.coordinates.get(i).copied().flatten();

    FlatEventRecord {
        id: id.to_string(),
        load_ts,
        time,
        mag,
        nst,
        sig,
        tsunami,
        felt,
        longitude: coord(0),
        latitude: coord(1),
        depth: coord(2),
        place: props.place.clone(),
        status: props.status.clone(),
        event_type: props.event_type.clone(),
        url: props.url.clone(),
        detail: props.detail.clone(),
        cdi: props.cdi.clone(),
        mmi: props.mmi.clone(),
        alert: props.alert.clone(),
        net: props.net.clone(),
        code: props.code.clone(),
        ids: props.ids.clone(),
        sources: props.sources.clone(),
        types: props.types.clone(),
        dmin: props.dmin.clone(),
        rms: props.rms.clone(),
        gap: props.gap.clone(),
        mag_type: props.mag_type.clone(),
        title: props.title.clone(),
    }
}

/// Text to f64, ignoring surrounding whitespace
fn parse_double(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok()
}

/// Epoch milliseconds (as text) to a timestamp truncated to whole seconds
fn epoch_millis_to_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let millis = parse_double(raw).filter(|m| m.is_finite())?;
    let secs = (millis / 1000.0).trunc();
    if secs < i64::MIN as f64 || secs > i64::MAX as f64 {
        return None;
    }
    from_epoch_seconds(secs as i64).ok()
}
