//! Data models for earthquake event ingestion

use chrono::{DateTime, Utc};
use quake_common::checksum::sha256_hex;
use serde::{Deserialize, Serialize};

/// Property keys read from every feature, in declaration order
pub const PROPERTY_FIELDS: [&str; 24] = [
    "mag", "place", "time", "status", "tsunami", "type", "url", "detail", "felt", "cdi", "mmi",
    "alert", "sig", "net", "code", "ids", "sources", "types", "nst", "dmin", "rms", "gap",
    "magType", "title",
];

/// One input file as read from the source
#[derive(Debug, Clone)]
pub struct RawDocument {
    /// Path relative to the input root; unique per file
    pub path: String,
    pub arrived_at: DateTime<Utc>,
    pub content: Vec<u8>,
    pub sha256: String,
}

impl RawDocument {
    pub fn new(path: impl Into<String>, content: Vec<u8>, arrived_at: DateTime<Utc>) -> Self {
        let sha256 = sha256_hex(&content);
        Self {
            path: path.into(),
            arrived_at,
            content,
            sha256,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.content.len()
    }
}

/// Declared feature properties, every value read as text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventProperties {
    pub mag: Option<String>,
    pub place: Option<String>,
    pub time: Option<String>,
    pub status: Option<String>,
    pub tsunami: Option<String>,
    pub event_type: Option<String>,
    pub url: Option<String>,
    pub detail: Option<String>,
    pub felt: Option<String>,
    pub cdi: Option<String>,
    pub mmi: Option<String>,
    pub alert: Option<String>,
    pub sig: Option<String>,
    pub net: Option<String>,
    pub code: Option<String>,
    pub ids: Option<String>,
    pub sources: Option<String>,
    pub types: Option<String>,
    pub nst: Option<String>,
    pub dmin: Option<String>,
    pub rms: Option<String>,
    pub gap: Option<String>,
    pub mag_type: Option<String>,
    pub title: Option<String>,
}

/// One element of a document's `features` array after the lenient structural parse
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureRecord {
    /// Natural key; `None` when missing, empty or not a scalar
    pub id: Option<String>,
    pub properties: EventProperties,
    /// `geometry.coordinates`; non-numeric positions are `None`
    pub coordinates: Vec<Option<f64>>,
}

/// The unit of storage: one flattened, typed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatEventRecord {
    pub id: String,
    /// Ingestion time; the sequence field for last-writer-wins
    #[serde(rename = "_load_ts")]
    pub load_ts: DateTime<Utc>,

    pub time: Option<DateTime<Utc>>,
    pub mag: Option<f64>,
    pub nst: Option<f64>,
    pub sig: Option<f64>,
    pub tsunami: Option<f64>,
    pub felt: Option<f64>,

    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub depth: Option<f64>,

    pub place: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub url: Option<String>,
    pub detail: Option<String>,
    pub cdi: Option<String>,
    pub mmi: Option<String>,
    pub alert: Option<String>,
    pub net: Option<String>,
    pub code: Option<String>,
    pub ids: Option<String>,
    pub sources: Option<String>,
    pub types: Option<String>,
    pub dmin: Option<String>,
    pub rms: Option<String>,
    pub gap: Option<String>,
    #[serde(rename = "magType")]
    pub mag_type: Option<String>,
    pub title: Option<String>,
}

impl FlatEventRecord {
    /// A record with only the key and sequence set
    pub fn new(id: impl Into<String>, load_ts: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            load_ts,
            time: None,
            mag: None,
            nst: None,
            sig: None,
            tsunami: None,
            felt: None,
            longitude: None,
            latitude: None,
            depth: None,
            place: None,
            status: None,
            event_type: None,
            url: None,
            detail: None,
            cdi: None,
            mmi: None,
            alert: None,
            net: None,
            code: None,
            ids: None,
            sources: None,
            types: None,
            dmin: None,
            rms: None,
            gap: None,
            mag_type: None,
            title: None,
        }
    }
}

/// A single field that failed type coercion; the field is stored as null
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoercionWarning {
    pub id: String,
    pub field: &'static str,
    pub raw: String,
}

/// A feature entry that produced no record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedFeature {
    /// Position in the `features` array
    pub index: usize,
    pub reason: String,
}

/// Outcome of a consumed file as recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    /// Parsed; its records went through the merge
    Applied,
    /// Structurally malformed; consumed without contributing records
    Rejected,
}

impl FileOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            FileOutcome::Applied => "applied",
            FileOutcome::Rejected => "rejected",
        }
    }
}

impl From<String> for FileOutcome {
    fn from(s: String) -> Self {
        match s.as_str() {
            "rejected" => FileOutcome::Rejected,
            _ => FileOutcome::Applied,
        }
    }
}

/// One row of the processed-file ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub path: String,
    pub sha256: String,
    pub size_bytes: i64,
    pub records_emitted: i64,
    pub records_skipped: i64,
    pub outcome: FileOutcome,
    pub processed_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn applied(doc: &RawDocument, records_emitted: usize, records_skipped: usize) -> Self {
        Self {
            path: doc.path.clone(),
            sha256: doc.sha256.clone(),
            size_bytes: doc.size_bytes() as i64,
            records_emitted: records_emitted as i64,
            records_skipped: records_skipped as i64,
            outcome: FileOutcome::Applied,
            processed_at: doc.arrived_at,
        }
    }

    pub fn rejected(doc: &RawDocument) -> Self {
        Self {
            outcome: FileOutcome::Rejected,
            ..Self::applied(doc, 0, 0)
        }
    }
}
