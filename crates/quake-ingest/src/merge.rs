//! In-batch reduction for last-writer-wins merges
//!
//! Before a batch reaches the table it is reduced to one record per `id`: the
//! one with the greatest `_load_ts`. On a tie the record that came LAST in
//! input order wins. Input order is discovery order of files (lexicographic
//! path) followed by document order of features, so the outcome is
//! deterministic for a given set of files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::FlatEventRecord;

/// Result of [`reduce_latest`]
#[derive(Debug, Clone, Default)]
pub struct Reduced {
    /// One record per id, ordered by the id's first appearance in the input
    pub records: Vec<FlatEventRecord>,
    /// Input records that lost to another record with the same id
    pub superseded: usize,
}

/// Keep the latest record per id
pub fn reduce_latest(records: Vec<FlatEventRecord>) -> Reduced {
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<FlatEventRecord> = Vec::with_capacity(records.len());
    let mut superseded = 0;

    for record in records {
        match slots.get(&record.id) {
            Some(&slot) => {
                superseded += 1;
                if record.load_ts >= out[slot].load_ts {
                    out[slot] = record;
                }
            },
            None => {
                slots.insert(record.id.clone(), out.len());
                out.push(record);
            },
        }
    }

    Reduced {
        records: out,
        superseded,
    }
}

/// Per-batch merge counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Records handed to the merge
    pub received: usize,
    /// Dropped inside the batch by a later record for the same id
    pub superseded: usize,
    /// New ids
    pub inserted: usize,
    /// Existing ids replaced by a newer record
    pub updated: usize,
    /// Ignored because the stored record was as new or newer
    pub stale: usize,
}

impl MergeStats {
    pub fn absorb(&mut self, other: &MergeStats) {
        self.received += other.received;
        self.superseded += other.superseded;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.stale += other.stale;
    }
}
