//! Batch deduplication: one candidate per identity before reconciliation.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use gfn_core::{compare_freshness, FootprintRecord, RecordKey};

/// Within one batch a repeat replaces the kept record unless it is strictly
/// older; equal stamps go to the later arrival.
pub fn replaces_kept(incoming: Option<DateTime<Utc>>, kept: Option<DateTime<Utc>>) -> bool {
    compare_freshness(incoming, kept) != Ordering::Less
}

/// Deduplicated batch, keyed and ordered by identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupedBatch {
    records: BTreeMap<RecordKey, FootprintRecord>,
    input_count: usize,
}

impl DedupedBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    /// Candidates folded into an earlier arrival of the same identity.
    pub fn collapsed(&self) -> usize {
        self.input_count - self.records.len()
    }

    pub fn get(&self, key: &RecordKey) -> Option<&FootprintRecord> {
        self.records.get(key)
    }

    pub fn records(&self) -> impl Iterator<Item = &FootprintRecord> {
        self.records.values()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut FootprintRecord> {
        self.records.values_mut()
    }

    pub fn into_records(self) -> Vec<FootprintRecord> {
        self.records.into_values().collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchDeduplicator;

impl BatchDeduplicator {
    /// Folds `candidates` in arrival order.
    pub fn deduplicate(&self, candidates: impl IntoIterator<Item = FootprintRecord>) -> DedupedBatch {
        let mut batch = DedupedBatch::default();
        for candidate in candidates {
            batch.input_count += 1;
            match batch.records.get_mut(&candidate.key) {
                Some(kept) => {
                    if replaces_kept(candidate.transformed_at, kept.transformed_at) {
                        *kept = candidate;
                    }
                }
                None => {
                    batch.records.insert(candidate.key.clone(), candidate);
                }
            }
        }
        batch
    }
}
