//! Merge reconciler: applies a deduplicated batch to the keyed table.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use gfn_core::{storage_precision, Disposition, RecordKey, SummaryKey};
use gfn_storage::{FootprintTable, TableError};
use serde::Serialize;
use tracing::{debug, info};

use crate::dedup::DedupedBatch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispositionCounts {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl DispositionCounts {
    pub fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Inserted => self.inserted += 1,
            Disposition::Updated => self.updated += 1,
            Disposition::Skipped { .. } => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.skipped
    }

    pub fn changed(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub dispositions: BTreeMap<RecordKey, Disposition>,
}

impl MergeOutcome {
    pub fn disposition(&self, key: &RecordKey) -> Option<Disposition> {
        self.dispositions.get(key).copied()
    }

    pub fn counts(&self) -> DispositionCounts {
        let mut counts = DispositionCounts::default();
        for disposition in self.dispositions.values() {
            counts.record(*disposition);
        }
        counts
    }

    pub fn counts_by_period(&self) -> BTreeMap<i32, DispositionCounts> {
        let mut by_period: BTreeMap<i32, DispositionCounts> = BTreeMap::new();
        for (key, disposition) in &self.dispositions {
            by_period.entry(key.period).or_default().record(*disposition);
        }
        by_period
    }

    /// Summary keys whose underlying records changed; stale skips are excluded.
    pub fn touched(&self) -> BTreeSet<SummaryKey> {
        self.dispositions
            .iter()
            .filter(|(_, d)| d.is_change())
            .map(|(key, _)| key.summary_key())
            .collect()
    }
}

#[derive(Clone)]
pub struct MergeReconciler {
    table: Arc<dyn FootprintTable>,
}

impl MergeReconciler {
    pub fn new(table: Arc<dyn FootprintTable>) -> Self {
        Self { table }
    }

    /// One conditional write per key; an interrupted merge leaves every
    /// already-written key in its converged state.
    pub async fn merge(&self, batch: &DedupedBatch) -> Result<MergeOutcome, TableError> {
        let mut outcome = MergeOutcome::default();
        for candidate in batch.records() {
            let now = storage_precision(Utc::now());
            let disposition = self.table.merge_record(candidate, now).await?;
            if !disposition.is_change() {
                debug!(key = %candidate.key, "stale candidate skipped");
            }
            outcome.dispositions.insert(candidate.key.clone(), disposition);
        }
        let counts = outcome.counts();
        info!(
            inserted = counts.inserted,
            updated = counts.updated,
            skipped = counts.skipped,
            "merge complete"
        );
        Ok(outcome)
    }
}
