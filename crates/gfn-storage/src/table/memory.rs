//! In-memory keyed table, used by tests and `--destination memory`.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gfn_core::{
    supersedes, Disposition, FootprintRecord, LiveRecord, MeasureTypeInfo, RecordKey,
    ReferenceEntity, SummaryKey, SummaryRow,
};
use tokio::sync::{Mutex, RwLock};

use super::{FootprintTable, TableCounts, TableResult};

type RecordSlot = Arc<Mutex<LiveRecord>>;

/// Records live in per-key slots. A merge holds the map's write lock only to
/// create a missing slot; deciding against an existing row locks that row's
/// slot alone, so merges on distinct keys never wait on each other.
#[derive(Debug, Default)]
pub struct MemoryTable {
    records: RwLock<BTreeMap<RecordKey, RecordSlot>>,
    summaries: RwLock<BTreeMap<SummaryKey, SummaryRow>>,
    entities: RwLock<BTreeMap<i64, ReferenceEntity>>,
    measure_types: RwLock<BTreeMap<String, MeasureTypeInfo>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    async fn snapshot(slots: Vec<RecordSlot>) -> Vec<LiveRecord> {
        let mut rows = Vec::with_capacity(slots.len());
        for slot in slots {
            rows.push(slot.lock().await.clone());
        }
        rows
    }
}

#[async_trait]
impl FootprintTable for MemoryTable {
    async fn merge_record(
        &self,
        candidate: &FootprintRecord,
        now: DateTime<Utc>,
    ) -> TableResult<Disposition> {
        let existing = self.records.read().await.get(&candidate.key).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => match self.records.write().await.entry(candidate.key.clone()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::new(Mutex::new(LiveRecord {
                        record: candidate.clone(),
                        updated_at: now,
                    })));
                    return Ok(Disposition::Inserted);
                }
                // Another writer created the slot between the two locks.
                Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            },
        };

        let mut live = slot.lock().await;
        if supersedes(candidate.transformed_at, live.record.transformed_at) {
            live.record = candidate.clone();
            live.updated_at = now;
            Ok(Disposition::Updated)
        } else {
            Ok(Disposition::STALE)
        }
    }

    async fn record(&self, key: &RecordKey) -> TableResult<Option<LiveRecord>> {
        let slot = self.records.read().await.get(key).cloned();
        Ok(match slot {
            Some(slot) => Some(slot.lock().await.clone()),
            None => None,
        })
    }

    async fn records_for(&self, key: SummaryKey) -> TableResult<Vec<LiveRecord>> {
        let start = RecordKey::new(key.entity_code, key.period, "");
        let slots: Vec<RecordSlot> = self
            .records
            .read()
            .await
            .range(start..)
            .take_while(|(k, _)| k.summary_key() == key)
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        Ok(Self::snapshot(slots).await)
    }

    async fn scan_records(&self) -> TableResult<Vec<LiveRecord>> {
        let slots: Vec<RecordSlot> = self.records.read().await.values().cloned().collect();
        Ok(Self::snapshot(slots).await)
    }

    async fn upsert_summary(&self, row: &SummaryRow) -> TableResult<Disposition> {
        let previous = self.summaries.write().await.insert(row.key, row.clone());
        Ok(if previous.is_some() {
            Disposition::Updated
        } else {
            Disposition::Inserted
        })
    }

    async fn summary(&self, key: SummaryKey) -> TableResult<Option<SummaryRow>> {
        Ok(self.summaries.read().await.get(&key).cloned())
    }

    async fn upsert_entity(&self, entity: &ReferenceEntity) -> TableResult<()> {
        self.entities
            .write()
            .await
            .entry(entity.entity_code)
            .or_insert_with(|| ReferenceEntity::new(entity.entity_code))
            .absorb(entity);
        Ok(())
    }

    async fn entity(&self, entity_code: i64) -> TableResult<Option<ReferenceEntity>> {
        Ok(self.entities.read().await.get(&entity_code).cloned())
    }

    async fn upsert_measure_type(&self, info: &MeasureTypeInfo) -> TableResult<()> {
        self.measure_types
            .write()
            .await
            .insert(info.measure_type.clone(), info.clone());
        Ok(())
    }

    async fn measure_type(&self, measure_type: &str) -> TableResult<Option<MeasureTypeInfo>> {
        Ok(self.measure_types.read().await.get(measure_type).cloned())
    }

    async fn max_transformed_at(
        &self,
        start_period: i32,
        end_period: i32,
    ) -> TableResult<Option<DateTime<Utc>>> {
        let slots: Vec<RecordSlot> = self
            .records
            .read()
            .await
            .iter()
            .filter(|(k, _)| (start_period..=end_period).contains(&k.period))
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        Ok(Self::snapshot(slots)
            .await
            .into_iter()
            .filter_map(|live| live.record.transformed_at)
            .max())
    }

    async fn counts(&self) -> TableResult<TableCounts> {
        Ok(TableCounts {
            records: self.records.read().await.len() as u64,
            summaries: self.summaries.read().await.len() as u64,
            entities: self.entities.read().await.len() as u64,
            measure_types: self.measure_types.read().await.len() as u64,
        })
    }
}
