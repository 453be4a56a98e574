//! Keyed footprint tables.
//!
//! The pipeline needs two things from a destination: a point upsert that is
//! atomic for a single key, and a scan of every record sharing an
//! `(entity_code, period)` prefix. Both implementations decide a merge with
//! [`gfn_core::supersedes`] evaluated inside that single-key write, so
//! concurrent runs against overlapping keys converge without a table lock.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gfn_core::{
    Disposition, FootprintRecord, LiveRecord, MeasureTypeInfo, RecordKey, ReferenceEntity,
    SummaryKey, SummaryRow,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row {key}: {message}")]
    Corrupt { key: String, message: String },
}

pub type TableResult<T> = Result<T, TableError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub records: u64,
    pub summaries: u64,
    pub entities: u64,
    pub measure_types: u64,
}

#[async_trait]
pub trait FootprintTable: Send + Sync {
    /// Insert the candidate, overwrite a stale live row, or leave a fresher one alone.
    /// `now` becomes the row's `updated_at` on insert or update.
    async fn merge_record(
        &self,
        candidate: &FootprintRecord,
        now: DateTime<Utc>,
    ) -> TableResult<Disposition>;

    async fn record(&self, key: &RecordKey) -> TableResult<Option<LiveRecord>>;

    /// Every live record whose key starts with `(entity_code, period)`, in key order.
    async fn records_for(&self, key: SummaryKey) -> TableResult<Vec<LiveRecord>>;

    /// Every live record in key order.
    async fn scan_records(&self) -> TableResult<Vec<LiveRecord>>;

    /// Unconditional overwrite; returns `Inserted` or `Updated`.
    async fn upsert_summary(&self, row: &SummaryRow) -> TableResult<Disposition>;

    async fn summary(&self, key: SummaryKey) -> TableResult<Option<SummaryRow>>;

    async fn upsert_entity(&self, entity: &ReferenceEntity) -> TableResult<()>;

    async fn entity(&self, entity_code: i64) -> TableResult<Option<ReferenceEntity>>;

    async fn upsert_measure_type(&self, info: &MeasureTypeInfo) -> TableResult<()>;

    async fn measure_type(&self, measure_type: &str) -> TableResult<Option<MeasureTypeInfo>>;

    /// Greatest `transformed_at` among live records with `start <= period <= end`.
    async fn max_transformed_at(
        &self,
        start_period: i32,
        end_period: i32,
    ) -> TableResult<Option<DateTime<Utc>>>;

    async fn counts(&self) -> TableResult<TableCounts>;
}
