//! Backfill coordinator: extraction over a period range, then one pass of
//! normalize, deduplicate, validate, merge and propagate over the unified batch.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration, Utc};
use gfn_adapters::{ExtractedPage, FootprintSource, NormalizeContext, RecordNormalizer};
use gfn_core::{storage_precision, FootprintRecord, MeasureVocabulary, ReferenceEntity, SummaryRow};
use gfn_storage::{ArtifactStore, FootprintTable, StagingLayer, TableError};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::AggregationPropagator;
use crate::dedup::{BatchDeduplicator, DedupedBatch};
use crate::quality::{QualityGate, QualityReport, StagingChecks};
use crate::reconcile::{DispositionCounts, MergeReconciler};
use crate::SyncError;

pub const RAW_DATASET: &str = "footprint_data";
pub const PROCESSED_DATASET: &str = "footprint_data";

/// Validated rows of one period, as written to the processed layer.
#[derive(Debug, Serialize)]
struct ProcessedPeriod<'a> {
    countries: Vec<&'a ReferenceEntity>,
    footprint_data: Vec<&'a FootprintRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackfillRequest {
    pub start_period: i32,
    pub end_period: i32,
    /// Supersede everything previously loaded for the range.
    pub replace: bool,
}

impl BackfillRequest {
    pub fn new(start_period: i32, end_period: i32) -> Self {
        Self {
            start_period,
            end_period,
            replace: false,
        }
    }

    pub fn replacing(mut self) -> Self {
        self.replace = true;
        self
    }

    pub fn periods(&self) -> RangeInclusive<i32> {
        self.start_period..=self.end_period
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodFailure {
    pub period: i32,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub run_id: Uuid,
    pub request: BackfillRequest,
    pub succeeded_periods: Vec<i32>,
    pub failed_periods: Vec<PeriodFailure>,
    pub staged_artifacts: usize,
    /// Processed-layer paths, relative to the artifacts root.
    pub processed_artifacts: Vec<String>,
    pub payloads: usize,
    pub candidates: usize,
    pub dropped: usize,
    pub deduplicated: usize,
    pub replace_stamp: Option<DateTime<Utc>>,
    pub quality: QualityReport,
    pub counts: DispositionCounts,
    pub per_period: BTreeMap<i32, DispositionCounts>,
    pub summaries_written: usize,
    #[serde(skip)]
    pub batch: Vec<FootprintRecord>,
    #[serde(skip)]
    pub summaries: Vec<SummaryRow>,
}

impl BackfillReport {
    pub fn is_partial(&self) -> bool {
        !self.failed_periods.is_empty()
    }

    /// Contiguous sub-ranges that failed extraction, ready to be re-requested.
    pub fn retry_ranges(&self) -> Vec<(i32, i32)> {
        let mut ranges: Vec<(i32, i32)> = Vec::new();
        for failure in &self.failed_periods {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == failure.period => *end = failure.period,
                _ => ranges.push((failure.period, failure.period)),
            }
        }
        ranges
    }
}

pub struct BackfillCoordinator {
    source: Arc<dyn FootprintSource>,
    table: Arc<dyn FootprintTable>,
    normalizer: RecordNormalizer,
    deduplicator: BatchDeduplicator,
    gate: Arc<dyn QualityGate>,
    vocabulary: Arc<MeasureVocabulary>,
    artifacts: Option<ArtifactStore>,
    max_concurrent_periods: usize,
}

impl BackfillCoordinator {
    pub fn new(source: Arc<dyn FootprintSource>, table: Arc<dyn FootprintTable>) -> Self {
        let vocabulary = Arc::new(MeasureVocabulary::gfn_default());
        Self {
            source,
            table,
            normalizer: RecordNormalizer::default(),
            deduplicator: BatchDeduplicator,
            gate: Arc::new(StagingChecks::default().with_vocabulary(&vocabulary)),
            vocabulary,
            artifacts: None,
            max_concurrent_periods: 4,
        }
    }

    pub fn with_normalizer(mut self, normalizer: RecordNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn QualityGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_vocabulary(mut self, vocabulary: Arc<MeasureVocabulary>) -> Self {
        self.vocabulary = vocabulary;
        self
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_max_concurrent_periods(mut self, limit: usize) -> Self {
        self.max_concurrent_periods = limit.max(1);
        self
    }

    pub async fn run(&self, run_id: Uuid, request: BackfillRequest) -> Result<BackfillReport, SyncError> {
        let span = info_span!(
            "backfill",
            %run_id,
            start = request.start_period,
            end = request.end_period,
            replace = request.replace
        );
        self.run_inner(run_id, request).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, request: BackfillRequest) -> Result<BackfillReport, SyncError> {
        if request.start_period > request.end_period {
            return Err(SyncError::InvalidRange {
                start: request.start_period,
                end: request.end_period,
            });
        }

        let (pages, failed_periods) = self.extract_all(run_id, request).await?;
        if pages.is_empty() {
            return Err(SyncError::ExtractionFailed {
                start: request.start_period,
                end: request.end_period,
                failures: failed_periods,
            });
        }

        let mut staged_artifacts = 0usize;
        if let Some(store) = &self.artifacts {
            for page in &pages {
                store
                    .stage_bytes(
                        StagingLayer::Raw,
                        RAW_DATASET,
                        page.period,
                        page.fetched_at,
                        "json",
                        &page.body,
                    )
                    .await
                    .with_context(|| format!("staging raw page for period {}", page.period))?;
                staged_artifacts += 1;
            }
        }

        let transformed_at = storage_precision(Utc::now());
        let payloads: usize = pages.iter().map(|p| p.payloads.len()).sum();
        let mut candidates = Vec::with_capacity(payloads);
        let mut dropped = 0usize;
        for page in &pages {
            let ctx = NormalizeContext {
                extracted_at: page.fetched_at,
                transformed_at,
                source_file: page.source_file.clone(),
            };
            for payload in &page.payloads {
                match self.normalizer.normalize(payload, &ctx) {
                    Ok(record) => candidates.push(record),
                    Err(err) => {
                        dropped += 1;
                        warn!(period = page.period, source_file = %page.source_file, error = %err, "payload dropped");
                    }
                }
            }
        }
        let candidate_count = candidates.len();
        let entities = reference_entities(&candidates);

        let mut batch = self.deduplicator.deduplicate(candidates);

        let mut replace_stamp = None;
        if request.replace {
            let (start, end) = batch_span(&batch)
                .map(|(lo, hi)| (lo.min(request.start_period), hi.max(request.end_period)))
                .unwrap_or((request.start_period, request.end_period));
            let stamp = self.replace_stamp(start, end).await?;
            for record in batch.records_mut() {
                record.transformed_at = Some(stamp);
            }
            replace_stamp = Some(stamp);
        }

        let entity_rows: Vec<ReferenceEntity> = entities.values().cloned().collect();
        let quality = self.gate.validate(&batch, &entity_rows);
        if !quality.passed {
            return Err(SyncError::ValidationFailed(quality));
        }

        let processed_artifacts = match &self.artifacts {
            Some(store) => stage_processed(store, &batch, &entities, transformed_at).await?,
            None => Vec::new(),
        };

        for entity in entities.values() {
            self.table.upsert_entity(entity).await?;
        }
        let measures: BTreeSet<&str> = batch.records().map(|r| r.key.measure_type.as_str()).collect();
        for measure in measures {
            self.table
                .upsert_measure_type(&self.vocabulary.classify(measure))
                .await?;
        }

        let outcome = MergeReconciler::new(Arc::clone(&self.table)).merge(&batch).await?;
        let summaries = AggregationPropagator::new(Arc::clone(&self.table), Arc::clone(&self.vocabulary))
            .propagate(&outcome.touched())
            .await?;

        let report = BackfillReport {
            run_id,
            request,
            succeeded_periods: pages.iter().map(|p| p.period).collect(),
            failed_periods,
            staged_artifacts,
            processed_artifacts,
            payloads,
            candidates: candidate_count,
            dropped,
            deduplicated: batch.len(),
            replace_stamp,
            quality,
            counts: outcome.counts(),
            per_period: outcome.counts_by_period(),
            summaries_written: summaries.len(),
            batch: batch.into_records(),
            summaries,
        };
        info!(
            payloads = report.payloads,
            dropped = report.dropped,
            inserted = report.counts.inserted,
            updated = report.counts.updated,
            skipped = report.counts.skipped,
            failed_periods = report.failed_periods.len(),
            "backfill complete"
        );
        Ok(report)
    }

    /// Pages in period order plus the periods whose extraction failed.
    async fn extract_all(
        &self,
        run_id: Uuid,
        request: BackfillRequest,
    ) -> Result<(Vec<ExtractedPage>, Vec<PeriodFailure>), SyncError> {
        let limit = Arc::new(Semaphore::new(self.max_concurrent_periods));
        let mut tasks = JoinSet::new();
        for period in request.periods() {
            let source = Arc::clone(&self.source);
            let limit = Arc::clone(&limit);
            tasks.spawn(
                async move {
                    let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                    (period, source.extract_period(run_id, period).await)
                }
                .instrument(info_span!("extract_period", period)),
            );
        }

        let mut pages = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (period, result) = joined.map_err(|err| anyhow!(err).context("extraction task failed"))?;
            match result {
                Ok(page) => pages.push(page),
                Err(err) => {
                    warn!(period, error = %err, "period extraction failed");
                    failures.push(PeriodFailure {
                        period,
                        error: err.to_string(),
                    });
                }
            }
        }
        // Completion order is arbitrary; dedup ties need a fixed arrival order.
        pages.sort_by_key(|p| p.period);
        failures.sort_by_key(|f| f.period);
        Ok((pages, failures))
    }

    /// A stamp strictly newer than every live record with `start <= period <= end`.
    pub async fn replace_stamp(&self, start: i32, end: i32) -> Result<DateTime<Utc>, TableError> {
        let now = storage_precision(Utc::now());
        Ok(match self.table.max_transformed_at(start, end).await? {
            Some(latest) if latest >= now => latest + Duration::microseconds(1),
            _ => now,
        })
    }
}

/// Stage the validated batch as one JSON document per period.
async fn stage_processed(
    store: &ArtifactStore,
    batch: &DedupedBatch,
    entities: &BTreeMap<i64, ReferenceEntity>,
    transformed_at: DateTime<Utc>,
) -> anyhow::Result<Vec<String>> {
    let mut by_period: BTreeMap<i32, Vec<&FootprintRecord>> = BTreeMap::new();
    for record in batch.records() {
        by_period.entry(record.key.period).or_default().push(record);
    }

    let mut paths = Vec::with_capacity(by_period.len());
    for (period, records) in by_period {
        let codes: BTreeSet<i64> = records.iter().map(|r| r.key.entity_code).collect();
        let document = ProcessedPeriod {
            countries: codes.iter().filter_map(|code| entities.get(code)).collect(),
            footprint_data: records,
        };
        let bytes = serde_json::to_vec(&document)
            .with_context(|| format!("serializing processed batch for period {period}"))?;
        let staged = store
            .stage_bytes(
                StagingLayer::Processed,
                PROCESSED_DATASET,
                period,
                transformed_at,
                "json",
                &bytes,
            )
            .await
            .with_context(|| format!("staging processed batch for period {period}"))?;
        paths.push(staged.relative_path.display().to_string());
    }
    Ok(paths)
}

/// Lowest and highest period in the batch; rows may fall outside the request.
fn batch_span(batch: &DedupedBatch) -> Option<(i32, i32)> {
    let mut periods = batch.records().map(|r| r.key.period);
    let first = periods.next()?;
    Some(periods.fold((first, first), |(lo, hi), p| (lo.min(p), hi.max(p))))
}

/// One reference row per entity; later arrivals fill or overwrite fields they carry.
fn reference_entities(candidates: &[FootprintRecord]) -> BTreeMap<i64, ReferenceEntity> {
    let mut entities: BTreeMap<i64, ReferenceEntity> = BTreeMap::new();
    for candidate in candidates {
        let incoming = candidate.reference_entity();
        entities
            .entry(incoming.entity_code)
            .or_insert_with(|| ReferenceEntity::new(incoming.entity_code))
            .absorb(&incoming);
    }
    entities
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfn_adapters::MockSource;
    use gfn_core::{RecordKey, SummaryKey};
    use gfn_storage::MemoryTable;
    use tempfile::tempdir;

    fn coordinator(table: Arc<MemoryTable>) -> BackfillCoordinator {
        BackfillCoordinator::new(Arc::new(MockSource), table)
    }

    #[tokio::test]
    async fn mock_backfill_loads_records_dimensions_and_summaries() {
        let table = Arc::new(MemoryTable::new());
        let dir = tempdir().expect("tempdir");
        let report = coordinator(table.clone())
            .with_artifacts(ArtifactStore::new(dir.path(), "gfn"))
            .run(Uuid::new_v4(), BackfillRequest::new(2019, 2020))
            .await
            .expect("mock backfill");

        assert_eq!(report.succeeded_periods, vec![2019, 2020]);
        assert_eq!(report.staged_artifacts, 2);
        assert_eq!(report.processed_artifacts.len(), 2);
        for relative in &report.processed_artifacts {
            assert!(relative.starts_with("processed"), "{relative}");
            let bytes = std::fs::read(dir.path().join(relative)).expect("processed artifact written");
            let document: serde_json::Value = serde_json::from_slice(&bytes).expect("processed json");
            assert_eq!(document["footprint_data"].as_array().map(Vec::len), Some(8));
            assert_eq!(document["countries"].as_array().map(Vec::len), Some(2));
        }
        assert_eq!(report.counts.inserted, 16);
        assert_eq!(report.per_period[&2019].inserted, 8);
        assert_eq!(report.summaries_written, 4);

        let counts = table.counts().await.expect("counts");
        assert_eq!(counts.entities, 2);
        assert_eq!(counts.measure_types, 4);
        let summary = table
            .summary(SummaryKey { entity_code: 1, period: 2020 })
            .await
            .expect("read summary")
            .expect("summary present");
        assert!(summary.ecological_deficit.expect("deficit derived") > 0.0);
        let entity = table.entity(2).await.expect("read entity").expect("entity present");
        assert_eq!(entity.iso2.as_deref(), Some("DE"));
    }

    #[tokio::test]
    async fn entity_coverage_shortfall_warns_without_blocking() {
        use crate::quality::{EntityChecks, StagingChecksFile};

        let table = Arc::new(MemoryTable::new());
        let checks = StagingChecks::new(StagingChecksFile {
            countries: EntityChecks {
                min_entity_coverage: Some(150),
                ..EntityChecks::default()
            },
            ..StagingChecksFile::default()
        });
        let report = coordinator(table)
            .with_gate(Arc::new(checks))
            .run(Uuid::new_v4(), BackfillRequest::new(2020, 2020))
            .await
            .expect("coverage is a warning");
        assert_eq!(report.counts.inserted, 8);
        assert!(report
            .quality
            .warnings
            .iter()
            .any(|w| w.starts_with("countries.coverage: only 2 entities")));
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let table = Arc::new(MemoryTable::new());
        let err = coordinator(table)
            .run(Uuid::new_v4(), BackfillRequest::new(2021, 2020))
            .await
            .expect_err("inverted range");
        assert!(matches!(err, SyncError::InvalidRange { start: 2021, end: 2020 }));
    }

    #[tokio::test]
    async fn replace_stamp_beats_existing_rows_in_range() {
        let table = Arc::new(MemoryTable::new());
        let mut future = FootprintRecord::with_key(RecordKey::new(1, 2020, "EFConsTotGHA"));
        let far = Utc::now() + Duration::days(365);
        future.transformed_at = Some(storage_precision(far));
        table.merge_record(&future, Utc::now()).await.expect("seed row");

        let coordinator = coordinator(table);
        let stamp = coordinator.replace_stamp(2020, 2020).await.expect("stamp");
        assert!(Some(stamp) > future.transformed_at);

        let elsewhere = coordinator.replace_stamp(2010, 2011).await.expect("stamp");
        assert!(Some(elsewhere) < future.transformed_at);
    }

    #[test]
    fn retry_ranges_group_adjacent_failures() {
        let failure = |period| PeriodFailure {
            period,
            error: "boom".into(),
        };
        let report = BackfillReport {
            run_id: Uuid::nil(),
            request: BackfillRequest::new(2000, 2010),
            succeeded_periods: vec![],
            failed_periods: vec![failure(2001), failure(2002), failure(2005)],
            staged_artifacts: 0,
            processed_artifacts: vec![],
            payloads: 0,
            candidates: 0,
            dropped: 0,
            deduplicated: 0,
            replace_stamp: None,
            quality: QualityReport::default(),
            counts: DispositionCounts::default(),
            per_period: BTreeMap::new(),
            summaries_written: 0,
            batch: vec![],
            summaries: vec![],
        };
        assert!(report.is_partial());
        assert_eq!(report.retry_ranges(), vec![(2001, 2002), (2005, 2005)]);
    }
}
