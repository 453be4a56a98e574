//! Footprint reconciliation pipeline: extraction, normalization, batch
//! deduplication, merge reconciliation and summary propagation.

pub mod aggregate;
pub mod backfill;
pub mod config;
pub mod dedup;
pub mod quality;
pub mod reconcile;
pub mod report;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use gfn_adapters::{FixtureSource, FootprintSource, GfnApiSource, MockSource, RecordNormalizer};
use gfn_core::MeasureVocabulary;
use gfn_storage::{
    ArtifactStore, FootprintTable, HttpClientConfig, HttpFetcher, MemoryTable, RatePacing,
    SqliteTable, TableError,
};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub use aggregate::{summarize, AggregationPropagator};
pub use backfill::{BackfillCoordinator, BackfillReport, BackfillRequest, PeriodFailure};
pub use config::{Destination, PipelineConfig, VocabularyFile};
pub use dedup::{replaces_kept, BatchDeduplicator, DedupedBatch};
pub use quality::{EntityChecks, QualityGate, QualityReport, StagingChecks};
pub use reconcile::{DispositionCounts, MergeOutcome, MergeReconciler};
pub use report::{report_runs_markdown, RunSummary};

pub const CRATE_NAME: &str = "gfn-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("quality gate failed: {}", .0.failed_checks.join("; "))]
    ValidationFailed(QualityReport),
    #[error("extraction failed for every period in {start}..={end}")]
    ExtractionFailed {
        start: i32,
        end: i32,
        failures: Vec<PeriodFailure>,
    },
    #[error("invalid period range {start}..={end}")]
    InvalidRange { start: i32, end: i32 },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Per-invocation overrides of the environment configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub start_period: Option<i32>,
    pub end_period: Option<i32>,
    pub full_refresh: bool,
    pub destination: Option<Destination>,
}

pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<dyn FootprintSource>,
    table: Arc<dyn FootprintTable>,
    vocabulary: Arc<MeasureVocabulary>,
    normalizer: RecordNormalizer,
    checks: StagingChecks,
}

impl Pipeline {
    pub async fn new(config: PipelineConfig) -> Result<Self> {
        let source = build_source(&config)?;
        let table = open_table(&config).await?;
        Self::with_parts(config, source, table)
    }

    /// Assemble a pipeline over an explicit source and table; vocabulary and
    /// checks still come from the workspace config directory.
    pub fn with_parts(
        config: PipelineConfig,
        source: Arc<dyn FootprintSource>,
        table: Arc<dyn FootprintTable>,
    ) -> Result<Self> {
        let vocabulary_file = VocabularyFile::load(&config.vocabulary_path())?;
        let vocabulary = vocabulary_file.vocabulary();
        let checks = StagingChecks::from_path(&config.staging_checks_path())?.with_vocabulary(&vocabulary);
        Ok(Self {
            normalizer: RecordNormalizer::new(vocabulary_file.generic_aliases()),
            vocabulary: Arc::new(vocabulary),
            checks,
            config,
            source,
            table,
        })
    }

    pub fn table(&self) -> Arc<dyn FootprintTable> {
        Arc::clone(&self.table)
    }

    pub fn coordinator(&self) -> BackfillCoordinator {
        BackfillCoordinator::new(Arc::clone(&self.source), Arc::clone(&self.table))
            .with_normalizer(self.normalizer.clone())
            .with_vocabulary(Arc::clone(&self.vocabulary))
            .with_gate(Arc::new(self.checks.clone()))
            .with_artifacts(ArtifactStore::new(self.config.artifacts_dir.clone(), "gfn"))
            .with_max_concurrent_periods(self.config.max_concurrent_requests)
    }

    /// One backfill over `request`, with reports written under `reports/<run_id>/`.
    pub async fn run_once(&self, request: BackfillRequest) -> Result<RunSummary, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let backfill = self.coordinator().run(run_id, request).await?;
        let table_counts = self.table.counts().await?;

        let mut summary = RunSummary {
            run_id: run_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            source: self.source.source_id().to_string(),
            destination: self.config.destination.as_str().to_string(),
            status: RunSummary::status_for(&backfill).to_string(),
            backfill,
            table_counts,
            reports_dir: String::new(),
            snapshot_manifest: String::new(),
        };
        let reports_dir = report::write_run_reports(&self.config.workspace_root, &mut summary).await?;
        info!(%run_id, reports_dir = %reports_dir.display(), status = %summary.status, "run reports written");
        Ok(summary)
    }
}

fn build_source(config: &PipelineConfig) -> Result<Arc<dyn FootprintSource>> {
    if config.mock {
        info!("using mock footprint source");
        return Ok(Arc::new(MockSource));
    }
    if let Some(dir) = &config.fixtures_dir {
        info!(dir = %dir.display(), "using fixture footprint source");
        return Ok(Arc::new(FixtureSource::new(dir.clone())));
    }
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        max_concurrent_requests: config.max_concurrent_requests,
        pacing: Some(RatePacing {
            requests_per_second: config.requests_per_second,
            burst: config.max_concurrent_requests.max(1) as u32,
        }),
        basic_auth: config
            .api_key
            .clone()
            .map(|key| (config.api_username.clone(), key)),
        ..Default::default()
    })?;
    Ok(Arc::new(GfnApiSource::new(
        config.api_base_url.clone(),
        Arc::new(fetcher),
    )))
}

async fn open_table(config: &PipelineConfig) -> Result<Arc<dyn FootprintTable>> {
    Ok(match config.destination {
        Destination::Memory => Arc::new(MemoryTable::new()),
        Destination::Sqlite => Arc::new(
            SqliteTable::open(&config.sqlite_path)
                .await
                .with_context(|| format!("opening {}", config.sqlite_path.display()))?,
        ),
    })
}

fn apply_options(mut config: PipelineConfig, options: &RunOptions) -> (PipelineConfig, BackfillRequest) {
    if let Some(destination) = options.destination {
        config.destination = destination;
    }
    let mut request = BackfillRequest::new(
        options.start_period.unwrap_or(config.start_year),
        options.end_period.unwrap_or(config.end_year),
    );
    if options.full_refresh {
        request = request.replacing();
    }
    (config, request)
}

pub async fn run_from_env(options: RunOptions) -> Result<RunSummary, SyncError> {
    let (config, request) = apply_options(PipelineConfig::from_env()?, &options);
    let pipeline = Pipeline::new(config).await?;
    pipeline.run_once(request).await
}

/// Create the SQLite schema without running a load.
pub async fn migrate_from_env() -> Result<std::path::PathBuf> {
    let config = PipelineConfig::from_env()?;
    SqliteTable::open(&config.sqlite_path)
        .await
        .with_context(|| format!("migrating {}", config.sqlite_path.display()))?;
    Ok(config.sqlite_path)
}

pub fn report_from_env(runs: usize) -> Result<String> {
    let config = PipelineConfig::from_env()?;
    report_runs_markdown(runs, Path::new(&config.workspace_root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn config(root: &Path) -> PipelineConfig {
        PipelineConfig {
            api_base_url: "http://127.0.0.1:9".into(),
            api_key: None,
            api_username: "any-user-name".into(),
            mock: true,
            fixtures_dir: None,
            destination: Destination::Memory,
            sqlite_path: root.join("gfn.sqlite"),
            artifacts_dir: root.join("data"),
            start_year: 2019,
            end_year: 2020,
            http_timeout_secs: 5,
            user_agent: "gfn-test".into(),
            max_concurrent_requests: 2,
            requests_per_second: 50.0,
            workspace_root: root.to_path_buf(),
        }
    }

    #[test]
    fn options_override_config() {
        let dir = tempdir().expect("tempdir");
        let options = RunOptions {
            start_period: Some(2001),
            end_period: None,
            full_refresh: true,
            destination: Some(Destination::Sqlite),
        };
        let (config, request) = apply_options(config(dir.path()), &options);
        assert_eq!(config.destination, Destination::Sqlite);
        assert_eq!((request.start_period, request.end_period), (2001, 2020));
        assert!(request.replace);
    }

    #[test]
    fn validation_error_lists_failed_checks() {
        let err = SyncError::ValidationFailed(QualityReport {
            failed_checks: vec!["a".into(), "b".into()],
            ..QualityReport::default()
        });
        assert_eq!(err.to_string(), "quality gate failed: a; b");
    }

    #[tokio::test]
    async fn mock_pipeline_run_is_idempotent_and_writes_reports() {
        let dir = tempdir().expect("tempdir");
        let pipeline = Pipeline::new(config(dir.path())).await.expect("mock pipeline");

        let first = pipeline.run_once(BackfillRequest::new(2019, 2020)).await.expect("run once");
        assert_eq!(first.status, "completed");
        assert_eq!(first.backfill.counts.inserted, 16);
        assert!(PathBuf::from(&first.snapshot_manifest).exists());
        assert!(PathBuf::from(&first.reports_dir).join("run_summary.json").exists());
        assert_eq!(first.backfill.processed_artifacts.len(), 2);
        for relative in &first.backfill.processed_artifacts {
            assert!(dir.path().join("data").join(relative).exists(), "{relative}");
        }

        let second = pipeline.run_once(BackfillRequest::new(2019, 2020)).await.expect("run once");
        assert_eq!(second.backfill.counts.inserted, 0);
        assert_eq!(second.backfill.counts.total(), 16);
        assert_eq!(second.table_counts, first.table_counts);

        let digest = report_runs_markdown(10, dir.path()).expect("report runs markdown");
        assert!(digest.contains(&first.run_id));
        assert!(digest.contains(&second.run_id));
    }
}
