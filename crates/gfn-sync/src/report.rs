//! Per-run reports and parquet snapshots under `reports/<run_id>/`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int32Array, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use gfn_core::{FootprintRecord, SummaryRow};
use gfn_storage::TableCounts;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::backfill::BackfillReport;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Everything the CLI prints and `run_summary.json` records about one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub destination: String,
    pub status: String,
    pub backfill: BackfillReport,
    pub table_counts: TableCounts,
    pub reports_dir: String,
    pub snapshot_manifest: String,
}

impl RunSummary {
    pub fn status_for(report: &BackfillReport) -> &'static str {
        if report.is_partial() {
            "partial"
        } else {
            "completed"
        }
    }
}

pub fn render_run_markdown(summary: &RunSummary) -> String {
    let report = &summary.backfill;
    let mut lines = vec![
        "# GFN Pipeline Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Source: {}", summary.source),
        format!("- Destination: {}", summary.destination),
        format!(
            "- Periods: {}..={}{}",
            report.request.start_period,
            report.request.end_period,
            if report.request.replace { " (full refresh)" } else { "" }
        ),
        format!("- Status: {}", summary.status),
        String::new(),
        "## Totals".to_string(),
        format!("- payloads: {}", report.payloads),
        format!("- dropped: {}", report.dropped),
        format!("- candidates: {}", report.candidates),
        format!("- deduplicated: {}", report.deduplicated),
        format!("- inserted: {}", report.counts.inserted),
        format!("- updated: {}", report.counts.updated),
        format!("- skipped: {}", report.counts.skipped),
        format!("- summaries written: {}", report.summaries_written),
        format!("- raw artifacts staged: {}", report.staged_artifacts),
        format!("- processed artifacts staged: {}", report.processed_artifacts.len()),
        String::new(),
        "## Per Period".to_string(),
        "| period | inserted | updated | skipped |".to_string(),
        "|---|---|---|---|".to_string(),
    ];
    for (period, counts) in &report.per_period {
        lines.push(format!(
            "| {period} | {} | {} | {} |",
            counts.inserted, counts.updated, counts.skipped
        ));
    }
    if report.is_partial() {
        lines.push(String::new());
        lines.push("## Failed Periods".to_string());
        for failure in &report.failed_periods {
            lines.push(format!("- {}: {}", failure.period, failure.error));
        }
        for (start, end) in report.retry_ranges() {
            lines.push(format!("- retry with `--start-period {start} --end-period {end}`"));
        }
    }
    if !report.quality.warnings.is_empty() {
        lines.push(String::new());
        lines.push("## Quality Warnings".to_string());
        for warning in &report.quality.warnings {
            lines.push(format!("- {warning}"));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

pub fn reports_dir_for(workspace_root: &Path, run_id: &str) -> PathBuf {
    workspace_root.join("reports").join(run_id)
}

/// Writes `run_summary.md`, `run_summary.json` and the parquet snapshots.
/// `summary.reports_dir` and `summary.snapshot_manifest` are filled in here.
pub async fn write_run_reports(workspace_root: &Path, summary: &mut RunSummary) -> Result<PathBuf> {
    let reports_dir = reports_dir_for(workspace_root, &summary.run_id);
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let manifest_path = export_parquet_snapshots(
        &reports_dir,
        &summary.backfill.batch,
        &summary.backfill.summaries,
    )?;
    summary.reports_dir = reports_dir.display().to_string();
    summary.snapshot_manifest = manifest_path.display().to_string();

    fs::write(reports_dir.join("run_summary.md"), render_run_markdown(summary))
        .await
        .context("writing run_summary.md")?;
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    Ok(reports_dir)
}

fn export_parquet_snapshots(
    reports_dir: &Path,
    batch: &[FootprintRecord],
    summaries: &[SummaryRow],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let batch_path = snapshot_dir.join("footprint_batch.parquet");
    let summaries_path = snapshot_dir.join("summary_rows.parquet");
    write_parquet(&batch_path, footprint_batch_record_batch(batch)?)?;
    write_parquet(&summaries_path, summary_record_batch(summaries)?)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("footprint_batch", reports_dir, &batch_path)?,
            manifest_entry("summary_rows", reports_dir, &summaries_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn footprint_batch_record_batch(records: &[FootprintRecord]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entity_code", DataType::Int64, false),
        ArrowField::new("period", DataType::Int32, false),
        ArrowField::new("measure_type", DataType::Utf8, false),
        ArrowField::new("entity_name", DataType::Utf8, true),
        ArrowField::new("entity_iso2", DataType::Utf8, true),
        ArrowField::new("aggregate_value", DataType::Float64, true),
        ArrowField::new("carbon", DataType::Float64, true),
        ArrowField::new("quality_score", DataType::Utf8, false),
        ArrowField::new("derived_percentage", DataType::Float64, true),
        ArrowField::new("transformed_at", DataType::Utf8, true),
        ArrowField::new("source_file", DataType::Utf8, true),
    ]));

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from_iter_values(records.iter().map(|r| r.key.entity_code))),
            Arc::new(Int32Array::from_iter_values(records.iter().map(|r| r.key.period))),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.key.measure_type.as_str()),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.entity_name.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.entity_iso2.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                records.iter().map(|r| r.aggregate_value).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                records.iter().map(|r| r.components.carbon).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.quality_score.as_str()),
            )),
            Arc::new(Float64Array::from(
                records.iter().map(|r| r.derived_percentage).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records
                    .iter()
                    .map(|r| r.transformed_at.map(|t| t.to_rfc3339()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.source_file.as_deref()).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building footprint_batch record batch")
}

fn summary_record_batch(rows: &[SummaryRow]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entity_code", DataType::Int64, false),
        ArrowField::new("period", DataType::Int32, false),
        ArrowField::new("entity_name", DataType::Utf8, true),
        ArrowField::new("ef_consumption_total", DataType::Float64, true),
        ArrowField::new("biocapacity_total", DataType::Float64, true),
        ArrowField::new("ecological_deficit", DataType::Float64, true),
        ArrowField::new("deficit_per_capita", DataType::Float64, true),
        ArrowField::new("footprint_to_biocapacity_pct", DataType::Float64, true),
        ArrowField::new("carbon_share_pct", DataType::Float64, true),
        ArrowField::new("measure_count", DataType::UInt32, false),
    ]));
    let floats = |f: fn(&SummaryRow) -> Option<f64>| {
        Arc::new(Float64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
    };

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.key.entity_code))),
            Arc::new(Int32Array::from_iter_values(rows.iter().map(|r| r.key.period))),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.entity_name.as_deref()).collect::<Vec<_>>(),
            )),
            floats(|r| r.ef_consumption_total),
            floats(|r| r.biocapacity_total),
            floats(|r| r.ecological_deficit),
            floats(|r| r.deficit_per_capita),
            floats(|r| r.footprint_to_biocapacity_pct),
            floats(|r| r.carbon_share_pct),
            Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.measure_count))),
        ],
    )
    .context("building summary_rows record batch")
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Markdown digest of the `runs` most recent run directories.
pub fn report_runs_markdown(runs: usize, workspace_root: &Path) -> Result<String> {
    let mut lines = vec!["# GFN Pipeline Runs".to_string(), String::new()];
    let reports_root = workspace_root.join("reports");
    let entries = match std::fs::read_dir(&reports_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(lines.join("\n")),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", reports_root.display()))
        }
    };
    let mut dirs = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("run_summary.json");
        if !summary_path.exists() {
            continue;
        }
        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        let field = |path: &[&str]| {
            path.iter()
                .try_fold(&summary, |v, key| v.get(key))
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "?".to_string())
        };

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- status: {}", field(&["status"])));
        lines.push(format!("- finished: {}", field(&["finished_at"])));
        lines.push(format!(
            "- periods: {}..={}",
            field(&["backfill", "request", "start_period"]),
            field(&["backfill", "request", "end_period"])
        ));
        lines.push(format!(
            "- inserted/updated/skipped: {}/{}/{}",
            field(&["backfill", "counts", "inserted"]),
            field(&["backfill", "counts", "updated"]),
            field(&["backfill", "counts", "skipped"])
        ));
        lines.push(format!("- dropped payloads: {}", field(&["backfill", "dropped"])));
        let manifest_path = dir.path().join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- snapshot manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
