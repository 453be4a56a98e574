//! Staging quality gate run between deduplication and reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use gfn_core::{FootprintRecord, MeasureVocabulary, ReferenceEntity};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dedup::DedupedBatch;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    pub passed: bool,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub checks_warned: usize,
    pub failed_checks: Vec<String>,
    pub warnings: Vec<String>,
}

impl QualityReport {
    fn pass(&mut self, check: &str) {
        self.checks_run += 1;
        self.checks_passed += 1;
        debug!(check, "quality check passed");
    }

    fn fail(&mut self, message: String) {
        self.checks_run += 1;
        self.checks_failed += 1;
        self.failed_checks.push(message);
    }

    fn warn(&mut self, message: String) {
        self.checks_run += 1;
        self.checks_passed += 1;
        self.checks_warned += 1;
        self.warnings.push(message);
    }
}

/// Pass/fail boundary in front of the reconciler; a failed report blocks the batch.
pub trait QualityGate: Send + Sync {
    fn validate(&self, batch: &DedupedBatch, entities: &[ReferenceEntity]) -> QualityReport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredField {
    EntityName,
    EntityShortName,
    EntityIso2,
    AggregateValue,
    TransformedAt,
    SourceFile,
}

impl RequiredField {
    fn is_missing(self, record: &FootprintRecord) -> bool {
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        match self {
            Self::EntityName => blank(&record.entity_name),
            Self::EntityShortName => blank(&record.entity_short_name),
            Self::EntityIso2 => blank(&record.entity_iso2),
            Self::AggregateValue => record.aggregate_value.is_none(),
            Self::TransformedAt => record.transformed_at.is_none(),
            Self::SourceFile => blank(&record.source_file),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::EntityName => "entity_name",
            Self::EntityShortName => "entity_short_name",
            Self::EntityIso2 => "entity_iso2",
            Self::AggregateValue => "aggregate_value",
            Self::TransformedAt => "transformed_at",
            Self::SourceFile => "source_file",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityField {
    Name,
    ShortName,
    Iso2,
}

impl EntityField {
    fn is_missing(self, entity: &ReferenceEntity) -> bool {
        let value = match self {
            Self::Name => &entity.name,
            Self::ShortName => &entity.short_name,
            Self::Iso2 => &entity.iso2,
        };
        value.as_deref().map_or(true, |s| s.trim().is_empty())
    }

    fn name(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::ShortName => "short_name",
            Self::Iso2 => "iso2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCount {
    pub min: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub min: i32,
    pub max: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FootprintChecks {
    pub row_count: Option<RowCount>,
    pub required_columns: Vec<RequiredField>,
    pub valid_year_range: Option<YearRange>,
    pub non_negative_value: bool,
    pub unique_key: bool,
    /// Unknown measure types only warn; new types appear as the source evolves.
    pub valid_record_types: Option<Vec<String>>,
}

impl Default for FootprintChecks {
    fn default() -> Self {
        Self {
            row_count: Some(RowCount { min: 1 }),
            required_columns: vec![RequiredField::EntityName],
            valid_year_range: Some(YearRange { min: 1960, max: 2030 }),
            non_negative_value: true,
            unique_key: true,
            valid_record_types: None,
        }
    }
}

/// Checks over the reference entities a batch carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityChecks {
    pub row_count: Option<RowCount>,
    pub required_columns: Vec<EntityField>,
    pub unique_key: bool,
    /// Fewer distinct entities than this only warns; partial extractions are allowed.
    pub min_entity_coverage: Option<usize>,
}

impl Default for EntityChecks {
    fn default() -> Self {
        Self {
            row_count: Some(RowCount { min: 1 }),
            required_columns: vec![EntityField::Name],
            unique_key: true,
            min_entity_coverage: None,
        }
    }
}

/// `config/staging_checks.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingChecksFile {
    pub footprint_data: FootprintChecks,
    pub countries: EntityChecks,
    pub warn_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagingChecks {
    checks: FootprintChecks,
    entity_checks: EntityChecks,
    warn_only: bool,
}

impl Default for StagingChecks {
    fn default() -> Self {
        Self::new(StagingChecksFile::default())
    }
}

impl StagingChecks {
    pub fn new(file: StagingChecksFile) -> Self {
        Self {
            checks: file.footprint_data,
            entity_checks: file.countries,
            warn_only: file.warn_only,
        }
    }

    /// Loads the checks file, falling back to built-in defaults when it is absent.
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "staging checks file absent; using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: StagingChecksFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(file))
    }

    /// Fills the known-measure list from `vocabulary` unless the file named one.
    pub fn with_vocabulary(mut self, vocabulary: &MeasureVocabulary) -> Self {
        if self.checks.valid_record_types.is_none() {
            self.checks.valid_record_types = Some(
                vocabulary
                    .measures
                    .iter()
                    .map(|m| m.measure_type.clone())
                    .collect(),
            );
        }
        self
    }

    pub fn warn_only(mut self, warn_only: bool) -> Self {
        self.warn_only = warn_only;
        self
    }

    fn check_footprints(&self, batch: &DedupedBatch, report: &mut QualityReport) {
        let checks = &self.checks;

        if let Some(RowCount { min }) = checks.row_count {
            if batch.len() >= min {
                report.pass("row_count");
            } else {
                report.fail(format!(
                    "footprint_data.row_count: expected >= {min}, got {}",
                    batch.len()
                ));
            }
        }

        for field in &checks.required_columns {
            let missing = batch.records().filter(|r| field.is_missing(r)).count();
            if missing == 0 {
                report.pass(field.name());
            } else {
                report.fail(format!(
                    "footprint_data.{}: {missing} missing values",
                    field.name()
                ));
            }
        }

        if let Some(YearRange { min, max }) = checks.valid_year_range {
            let outside = batch
                .records()
                .filter(|r| r.key.period < min || r.key.period > max)
                .count();
            if outside == 0 {
                report.pass("valid_year_range");
            } else {
                report.fail(format!(
                    "footprint_data.year: {outside} values outside range [{min}, {max}]"
                ));
            }
        }

        if let Some(valid) = &checks.valid_record_types {
            let unknown: BTreeSet<&str> = batch
                .records()
                .map(|r| r.key.measure_type.as_str())
                .filter(|m| !valid.iter().any(|v| v == m))
                .collect();
            if unknown.is_empty() {
                report.pass("valid_record_types");
            } else {
                report.warn(format!(
                    "footprint_data.record_type: {} unknown types: {}",
                    unknown.len(),
                    unknown.into_iter().collect::<Vec<_>>().join(", ")
                ));
            }
        }

        if checks.non_negative_value {
            let negative = batch
                .records()
                .filter(|r| r.aggregate_value.is_some_and(|v| v < 0.0))
                .count();
            if negative == 0 {
                report.pass("non_negative_value");
            } else {
                report.fail(format!("footprint_data.value: {negative} negative values"));
            }
        }

        if checks.unique_key {
            // Holds by construction after deduplication.
            report.pass("unique_key");
        }
    }

    fn check_entities(&self, entities: &[ReferenceEntity], report: &mut QualityReport) {
        let checks = &self.entity_checks;

        if let Some(RowCount { min }) = checks.row_count {
            if entities.len() >= min {
                report.pass("countries.row_count");
            } else {
                report.fail(format!(
                    "countries.row_count: expected >= {min}, got {}",
                    entities.len()
                ));
            }
        }

        for field in &checks.required_columns {
            let missing = entities.iter().filter(|e| field.is_missing(e)).count();
            if missing == 0 {
                report.pass(field.name());
            } else {
                report.fail(format!("countries.{}: {missing} missing values", field.name()));
            }
        }

        let mut per_code: BTreeMap<i64, usize> = BTreeMap::new();
        for entity in entities {
            *per_code.entry(entity.entity_code).or_default() += 1;
        }

        if checks.unique_key {
            let duplicates = entities.len() - per_code.len();
            if duplicates == 0 {
                report.pass("countries.entity_code");
            } else {
                report.fail(format!("countries.entity_code: {duplicates} duplicates"));
            }
        }

        if let Some(min) = checks.min_entity_coverage {
            if per_code.len() >= min {
                report.pass("countries.coverage");
            } else {
                report.warn(format!(
                    "countries.coverage: only {} entities (expected >= {min})",
                    per_code.len()
                ));
            }
        }
    }
}

impl QualityGate for StagingChecks {
    fn validate(&self, batch: &DedupedBatch, entities: &[ReferenceEntity]) -> QualityReport {
        let mut report = QualityReport::default();
        self.check_footprints(batch, &mut report);
        self.check_entities(entities, &mut report);

        if self.warn_only && report.checks_failed > 0 {
            for failure in std::mem::take(&mut report.failed_checks) {
                report.warnings.push(failure);
            }
            report.checks_warned += report.checks_failed;
            report.checks_passed += report.checks_failed;
            report.checks_failed = 0;
        }
        report.passed = report.checks_failed == 0;

        for message in &report.warnings {
            warn!(%message, "quality warning");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::BatchDeduplicator;
    use gfn_core::RecordKey;
    use tempfile::tempdir;

    fn rec(period: i32, measure: &str, name: Option<&str>, value: f64) -> FootprintRecord {
        let mut record = FootprintRecord::with_key(RecordKey::new(1, period, measure));
        record.entity_name = name.map(str::to_string);
        record.aggregate_value = Some(value);
        record
    }

    fn entity(code: i64, name: Option<&str>) -> ReferenceEntity {
        ReferenceEntity {
            name: name.map(str::to_string),
            ..ReferenceEntity::new(code)
        }
    }

    fn france() -> Vec<ReferenceEntity> {
        vec![entity(1, Some("France"))]
    }

    fn gate() -> StagingChecks {
        StagingChecks::default().with_vocabulary(&MeasureVocabulary::gfn_default())
    }

    #[test]
    fn clean_batch_passes_with_unknown_measure_warning() {
        let batch = BatchDeduplicator.deduplicate(vec![
            rec(2020, "EFConsTotGHA", Some("France"), 5.0),
            rec(2020, "Population", Some("France"), 67.0),
        ]);
        let report = gate().validate(&batch, &france());
        assert!(report.passed);
        assert_eq!(report.checks_failed, 0);
        assert_eq!(report.checks_warned, 1);
        assert!(report.warnings[0].contains("Population"));
    }

    #[test]
    fn negative_values_missing_names_and_bad_years_fail() {
        let batch = BatchDeduplicator.deduplicate(vec![
            rec(1900, "EFConsTotGHA", Some("France"), 5.0),
            rec(2020, "EFConsTotGHA", None, -1.0),
        ]);
        let report = gate().validate(&batch, &france());
        assert!(!report.passed);
        assert_eq!(report.checks_failed, 3);
    }

    #[test]
    fn empty_batch_fails_row_count() {
        let report = gate().validate(&BatchDeduplicator.deduplicate(Vec::new()), &france());
        assert!(!report.passed);
        assert!(report.failed_checks[0].contains("row_count"));
    }

    #[test]
    fn warn_only_downgrades_failures() {
        let batch = BatchDeduplicator.deduplicate(vec![rec(2020, "EFConsTotGHA", None, -1.0)]);
        let report = gate().warn_only(true).validate(&batch, &france());
        assert!(report.passed);
        assert_eq!(report.checks_warned, 2);
        assert!(report.failed_checks.is_empty());
    }

    #[test]
    fn checks_file_overrides_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("staging_checks.yaml");
        std::fs::write(
            &path,
            "footprint_data:\n  row_count: { min: 3 }\n  required_columns: [entity_iso2]\n  non_negative_value: false\nwarn_only: false\n",
        )
        .expect("write checks file");
        let checks = StagingChecks::from_path(&path).expect("checks file parses");
        let batch = BatchDeduplicator.deduplicate(vec![rec(2020, "EFConsTotGHA", Some("France"), -1.0)]);
        let report = checks.validate(&batch, &france());
        assert_eq!(report.checks_failed, 2);

        let absent = StagingChecks::from_path(&dir.path().join("missing.yaml")).expect("defaults");
        assert_eq!(absent, StagingChecks::default());
    }

    #[test]
    fn duplicate_entity_codes_and_missing_names_fail() {
        let batch = BatchDeduplicator.deduplicate(vec![rec(2020, "EFConsTotGHA", Some("France"), 5.0)]);
        let entities = vec![entity(1, Some("France")), entity(1, Some("France")), entity(2, None)];
        let report = gate().validate(&batch, &entities);
        assert!(!report.passed);
        assert_eq!(report.checks_failed, 2);
        assert!(report
            .failed_checks
            .contains(&"countries.entity_code: 1 duplicates".to_string()));
        assert!(report
            .failed_checks
            .contains(&"countries.name: 1 missing values".to_string()));
    }

    #[test]
    fn missing_entities_fail_row_count_and_low_coverage_only_warns() {
        let batch = BatchDeduplicator.deduplicate(vec![rec(2020, "EFConsTotGHA", Some("France"), 5.0)]);
        let report = gate().validate(&batch, &[]);
        assert!(!report.passed);
        assert!(report.failed_checks[0].starts_with("countries.row_count"));

        let checks = StagingChecks::new(StagingChecksFile {
            countries: EntityChecks {
                min_entity_coverage: Some(150),
                ..EntityChecks::default()
            },
            ..StagingChecksFile::default()
        });
        let report = checks.validate(&batch, &france());
        assert!(report.passed);
        assert_eq!(report.checks_warned, 1);
        assert_eq!(report.warnings[0], "countries.coverage: only 1 entities (expected >= 150)");
    }
}
