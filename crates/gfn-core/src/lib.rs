//! Core domain model for the GFN footprint pipeline.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "gfn-core";

/// Composite identity of one footprint measurement.
///
/// Field order matters: the derived `Ord` sorts by `(entity_code, period)`
/// first, so every record of one summary key is a contiguous range.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub entity_code: i64,
    pub period: i32,
    pub measure_type: String,
}

impl RecordKey {
    pub fn new(entity_code: i64, period: i32, measure_type: impl Into<String>) -> Self {
        Self {
            entity_code,
            period,
            measure_type: measure_type.into(),
        }
    }

    pub fn summary_key(&self) -> SummaryKey {
        SummaryKey {
            entity_code: self.entity_code,
            period: self.period,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.entity_code, self.period, self.measure_type)
    }
}

/// Identity of one summary row: every record sharing entity and period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SummaryKey {
    pub entity_code: i64,
    pub period: i32,
}

impl fmt::Display for SummaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_code, self.period)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityScore {
    Low,
    Medium,
    High,
    #[default]
    Unknown,
}

impl QualityScore {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Unknown => "unknown",
        }
    }

    /// Maps GFN data-quality scores (`3A`, `2B`, `1A`, ...) and plain labels.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "high" => return Self::High,
            "medium" => return Self::Medium,
            "low" => return Self::Low,
            _ => {}
        }
        match trimmed.chars().next() {
            Some('3') => Self::High,
            Some('2') => Self::Medium,
            Some('1') => Self::Low,
            _ => Self::Unknown,
        }
    }
}

/// Land-use breakdown of a footprint or biocapacity measurement, in gha.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LandUseBreakdown {
    pub crop_land: Option<f64>,
    pub grazing_land: Option<f64>,
    pub forest_land: Option<f64>,
    pub fishing_ground: Option<f64>,
    pub built_up_land: Option<f64>,
    pub carbon: Option<f64>,
}

/// Canonical footprint measurement, as produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintRecord {
    pub key: RecordKey,
    pub entity_name: Option<String>,
    pub entity_short_name: Option<String>,
    pub entity_iso2: Option<String>,
    pub components: LandUseBreakdown,
    pub aggregate_value: Option<f64>,
    pub quality_score: QualityScore,
    pub derived_percentage: Option<f64>,
    pub extracted_at: Option<DateTime<Utc>>,
    pub transformed_at: Option<DateTime<Utc>>,
    pub source_file: Option<String>,
}

impl FootprintRecord {
    /// Bare record carrying only its identity; every attribute is null.
    pub fn with_key(key: RecordKey) -> Self {
        Self {
            key,
            entity_name: None,
            entity_short_name: None,
            entity_iso2: None,
            components: LandUseBreakdown::default(),
            aggregate_value: None,
            quality_score: QualityScore::Unknown,
            derived_percentage: None,
            extracted_at: None,
            transformed_at: None,
            source_file: None,
        }
    }

    pub fn reference_entity(&self) -> ReferenceEntity {
        ReferenceEntity {
            entity_code: self.key.entity_code,
            name: self.entity_name.clone(),
            short_name: self.entity_short_name.clone(),
            iso2: self.entity_iso2.clone(),
        }
    }
}

/// A reconciled row: the record plus the time the reconciler last wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveRecord {
    pub record: FootprintRecord,
    pub updated_at: DateTime<Utc>,
}

/// Total order over `transformed_at`; null sorts strictly before any timestamp.
pub fn compare_freshness(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    a.cmp(&b)
}

/// Reconciler rule: the candidate overwrites the live row when the live row
/// has no timestamp or the candidate is strictly newer.
pub fn supersedes(candidate: Option<DateTime<Utc>>, existing: Option<DateTime<Utc>>) -> bool {
    existing.is_none() || compare_freshness(candidate, existing) == Ordering::Greater
}

/// Storage keeps microseconds; stamps are truncated up front so a value read
/// back compares equal to the value that was written.
pub fn storage_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Stale,
}

/// Per-key outcome of one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    Inserted,
    Updated,
    Skipped { reason: SkipReason },
}

impl Disposition {
    pub const STALE: Disposition = Disposition::Skipped {
        reason: SkipReason::Stale,
    };

    /// True when the durable row changed.
    pub fn is_change(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntity {
    pub entity_code: i64,
    pub name: Option<String>,
    pub short_name: Option<String>,
    pub iso2: Option<String>,
}

impl ReferenceEntity {
    pub fn new(entity_code: i64) -> Self {
        Self {
            entity_code,
            name: None,
            short_name: None,
            iso2: None,
        }
    }

    /// Take every non-null attribute of `incoming`; a null never erases a known value.
    pub fn absorb(&mut self, incoming: &ReferenceEntity) {
        if incoming.name.is_some() {
            self.name = incoming.name.clone();
        }
        if incoming.short_name.is_some() {
            self.short_name = incoming.short_name.clone();
        }
        if incoming.iso2.is_some() {
            self.iso2 = incoming.iso2.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureCategory {
    Footprint,
    Biocapacity,
    Deficit,
    Other,
}

impl MeasureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Footprint => "footprint",
            Self::Biocapacity => "biocapacity",
            Self::Deficit => "deficit",
            Self::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "footprint" => Some(Self::Footprint),
            "biocapacity" => Some(Self::Biocapacity),
            "deficit" => Some(Self::Deficit),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasureTypeInfo {
    pub measure_type: String,
    pub description: String,
    pub category: MeasureCategory,
    pub is_per_unit: bool,
    pub unit: String,
}

impl MeasureTypeInfo {
    /// Classifies a measure type nobody described, from its GFN naming.
    pub fn inferred(measure_type: &str) -> Self {
        let lower = measure_type.to_ascii_lowercase();
        let category = if lower.contains("def") {
            MeasureCategory::Deficit
        } else if lower.starts_with("ef") {
            MeasureCategory::Footprint
        } else if lower.starts_with("biocap") {
            MeasureCategory::Biocapacity
        } else {
            MeasureCategory::Other
        };
        let is_per_unit = lower.ends_with("percap");
        Self {
            measure_type: measure_type.to_string(),
            description: measure_type.to_string(),
            category,
            is_per_unit,
            unit: if is_per_unit { "gha per person" } else { "gha" }.to_string(),
        }
    }
}

/// Summary columns that measure types can be pivoted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryColumn {
    EfConsumptionTotal,
    EfProductionTotal,
    EfImportsTotal,
    EfExportsTotal,
    BiocapacityTotal,
    EfConsumptionPerCapita,
    BiocapacityPerCapita,
}

/// Fixed measure-type vocabulary plus its pivot mapping into summary columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureVocabulary {
    pub measures: Vec<MeasureTypeInfo>,
    pub summary_columns: Vec<(String, SummaryColumn)>,
    /// Measure whose land-use breakdown feeds the summary's component columns.
    pub breakdown_measure: String,
}

impl MeasureVocabulary {
    pub fn gfn_default() -> Self {
        let entry = |code: &str, description: &str, category, per_unit: bool| MeasureTypeInfo {
            measure_type: code.to_string(),
            description: description.to_string(),
            category,
            is_per_unit: per_unit,
            unit: if per_unit { "gha per person" } else { "gha" }.to_string(),
        };
        use MeasureCategory::*;
        Self {
            measures: vec![
                entry("EFConsTotGHA", "Ecological Footprint of consumption, total", Footprint, false),
                entry("EFConsPerCap", "Ecological Footprint of consumption, per person", Footprint, true),
                entry("EFProdTotGHA", "Ecological Footprint of production, total", Footprint, false),
                entry("EFProdPerCap", "Ecological Footprint of production, per person", Footprint, true),
                entry("EFImportsTotGHA", "Ecological Footprint of imports, total", Footprint, false),
                entry("EFImportsPerCap", "Ecological Footprint of imports, per person", Footprint, true),
                entry("EFExportsTotGHA", "Ecological Footprint of exports, total", Footprint, false),
                entry("EFExportsPerCap", "Ecological Footprint of exports, per person", Footprint, true),
                entry("BiocapTotGHA", "Biocapacity, total", Biocapacity, false),
                entry("BiocapPerCap", "Biocapacity, per person", Biocapacity, true),
                entry("EFCtot", "Ecological Footprint (legacy total code)", Footprint, false),
            ],
            summary_columns: vec![
                ("EFConsTotGHA".to_string(), SummaryColumn::EfConsumptionTotal),
                ("EFProdTotGHA".to_string(), SummaryColumn::EfProductionTotal),
                ("EFImportsTotGHA".to_string(), SummaryColumn::EfImportsTotal),
                ("EFExportsTotGHA".to_string(), SummaryColumn::EfExportsTotal),
                ("BiocapTotGHA".to_string(), SummaryColumn::BiocapacityTotal),
                ("EFConsPerCap".to_string(), SummaryColumn::EfConsumptionPerCapita),
                ("BiocapPerCap".to_string(), SummaryColumn::BiocapacityPerCapita),
            ],
            breakdown_measure: "EFConsTotGHA".to_string(),
        }
    }

    pub fn lookup(&self, measure_type: &str) -> Option<&MeasureTypeInfo> {
        self.measures.iter().find(|m| m.measure_type == measure_type)
    }

    /// Catalog row for a measure type: the described entry, or one inferred from its name.
    pub fn classify(&self, measure_type: &str) -> MeasureTypeInfo {
        self.lookup(measure_type)
            .cloned()
            .unwrap_or_else(|| MeasureTypeInfo::inferred(measure_type))
    }

    pub fn summary_column(&self, measure_type: &str) -> Option<SummaryColumn> {
        self.summary_columns
            .iter()
            .find(|(code, _)| code == measure_type)
            .map(|(_, column)| *column)
    }
}

impl Default for MeasureVocabulary {
    fn default() -> Self {
        Self::gfn_default()
    }
}

/// Denormalized aggregation over every live record of one `(entity_code, period)`.
///
/// Carries no wall-clock fields: recomputing from unchanged records must
/// produce an identical row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub key: SummaryKey,
    pub entity_name: Option<String>,
    pub entity_iso2: Option<String>,
    pub ef_consumption_total: Option<f64>,
    pub ef_production_total: Option<f64>,
    pub ef_imports_total: Option<f64>,
    pub ef_exports_total: Option<f64>,
    pub biocapacity_total: Option<f64>,
    pub ef_consumption_per_capita: Option<f64>,
    pub biocapacity_per_capita: Option<f64>,
    pub ecological_deficit: Option<f64>,
    pub deficit_per_capita: Option<f64>,
    pub footprint_to_biocapacity_pct: Option<f64>,
    pub carbon_share_pct: Option<f64>,
    pub components: LandUseBreakdown,
    pub measure_count: u32,
    pub latest_transformed_at: Option<DateTime<Utc>>,
}

impl SummaryRow {
    pub fn empty(key: SummaryKey) -> Self {
        Self {
            key,
            entity_name: None,
            entity_iso2: None,
            ef_consumption_total: None,
            ef_production_total: None,
            ef_imports_total: None,
            ef_exports_total: None,
            biocapacity_total: None,
            ef_consumption_per_capita: None,
            biocapacity_per_capita: None,
            ecological_deficit: None,
            deficit_per_capita: None,
            footprint_to_biocapacity_pct: None,
            carbon_share_pct: None,
            components: LandUseBreakdown::default(),
            measure_count: 0,
            latest_transformed_at: None,
        }
    }

    pub fn column(&self, column: SummaryColumn) -> Option<f64> {
        match column {
            SummaryColumn::EfConsumptionTotal => self.ef_consumption_total,
            SummaryColumn::EfProductionTotal => self.ef_production_total,
            SummaryColumn::EfImportsTotal => self.ef_imports_total,
            SummaryColumn::EfExportsTotal => self.ef_exports_total,
            SummaryColumn::BiocapacityTotal => self.biocapacity_total,
            SummaryColumn::EfConsumptionPerCapita => self.ef_consumption_per_capita,
            SummaryColumn::BiocapacityPerCapita => self.biocapacity_per_capita,
        }
    }

    pub fn set_column(&mut self, column: SummaryColumn, value: Option<f64>) {
        let slot = match column {
            SummaryColumn::EfConsumptionTotal => &mut self.ef_consumption_total,
            SummaryColumn::EfProductionTotal => &mut self.ef_production_total,
            SummaryColumn::EfImportsTotal => &mut self.ef_imports_total,
            SummaryColumn::EfExportsTotal => &mut self.ef_exports_total,
            SummaryColumn::BiocapacityTotal => &mut self.biocapacity_total,
            SummaryColumn::EfConsumptionPerCapita => &mut self.ef_consumption_per_capita,
            SummaryColumn::BiocapacityPerCapita => &mut self.biocapacity_per_capita,
        };
        *slot = value;
    }
}
