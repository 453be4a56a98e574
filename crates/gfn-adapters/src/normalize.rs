//! Record normalizer: raw payload units in, canonical footprint records out.
//!
//! Payloads arrive in a handful of known shapes. Each shape resolves fields
//! through its own fixed alias table (first alias present wins); anything
//! unrecognised goes through the configurable generic table.

use chrono::{DateTime, NaiveDateTime, Utc};
use gfn_core::{
    storage_precision, FootprintRecord, LandUseBreakdown, QualityScore, RecordKey,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("missing identity field `{field}`")]
    MissingIdentityField { field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadShape {
    /// Rows as served by the footprint API (`countryCode`, `record`, `value`, ...).
    ApiV1,
    /// Rows flattened by an earlier pipeline stage (`country_code`, `record_type`, ...).
    Staged,
    Generic,
}

impl PayloadShape {
    pub fn detect(payload: &Map<String, JsonValue>) -> Self {
        if payload.contains_key("countryCode") {
            Self::ApiV1
        } else if payload.contains_key("country_code") {
            Self::Staged
        } else {
            Self::Generic
        }
    }
}

/// Ordered aliases per canonical field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AliasTable {
    pub entity_code: Vec<String>,
    pub period: Vec<String>,
    pub measure_type: Vec<String>,
    pub entity_name: Vec<String>,
    pub entity_short_name: Vec<String>,
    pub entity_iso2: Vec<String>,
    pub crop_land: Vec<String>,
    pub grazing_land: Vec<String>,
    pub forest_land: Vec<String>,
    pub fishing_ground: Vec<String>,
    pub built_up_land: Vec<String>,
    pub carbon: Vec<String>,
    pub aggregate_value: Vec<String>,
    pub quality_score: Vec<String>,
    pub extracted_at: Vec<String>,
    pub transformed_at: Vec<String>,
    pub source_file: Vec<String>,
}

fn names(aliases: &[&str]) -> Vec<String> {
    aliases.iter().map(|a| a.to_string()).collect()
}

impl AliasTable {
    pub fn api_v1() -> Self {
        Self {
            entity_code: names(&["countryCode"]),
            period: names(&["year"]),
            measure_type: names(&["record"]),
            entity_name: names(&["countryName"]),
            entity_short_name: names(&["shortName"]),
            entity_iso2: names(&["isoa2"]),
            crop_land: names(&["cropLand"]),
            grazing_land: names(&["grazingLand"]),
            forest_land: names(&["forestLand"]),
            fishing_ground: names(&["fishingGround"]),
            built_up_land: names(&["builtupLand"]),
            carbon: names(&["carbon"]),
            aggregate_value: names(&["value"]),
            quality_score: names(&["score"]),
            extracted_at: Vec::new(),
            transformed_at: Vec::new(),
            source_file: Vec::new(),
        }
    }

    pub fn staged() -> Self {
        Self {
            entity_code: names(&["country_code"]),
            period: names(&["year"]),
            measure_type: names(&["record_type", "record"]),
            entity_name: names(&["country_name"]),
            entity_short_name: names(&["short_name"]),
            entity_iso2: names(&["iso_alpha2", "iso2"]),
            crop_land: names(&["crop_land"]),
            grazing_land: names(&["grazing_land"]),
            forest_land: names(&["forest_land"]),
            fishing_ground: names(&["fishing_ground"]),
            built_up_land: names(&["built_up_land", "builtup_land"]),
            carbon: names(&["carbon", "carbon_footprint_gha"]),
            aggregate_value: names(&["value", "total_footprint_gha"]),
            quality_score: names(&["score", "quality_score"]),
            extracted_at: names(&["extracted_at"]),
            transformed_at: names(&["transformed_at"]),
            source_file: names(&["source_file"]),
        }
    }

    /// Union of the known spellings, used when a payload matches no known shape.
    pub fn generic() -> Self {
        Self {
            entity_code: names(&["entity_code", "countryCode", "country_code", "code"]),
            period: names(&["period", "year", "Year"]),
            measure_type: names(&["measure_type", "record", "record_type", "recordType", "metric"]),
            entity_name: names(&["entity_name", "countryName", "country_name", "country", "name"]),
            entity_short_name: names(&["entity_short_name", "shortName", "short_name"]),
            entity_iso2: names(&["entity_iso2", "isoa2", "iso_alpha2", "iso2"]),
            crop_land: names(&["crop_land", "cropLand"]),
            grazing_land: names(&["grazing_land", "grazingLand"]),
            forest_land: names(&["forest_land", "forestLand"]),
            fishing_ground: names(&["fishing_ground", "fishingGround"]),
            built_up_land: names(&["built_up_land", "builtupLand"]),
            carbon: names(&["carbon", "carbon_footprint_gha"]),
            aggregate_value: names(&["aggregate_value", "value", "Value", "total_footprint_gha"]),
            quality_score: names(&["quality_score", "score"]),
            extracted_at: names(&["extracted_at"]),
            transformed_at: names(&["transformed_at"]),
            source_file: names(&["source_file"]),
        }
    }

    /// Appends `extra` aliases after the existing ones, skipping duplicates.
    pub fn extended_with(mut self, extra: &AliasTable) -> Self {
        let pairs: [(&mut Vec<String>, &Vec<String>); 17] = [
            (&mut self.entity_code, &extra.entity_code),
            (&mut self.period, &extra.period),
            (&mut self.measure_type, &extra.measure_type),
            (&mut self.entity_name, &extra.entity_name),
            (&mut self.entity_short_name, &extra.entity_short_name),
            (&mut self.entity_iso2, &extra.entity_iso2),
            (&mut self.crop_land, &extra.crop_land),
            (&mut self.grazing_land, &extra.grazing_land),
            (&mut self.forest_land, &extra.forest_land),
            (&mut self.fishing_ground, &extra.fishing_ground),
            (&mut self.built_up_land, &extra.built_up_land),
            (&mut self.carbon, &extra.carbon),
            (&mut self.aggregate_value, &extra.aggregate_value),
            (&mut self.quality_score, &extra.quality_score),
            (&mut self.extracted_at, &extra.extracted_at),
            (&mut self.transformed_at, &extra.transformed_at),
            (&mut self.source_file, &extra.source_file),
        ];
        for (target, additions) in pairs {
            for alias in additions {
                if !target.contains(alias) {
                    target.push(alias.clone());
                }
            }
        }
        self
    }
}

/// Provenance stamped onto every record of one extraction cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeContext {
    pub extracted_at: DateTime<Utc>,
    pub transformed_at: DateTime<Utc>,
    pub source_file: String,
}

#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    api_v1: AliasTable,
    staged: AliasTable,
    generic: AliasTable,
}

impl Default for RecordNormalizer {
    fn default() -> Self {
        Self::new(AliasTable::generic())
    }
}

impl RecordNormalizer {
    pub fn new(generic: AliasTable) -> Self {
        Self {
            api_v1: AliasTable::api_v1(),
            staged: AliasTable::staged(),
            generic,
        }
    }

    pub fn aliases(&self, shape: PayloadShape) -> &AliasTable {
        match shape {
            PayloadShape::ApiV1 => &self.api_v1,
            PayloadShape::Staged => &self.staged,
            PayloadShape::Generic => &self.generic,
        }
    }

    pub fn normalize(
        &self,
        payload: &JsonValue,
        ctx: &NormalizeContext,
    ) -> Result<FootprintRecord, NormalizeError> {
        let empty = Map::new();
        let object = payload.as_object().unwrap_or(&empty);
        let aliases = self.aliases(PayloadShape::detect(object));
        let field = |names: &[String]| first_present(object, names);

        let entity_code = field(&aliases.entity_code)
            .and_then(as_i64)
            .ok_or(NormalizeError::MissingIdentityField { field: "entity_code" })?;
        let period = field(&aliases.period)
            .and_then(as_i64)
            .and_then(|p| i32::try_from(p).ok())
            .ok_or(NormalizeError::MissingIdentityField { field: "period" })?;
        let measure_type = field(&aliases.measure_type)
            .and_then(as_text)
            .ok_or(NormalizeError::MissingIdentityField { field: "measure_type" })?;

        let components = LandUseBreakdown {
            crop_land: field(&aliases.crop_land).and_then(as_f64),
            grazing_land: field(&aliases.grazing_land).and_then(as_f64),
            forest_land: field(&aliases.forest_land).and_then(as_f64),
            fishing_ground: field(&aliases.fishing_ground).and_then(as_f64),
            built_up_land: field(&aliases.built_up_land).and_then(as_f64),
            carbon: field(&aliases.carbon).and_then(as_f64),
        };
        let aggregate_value = field(&aliases.aggregate_value).and_then(as_f64);

        Ok(FootprintRecord {
            key: RecordKey::new(entity_code, period, measure_type),
            entity_name: field(&aliases.entity_name).and_then(as_text),
            entity_short_name: field(&aliases.entity_short_name).and_then(as_text),
            entity_iso2: field(&aliases.entity_iso2).and_then(as_text),
            derived_percentage: derived_percentage(components.carbon, aggregate_value),
            components,
            aggregate_value,
            quality_score: field(&aliases.quality_score)
                .and_then(as_text)
                .map(|s| QualityScore::parse(&s))
                .unwrap_or_default(),
            extracted_at: Some(storage_precision(
                field(&aliases.extracted_at)
                    .and_then(as_timestamp)
                    .unwrap_or(ctx.extracted_at),
            )),
            transformed_at: Some(storage_precision(
                field(&aliases.transformed_at)
                    .and_then(as_timestamp)
                    .unwrap_or(ctx.transformed_at),
            )),
            source_file: Some(
                field(&aliases.source_file)
                    .and_then(as_text)
                    .unwrap_or_else(|| ctx.source_file.clone()),
            ),
        })
    }
}

/// Share of `aggregate` contributed by `part`, in percent rounded to two decimals.
pub fn derived_percentage(part: Option<f64>, aggregate: Option<f64>) -> Option<f64> {
    match (part, aggregate) {
        (Some(part), Some(aggregate)) if aggregate != 0.0 => {
            Some((part / aggregate * 100.0 * 100.0).round() / 100.0)
        }
        _ => None,
    }
}

fn first_present<'a>(object: &'a Map<String, JsonValue>, names: &[String]) -> Option<&'a JsonValue> {
    names
        .iter()
        .filter_map(|name| object.get(name))
        .find(|value| !value.is_null())
}

fn as_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(whole_i64)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse().ok().or_else(|| s.parse::<f64>().ok().and_then(whole_i64))
        }
        _ => None,
    }
}

/// Exact integer value of `f`; fractional, non-finite and out-of-range floats have none.
fn whole_i64(f: f64) -> Option<i64> {
    // 2^63 is the first float past i64::MAX; -2^63 is exactly i64::MIN.
    const BOUND: f64 = 9_223_372_036_854_775_808.0;
    (f.is_finite() && f.fract() == 0.0 && (-BOUND..BOUND).contains(&f)).then(|| f as i64)
}

fn as_f64(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

fn as_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn as_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> NormalizeContext {
        let at = DateTime::parse_from_rfc3339("2026-03-01T10:00:00.123456789Z")
            .expect("valid rfc3339")
            .with_timezone(&Utc);
        NormalizeContext {
            extracted_at: at,
            transformed_at: at,
            source_file: "raw/gfn/2020.json".to_string(),
        }
    }

    #[test]
    fn api_rows_resolve_through_camel_case_aliases() {
        let payload = json!({
            "countryCode": 1, "countryName": "France", "shortName": "France", "isoa2": "FR",
            "year": 2020, "record": "EFConsTotGHA",
            "cropLand": 1.5, "carbon": 123.0, "value": 456.0, "score": "3A"
        });
        let record = RecordNormalizer::default().normalize(&payload, &ctx()).expect("normalizes");
        assert_eq!(record.key, RecordKey::new(1, 2020, "EFConsTotGHA"));
        assert_eq!(record.entity_iso2.as_deref(), Some("FR"));
        assert_eq!(record.components.crop_land, Some(1.5));
        assert_eq!(record.quality_score, QualityScore::High);
        assert_eq!(record.derived_percentage, Some(26.97));
        assert_eq!(record.source_file.as_deref(), Some("raw/gfn/2020.json"));
    }

    #[test]
    fn staged_rows_keep_their_own_provenance() {
        let payload = json!({
            "country_code": "2", "country_name": "Germany", "iso_alpha2": "DE",
            "year": "2021", "record_type": "BiocapTotGHA",
            "total_footprint_gha": 10.0, "carbon_footprint_gha": 0.0,
            "transformed_at": "2026-01-01T00:00:00Z", "source_file": "staged/de.parquet"
        });
        let record = RecordNormalizer::default().normalize(&payload, &ctx()).expect("normalizes");
        assert_eq!(record.key, RecordKey::new(2, 2021, "BiocapTotGHA"));
        assert_eq!(record.derived_percentage, Some(0.0));
        assert_eq!(
            record.transformed_at.expect("stamped").to_rfc3339(),
            "2026-01-01T00:00:00+00:00"
        );
        assert_eq!(record.source_file.as_deref(), Some("staged/de.parquet"));
    }

    #[test]
    fn cycle_stamp_is_truncated_to_microseconds() {
        let payload = json!({"countryCode": 1, "year": 2020, "record": "EFCtot"});
        let record = RecordNormalizer::default().normalize(&payload, &ctx()).expect("normalizes");
        let stamp = record.transformed_at.expect("stamped");
        assert_eq!(stamp.timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(record.quality_score, QualityScore::Unknown);
        assert_eq!(record.derived_percentage, None);
    }

    #[test]
    fn missing_identity_is_rejected_with_the_field_name() {
        let normalizer = RecordNormalizer::default();
        let no_measure = json!({"countryCode": 1, "year": 2020, "value": 3.0});
        assert_eq!(
            normalizer.normalize(&no_measure, &ctx()),
            Err(NormalizeError::MissingIdentityField { field: "measure_type" })
        );
        let bad_code = json!({"countryCode": "abc", "year": 2020, "record": "EFCtot"});
        assert_eq!(
            normalizer.normalize(&bad_code, &ctx()),
            Err(NormalizeError::MissingIdentityField { field: "entity_code" })
        );
        assert_eq!(
            normalizer.normalize(&json!([1, 2]), &ctx()),
            Err(NormalizeError::MissingIdentityField { field: "entity_code" })
        );
    }

    #[test]
    fn generic_shape_uses_first_alias_present() {
        let extra = AliasTable {
            measure_type: names(&["kind"]),
            ..AliasTable::default()
        };
        let normalizer = RecordNormalizer::new(AliasTable::generic().extended_with(&extra));
        let payload = json!({"entity_code": 9, "period": 1999, "kind": "EFProdTotGHA", "Value": "7.5", "value": null});
        let record = normalizer.normalize(&payload, &ctx()).expect("normalizes");
        assert_eq!(record.key.measure_type, "EFProdTotGHA");
        assert_eq!(record.aggregate_value, Some(7.5));
    }

    #[test]
    fn integer_fields_reject_lossy_floats() {
        assert_eq!(as_i64(&json!(2020.0)), Some(2020));
        assert_eq!(as_i64(&json!("2021.0")), Some(2021));
        assert_eq!(as_i64(&json!(-5)), Some(-5));
        assert_eq!(as_i64(&json!(2020.5)), None);
        assert_eq!(as_i64(&json!(1e19)), None);
        assert_eq!(as_i64(&json!(-1e19)), None);
        assert_eq!(as_i64(&json!("NaN")), None);
        assert_eq!(as_i64(&json!("inf")), None);
        assert_eq!(as_i64(&json!(-9_223_372_036_854_775_808.0)), Some(i64::MIN));
    }

    #[test]
    fn out_of_range_entity_code_is_dropped_not_saturated() {
        let payload = json!({
            "countryCode": 1e300, "countryName": "Nowhere",
            "year": 2020, "record": "EFConsTotGHA", "value": 1.0
        });
        assert!(RecordNormalizer::default().normalize(&payload, &ctx()).is_err());
    }

    #[test]
    fn zero_denominator_yields_null_percentage() {
        assert_eq!(derived_percentage(Some(1.0), Some(0.0)), None);
        assert_eq!(derived_percentage(None, Some(2.0)), None);
        assert_eq!(derived_percentage(Some(1.0), Some(3.0)), Some(33.33));
    }
}
