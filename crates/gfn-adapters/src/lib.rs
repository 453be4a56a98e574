//! Extraction sources and the record normalizer.

pub mod normalize;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gfn_storage::{FetchError, HttpFetcher};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub use normalize::{
    derived_percentage, AliasTable, NormalizeContext, NormalizeError, PayloadShape,
    RecordNormalizer,
};

pub const CRATE_NAME: &str = "gfn-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid json from {source_file}: {source}")]
    Json {
        source_file: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Raw output of one period's extraction, before normalization.
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    pub period: i32,
    pub source_file: String,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
    pub payloads: Vec<JsonValue>,
}

impl ExtractedPage {
    pub fn from_body(
        period: i32,
        source_file: impl Into<String>,
        fetched_at: DateTime<Utc>,
        body: Vec<u8>,
    ) -> Result<Self, AdapterError> {
        let source_file = source_file.into();
        let document: JsonValue = serde_json::from_slice(&body).map_err(|source| AdapterError::Json {
            source_file: source_file.clone(),
            source,
        })?;
        Ok(Self {
            period,
            source_file,
            fetched_at,
            payloads: payload_units(document),
            body,
        })
    }
}

/// Splits a response document into payload units: a bare array, an envelope
/// holding one under `data`/`results`/`items`, or a single object.
pub fn payload_units(document: JsonValue) -> Vec<JsonValue> {
    match document {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut object) => {
            for envelope in ["data", "results", "items"] {
                if matches!(object.get(envelope), Some(JsonValue::Array(_))) {
                    if let Some(JsonValue::Array(items)) = object.remove(envelope) {
                        return items;
                    }
                }
            }
            vec![JsonValue::Object(object)]
        }
        JsonValue::Null => Vec::new(),
        other => vec![other],
    }
}

#[async_trait]
pub trait FootprintSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn extract_period(&self, run_id: Uuid, period: i32) -> Result<ExtractedPage, AdapterError>;
}

/// Footprint API: `GET {base}/data/all/{period}`.
#[derive(Debug, Clone)]
pub struct GfnApiSource {
    base_url: String,
    fetcher: Arc<HttpFetcher>,
}

impl GfnApiSource {
    pub fn new(base_url: impl Into<String>, fetcher: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fetcher,
        }
    }

    pub fn period_url(&self, period: i32) -> String {
        format!("{}/data/all/{period}", self.base_url)
    }
}

#[async_trait]
impl FootprintSource for GfnApiSource {
    fn source_id(&self) -> &'static str {
        "gfn_api"
    }

    async fn extract_period(&self, run_id: Uuid, period: i32) -> Result<ExtractedPage, AdapterError> {
        let url = self.period_url(period);
        let response = self.fetcher.fetch_bytes(run_id, &url).await?;
        debug!(period, bytes = response.body.len(), "fetched footprint page");
        ExtractedPage::from_body(period, response.final_url, Utc::now(), response.body)
    }
}

/// Reads `<dir>/<period>.json` captured from earlier runs.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    dir: PathBuf,
}

impl FixtureSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl FootprintSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn extract_period(&self, _run_id: Uuid, period: i32) -> Result<ExtractedPage, AdapterError> {
        let path = self.dir.join(format!("{period}.json"));
        let body = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading fixture {}", path.display()))?;
        ExtractedPage::from_body(period, path.display().to_string(), Utc::now(), body)
    }
}

/// Deterministic rows for two entities, for offline runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockSource;

impl MockSource {
    pub fn payloads(period: i32) -> Vec<JsonValue> {
        let drift = f64::from(period - 2000) * 0.01;
        let mut rows = Vec::new();
        for (code, name, iso2, footprint, biocapacity, population) in [
            (1, "France", "FR", 456_000_000.0, 300_000_000.0, 67_000_000.0),
            (2, "Germany", "DE", 567_000_000.0, 200_000_000.0, 83_000_000.0),
        ] {
            let footprint = footprint * (1.0 + drift);
            let carbon = footprint * 0.55;
            for (record, value, carbon) in [
                ("EFConsTotGHA", footprint, Some(carbon)),
                ("BiocapTotGHA", biocapacity, Some(0.0)),
                ("EFConsPerCap", footprint / population, Some(carbon / population)),
                ("BiocapPerCap", biocapacity / population, Some(0.0)),
            ] {
                rows.push(json!({
                    "countryCode": code,
                    "countryName": name,
                    "shortName": name,
                    "isoa2": iso2,
                    "year": period,
                    "record": record,
                    "cropLand": value * 0.2,
                    "grazingLand": value * 0.05,
                    "forestLand": value * 0.1,
                    "fishingGround": value * 0.03,
                    "builtupLand": value * 0.02,
                    "carbon": carbon,
                    "value": value,
                    "score": "3A",
                }));
            }
        }
        rows
    }
}

#[async_trait]
impl FootprintSource for MockSource {
    fn source_id(&self) -> &'static str {
        "mock"
    }

    async fn extract_period(&self, _run_id: Uuid, period: i32) -> Result<ExtractedPage, AdapterError> {
        let body = serde_json::to_vec(&Self::payloads(period)).context("encoding mock rows")?;
        ExtractedPage::from_body(period, format!("mock://gfn/{period}"), Utc::now(), body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn envelopes_and_bare_arrays_yield_payload_units() {
        assert_eq!(payload_units(json!([{"a": 1}, {"a": 2}])).len(), 2);
        assert_eq!(payload_units(json!({"results": [{"a": 1}]})), vec![json!({"a": 1})]);
        assert_eq!(payload_units(json!({"a": 1})), vec![json!({"a": 1})]);
        assert!(payload_units(JsonValue::Null).is_empty());
    }

    #[tokio::test]
    async fn mock_source_is_deterministic_and_normalizable() {
        let run_id = Uuid::new_v4();
        let first = MockSource.extract_period(run_id, 2020).await.expect("extract period");
        let second = MockSource.extract_period(run_id, 2020).await.expect("extract period");
        assert_eq!(first.body, second.body);
        assert_eq!(first.payloads.len(), 8);

        let ctx = NormalizeContext {
            extracted_at: first.fetched_at,
            transformed_at: first.fetched_at,
            source_file: first.source_file.clone(),
        };
        let normalizer = RecordNormalizer::default();
        for payload in &first.payloads {
            let record = normalizer.normalize(payload, &ctx).expect("normalize");
            assert_eq!(record.key.period, 2020);
        }
    }

    #[tokio::test]
    async fn fixture_source_reads_period_files() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("2019.json"),
            r#"{"data": [{"countryCode": 5, "year": 2019, "record": "EFCtot", "value": 1.0}]}"#,
        )
        .expect("write");
        let source = FixtureSource::new(dir.path());
        let page = source.extract_period(Uuid::new_v4(), 2019).await.expect("extract period");
        assert_eq!(page.payloads.len(), 1);
        assert!(page.source_file.ends_with("2019.json"));

        let missing = source.extract_period(Uuid::new_v4(), 2018).await;
        assert!(matches!(missing, Err(AdapterError::Anyhow(_))));
    }

    #[test]
    fn api_url_ignores_trailing_slash() {
        let fetcher = Arc::new(HttpFetcher::new(Default::default()).expect("http client"));
        let source = GfnApiSource::new("https://api.footprintnetwork.org/v1/", fetcher);
        assert_eq!(
            source.period_url(2021),
            "https://api.footprintnetwork.org/v1/data/all/2021"
        );
    }
}
