//! Environment and YAML configuration for pipeline runs.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use gfn_adapters::AliasTable;
use gfn_core::{MeasureTypeInfo, MeasureVocabulary, SummaryColumn};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Memory,
    Sqlite,
}

impl Destination {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" | "duckdb" | "local" => Ok(Self::Sqlite),
            other => bail!("unknown destination `{other}` (expected memory or sqlite)"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub api_username: String,
    pub mock: bool,
    pub fixtures_dir: Option<PathBuf>,
    pub destination: Destination,
    pub sqlite_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub start_year: i32,
    pub end_year: i32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub max_concurrent_requests: usize,
    pub requests_per_second: f64,
    pub workspace_root: PathBuf,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Unset or blank takes `default`; anything else must parse.
fn env_parsed<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    parse_setting(name, std::env::var(name).ok().as_deref(), default)
}

fn parse_setting<T>(name: &str, raw: Option<&str>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|err| anyhow!("invalid {name}={value:?}: {err}")),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let destination = Destination::parse(&env_or("PIPELINE_DESTINATION", "sqlite"))?;
        Ok(Self {
            api_base_url: env_or("GFN_API_BASE_URL", "https://api.footprintnetwork.org/v1"),
            api_key: std::env::var("GFN_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            api_username: env_or("GFN_API_USERNAME", "any-user-name"),
            mock: env_flag("GFN_MOCK"),
            fixtures_dir: std::env::var("GFN_FIXTURES_DIR").ok().map(PathBuf::from),
            destination,
            sqlite_path: PathBuf::from(env_or("SQLITE_PATH", "./gfn.sqlite")),
            artifacts_dir: PathBuf::from(env_or("ARTIFACTS_DIR", "./data")),
            start_year: env_parsed("START_YEAR", 2010)?,
            end_year: env_parsed("END_YEAR", 2024)?,
            http_timeout_secs: env_parsed("GFN_HTTP_TIMEOUT_SECS", 30)?,
            user_agent: env_or("GFN_USER_AGENT", "gfn-pipeline/0.1"),
            max_concurrent_requests: env_parsed("GFN_MAX_CONCURRENT_REQUESTS", 8)?,
            requests_per_second: env_parsed("GFN_REQUESTS_PER_SECOND", 5.0)?,
            workspace_root: PathBuf::from(env_or("GFN_WORKSPACE_ROOT", ".")),
        })
    }

    pub fn staging_checks_path(&self) -> PathBuf {
        self.workspace_root.join("config").join("staging_checks.yaml")
    }

    pub fn vocabulary_path(&self) -> PathBuf {
        self.workspace_root.join("config").join("vocabulary.yaml")
    }
}

/// `config/vocabulary.yaml`; every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VocabularyFile {
    pub measures: Option<Vec<MeasureTypeInfo>>,
    pub summary_columns: Option<BTreeMap<String, SummaryColumn>>,
    pub breakdown_measure: Option<String>,
    pub aliases: AliasTable,
}

impl VocabularyFile {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "vocabulary file absent; using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Measure vocabulary with any file sections replacing the built-in ones.
    pub fn vocabulary(&self) -> MeasureVocabulary {
        let mut vocabulary = MeasureVocabulary::gfn_default();
        if let Some(measures) = &self.measures {
            vocabulary.measures = measures.clone();
        }
        if let Some(columns) = &self.summary_columns {
            vocabulary.summary_columns = columns
                .iter()
                .map(|(measure, column)| (measure.clone(), *column))
                .collect();
        }
        if let Some(breakdown) = &self.breakdown_measure {
            vocabulary.breakdown_measure = breakdown.clone();
        }
        vocabulary
    }

    /// Generic-shape aliases: the built-in table extended with the file's additions.
    pub fn generic_aliases(&self) -> AliasTable {
        AliasTable::generic().extended_with(&self.aliases)
    }
}
