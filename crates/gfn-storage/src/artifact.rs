//! Hash-addressed staging area for raw and processed extraction output.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingLayer {
    Raw,
    Processed,
}

impl StagingLayer {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Processed => "processed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagedArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    prefix: String,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<layer>/<prefix>/dataset=<dataset>/year=<period>/ingest_dt=<date>/<hash>.<ext>`
    pub fn partition_path(
        &self,
        layer: StagingLayer,
        dataset: &str,
        period: i32,
        ingest_at: DateTime<Utc>,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(layer.as_str())
            .join(&self.prefix)
            .join(format!("dataset={dataset}"))
            .join(format!("year={period}"))
            .join(format!("ingest_dt={}", ingest_at.format("%Y-%m-%d")))
            .join(format!("{content_hash}.{ext}"))
    }

    /// Stage bytes immutably; identical content lands on the same path and is written once.
    pub async fn stage_bytes(
        &self,
        layer: StagingLayer,
        dataset: &str,
        period: i32,
        ingest_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StagedArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.partition_path(layer, dataset, period, ingest_at, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let staged = |deduplicated| StagedArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating staging directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking staged path {}", absolute_path.display()))?
        {
            return Ok(staged(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        write_new_file(&temp_path, bytes).await?;

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(staged(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(staged(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming staged artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening temp staging file {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp staging file {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp staging file {}", path.display()))?;
    Ok(())
}
