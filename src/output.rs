//! Artifact persistence.
//!
//! Every file the pipeline produces goes through [`atomic_write`]: content is
//! written to a temp file in the target directory and renamed into place, so
//! an aborted run never leaves a half-written artifact. Each stage also drops
//! a `manifest.json` enumerating what it produced, which is what the next
//! stage consumes instead of relying on directory-naming conventions.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

/// Writes `bytes` to `path` with a write-to-temp-then-rename discipline.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .context("output path has no parent directory")?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path)
        .with_context(|| format!("persisting {}", path.display()))?;

    debug!(path = %path.display(), bytes = bytes.len(), "artifact written");
    Ok(())
}

/// Serializes rows to CSV (optional header) and writes them atomically.
pub fn write_csv<I, R>(path: &Path, header: Option<&[&str]>, rows: I) -> Result<()>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator<Item = String>,
{
    let mut wtr = csv::Writer::from_writer(Vec::new());
    if let Some(header) = header {
        wtr.write_record(header)?;
    }
    for row in rows {
        wtr.write_record(row)?;
    }
    let bytes = wtr.into_inner()?;
    atomic_write(path, &bytes)
}

/// Record of what one pipeline stage produced, written next to its outputs.
#[derive(Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub stage: String,
    pub generated_at: DateTime<Utc>,
    pub artifacts: Vec<String>,
}

impl Manifest {
    pub fn new(stage: &str) -> Self {
        Manifest {
            stage: stage.to_string(),
            generated_at: Utc::now(),
            artifacts: Vec::new(),
        }
    }

    pub fn push(&mut self, artifact: &Path) {
        self.artifacts.push(artifact.display().to_string());
    }

    /// Writes `manifest.json` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join("manifest.json");
        let body = serde_json::to_vec_pretty(self)?;
        atomic_write(&path, &body)?;
        Ok(path)
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join("manifest.json");
        let body = std::fs::read(&path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        Ok(serde_json::from_slice(&body)?)
    }
}
