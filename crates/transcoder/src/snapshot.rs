use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::engine::TranscodeEngine;
use crate::job::{Job, JobStatus};

/// Point-in-time view of the engine, published for out-of-process readers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub updated_at: DateTime<Utc>,
    pub max_concurrent_jobs: usize,
    /// Newest first
    pub jobs: Vec<Job>,
}

impl Snapshot {
    pub fn capture(engine: &TranscodeEngine) -> Self {
        Self {
            updated_at: Utc::now(),
            max_concurrent_jobs: engine.concurrency_cap(),
            jobs: engine.list_jobs(),
        }
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }
}

/// Write the snapshot next to its destination, then rename it into place
pub fn save_snapshot(snapshot: &Snapshot, path: &Path) -> Result<()> {
    write_json_atomic(snapshot, path)
}

pub fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse snapshot: {}", path.display()))
}

pub(crate) fn write_json_atomic<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, json)
        .with_context(|| format!("Failed to write {}", Path::new(&tmp).display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move snapshot into place: {}", path.display()))?;
    Ok(())
}
