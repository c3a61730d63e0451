use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use log::{debug, warn};
use crate::params::TranscodeParams;

/// Configuration for the transcoding engine and its daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Maximum number of transcodes running at the same time
    pub max_concurrent_jobs: usize,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Default destination directory for rendered files
    pub output_dir: PathBuf,
    /// Directory where preview clips are written
    pub preview_dir: PathBuf,
    /// Length in seconds of a preview clip
    pub preview_seconds: f64,
    /// Directory holding the job snapshot and the command inbox
    pub job_state_dir: PathBuf,
    /// Seconds a cancelled process gets to exit before it is killed
    pub cancel_grace_secs: u64,
    /// Daemon tick interval in milliseconds
    pub poll_interval_ms: u64,
    /// Number of trailing diagnostic lines kept for failure messages
    pub diagnostic_tail_lines: usize,
    /// Parameters used when a submission does not carry its own
    pub default_params: TranscodeParams,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl TranscodeConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        let data_dir = PathBuf::from("data");
        Self {
            max_concurrent_jobs: 2,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            output_dir: data_dir.join("output"),
            preview_dir: data_dir.join("previews"),
            preview_seconds: 10.0,
            job_state_dir: PathBuf::from("/tmp/transcoded"),
            cancel_grace_secs: 5,
            poll_interval_ms: 500,
            diagnostic_tail_lines: 20,
            default_params: TranscodeParams::default(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist.
    ///
    /// Environment overrides are applied on top and the result is validated.
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            } else {
                warn!("Config file {} not found, using defaults", config_path.display());
            }
        }

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `MAX_CONCURRENT_JOBS`, `DATA_DIR`, `FFMPEG_BIN` and `FFPROBE_BIN`.
    ///
    /// The lookup is injected so tests don't have to touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("MAX_CONCURRENT_JOBS") {
            match raw.trim().parse::<usize>() {
                Ok(n) => self.max_concurrent_jobs = n,
                Err(e) => warn!("Ignoring MAX_CONCURRENT_JOBS={:?}: {}", raw, e),
            }
        }
        if let Some(dir) = lookup("DATA_DIR") {
            let data_dir = PathBuf::from(dir);
            self.output_dir = data_dir.join("output");
            self.preview_dir = data_dir.join("previews");
        }
        if let Some(bin) = lookup("FFMPEG_BIN") {
            self.ffmpeg_bin = PathBuf::from(bin);
        }
        if let Some(bin) = lookup("FFPROBE_BIN") {
            self.ffprobe_bin = PathBuf::from(bin);
        }
        debug!("Effective config after env overrides: {:?}", self);
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs < 1 {
            bail!("max_concurrent_jobs must be at least 1");
        }
        if !(self.preview_seconds > 0.0) {
            bail!("preview_seconds must be positive (got {})", self.preview_seconds);
        }
        Ok(())
    }

    /// Directory the daemon polls for control command files
    pub fn command_dir(&self) -> PathBuf {
        self.job_state_dir.join("commands")
    }

    /// Location of the job snapshot written by the daemon
    pub fn snapshot_path(&self) -> PathBuf {
        self.job_state_dir.join("jobs.json")
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}
