use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use anyhow::{anyhow, Context, Result};
use log::debug;
use tokio::process::Command;

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = f64> + Send + 'a>>;

/// Reports the media duration of a file in seconds, 0 when unknown.
///
/// Never fails the caller.
pub trait DurationProbe: Send + Sync {
    fn probe<'a>(&'a self, path: &'a Path) -> ProbeFuture<'a>;
}

/// Duration probe backed by ffprobe
#[derive(Debug, Clone)]
pub struct FfprobeDurationProbe {
    ffprobe_bin: PathBuf,
}

impl FfprobeDurationProbe {
    pub fn new(ffprobe_bin: impl Into<PathBuf>) -> Self {
        Self { ffprobe_bin: ffprobe_bin.into() }
    }

    async fn probe_duration(&self, path: &Path) -> Result<f64> {
        if !path.exists() {
            return Err(anyhow!("File does not exist: {}", path.display()));
        }

        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!(
                "Failed to execute ffprobe at {} for {}",
                self.ffprobe_bin.display(),
                path.display()
            ))?;

        if !output.status.success() {
            return Err(anyhow!(
                "ffprobe failed (exit code {}) for {}: {}",
                output.status.code().unwrap_or(-1),
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        parse_duration_output(&String::from_utf8_lossy(&output.stdout))
    }
}

impl DurationProbe for FfprobeDurationProbe {
    fn probe<'a>(&'a self, path: &'a Path) -> ProbeFuture<'a> {
        Box::pin(async move {
            match self.probe_duration(path).await {
                Ok(duration) => duration,
                Err(e) => {
                    debug!("Duration probe failed for {}: {:#}", path.display(), e);
                    0.0
                }
            }
        })
    }
}

/// Parse the single value printed by `-show_entries format=duration`
pub fn parse_duration_output(stdout: &str) -> Result<f64> {
    let value = stdout.trim();
    let duration: f64 = value
        .parse()
        .with_context(|| format!("Unparsable duration: {:?}", value))?;
    if !duration.is_finite() || duration < 0.0 {
        return Err(anyhow!("Invalid duration: {}", duration));
    }
    Ok(duration)
}

/// Probe that always reports the same duration
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedDurationProbe(pub f64);

impl DurationProbe for FixedDurationProbe {
    fn probe<'a>(&'a self, _path: &'a Path) -> ProbeFuture<'a> {
        let duration = self.0;
        Box::pin(async move { duration })
    }
}
