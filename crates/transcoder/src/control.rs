//! Control commands dropped as JSON files into the daemon's inbox.

use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::engine::TranscodeEngine;
use crate::job::JobId;
use crate::params::TranscodeParams;
use crate::snapshot::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    Submit {
        inputs: Vec<PathBuf>,
        #[serde(default)]
        output_dir: Option<PathBuf>,
        #[serde(default)]
        params: Option<TranscodeParams>,
    },
    Cancel {
        job_id: JobId,
    },
    CancelAll,
    RetryAll,
    Retry {
        job_id: JobId,
    },
    SetConcurrency {
        max_concurrent_jobs: usize,
    },
}

impl ControlCommand {
    /// Apply the command to `engine`, returning a one-line summary
    pub async fn apply(self, engine: &TranscodeEngine) -> Result<String> {
        let summary = match self {
            ControlCommand::Submit { inputs, output_dir, params } => {
                let jobs = engine.submit_batch(inputs, params, output_dir).await;
                format!("submitted {} job(s)", jobs.len())
            }
            ControlCommand::Cancel { job_id } => {
                let previous = engine.cancel_job(&job_id)?;
                format!("cancelled job {} (was {})", job_id, previous)
            }
            ControlCommand::CancelAll => format!("cancelled {} job(s)", engine.cancel_all()),
            ControlCommand::RetryAll => format!("retried {} job(s)", engine.retry_all()),
            ControlCommand::Retry { job_id } => {
                engine.retry_job(&job_id)?;
                format!("retried job {}", job_id)
            }
            ControlCommand::SetConcurrency { max_concurrent_jobs } => {
                engine.set_concurrency_cap(max_concurrent_jobs)?;
                format!("concurrency cap set to {}", max_concurrent_jobs)
            }
        };
        Ok(summary)
    }
}

/// Drop `command` into `command_dir`. File names sort in submission order.
pub fn write_command(command_dir: &Path, command: &ControlCommand) -> Result<PathBuf> {
    let name = format!(
        "{}_{}.json",
        Utc::now().format("%Y%m%dT%H%M%S%.9f"),
        Uuid::new_v4().simple()
    );
    let path = command_dir.join(name);
    write_json_atomic(command, &path)?;
    debug!("Wrote command file {}", path.display());
    Ok(path)
}

/// Command files currently waiting in `command_dir`, oldest first
pub fn pending_command_files(command_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(command_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read command directory: {}", command_dir.display()))
        }
    };

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    files.sort();
    Ok(files)
}

/// Apply and delete every command file in `command_dir`.
///
/// Unreadable or invalid files are logged and deleted; a command the engine
/// rejects is logged and does not stop the rest.
pub async fn process_command_files(engine: &TranscodeEngine, command_dir: &Path) -> Result<usize> {
    let mut processed = 0;

    for path in pending_command_files(command_dir)? {
        let parsed = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read command file {}", path.display()))
            .and_then(|content| {
                serde_json::from_str::<ControlCommand>(&content)
                    .with_context(|| format!("Failed to parse command file {}", path.display()))
            });

        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Failed to remove command file {}: {}", path.display(), e);
        }

        let command = match parsed {
            Ok(command) => command,
            Err(e) => {
                warn!("{:#}", e);
                continue;
            }
        };

        match command.apply(engine).await {
            Ok(summary) => info!("Command {}: {}", file_label(&path), summary),
            Err(e) => warn!("Command {} rejected: {}", file_label(&path), e),
        }
        processed += 1;
    }

    Ok(processed)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use crate::config::TranscodeConfig;
    use crate::job::JobStatus;
    use crate::probe::FixedDurationProbe;
    use crate::supervisor::tests::ScriptBuilder;

    #[test]
    fn test_command_wire_format() {
        let json = serde_json::to_value(ControlCommand::SetConcurrency { max_concurrent_jobs: 4 }).unwrap();
        assert_eq!(json, serde_json::json!({"action": "set_concurrency", "max_concurrent_jobs": 4}));

        let parsed: ControlCommand =
            serde_json::from_str(r#"{"action":"submit","inputs":["/media/a.mkv"]}"#).unwrap();
        assert_eq!(
            parsed,
            ControlCommand::Submit {
                inputs: vec![PathBuf::from("/media/a.mkv")],
                output_dir: None,
                params: None,
            }
        );

        let parsed: ControlCommand = serde_json::from_str(r#"{"action":"cancel_all"}"#).unwrap();
        assert_eq!(parsed, ControlCommand::CancelAll);
    }

    #[test]
    fn test_written_commands_list_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_command(dir.path(), &ControlCommand::CancelAll).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second = write_command(dir.path(), &ControlCommand::RetryAll).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        assert_eq!(pending_command_files(dir.path()).unwrap(), vec![first, second]);
        assert!(pending_command_files(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_process_command_files_applies_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let config = TranscodeConfig {
            max_concurrent_jobs: 1,
            output_dir: dir.path().join("out"),
            preview_dir: dir.path().join("previews"),
            job_state_dir: dir.path().join("state"),
            cancel_grace_secs: 0,
            ..TranscodeConfig::default_config()
        };
        let command_dir = config.command_dir();
        let engine = TranscodeEngine::with_collaborators(
            config,
            Arc::new(ScriptBuilder("exec sleep 30".to_string())),
            Arc::new(FixedDurationProbe(1.0)),
        );

        let input = dir.path().join("a.mkv");
        std::fs::write(&input, b"x").unwrap();
        write_command(&command_dir, &ControlCommand::Submit { inputs: vec![input], output_dir: None, params: None }).unwrap();
        write_command(&command_dir, &ControlCommand::SetConcurrency { max_concurrent_jobs: 3 }).unwrap();
        write_command(&command_dir, &ControlCommand::Cancel { job_id: JobId::from("unknown") }).unwrap();
        std::fs::write(command_dir.join("zzz_broken.json"), b"{").unwrap();

        let processed = process_command_files(&engine, &command_dir).await.unwrap();
        assert_eq!(processed, 3);
        assert!(pending_command_files(&command_dir).unwrap().is_empty());
        assert_eq!(engine.concurrency_cap(), 3);
        assert_eq!(engine.running_count(), 1);

        write_command(&command_dir, &ControlCommand::CancelAll).unwrap();
        process_command_files(&engine, &command_dir).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), engine.wait_idle()).await.unwrap();
        assert!(engine.list_jobs().iter().all(|j| j.status == JobStatus::Cancelled));
    }
}
