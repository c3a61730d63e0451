//! Process supervision: one external process per running job.
//!
//! The supervisor owns the process handle table. Nothing else ever touches a
//! live child; other components ask for a cancel through [`ProcessSupervisor::cancel`].

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;
use crate::command::{display_command, CommandBuilder};
use crate::job::{Job, JobId, JobStatus};
use crate::progress::{output_stats, progress_from_line};
use crate::registry::JobRegistry;

/// How long the output reader may linger after the process has been reaped.
///
/// A grandchild that inherited the pipes can keep them open; we stop listening.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest output line kept; ffmpeg status lines are far shorter.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// How a supervised run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    Cancelled,
    /// The job was no longer running this attempt when supervision began
    Skipped,
}

/// Runtime binding between a running job and its live process
#[derive(Debug)]
struct ProcessHandle {
    attempt: u32,
    pid: Option<u32>,
    token: CancellationToken,
}

/// Removes the handle table entry on every exit path, panics included
struct HandleGuard<'a> {
    handles: &'a Mutex<HashMap<JobId, ProcessHandle>>,
    id: JobId,
    attempt: u32,
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        let mut handles = self.handles.lock();
        // A retried job may already have registered a newer run under the same id
        if handles.get(&self.id).map(|h| h.attempt) == Some(self.attempt) {
            handles.remove(&self.id);
        }
    }
}

pub struct ProcessSupervisor {
    registry: Arc<JobRegistry>,
    builder: Arc<dyn CommandBuilder>,
    handles: Mutex<HashMap<JobId, ProcessHandle>>,
    cancel_grace: Duration,
    tail_lines: usize,
}

impl ProcessSupervisor {
    pub fn new(
        registry: Arc<JobRegistry>,
        builder: Arc<dyn CommandBuilder>,
        cancel_grace: Duration,
        tail_lines: usize,
    ) -> Self {
        Self {
            registry,
            builder,
            handles: Mutex::new(HashMap::new()),
            cancel_grace,
            tail_lines: tail_lines.max(1),
        }
    }

    /// Number of live process handles
    pub fn active_handles(&self) -> usize {
        self.handles.lock().len()
    }

    /// Live processes whose job already left the running state, i.e. cancelled
    /// runs that have not exited yet. They still hold a slot.
    pub fn draining_count(&self) -> usize {
        let handles = self.handles.lock();
        handles
            .iter()
            .filter(|(id, handle)| !self.is_current(id, handle.attempt))
            .count()
    }

    pub fn has_handle(&self, id: &JobId) -> bool {
        self.handles.lock().contains_key(id)
    }

    /// Cancel a pending or running job.
    ///
    /// The job is marked cancelled right away; a live process is asked to stop
    /// and its exit is observed asynchronously by the run that owns it.
    /// Returns the state the job was in, `None` if it was not active.
    pub fn cancel(&self, id: &JobId) -> Option<JobStatus> {
        let previous = self.registry.transition(
            id,
            &[JobStatus::Pending, JobStatus::Running],
            JobStatus::Cancelled,
            |job| job.completed_at = Some(Utc::now()),
        )?;

        // State is set before the table is consulted; `run` registers before it
        // re-reads the state. One side always sees the other.
        if let Some(handle) = self.handles.lock().get(id) {
            info!("Job {}: signalling process {:?} to stop", id, handle.pid);
            handle.token.cancel();
        } else {
            debug!("Job {}: cancelled with no live process", id);
        }

        Some(previous)
    }

    /// Supervise one admitted job until its process has been reaped.
    ///
    /// `job` is the snapshot taken when it was promoted to running.
    pub async fn run(&self, job: Job) -> RunOutcome {
        let id = job.id.clone();
        let attempt = job.attempt;

        if !self.is_current(&id, attempt) {
            debug!("Job {}: no longer running attempt {}, not starting", id, attempt);
            return RunOutcome::Skipped;
        }

        if !job.input.exists() {
            let message = format!("Input file does not exist: {}", job.input.display());
            return self.finish_failed(&id, attempt, message);
        }

        if let Some(parent) = job.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                let message = format!("Failed to create output directory {}: {}", parent.display(), e);
                return self.finish_failed(&id, attempt, message);
            }
        }

        let argv = self.builder.build(&job.input, &job.output, &job.params);
        let Some((program, args)) = argv.split_first() else {
            return self.finish_failed(&id, attempt, "Command builder produced an empty command".to_string());
        };

        let command_line = display_command(&argv);
        debug!("Job {}: executing {}", id, command_line);
        self.registry.record_command(&id, attempt, command_line);

        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return self.finish_failed(&id, attempt, format!("Failed to spawn {}: {}", program, e));
            }
        };

        let token = CancellationToken::new();
        let guard = self.register(&id, attempt, child.id(), token.clone());
        info!("Job {}: started {} (pid {:?}, attempt {})", id, job.file_name(), child.id(), attempt);

        // Closes the window between admission and registration
        if !self.is_current(&id, attempt) {
            token.cancel();
        }

        let mut reader = self.spawn_output_reader(&id, attempt, job.duration, &mut child);
        let stdin = child.stdin.take();

        let status = tokio::select! {
            status = child.wait() => status,
            _ = token.cancelled() => self.terminate(&id, &mut child, stdin).await,
        };

        // Handle goes away before the outcome is evaluated
        drop(guard);

        let tail = match timeout(READER_DRAIN_TIMEOUT, &mut reader).await {
            Ok(Ok(tail)) => tail,
            Ok(Err(e)) => {
                warn!("Job {}: output reader failed: {}", id, e);
                VecDeque::new()
            }
            Err(_) => {
                debug!("Job {}: output pipes still open after exit, abandoning reader", id);
                reader.abort();
                VecDeque::new()
            }
        };

        self.finalize(&job, status, tail)
    }

    fn is_current(&self, id: &JobId, attempt: u32) -> bool {
        matches!(self.registry.status_of(id), Some((JobStatus::Running, a)) if a == attempt)
    }

    /// Insert the handle for `attempt`.
    ///
    /// A lower attempt still in the table is cancelled and replaced. If a newer
    /// attempt already holds the entry, the table is left alone and this run's
    /// own token is cancelled instead.
    fn register(&self, id: &JobId, attempt: u32, pid: Option<u32>, token: CancellationToken) -> HandleGuard<'_> {
        let mut handles = self.handles.lock();
        match handles.get(id).map(|h| h.attempt) {
            Some(current) if current > attempt => {
                debug!("Job {}: attempt {} superseded by attempt {}, stopping", id, attempt, current);
                token.cancel();
            }
            _ => {
                if let Some(previous) = handles.insert(id.clone(), ProcessHandle { attempt, pid, token }) {
                    // A cancelled earlier attempt that has not exited yet
                    debug!("Job {}: replacing handle of attempt {}", id, previous.attempt);
                    previous.token.cancel();
                }
            }
        }
        HandleGuard {
            handles: &self.handles,
            id: id.clone(),
            attempt,
        }
    }

    /// Read stdout and stderr line by line, feeding progress and keeping a tail
    fn spawn_output_reader(
        &self,
        id: &JobId,
        attempt: u32,
        duration: f64,
        child: &mut Child,
    ) -> tokio::task::JoinHandle<VecDeque<String>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx);
        }

        let registry = Arc::clone(&self.registry);
        let id = id.clone();
        let tail_lines = self.tail_lines;

        tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(tail_lines);
            while let Some(line) = rx.recv().await {
                if let Some(progress) = progress_from_line(&line, duration) {
                    registry.update_progress(&id, attempt, progress);
                }
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                if tail.len() == tail_lines {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        })
    }

    /// Ask the process to quit, then kill it once the grace period runs out
    async fn terminate(
        &self,
        id: &JobId,
        child: &mut Child,
        stdin: Option<ChildStdin>,
    ) -> std::io::Result<ExitStatus> {
        // ffmpeg finishes the container and exits on 'q'
        if let Some(mut stdin) = stdin {
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.flush().await;
        }

        match timeout(self.cancel_grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!("Job {}: process ignored stop request for {:?}, killing", id, self.cancel_grace);
                child.kill().await?;
                child.wait().await
            }
        }
    }

    fn finalize(&self, job: &Job, status: std::io::Result<ExitStatus>, tail: VecDeque<String>) -> RunOutcome {
        let id = &job.id;
        let attempt = job.attempt;

        if !self.is_current(id, attempt) {
            info!("Job {}: process exited after cancellation ({})", id, describe_status(&status));
            return RunOutcome::Cancelled;
        }

        let status = match status {
            Ok(status) => status,
            Err(e) => return self.finish_failed(id, attempt, format!("Failed to wait for process: {}", e)),
        };

        if status.success() {
            let stats = output_stats(&job.output, job.input_size);
            let completed = self.registry.transition_if(
                id,
                JobStatus::Completed,
                |j| j.status == JobStatus::Running && j.attempt == attempt,
                |j| {
                    j.progress = 100.0;
                    j.completed_at = Some(Utc::now());
                    j.output_size = stats.output_size;
                    j.compression_ratio = stats.compression_ratio;
                },
            );
            if !completed {
                return RunOutcome::Cancelled;
            }
            info!(
                "✅ Job {} completed: {} -> {} ({:?} bytes, ratio {:?})",
                id,
                job.input.display(),
                job.output.display(),
                stats.output_size,
                stats.compression_ratio
            );
            return RunOutcome::Completed;
        }

        let mut message = format!("Process {}", describe_status(&Ok(status)));
        if let Some(last) = tail.back() {
            message.push_str(": ");
            message.push_str(last);
        }
        debug!("Job {}: diagnostic tail:\n{}", id, tail.iter().cloned().collect::<Vec<_>>().join("\n"));
        self.finish_failed(id, attempt, message)
    }

    fn finish_failed(&self, id: &JobId, attempt: u32, message: String) -> RunOutcome {
        let failed = self.registry.transition_if(
            id,
            JobStatus::Failed,
            |j| j.status == JobStatus::Running && j.attempt == attempt,
            |j| {
                j.error = Some(message.clone());
                j.completed_at = Some(Utc::now());
            },
        );
        if failed {
            error!("❌ Job {} failed: {}", id, message);
            RunOutcome::Failed(message)
        } else {
            RunOutcome::Cancelled
        }
    }
}

/// Forward output lines to `tx`.
///
/// ffmpeg ends its periodic status lines with `\r`, so both `\r` and `\n` end a line.
fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let codec = AnyDelimiterCodec::new_with_max_length(b"\r\n".to_vec(), Vec::new(), MAX_LINE_LENGTH);
        let mut frames = FramedRead::new(stream, codec);
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(chunk) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    if tx.send(String::from_utf8_lossy(&chunk).into_owned()).is_err() {
                        break;
                    }
                }
                Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                    // The framed stream ends after an error; keep the pipe drained
                    debug!("Process output line exceeded {} bytes, discarding the rest", MAX_LINE_LENGTH);
                    let mut inner = frames.into_inner();
                    let _ = tokio::io::copy(&mut inner, &mut tokio::io::sink()).await;
                    break;
                }
                // A broken pipe ends the stream, not the job
                Err(e) => {
                    debug!("Stopped reading process output: {}", e);
                    break;
                }
            }
        }
    });
}

fn describe_status(status: &std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => match status.code() {
            Some(code) => format!("exited with code {}", code),
            None => "was terminated by a signal".to_string(),
        },
        Err(e) => format!("could not be waited on: {}", e),
    }
}

/// Output of a process run to completion
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run a command to completion, capturing its output.
///
/// Used for short synchronous renders that need no progress or cancellation.
/// The process is killed if `timeout_secs` elapses.
pub async fn run_command(argv: &[String], timeout_secs: Option<u64>) -> Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("Cannot run an empty command"))?;

    debug!("Executing: {}", display_command(argv));

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", Path::new(program).display()))?;

    let output = match timeout_secs {
        Some(secs) => timeout(Duration::from_secs(secs), child.wait_with_output())
            .await
            .map_err(|_| anyhow!("{} timed out after {} seconds and was killed", program, secs))?,
        None => child.wait_with_output().await,
    }
    .with_context(|| format!("Failed to wait for {}", program))?;

    Ok(CommandOutput {
        success: output.status.success(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}
