//! Admission control and the engine's control surface.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;
use crate::command::{CommandBuilder, FfmpegCommandBuilder};
use crate::config::TranscodeConfig;
use crate::error::{EngineError, EngineResult};
use crate::job::{Job, JobId, JobStatus};
use crate::params::{output_path_for, TranscodeParams};
use crate::preview::{clear_previews, render_preview, PreviewEstimate};
use crate::probe::{DurationProbe, FfprobeDurationProbe};
use crate::registry::{JobRegistry, SourceInfo};
use crate::supervisor::ProcessSupervisor;

struct EngineInner {
    config: TranscodeConfig,
    registry: Arc<JobRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    builder: Arc<dyn CommandBuilder>,
    probe: Arc<dyn DurationProbe>,
    cap: AtomicUsize,
    /// Serializes admission passes
    admission: Mutex<()>,
    /// Woken whenever a job leaves the active set
    idle: Notify,
    shutting_down: AtomicBool,
}

/// Job scheduler: FIFO admission under a concurrency cap, one supervised
/// process per running job.
///
/// Cheap to clone. Methods that may start jobs must be called from within a
/// Tokio runtime.
#[derive(Clone)]
pub struct TranscodeEngine {
    inner: Arc<EngineInner>,
}

impl TranscodeEngine {
    /// Engine backed by ffmpeg and ffprobe as configured
    pub fn new(config: TranscodeConfig) -> Self {
        let builder = Arc::new(FfmpegCommandBuilder::new(config.ffmpeg_bin.clone()));
        let probe = Arc::new(FfprobeDurationProbe::new(config.ffprobe_bin.clone()));
        Self::with_collaborators(config, builder, probe)
    }

    pub fn with_collaborators(
        config: TranscodeConfig,
        builder: Arc<dyn CommandBuilder>,
        probe: Arc<dyn DurationProbe>,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::clone(&registry),
            Arc::clone(&builder),
            config.cancel_grace(),
            config.diagnostic_tail_lines,
        ));
        let cap = config.max_concurrent_jobs.max(1);

        Self {
            inner: Arc::new(EngineInner {
                config,
                registry,
                supervisor,
                builder,
                probe,
                cap: AtomicUsize::new(cap),
                admission: Mutex::new(()),
                idle: Notify::new(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.inner.config
    }

    /// Queue one input. The output defaults to `output_dir/<stem>.<format>`.
    ///
    /// A missing or unreadable input yields a failed job, never an error.
    pub async fn submit_job(
        &self,
        input: PathBuf,
        params: Option<TranscodeParams>,
        output: Option<PathBuf>,
    ) -> Job {
        let job = self.inner.create_job(input, params, output).await;
        self.inner.admit();
        self.get_job(&job.id).unwrap_or(job)
    }

    /// Queue one job per input, all rendered into `output_dir`.
    ///
    /// Stale previews of each input are removed first.
    pub async fn submit_batch(
        &self,
        inputs: Vec<PathBuf>,
        params: Option<TranscodeParams>,
        output_dir: Option<PathBuf>,
    ) -> Vec<Job> {
        let params = params.unwrap_or_else(|| self.inner.config.default_params.clone());
        let output_dir = output_dir.unwrap_or_else(|| self.inner.config.output_dir.clone());

        let mut created = Vec::with_capacity(inputs.len());
        for input in inputs {
            let removed = clear_previews(&self.inner.config.preview_dir, &input);
            if removed > 0 {
                debug!("Removed {} stale preview(s) of {}", removed, input.display());
            }
            let output = output_path_for(&input, &output_dir, &params);
            created.push(self.inner.create_job(input, Some(params.clone()), Some(output)).await);
        }
        info!("📥 Queued batch of {} job(s)", created.len());

        self.inner.admit();
        created
            .into_iter()
            .map(|job| self.get_job(&job.id).unwrap_or(job))
            .collect()
    }

    pub fn get_job(&self, id: &JobId) -> Option<Job> {
        self.inner.registry.get(id)
    }

    /// All jobs, newest first
    pub fn list_jobs(&self) -> Vec<Job> {
        self.inner.registry.list()
    }

    /// Cancel a pending or running job, returning the state it was in
    pub fn cancel_job(&self, id: &JobId) -> EngineResult<JobStatus> {
        let Some((status, _)) = self.inner.registry.status_of(id) else {
            return Err(EngineError::JobNotFound(id.clone()));
        };
        match self.inner.supervisor.cancel(id) {
            Some(previous) => {
                info!("🛑 Cancelled job {} (was {})", id, previous);
                self.inner.idle.notify_waiters();
                Ok(previous)
            }
            None => Err(EngineError::InvalidState {
                id: id.clone(),
                status: self.inner.registry.status_of(id).map(|(s, _)| s).unwrap_or(status),
                action: "cancelled",
            }),
        }
    }

    /// Cancel every pending and running job; returns how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let mut ids = self.inner.registry.ids_with_status(&[JobStatus::Pending]);
        ids.extend(self.inner.registry.ids_with_status(&[JobStatus::Running]));

        let cancelled = ids
            .iter()
            .filter(|id| self.inner.supervisor.cancel(id).is_some())
            .count();
        if cancelled > 0 {
            info!("🛑 Cancelled {} job(s)", cancelled);
            self.inner.idle.notify_waiters();
        }
        cancelled
    }

    /// Reset every failed or cancelled job to pending and run admission
    pub fn retry_all(&self) -> usize {
        let ids = self
            .inner
            .registry
            .ids_with_status(&[JobStatus::Failed, JobStatus::Cancelled]);
        let retried = ids.iter().filter(|id| self.inner.reset_for_retry(id)).count();
        if retried > 0 {
            info!("🔄 Retrying {} job(s)", retried);
            self.inner.admit();
        }
        retried
    }

    pub fn retry_job(&self, id: &JobId) -> EngineResult<()> {
        let Some((status, _)) = self.inner.registry.status_of(id) else {
            return Err(EngineError::JobNotFound(id.clone()));
        };
        if !self.inner.reset_for_retry(id) {
            return Err(EngineError::InvalidState {
                id: id.clone(),
                status,
                action: "retried",
            });
        }
        info!("🔄 Retrying job {}", id);
        self.inner.admit();
        Ok(())
    }

    /// Change the cap. Raising it admits more jobs right away; lowering it
    /// never preempts running ones.
    pub fn set_concurrency_cap(&self, cap: usize) -> EngineResult<()> {
        if cap < 1 {
            return Err(EngineError::InvalidConcurrency(cap));
        }
        let previous = self.inner.cap.swap(cap, Ordering::SeqCst);
        if previous != cap {
            info!("Concurrency cap changed from {} to {}", previous, cap);
        }
        self.inner.admit();
        Ok(())
    }

    pub fn concurrency_cap(&self) -> usize {
        self.inner.cap.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        self.inner.registry.count(JobStatus::Running)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.registry.count(JobStatus::Pending)
    }

    /// Resolves once nothing is pending or running and every process is reaped
    pub async fn wait_idle(&self) {
        self.inner
            .wait_until(|inner| inner.registry.is_idle() && inner.supervisor.active_handles() == 0)
            .await;
    }

    /// Stop admitting, cancel everything, and wait until every process is reaped
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let cancelled = self.cancel_all();
        info!("Shutting down, cancelled {} job(s)", cancelled);
        self.inner
            .wait_until(|inner| inner.supervisor.active_handles() == 0)
            .await;
    }

    /// Render a short sample of `input` and extrapolate the full output size
    pub async fn preview(&self, input: &Path, params: Option<TranscodeParams>) -> Result<PreviewEstimate> {
        let params = params.unwrap_or_else(|| self.inner.config.default_params.clone());
        render_preview(
            &self.inner.config,
            self.inner.builder.as_ref(),
            self.inner.probe.as_ref(),
            input,
            &params,
        )
        .await
    }
}

impl EngineInner {
    async fn create_job(
        &self,
        input: PathBuf,
        params: Option<TranscodeParams>,
        output: Option<PathBuf>,
    ) -> Job {
        let params = params.unwrap_or_else(|| self.config.default_params.clone());
        let output = output.unwrap_or_else(|| output_path_for(&input, &self.config.output_dir, &params));

        let input_problem = match std::fs::metadata(&input) {
            Ok(meta) if meta.is_file() => None,
            Ok(_) => Some(format!("Input is not a regular file: {}", input.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Some(format!("Input file does not exist: {}", input.display()))
            }
            Err(e) => Some(format!("Cannot read input {}: {}", input.display(), e)),
        };

        let source = if input_problem.is_none() {
            SourceInfo {
                input_size: std::fs::metadata(&input).ok().map(|m| m.len()),
                duration: self.probe.probe(&input).await,
            }
        } else {
            SourceInfo::default()
        };

        let job = self.registry.create(input, output, params, source);

        if let Some(message) = input_problem {
            warn!("❌ Job {} rejected: {}", job.id, message);
            self.registry.transition(&job.id, &[JobStatus::Pending], JobStatus::Failed, |j| {
                j.error = Some(message);
                j.completed_at = Some(Utc::now());
            });
            return self.registry.get(&job.id).unwrap_or(job);
        }

        info!("📥 Queued job {} for {}", job.id, job.file_name());
        job
    }

    fn reset_for_retry(&self, id: &JobId) -> bool {
        self.registry
            .transition(
                id,
                &[JobStatus::Failed, JobStatus::Cancelled],
                JobStatus::Pending,
                |j| {
                    j.progress = 0.0;
                    j.error = None;
                    j.completed_at = None;
                    j.started_at = None;
                    j.output_size = None;
                    j.compression_ratio = None;
                },
            )
            .is_some()
    }

    /// One admission pass: promote the oldest pending jobs into free slots.
    ///
    /// Cancelled runs whose process has not exited yet still count as occupied.
    fn admit(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let _pass = self.admission.lock();

        let cap = self.cap.load(Ordering::SeqCst);
        let occupied = self.registry.count(JobStatus::Running) + self.supervisor.draining_count();
        if occupied >= cap {
            return;
        }
        let mut free = cap - occupied;

        for id in self.registry.pending_oldest_first() {
            if free == 0 {
                break;
            }
            let mut admitted = None;
            let promoted = self.registry.transition(&id, &[JobStatus::Pending], JobStatus::Running, |j| {
                j.attempt += 1;
                j.progress = 0.0;
                j.started_at = Some(Utc::now());
                admitted = Some(j.clone());
            });
            // Cancelled after selection
            let (Some(_), Some(job)) = (promoted, admitted) else {
                continue;
            };
            free -= 1;
            info!("🔄 Starting job {} ({}, attempt {})", job.id, job.file_name(), job.attempt);
            self.dispatch(job);
        }
    }

    /// Supervise `job` on its own task; a panic there fails the job instead
    /// of the scheduler
    fn dispatch(self: &Arc<Self>, job: Job) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let id = job.id.clone();
            let attempt = job.attempt;
            let supervisor = Arc::clone(&inner.supervisor);

            let result = tokio::spawn(async move { supervisor.run(job).await }).await;
            match result {
                Ok(outcome) => debug!("Job {}: supervision ended with {:?}", id, outcome),
                Err(e) => {
                    let message = if e.is_panic() {
                        format!("Supervision task panicked: {}", panic_message(e.into_panic()))
                    } else {
                        "Supervision task was aborted".to_string()
                    };
                    error!("❌ Job {}: {}", id, message);
                    inner.registry.transition_if(
                        &id,
                        JobStatus::Failed,
                        |j| j.status == JobStatus::Running && j.attempt == attempt,
                        |j| {
                            j.error = Some(message);
                            j.completed_at = Some(Utc::now());
                        },
                    );
                }
            }

            inner.admit();
            inner.idle.notify_waiters();
        });
    }

    async fn wait_until<F>(&self, done: F)
    where
        F: Fn(&Self) -> bool,
    {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if done(self) {
                return;
            }
            notified.await;
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
