use std::fmt;
use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::params::TranscodeParams;

/// Opaque job identifier (32 lowercase hex characters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether the state machine has an edge from `self` to `next`.
    ///
    /// `Pending -> Failed` only exists for input errors caught at submission.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
                | (Cancelled, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Pending or running jobs are the only ones a cancel applies to
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One input-to-output transcode with its own lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub input: PathBuf,
    /// Fixed at creation; retries overwrite the same target
    pub output: PathBuf,
    pub params: TranscodeParams,
    pub status: JobStatus,
    /// Percent complete in [0, 100]
    pub progress: f64,
    /// Last command line executed
    pub command: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input_size: Option<u64>,
    pub output_size: Option<u64>,
    /// Source duration in seconds, 0 when unknown
    pub duration: f64,
    /// output_size / input_size
    pub compression_ratio: Option<f64>,
    /// Number of times the job has been admitted
    pub attempt: u32,
    /// Insertion order, breaks created_at ties
    pub seq: u64,
}

impl Job {
    pub fn new(input: PathBuf, output: PathBuf, params: TranscodeParams, seq: u64) -> Self {
        Self {
            id: JobId::new(),
            input,
            output,
            params,
            status: JobStatus::Pending,
            progress: 0.0,
            command: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            input_size: None,
            output_size: None,
            duration: 0.0,
            compression_ratio: None,
            attempt: 0,
            seq,
        }
    }

    /// Admission order key: oldest first, insertion sequence on ties
    pub fn admission_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.seq)
    }

    pub fn file_name(&self) -> String {
        self.input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.input.display().to_string())
    }

    /// Wall time between admission and the terminal state, when both are known
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    #[test]
    fn test_completed_has_no_outgoing_edges() {
        for next in ALL {
            assert!(!JobStatus::Completed.can_transition_to(next));
        }
    }

    #[test]
    fn test_retry_edges() {
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Pending));
        assert!(JobStatus::Cancelled.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Cancelled).unwrap(), "\"cancelled\"");
        let parsed: JobStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, JobStatus::Running);
    }

    #[test]
    fn test_job_ids_are_unique_hex() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new("in.mkv".into(), "out/in.mp4".into(), TranscodeParams::default(), 3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.file_name(), "in.mkv");
        assert!(job.elapsed().is_none());
    }

    proptest! {
        /// No edge leads back into the state it started from, and every edge
        /// into Pending starts from a retryable state.
        #[test]
        fn test_edges_are_well_formed(from in 0usize..5, to in 0usize..5) {
            let (from, to) = (ALL[from], ALL[to]);
            if from.can_transition_to(to) {
                prop_assert_ne!(from, to);
                if to == JobStatus::Pending {
                    prop_assert!(from.is_retryable());
                }
                if from.is_terminal() {
                    prop_assert_eq!(to, JobStatus::Pending);
                }
            }
        }
    }
}
