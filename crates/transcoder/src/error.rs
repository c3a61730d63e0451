use thiserror::Error;

use crate::job::{JobId, JobStatus};

/// Errors returned by the engine's control surface.
///
/// Per-job failures never show up here; they are recorded on the job itself
/// as `JobStatus::Failed` with an error message.
#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("concurrency cap must be at least 1 (got {0})")]
    InvalidConcurrency(usize),

    #[error("job {id} is {status} and cannot be {action}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        action: &'static str,
    },
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
