pub mod command;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod job;
pub mod params;
pub mod preview;
pub mod probe;
pub mod progress;
pub mod registry;
pub mod scan;
pub mod snapshot;
pub mod supervisor;

pub use command::{CommandBuilder, FfmpegCommandBuilder};
pub use config::TranscodeConfig;
pub use control::ControlCommand;
pub use engine::TranscodeEngine;
pub use error::{EngineError, EngineResult};
pub use job::{Job, JobId, JobStatus};
pub use params::TranscodeParams;
pub use preview::PreviewEstimate;
pub use snapshot::Snapshot;
