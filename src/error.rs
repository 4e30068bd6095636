//! Error types for comprunner.

use crate::protocol::exit_code;
use thiserror::Error;

/// Main error type for comprunner.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Another server is already listening on {0}")]
    AddressInUse(String),

    #[error("Worker {pid} exited while a job was being submitted")]
    WorkerUnavailable { pid: i32 },

    #[error("Worker {pid} is still busy with another job")]
    WorkerBusy { pid: i32 },

    #[error("{0}")]
    Worker(String),

    #[error("Client closed connection before the job could complete")]
    JobAborted,

    #[error("{0} components are not supported")]
    UnsupportedLanguage(String),

    #[error("Component failed to initialize: {0}")]
    ComponentInit(String),

    #[error("Descriptor error: {0}")]
    Descriptor(String),

    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    Job(String),

    #[error("Server closed connection before completing the job")]
    ServerDied,
}

impl RunnerError {
    /// Whether this error leaves the worker process unusable.
    ///
    /// Only component loading failures qualify; everything else fails the
    /// single job and the worker keeps serving.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedLanguage(_) | Self::ComponentInit(_) | Self::Descriptor(_)
        )
    }

    /// The status byte reported to the client for a job that failed with this error.
    pub fn status_byte(&self) -> u8 {
        match self {
            Self::JobAborted => exit_code::ABORTED,
            Self::Usage(_) => exit_code::USAGE,
            Self::ServerDied => exit_code::SERVER_DIED,
            _ => exit_code::FAILURE,
        }
    }

    /// Whether the error is the retryable dispatch race on a dying worker.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WorkerUnavailable { .. })
    }
}

/// Result type alias for comprunner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;
