//! Error taxonomy for the task container lifecycle
//!
//! One enum per lifecycle step, so callers can tell caller defects
//! (`SpecError`) from environment defects (`LaunchError`), expected
//! outcomes (`MonitorError::Cancelled`), output-contract violations
//! (`CollectError`) and housekeeping failures (`CleanupError`).

use crate::state::ExecutionState;
use crate::task::TerminationReason;
use std::path::PathBuf;
use thiserror::Error;

/// A lifecycle method was called in a state that does not allow it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {operation} while {state}")]
pub struct StateError {
    pub operation: &'static str,
    pub state: ExecutionState,
}

/// Caller input defects; never retried
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("input path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("container path mounted more than once: {}", .0.display())]
    DuplicateMount(PathBuf),

    #[error("command is empty")]
    EmptyCommand,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error(
        "mounts {} and {} both resolve to host path {}",
        .first.display(),
        .second.display(),
        .host_path.display()
    )]
    MountCollision {
        first: PathBuf,
        second: PathBuf,
        host_path: PathBuf,
    },

    #[error("container path must be absolute: {}", .0.display())]
    RelativeContainerPath(PathBuf),

    #[error("container path escapes the root: {}", .0.display())]
    PathEscapesRoot(PathBuf),

    #[error("output must live below a directory other than /: {}", .0.display())]
    OutputAtRoot(PathBuf),

    #[error(
        "output {} would hide system directory {} inside the container",
        .output.display(),
        .dir.display()
    )]
    OutputShadowsSystemDir { output: PathBuf, dir: PathBuf },

    #[error("working directory must be absolute: {}", .0.display())]
    RelativeWorkingDirectory(PathBuf),

    #[error(transparent)]
    InvalidState(#[from] StateError),
}

/// Errors reported by a backend implementation
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("mount cannot be realised: {0}")]
    InvalidMount(String),

    #[error("resource limit not supported: {0}")]
    UnsupportedLimit(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Transient(_))
    }
}

/// Environment or backend defects while starting the container
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Runtime could not be reached or spawned; the caller may retry
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A mapped path cannot be realised by the backend; fatal for the task
    #[error("invalid mount: {0}")]
    InvalidMount(String),

    #[error("unsupported resource limit: {0}")]
    UnsupportedLimit(String),

    /// The runtime answered but refused the container (missing image, name
    /// conflict, ...); retrying the same invocation will not help
    #[error("backend refused to start the container: {0}")]
    StartRejected(String),

    #[error("failed to prepare working directory: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    InvalidState(#[from] StateError),
}

impl LaunchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

impl From<BackendError> for LaunchError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::InvalidMount(msg) => Self::InvalidMount(msg),
            BackendError::UnsupportedLimit(msg) => Self::UnsupportedLimit(msg),
            BackendError::Unavailable(msg) | BackendError::Transient(msg) => {
                Self::BackendUnavailable(msg)
            }
            BackendError::Io(e) => Self::Io(e),
            BackendError::NotFound(msg) | BackendError::Other(msg) => Self::StartRejected(msg),
        }
    }
}

/// Errors while waiting for the container to reach a terminal state
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Cancellation was requested; expected, not a failure
    #[error("task cancelled")]
    Cancelled,

    /// Status polling kept failing after bounded retries
    #[error("backend lost: {0}")]
    BackendLost(String),

    #[error(transparent)]
    InvalidState(#[from] StateError),
}

/// The task finished but did not honour its output contract
#[derive(Debug, Error)]
pub enum CollectError {
    #[error(
        "declared output {} missing at {}",
        .container_path.display(),
        .host_path.display()
    )]
    OutputMissing {
        container_path: PathBuf,
        host_path: PathBuf,
    },

    #[error(transparent)]
    InvalidState(#[from] StateError),
}

/// Backend resources could not be released; never masks the task outcome
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("failed to stop container {handle}: {source}")]
    Terminate {
        handle: String,
        #[source]
        source: BackendError,
    },

    #[error("failed to remove resources of {handle}: {source}")]
    RemoveResources {
        handle: String,
        #[source]
        source: BackendError,
    },
}

/// Primary error of a one-shot `run()`
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Collect(#[from] CollectError),
}

impl RunnerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Launch(e) if e.is_retryable())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Monitor(MonitorError::Cancelled))
    }
}

/// Failure of a one-shot `run()`, with everything needed to diagnose it
/// without re-running
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: RunnerError,
    pub termination_reason: Option<TerminationReason>,
    pub exit_code: Option<i32>,
    pub stderr_path: Option<PathBuf>,
    /// Reported alongside, never instead of, the primary error
    pub cleanup_error: Option<CleanupError>,
}
