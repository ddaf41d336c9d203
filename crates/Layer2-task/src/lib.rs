//! # taskbox-task
//!
//! Runs one externally defined task inside an isolated container.
//!
//! ## Components
//!
//! - `TaskContainerSpec`: what to run, its inputs, outputs and working directory
//! - `PathMapper`: deterministic container path to host path mapping
//! - `ContainerBackend`: capability set implemented per container technology
//! - `TaskContainerRunner`: prepare → launch → monitor → collect → cleanup
//!
//! ## Working directory
//!
//! ```text
//! <workingDirectory>/
//!   command       task script
//!   stdout.txt    task stdout (append-only)
//!   stderr.txt    task stderr (append-only)
//!   work/         writable cwd of the task
//!   backend.log   output of the backend tool
//!   root/         outputs declared outside the container directory
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod log;
pub mod mapping;
pub mod retry;
pub mod runner;
pub mod spec;
pub mod state;
pub mod task;

// Lifecycle
pub use runner::{RunReport, TaskContainer, TaskContainerRunner, TASK_LABEL};
pub use spec::{InputMount, ResourceLimits, TaskCommand, TaskContainerSpec};
pub use state::{ContainerExecutionState, ExecutionState};
pub use task::{ExitOutcome, OutputFile, TaskResult, TerminationReason};

// Backends
pub use backend::{
    connect, BackendCapabilities, BackendHandle, BackendStatus, ContainerBackend,
    DockerApiBackend, DockerCliBackend, HostResources, Invocation, LocalProcessBackend,
    TerminateMode,
};

// Paths
pub use mapping::{BindMount, MappedPaths, PathMapper, WorkLayout};

// Errors
pub use error::{
    BackendError, CleanupError, CollectError, LaunchError, MonitorError, RunFailure, RunnerError,
    SpecError, StateError,
};

// Support
pub use config::RunnerConfig;
pub use log::LogTail;
pub use retry::{with_retry, RetryConfig};
