//! Container execution state machine
//!
//! ```text
//! Created -(prepare)-> Prepared -(launch)-> Running -(monitor)-> Exited -(cleanup)-> Cleaned
//!    \__________________\_____________________\___________________-> Failed -(cleanup)-> Cleaned
//! ```

use crate::backend::BackendHandle;
use crate::task::TerminationReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle state of one task container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    /// Spec accepted by the runner, nothing validated yet
    Created,
    /// Spec validated and paths mapped
    Prepared,
    /// Backend process started
    Running,
    /// Backend process reached a terminal state with an exit code
    Exited,
    /// Backend resources released
    Cleaned,
    /// An unrecoverable error occurred; only cleanup is allowed
    Failed,
}

impl ExecutionState {
    /// Check if this is a terminal state (only cleanup may follow)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Exited | ExecutionState::Cleaned | ExecutionState::Failed
        )
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ExecutionState::Created => "Created",
            ExecutionState::Prepared => "Prepared",
            ExecutionState::Running => "Running",
            ExecutionState::Exited => "Exited",
            ExecutionState::Cleaned => "Cleaned",
            ExecutionState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Everything the runner knows about its container
///
/// Owned by the runner; callers only get shared references.
#[derive(Debug, Clone)]
pub struct ContainerExecutionState {
    pub(crate) state: ExecutionState,
    pub(crate) handle: Option<BackendHandle>,
    pub(crate) exit_code: Option<i32>,
    pub(crate) termination_reason: Option<TerminationReason>,
    pub(crate) stdout_path: Option<PathBuf>,
    pub(crate) stderr_path: Option<PathBuf>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
}

impl ContainerExecutionState {
    pub(crate) fn new() -> Self {
        Self {
            state: ExecutionState::Created,
            handle: None,
            exit_code: None,
            termination_reason: None,
            stdout_path: None,
            stderr_path: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Backend handle, present from launch until cleanup
    pub fn handle(&self) -> Option<&BackendHandle> {
        self.handle.as_ref()
    }

    /// Exit code, defined only once the container has exited
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            ExecutionState::Exited => self.exit_code,
            _ => None,
        }
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.termination_reason
    }

    /// Host path of the task's stdout, stable once prepared
    pub fn stdout_path(&self) -> Option<&PathBuf> {
        self.stdout_path.as_ref()
    }

    /// Host path of the task's stderr, stable once prepared
    pub fn stderr_path(&self) -> Option<&PathBuf> {
        self.stderr_path.as_ref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Wall-clock time between launch and the terminal state
    pub fn duration(&self) -> Option<std::time::Duration> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - start).to_std().unwrap_or_default())
    }

    pub(crate) fn transition(&mut self, to: ExecutionState) {
        tracing::debug!("container state {} -> {}", self.state, to);
        if matches!(to, ExecutionState::Exited | ExecutionState::Failed)
            && self.finished_at.is_none()
            && self.started_at.is_some()
        {
            self.finished_at = Some(Utc::now());
        }
        self.state = to;
    }
}

impl Default for ContainerExecutionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!ExecutionState::Created.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(ExecutionState::Exited.is_terminal());
        assert!(ExecutionState::Cleaned.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
    }

    #[test]
    fn test_exit_code_only_when_exited() {
        let mut state = ContainerExecutionState::new();
        state.exit_code = Some(3);
        state.transition(ExecutionState::Running);
        assert_eq!(state.exit_code(), None);
        state.transition(ExecutionState::Exited);
        assert_eq!(state.exit_code(), Some(3));
    }

    #[test]
    fn test_duration_requires_start() {
        let mut state = ContainerExecutionState::new();
        assert!(state.duration().is_none());
        state.started_at = Some(Utc::now());
        state.transition(ExecutionState::Failed);
        assert!(state.duration().is_some());
    }
}
