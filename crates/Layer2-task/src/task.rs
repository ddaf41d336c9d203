//! Task outcome types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Why the container stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationReason {
    /// The command ran to completion (any exit code)
    Completed,
    /// Stopped by a signal or by the task timeout
    Killed,
    /// Killed for exceeding its memory limit
    Oom,
    /// Stopped because the caller cancelled it
    Cancelled,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::Killed => "killed",
            Self::Oom => "oom",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of `monitor`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitOutcome {
    pub exit_code: i32,
    pub termination_reason: TerminationReason,
}

impl ExitOutcome {
    pub fn completed(exit_code: i32) -> Self {
        Self {
            exit_code,
            termination_reason: TerminationReason::Completed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.termination_reason == TerminationReason::Completed
    }
}

/// Declared output and where it landed on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFile {
    pub container_path: PathBuf,
    pub host_path: PathBuf,
}

/// Result of `collect`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub exit_code: i32,
    pub termination_reason: TerminationReason,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub outputs: Vec<OutputFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.termination_reason == TerminationReason::Completed
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }

    /// Host path of a declared output
    pub fn output(&self, container_path: impl AsRef<std::path::Path>) -> Option<&PathBuf> {
        let wanted = container_path.as_ref();
        self.outputs
            .iter()
            .find(|o| o.container_path == wanted)
            .map(|o| &o.host_path)
    }
}
