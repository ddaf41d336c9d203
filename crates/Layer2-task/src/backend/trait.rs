//! Container backend trait

use crate::error::BackendError;
use crate::mapping::{BindMount, WorkLayout, COMMAND_FILE, STDERR_FILE, STDOUT_FILE};
use crate::spec::ResourceLimits;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use sysinfo::{System, SystemExt};

/// Opaque reference to a started container
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendHandle {
    id: String,
    backend: &'static str,
}

impl BackendHandle {
    pub fn new(id: impl Into<String>, backend: &'static str) -> Self {
        Self {
            id: id.into(),
            backend,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.id)
    }
}

/// Everything a backend needs to start one container
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Unique container name
    pub name: String,
    pub image: String,
    pub layout: WorkLayout,
    /// Bind mounts in realisation order
    pub mounts: Vec<BindMount>,
    pub env: BTreeMap<String, String>,
    /// Limits already reconciled against the backend's capabilities
    pub limits: ResourceLimits,
    /// `uid` (or `uid:gid`) to run as
    pub user: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Invocation {
    /// Entry point run from `<container_dir>/work`
    ///
    /// The task's streams are appended to the mounted `stdout.txt` and
    /// `stderr.txt` so the files are the only record of its output.
    pub fn bootstrap_command(&self) -> Vec<String> {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!(
                "sh ../{} >> ../{} 2>> ../{}",
                COMMAND_FILE, STDOUT_FILE, STDERR_FILE
            ),
        ]
    }
}

/// Status reported by one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    /// Accepted but not running yet
    Pending,
    Running,
    /// Exited on its own
    Exited { exit_code: i32, oom_killed: bool },
    /// Stopped by a signal or by the runtime
    Killed { exit_code: i32 },
    /// The backend no longer knows the container
    Lost(String),
}

impl BackendStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// How to stop a running container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateMode {
    /// Ask politely, escalating after `timeout` if the runtime supports it
    Graceful { timeout: Duration },
    Force,
}

/// What a backend can enforce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendCapabilities {
    pub cpu_limit: bool,
    pub memory_limit: bool,
    pub memory_reservation: bool,
    pub disk_limit: bool,
    pub pids_limit: bool,
    /// Host paths are directly visible to the container
    pub shared_filesystem: bool,
}

impl BackendCapabilities {
    /// Supports nothing but a shared filesystem
    pub fn none() -> Self {
        Self {
            cpu_limit: false,
            memory_limit: false,
            memory_reservation: false,
            disk_limit: false,
            pids_limit: false,
            shared_filesystem: true,
        }
    }
}

/// Largest resources one container may receive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResources {
    pub cpus: u32,
    pub memory_bytes: u64,
}

impl HostResources {
    /// Totals of the local machine
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        Self {
            cpus: (sys.cpus().len() as u32).max(1),
            memory_bytes: sys.total_memory(),
        }
    }
}

/// Capability set every container technology implements
///
/// The runner drives one handle through `start`, repeated `poll_status`,
/// optional `terminate` and a final `remove_resources`. Implementations
/// must tolerate `terminate` and `remove_resources` on containers that
/// have already exited.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Short backend name used in handles and logs
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Maximum resources a single container may be given
    async fn detect_resource_limits(&self) -> Result<HostResources, BackendError> {
        Ok(HostResources::detect())
    }

    /// Start the container; returns once it has been started
    async fn start(&self, invocation: &Invocation) -> Result<BackendHandle, BackendError>;

    async fn poll_status(&self, handle: &BackendHandle) -> Result<BackendStatus, BackendError>;

    async fn terminate(&self, handle: &BackendHandle, mode: TerminateMode)
        -> Result<(), BackendError>;

    /// Release everything held for the handle
    async fn remove_resources(&self, handle: &BackendHandle) -> Result<(), BackendError>;
}
