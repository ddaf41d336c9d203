//! Local process backend
//!
//! Runs the command script directly on the host with `sh`, inside the
//! working directory's `work/` subdirectory. There is no isolation and no
//! resource enforcement. Container paths are only meaningful below the
//! container directory, where they mirror the working directory; inputs are
//! realised by symlinking their mirrored location to the host source.

use super::r#trait::{
    BackendCapabilities, BackendHandle, BackendStatus, ContainerBackend, Invocation,
    TerminateMode,
};
use crate::error::BackendError;
use crate::mapping::BindMount;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const NAME: &str = "local";

/// Process information for a running task
struct ProcessInfo {
    child: Child,
    pid: Option<u32>,
    status: Option<BackendStatus>,
}

/// Backend running tasks as plain host processes
pub struct LocalProcessBackend {
    /// Running processes by invocation name
    processes: Arc<RwLock<HashMap<String, Arc<Mutex<ProcessInfo>>>>>,
}

impl LocalProcessBackend {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::with_capacity(16))),
        }
    }

    /// Names of processes started and not yet removed
    pub async fn running_processes(&self) -> Vec<String> {
        self.processes.read().await.keys().cloned().collect()
    }

    async fn process(&self, name: &str) -> Result<Arc<Mutex<ProcessInfo>>, BackendError> {
        self.processes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }

    /// Make every mount visible at its mirrored host location
    fn realize_mounts(invocation: &Invocation) -> Result<(), BackendError> {
        let layout = &invocation.layout;
        for mount in &invocation.mounts {
            if !mount.container_path.starts_with(&layout.container_dir) {
                return Err(BackendError::InvalidMount(format!(
                    "{} is outside {}; the local backend only mirrors the container directory",
                    mount.container_path.display(),
                    layout.container_dir.display()
                )));
            }
            let mirrored = layout.host_path_for(&mount.container_path);
            if mirrored == mount.host_path {
                continue;
            }
            link_input(mount, &mirrored)?;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn send_sigterm(pid: Option<u32>) {
        if let Some(pid) = pid {
            // SAFETY: signalling a pid we spawned and have not reaped yet
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!("SIGTERM to {} failed: {}", pid, std::io::Error::last_os_error());
            }
        }
    }

    #[cfg(not(unix))]
    fn send_sigterm(_pid: Option<u32>) {
        debug!("SIGTERM not supported on this platform, will use kill");
    }
}

impl Default for LocalProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace the placeholder at `mirrored` with a symlink to the source
fn link_input(mount: &BindMount, mirrored: &Path) -> Result<(), BackendError> {
    match fs::symlink_metadata(mirrored) {
        Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(mirrored)?,
        Ok(meta) if meta.is_dir() => fs::remove_dir(mirrored).map_err(|e| {
            BackendError::InvalidMount(format!(
                "mount point {} is not empty: {}",
                mirrored.display(),
                e
            ))
        })?,
        Ok(meta) if meta.len() == 0 => fs::remove_file(mirrored)?,
        Ok(_) => {
            return Err(BackendError::InvalidMount(format!(
                "mount point {} already holds data",
                mirrored.display()
            )))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = mirrored.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        Err(e) => return Err(e.into()),
    }

    debug!(
        "Linking {} -> {}",
        mirrored.display(),
        mount.host_path.display()
    );
    symlink(&mount.host_path, mirrored)
}

#[cfg(unix)]
fn symlink(source: &Path, link: &Path) -> Result<(), BackendError> {
    std::os::unix::fs::symlink(source, link).map_err(BackendError::from)
}

#[cfg(not(unix))]
fn symlink(source: &Path, _link: &Path) -> Result<(), BackendError> {
    Err(BackendError::InvalidMount(format!(
        "cannot link {} without symlink support",
        source.display()
    )))
}

fn status_from_exit(exit: ExitStatus) -> BackendStatus {
    if let Some(code) = exit.code() {
        return BackendStatus::Exited {
            exit_code: code,
            oom_killed: false,
        };
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = exit.signal() {
            return BackendStatus::Killed {
                exit_code: 128 + signal,
            };
        }
    }

    BackendStatus::Killed { exit_code: -1 }
}

#[async_trait]
impl ContainerBackend for LocalProcessBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::none()
    }

    async fn start(&self, invocation: &Invocation) -> Result<BackendHandle, BackendError> {
        Self::realize_mounts(invocation)?;

        let layout = &invocation.layout;
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(layout.host_stdout())?;
        let stderr = OpenOptions::new()
            .create(true)
            .append(true)
            .open(layout.host_stderr())?;

        let mut cmd = Command::new("sh");
        cmd.arg(layout.host_command())
            .current_dir(layout.host_work())
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::Unavailable("sh not found".to_string())
            } else {
                BackendError::Transient(format!("failed to spawn sh: {}", e))
            }
        })?;
        let pid = child.id();

        info!("Started local task {} (pid {:?})", invocation.name, pid);
        self.processes.write().await.insert(
            invocation.name.clone(),
            Arc::new(Mutex::new(ProcessInfo {
                child,
                pid,
                status: None,
            })),
        );

        Ok(BackendHandle::new(invocation.name.clone(), NAME))
    }

    async fn poll_status(&self, handle: &BackendHandle) -> Result<BackendStatus, BackendError> {
        let process = self.process(handle.id()).await?;
        let mut info = process.lock().await;

        if let Some(ref status) = info.status {
            return Ok(status.clone());
        }
        match info.child.try_wait()? {
            None => Ok(BackendStatus::Running),
            Some(exit) => {
                let status = status_from_exit(exit);
                info.status = Some(status.clone());
                Ok(status)
            }
        }
    }

    async fn terminate(
        &self,
        handle: &BackendHandle,
        mode: TerminateMode,
    ) -> Result<(), BackendError> {
        let process = match self.process(handle.id()).await {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };
        let mut info = process.lock().await;
        if info.status.is_some() {
            return Ok(());
        }

        if let TerminateMode::Graceful { timeout } = mode {
            Self::send_sigterm(info.pid);
            let waited = tokio::time::timeout(timeout, info.child.wait()).await;
            match waited {
                Ok(Ok(exit)) => {
                    debug!("Task {} stopped after SIGTERM", handle.id());
                    info.status = Some(status_from_exit(exit));
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    warn!(
                        "Task {} ignored SIGTERM for {:.1}s, killing",
                        handle.id(),
                        timeout.as_secs_f64()
                    );
                }
            }
        }

        info.child.kill().await?;
        let exit = info.child.wait().await?;
        info.status = Some(status_from_exit(exit));
        info!("Killed local task {}", handle.id());
        Ok(())
    }

    async fn remove_resources(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        let process = self.processes.write().await.remove(handle.id());
        if let Some(process) = process {
            let mut info = process.lock().await;
            if info.status.is_none() {
                info.child.kill().await?;
            }
        }
        Ok(())
    }
}
