//! Shared fixtures for runner tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use taskbox_task::{
    BackendCapabilities, BackendError, BackendHandle, BackendStatus, ContainerBackend,
    HostResources, Invocation, RetryConfig, RunnerConfig, TaskContainerSpec, TerminateMode,
};

/// Backend whose behaviour is scripted by the test
pub struct ScriptedBackend {
    capabilities: BackendCapabilities,
    start_failures: AtomicU32,
    statuses: Mutex<VecDeque<Result<BackendStatus, BackendError>>>,
    /// Returned once `statuses` is drained
    settled: BackendStatus,
    remove_fails: bool,
    /// Polls never answer until the container is terminated
    hang_polls: bool,
    terminated: AtomicBool,
    pub starts: AtomicU32,
    pub polls: AtomicU32,
    pub terminates: AtomicU32,
    pub removes: AtomicU32,
    /// Whether stdout/stderr existed when `start` was called
    pub streams_existed: AtomicBool,
    pub last_invocation: Mutex<Option<Invocation>>,
}

impl ScriptedBackend {
    /// A container that runs until terminated
    pub fn new() -> Self {
        Self {
            capabilities: BackendCapabilities {
                cpu_limit: true,
                memory_limit: true,
                memory_reservation: true,
                disk_limit: false,
                pids_limit: true,
                shared_filesystem: true,
            },
            start_failures: AtomicU32::new(0),
            statuses: Mutex::new(VecDeque::new()),
            settled: BackendStatus::Running,
            remove_fails: false,
            hang_polls: false,
            terminated: AtomicBool::new(false),
            starts: AtomicU32::new(0),
            polls: AtomicU32::new(0),
            terminates: AtomicU32::new(0),
            removes: AtomicU32::new(0),
            streams_existed: AtomicBool::new(false),
            last_invocation: Mutex::new(None),
        }
    }

    /// A container that exits with `code` on the first poll
    pub fn exits_with(code: i32) -> Self {
        Self::new().settles(BackendStatus::Exited {
            exit_code: code,
            oom_killed: false,
        })
    }

    pub fn settles(mut self, status: BackendStatus) -> Self {
        self.settled = status;
        self
    }

    /// `start` fails with a transient error this many times first
    pub fn fail_starts(self, times: u32) -> Self {
        self.start_failures.store(times, Ordering::SeqCst);
        self
    }

    /// Poll results handed out before settling
    pub fn with_polls(self, polls: Vec<Result<BackendStatus, BackendError>>) -> Self {
        *self.statuses.lock().unwrap() = polls.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn hanging_polls(mut self) -> Self {
        self.hang_polls = true;
        self
    }

    pub fn failing_removal(mut self) -> Self {
        self.remove_fails = true;
        self
    }

    pub fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }

    pub fn invocation(&self) -> Invocation {
        self.last_invocation
            .lock()
            .unwrap()
            .clone()
            .expect("start was never called")
    }
}

#[async_trait]
impl ContainerBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn detect_resource_limits(&self) -> Result<HostResources, BackendError> {
        Ok(HostResources {
            cpus: 4,
            memory_bytes: 8 << 30,
        })
    }

    async fn start(&self, invocation: &Invocation) -> Result<BackendHandle, BackendError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.streams_existed.store(
            invocation.layout.host_stdout().exists() && invocation.layout.host_stderr().exists(),
            Ordering::SeqCst,
        );
        *self.last_invocation.lock().unwrap() = Some(invocation.clone());

        let remaining = self.start_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.start_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Unavailable("daemon restarting".into()));
        }
        Ok(BackendHandle::new(invocation.name.clone(), "scripted"))
    }

    async fn poll_status(&self, _handle: &BackendHandle) -> Result<BackendStatus, BackendError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.hang_polls && !self.terminated.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.terminated.load(Ordering::SeqCst) {
            return Ok(BackendStatus::Killed { exit_code: 137 });
        }
        match self.statuses.lock().unwrap().pop_front() {
            Some(next) => next,
            None => Ok(self.settled.clone()),
        }
    }

    async fn terminate(
        &self,
        _handle: &BackendHandle,
        _mode: TerminateMode,
    ) -> Result<(), BackendError> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_resources(&self, _handle: &BackendHandle) -> Result<(), BackendError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        if self.remove_fails {
            return Err(BackendError::Other("device busy".into()));
        }
        Ok(())
    }
}

/// Short intervals so tests never wait on real backoff
pub fn fast_config() -> RunnerConfig {
    RunnerConfig {
        run_as_invoking_user: false,
        ..RunnerConfig::default()
    }
    .with_poll_interval(Duration::from_millis(5))
    .with_grace_period(Duration::from_millis(50))
    .with_launch_retry(RetryConfig::immediate(3))
    .with_monitor_retry(RetryConfig::immediate(3))
}

/// Write `contents` to `dir/name` and return the path
pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// Spec with its working directory at `dir/run`
pub fn spec_in(dir: &Path, command: &str) -> TaskContainerSpec {
    TaskContainerSpec::new(dir.join("run"), command)
}
