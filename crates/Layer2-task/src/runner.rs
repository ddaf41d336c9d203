//! Task container runner
//!
//! `TaskContainerRunner` binds one `TaskContainerSpec` to one backend and
//! drives it through prepare → launch → monitor → collect → cleanup. It owns
//! the execution state and the backend handle; callers only see snapshots.
//!
//! ```ignore
//! let mut runner = TaskContainerRunner::new(spec, backend, config);
//! let cancel = runner.cancellation_token();
//! match runner.run().await {
//!     Ok(report) => println!("exit {}", report.result.exit_code),
//!     Err(failure) => eprintln!("{} (see {:?})", failure, failure.stderr_path),
//! }
//! ```

use crate::backend::{
    BackendCapabilities, BackendHandle, BackendStatus, ContainerBackend, Invocation, TerminateMode,
};
use crate::config::RunnerConfig;
use crate::error::{
    BackendError, CleanupError, CollectError, LaunchError, MonitorError, RunFailure, RunnerError,
    SpecError, StateError,
};
use crate::log::LogTail;
use crate::mapping::{MappedPaths, PathMapper};
use crate::retry::with_retry;
use crate::spec::{ResourceLimits, TaskContainerSpec};
use crate::state::{ContainerExecutionState, ExecutionState};
use crate::task::{ExitOutcome, OutputFile, TaskResult, TerminationReason};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Extra time allowed on top of the grace period for a stop request to return
const TERMINATE_SLACK: Duration = Duration::from_secs(5);

/// Label carrying the runner id on every container
pub const TASK_LABEL: &str = "taskbox.task";

/// Lifecycle of one task container
///
/// Each method is valid in exactly one state (`cleanup` in all of them).
/// Calling a method out of order returns its `InvalidState` error and
/// leaves the state unchanged.
#[async_trait]
pub trait TaskContainer: Send {
    /// Validate the spec and map its paths
    fn prepare(&mut self) -> Result<MappedPaths, SpecError>;

    /// Lay out the working directory and start the container
    async fn launch(&mut self) -> Result<ContainerExecutionState, LaunchError>;

    /// Wait for the container to reach a terminal state
    async fn monitor(&mut self) -> Result<ExitOutcome, MonitorError>;

    /// Read the captured outcome; never touches the backend
    fn collect(&self) -> Result<TaskResult, CollectError>;

    /// Release backend resources; idempotent
    async fn cleanup(&mut self) -> Result<(), CleanupError>;

    fn state(&self) -> &ContainerExecutionState;
}

/// Successful `run()`
#[derive(Debug)]
pub struct RunReport {
    pub result: TaskResult,
    /// Reported for visibility; the task itself succeeded
    pub cleanup_error: Option<CleanupError>,
}

/// Runner bound to one task invocation
pub struct TaskContainerRunner {
    id: String,
    spec: TaskContainerSpec,
    backend: Arc<dyn ContainerBackend>,
    config: RunnerConfig,
    mapper: PathMapper,
    exec: ContainerExecutionState,
    mapped: Option<MappedPaths>,
    script: Option<String>,
    cancel: CancellationToken,
    launched_at: Option<Instant>,
    stderr_tail: Option<LogTail>,
}

impl TaskContainerRunner {
    pub fn new(
        spec: TaskContainerSpec,
        backend: Arc<dyn ContainerBackend>,
        config: RunnerConfig,
    ) -> Self {
        let id = format!("taskbox-{}", Uuid::new_v4().simple());
        debug!("Runner {} bound to backend {}", id, backend.name());
        Self {
            id,
            mapper: PathMapper::new(&config.container_dir)
                .with_copy_inputs(config.copy_input_files),
            spec,
            backend,
            config,
            exec: ContainerExecutionState::new(),
            mapped: None,
            script: None,
            cancel: CancellationToken::new(),
            launched_at: None,
            stderr_tail: None,
        }
    }

    /// Unique id, also used as the container name
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &TaskContainerSpec {
        &self.spec
    }

    /// Paths resolved by `prepare`
    pub fn mapped_paths(&self) -> Option<&MappedPaths> {
        self.mapped.as_ref()
    }

    /// Token that cancels `monitor` from any task
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// prepare → launch → monitor → collect, then always cleanup
    pub async fn run(&mut self) -> Result<RunReport, RunFailure> {
        let outcome = self.drive().await;
        let cleanup_error = self.cleanup().await.err();

        match outcome {
            Ok(result) => Ok(RunReport {
                result,
                cleanup_error,
            }),
            Err(error) => Err(RunFailure {
                termination_reason: self.exec.termination_reason,
                exit_code: self.exec.exit_code,
                stderr_path: self.exec.stderr_path.clone(),
                error,
                cleanup_error,
            }),
        }
    }

    async fn drive(&mut self) -> Result<TaskResult, RunnerError> {
        self.prepare()?;
        self.launch().await?;
        self.monitor().await?;
        Ok(self.collect()?)
    }

    fn require(&self, operation: &'static str, state: ExecutionState) -> Result<(), StateError> {
        if self.exec.state == state {
            Ok(())
        } else {
            Err(StateError {
                operation,
                state: self.exec.state,
            })
        }
    }

    fn fail_prepare(&mut self, err: SpecError) -> SpecError {
        warn!("Runner {}: invalid spec: {}", self.id, err);
        self.exec.transition(ExecutionState::Failed);
        err
    }

    fn fail_launch(&mut self, err: LaunchError) -> LaunchError {
        error!("Runner {}: launch failed: {}", self.id, err);
        self.exec.transition(ExecutionState::Failed);
        err
    }

    /// Drop or reject limits the backend cannot enforce, then clamp the rest
    /// to what one container may receive
    async fn reconcile_limits(
        &self,
        caps: BackendCapabilities,
    ) -> Result<ResourceLimits, LaunchError> {
        let mut limits = self.spec.resource_limits.clone().unwrap_or_default();
        if limits.is_empty() {
            return Ok(limits);
        }

        let unsupported = [
            ("cpus", limits.cpus.is_some() && !caps.cpu_limit),
            ("memory", limits.memory_bytes.is_some() && !caps.memory_limit),
            (
                "memory reservation",
                limits.memory_reservation_bytes.is_some() && !caps.memory_reservation,
            ),
            ("disk", limits.disk_bytes.is_some() && !caps.disk_limit),
            ("pids", limits.pids_limit.is_some() && !caps.pids_limit),
        ];
        for (name, dropped) in unsupported {
            if !dropped {
                continue;
            }
            if limits.strict {
                return Err(LaunchError::UnsupportedLimit(format!(
                    "{} limit is not enforced by the {} backend",
                    name,
                    self.backend.name()
                )));
            }
            warn!(
                "Runner {}: {} backend ignores the {} limit",
                self.id,
                self.backend.name(),
                name
            );
        }
        if !caps.cpu_limit {
            limits.cpus = None;
        }
        if !caps.memory_limit {
            limits.memory_bytes = None;
        }
        if !caps.memory_reservation {
            limits.memory_reservation_bytes = None;
        }
        if !caps.disk_limit {
            limits.disk_bytes = None;
        }
        if !caps.pids_limit {
            limits.pids_limit = None;
        }

        if limits.cpus.is_none() && limits.memory_bytes.is_none() {
            return Ok(limits);
        }
        let host = match self.backend.detect_resource_limits().await {
            Ok(host) => host,
            Err(e) => {
                warn!("Runner {}: cannot detect resource limits: {}", self.id, e);
                return Ok(limits);
            }
        };
        if let Some(cpus) = limits.cpus {
            if cpus > host.cpus as f32 {
                warn!(
                    "Runner {}: cpus {} exceeds the {} available, clamping",
                    self.id, cpus, host.cpus
                );
                limits.cpus = Some(host.cpus as f32);
            }
        }
        if let Some(memory) = limits.memory_bytes {
            if memory > host.memory_bytes {
                warn!(
                    "Runner {}: memory {} exceeds the {} bytes available, clamping",
                    self.id, memory, host.memory_bytes
                );
                limits.memory_bytes = Some(host.memory_bytes);
            }
        }
        Ok(limits)
    }

    fn invocation(&self, mapped: &MappedPaths, limits: ResourceLimits) -> Invocation {
        Invocation {
            name: self.id.clone(),
            image: self
                .spec
                .image
                .clone()
                .unwrap_or_else(|| self.config.default_image.clone()),
            layout: mapped.layout.clone(),
            mounts: mapped.bind_mounts(),
            env: self.spec.environment.clone(),
            limits,
            user: self.config.container_user(),
            labels: BTreeMap::from([(TASK_LABEL.to_string(), self.id.clone())]),
        }
    }

    async fn forward_stderr(&mut self, finished: bool) {
        if let Some(tail) = self.stderr_tail.as_mut() {
            tail.forward(&self.id, finished).await;
        }
    }

    /// Stop the container within a bounded time: graceful first, then forced
    async fn stop_container(&self, handle: &BackendHandle) {
        let grace = self.config.grace_period;
        let graceful = timeout(
            grace + TERMINATE_SLACK,
            self.backend
                .terminate(handle, TerminateMode::Graceful { timeout: grace }),
        )
        .await;

        match graceful {
            Ok(Ok(())) => return,
            Ok(Err(e)) => warn!("Runner {}: graceful stop failed: {}", self.id, e),
            Err(_) => warn!(
                "Runner {}: graceful stop did not return within {:.1}s",
                self.id,
                (grace + TERMINATE_SLACK).as_secs_f64()
            ),
        }

        match timeout(
            TERMINATE_SLACK,
            self.backend.terminate(handle, TerminateMode::Force),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Runner {}: forced stop failed: {}", self.id, e),
            Err(_) => warn!("Runner {}: forced stop timed out", self.id),
        }
    }

    async fn on_cancel(&mut self, handle: &BackendHandle) -> MonitorError {
        info!("Runner {}: cancellation requested, stopping container", self.id);
        self.stop_container(handle).await;
        self.forward_stderr(true).await;
        self.exec.termination_reason = Some(TerminationReason::Cancelled);
        self.exec.transition(ExecutionState::Failed);
        MonitorError::Cancelled
    }

    async fn on_timeout(&mut self, handle: &BackendHandle) -> ExitOutcome {
        warn!(
            "Runner {}: timeout of {}s exceeded, stopping container",
            self.id,
            self.spec.timeout_secs.unwrap_or_default()
        );
        self.stop_container(handle).await;

        let exit_code = match timeout(TERMINATE_SLACK, self.backend.poll_status(handle)).await {
            Ok(Ok(BackendStatus::Exited { exit_code, .. }))
            | Ok(Ok(BackendStatus::Killed { exit_code })) => exit_code,
            _ => -1,
        };
        self.finish(ExitOutcome {
            exit_code,
            termination_reason: TerminationReason::Killed,
        })
        .await
    }

    async fn finish(&mut self, outcome: ExitOutcome) -> ExitOutcome {
        self.forward_stderr(true).await;
        self.exec.exit_code = Some(outcome.exit_code);
        self.exec.termination_reason = Some(outcome.termination_reason);
        self.exec.transition(ExecutionState::Exited);
        info!(
            "Runner {}: container exited with code {} ({})",
            self.id, outcome.exit_code, outcome.termination_reason
        );
        outcome
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => futures::future::pending::<()>().await,
    }
}

#[async_trait]
impl TaskContainer for TaskContainerRunner {
    fn prepare(&mut self) -> Result<MappedPaths, SpecError> {
        self.require("prepare", ExecutionState::Created)?;

        if let Err(e) = self.spec.validate() {
            return Err(self.fail_prepare(e));
        }
        let script = match self.spec.command.to_script() {
            Ok(script) => script,
            Err(e) => return Err(self.fail_prepare(e)),
        };
        let mapped = match self.mapper.map(&self.spec) {
            Ok(mapped) => mapped,
            Err(e) => return Err(self.fail_prepare(e)),
        };

        self.exec.stdout_path = Some(mapped.layout.host_stdout());
        self.exec.stderr_path = Some(mapped.layout.host_stderr());
        self.script = Some(script);
        self.mapped = Some(mapped.clone());
        self.exec.transition(ExecutionState::Prepared);
        info!(
            "Runner {}: prepared {} input(s), {} output(s) in {}",
            self.id,
            mapped.inputs.len(),
            mapped.outputs.len(),
            mapped.layout.host_dir.display()
        );
        Ok(mapped)
    }

    async fn launch(&mut self) -> Result<ContainerExecutionState, LaunchError> {
        self.require("launch", ExecutionState::Prepared)?;
        let (mapped, script) = match (self.mapped.clone(), self.script.clone()) {
            (Some(mapped), Some(script)) => (mapped, script),
            _ => {
                return Err(StateError {
                    operation: "launch",
                    state: self.exec.state,
                }
                .into())
            }
        };

        let caps = self.backend.capabilities();
        if !caps.shared_filesystem {
            let err = LaunchError::InvalidMount(format!(
                "{} backend cannot see {}",
                self.backend.name(),
                mapped.layout.host_dir.display()
            ));
            return Err(self.fail_launch(err));
        }

        let limits = match self.reconcile_limits(caps).await {
            Ok(limits) => limits,
            Err(e) => return Err(self.fail_launch(e)),
        };

        if let Err(e) = mapped.materialize(&script) {
            return Err(self.fail_launch(LaunchError::Io(e)));
        }

        let invocation = self.invocation(&mapped, limits);
        let backend = &self.backend;
        let started = with_retry(&self.config.launch_retry, "start", || {
            backend.start(&invocation)
        })
        .await;

        let handle = match started {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail_launch(LaunchError::from(e))),
        };

        info!("Runner {}: running as {}", self.id, handle);
        self.exec.handle = Some(handle);
        self.exec.started_at = Some(Utc::now());
        self.launched_at = Some(Instant::now());
        self.stderr_tail = Some(LogTail::new(mapped.layout.host_stderr()));
        self.exec.transition(ExecutionState::Running);
        Ok(self.exec.clone())
    }

    async fn monitor(&mut self) -> Result<ExitOutcome, MonitorError> {
        self.require("monitor", ExecutionState::Running)?;
        let handle = match self.exec.handle.clone() {
            Some(handle) => handle,
            None => {
                return Err(StateError {
                    operation: "monitor",
                    state: self.exec.state,
                }
                .into())
            }
        };

        let cancel = self.cancel.clone();
        let deadline = self
            .spec
            .timeout()
            .map(|t| self.launched_at.unwrap_or_else(Instant::now) + t);
        let retry = self.config.monitor_retry.clone();
        let poll_timeout = self.config.poll_timeout;
        let backend = Arc::clone(&self.backend);
        let mut failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(self.on_cancel(&handle).await);
            }

            // A poll may hang; cancellation and the deadline must still win
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(self.on_cancel(&handle).await);
                }
                _ = sleep_until_deadline(deadline) => {
                    return Ok(self.on_timeout(&handle).await);
                }
                polled = timeout(poll_timeout, backend.poll_status(&handle)) => {
                    polled.unwrap_or_else(|_| {
                        Err(BackendError::Transient(format!(
                            "status poll did not answer within {:.1}s",
                            poll_timeout.as_secs_f64()
                        )))
                    })
                }
            };

            let wait = match polled {
                Ok(status) => {
                    failures = 0;
                    debug!("Runner {}: status {:?}", self.id, status);
                    match status {
                        BackendStatus::Pending | BackendStatus::Running => {}
                        BackendStatus::Exited {
                            exit_code,
                            oom_killed,
                        } => {
                            let termination_reason = if oom_killed {
                                TerminationReason::Oom
                            } else {
                                TerminationReason::Completed
                            };
                            return Ok(self
                                .finish(ExitOutcome {
                                    exit_code,
                                    termination_reason,
                                })
                                .await);
                        }
                        BackendStatus::Killed { exit_code } => {
                            return Ok(self
                                .finish(ExitOutcome {
                                    exit_code,
                                    termination_reason: TerminationReason::Killed,
                                })
                                .await);
                        }
                        BackendStatus::Lost(reason) => {
                            error!("Runner {}: container lost: {}", self.id, reason);
                            self.forward_stderr(true).await;
                            self.exec.transition(ExecutionState::Failed);
                            return Err(MonitorError::BackendLost(reason));
                        }
                    }
                    self.config.poll_interval
                }
                Err(e) => {
                    failures += 1;
                    if failures > retry.max_retries || matches!(e, BackendError::NotFound(_)) {
                        error!(
                            "Runner {}: status polling failed {} time(s): {}",
                            self.id, failures, e
                        );
                        self.forward_stderr(true).await;
                        self.exec.transition(ExecutionState::Failed);
                        return Err(MonitorError::BackendLost(e.to_string()));
                    }
                    let delay = retry.delay_for_attempt(failures - 1);
                    warn!(
                        "Runner {}: status poll failed (attempt {}/{}), retrying in {:?}: {}",
                        self.id,
                        failures,
                        retry.max_retries + 1,
                        delay,
                        e
                    );
                    delay
                }
            };

            self.forward_stderr(false).await;

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(self.on_cancel(&handle).await);
                }
                _ = sleep_until_deadline(deadline) => {
                    return Ok(self.on_timeout(&handle).await);
                }
                _ = sleep(wait) => {}
            }
        }
    }

    fn collect(&self) -> Result<TaskResult, CollectError> {
        let collectable = matches!(
            self.exec.state,
            ExecutionState::Exited | ExecutionState::Cleaned
        );
        let (exit_code, termination_reason, mapped) = match (
            collectable,
            self.exec.exit_code,
            self.exec.termination_reason,
            self.mapped.as_ref(),
        ) {
            (true, Some(code), Some(reason), Some(mapped)) => (code, reason, mapped),
            _ => {
                return Err(StateError {
                    operation: "collect",
                    state: self.exec.state,
                }
                .into())
            }
        };

        let success = exit_code == 0 && termination_reason == TerminationReason::Completed;
        if success {
            if let Some(missing) = mapped.outputs.iter().find(|o| !o.host_path.exists()) {
                return Err(CollectError::OutputMissing {
                    container_path: missing.container_path.clone(),
                    host_path: missing.host_path.clone(),
                });
            }
        }

        Ok(TaskResult {
            exit_code,
            termination_reason,
            stdout_path: mapped.layout.host_stdout(),
            stderr_path: mapped.layout.host_stderr(),
            outputs: mapped
                .outputs
                .iter()
                .map(|o| OutputFile {
                    container_path: o.container_path.clone(),
                    host_path: o.host_path.clone(),
                })
                .collect(),
            duration_ms: self.exec.duration().map(|d| d.as_millis() as u64),
        })
    }

    async fn cleanup(&mut self) -> Result<(), CleanupError> {
        if self.exec.state == ExecutionState::Cleaned {
            debug!("Runner {}: already cleaned", self.id);
            return Ok(());
        }

        let mut result = Ok(());
        if let Some(handle) = self.exec.handle.take() {
            if self.exec.state == ExecutionState::Running {
                if let Err(source) = self.backend.terminate(&handle, TerminateMode::Force).await {
                    result = Err(CleanupError::Terminate {
                        handle: handle.to_string(),
                        source,
                    });
                }
            }
            if let Err(source) = self.backend.remove_resources(&handle).await {
                if result.is_ok() {
                    result = Err(CleanupError::RemoveResources {
                        handle: handle.to_string(),
                        source,
                    });
                }
            }
            self.forward_stderr(true).await;
        }

        if self.exec.state == ExecutionState::Running {
            self.exec.transition(ExecutionState::Failed);
        }
        self.exec.transition(ExecutionState::Cleaned);

        match result {
            Ok(()) => {
                info!("Runner {}: cleaned up", self.id);
                Ok(())
            }
            Err(e) => {
                warn!("Runner {}: cleanup failed: {}", self.id, e);
                Err(e)
            }
        }
    }

    fn state(&self) -> &ContainerExecutionState {
        &self.exec
    }
}
