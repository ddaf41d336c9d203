//! Docker / Podman CLI backend
//!
//! `start` runs `docker create` to completion, so an unreachable daemon or a
//! missing image fails the launch, then attaches with `docker start -a` as a
//! child process per task. The CLI's own output goes to `backend.log` in the
//! working directory; the task's streams are redirected by the bootstrap
//! command into `stdout.txt`/`stderr.txt`.

use super::r#trait::{
    BackendCapabilities, BackendHandle, BackendStatus, ContainerBackend, HostResources,
    Invocation, TerminateMode,
};
use super::{bind_spec, check_bind_paths};
use crate::error::BackendError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use taskbox_foundation::RuntimeKind;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const NAME: &str = "docker-cli";

/// Exit status the CLI uses for its own failures
const RUNTIME_ERROR_EXIT: i32 = 125;

/// stderr fragments meaning the daemon / service could not be reached
const DAEMON_UNREACHABLE: &[&str] = &[
    "cannot connect to the docker daemon",
    "is the docker daemon running",
    "error during connect",
    "cannot connect to podman",
    "unable to connect to podman",
    "connection refused",
];

/// stderr fragments meaning the image cannot be obtained
const IMAGE_MISSING: &[&str] = &[
    "unable to find image",
    "pull access denied",
    "manifest unknown",
    "repository does not exist",
    "no such image",
    "image not known",
];

/// Attached `docker start -a` child of one container
struct CliProcess {
    child: Child,
    status: Option<BackendStatus>,
}

/// Backend shelling out to the `docker` or `podman` CLI
pub struct DockerCliBackend {
    runtime: RuntimeKind,
    /// CLI executable, `docker`/`podman` from PATH unless overridden
    program: PathBuf,
    /// Attached `start -a` processes by container name
    processes: Arc<RwLock<HashMap<String, Arc<Mutex<CliProcess>>>>>,
}

impl DockerCliBackend {
    pub fn new(runtime: RuntimeKind) -> Self {
        Self {
            runtime,
            program: PathBuf::from(runtime.command()),
            processes: Arc::new(RwLock::new(HashMap::with_capacity(4))),
        }
    }

    /// Use a specific CLI executable instead of looking it up in PATH
    pub fn with_program(runtime: RuntimeKind, program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::new(runtime)
        }
    }

    pub fn docker() -> Self {
        Self::new(RuntimeKind::Docker)
    }

    pub fn podman() -> Self {
        Self::new(RuntimeKind::Podman)
    }

    pub fn runtime(&self) -> RuntimeKind {
        self.runtime
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Whether the CLI answers `--version`
    pub async fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Arguments following the CLI executable for `create`
    pub fn build_create_args(&self, invocation: &Invocation) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            invocation.name.clone(),
            "--workdir".to_string(),
            invocation.layout.container_work().to_string_lossy().to_string(),
        ];

        if let Some(ref user) = invocation.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }

        let limits = &invocation.limits;
        if let Some(cpus) = limits.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(mem) = limits.memory_bytes {
            args.push("--memory".to_string());
            args.push(format!("{}b", mem));
        }
        if let Some(reservation) = limits.memory_reservation_bytes {
            args.push("--memory-reservation".to_string());
            args.push(format!("{}b", reservation));
        }
        if let Some(pids) = limits.pids_limit {
            args.push("--pids-limit".to_string());
            args.push(pids.to_string());
        }

        for (key, value) in &invocation.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &invocation.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for mount in &invocation.mounts {
            args.push("-v".to_string());
            args.push(bind_spec(mount));
        }

        args.push(invocation.image.clone());
        args.extend(invocation.bootstrap_command());
        args
    }

    /// Run a short CLI command to completion
    async fn cli<S: AsRef<str>>(&self, args: &[S]) -> Result<Output, BackendError> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        debug!("{} {}", self.program.display(), args.join(" "));
        Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error(&self.program, e))
    }

    /// Final state of a container whose attached process has exited
    async fn inspect_exit(&self, name: &str) -> Option<BackendStatus> {
        let output = match self
            .cli(&[
                "inspect",
                "--format",
                "{{.State.Status}} {{.State.ExitCode}} {{.State.OOMKilled}}",
                name,
            ])
            .await
        {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                debug!(
                    "inspect {} failed: {}",
                    name,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                return None;
            }
            Err(e) => {
                debug!("inspect {} failed: {}", name, e);
                return None;
            }
        };
        status_from_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    /// Best-effort removal of a created container that never ran
    async fn discard(&self, name: &str) {
        match self.cli(&["rm", "-f", name]).await {
            Ok(output) if output.status.success() || is_no_such_container(&output) => {}
            Ok(output) => warn!(
                "Failed to remove unstarted container {}: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("Failed to remove unstarted container {}: {}", name, e),
        }
    }

    async fn process(&self, name: &str) -> Option<Arc<Mutex<CliProcess>>> {
        self.processes.read().await.get(name).cloned()
    }
}

fn spawn_error(program: &Path, err: std::io::Error) -> BackendError {
    if err.kind() == std::io::ErrorKind::NotFound {
        BackendError::Unavailable(format!("{} not found", program.display()))
    } else {
        BackendError::Transient(format!("failed to spawn {}: {}", program.display(), err))
    }
}

/// Classify a failed `create`
fn create_error(output: &Output) -> BackendError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("create exited with {}", output.status)
    } else {
        stderr
    };
    let lower = message.to_ascii_lowercase();

    if DAEMON_UNREACHABLE.iter().any(|m| lower.contains(m)) {
        BackendError::Unavailable(message)
    } else if IMAGE_MISSING.iter().any(|m| lower.contains(m)) {
        BackendError::NotFound(message)
    } else if lower.contains("invalid mount") || lower.contains("invalid volume") {
        BackendError::InvalidMount(message)
    } else if lower.contains("already in use") {
        BackendError::Other(message)
    } else if output.status.code() == Some(RUNTIME_ERROR_EXIT) {
        BackendError::Transient(message)
    } else {
        BackendError::Other(message)
    }
}

/// Append a finished CLI call's output to `backend.log`
fn append_log(path: &Path, output: &Output) -> std::io::Result<()> {
    let mut log = OpenOptions::new().create(true).append(true).open(path)?;
    log.write_all(&output.stdout)?;
    log.write_all(&output.stderr)
}

/// Parse `<status> <exit code> <oom killed>` from `inspect`
fn status_from_inspect(text: &str) -> Option<BackendStatus> {
    let mut fields = text.split_whitespace();
    let status = fields.next()?;
    let exit_code = fields.next()?.parse::<i32>().ok()?;
    let oom_killed = fields.next() == Some("true");

    match status {
        "exited" | "stopped" => Some(status_from_exit(Some(exit_code), oom_killed)),
        "created" | "configured" => Some(BackendStatus::Lost(
            "container was never started, see backend.log".into(),
        )),
        _ => None,
    }
}

fn is_no_such_container(output: &Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr).to_ascii_lowercase();
    stderr.contains("no such container") || stderr.contains("no container with name")
}

/// Map a container exit code to a status
fn status_from_exit(code: Option<i32>, oom_killed: bool) -> BackendStatus {
    match code {
        Some(code) if oom_killed => BackendStatus::Exited {
            exit_code: code,
            oom_killed: true,
        },
        // 128 + SIGKILL
        Some(137) => BackendStatus::Killed { exit_code: 137 },
        Some(code) => BackendStatus::Exited {
            exit_code: code,
            oom_killed: false,
        },
        None => BackendStatus::Killed { exit_code: -1 },
    }
}

#[async_trait]
impl ContainerBackend for DockerCliBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            cpu_limit: true,
            memory_limit: true,
            memory_reservation: true,
            disk_limit: false,
            pids_limit: true,
            shared_filesystem: true,
        }
    }

    async fn detect_resource_limits(&self) -> Result<HostResources, BackendError> {
        let output = self
            .cli(&["info", "--format", "{{.NCPU}} {{.MemTotal}}"])
            .await?;
        if !output.status.success() {
            let host = HostResources::detect();
            debug!(
                "{} info failed, using host resources {:?}",
                self.program.display(),
                host
            );
            return Ok(host);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut fields = text.split_whitespace();
        match (
            fields.next().and_then(|c| c.parse::<u32>().ok()),
            fields.next().and_then(|m| m.parse::<u64>().ok()),
        ) {
            (Some(cpus), Some(memory_bytes)) => Ok(HostResources {
                cpus: cpus.max(1),
                memory_bytes,
            }),
            _ => Ok(HostResources::detect()),
        }
    }

    async fn start(&self, invocation: &Invocation) -> Result<BackendHandle, BackendError> {
        check_bind_paths(&invocation.mounts)?;
        let log_path = invocation.layout.host_backend_log();

        let args = self.build_create_args(invocation);
        info!(
            "Creating container {} with {}: {}",
            invocation.name,
            self.program.display(),
            invocation.image
        );
        // Pulls the image when missing; blocks until the container exists
        let created = self.cli(args.as_slice()).await?;
        append_log(&log_path, &created)?;
        if !created.status.success() {
            let err = create_error(&created);
            warn!("Failed to create container {}: {}", invocation.name, err);
            return Err(err);
        }

        let log = match OpenOptions::new().create(true).append(true).open(&log_path) {
            Ok(log) => log,
            Err(e) => {
                self.discard(&invocation.name).await;
                return Err(e.into());
            }
        };
        let log_err = match log.try_clone() {
            Ok(log_err) => log_err,
            Err(e) => {
                self.discard(&invocation.name).await;
                return Err(e.into());
            }
        };

        let spawned = Command::new(&self.program)
            .args(["start", "-a", invocation.name.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.discard(&invocation.name).await;
                return Err(spawn_error(&self.program, e));
            }
        };

        self.processes.write().await.insert(
            invocation.name.clone(),
            Arc::new(Mutex::new(CliProcess {
                child,
                status: None,
            })),
        );

        info!("Started container {}", invocation.name);
        Ok(BackendHandle::new(invocation.name.clone(), NAME))
    }

    async fn poll_status(&self, handle: &BackendHandle) -> Result<BackendStatus, BackendError> {
        let process = self
            .process(handle.id())
            .await
            .ok_or_else(|| BackendError::NotFound(handle.id().to_string()))?;
        let mut process = process.lock().await;

        if let Some(ref status) = process.status {
            return Ok(status.clone());
        }

        match process.child.try_wait()? {
            None => Ok(BackendStatus::Running),
            Some(exit) => {
                let status = match self.inspect_exit(handle.id()).await {
                    Some(status) => status,
                    None if exit.code() == Some(RUNTIME_ERROR_EXIT) => BackendStatus::Lost(
                        "container runtime failed to run the container, see backend.log".into(),
                    ),
                    None => status_from_exit(exit.code(), false),
                };
                debug!("Container {} finished: {:?}", handle.id(), status);
                process.status = Some(status.clone());
                Ok(status)
            }
        }
    }

    async fn terminate(
        &self,
        handle: &BackendHandle,
        mode: TerminateMode,
    ) -> Result<(), BackendError> {
        let output = match mode {
            TerminateMode::Graceful { timeout } => {
                info!("Stopping container: {}", handle.id());
                let secs = timeout.as_secs().to_string();
                self.cli(&["stop", "-t", secs.as_str(), handle.id()]).await?
            }
            TerminateMode::Force => {
                info!("Killing container: {}", handle.id());
                self.cli(&["kill", handle.id()]).await?
            }
        };

        if output.status.success() || is_no_such_container(&output) {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        // kill on an already stopped container
        if stderr.to_ascii_lowercase().contains("is not running") {
            return Ok(());
        }
        Err(BackendError::Other(stderr))
    }

    async fn remove_resources(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        let output = self.cli(&["rm", "-f", handle.id()]).await?;
        let removed = output.status.success() || is_no_such_container(&output);

        let process = self.processes.write().await.remove(handle.id());
        if let Some(process) = process {
            let mut process = process.lock().await;
            if process.status.is_none() {
                if let Err(e) = process.child.kill().await {
                    warn!("Failed to reap {} attach process: {}", handle.id(), e);
                }
            }
        }

        if removed {
            info!("Removed container: {}", handle.id());
            Ok(())
        } else {
            Err(BackendError::Other(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{BindMount, WorkLayout};
    use crate::spec::ResourceLimits;
    use std::collections::BTreeMap;

    fn invocation() -> Invocation {
        Invocation {
            name: "taskbox-abc".into(),
            image: "ubuntu:22.04".into(),
            layout: WorkLayout::new("/runs/1", "/mnt/taskbox"),
            mounts: vec![
                BindMount::new("/runs/1/stdout.txt", "/mnt/taskbox/stdout.txt", false),
                BindMount::new("/data/in.txt", "/work/in.txt", true),
            ],
            env: BTreeMap::from([("LANG".to_string(), "C".to_string())]),
            limits: ResourceLimits {
                cpus: Some(2.0),
                memory_bytes: Some(1 << 30),
                ..Default::default()
            },
            user: Some("1000:1000".into()),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_build_create_args() {
        let args = DockerCliBackend::docker().build_create_args(&invocation());

        assert_eq!(&args[..5], ["create", "--name", "taskbox-abc", "--workdir", "/mnt/taskbox/work"]);
        assert!(args.windows(2).any(|w| w == ["--user", "1000:1000"]));
        assert!(args.windows(2).any(|w| w == ["--cpus", "2"]));
        assert!(args.windows(2).any(|w| w == ["--memory", "1073741824b"]));
        assert!(args.windows(2).any(|w| w == ["-e", "LANG=C"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["-v", "/runs/1/stdout.txt:/mnt/taskbox/stdout.txt"]));
        assert!(args.windows(2).any(|w| w == ["-v", "/data/in.txt:/work/in.txt:ro"]));

        let image = args.iter().position(|a| a == "ubuntu:22.04").unwrap();
        assert_eq!(args[image + 1], "/bin/sh");
        assert_eq!(args.len(), image + 4);
    }

    #[test]
    fn test_status_from_exit() {
        assert_eq!(
            status_from_exit(Some(0), false),
            BackendStatus::Exited {
                exit_code: 0,
                oom_killed: false
            }
        );
        assert_eq!(
            status_from_exit(Some(137), true),
            BackendStatus::Exited {
                exit_code: 137,
                oom_killed: true
            }
        );
        assert_eq!(
            status_from_exit(Some(137), false),
            BackendStatus::Killed { exit_code: 137 }
        );
    }

    #[test]
    fn test_status_from_inspect() {
        assert_eq!(
            status_from_inspect("exited 3 false\n"),
            Some(BackendStatus::Exited {
                exit_code: 3,
                oom_killed: false
            })
        );
        assert_eq!(
            status_from_inspect("exited 137 true"),
            Some(BackendStatus::Exited {
                exit_code: 137,
                oom_killed: true
            })
        );
        assert!(matches!(
            status_from_inspect("created 0 false"),
            Some(BackendStatus::Lost(_))
        ));
        assert_eq!(status_from_inspect("running 0 false"), None);
        assert_eq!(status_from_inspect(""), None);
    }

    #[cfg(unix)]
    fn failed_output(code: i32, stderr: &str) -> Output {
        use std::os::unix::process::ExitStatusExt;
        Output {
            status: std::process::ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_create_error_classification() {
        let err = create_error(&failed_output(
            125,
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
        ));
        assert!(matches!(err, BackendError::Unavailable(_)));

        let err = create_error(&failed_output(
            125,
            "Unable to find image 'nope:1' locally\npull access denied for nope",
        ));
        assert!(matches!(err, BackendError::NotFound(_)));

        let err = create_error(&failed_output(
            125,
            "Conflict. The container name \"/taskbox-abc\" is already in use",
        ));
        assert!(matches!(err, BackendError::Other(_)));

        let err = create_error(&failed_output(125, "something odd"));
        assert!(err.is_transient());

        let err = create_error(&failed_output(1, ""));
        assert!(matches!(err, BackendError::Other(_)));
    }

    #[tokio::test]
    async fn test_start_rejects_colon_in_path() {
        let mut inv = invocation();
        inv.mounts.push(BindMount::new("/data/a:b.txt", "/work/ab.txt", true));

        let err = DockerCliBackend::docker().start(&inv).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidMount(_)));
    }

    #[test]
    fn test_program_defaults_to_runtime_command() {
        let backend = DockerCliBackend::podman();
        assert_eq!(backend.runtime(), RuntimeKind::Podman);
        assert_eq!(backend.program(), Path::new("podman"));

        let backend = DockerCliBackend::with_program(RuntimeKind::Docker, "/opt/bin/docker");
        assert_eq!(backend.program(), Path::new("/opt/bin/docker"));
    }

    #[tokio::test]
    async fn test_poll_unknown_handle() {
        let backend = DockerCliBackend::podman();
        let err = backend
            .poll_status(&BackendHandle::new("missing", NAME))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }
}
