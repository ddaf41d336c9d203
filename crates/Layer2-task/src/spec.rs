//! Task container specification
//!
//! `TaskContainerSpec` is the declarative description of one task: what to
//! run, which host files it reads, which files it is expected to produce,
//! and where its working directory lives on the host. It carries no
//! behaviour beyond validation.

use crate::error::SpecError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Command executed inside the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskCommand {
    /// Shell command text, run by `sh`
    Shell(String),
    /// Argument vector, shell-quoted into the command script
    Argv(Vec<String>),
}

impl TaskCommand {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Shell(text) => text.trim().is_empty(),
            Self::Argv(args) => args.first().map_or(true, |a| a.is_empty()),
        }
    }

    /// Render the command as shell script text
    pub fn to_script(&self) -> Result<String, SpecError> {
        match self {
            Self::Shell(text) => Ok(text.clone()),
            Self::Argv(args) => shlex::try_join(args.iter().map(String::as_str))
                .map_err(|e| SpecError::InvalidCommand(e.to_string())),
        }
    }
}

impl From<&str> for TaskCommand {
    fn from(text: &str) -> Self {
        Self::Shell(text.to_string())
    }
}

impl From<Vec<String>> for TaskCommand {
    fn from(args: Vec<String>) -> Self {
        Self::Argv(args)
    }
}

/// Host file or directory made visible inside the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(default = "default_read_only")]
    pub read_only: bool,
}

fn default_read_only() -> bool {
    true
}

impl InputMount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            read_only: true,
        }
    }

    pub fn writable(mut self) -> Self {
        self.read_only = false;
        self
    }
}

/// Resource limits for one container
///
/// Limits are advisory unless `strict` is set, in which case a backend that
/// cannot enforce one of the stated limits must refuse to launch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    /// CPU limit (number of cores, e.g., 1.5)
    pub cpus: Option<f32>,
    /// Hard memory limit in bytes; the backend kills the container above it
    pub memory_bytes: Option<u64>,
    /// Soft memory reservation in bytes
    pub memory_reservation_bytes: Option<u64>,
    /// Disk quota in bytes
    pub disk_bytes: Option<u64>,
    /// PIDs limit
    pub pids_limit: Option<u32>,
    /// Refuse to launch rather than drop an unsupported limit
    pub strict: bool,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.cpus.is_none()
            && self.memory_bytes.is_none()
            && self.memory_reservation_bytes.is_none()
            && self.disk_bytes.is_none()
            && self.pids_limit.is_none()
    }
}

/// Declarative description of one task invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContainerSpec {
    /// Host directory that becomes the container's writable work root
    pub working_directory: PathBuf,
    #[serde(default)]
    pub input_mounts: Vec<InputMount>,
    /// Container paths the task is expected to populate
    #[serde(default)]
    pub output_mounts: Vec<PathBuf>,
    pub command: TaskCommand,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,
    /// Container image; falls back to the runner's default image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl TaskContainerSpec {
    pub fn new(working_directory: impl Into<PathBuf>, command: impl Into<TaskCommand>) -> Self {
        Self {
            working_directory: working_directory.into(),
            input_mounts: Vec::new(),
            output_mounts: Vec::new(),
            command: command.into(),
            environment: BTreeMap::new(),
            resource_limits: None,
            image: None,
            timeout_secs: None,
        }
    }

    pub fn with_input(mut self, mount: InputMount) -> Self {
        self.input_mounts.push(mount);
        self
    }

    pub fn with_output(mut self, container_path: impl Into<PathBuf>) -> Self {
        self.output_mounts.push(container_path.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Check the spec without touching anything but `stat` on input paths
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.command.is_empty() {
            return Err(SpecError::EmptyCommand);
        }
        self.command.to_script()?;

        if !self.working_directory.is_absolute() {
            return Err(SpecError::RelativeWorkingDirectory(
                self.working_directory.clone(),
            ));
        }

        let mut seen = HashSet::with_capacity(self.input_mounts.len() + self.output_mounts.len());
        let container_paths = self
            .input_mounts
            .iter()
            .map(|m| &m.container_path)
            .chain(self.output_mounts.iter());
        for path in container_paths {
            let normalized = normalize_container_path(path)?;
            if !seen.insert(normalized.clone()) {
                return Err(SpecError::DuplicateMount(normalized));
            }
        }

        for mount in &self.input_mounts {
            if !mount.host_path.exists() {
                return Err(SpecError::PathNotFound(mount.host_path.clone()));
            }
        }

        Ok(())
    }
}

/// Lexically normalise an absolute container path (`.` dropped, `..` resolved)
pub fn normalize_container_path(path: &Path) -> Result<PathBuf, SpecError> {
    if !path.is_absolute() {
        return Err(SpecError::RelativeContainerPath(path.to_path_buf()));
    }

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(SpecError::PathEscapesRoot(path.to_path_buf()));
                }
            }
            Component::Normal(part) => parts.push(part),
        }
    }

    let mut normalized = PathBuf::from("/");
    normalized.extend(parts);
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_container_path() {
        assert_eq!(
            normalize_container_path(Path::new("/work/./a/../b.txt")).unwrap(),
            PathBuf::from("/work/b.txt")
        );
        assert_eq!(
            normalize_container_path(Path::new("/work/out/")).unwrap(),
            PathBuf::from("/work/out")
        );
        assert!(matches!(
            normalize_container_path(Path::new("work/b.txt")),
            Err(SpecError::RelativeContainerPath(_))
        ));
        assert!(matches!(
            normalize_container_path(Path::new("/../etc/passwd")),
            Err(SpecError::PathEscapesRoot(_))
        ));
    }

    #[test]
    fn test_validate_ok() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, "data").unwrap();

        let spec = TaskContainerSpec::new(dir.path().join("run"), "cat /work/in.txt")
            .with_input(InputMount::new(&input, "/work/in.txt"))
            .with_output("/work/out.txt");

        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_command() {
        let spec = TaskContainerSpec::new("/tmp/run", "   ");
        assert!(matches!(spec.validate(), Err(SpecError::EmptyCommand)));

        let spec = TaskContainerSpec::new("/tmp/run", Vec::<String>::new());
        assert!(matches!(spec.validate(), Err(SpecError::EmptyCommand)));
    }

    #[test]
    fn test_validate_missing_input() {
        let spec = TaskContainerSpec::new("/tmp/run", "true")
            .with_input(InputMount::new("/definitely/not/here.txt", "/work/in.txt"));
        assert!(matches!(spec.validate(), Err(SpecError::PathNotFound(_))));
    }

    #[test]
    fn test_validate_duplicate_between_input_and_output() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, "data").unwrap();

        let spec = TaskContainerSpec::new(dir.path(), "true")
            .with_input(InputMount::new(&input, "/work/x.txt"))
            .with_output("/work/./x.txt");

        match spec.validate() {
            Err(SpecError::DuplicateMount(path)) => assert_eq!(path, PathBuf::from("/work/x.txt")),
            other => panic!("expected DuplicateMount, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_relative_working_directory() {
        let spec = TaskContainerSpec::new("runs/1", "true");
        assert!(matches!(
            spec.validate(),
            Err(SpecError::RelativeWorkingDirectory(_))
        ));
    }

    #[test]
    fn test_argv_script_is_quoted() {
        let cmd = TaskCommand::Argv(vec!["echo".into(), "hello world".into()]);
        assert_eq!(cmd.to_script().unwrap(), "echo 'hello world'");
    }

    #[test]
    fn test_spec_from_json() {
        let spec: TaskContainerSpec = serde_json::from_str(
            r#"{
                "workingDirectory": "/runs/1",
                "inputMounts": [{ "hostPath": "/data/in.txt", "containerPath": "/work/in.txt" }],
                "outputMounts": ["/work/out.txt"],
                "command": ["wc", "-l", "/work/in.txt"],
                "environment": { "LANG": "C" },
                "resourceLimits": { "cpus": 2.0, "strict": true },
                "timeoutSecs": 60
            }"#,
        )
        .unwrap();

        assert!(spec.input_mounts[0].read_only);
        assert!(matches!(spec.command, TaskCommand::Argv(ref a) if a.len() == 3));
        assert_eq!(spec.timeout(), Some(Duration::from_secs(60)));
        assert!(spec.resource_limits.unwrap().strict);
    }
}
