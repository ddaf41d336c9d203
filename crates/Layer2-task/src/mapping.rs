//! Path mapping between the container and the host
//!
//! The working directory on the host mirrors a fixed directory inside the
//! container (`container_dir`, e.g. `/mnt/taskbox`):
//!
//! ```text
//! <working_dir>/command       <container_dir>/command      (ro)
//! <working_dir>/stdout.txt    <container_dir>/stdout.txt   (rw)
//! <working_dir>/stderr.txt    <container_dir>/stderr.txt   (rw)
//! <working_dir>/work/         <container_dir>/work/        (rw, cwd)
//! <working_dir>/root/<p>      /<p> for paths outside <container_dir>
//! ```
//!
//! Inputs are mapped in place: the host file is bind-mounted at its
//! container path, and an empty mount point is created at the mirrored
//! location so it is owned by the invoking user. With `copy_inputs` the
//! file is copied to the mirrored location instead, and only copies outside
//! the work directory need a mount of their own. Outputs resolve to the
//! mirrored host path. The mapping is a pure function of the working
//! directory, `container_dir` and the container path.
//!
//! Outputs outside the work directory get their parent directory mounted
//! from the host, so a parent that is a system directory (`/etc`,
//! `/usr/local`, ...) is refused rather than hidden from the task.

use crate::error::SpecError;
use crate::spec::{normalize_container_path, TaskContainerSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

pub const COMMAND_FILE: &str = "command";
pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";
pub const WORK_DIR: &str = "work";
pub const BACKEND_LOG_FILE: &str = "backend.log";
/// Host-side home of container paths outside `container_dir`
pub const OUTSIDE_ROOT_DIR: &str = "root";

/// Image directories an output directory mount must never replace
const SYSTEM_DIRS: &[&str] = &[
    "/bin",
    "/boot",
    "/etc",
    "/home",
    "/lib",
    "/lib32",
    "/lib64",
    "/libx32",
    "/opt",
    "/root",
    "/run",
    "/sbin",
    "/srv",
    "/usr",
    "/usr/bin",
    "/usr/include",
    "/usr/lib",
    "/usr/lib64",
    "/usr/libexec",
    "/usr/local",
    "/usr/local/bin",
    "/usr/local/lib",
    "/usr/local/share",
    "/usr/sbin",
    "/usr/share",
    "/var",
    "/var/lib",
    "/var/log",
    "/var/run",
];

/// Kernel-provided trees; nothing below them may be mounted over
const SYSTEM_TREES: &[&str] = &["/dev", "/proc", "/sys"];

fn is_system_dir(dir: &Path) -> bool {
    SYSTEM_DIRS.iter().any(|d| dir == Path::new(d))
        || SYSTEM_TREES.iter().any(|t| dir.starts_with(t))
}

/// Fixed files and directories of one task's working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkLayout {
    pub host_dir: PathBuf,
    pub container_dir: PathBuf,
}

impl WorkLayout {
    pub fn new(host_dir: impl Into<PathBuf>, container_dir: impl Into<PathBuf>) -> Self {
        Self {
            host_dir: host_dir.into(),
            container_dir: container_dir.into(),
        }
    }

    pub fn host_command(&self) -> PathBuf {
        self.host_dir.join(COMMAND_FILE)
    }

    pub fn host_stdout(&self) -> PathBuf {
        self.host_dir.join(STDOUT_FILE)
    }

    pub fn host_stderr(&self) -> PathBuf {
        self.host_dir.join(STDERR_FILE)
    }

    pub fn host_work(&self) -> PathBuf {
        self.host_dir.join(WORK_DIR)
    }

    /// Output of the backend tool itself (e.g. `docker run`)
    pub fn host_backend_log(&self) -> PathBuf {
        self.host_dir.join(BACKEND_LOG_FILE)
    }

    pub fn container_command(&self) -> PathBuf {
        self.container_dir.join(COMMAND_FILE)
    }

    pub fn container_stdout(&self) -> PathBuf {
        self.container_dir.join(STDOUT_FILE)
    }

    pub fn container_stderr(&self) -> PathBuf {
        self.container_dir.join(STDERR_FILE)
    }

    pub fn container_work(&self) -> PathBuf {
        self.container_dir.join(WORK_DIR)
    }

    /// Mirrored host path of a normalised absolute container path
    pub fn host_path_for(&self, container_path: &Path) -> PathBuf {
        match container_path.strip_prefix(&self.container_dir) {
            Ok(rel) if rel.as_os_str().is_empty() => self.host_dir.clone(),
            Ok(rel) => self.host_dir.join(rel),
            Err(_) => {
                let rel = container_path.strip_prefix("/").unwrap_or(container_path);
                self.host_dir.join(OUTSIDE_ROOT_DIR).join(rel)
            }
        }
    }

    fn reserved(&self) -> [PathBuf; 6] {
        [
            self.container_dir.clone(),
            self.container_command(),
            self.container_stdout(),
            self.container_stderr(),
            self.container_work(),
            self.container_dir.join(BACKEND_LOG_FILE),
        ]
    }
}

/// One bind mount as a backend realises it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

impl BindMount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            read_only,
        }
    }
}

/// Resolved input mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMapping {
    pub container_path: PathBuf,
    /// Canonical host source
    pub host_path: PathBuf,
    /// Empty placeholder under the working directory
    pub mount_point: PathBuf,
    pub read_only: bool,
    pub is_dir: bool,
}

/// Resolved output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMapping {
    pub container_path: PathBuf,
    pub host_path: PathBuf,
}

/// Every path of one task, ready to hand to a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedPaths {
    pub layout: WorkLayout,
    pub inputs: Vec<InputMapping>,
    pub outputs: Vec<OutputMapping>,
    /// Writable directories holding outputs that live outside the work dir
    pub output_dirs: Vec<BindMount>,
    /// Inputs are copied into the working directory, not bind-mounted
    #[serde(default)]
    pub copy_inputs: bool,
}

impl MappedPaths {
    /// Mounts in realisation order: task streams, work dir, command,
    /// output directories, inputs
    ///
    /// Copied inputs under the work directory are already visible and get
    /// no mount; copies elsewhere are mounted from their host location.
    pub fn bind_mounts(&self) -> Vec<BindMount> {
        let layout = &self.layout;
        let mut mounts = vec![
            BindMount::new(layout.host_stdout(), layout.container_stdout(), false),
            BindMount::new(layout.host_stderr(), layout.container_stderr(), false),
            BindMount::new(layout.host_work(), layout.container_work(), false),
            BindMount::new(layout.host_command(), layout.container_command(), true),
        ];
        mounts.extend(self.output_dirs.iter().cloned());
        if self.copy_inputs {
            let work = layout.container_work();
            mounts.extend(
                self.inputs
                    .iter()
                    .filter(|i| !i.container_path.starts_with(&work))
                    .map(|i| BindMount::new(&i.mount_point, &i.container_path, i.read_only)),
            );
        } else {
            mounts.extend(
                self.inputs
                    .iter()
                    .map(|i| BindMount::new(&i.host_path, &i.container_path, i.read_only)),
            );
        }
        mounts
    }

    pub fn output_host_path(&self, container_path: &Path) -> Option<&Path> {
        self.outputs
            .iter()
            .find(|o| o.container_path == container_path)
            .map(|o| o.host_path.as_path())
    }

    /// Create the working directory layout on the host
    ///
    /// Writes the command script, creates empty `stdout.txt`/`stderr.txt`,
    /// and touches every mount point and output directory. With
    /// `copy_inputs` each input is copied to its mount point instead.
    pub fn materialize(&self, script: &str) -> io::Result<()> {
        let layout = &self.layout;
        fs::create_dir_all(layout.host_work())?;
        fs::write(layout.host_command(), script)?;
        fs::File::create(layout.host_stdout())?;
        fs::File::create(layout.host_stderr())?;

        for dir in &self.output_dirs {
            fs::create_dir_all(&dir.host_path)?;
        }
        for output in &self.outputs {
            if let Some(parent) = output.host_path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        for input in &self.inputs {
            if self.copy_inputs {
                copy_input(&input.host_path, &input.mount_point)?;
            } else {
                touch_mount_point(&input.mount_point, input.is_dir)?;
            }
        }
        Ok(())
    }
}

fn copy_input(source: &Path, dest: &Path) -> io::Result<()> {
    if source == dest {
        return Ok(());
    }
    if source.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_input(&entry.path(), &dest.join(entry.file_name()))?;
        }
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, dest).map(|_| ())
}

fn touch_mount_point(path: &Path, is_dir: bool) -> io::Result<()> {
    if is_dir {
        return fs::create_dir_all(path);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Maps a spec's mounts onto its working directory
#[derive(Debug, Clone)]
pub struct PathMapper {
    container_dir: PathBuf,
    copy_inputs: bool,
}

impl PathMapper {
    pub fn new(container_dir: impl Into<PathBuf>) -> Self {
        Self {
            container_dir: container_dir.into(),
            copy_inputs: false,
        }
    }

    /// Copy inputs into the working directory instead of bind-mounting them
    pub fn with_copy_inputs(mut self, enabled: bool) -> Self {
        self.copy_inputs = enabled;
        self
    }

    pub fn layout_for(&self, spec: &TaskContainerSpec) -> WorkLayout {
        WorkLayout::new(&spec.working_directory, &self.container_dir)
    }

    /// Host path an output container path resolves to
    pub fn resolve_output(
        &self,
        spec: &TaskContainerSpec,
        container_path: &Path,
    ) -> Result<PathBuf, SpecError> {
        let normalized = normalize_container_path(container_path)?;
        Ok(self.layout_for(spec).host_path_for(&normalized))
    }

    /// Resolve every declared input and output
    ///
    /// Fails with `MountCollision` when two logical mounts (including the
    /// reserved layout entries) land on the same host path.
    pub fn map(&self, spec: &TaskContainerSpec) -> Result<MappedPaths, SpecError> {
        let layout = self.layout_for(spec);
        let mut claims = CollisionSet::default();

        for reserved in layout.reserved() {
            claims.claim(layout.host_path_for(&reserved), &reserved)?;
        }

        let mut inputs = Vec::with_capacity(spec.input_mounts.len());
        for mount in &spec.input_mounts {
            let container_path = normalize_container_path(&mount.container_path)?;
            let host_path = fs::canonicalize(&mount.host_path)
                .map_err(|_| SpecError::PathNotFound(mount.host_path.clone()))?;
            let mount_point = layout.host_path_for(&container_path);

            claims.claim(mount_point.clone(), &container_path)?;
            if host_path != mount_point {
                claims.claim(host_path.clone(), &container_path)?;
            }

            inputs.push(InputMapping {
                is_dir: host_path.is_dir(),
                container_path,
                host_path,
                mount_point,
                read_only: mount.read_only,
            });
        }

        let mut outputs = Vec::with_capacity(spec.output_mounts.len());
        for path in &spec.output_mounts {
            let container_path = normalize_container_path(path)?;
            let parent = match container_path.parent() {
                Some(parent) if parent != Path::new("/") => parent,
                _ => return Err(SpecError::OutputAtRoot(container_path)),
            };
            if !parent.starts_with(layout.container_work()) && is_system_dir(parent) {
                return Err(SpecError::OutputShadowsSystemDir {
                    dir: parent.to_path_buf(),
                    output: container_path,
                });
            }
            let host_path = layout.host_path_for(&container_path);
            claims.claim(host_path.clone(), &container_path)?;
            outputs.push(OutputMapping {
                container_path,
                host_path,
            });
        }

        let output_dirs = output_dir_mounts(&layout, &outputs);

        Ok(MappedPaths {
            layout,
            inputs,
            outputs,
            output_dirs,
            copy_inputs: self.copy_inputs,
        })
    }
}

/// Parent directories of outputs not already visible through the work dir,
/// with nested directories folded into their outermost ancestor
fn output_dir_mounts(layout: &WorkLayout, outputs: &[OutputMapping]) -> Vec<BindMount> {
    let work = layout.container_work();
    let mut dirs: Vec<PathBuf> = outputs
        .iter()
        .filter_map(|o| o.container_path.parent())
        .filter(|parent| !parent.starts_with(&work))
        .map(Path::to_path_buf)
        .collect();
    dirs.sort();
    dirs.dedup();

    let mut kept: Vec<PathBuf> = Vec::with_capacity(dirs.len());
    for dir in dirs {
        if !kept.iter().any(|k| dir.starts_with(k)) {
            kept.push(dir);
        }
    }

    kept.into_iter()
        .map(|dir| BindMount::new(layout.host_path_for(&dir), dir, false))
        .collect()
}

#[derive(Default)]
struct CollisionSet {
    owners: HashMap<PathBuf, PathBuf>,
}

impl CollisionSet {
    fn claim(&mut self, host_path: PathBuf, container_path: &Path) -> Result<(), SpecError> {
        if let Some(first) = self.owners.get(&host_path) {
            return Err(SpecError::MountCollision {
                first: first.clone(),
                second: container_path.to_path_buf(),
                host_path,
            });
        }
        self.owners.insert(host_path, container_path.to_path_buf());
        Ok(())
    }
}
