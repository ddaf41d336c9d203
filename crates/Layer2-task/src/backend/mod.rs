//! Container backends
//!
//! - `DockerCliBackend`: `docker run` / `podman run`
//! - `DockerApiBackend`: Docker Engine API via bollard
//! - `LocalProcessBackend`: plain host process, no isolation

mod docker_api;
mod docker_cli;
mod local;
pub mod r#trait;

pub use docker_api::DockerApiBackend;
pub use docker_cli::DockerCliBackend;
pub use local::LocalProcessBackend;
pub use r#trait::{
    BackendCapabilities, BackendHandle, BackendStatus, ContainerBackend, HostResources,
    Invocation, TerminateMode,
};

pub use crate::mapping::BindMount;

use crate::config::RunnerConfig;
use crate::error::BackendError;
use std::sync::Arc;
use taskbox_foundation::BackendKind;
use tracing::debug;

/// Build the backend selected by `kind`
pub fn connect(
    kind: BackendKind,
    config: &RunnerConfig,
) -> Result<Arc<dyn ContainerBackend>, BackendError> {
    debug!("Connecting backend: {}", kind);
    let backend: Arc<dyn ContainerBackend> = match kind {
        BackendKind::Local => Arc::new(LocalProcessBackend::new()),
        BackendKind::DockerCli => Arc::new(DockerCliBackend::new(config.runtime)),
        BackendKind::DockerApi => Arc::new(DockerApiBackend::connect()?),
    };
    Ok(backend)
}

/// `host:container[:ro]` bind specification
pub(crate) fn bind_spec(mount: &BindMount) -> String {
    let mut spec = format!(
        "{}:{}",
        mount.host_path.display(),
        mount.container_path.display()
    );
    if mount.read_only {
        spec.push_str(":ro");
    }
    spec
}

/// Bind specifications are `:`-separated, so neither side may contain one
pub(crate) fn check_bind_paths(mounts: &[BindMount]) -> Result<(), BackendError> {
    for mount in mounts {
        for path in [&mount.host_path, &mount.container_path] {
            if path.to_string_lossy().contains(':') {
                return Err(BackendError::InvalidMount(format!(
                    "path contains ':': {}",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}
