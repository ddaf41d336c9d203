//! Docker Engine API backend (bollard)
//!
//! Images missing from the daemon are pulled on the first `404` from
//! create, matching what `docker run` does.

use super::r#trait::{
    BackendCapabilities, BackendHandle, BackendStatus, ContainerBackend, HostResources,
    Invocation, TerminateMode,
};
use super::{bind_spec, check_bind_paths};
use crate::error::BackendError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerState, ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use futures::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

const NAME: &str = "docker-api";

/// Backend talking to the Docker daemon over its API
pub struct DockerApiBackend {
    docker: Arc<Docker>,
}

impl DockerApiBackend {
    /// Connect with the local defaults (`DOCKER_HOST` or the unix socket)
    pub fn connect() -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BackendError::Unavailable(format!("cannot reach docker: {}", e)))?;
        Ok(Self {
            docker: Arc::new(docker),
        })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker: Arc::new(docker),
        }
    }

    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    /// Pull `image` into the daemon
    pub async fn pull_image(&self, image: &str) -> Result<(), BackendError> {
        let (from_image, tag) = split_image_tag(image);
        info!("Pulling image: {}", image);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        let progress: Vec<_> = self
            .docker
            .create_image(Some(options), None, None)
            .try_collect()
            .await
            .map_err(|e| pull_error(image, e))?;
        debug!("Pulled {} ({} progress messages)", image, progress.len());
        Ok(())
    }

    /// Create the container, pulling its image once if the daemon lacks it
    async fn create(&self, invocation: &Invocation) -> Result<String, BackendError> {
        let options = || CreateContainerOptions {
            name: invocation.name.clone(),
            ..Default::default()
        };
        let config = container_config(invocation);
        debug!("Creating container {}: {:?}", invocation.name, config);

        match self
            .docker
            .create_container(Some(options()), config.clone())
            .await
        {
            Ok(response) => return Ok(response.id),
            Err(e) if is_not_found(&e) => {
                info!("Image {} not present locally", invocation.image);
                self.pull_image(&invocation.image).await?;
            }
            Err(e) => return Err(start_error(e)),
        }

        self.docker
            .create_container(Some(options()), config)
            .await
            .map(|response| response.id)
            .map_err(start_error)
    }
}

/// Container configuration for an invocation
fn container_config(invocation: &Invocation) -> Config<String> {
    let env: Vec<String> = invocation
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    let binds: Vec<String> = invocation.mounts.iter().map(bind_spec).collect();
    let labels: HashMap<String, String> = invocation
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let limits = &invocation.limits;
    let host_config = HostConfig {
        binds: if binds.is_empty() { None } else { Some(binds) },
        auto_remove: Some(false),
        nano_cpus: limits.cpus.map(|c| (c as f64 * 1e9) as i64),
        memory: limits.memory_bytes.map(|m| m as i64),
        memory_reservation: limits.memory_reservation_bytes.map(|m| m as i64),
        pids_limit: limits.pids_limit.map(i64::from),
        ..Default::default()
    };

    Config {
        image: Some(invocation.image.clone()),
        working_dir: Some(invocation.layout.container_work().to_string_lossy().to_string()),
        user: invocation.user.clone(),
        env: Some(env),
        labels: if labels.is_empty() { None } else { Some(labels) },
        host_config: Some(host_config),
        cmd: Some(invocation.bootstrap_command()),
        ..Default::default()
    }
}

/// `repo[:tag]` split the way the image API expects; digests stay whole
fn split_image_tag(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    match image.rsplit_once(':') {
        // a colon before the last `/` belongs to a registry port
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

/// Classify a failed pull
fn pull_error(image: &str, err: DockerError) -> BackendError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404 | 403 | 401,
            message,
        } => BackendError::NotFound(format!("image {}: {}", image, message)),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } if status_code >= 500 => BackendError::Transient(message),
        DockerError::DockerResponseServerError { message, .. } => BackendError::Other(message),
        DockerError::DockerStreamError { error } => {
            BackendError::NotFound(format!("image {}: {}", image, error))
        }
        other => BackendError::Unavailable(other.to_string()),
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_not_modified(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

/// Classify an API error from `start`
fn start_error(err: DockerError) -> BackendError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 400,
            message,
        } => BackendError::InvalidMount(message),
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => BackendError::NotFound(format!("image not found: {}", message)),
        DockerError::DockerResponseServerError {
            status_code: 409,
            message,
        } => BackendError::Other(format!("name conflict: {}", message)),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } if status_code >= 500 => BackendError::Transient(message),
        DockerError::DockerResponseServerError { message, .. } => BackendError::Other(message),
        other => BackendError::Unavailable(other.to_string()),
    }
}

fn status_from_state(state: &ContainerState) -> BackendStatus {
    let exit_code = state.exit_code.unwrap_or(-1) as i32;
    match state.status {
        Some(ContainerStateStatusEnum::CREATED) => BackendStatus::Pending,
        Some(ContainerStateStatusEnum::RUNNING)
        | Some(ContainerStateStatusEnum::RESTARTING)
        | Some(ContainerStateStatusEnum::PAUSED) => BackendStatus::Running,
        Some(ContainerStateStatusEnum::REMOVING) | Some(ContainerStateStatusEnum::DEAD) => {
            BackendStatus::Killed { exit_code }
        }
        Some(ContainerStateStatusEnum::EXITED) => {
            let oom_killed = state.oom_killed.unwrap_or(false);
            if !oom_killed && exit_code == 137 {
                BackendStatus::Killed { exit_code }
            } else {
                BackendStatus::Exited {
                    exit_code,
                    oom_killed,
                }
            }
        }
        _ => {
            if state.running.unwrap_or(false) {
                BackendStatus::Running
            } else {
                BackendStatus::Pending
            }
        }
    }
}

#[async_trait]
impl ContainerBackend for DockerApiBackend {
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
        match self.docker.info().await {
            Ok(info) => {
                let host = HostResources::detect();
                Ok(HostResources {
                    cpus: info.ncpu.map(|n| n.max(1) as u32).unwrap_or(host.cpus),
                    memory_bytes: info
                        .mem_total
                        .map(|m| m.max(0) as u64)
                        .unwrap_or(host.memory_bytes),
                })
            }
            Err(e) => {
                debug!("docker info failed, using host resources: {}", e);
                Ok(HostResources::detect())
            }
        }
    }

    async fn start(&self, invocation: &Invocation) -> Result<BackendHandle, BackendError> {
        check_bind_paths(&invocation.mounts)?;
        let id = self.create(invocation).await?;

        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(rm) = self
                .docker
                .remove_container(&id, Some(options))
                .await
            {
                debug!("Failed to remove unstarted container {}: {}", id, rm);
            }
            return Err(start_error(e));
        }

        info!(
            "Started container {} ({}) from {}",
            invocation.name, id, invocation.image
        );
        Ok(BackendHandle::new(id, NAME))
    }

    async fn poll_status(&self, handle: &BackendHandle) -> Result<BackendStatus, BackendError> {
        match self
            .docker
            .inspect_container(handle.id(), None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(inspect
                .state
                .as_ref()
                .map(status_from_state)
                .unwrap_or(BackendStatus::Pending)),
            Err(e) if is_not_found(&e) => Ok(BackendStatus::Lost(format!(
                "container {} no longer exists",
                handle.id()
            ))),
            Err(e) => Err(BackendError::Transient(e.to_string())),
        }
    }

    async fn terminate(
        &self,
        handle: &BackendHandle,
        mode: TerminateMode,
    ) -> Result<(), BackendError> {
        let result = match mode {
            TerminateMode::Graceful { timeout } => {
                info!("Stopping container: {}", handle.id());
                self.docker
                    .stop_container(
                        handle.id(),
                        Some(StopContainerOptions {
                            t: timeout.as_secs() as i64,
                        }),
                    )
                    .await
            }
            TerminateMode::Force => {
                info!("Killing container: {}", handle.id());
                self.docker
                    .kill_container(handle.id(), None::<KillContainerOptions<String>>)
                    .await
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) || is_not_modified(&e) => Ok(()),
            // kill on a stopped container
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(BackendError::Other(e.to_string())),
        }
    }

    async fn remove_resources(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(handle.id(), Some(options)).await {
            Ok(()) => {
                info!("Removed container: {}", handle.id());
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(BackendError::Other(e.to_string())),
        }
    }
}
