//! Subcommand implementations

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use taskbox_foundation::{BackendKind, RunnerSettings, SettingsLoader};
use taskbox_task::{
    connect, HostResources, RunnerConfig, TaskContainerRunner, TaskContainerSpec,
    TerminationReason,
};
use tracing::{info, warn};

/// Exit status used when the task was cancelled (128 + SIGINT)
const EXIT_CANCELLED: i32 = 130;

pub struct RunOptions {
    pub spec_path: PathBuf,
    pub backend: Option<BackendKind>,
    pub image: Option<String>,
    pub timeout: Option<u64>,
}

fn load_settings(backend: Option<BackendKind>) -> Result<RunnerSettings> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let mut settings = SettingsLoader::new(&cwd)
        .load()
        .context("Failed to load settings")?;
    if let Some(kind) = backend {
        settings.backend = kind;
    }
    Ok(settings)
}

/// Read a spec file, resolving relative host paths against `base`
pub fn load_spec(path: &Path, base: &Path) -> Result<TaskContainerSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read spec file {}", path.display()))?;
    let mut spec: TaskContainerSpec = serde_json::from_str(&text)
        .with_context(|| format!("Invalid spec file {}", path.display()))?;

    if spec.working_directory.is_relative() {
        spec.working_directory = base.join(&spec.working_directory);
    }
    for mount in &mut spec.input_mounts {
        if mount.host_path.is_relative() {
            mount.host_path = base.join(&mount.host_path);
        }
    }
    Ok(spec)
}

/// Run one task; returns the process exit code
pub async fn run_task(options: RunOptions) -> Result<i32> {
    let settings = load_settings(options.backend)?;
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let mut spec = load_spec(&options.spec_path, &cwd)?;
    if let Some(image) = options.image {
        spec.image = Some(image);
    }
    if let Some(secs) = options.timeout {
        spec = spec.with_timeout(Duration::from_secs(secs));
    }

    let config = RunnerConfig::from(&settings);
    let backend = connect(config.backend, &config)?;
    info!("Using {} backend", backend.name());

    let mut runner = TaskContainerRunner::new(spec, backend, config);
    let token = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling task");
            token.cancel();
        }
    });

    match runner.run().await {
        Ok(report) => {
            if let Some(err) = report.cleanup_error {
                warn!("Cleanup failed: {}", err);
            }
            println!("{}", serde_json::to_string_pretty(&report.result)?);
            Ok(report.result.exit_code)
        }
        Err(failure) => {
            eprintln!("Task failed: {}", failure);
            if let Some(reason) = failure.termination_reason {
                eprintln!("  termination: {}", reason);
            }
            if let Some(code) = failure.exit_code {
                eprintln!("  exit code:   {}", code);
            }
            if let Some(ref path) = failure.stderr_path {
                eprintln!("  stderr:      {}", path.display());
            }
            if let Some(ref err) = failure.cleanup_error {
                eprintln!("  cleanup:     {}", err);
            }

            Ok(match failure.termination_reason {
                Some(TerminationReason::Cancelled) => EXIT_CANCELLED,
                _ => failure.exit_code.filter(|c| *c != 0).unwrap_or(1),
            })
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DetectReport {
    backend: &'static str,
    resources: HostResources,
}

/// Print the resources one container may receive
pub async fn detect(backend: Option<BackendKind>) -> Result<i32> {
    let settings = load_settings(backend)?;
    let config = RunnerConfig::from(&settings);
    let backend = connect(config.backend, &config)?;
    let resources = backend.detect_resource_limits().await?;

    let report = DetectReport {
        backend: backend.name(),
        resources,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_spec_resolves_relative_paths() {
        let dir = tempdir().unwrap();
        let spec_path = dir.path().join("task.json");
        std::fs::write(
            &spec_path,
            r#"{
                "workingDirectory": "runs/1",
                "inputMounts": [{ "hostPath": "data/in.txt", "containerPath": "/work/in.txt" }],
                "command": "cat /work/in.txt"
            }"#,
        )
        .unwrap();

        let spec = load_spec(&spec_path, dir.path()).unwrap();
        assert_eq!(spec.working_directory, dir.path().join("runs/1"));
        assert_eq!(spec.input_mounts[0].host_path, dir.path().join("data/in.txt"));
    }

    #[test]
    fn test_load_spec_rejects_garbage() {
        let dir = tempdir().unwrap();
        let spec_path = dir.path().join("task.json");
        std::fs::write(&spec_path, "{ not json").unwrap();
        assert!(load_spec(&spec_path, dir.path()).is_err());
    }
}
