//! Runner settings
//!
//! Plain serde model of everything the surrounding system decides before a
//! task container is built: which backend to bind, the default image, and
//! the timing knobs for launch retries, polling and termination.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Settings file name inside a store directory
pub const SETTINGS_FILE: &str = "settings.json";

/// Environment variable selecting the backend
pub const ENV_BACKEND: &str = "TASKBOX_BACKEND";
/// Environment variable overriding the default image
pub const ENV_IMAGE: &str = "TASKBOX_IMAGE";
/// Environment variable overriding the in-container root directory
pub const ENV_CONTAINER_DIR: &str = "TASKBOX_CONTAINER_DIR";
/// Environment variable overriding the termination grace period
pub const ENV_GRACE_PERIOD_SECS: &str = "TASKBOX_GRACE_PERIOD_SECS";
/// Environment variable overriding the status poll interval
pub const ENV_POLL_INTERVAL_MS: &str = "TASKBOX_POLL_INTERVAL_MS";
/// Environment variable toggling input copies instead of bind mounts
pub const ENV_COPY_INPUT_FILES: &str = "TASKBOX_COPY_INPUT_FILES";

// ============================================================================
// Backend selection
// ============================================================================

/// Which container backend implementation to bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Plain host process, no isolation
    Local,
    /// `docker run` / `podman run` through the CLI
    #[default]
    DockerCli,
    /// Docker Engine API
    DockerApi,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::DockerCli => "docker-cli",
            Self::DockerApi => "docker-api",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "docker-cli" | "docker" | "podman" => Ok(Self::DockerCli),
            "docker-api" | "bollard" => Ok(Self::DockerApi),
            other => Err(Error::InvalidInput(format!("Unknown backend: {}", other))),
        }
    }
}

/// Container CLI flavour used by the CLI backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    Podman,
}

impl RuntimeKind {
    /// CLI executable name
    pub fn command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Retry knobs for one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

// ============================================================================
// RunnerSettings
// ============================================================================

/// Fully resolved runner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerSettings {
    pub backend: BackendKind,
    pub container_runtime: RuntimeKind,
    pub default_image: String,
    /// Absolute directory inside the container that mirrors the working directory
    pub container_dir: String,
    pub poll_interval_ms: u64,
    /// Upper bound on a single status poll
    pub poll_timeout_secs: u64,
    pub grace_period_secs: u64,
    pub launch_retry: RetrySettings,
    pub monitor_retry: RetrySettings,
    /// Run the container as the invoking uid so outputs stay owned by the caller
    pub run_as_invoking_user: bool,
    /// Copy inputs into the working directory instead of bind-mounting them
    pub copy_input_files: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            container_runtime: RuntimeKind::default(),
            default_image: "ubuntu:22.04".to_string(),
            container_dir: "/mnt/taskbox".to_string(),
            poll_interval_ms: 1000,
            poll_timeout_secs: 60,
            grace_period_secs: 10,
            launch_retry: RetrySettings::default(),
            monitor_retry: RetrySettings {
                max_retries: 5,
                initial_delay_ms: 250,
                ..RetrySettings::default()
            },
            run_as_invoking_user: true,
            copy_input_files: false,
        }
    }
}

/// One settings file layer; every field is optional so files only override
/// what they mention
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_runtime: Option<RuntimeKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_retry: Option<RetrySettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_retry: Option<RetrySettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_as_invoking_user: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy_input_files: Option<bool>,
}

impl RunnerSettings {
    /// Overlay a settings file (file values win)
    pub fn merge(&mut self, layer: SettingsFile) {
        if let Some(v) = layer.backend {
            self.backend = v;
        }
        if let Some(v) = layer.container_runtime {
            self.container_runtime = v;
        }
        if let Some(v) = layer.default_image {
            self.default_image = v;
        }
        if let Some(v) = layer.container_dir {
            self.container_dir = v;
        }
        if let Some(v) = layer.poll_interval_ms {
            self.poll_interval_ms = v;
        }
        if let Some(v) = layer.poll_timeout_secs {
            self.poll_timeout_secs = v;
        }
        if let Some(v) = layer.grace_period_secs {
            self.grace_period_secs = v;
        }
        if let Some(v) = layer.launch_retry {
            self.launch_retry = v;
        }
        if let Some(v) = layer.monitor_retry {
            self.monitor_retry = v;
        }
        if let Some(v) = layer.run_as_invoking_user {
            self.run_as_invoking_user = v;
        }
        if let Some(v) = layer.copy_input_files {
            self.copy_input_files = v;
        }
    }

    /// Apply `TASKBOX_*` overrides from the given variables
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                ENV_BACKEND => {
                    self.backend = value
                        .parse()
                        .map_err(|_| Error::env_override(key, value, "unknown backend"))?;
                }
                ENV_IMAGE => self.default_image = value.to_string(),
                ENV_CONTAINER_DIR => self.container_dir = value.to_string(),
                ENV_GRACE_PERIOD_SECS => {
                    self.grace_period_secs = parse_number(key, value)?;
                }
                ENV_POLL_INTERVAL_MS => {
                    self.poll_interval_ms = parse_number(key, value)?;
                }
                ENV_COPY_INPUT_FILES => {
                    self.copy_input_files = parse_flag(key, value)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Reject settings that cannot drive a runner
    pub fn validate(&self) -> Result<()> {
        if !self.container_dir.starts_with('/') {
            return Err(Error::Validation(format!(
                "containerDir must be absolute: {}",
                self.container_dir
            )));
        }
        if self.container_dir.trim_end_matches('/').is_empty() {
            return Err(Error::Validation(
                "containerDir cannot be the container root".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Validation(
                "pollIntervalMs must be greater than zero".to_string(),
            ));
        }
        if self.poll_timeout_secs == 0 {
            return Err(Error::Validation(
                "pollTimeoutSecs must be greater than zero".to_string(),
            ));
        }
        if self.default_image.trim().is_empty() {
            return Err(Error::Validation("defaultImage cannot be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::env_override(key, value, "expected a non-negative integer"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::env_override(key, value, "expected true or false")),
    }
}
