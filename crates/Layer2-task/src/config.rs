//! Runner configuration

use crate::retry::RetryConfig;
use std::path::PathBuf;
use std::time::Duration;
use taskbox_foundation::{BackendKind, RunnerSettings, RuntimeKind};

/// Typed configuration handed to every `TaskContainerRunner`
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Backend bound by `backend::connect`
    pub backend: BackendKind,
    /// CLI flavour for the docker-cli backend
    pub runtime: RuntimeKind,
    /// Image used when the spec names none
    pub default_image: String,
    /// Directory inside the container mirroring the working directory
    pub container_dir: PathBuf,
    /// Interval between backend status polls
    pub poll_interval: Duration,
    /// Longest a single status poll may take before it counts as failed
    pub poll_timeout: Duration,
    /// Time allowed between a graceful stop and a forced kill
    pub grace_period: Duration,
    /// Retries for `start` while launching
    pub launch_retry: RetryConfig,
    /// Retries for consecutive failed status polls
    pub monitor_retry: RetryConfig,
    /// Run the container as the invoking uid:gid
    pub run_as_invoking_user: bool,
    /// Copy inputs into the working directory instead of bind-mounting them
    pub copy_input_files: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from(&RunnerSettings::default())
    }
}

impl From<&RunnerSettings> for RunnerConfig {
    fn from(settings: &RunnerSettings) -> Self {
        Self {
            backend: settings.backend,
            runtime: settings.container_runtime,
            default_image: settings.default_image.clone(),
            container_dir: PathBuf::from(&settings.container_dir),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            poll_timeout: Duration::from_secs(settings.poll_timeout_secs.max(1)),
            grace_period: Duration::from_secs(settings.grace_period_secs),
            launch_retry: RetryConfig::from(&settings.launch_retry),
            monitor_retry: RetryConfig::from(&settings.monitor_retry),
            run_as_invoking_user: settings.run_as_invoking_user,
            copy_input_files: settings.copy_input_files,
        }
    }
}

impl RunnerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_launch_retry(mut self, retry: RetryConfig) -> Self {
        self.launch_retry = retry;
        self
    }

    pub fn with_monitor_retry(mut self, retry: RetryConfig) -> Self {
        self.monitor_retry = retry;
        self
    }

    pub fn with_container_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.container_dir = dir.into();
        self
    }

    pub fn with_copy_input_files(mut self, enabled: bool) -> Self {
        self.copy_input_files = enabled;
        self
    }

    /// `uid:gid` to run as, when enabled and known
    pub fn container_user(&self) -> Option<String> {
        if !self.run_as_invoking_user {
            return None;
        }
        current_ids().map(|(uid, gid)| format!("{}:{}", uid, gid))
    }
}

#[cfg(unix)]
fn current_ids() -> Option<(u32, u32)> {
    // SAFETY: getuid/getgid have no preconditions and cannot fail
    Some(unsafe { (libc::getuid(), libc::getgid()) })
}

#[cfg(not(unix))]
fn current_ids() -> Option<(u32, u32)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_settings() {
        let settings = RunnerSettings {
            poll_interval_ms: 250,
            grace_period_secs: 2,
            ..Default::default()
        };
        let config = RunnerConfig::from(&settings);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.grace_period, Duration::from_secs(2));
        assert_eq!(config.container_dir, PathBuf::from("/mnt/taskbox"));
        assert_eq!(config.monitor_retry.max_retries, 5);
        assert_eq!(config.poll_timeout, Duration::from_secs(60));
        assert!(!config.copy_input_files);
    }

    #[test]
    fn test_container_user_disabled() {
        let config = RunnerConfig {
            run_as_invoking_user: false,
            ..Default::default()
        };
        assert!(config.container_user().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_container_user_is_uid_and_gid() {
        let config = RunnerConfig {
            run_as_invoking_user: true,
            ..Default::default()
        };
        let user = config.container_user().unwrap();
        // SAFETY: see current_ids
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        assert_eq!(user, format!("{}:{}", uid, gid));
    }
}
