//! Config - runner settings
//!
//! - `settings.rs` - `RunnerSettings` model and environment overrides
//! - `loader.rs` - layered global/project/env loading

mod loader;
mod settings;

pub use loader::SettingsLoader;
pub use settings::{
    BackendKind, RetrySettings, RunnerSettings, RuntimeKind, SettingsFile, ENV_BACKEND,
    ENV_CONTAINER_DIR, ENV_COPY_INPUT_FILES, ENV_GRACE_PERIOD_SECS, ENV_IMAGE,
    ENV_POLL_INTERVAL_MS, SETTINGS_FILE,
};
