//! Settings loader
//!
//! ## Search order
//!
//! 1. Global: `<config_dir>/taskbox/settings.json`
//! 2. Project: `.taskbox/settings.json`
//! 3. Environment: `TASKBOX_*` variables
//!
//! Each layer overrides the ones before it.

use super::settings::{RunnerSettings, SettingsFile, SETTINGS_FILE};
use crate::storage::JsonStore;
use crate::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Layered settings loader
pub struct SettingsLoader {
    stores: Vec<(JsonStore, &'static str)>,
    read_env: bool,
}

impl SettingsLoader {
    /// Global and project stores plus environment overrides
    pub fn new(project_root: &Path) -> Self {
        let mut stores = Vec::new();
        if let Ok(global) = JsonStore::global() {
            stores.push((global, "Global settings"));
        }
        stores.push((JsonStore::project(project_root), "Project settings"));

        Self {
            stores,
            read_env: true,
        }
    }

    /// Explicit store directories, lowest priority first, no environment
    pub fn with_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            stores: dirs
                .into_iter()
                .map(|d| (JsonStore::new(d), "Custom settings"))
                .collect(),
            read_env: false,
        }
    }

    /// Toggle reading `TASKBOX_*` variables from the process environment
    pub fn read_env(mut self, enabled: bool) -> Self {
        self.read_env = enabled;
        self
    }

    /// Load and merge every layer, then validate
    pub fn load(&self) -> Result<RunnerSettings> {
        let mut settings = RunnerSettings::default();

        for (store, description) in &self.stores {
            if let Some(layer) = store.load_optional::<SettingsFile>(SETTINGS_FILE)? {
                info!(
                    "Loaded {} from: {}",
                    description,
                    store.file_path(SETTINGS_FILE).display()
                );
                settings.merge(layer);
            }
        }

        if self.read_env {
            settings.apply_env(std::env::vars())?;
        }

        settings.validate()?;
        debug!("Resolved runner settings: {:?}", settings);
        Ok(settings)
    }

    /// Settings files that currently exist
    pub fn existing_files(&self) -> Vec<PathBuf> {
        self.stores
            .iter()
            .map(|(store, _)| store.file_path(SETTINGS_FILE))
            .filter(|p| p.exists())
            .collect()
    }
}
