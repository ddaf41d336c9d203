//! # taskbox-foundation
//!
//! Foundation layer for Taskbox:
//! - Error: shared error type
//! - Config: runner settings (backend selection, image, timing) loaded from
//!   JSON layers and `TASKBOX_*` environment overrides
//! - Storage: JSON file store

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    BackendKind, RetrySettings, RunnerSettings, RuntimeKind, SettingsFile, SettingsLoader,
};

// ============================================================================
// Storage
// ============================================================================
pub use storage::JsonStore;
