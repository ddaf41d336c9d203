//! Error types for Taskbox
//!
//! Shared error type for settings, storage and the outer surfaces.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Taskbox foundation error
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid environment override {name}={value}: {reason}")]
    EnvOverride {
        name: String,
        value: String,
        reason: String,
    },

    // ========================================================================
    // General
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // ========================================================================
    // External error conversions
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // Other
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error comes from user-supplied input
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::EnvOverride { .. }
                | Error::NotFound(_)
                | Error::InvalidInput(_)
                | Error::Validation(_)
        )
    }

    /// Helper for environment override errors
    pub fn env_override(
        name: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::EnvOverride {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing() {
        assert!(Error::Config("bad".into()).is_user_facing());
        assert!(Error::env_override("TASKBOX_BACKEND", "x", "unknown").is_user_facing());
        assert!(!Error::Internal("oops".into()).is_user_facing());
    }

    #[test]
    fn test_env_override_display() {
        let err = Error::env_override("TASKBOX_GRACE_PERIOD_SECS", "abc", "not a number");
        assert_eq!(
            err.to_string(),
            "Invalid environment override TASKBOX_GRACE_PERIOD_SECS=abc: not a number"
        );
    }
}
