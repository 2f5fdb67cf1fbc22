//! Error types for the regulatory-truth pipeline.
//!
//! Library crates use [`RegTruthError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum RegTruthError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during discovery or fetch.
    #[error("network error: {0}")]
    Network(String),

    /// Listing or document parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (malformed content, invalid input, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A real (non-dry-run) backfill was requested while the kill switch is off.
    #[error("backfill is disabled: set {env_var}=true to enable non-dry-run execution")]
    KillSwitch { env_var: String },

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A lifecycle transition that the state machine forbids.
    #[error("invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RegTruthError>;

impl RegTruthError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a storage error from anything displayable (e.g. a libSQL error).
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = RegTruthError::config("missing sources");
        assert_eq!(err.to_string(), "config error: missing sources");

        let err = RegTruthError::validation("empty quote");
        assert!(err.to_string().contains("empty quote"));
    }

    #[test]
    fn kill_switch_names_the_flag() {
        let err = RegTruthError::KillSwitch {
            env_var: "REGTRUTH_BACKFILL_ENABLED".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("REGTRUTH_BACKFILL_ENABLED=true"));
    }
}
