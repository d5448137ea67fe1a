//! Error types for tunebook.
//!
//! Library crates use [`TunebookError`] via `thiserror`.
//! The CLI app wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all tunebook operations.
#[derive(Debug, thiserror::Error)]
pub enum TunebookError {
    /// Configuration loading or validation error. Fatal to the run.
    #[error("config error: {message}")]
    Config { message: String },

    /// URL rejected by the fetch allow-list. Fatal to the single call only.
    #[error("policy violation: {0}")]
    Policy(String),

    /// Network fetch exhausted its retries. Per-item failure.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// HTML parsing returned unusable structure. Per-item failure.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Judge call failed (transport, refusal, or schema mismatch).
    /// Per-run failure, absorbed if other runs succeed.
    #[error("judge error: {0}")]
    Judge(String),

    /// Checkpoint database error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, contract violation).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TunebookError>;

impl TunebookError {
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

    /// True for errors that are caught at the per-item boundary and
    /// recorded in the checkpoint rather than aborting the run.
    pub fn is_item_scoped(&self) -> bool {
        matches!(
            self,
            Self::Policy(_) | Self::Fetch(_) | Self::Parse { .. } | Self::Judge(_)
        )
    }
}
