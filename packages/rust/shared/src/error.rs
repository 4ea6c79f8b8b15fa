//! Error types for Parley.
//!
//! Library crates use [`ParleyError`] via `thiserror`.
//! The binary wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Parley operations.
#[derive(Debug, thiserror::Error)]
pub enum ParleyError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Key-value store error (connection, query, migration).
    #[error("storage error: {0}")]
    Storage(String),

    /// Answer generation failed (transport, provider, or response parsing).
    #[error("{0}")]
    Generation(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Request or data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON encoding/decoding of persisted values.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ParleyError>;

impl ParleyError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a generation error from any displayable message.
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ParleyError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = ParleyError::validation("empty user id");
        assert!(err.to_string().contains("empty user id"));
    }

    #[test]
    fn generation_error_displays_bare_message() {
        // Surfaced verbatim inside "Error: <message>" answers.
        let err = ParleyError::generation("upstream returned 503");
        assert_eq!(err.to_string(), "upstream returned 503");
    }
}
