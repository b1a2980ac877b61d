//! Error types for hdr-core operations.
//! Background pipeline code logs these and moves on; only explicit user
//! actions (save, reboot) hand them back to the caller.

use std::path::PathBuf;

/// All errors that can occur in hdr-core operations.
#[derive(Debug, thiserror::Error)]
pub enum HdrError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Module directory not found at {0}")]
    ModuleDirNotFound(PathBuf),

    #[error("Configuration file malformed: {path}: {source}")]
    ConfigMalformed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Package Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Package not installed: {0}")]
    UnknownPackage(String),

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Action Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Command execution failed: {command}: {details}")]
    CommandFailed { command: String, details: String },

    #[error("Selection save failed: {0}")]
    SaveFailed(String),
}

impl HdrError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        HdrError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using HdrError.
pub type Result<T> = std::result::Result<T, HdrError>;

impl From<HdrError> for String {
    fn from(err: HdrError) -> String {
        err.to_string()
    }
}
