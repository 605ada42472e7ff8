//! Error types for configuration handling.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while editing or persisting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Port 0 is never a valid listen or target port.
    #[error("invalid port: {0}")]
    InvalidPort(u16),

    /// The requested target port is not a member of the target set.
    #[error("target port {port} is not configured (known: {known:?})")]
    UnknownTargetPort { port: u16, known: Vec<u16> },

    /// Filesystem access failed.
    #[error("config io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file exists but is not a valid record.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
