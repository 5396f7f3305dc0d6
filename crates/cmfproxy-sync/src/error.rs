//! Error types for the sync pipeline
//!
//! Errors fall into two groups. Fatal errors (bad configuration, broken
//! checkpoint files) stop the daemon; everything else is scoped to a single
//! bundle and only withholds that bundle's checkpoint entry.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error type for the sync daemon
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration is missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// A checkpoint file could not be read or written
    #[error("Checkpoint {path}: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An identifier cannot be stored as one checkpoint line
    #[error("Invalid bundle reference {0:?}: must be a single non-empty line")]
    InvalidBundleRef(String),

    /// The telemetry query itself failed (distinct from an empty result)
    #[error("Telemetry query for node {node} failed: {message}")]
    Query { node: String, message: String },

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote answered with a non-success status
    #[error("Download of {url} failed with HTTP status {status}")]
    HttpStatus { url: String, status: u16 },

    /// Archive could not be unpacked
    #[error("Extraction of {archive} failed: {message}")]
    Extract { archive: PathBuf, message: String },

    /// An external command exited non-zero or could not be spawned
    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    /// An external operation exceeded its time budget
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// Local metadata store (ML-Metadata SQLite file) error
    #[error("Metadata store error: {0}")]
    MetadataStore(#[from] rusqlite::Error),

    /// Downloaded bundle is missing or fails its integrity check
    #[error("Local bundle {path} is unusable: {message}")]
    LocalBundle { path: PathBuf, message: String },

    /// File system operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a command failure
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Whether the error must stop the daemon rather than one bundle
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Config(_) | SyncError::Checkpoint { .. } | SyncError::InvalidBundleRef(_)
        )
    }
}

impl From<cmfproxy_common::CommonError> for SyncError {
    fn from(err: cmfproxy_common::CommonError) -> Self {
        use cmfproxy_common::CommonError;

        match err {
            CommonError::Io(e) => SyncError::Io(e),
            CommonError::ChecksumMismatch {
                path,
                expected,
                actual,
            } => SyncError::LocalBundle {
                path: PathBuf::from(path),
                message: format!("checksum mismatch (expected {}, got {})", expected, actual),
            },
            CommonError::MalformedSidecar(sidecar) => SyncError::LocalBundle {
                path: PathBuf::from(&sidecar),
                message: "malformed checksum sidecar".to_string(),
            },
        }
    }
}
