use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the scheduler, daemon runtime and control protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry error: {0}")]
    Registry(#[from] reposync_core::RegistryError),

    #[error("config error: {0}")]
    Config(#[from] reposync_core::ConfigError),

    #[error("sync error: {0}")]
    Sync(#[from] reposync_sync::SyncError),

    #[error("reindex error: {0}")]
    Reindex(#[from] crate::reindex::ReindexError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("scheduler interval must be at least one second")]
    InvalidInterval,

    #[error("{task} task failed: {message}")]
    Task { task: &'static str, message: String },

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    /// The daemon understood the request and refused it.
    #[error("{0}")]
    Rejected(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },

    #[error("a daemon is already listening on {socket}")]
    AlreadyRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
