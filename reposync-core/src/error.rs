//! Error types for reposync-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::RepoId;

/// All errors that can arise from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No record with this id.
    #[error("repository '{id}' not found")]
    NotFound { id: RepoId },

    /// `add` was called with an id that is already registered.
    #[error("repository '{id}' is already registered")]
    DuplicateId { id: RepoId },

    /// Another record already owns this clone location.
    #[error("local path {path} is already used by repository '{owner}'")]
    DuplicateLocalPath { path: PathBuf, owner: RepoId },

    /// One clone would sit inside the other's directory tree.
    #[error("local path {path} overlaps {owner_path}, the clone of repository '{owner}'")]
    OverlappingLocalPath {
        path: PathBuf,
        owner: RepoId,
        owner_path: PathBuf,
    },

    /// `local_path` must stay inside the repositories root.
    #[error("invalid local path {path:?}: must be a non-empty relative path without '..' components")]
    InvalidLocalPath { path: PathBuf },

    /// The backing store could not be read or written.
    #[error("registry store I/O error at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The backing store exists but is not valid JSON for the registry shape.
    #[error("failed to parse registry store at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// JSON serialization error (write path).
    #[error("registry serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A thread panicked while holding the shared registry lock.
    #[error("registry lock poisoned")]
    LockPoisoned,
}

/// Errors from loading `config.yaml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("scheduler.interval_minutes must be at least 1 (got {0})")]
    InvalidInterval(u64),

    #[error("scheduler author identity must have a non-empty name and email")]
    MissingIdentity,

    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

pub(crate) fn persistence_err(path: impl Into<PathBuf>, source: std::io::Error) -> RegistryError {
    RegistryError::Persistence {
        path: path.into(),
        source,
    }
}
