//! Error types for reposync-sync.
//!
//! Variants that wrap a git failure carry a message that has already been
//! passed through [`crate::credentials::Redactor`]; nothing built from a raw
//! `git2::Error` leaves this crate unredacted.

use std::path::PathBuf;

use thiserror::Error;

use reposync_core::error::RegistryError;

/// All errors that can arise from clone and sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Clone-time network, auth, or URL failure.
    #[error("clone of {url} failed: {message}")]
    Clone { url: String, message: String },

    /// Fetch of the tracking branch failed; nothing local was touched.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Merging the tracking branch into the local branch failed.
    #[error("pull failed: {0}")]
    Pull(String),

    /// Pushing local commits failed.
    #[error("push failed: {0}")]
    Push(String),

    /// A true merge was needed and produced conflicts; the merge was aborted.
    #[error("merge with {tracking} produced conflicts in {} file(s); resolve manually", paths.len())]
    MergeConflict {
        tracking: String,
        paths: Vec<PathBuf>,
    },

    /// The remote URL embeds a credential; tokens come from the environment.
    #[error("remote URL {url} embeds credentials; remove them and set the token environment variable instead")]
    CredentialInUrl { url: String },

    /// There is no clone at the expected location.
    #[error("not cloned: no repository at {path}")]
    NotCloned { path: PathBuf },

    /// Neither a configured upstream nor `origin/<default_branch>` exists.
    #[error("branch '{branch}' has no remote tracking branch")]
    NoTrackingBranch { branch: String },

    /// HEAD does not point at a branch.
    #[error("HEAD is detached; check out a branch before syncing")]
    DetachedHead,

    /// Any other local git failure (open, status, revwalk, config).
    #[error("git error: {0}")]
    Git(String),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An error from the registry.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_conflict_message_counts_paths() {
        let err = SyncError::MergeConflict {
            tracking: "refs/remotes/origin/main".to_string(),
            paths: vec![PathBuf::from("a.md"), PathBuf::from("b.md")],
        };
        assert!(err.to_string().contains("2 file(s)"));
    }

    #[test]
    fn not_cloned_message() {
        let err = SyncError::NotCloned {
            path: PathBuf::from("/srv/repos/docs"),
        };
        assert!(err.to_string().starts_with("not cloned"));
    }
}
