//! Domain types for the repository registry.
//!
//! `local_path` is always stored relative to the configured repositories root;
//! resolve it with [`crate::registry::RepositoryRegistry::clone_path`].
//! All types are serializable/deserializable via serde + serde_json.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Globally unique, immutable identifier of a managed repository
/// (conventionally `owner/name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(pub String);

impl RepoId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RepoId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RepoId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Outcome of the most recent sync attempt, as persisted on the record.
///
/// `Conflict` is terminal until someone resolves the divergence by hand; the
/// next attempt after that moves the record back to `Synced` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Never,
    Pending,
    Synced,
    Error,
    Conflict,
    Unavailable,
}

impl SyncStatus {
    /// Statuses that must carry an `error_message`.
    pub fn requires_message(self) -> bool {
        matches!(self, SyncStatus::Error | SyncStatus::Conflict)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Never => "never",
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// One managed repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub id: RepoId,
    pub name: String,
    pub owner: String,
    pub remote_url: String,
    /// Relative to the repositories root.
    pub local_path: PathBuf,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for [`crate::registry::RepositoryRegistry::add`]. The registry owns
/// `sync_status`, `last_synced`, `error_message` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRepository {
    pub id: RepoId,
    pub name: String,
    pub owner: String,
    pub remote_url: String,
    pub local_path: PathBuf,
    pub enabled: bool,
    pub read_only: bool,
    pub default_branch: String,
}

impl NewRepository {
    /// Defaults mirror a freshly discovered repository: disabled, read-only,
    /// tracking `main`, cloned to `<owner>/<name>`.
    pub fn new(id: impl Into<RepoId>, remote_url: impl Into<String>) -> Self {
        let id = id.into();
        let (owner, name) = match id.0.split_once('/') {
            Some((owner, name)) => (owner.to_string(), name.to_string()),
            None => (String::new(), id.0.clone()),
        };
        Self {
            local_path: PathBuf::from(&id.0),
            id,
            name,
            owner,
            remote_url: remote_url.into(),
            enabled: false,
            read_only: true,
            default_branch: default_branch(),
        }
    }

    pub fn into_record(self, created_at: DateTime<Utc>) -> RepositoryRecord {
        RepositoryRecord {
            id: self.id,
            name: self.name,
            owner: self.owner,
            remote_url: self.remote_url,
            local_path: self.local_path,
            enabled: self.enabled,
            read_only: self.read_only,
            default_branch: self.default_branch,
            last_synced: None,
            sync_status: SyncStatus::Never,
            error_message: None,
            created_at,
        }
    }
}

/// The allow-listed mutable fields. Anything else on a record is immutable
/// from the outside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl RepositoryUpdate {
    pub fn is_empty(&self) -> bool {
        self.enabled.is_none() && self.read_only.is_none() && self.name.is_none()
    }
}

/// What a finished sync attempt writes back to its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncAttempt {
    pub status: SyncStatus,
    pub message: Option<String>,
    /// `None` leaves `last_synced` untouched.
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncAttempt {
    pub fn synced(at: DateTime<Utc>) -> Self {
        Self {
            status: SyncStatus::Synced,
            message: None,
            finished_at: Some(at),
        }
    }

    pub fn failed(message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: SyncStatus::Error,
            message: Some(message.into()),
            finished_at: Some(at),
        }
    }

    /// Conflicts keep the previous `last_synced`: nothing was applied.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::Conflict,
            message: Some(message.into()),
            finished_at: None,
        }
    }
}

/// On-disk shape of the registry store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub repositories: std::collections::BTreeMap<RepoId, RepositoryRecord>,
}

fn default_branch() -> String {
    "main".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
