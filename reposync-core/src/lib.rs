//! reposync core library: domain types, registry persistence and settings.
//!
//! - [`types`]: [`RepositoryRecord`] and friends
//! - [`registry`]: the JSON-backed [`RepositoryRegistry`]
//! - [`config`]: `config.yaml` loading
//! - [`error`]: [`RegistryError`], [`ConfigError`]

pub mod config;
pub mod error;
pub mod registry;
pub mod types;

pub use config::Settings;
pub use error::{ConfigError, RegistryError};
pub use registry::{RepositoryRegistry, SharedRegistry};
pub use types::{
    NewRepository, RepoId, RepositoryRecord, RepositoryUpdate, SyncAttempt, SyncStatus,
};
