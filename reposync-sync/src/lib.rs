//! # reposync-sync
//!
//! Clone, fetch, pull and push for registered repositories.
//!
//! [`SyncEngine::sync`] reconciles one clone with its remote and records the
//! outcome in the registry; [`SyncEngine::register`] clones before adding a
//! record. Credentials flow through [`CredentialProvider`] and every message
//! leaving the engine passes through a [`Redactor`].

pub mod credentials;
pub mod engine;
pub mod error;
pub mod git;

pub use credentials::{CredentialProvider, NoCredentials, Redactor, TokenCredentials};
pub use engine::{
    CloneOutcome, EngineConfig, OutcomeStatus, RepoStatus, RepositorySyncer, SyncEngine,
    SyncOutcome,
};
pub use error::SyncError;
