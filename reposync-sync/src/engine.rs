//! `SyncEngine` brings one local clone into agreement with its remote.
//!
//! Conflicts are reported, never resolved: local uncommitted work plus
//! unpulled remote commits stops the attempt before anything is touched.
//! Every attempt, successful or not, is written back through
//! [`RepositoryRegistry::record_attempt`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use git2::Signature;
use serde::{Deserialize, Serialize};

use reposync_core::registry::{self, RepositoryRegistry, SharedRegistry};
use reposync_core::{NewRepository, RepoId, RepositoryRecord, Settings, SyncAttempt};

use crate::credentials::{
    has_embedded_credential, CredentialProvider, NoCredentials, Redactor, TokenCredentials,
};
use crate::error::{io_err, SyncError};
use crate::git::{set_transport_timeout, GitRepo, MergeOutcome, Network, ORIGIN};

/// Message recorded when local edits and remote commits coexist.
pub const CONFLICT_MESSAGE: &str = "Cannot sync: repository has both local uncommitted changes \
                                    and remote updates. Please resolve manually.";

/// Engine-wide settings applied to every managed repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub author_name: String,
    pub author_email: String,
    /// Deadline for one clone or fetch.
    pub network_timeout: Duration,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            author_name: settings.scheduler.author_name.clone(),
            author_email: settings.scheduler.author_email.clone(),
            network_timeout: settings.network.timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Error,
    Conflict,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Error => "error",
            OutcomeStatus::Conflict => "conflict",
        })
    }
}

/// Result of one `sync` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub repository: RepoId,
    pub status: OutcomeStatus,
    pub message: String,
    pub commits_pulled: usize,
    pub commits_pushed: usize,
    pub files_changed: usize,
    /// Redacted failure text; set for `error` and `conflict`.
    pub error_message: Option<String>,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// An `error` outcome that never reached git, e.g. a panicked worker.
    pub fn failure(
        repository: RepoId,
        message: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            status: OutcomeStatus::Error,
            message: message.into(),
            commits_pulled: 0,
            commits_pushed: 0,
            files_changed: 0,
            error_message: Some(detail.into()),
        }
    }
}

/// Read-only view of a clone, computed without touching the network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatus {
    pub exists: bool,
    pub has_local_changes: bool,
    pub ahead_of_remote: usize,
    pub behind_of_remote: usize,
    pub current_branch: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneOutcome {
    Cloned,
    AlreadyPresent,
}

/// Anything that can sync one repository. The scheduler drives this trait so
/// tests can substitute a fake.
pub trait RepositorySyncer: Send + Sync {
    fn sync(&self, record: &RepositoryRecord) -> SyncOutcome;
}

/// Cached per-repository state: the opened repository, behind a mutex that
/// also guarantees one sync per repository at a time.
#[derive(Default)]
struct RepoHandle {
    repo: Mutex<Option<GitRepo>>,
}

#[derive(Default)]
struct Progress {
    pulled: usize,
    pushed: usize,
    files_changed: usize,
}

enum Completion {
    Synced,
    /// Local changes and remote commits coexist; nothing was applied.
    Conflict,
}

pub struct SyncEngine {
    registry: SharedRegistry,
    credentials: Arc<dyn CredentialProvider>,
    redactor: Redactor,
    config: EngineConfig,
    handles: Mutex<HashMap<RepoId, Arc<RepoHandle>>>,
}

impl SyncEngine {
    pub fn new(
        registry: SharedRegistry,
        config: EngineConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let redactor = Redactor::for_provider(credentials.as_ref());
        if let Err(err) = set_transport_timeout(config.network_timeout) {
            tracing::warn!(error = %err, "could not apply network timeout to git transport");
        }
        Self {
            registry,
            credentials,
            redactor,
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Open the registry named by `settings` and pick credentials from the
    /// environment.
    pub fn from_settings(home: &Path, settings: &Settings) -> Result<Self, SyncError> {
        let registry = RepositoryRegistry::open(
            settings.registry_path_at(home),
            settings.repositories_root_at(home),
        )?
        .into_shared();
        let credentials: Arc<dyn CredentialProvider> =
            match TokenCredentials::from_settings(&settings.github) {
                Some(token) => Arc::new(token),
                None => Arc::new(NoCredentials),
            };
        Ok(Self::new(
            registry,
            EngineConfig::from_settings(settings),
            credentials,
        ))
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    fn network(&self) -> Network<'_> {
        Network {
            credentials: self.credentials.as_ref(),
            deadline: Some(Instant::now() + self.config.network_timeout),
        }
    }

    fn clone_path(&self, record: &RepositoryRecord) -> Result<PathBuf, SyncError> {
        Ok(registry::lock(&self.registry)?.clone_path(record))
    }

    fn handle(&self, id: &RepoId) -> Arc<RepoHandle> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(handles.entry(id.clone()).or_default())
    }

    /// Drop the cached handle for `id`. The next sync reopens from disk.
    pub fn forget(&self, id: &RepoId) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if handles.remove(id).is_some() {
            tracing::debug!(repo = %id, "dropped repository handle");
        }
    }

    // -- clone --------------------------------------------------------------

    /// Clone `record` unless a clone already exists at its path.
    pub fn clone_repository(&self, record: &RepositoryRecord) -> Result<CloneOutcome, SyncError> {
        let dest = self.clone_path(record)?;
        if GitRepo::is_clone(&dest) {
            tracing::debug!(repo = %record.id, path = %dest.display(), "clone already present");
            return Ok(CloneOutcome::AlreadyPresent);
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        tracing::info!(repo = %record.id, path = %dest.display(), "cloning repository");
        GitRepo::clone_remote(&record.remote_url, &dest, &record.default_branch, self.network())
            .map_err(|e| SyncError::Clone {
                url: self.redactor.redact(&record.remote_url),
                message: self.redactor.redact(e.message()),
            })?;
        Ok(CloneOutcome::Cloned)
    }

    // -- sync ---------------------------------------------------------------

    /// Run one sync attempt and record its result in the registry.
    pub fn sync(&self, record: &RepositoryRecord) -> SyncOutcome {
        let started = Instant::now();
        let handle = self.handle(&record.id);
        let mut slot = handle.repo.lock().unwrap_or_else(PoisonError::into_inner);

        let mut progress = Progress::default();
        let result = self.attempt(record, &mut slot, &mut progress);
        drop(slot);

        let outcome = self.conclude(record, result, progress);
        tracing::info!(
            repo = %record.id,
            status = %outcome.status,
            pulled = outcome.commits_pulled,
            pushed = outcome.commits_pushed,
            files = outcome.files_changed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sync finished"
        );
        outcome
    }

    fn attempt(
        &self,
        record: &RepositoryRecord,
        slot: &mut Option<GitRepo>,
        progress: &mut Progress,
    ) -> Result<Completion, SyncError> {
        let path = self.clone_path(record)?;
        if !GitRepo::is_clone(&path) {
            *slot = None;
            return Err(SyncError::NotCloned { path });
        }
        let repo = match slot.take() {
            Some(repo) => repo,
            None => GitRepo::open(&path).map_err(|e| self.git_err(e))?,
        };
        let repo = slot.insert(repo);

        repo.configure_identity(&self.config.author_name, &self.config.author_email)
            .map_err(|e| self.git_err(e))?;
        repo.set_remote_url(ORIGIN, &record.remote_url)
            .map_err(|e| self.git_err(e))?;

        let branch = repo
            .current_branch()
            .map_err(|e| self.git_err(e))?
            .ok_or(SyncError::DetachedHead)?;
        if branch != record.default_branch {
            tracing::warn!(
                repo = %record.id,
                branch = %branch,
                expected = %record.default_branch,
                "clone is not on its default branch"
            );
        }

        let tracking = repo.tracking_ref(&branch, &record.default_branch);
        let remote_branch = tracking
            .strip_prefix(&format!("refs/remotes/{ORIGIN}/"))
            .unwrap_or(&record.default_branch)
            .to_string();
        tracing::debug!(repo = %record.id, tracking = %tracking, "fetching");
        repo.fetch(ORIGIN, &remote_branch, self.network())
            .map_err(|e| SyncError::Fetch(self.redactor.redact(e.message())))?;

        let has_local_changes = repo.has_local_changes().map_err(|e| self.git_err(e))?;
        let local_tip = repo
            .resolve(&format!("refs/heads/{branch}"))
            .map_err(|e| self.git_err(e))?;
        let tracking_tip = repo
            .resolve(&tracking)
            .map_err(|e| self.git_err(e))?
            .ok_or_else(|| SyncError::NoTrackingBranch {
                branch: branch.clone(),
            })?;
        let Some(local_tip) = local_tip else {
            return Err(SyncError::Git(format!("branch '{branch}' has no commits")));
        };

        let divergence = repo
            .divergence(local_tip, tracking_tip)
            .map_err(|e| self.git_err(e))?;
        tracing::debug!(
            repo = %record.id,
            ahead = divergence.ahead,
            behind = divergence.behind,
            has_local_changes,
            "computed divergence"
        );

        if has_local_changes && divergence.behind > 0 {
            return Ok(Completion::Conflict);
        }

        let mut ahead = divergence.ahead;
        if divergence.behind > 0 {
            let author = Signature::now(&self.config.author_name, &self.config.author_email)
                .map_err(|e| self.git_err(e))?;
            let merged = repo
                .integrate(&branch, tracking_tip, &author)
                .map_err(|e| SyncError::Pull(self.redactor.redact(e.message())))?;
            match merged {
                MergeOutcome::Conflicted { paths } => {
                    return Err(SyncError::MergeConflict { tracking, paths });
                }
                MergeOutcome::FastForward { files_changed } => {
                    progress.files_changed = files_changed;
                }
                MergeOutcome::Merged { files_changed } => {
                    progress.files_changed = files_changed;
                    // The merge commit itself is now unpushed too.
                    ahead += 1;
                }
                MergeOutcome::UpToDate => {}
            }
            progress.pulled = divergence.behind;
        }

        if ahead > 0 {
            if record.read_only {
                tracing::debug!(repo = %record.id, ahead, "read-only; skipping push");
            } else {
                repo.push(ORIGIN, &branch, self.network())
                    .map_err(|e| SyncError::Push(self.redactor.redact(e.message())))?;
                progress.pushed = ahead;
            }
        }

        Ok(Completion::Synced)
    }

    fn git_err(&self, e: git2::Error) -> SyncError {
        SyncError::Git(self.redactor.redact(e.message()))
    }

    /// Turn an attempt into an outcome and persist it.
    fn conclude(
        &self,
        record: &RepositoryRecord,
        result: Result<Completion, SyncError>,
        progress: Progress,
    ) -> SyncOutcome {
        let now = Utc::now();
        let (status, message, error_message, attempt) = match result {
            Ok(Completion::Synced) => {
                let message = if progress.pulled == 0 && progress.pushed == 0 {
                    "Repository is up to date".to_string()
                } else {
                    format!(
                        "Synced successfully: {} pulled, {} pushed",
                        progress.pulled, progress.pushed
                    )
                };
                (OutcomeStatus::Success, message, None, SyncAttempt::synced(now))
            }
            Ok(Completion::Conflict) => {
                tracing::warn!(repo = %record.id, "local changes and remote commits; not syncing");
                (
                    OutcomeStatus::Conflict,
                    "Conflict detected: local and remote changes present".to_string(),
                    Some(CONFLICT_MESSAGE.to_string()),
                    SyncAttempt::conflict(CONFLICT_MESSAGE),
                )
            }
            Err(err @ SyncError::MergeConflict { .. }) => {
                let detail = self.redactor.redact(&err.to_string());
                (
                    OutcomeStatus::Conflict,
                    "Merge produced conflicts".to_string(),
                    Some(detail.clone()),
                    SyncAttempt::conflict(detail),
                )
            }
            Err(err) => {
                let detail = self.redactor.redact(&err.to_string());
                tracing::error!(repo = %record.id, error = %detail, "sync failed");
                (
                    OutcomeStatus::Error,
                    failure_summary(&err).to_string(),
                    Some(detail.clone()),
                    SyncAttempt::failed(detail, now),
                )
            }
        };

        if let Err(err) = self.persist(&record.id, attempt) {
            tracing::error!(repo = %record.id, error = %err, "failed to record sync result");
        }

        SyncOutcome {
            repository: record.id.clone(),
            status,
            message,
            commits_pulled: progress.pulled,
            commits_pushed: progress.pushed,
            files_changed: progress.files_changed,
            error_message,
        }
    }

    fn persist(&self, id: &RepoId, attempt: SyncAttempt) -> Result<(), SyncError> {
        registry::lock(&self.registry)?.record_attempt(id, attempt)?;
        Ok(())
    }

    // -- status -------------------------------------------------------------

    /// Inspect the clone without fetching. Unreadable clones report
    /// `exists: false`.
    pub fn status(&self, record: &RepositoryRecord) -> RepoStatus {
        let Ok(path) = self.clone_path(record) else {
            return RepoStatus::default();
        };
        if !GitRepo::is_clone(&path) {
            return RepoStatus::default();
        }
        match inspect(&path, &record.default_branch) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(
                    repo = %record.id,
                    error = %self.redactor.redact(e.message()),
                    "could not inspect clone"
                );
                RepoStatus {
                    exists: true,
                    ..RepoStatus::default()
                }
            }
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Clone, then register. Nothing is registered if the clone fails.
    ///
    /// A `remote_url` carrying credentials is refused before anything is
    /// cloned or stored.
    pub fn register(&self, new: NewRepository) -> Result<RepositoryRecord, SyncError> {
        if has_embedded_credential(&new.remote_url) {
            return Err(SyncError::CredentialInUrl {
                url: self.redactor.redact(&new.remote_url),
            });
        }
        let new = registry::lock(&self.registry)?.claim(new)?;
        let candidate = new.clone().into_record(Utc::now());
        self.clone_repository(&candidate)?;
        let record = registry::lock(&self.registry)?.add(new)?;
        Ok(record)
    }

    /// Drop the cached handle, then delete the clone and the record.
    pub fn unregister(&self, id: &RepoId) -> Result<RepositoryRecord, SyncError> {
        let handle = self.handle(id);
        // Wait out any sync in flight on this repository.
        let _guard = handle.repo.lock().unwrap_or_else(PoisonError::into_inner);
        self.forget(id);
        let removed = registry::lock(&self.registry)?.remove(id)?;
        Ok(removed)
    }
}

impl RepositorySyncer for SyncEngine {
    fn sync(&self, record: &RepositoryRecord) -> SyncOutcome {
        SyncEngine::sync(self, record)
    }
}

fn inspect(path: &Path, default_branch: &str) -> Result<RepoStatus, git2::Error> {
    let repo = GitRepo::open(path)?;
    let current_branch = repo.current_branch()?;
    let mut status = RepoStatus {
        exists: true,
        has_local_changes: repo.has_local_changes()?,
        current_branch: current_branch.clone(),
        ..RepoStatus::default()
    };
    if let Some(branch) = current_branch {
        let tracking = repo.tracking_ref(&branch, default_branch);
        if let (Some(local), Some(remote)) = (
            repo.resolve(&format!("refs/heads/{branch}"))?,
            repo.resolve(&tracking)?,
        ) {
            let divergence = repo.divergence(local, remote)?;
            status.ahead_of_remote = divergence.ahead;
            status.behind_of_remote = divergence.behind;
        }
    }
    Ok(status)
}

fn failure_summary(err: &SyncError) -> &'static str {
    match err {
        SyncError::NotCloned { .. } => "not cloned",
        SyncError::Fetch(_) => "Fetch failed",
        SyncError::Pull(_) => "Pull failed",
        SyncError::Push(_) => "Push failed",
        SyncError::NoTrackingBranch { .. } => "No tracking branch configured",
        SyncError::Registry(_) => "Registry update failed",
        _ => "Git operation failed",
    }
}
