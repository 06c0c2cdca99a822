//! Thin wrapper over `git2` for the operations a sync needs.
//!
//! Everything here returns raw `git2::Error`; callers redact before the text
//! goes anywhere else.

use std::ffi::c_int;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    AnnotatedCommit, ConfigLevel, Cred, CredentialType, ErrorCode, FetchOptions, Oid,
    PushOptions, RemoteCallbacks, Repository, ResetType, Signature, StatusOptions,
};

use crate::credentials::CredentialProvider;

pub const ORIGIN: &str = "origin";

static TRANSPORT_TIMEOUT: Mutex<()> = Mutex::new(());

/// Bound libgit2's socket connect and per-read/write waits by `timeout`.
///
/// The progress-callback deadline only fires once data flows; these limits
/// also cover a server that accepts and then never answers. They are
/// process-wide, so the most recently built engine wins. Zero leaves
/// libgit2's defaults in place.
pub fn set_transport_timeout(timeout: Duration) -> Result<(), git2::Error> {
    if timeout.is_zero() {
        return Ok(());
    }
    let millis = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);
    let _serialized = TRANSPORT_TIMEOUT
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    // SAFETY: both options are plain integers libgit2 reads when it opens a
    // connection; concurrent writers are serialized by the lock above.
    unsafe {
        git2::opts::set_server_connect_timeout_in_milliseconds(millis)?;
        git2::opts::set_server_timeout_in_milliseconds(millis)?;
    }
    Ok(())
}

/// Auth and deadline for one network operation.
#[derive(Clone, Copy)]
pub struct Network<'a> {
    pub credentials: &'a dyn CredentialProvider,
    /// Transfers still running at this instant are aborted.
    pub deadline: Option<Instant>,
}

impl<'a> Network<'a> {
    fn callbacks(&self, url: &str) -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        let credential = self.credentials.credentials_for(url);
        let mut attempts = 0u8;
        callbacks.credentials(move |_url, username_from_url, allowed| {
            // libgit2 keeps asking while we keep answering; a second request
            // means the first answer was rejected.
            attempts += 1;
            if attempts > 1 {
                return Err(git2::Error::from_str("authentication rejected by remote"));
            }
            match &credential {
                Some(c) if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) => {
                    Cred::userpass_plaintext(&c.username, c.secret())
                }
                _ if allowed.contains(CredentialType::SSH_KEY) => {
                    Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"))
                }
                _ if allowed.contains(CredentialType::DEFAULT) => Cred::default(),
                _ => Err(git2::Error::from_str("no credentials available for remote")),
            }
        });
        if let Some(deadline) = self.deadline {
            callbacks.transfer_progress(move |_| Instant::now() < deadline);
        }
        callbacks
    }

    fn fetch_options(&self, url: &str) -> FetchOptions<'a> {
        let mut options = FetchOptions::new();
        options.remote_callbacks(self.callbacks(url));
        options
    }
}

/// Counts of commits unique to each side of a local/tracking pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Divergence {
    pub ahead: usize,
    pub behind: usize,
}

/// How a pull landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    UpToDate,
    FastForward { files_changed: usize },
    Merged { files_changed: usize },
    /// The merge was aborted and the working tree restored to HEAD.
    Conflicted { paths: Vec<PathBuf> },
}

pub struct GitRepo {
    repo: Repository,
}

impl GitRepo {
    /// True when `path` is the working tree of a non-bare repository.
    pub fn is_clone(path: &Path) -> bool {
        Repository::open(path)
            .map(|repo| !repo.is_bare())
            .unwrap_or(false)
    }

    pub fn open(path: &Path) -> Result<Self, git2::Error> {
        Ok(Self {
            repo: Repository::open(path)?,
        })
    }

    /// Clone `url` at `branch` into `dest`. The remote URL is stored as given.
    pub fn clone_remote(
        url: &str,
        dest: &Path,
        branch: &str,
        network: Network<'_>,
    ) -> Result<Self, git2::Error> {
        let repo = RepoBuilder::new()
            .branch(branch)
            .fetch_options(network.fetch_options(url))
            .clone(url, dest)?;
        Ok(Self { repo })
    }

    /// Write author identity into the repository-local config.
    pub fn configure_identity(&self, name: &str, email: &str) -> Result<(), git2::Error> {
        let mut config = self.repo.config()?.open_level(ConfigLevel::Local)?;
        config.set_str("user.name", name)?;
        config.set_str("user.email", email)?;
        Ok(())
    }

    /// Point `remote` at `url`, creating it if missing.
    pub fn set_remote_url(&self, remote: &str, url: &str) -> Result<(), git2::Error> {
        match self.repo.find_remote(remote) {
            Ok(existing) if existing.url() == Some(url) => Ok(()),
            Ok(_) => self.repo.remote_set_url(remote, url),
            Err(e) if e.code() == ErrorCode::NotFound => self.repo.remote(remote, url).map(|_| ()),
            Err(e) => Err(e),
        }
    }

    /// Fetch `branch` from `remote` into `refs/remotes/<remote>/<branch>`.
    pub fn fetch(
        &self,
        remote: &str,
        branch: &str,
        network: Network<'_>,
    ) -> Result<(), git2::Error> {
        let mut remote = self.repo.find_remote(remote)?;
        let url = remote.url().unwrap_or_default().to_string();
        let name = remote.name().unwrap_or(ORIGIN).to_string();
        let refspec = format!("+refs/heads/{branch}:refs/remotes/{name}/{branch}");
        remote.fetch(&[refspec.as_str()], Some(&mut network.fetch_options(&url)), None)
    }

    /// Push `branch` to the same name on `remote`. A rejected ref is an error.
    pub fn push(
        &self,
        remote: &str,
        branch: &str,
        network: Network<'_>,
    ) -> Result<(), git2::Error> {
        let mut remote = self.repo.find_remote(remote)?;
        let url = remote.url().unwrap_or_default().to_string();
        let mut callbacks = network.callbacks(&url);
        callbacks.push_update_reference(|refname, status| match status {
            Some(reason) => Err(git2::Error::from_str(&format!("{refname} rejected: {reason}"))),
            None => Ok(()),
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote.push(&[refspec.as_str()], Some(&mut options))
    }

    /// Tracked files modified in the index or working tree.
    pub fn is_dirty(&self) -> Result<bool, git2::Error> {
        let mut options = StatusOptions::new();
        options
            .include_untracked(false)
            .include_ignored(false)
            .exclude_submodules(true);
        let statuses = self.repo.statuses(Some(&mut options))?;
        Ok(statuses.iter().any(|entry| !entry.status().is_empty()))
    }

    /// Paths not tracked and not ignored.
    pub fn untracked_files(&self) -> Result<Vec<PathBuf>, git2::Error> {
        let mut options = StatusOptions::new();
        options
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false)
            .exclude_submodules(true);
        let statuses = self.repo.statuses(Some(&mut options))?;
        Ok(statuses
            .iter()
            .filter(|entry| entry.status().is_wt_new())
            .filter_map(|entry| entry.path().map(PathBuf::from))
            .collect())
    }

    pub fn has_local_changes(&self) -> Result<bool, git2::Error> {
        Ok(self.is_dirty()? || !self.untracked_files()?.is_empty())
    }

    /// Name of the checked-out branch; `None` when HEAD is detached.
    pub fn current_branch(&self) -> Result<Option<String>, git2::Error> {
        let head = match self.repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch => {
                // HEAD names a branch with no commits yet.
                let head = self.repo.find_reference("HEAD")?;
                return Ok(head
                    .symbolic_target()
                    .and_then(|t| t.strip_prefix("refs/heads/"))
                    .map(str::to_string));
            }
            Err(e) => return Err(e),
        };
        if head.is_branch() {
            Ok(head.shorthand().map(str::to_string))
        } else {
            Ok(None)
        }
    }

    /// Remote-tracking ref for `branch`: its configured upstream if that lives
    /// on `origin`, otherwise `refs/remotes/origin/<fallback>`.
    pub fn tracking_ref(&self, branch: &str, fallback: &str) -> String {
        let local = format!("refs/heads/{branch}");
        let prefix = format!("refs/remotes/{ORIGIN}/");
        self.repo
            .branch_upstream_name(&local)
            .ok()
            .and_then(|buf| buf.as_str().map(str::to_string))
            .filter(|name| name.starts_with(&prefix))
            .unwrap_or_else(|| format!("{prefix}{fallback}"))
    }

    /// Resolve a full ref name; `None` when it does not exist.
    pub fn resolve(&self, refname: &str) -> Result<Option<Oid>, git2::Error> {
        match self.repo.refname_to_id(refname) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Most recent common ancestor; `None` for unrelated histories.
    pub fn merge_base(&self, a: Oid, b: Oid) -> Result<Option<Oid>, git2::Error> {
        match self.repo.merge_base(a, b) {
            Ok(base) => Ok(Some(base)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Commits reachable from `tip` but not from `base`.
    pub fn commits_between(&self, base: Option<Oid>, tip: Oid) -> Result<usize, git2::Error> {
        let mut walk = self.repo.revwalk()?;
        walk.push(tip)?;
        if let Some(base) = base {
            walk.hide(base)?;
        }
        let mut count = 0;
        for oid in walk {
            oid?;
            count += 1;
        }
        Ok(count)
    }

    /// Ahead/behind of `local` relative to `tracking`, bounded by their merge base.
    pub fn divergence(&self, local: Oid, tracking: Oid) -> Result<Divergence, git2::Error> {
        if local == tracking {
            return Ok(Divergence::default());
        }
        let base = self.merge_base(local, tracking)?;
        Ok(Divergence {
            ahead: self.commits_between(base, local)?,
            behind: self.commits_between(base, tracking)?,
        })
    }

    /// Bring `branch` (checked out) up to `target`, fast-forwarding when
    /// possible and committing a merge as `author` otherwise.
    pub fn integrate(
        &self,
        branch: &str,
        target: Oid,
        author: &Signature<'_>,
    ) -> Result<MergeOutcome, git2::Error> {
        let incoming = self.repo.find_annotated_commit(target)?;
        let (analysis, _) = self.repo.merge_analysis(&[&incoming])?;
        if analysis.is_up_to_date() {
            return Ok(MergeOutcome::UpToDate);
        }

        let head_commit = self.repo.head()?.peel_to_commit()?;
        let old_tree = head_commit.tree()?;

        if analysis.is_fast_forward() {
            let mut reference = self.repo.find_reference(&format!("refs/heads/{branch}"))?;
            reference.set_target(target, &format!("reposync: fast-forward to {target}"))?;
            self.repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
            let new_tree = self.repo.find_commit(target)?.tree()?;
            return Ok(MergeOutcome::FastForward {
                files_changed: self.files_between(&old_tree, &new_tree)?,
            });
        }

        self.merge_commit(branch, &incoming, &head_commit, author)
    }

    fn merge_commit(
        &self,
        branch: &str,
        incoming: &AnnotatedCommit<'_>,
        head_commit: &git2::Commit<'_>,
        author: &Signature<'_>,
    ) -> Result<MergeOutcome, git2::Error> {
        self.repo.merge(&[incoming], None, None)?;

        let mut index = self.repo.index()?;
        if index.has_conflicts() {
            let paths = conflicted_paths(&index)?;
            self.repo.cleanup_state()?;
            self.repo.reset(head_commit.as_object(), ResetType::Hard, None)?;
            return Ok(MergeOutcome::Conflicted { paths });
        }

        let tree = self.repo.find_tree(index.write_tree()?)?;
        let theirs = self.repo.find_commit(incoming.id())?;
        let message = format!("Merge remote-tracking branch into {branch}");
        self.repo.commit(
            Some("HEAD"),
            author,
            author,
            &message,
            &tree,
            &[head_commit, &theirs],
        )?;
        self.repo.cleanup_state()?;

        Ok(MergeOutcome::Merged {
            files_changed: self.files_between(&head_commit.tree()?, &tree)?,
        })
    }

    fn files_between(
        &self,
        old: &git2::Tree<'_>,
        new: &git2::Tree<'_>,
    ) -> Result<usize, git2::Error> {
        let diff = self.repo.diff_tree_to_tree(Some(old), Some(new), None)?;
        Ok(diff.deltas().len())
    }
}

fn conflicted_paths(index: &git2::Index) -> Result<Vec<PathBuf>, git2::Error> {
    let mut paths = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
        if let Some(entry) = entry {
            paths.push(PathBuf::from(String::from_utf8_lossy(&entry.path).into_owned()));
        }
    }
    Ok(paths)
}
