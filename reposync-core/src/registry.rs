//! Durable JSON registry of managed repositories.
//!
//! # Storage layout
//!
//! ```text
//! ~/.reposync/
//!   repositories.json        (store, mode 0600, rewritten in full on every mutation)
//!   repositories.json.lock   (advisory lock held for the duration of each mutation)
//! ```
//!
//! # Write discipline
//!
//! Every mutation is read-modify-write: take the exclusive `fs2` lock, re-read
//! the store from disk, apply the change, write `.tmp` → `chmod 0600` →
//! `rename`, release the lock. Another process writing the same store can
//! therefore never lose an update. Inside one process the registry must be
//! shared through [`SharedRegistry`] so that mutations are serialized.

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use fs2::FileExt;

use crate::error::{persistence_err, RegistryError};
use crate::types::{
    NewRepository, RegistryFile, RepoId, RepositoryRecord, RepositoryUpdate, SyncAttempt,
};

/// The single in-process handle to the registry.
pub type SharedRegistry = Arc<Mutex<RepositoryRegistry>>;

/// Lock a [`SharedRegistry`], mapping poisoning to [`RegistryError::LockPoisoned`].
pub fn lock(registry: &SharedRegistry) -> Result<MutexGuard<'_, RepositoryRegistry>, RegistryError> {
    registry.lock().map_err(|_| RegistryError::LockPoisoned)
}

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.reposync/`
pub fn reposync_root(home: &Path) -> PathBuf {
    home.join(".reposync")
}

/// `<home>/.reposync/repositories.json`. Pure, no I/O.
pub fn default_store_path(home: &Path) -> PathBuf {
    reposync_root(home).join("repositories.json")
}

fn lock_path(store_path: &Path) -> PathBuf {
    sibling(store_path, "lock")
}

fn tmp_path(store_path: &Path) -> PathBuf {
    sibling(store_path, "tmp")
}

fn sibling(store_path: &Path, suffix: &str) -> PathBuf {
    let name = store_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repositories.json".to_string());
    store_path.with_file_name(format!("{name}.{suffix}"))
}

// ---------------------------------------------------------------------------
// 2. Registry
// ---------------------------------------------------------------------------

/// Repository metadata store. Loaded once by [`RepositoryRegistry::open`];
/// reads are served from memory, mutations go through the store on disk.
#[derive(Debug)]
pub struct RepositoryRegistry {
    store_path: PathBuf,
    repositories_root: PathBuf,
    records: Vec<RepositoryRecord>,
}

impl RepositoryRegistry {
    /// Open (or start) the registry stored at `store_path`, whose clones live
    /// under `repositories_root`.
    ///
    /// A missing store is an empty registry. A store that exists but cannot be
    /// parsed is an error: the registry never silently resets itself.
    pub fn open(
        store_path: impl Into<PathBuf>,
        repositories_root: impl Into<PathBuf>,
    ) -> Result<Self, RegistryError> {
        let store_path = store_path.into();
        let records = read_store(&store_path)?;
        tracing::debug!(
            store = %store_path.display(),
            repositories = records.len(),
            "registry loaded"
        );
        Ok(Self {
            store_path,
            repositories_root: repositories_root.into(),
            records,
        })
    }

    /// Wrap into the shared, mutex-guarded handle.
    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn repositories_root(&self) -> &Path {
        &self.repositories_root
    }

    /// Absolute location of a record's clone: `<repositories_root>/<local_path>`.
    pub fn clone_path(&self, record: &RepositoryRecord) -> PathBuf {
        self.repositories_root.join(&record.local_path)
    }

    /// Re-read the store, picking up changes made by other processes.
    pub fn reload(&mut self) -> Result<(), RegistryError> {
        self.records = read_store(&self.store_path)?;
        Ok(())
    }

    // -- reads --------------------------------------------------------------

    pub fn get(&self, id: &RepoId) -> Result<&RepositoryRecord, RegistryError> {
        self.records
            .iter()
            .find(|r| r.id == *id)
            .ok_or_else(|| RegistryError::NotFound { id: id.clone() })
    }

    /// All records in insertion (creation) order.
    pub fn list(&self) -> &[RepositoryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // -- mutations ----------------------------------------------------------

    /// Register a repository. Assigns `created_at` and starts at `never`.
    ///
    /// `local_path` is stored normalized and must not share a directory tree
    /// with any other record's clone.
    pub fn add(&mut self, new: NewRepository) -> Result<RepositoryRecord, RegistryError> {
        let new = NewRepository {
            local_path: normalize_local_path(&new.local_path)?,
            ..new
        };
        let record = new.into_record(Utc::now());
        let stored = record.clone();

        self.mutate(move |records| {
            check_unclaimed(records, &record.id, &record.local_path)?;
            records.push(record);
            Ok(())
        })?;

        tracing::info!(repo = %stored.id, "repository registered");
        Ok(stored)
    }

    /// Normalize `new.local_path` and check it and the id against the
    /// in-memory records, without writing anything.
    pub fn claim(&self, new: NewRepository) -> Result<NewRepository, RegistryError> {
        let new = NewRepository {
            local_path: normalize_local_path(&new.local_path)?,
            ..new
        };
        check_unclaimed(&self.records, &new.id, &new.local_path)?;
        Ok(new)
    }

    /// Apply the allow-listed fields of `update` to record `id`.
    pub fn update(
        &mut self,
        id: &RepoId,
        update: RepositoryUpdate,
    ) -> Result<RepositoryRecord, RegistryError> {
        let updated = self.mutate(|records| {
            let record = find_mut(records, id)?;
            if let Some(enabled) = update.enabled {
                record.enabled = enabled;
            }
            if let Some(read_only) = update.read_only {
                record.read_only = read_only;
            }
            if let Some(name) = update.name {
                record.name = name;
            }
            Ok(record.clone())
        })?;
        tracing::info!(repo = %id, "repository updated");
        Ok(updated)
    }

    /// Delete the local clone (best-effort) and then the record.
    pub fn remove(&mut self, id: &RepoId) -> Result<RepositoryRecord, RegistryError> {
        let root = self.repositories_root.clone();
        let removed = self.mutate(|records| {
            let index = records
                .iter()
                .position(|r| r.id == *id)
                .ok_or_else(|| RegistryError::NotFound { id: id.clone() })?;

            let clone_dir = root.join(&records[index].local_path);
            if clone_dir.exists() {
                match fs::remove_dir_all(&clone_dir) {
                    Ok(()) => tracing::info!(
                        repo = %id,
                        path = %clone_dir.display(),
                        "deleted local clone"
                    ),
                    Err(err) => tracing::error!(
                        repo = %id,
                        path = %clone_dir.display(),
                        error = %err,
                        "failed to delete local clone; removing record anyway"
                    ),
                }
            }

            Ok(records.remove(index))
        })?;
        tracing::info!(repo = %id, "repository removed");
        Ok(removed)
    }

    /// Record the result of a sync attempt. The only path through which
    /// `sync_status`, `error_message` and `last_synced` change.
    ///
    /// `error_message` is kept iff the status requires one.
    pub fn record_attempt(
        &mut self,
        id: &RepoId,
        attempt: SyncAttempt,
    ) -> Result<RepositoryRecord, RegistryError> {
        self.mutate(|records| {
            let record = find_mut(records, id)?;
            record.error_message = if attempt.status.requires_message() {
                Some(
                    attempt
                        .message
                        .unwrap_or_else(|| attempt.status.to_string()),
                )
            } else {
                None
            };
            record.sync_status = attempt.status;
            if let Some(at) = attempt.finished_at {
                record.last_synced = Some(at);
            }
            Ok(record.clone())
        })
    }

    fn mutate<T>(
        &mut self,
        apply: impl FnOnce(&mut Vec<RepositoryRecord>) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let _lock = StoreLock::acquire(&lock_path(&self.store_path))?;
        let mut records = read_store(&self.store_path)?;
        let out = apply(&mut records)?;
        write_store(&self.store_path, &records)?;
        self.records = records;
        Ok(out)
    }
}

fn find_mut<'a>(
    records: &'a mut [RepositoryRecord],
    id: &RepoId,
) -> Result<&'a mut RepositoryRecord, RegistryError> {
    records
        .iter_mut()
        .find(|r| r.id == *id)
        .ok_or_else(|| RegistryError::NotFound { id: id.clone() })
}

/// Drop `.` components. Empty, absolute and `..` paths are rejected so a
/// clone can never be the repositories root or live outside it.
pub fn normalize_local_path(path: &Path) -> Result<PathBuf, RegistryError> {
    let invalid = || RegistryError::InvalidLocalPath {
        path: path.to_path_buf(),
    };
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => return Err(invalid()),
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(invalid());
    }
    Ok(normalized)
}

fn check_unclaimed(
    records: &[RepositoryRecord],
    id: &RepoId,
    local_path: &Path,
) -> Result<(), RegistryError> {
    if records.iter().any(|r| r.id == *id) {
        return Err(RegistryError::DuplicateId { id: id.clone() });
    }
    for record in records {
        let existing =
            normalize_local_path(&record.local_path).unwrap_or_else(|_| record.local_path.clone());
        if existing == local_path {
            return Err(RegistryError::DuplicateLocalPath {
                path: local_path.to_path_buf(),
                owner: record.id.clone(),
            });
        }
        // Removing the outer clone would delete the inner one.
        if existing.starts_with(local_path) || local_path.starts_with(&existing) {
            return Err(RegistryError::OverlappingLocalPath {
                path: local_path.to_path_buf(),
                owner: record.id.clone(),
                owner_path: existing,
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// 3. Store I/O (atomic)
// ---------------------------------------------------------------------------

fn read_store(store_path: &Path) -> Result<Vec<RepositoryRecord>, RegistryError> {
    if !store_path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(store_path).map_err(|e| persistence_err(store_path, e))?;
    let file: RegistryFile = serde_json::from_str(&contents).map_err(|e| RegistryError::Parse {
        path: store_path.to_path_buf(),
        source: e,
    })?;

    let mut records: Vec<RepositoryRecord> = file.repositories.into_values().collect();
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(records)
}

/// Write flow: serialize → `.tmp` sibling → `chmod 0600` → `rename`.
fn write_store(store_path: &Path, records: &[RepositoryRecord]) -> Result<(), RegistryError> {
    if let Some(dir) = store_path.parent() {
        fs::create_dir_all(dir).map_err(|e| persistence_err(dir, e))?;
    }
    let file = RegistryFile {
        repositories: records.iter().map(|r| (r.id.clone(), r.clone())).collect(),
    };
    let json = serde_json::to_string_pretty(&file)?;

    let tmp = tmp_path(store_path);
    fs::write(&tmp, json).map_err(|e| persistence_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    fs::rename(&tmp, store_path).map_err(|e| persistence_err(store_path, e))?;
    Ok(())
}

/// Exclusive advisory lock on the store's `.lock` sibling, released on drop.
struct StoreLock {
    file: File,
}

impl StoreLock {
    fn acquire(path: &Path) -> Result<Self, RegistryError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| persistence_err(dir, e))?;
        }
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| persistence_err(path, e))?;
        file.lock_exclusive().map_err(|e| persistence_err(path, e))?;
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| persistence_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SyncStatus;
    use rstest::rstest;
    use tempfile::TempDir;

    fn open(home: &TempDir) -> RepositoryRegistry {
        RepositoryRegistry::open(default_store_path(home.path()), home.path().join("repos"))
            .expect("open registry")
    }

    fn wiki() -> NewRepository {
        NewRepository::new("acme/wiki-main", "https://example.com/acme/wiki-main.git")
    }

    #[test]
    fn missing_store_is_empty_registry() {
        let home = TempDir::new().expect("tempdir");
        let registry = open(&home);
        assert!(registry.is_empty());
        assert!(!registry.store_path().exists(), "open must not create the store");
    }

    #[test]
    fn add_persists_and_assigns_created_at() {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        let before = Utc::now();
        let record = registry.add(wiki()).expect("add");
        assert!(record.created_at >= before);
        assert_eq!(record.sync_status, SyncStatus::Never);

        let reopened = open(&home);
        assert_eq!(reopened.get(&record.id).expect("get"), &record);
    }

    #[test]
    fn add_duplicate_id_fails() {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        registry.add(wiki()).expect("first add");
        let mut again = wiki();
        again.local_path = PathBuf::from("elsewhere");
        let err = registry.add(again).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId { .. }), "got: {err}");
    }

    #[test]
    fn add_duplicate_local_path_fails() {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        registry.add(wiki()).expect("first add");
        let mut other = NewRepository::new("acme/other", "https://example.com/acme/other.git");
        other.local_path = PathBuf::from("acme/wiki-main");
        let err = registry.add(other).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateLocalPath { .. }), "got: {err}");
    }

    #[rstest]
    #[case("../outside")]
    #[case("/abs/path")]
    #[case("")]
    #[case(".")]
    #[case("./.")]
    #[case("acme/../wiki")]
    fn add_rejects_unusable_local_path(#[case] bad: &str) {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        let mut new = wiki();
        new.local_path = PathBuf::from(bad);
        let err = registry.add(new).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidLocalPath { .. }), "{bad:?}: {err}");
        assert!(registry.is_empty());
    }

    #[test]
    fn add_stores_normalized_local_path() {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        let mut new = wiki();
        new.local_path = PathBuf::from("./acme/./wiki-main");
        let record = registry.add(new).expect("add");
        assert_eq!(record.local_path, PathBuf::from("acme/wiki-main"));
        assert_eq!(
            registry.clone_path(&record),
            home.path().join("repos/acme/wiki-main")
        );
    }

    #[rstest]
    #[case("./acme/wiki-main", true)]
    #[case("acme/./wiki-main/", true)]
    #[case("acme", false)]
    #[case("acme/wiki-main/nested", false)]
    fn add_rejects_clone_location_already_in_use(#[case] path: &str, #[case] same: bool) {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        registry.add(wiki()).expect("first add");

        let mut other = NewRepository::new("other/id", "https://example.com/other/id.git");
        other.local_path = PathBuf::from(path);
        let err = registry.add(other).unwrap_err();
        if same {
            assert!(matches!(err, RegistryError::DuplicateLocalPath { .. }), "{path}: {err}");
        } else {
            assert!(matches!(err, RegistryError::OverlappingLocalPath { .. }), "{path}: {err}");
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn sibling_with_shared_prefix_is_not_an_overlap() {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        registry.add(wiki()).expect("first add");
        let mut other = NewRepository::new("acme/wiki-main-2", "https://example.com/x.git");
        other.local_path = PathBuf::from("acme/wiki-main-2");
        registry.add(other).expect("sibling add");
    }

    #[test]
    fn claim_normalizes_without_writing() {
        let home = TempDir::new().expect("tempdir");
        let registry = open(&home);
        let mut new = wiki();
        new.local_path = PathBuf::from("./acme/wiki-main");
        let claimed = registry.claim(new).expect("claim");
        assert_eq!(claimed.local_path, PathBuf::from("acme/wiki-main"));
        assert!(!registry.store_path().exists());
    }

    #[test]
    fn get_unknown_is_not_found() {
        let home = TempDir::new().expect("tempdir");
        let registry = open(&home);
        let err = registry.get(&RepoId::from("nope")).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[test]
    fn update_applies_only_allow_listed_fields() {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        let original = registry.add(wiki()).expect("add");

        let updated = registry
            .update(
                &original.id,
                RepositoryUpdate {
                    enabled: Some(true),
                    read_only: Some(false),
                    name: Some("Wiki".to_string()),
                },
            )
            .expect("update");

        assert!(updated.enabled);
        assert!(!updated.read_only);
        assert_eq!(updated.name, "Wiki");
        assert_eq!(updated.remote_url, original.remote_url);
        assert_eq!(updated.local_path, original.local_path);
        assert_eq!(updated.sync_status, original.sync_status);
    }

    #[test]
    fn update_unknown_is_not_found() {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        let err = registry
            .update(&RepoId::from("ghost"), RepositoryUpdate::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[test]
    fn list_keeps_insertion_order() {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        for id in ["zeta/repo", "alpha/repo", "mid/repo"] {
            registry
                .add(NewRepository::new(id, format!("https://example.com/{id}.git")))
                .expect("add");
        }
        let reopened = open(&home);
        let ids: Vec<&str> = reopened.list().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["zeta/repo", "alpha/repo", "mid/repo"]);
    }

    #[test]
    fn record_attempt_keeps_message_invariant() {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        let id = registry.add(wiki()).expect("add").id;
        let now = Utc::now();

        let failed = registry
            .record_attempt(&id, SyncAttempt::failed("fetch failed", now))
            .expect("record error");
        assert_eq!(failed.sync_status, SyncStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("fetch failed"));
        assert_eq!(failed.last_synced, Some(now));

        let synced = registry
            .record_attempt(&id, SyncAttempt::synced(now))
            .expect("record success");
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        assert!(synced.error_message.is_none());
    }

    #[test]
    fn conflict_attempt_leaves_last_synced_untouched() {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        let id = registry.add(wiki()).expect("add").id;
        let synced_at = Utc::now();
        registry
            .record_attempt(&id, SyncAttempt::synced(synced_at))
            .expect("synced");

        let conflicted = registry
            .record_attempt(&id, SyncAttempt::conflict("local edits and remote commits"))
            .expect("conflict");
        assert_eq!(conflicted.sync_status, SyncStatus::Conflict);
        assert_eq!(conflicted.last_synced, Some(synced_at));
        assert!(conflicted.error_message.is_some());
    }

    #[test]
    fn remove_deletes_record_and_clone() {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        let record = registry.add(wiki()).expect("add");
        let clone = registry.clone_path(&record);
        fs::create_dir_all(clone.join(".git")).expect("fake clone");

        registry.remove(&record.id).expect("remove");
        assert!(!clone.exists(), "clone directory must be deleted");
        assert!(matches!(
            registry.get(&record.id),
            Err(RegistryError::NotFound { .. })
        ));
        assert!(open(&home).is_empty());
    }

    #[test]
    fn remove_unknown_is_not_found() {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        let err = registry.remove(&RepoId::from("wiki-main")).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[test]
    fn remove_without_clone_still_removes_record() {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        let record = registry.add(wiki()).expect("add");
        registry.remove(&record.id).expect("remove");
        assert!(registry.is_empty());
    }

    #[test]
    fn mutation_sees_writes_from_another_handle() {
        let home = TempDir::new().expect("tempdir");
        let mut first = open(&home);
        let mut second = open(&home);

        first.add(wiki()).expect("add via first");
        second
            .add(NewRepository::new("acme/docs", "https://example.com/acme/docs.git"))
            .expect("add via second");

        assert_eq!(second.len(), 2, "read-modify-write must not drop the first add");
        first.reload().expect("reload");
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn atomic_write_cleans_up_tmp() {
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        registry.add(wiki()).expect("add");
        assert!(!tmp_path(registry.store_path()).exists());
    }

    #[cfg(unix)]
    #[test]
    fn store_written_with_owner_only_perms() {
        use std::os::unix::fs::PermissionsExt;
        let home = TempDir::new().expect("tempdir");
        let mut registry = open(&home);
        registry.add(wiki()).expect("add");
        let mode = fs::metadata(registry.store_path())
            .expect("metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn shared_lock_helper_locks() {
        let home = TempDir::new().expect("tempdir");
        let shared = open(&home).into_shared();
        let guard = lock(&shared).expect("lock");
        assert!(guard.is_empty());
    }
}
