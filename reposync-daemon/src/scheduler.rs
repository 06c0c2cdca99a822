//! Periodic batch sync over every enabled repository.
//!
//! One recurring timer drives one batch at a time. A firing that would
//! overlap a batch still in progress (a slow scheduled batch, or a manual
//! `run_once`/`sync_one`) is skipped, not queued. Within a batch repositories
//! sync sequentially; each sync runs on the blocking pool so a panic in one
//! repository is contained and counted as an error.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use reposync_core::config::SchedulerSettings;
use reposync_core::registry::{self, SharedRegistry};
use reposync_core::{RepoId, RepositoryRecord, SyncAttempt};
use reposync_sync::{OutcomeStatus, RepositorySyncer, SyncOutcome};

use crate::error::DaemonError;
use crate::reindex::Reindexer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            enabled: settings.enabled,
            interval: settings.interval(),
        }
    }
}

/// Aggregate result of one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub attempted: usize,
    pub success_count: usize,
    /// Every non-success, conflicts included.
    pub error_count: usize,
    pub conflict_count: usize,
    /// Repositories whose sync changed files.
    pub changed: Vec<RepoId>,
    /// Set when an indexer ran and reported a count.
    pub documents_indexed: Option<usize>,
    pub outcomes: Vec<SyncOutcome>,
}

impl BatchReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            duration_ms: 0,
            attempted: 0,
            success_count: 0,
            error_count: 0,
            conflict_count: 0,
            changed: Vec::new(),
            documents_indexed: None,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, outcome: SyncOutcome) {
        self.attempted += 1;
        match outcome.status {
            OutcomeStatus::Success => self.success_count += 1,
            OutcomeStatus::Error => self.error_count += 1,
            OutcomeStatus::Conflict => {
                self.error_count += 1;
                self.conflict_count += 1;
            }
        }
        if outcome.files_changed > 0 {
            self.changed.push(outcome.repository.clone());
        }
        self.outcomes.push(outcome);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub running: bool,
    pub interval_secs: u64,
    pub batch_in_progress: bool,
    pub last_batch: Option<BatchReport>,
}

struct Ticker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct Shared {
    registry: SharedRegistry,
    syncer: Arc<dyn RepositorySyncer>,
    reindexer: Option<Arc<dyn Reindexer>>,
    config: SchedulerConfig,
    batch: Mutex<()>,
    last_batch: StdMutex<Option<BatchReport>>,
}

/// Owns the recurring timer. Built once by the process's composition root.
pub struct Scheduler {
    shared: Arc<Shared>,
    ticker: StdMutex<Option<Ticker>>,
}

impl Scheduler {
    pub fn new(
        registry: SharedRegistry,
        syncer: Arc<dyn RepositorySyncer>,
        reindexer: Option<Arc<dyn Reindexer>>,
        config: SchedulerConfig,
    ) -> Result<Self, DaemonError> {
        if config.interval < Duration::from_secs(1) {
            return Err(DaemonError::InvalidInterval);
        }
        Ok(Self {
            shared: Arc::new(Shared {
                registry,
                syncer,
                reindexer,
                config,
                batch: Mutex::new(()),
                last_batch: StdMutex::new(None),
            }),
            ticker: StdMutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Begin firing every `interval`. Returns false (and does nothing) when
    /// disabled or already running. Must be called inside a tokio runtime.
    pub fn start(&self) -> bool {
        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.shared.config.enabled {
            tracing::info!("scheduler disabled in config; not starting");
            return false;
        }
        if ticker.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            tracing::debug!("scheduler already running");
            return false;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(shared.tick_loop(stop_rx));
        *ticker = Some(Ticker {
            stop: stop_tx,
            handle,
        });
        tracing::info!(
            interval_secs = self.shared.config.interval.as_secs(),
            "scheduler started"
        );
        true
    }

    /// Cancel the timer and wait for any batch in flight to finish.
    pub async fn stop(&self) {
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Ticker { stop, handle }) = ticker {
            let _ = stop.send(());
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "scheduler task ended abnormally");
            }
            tracing::info!("scheduler stopped");
        }
        // Manual runs hold the same lock.
        let _idle = self.shared.batch.lock().await;
    }

    /// Run one batch now, waiting for any batch in progress first.
    pub async fn run_once(&self) -> Result<BatchReport, DaemonError> {
        let _batch = self.shared.batch.lock().await;
        self.shared.run_batch().await
    }

    /// Sync a single repository now, enabled or not.
    pub async fn sync_one(&self, id: &RepoId) -> Result<SyncOutcome, DaemonError> {
        let _batch = self.shared.batch.lock().await;
        let store = Arc::clone(&self.shared.registry);
        let id = id.clone();
        let (record, path, root) = blocking("registry", move || {
            let mut registry = registry::lock(&store)?;
            registry.reload()?;
            let record = registry.get(&id)?.clone();
            let path = registry.clone_path(&record);
            Ok((record, path, registry.repositories_root().to_path_buf()))
        })
        .await?;

        let outcome = self.shared.sync_record(record).await;
        if outcome.files_changed > 0 {
            self.shared.reindex(root, vec![path]).await;
        }
        Ok(outcome)
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            enabled: self.shared.config.enabled,
            running: self.is_running(),
            interval_secs: self.shared.config.interval.as_secs(),
            batch_in_progress: self.shared.batch.try_lock().is_err(),
            last_batch: self
                .shared
                .last_batch
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

impl Shared {
    async fn tick_loop(self: Arc<Self>, mut stop: oneshot::Receiver<()>) {
        let period = self.config.interval;
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticks.tick() => {
                    if let Some(Err(err)) = self.fire().await {
                        tracing::error!(error = %err, "scheduled batch failed");
                    }
                }
            }
        }
    }

    /// One scheduled firing. `None` when skipped because a batch is running.
    async fn fire(&self) -> Option<Result<BatchReport, DaemonError>> {
        let Ok(_batch) = self.batch.try_lock() else {
            tracing::warn!("previous batch still running; skipping this firing");
            return None;
        };
        Some(self.run_batch().await)
    }

    /// Caller holds `batch`.
    async fn run_batch(&self) -> Result<BatchReport, DaemonError> {
        let clock = std::time::Instant::now();
        let mut report = BatchReport::new(Utc::now());

        let store = Arc::clone(&self.registry);
        let (records, root) = blocking("registry", move || {
            let mut registry = registry::lock(&store)?;
            registry.reload()?;
            let records: Vec<(RepositoryRecord, PathBuf)> = registry
                .list()
                .iter()
                .filter(|r| r.enabled)
                .map(|r| (r.clone(), registry.clone_path(r)))
                .collect();
            Ok((records, registry.repositories_root().to_path_buf()))
        })
        .await?;
        tracing::info!(repositories = records.len(), "sync batch started");

        let mut changed_paths = Vec::new();
        for (record, path) in records {
            let outcome = self.sync_record(record).await;
            if outcome.files_changed > 0 {
                changed_paths.push(path);
            }
            report.record(outcome);
        }

        report.documents_indexed = self.reindex(root, changed_paths).await;
        report.duration_ms = clock.elapsed().as_millis() as u64;
        tracing::info!(
            attempted = report.attempted,
            succeeded = report.success_count,
            failed = report.error_count,
            conflicts = report.conflict_count,
            changed = report.changed.len(),
            duration_ms = report.duration_ms,
            "sync batch finished"
        );

        *self
            .last_batch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        Ok(report)
    }

    /// Never fails: a panicking or cancelled sync becomes an `error` outcome
    /// and is recorded on the repository.
    async fn sync_record(&self, record: RepositoryRecord) -> SyncOutcome {
        let id = record.id.clone();
        let syncer = Arc::clone(&self.syncer);
        match tokio::task::spawn_blocking(move || syncer.sync(&record)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let detail = if err.is_panic() {
                    "sync panicked"
                } else {
                    "sync task was cancelled"
                };
                tracing::error!(repo = %id, error = %err, "{detail}");
                let store = Arc::clone(&self.registry);
                let failed_id = id.clone();
                let recorded = blocking("registry", move || {
                    registry::lock(&store)?
                        .record_attempt(&failed_id, SyncAttempt::failed(detail, Utc::now()))?;
                    Ok(())
                })
                .await;
                if let Err(err) = recorded {
                    tracing::error!(repo = %id, error = %err, "failed to record sync failure");
                }
                SyncOutcome::failure(id, "Sync failed", detail)
            }
        }
    }

    /// Scoped updates when the indexer supports them, else one full rebuild.
    async fn reindex(&self, root: PathBuf, changed: Vec<PathBuf>) -> Option<usize> {
        if changed.is_empty() {
            return None;
        }
        let Some(reindexer) = self.reindexer.clone() else {
            tracing::debug!(changed = changed.len(), "content changed; no indexer configured");
            return None;
        };

        let result = blocking("reindex", move || {
            if reindexer.supports_scoped() {
                Ok(reindex_each(reindexer.as_ref(), &changed))
            } else {
                Ok(reindexer.rebuild_index(&root)?)
            }
        })
        .await;
        match result {
            Ok(documents) => {
                tracing::info!(documents, "search index updated");
                Some(documents)
            }
            Err(err) => {
                tracing::error!(error = %err, "search index update failed");
                None
            }
        }
    }
}

fn reindex_each(reindexer: &dyn Reindexer, paths: &[PathBuf]) -> usize {
    let mut total = 0;
    for path in paths {
        match reindexer.reindex_repository(path) {
            Ok(documents) => total += documents,
            Err(err) => tracing::error!(
                path = %path.display(),
                error = %err,
                "repository reindex failed"
            ),
        }
    }
    total
}

pub(crate) async fn blocking<T, F>(task: &'static str, f: F) -> Result<T, DaemonError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DaemonError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| DaemonError::Task {
            task,
            message: err.to_string(),
        })?
}
