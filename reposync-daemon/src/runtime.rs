//! Daemon runtime: the scheduler, a control socket, and signal handling.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use reposync_core::registry::{self, SharedRegistry};
use reposync_core::{config, RepoId, RepositoryRecord, RepositoryUpdate, Settings};
use reposync_sync::{RepositorySyncer, SyncEngine, SyncOutcome};

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;
use crate::protocol::{encode_line, DaemonReply, DaemonRequest, DaemonStatus, RepositorySummary};
use crate::reindex::{CommandReindexer, Reindexer};
use crate::scheduler::{blocking, BatchReport, Scheduler, SchedulerConfig};

/// Everything the daemon serves, wired together once at startup.
pub struct Daemon {
    engine: Arc<SyncEngine>,
    registry: SharedRegistry,
    scheduler: Scheduler,
    started_at: DateTime<Utc>,
}

impl Daemon {
    /// `scheduler` normally drives `engine`; both must share its registry.
    pub fn new(engine: Arc<SyncEngine>, scheduler: Scheduler) -> Self {
        Self {
            registry: Arc::clone(engine.registry()),
            engine,
            scheduler,
            started_at: Utc::now(),
        }
    }

    /// Build registry, engine, indexer hook and scheduler from `settings`.
    pub fn compose(home: &Path, settings: &Settings) -> Result<Self, DaemonError> {
        let engine = Arc::new(SyncEngine::from_settings(home, settings)?);
        let reindexer = CommandReindexer::from_settings(&settings.reindex)
            .map(|r| Arc::new(r) as Arc<dyn Reindexer>);
        let scheduler = Scheduler::new(
            Arc::clone(engine.registry()),
            Arc::clone(&engine) as Arc<dyn RepositorySyncer>,
            reindexer,
            SchedulerConfig::from_settings(&settings.scheduler),
        )?;
        Ok(Self::new(engine, scheduler))
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn status(&self) -> DaemonStatus {
        let repositories = match registry::lock(&self.registry) {
            Ok(registry) => registry.list().iter().map(RepositorySummary::from).collect(),
            Err(err) => {
                tracing::error!(error = %err, "registry unavailable for status");
                Vec::new()
            }
        };
        DaemonStatus {
            running: true,
            pid: std::process::id(),
            started_at: self.started_at,
            scheduler: self.scheduler.status(),
            repositories,
        }
    }

    /// Re-read the store so records added by other processes are served.
    pub fn reload(&self) -> Result<usize, DaemonError> {
        let mut registry = registry::lock(&self.registry)?;
        registry.reload()?;
        tracing::info!(repositories = registry.len(), "registry reloaded");
        Ok(registry.len())
    }

    pub fn update(
        &self,
        id: &RepoId,
        change: RepositoryUpdate,
    ) -> Result<RepositoryRecord, DaemonError> {
        Ok(registry::lock(&self.registry)?.update(id, change)?)
    }

    /// Waits for any sync of `id` in flight, then deletes record and clone.
    pub async fn remove(&self, id: RepoId) -> Result<RepositoryRecord, DaemonError> {
        let engine = Arc::clone(&self.engine);
        blocking("unregister", move || Ok(engine.unregister(&id)?)).await
    }

    async fn answer(&self, request: DaemonRequest) -> DaemonReply {
        tracing::debug!(cmd = request.name(), "control request");
        let answered = match request {
            DaemonRequest::Status => Ok(DaemonReply::Status(self.status())),
            DaemonRequest::Sync {
                repository: Some(id),
            } => {
                tracing::info!(repo = %id, source = "socket", "sync requested");
                self.scheduler.sync_one(&id).await.map(DaemonReply::Synced)
            }
            DaemonRequest::Sync { repository: None } => {
                tracing::info!(source = "socket", "batch sync requested");
                self.scheduler.run_once().await.map(DaemonReply::Batch)
            }
            DaemonRequest::Reload => self
                .reload()
                .map(|repositories| DaemonReply::Reloaded { repositories }),
            DaemonRequest::Update { repository, change } => {
                self.update(&repository, change).map(DaemonReply::Updated)
            }
            DaemonRequest::Remove { repository } => {
                self.remove(repository).await.map(DaemonReply::Removed)
            }
            DaemonRequest::Stop => Ok(DaemonReply::Stopping),
        };
        answered.unwrap_or_else(|err| DaemonReply::Rejected {
            message: err.to_string(),
        })
    }
}

/// Log line format for the daemon process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path, log_format: LogFormat) -> Result<(), DaemonError> {
    init_tracing(log_format);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run one batch in this process, outside any daemon.
pub fn run_once_blocking(home: &Path) -> Result<BatchReport, DaemonError> {
    let daemon = compose_at(home)?;
    current_thread_runtime()?.block_on(daemon.scheduler.run_once())
}

/// Sync one repository in this process, outside any daemon.
pub fn sync_one_blocking(home: &Path, id: &RepoId) -> Result<SyncOutcome, DaemonError> {
    let daemon = compose_at(home)?;
    current_thread_runtime()?.block_on(daemon.scheduler.sync_one(id))
}

fn compose_at(home: &Path) -> Result<Daemon, DaemonError> {
    let settings = config::load_at(home)?;
    Daemon::compose(home, &settings)
}

fn current_thread_runtime() -> Result<tokio::runtime::Runtime, DaemonError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))
}

/// Load settings under `home` and run until stopped.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let daemon = compose_at(&home)?;
    serve(home, Arc::new(daemon)).await
}

/// Serve the control socket until a `stop` request or ctrl-c, then stop the
/// scheduler, letting any in-flight batch finish.
pub async fn serve(home: PathBuf, daemon: Arc<Daemon>) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    let listener = bind_control_socket(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    if !daemon.scheduler.start() {
        tracing::info!("scheduled sync is off; serving manual requests only");
    }

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let served = loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                tracing::info!("stop requested over control socket");
                break Ok(());
            }
            signal = &mut ctrl_c => {
                break match signal {
                    Ok(()) => {
                        tracing::info!("received ctrl-c, shutting down daemon");
                        Ok(())
                    }
                    Err(err) => Err(io_err("ctrl-c handler", err)),
                };
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let daemon = Arc::clone(&daemon);
                    let stop = stop_tx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = control_session(stream, daemon, stop).await {
                            tracing::warn!(error = %err, "control session ended with error");
                        }
                    });
                }
                Err(err) => break Err(io_err(&socket, err)),
            },
        }
    };

    drop(listener);
    daemon.scheduler.stop().await;
    release_control_socket(&socket);
    tracing::info!("daemon stopped");
    served
}

/// Answer requests on one connection until the client hangs up or asks the
/// daemon to stop.
async fn control_session(
    stream: UnixStream,
    daemon: Arc<Daemon>,
    stop: watch::Sender<bool>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("control socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let (reply, stopping) = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => {
                let stopping = request == DaemonRequest::Stop;
                (daemon.answer(request).await, stopping)
            }
            Err(err) => (
                DaemonReply::Rejected {
                    message: format!("malformed request: {err}"),
                },
                false,
            ),
        };

        writer
            .write_all(&encode_line(&reply)?)
            .await
            .map_err(|e| io_err("control socket write", e))?;
        if stopping {
            // The reply is out before the server starts winding down.
            let _ = stop.send(true);
            break;
        }
    }
    Ok(())
}

/// Bind the owner-only control socket, replacing a stale one.
fn bind_control_socket(socket: &Path) -> Result<UnixListener, DaemonError> {
    if let Some(dir) = socket.parent() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    claim_socket_path(socket)?;
    let listener = UnixListener::bind(socket).map_err(|e| io_err(socket, e))?;
    fs::set_permissions(socket, fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(socket, e))?;
    Ok(listener)
}

/// A socket file nobody answers on is left over from a crashed daemon.
fn claim_socket_path(socket: &Path) -> Result<(), DaemonError> {
    match fs::symlink_metadata(socket) {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(io_err(socket, err)),
    }
    if StdUnixStream::connect(socket).is_ok() {
        return Err(DaemonError::AlreadyRunning {
            socket: socket.to_path_buf(),
        });
    }
    tracing::warn!(socket = %socket.display(), "replacing stale control socket");
    match fs::remove_file(socket) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(io_err(socket, err)),
        _ => Ok(()),
    }
}

fn release_control_socket(socket: &Path) {
    if let Err(err) = fs::remove_file(socket) {
        if err.kind() != ErrorKind::NotFound {
            tracing::warn!(socket = %socket.display(), error = %err, "could not remove control socket");
        }
    }
}

fn init_tracing(log_format: LogFormat) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = match log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader as StdBufReader, Write};
    use std::time::Duration;

    use reposync_core::registry::reposync_root;
    use reposync_core::{NewRepository, RepositoryRegistry, SyncStatus};
    use reposync_sync::{
        EngineConfig, NoCredentials, OutcomeStatus, RepositorySyncer, SyncOutcome,
    };
    use tempfile::TempDir;

    use crate::protocol::ControlClient;

    struct AlwaysSynced;

    impl RepositorySyncer for AlwaysSynced {
        fn sync(&self, record: &RepositoryRecord) -> SyncOutcome {
            SyncOutcome {
                repository: record.id.clone(),
                status: OutcomeStatus::Success,
                message: "Repository is up to date".to_string(),
                commits_pulled: 0,
                commits_pushed: 0,
                files_changed: 0,
                error_message: None,
            }
        }
    }

    fn daemon_at(home: &Path) -> Arc<Daemon> {
        let mut registry = RepositoryRegistry::open(
            reposync_root(home).join("repositories.json"),
            reposync_root(home).join("repos"),
        )
        .expect("open registry");
        registry
            .add(NewRepository {
                enabled: true,
                ..NewRepository::new("acme/wiki", "https://example.com/acme/wiki.git")
            })
            .expect("add");
        let registry = registry.into_shared();
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&registry),
            EngineConfig {
                author_name: "reposync bot".to_string(),
                author_email: "bot@reposync.local".to_string(),
                network_timeout: Duration::from_secs(30),
            },
            Arc::new(NoCredentials),
        ));
        let scheduler = Scheduler::new(
            registry,
            Arc::new(AlwaysSynced),
            None,
            SchedulerConfig {
                enabled: true,
                interval: Duration::from_secs(3600),
            },
        )
        .expect("scheduler");
        Arc::new(Daemon::new(engine, scheduler))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn control_socket_serves_status_sync_reload_and_stop() {
        let home = TempDir::new().expect("home");
        let daemon = daemon_at(home.path());
        let server = tokio::spawn(serve(home.path().to_path_buf(), Arc::clone(&daemon)));

        let client = ControlClient::new(home.path());
        let (status, batch, single, reloaded) = tokio::task::spawn_blocking(move || {
            let status = client.status().expect("status");
            let batch = client.sync_all().expect("batch sync");
            let single = client.sync_one(&RepoId::from("acme/wiki")).expect("single sync");
            let reloaded = client.reload().expect("reload");
            client.stop().expect("stop");
            (status, batch, single, reloaded)
        })
        .await
        .expect("client");

        assert!(status.running);
        assert!(status.scheduler.running);
        assert_eq!(status.repositories[0].id, RepoId::from("acme/wiki"));
        assert_eq!(status.repositories[0].sync_status, SyncStatus::Never);
        assert_eq!(batch.attempted, 1);
        assert_eq!(batch.success_count, 1);
        assert_eq!(single.status, OutcomeStatus::Success);
        assert_eq!(reloaded, 1);

        server.await.expect("join").expect("serve");
        assert!(!socket_path(home.path()).exists(), "socket removed on exit");
        assert!(!daemon.scheduler().is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn update_and_remove_are_applied_by_the_daemon() {
        let home = TempDir::new().expect("home");
        let daemon = daemon_at(home.path());
        let clone_dir = reposync_root(home.path()).join("repos/acme/wiki");
        fs::create_dir_all(&clone_dir).expect("clone dir");
        fs::write(clone_dir.join("README.md"), "# wiki\n").expect("write");
        let server = tokio::spawn(serve(home.path().to_path_buf(), Arc::clone(&daemon)));

        let client = ControlClient::new(home.path());
        let id = RepoId::from("acme/wiki");
        let (updated, removed, again) = tokio::task::spawn_blocking(move || {
            let updated = client
                .update(
                    &id,
                    RepositoryUpdate {
                        enabled: Some(false),
                        ..RepositoryUpdate::default()
                    },
                )
                .expect("update");
            let removed = client.remove(&id).expect("remove");
            let again = client.remove(&id).unwrap_err();
            client.stop().expect("stop");
            (updated, removed, again)
        })
        .await
        .expect("client");

        assert!(!updated.enabled);
        assert_eq!(removed.id, RepoId::from("acme/wiki"));
        assert!(!removed.enabled);
        assert!(
            matches!(again, DaemonError::Rejected(ref m) if m.contains("not found")),
            "got: {again}"
        );
        assert!(!clone_dir.exists(), "clone deleted with the record");
        assert!(daemon.status().repositories.is_empty());

        server.await.expect("join").expect("serve");
        let reopened = RepositoryRegistry::open(
            reposync_root(home.path()).join("repositories.json"),
            reposync_root(home.path()).join("repos"),
        )
        .expect("reopen");
        assert!(reopened.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_repository_and_malformed_requests_are_rejected() {
        let home = TempDir::new().expect("home");
        let daemon = daemon_at(home.path());
        let server = tokio::spawn(serve(home.path().to_path_buf(), daemon));

        let client = ControlClient::new(home.path());
        tokio::task::spawn_blocking(move || {
            client.status().expect("daemon up");
            let err = client.sync_one(&RepoId::from("nope")).unwrap_err();
            assert!(
                matches!(err, DaemonError::Rejected(ref m) if m.contains("not found")),
                "got: {err}"
            );

            // The session survives a bad line and keeps answering.
            let stream = StdUnixStream::connect(client.socket()).expect("connect");
            (&stream)
                .write_all(b"{\"cmd\":\"explode\"}\n{\"cmd\":\"reload\"}\n")
                .expect("write");
            let mut replies = StdBufReader::new(&stream).lines();
            let first: DaemonReply =
                serde_json::from_str(&replies.next().expect("reply").expect("line")).expect("json");
            assert!(
                matches!(first, DaemonReply::Rejected { ref message } if message.contains("malformed request")),
                "got: {first:?}"
            );
            let second: DaemonReply =
                serde_json::from_str(&replies.next().expect("reply").expect("line")).expect("json");
            assert!(matches!(second, DaemonReply::Reloaded { repositories: 1 }));
            drop(replies);

            client.stop().expect("stop");
        })
        .await
        .expect("client");

        server.await.expect("join").expect("serve");
    }

    #[test]
    fn live_socket_blocks_a_second_daemon() {
        let home = TempDir::new().expect("home");
        let socket = home.path().join("daemon.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket).expect("bind");

        let err = claim_socket_path(&socket).unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning { .. }), "got: {err}");
        assert!(socket.exists());
    }

    #[test]
    fn stale_socket_file_is_removed() {
        let home = TempDir::new().expect("home");
        let socket = home.path().join("daemon.sock");
        drop(std::os::unix::net::UnixListener::bind(&socket).expect("bind"));

        claim_socket_path(&socket).expect("claim");
        assert!(!socket.exists());
        claim_socket_path(&socket).expect("nothing to claim");
    }
}
