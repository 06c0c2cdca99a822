//! Control channel between the CLI and a running daemon.
//!
//! Each exchange is one JSON line from the client and one JSON line back over
//! `~/.reposync/daemon.sock`. Requests are tagged by `cmd`; replies by
//! `reply`, with any payload under `data`.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reposync_core::{RepoId, RepositoryRecord, RepositoryUpdate, SyncStatus};
use reposync_sync::SyncOutcome;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;
use crate::scheduler::{BatchReport, SchedulerStatus};

const STATUS_ATTEMPTS: u32 = 5;
const STATUS_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum DaemonRequest {
    Status,
    /// A full batch, or just `repository` when set.
    Sync {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repository: Option<RepoId>,
    },
    /// Re-read the registry store from disk.
    Reload,
    Update {
        repository: RepoId,
        #[serde(default)]
        change: RepositoryUpdate,
    },
    /// Unregister and delete the clone, after any sync in flight on it.
    Remove { repository: RepoId },
    Stop,
}

impl DaemonRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Sync { .. } => "sync",
            Self::Reload => "reload",
            Self::Update { .. } => "update",
            Self::Remove { .. } => "remove",
            Self::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", content = "data", rename_all = "snake_case")]
pub enum DaemonReply {
    Status(DaemonStatus),
    Batch(BatchReport),
    Synced(SyncOutcome),
    Reloaded { repositories: usize },
    Updated(RepositoryRecord),
    Removed(RepositoryRecord),
    Stopping,
    Rejected { message: String },
}

/// What `reposync daemon status` prints while the daemon is up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub scheduler: SchedulerStatus,
    pub repositories: Vec<RepositorySummary>,
}

/// The daemon's in-memory view of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySummary {
    pub id: RepoId,
    pub enabled: bool,
    pub read_only: bool,
    pub sync_status: SyncStatus,
    pub last_synced: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl From<&RepositoryRecord> for RepositorySummary {
    fn from(record: &RepositoryRecord) -> Self {
        Self {
            id: record.id.clone(),
            enabled: record.enabled,
            read_only: record.read_only,
            sync_status: record.sync_status,
            last_synced: record.last_synced,
            error_message: record.error_message.clone(),
        }
    }
}

/// One JSON document terminated by `\n`.
pub(crate) fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, DaemonError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Blocking client for the daemon socket under one home directory.
///
/// Every method fails with [`DaemonError::DaemonNotRunning`] when nothing is
/// listening, so callers can fall back to doing the work in-process.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
}

impl ControlClient {
    pub fn new(home: &Path) -> Self {
        Self {
            socket: socket_path(home),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send `request` and read the daemon's reply. A rejection comes back as
    /// [`DaemonError::Rejected`], never as `Ok`.
    pub fn call(&self, request: &DaemonRequest) -> Result<DaemonReply, DaemonError> {
        let stream = self.connect()?;
        let frame = encode_line(request)?;
        (&stream)
            .write_all(&frame)
            .and_then(|()| (&stream).flush())
            .map_err(|e| io_err(&self.socket, e))?;

        let mut line = String::new();
        let read = BufReader::new(&stream)
            .read_line(&mut line)
            .map_err(|e| io_err(&self.socket, e))?;
        if read == 0 {
            return Err(DaemonError::Protocol(format!(
                "daemon hung up without answering '{}'",
                request.name()
            )));
        }
        match serde_json::from_str(line.trim_end())? {
            DaemonReply::Rejected { message } => Err(DaemonError::Rejected(message)),
            reply => Ok(reply),
        }
    }

    fn connect(&self) -> Result<UnixStream, DaemonError> {
        if !self.socket.exists() {
            return Err(self.not_running());
        }
        UnixStream::connect(&self.socket).map_err(|err| match err.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                self.not_running()
            }
            _ => io_err(&self.socket, err),
        })
    }

    fn not_running(&self) -> DaemonError {
        DaemonError::DaemonNotRunning {
            socket: self.socket.clone(),
        }
    }

    /// Retries briefly while a freshly started daemon binds its socket.
    pub fn status(&self) -> Result<DaemonStatus, DaemonError> {
        let mut attempt = 1;
        loop {
            match self.call(&DaemonRequest::Status) {
                Ok(DaemonReply::Status(status)) => return Ok(status),
                Ok(other) => return Err(unexpected(&DaemonRequest::Status, &other)),
                Err(DaemonError::DaemonNotRunning { .. }) if attempt < STATUS_ATTEMPTS => {
                    attempt += 1;
                    sleep(STATUS_RETRY_DELAY);
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn sync_all(&self) -> Result<BatchReport, DaemonError> {
        let request = DaemonRequest::Sync { repository: None };
        match self.call(&request)? {
            DaemonReply::Batch(report) => Ok(report),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn sync_one(&self, id: &RepoId) -> Result<SyncOutcome, DaemonError> {
        let request = DaemonRequest::Sync {
            repository: Some(id.clone()),
        };
        match self.call(&request)? {
            DaemonReply::Synced(outcome) => Ok(outcome),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Returns how many repositories the daemon now knows about.
    pub fn reload(&self) -> Result<usize, DaemonError> {
        match self.call(&DaemonRequest::Reload)? {
            DaemonReply::Reloaded { repositories } => Ok(repositories),
            other => Err(unexpected(&DaemonRequest::Reload, &other)),
        }
    }

    pub fn update(
        &self,
        id: &RepoId,
        change: RepositoryUpdate,
    ) -> Result<RepositoryRecord, DaemonError> {
        let request = DaemonRequest::Update {
            repository: id.clone(),
            change,
        };
        match self.call(&request)? {
            DaemonReply::Updated(record) => Ok(record),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn remove(&self, id: &RepoId) -> Result<RepositoryRecord, DaemonError> {
        let request = DaemonRequest::Remove {
            repository: id.clone(),
        };
        match self.call(&request)? {
            DaemonReply::Removed(record) => Ok(record),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn stop(&self) -> Result<(), DaemonError> {
        match self.call(&DaemonRequest::Stop)? {
            DaemonReply::Stopping => Ok(()),
            other => Err(unexpected(&DaemonRequest::Stop, &other)),
        }
    }
}

fn unexpected(request: &DaemonRequest, reply: &DaemonReply) -> DaemonError {
    let kind = serde_json::to_value(reply)
        .ok()
        .and_then(|v| v.get("reply").and_then(|r| r.as_str().map(str::to_owned)))
        .unwrap_or_else(|| "unknown".to_string());
    DaemonError::Protocol(format!(
        "daemon answered '{}' with a '{kind}' reply",
        request.name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn requests_are_tagged_by_cmd() {
        assert_eq!(
            serde_json::to_value(DaemonRequest::Status).unwrap(),
            json!({ "cmd": "status" })
        );
        assert_eq!(
            serde_json::to_value(DaemonRequest::Sync { repository: None }).unwrap(),
            json!({ "cmd": "sync" })
        );

        let parsed: DaemonRequest =
            serde_json::from_str(r#"{"cmd":"update","repository":"acme/wiki","change":{"enabled":false}}"#)
                .unwrap();
        assert_eq!(
            parsed,
            DaemonRequest::Update {
                repository: RepoId::from("acme/wiki"),
                change: RepositoryUpdate {
                    enabled: Some(false),
                    ..RepositoryUpdate::default()
                },
            }
        );
    }

    #[test]
    fn unknown_cmd_does_not_parse() {
        let err = serde_json::from_str::<DaemonRequest>(r#"{"cmd":"explode"}"#).unwrap_err();
        assert!(err.to_string().contains("explode"), "got: {err}");
        assert!(serde_json::from_str::<DaemonRequest>(r#"{"cmd":"remove"}"#).is_err());
    }

    #[test]
    fn replies_carry_payload_under_data() {
        let value = serde_json::to_value(DaemonReply::Reloaded { repositories: 3 }).unwrap();
        assert_eq!(value, json!({ "reply": "reloaded", "data": { "repositories": 3 } }));
        let value = serde_json::to_value(DaemonReply::Stopping).unwrap();
        assert_eq!(value, json!({ "reply": "stopping" }));
    }

    #[test]
    fn mismatched_reply_names_both_sides() {
        let err = unexpected(&DaemonRequest::Reload, &DaemonReply::Stopping);
        assert!(
            matches!(err, DaemonError::Protocol(ref m) if m.contains("'reload'") && m.contains("'stopping'")),
            "got: {err}"
        );
    }

    #[test]
    fn missing_socket_means_not_running() {
        let home = TempDir::new().unwrap();
        let client = ControlClient::new(home.path());
        let err = client.call(&DaemonRequest::Status).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
        assert!(matches!(
            client.remove(&RepoId::from("acme/wiki")),
            Err(DaemonError::DaemonNotRunning { .. })
        ));
    }
}
