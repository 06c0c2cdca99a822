//! Subcommand implementations and the plumbing they share.

pub mod daemon;
pub mod repo;
pub mod status;
pub mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing_subscriber::EnvFilter;

use reposync_core::config;
use reposync_daemon::DaemonError;
use reposync_sync::SyncEngine;

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Open the registry and build an engine from `~/.reposync/config.yaml`.
pub(crate) fn open_engine(home: &std::path::Path) -> Result<SyncEngine> {
    let settings = config::load_at(home).context("failed to load reposync config")?;
    SyncEngine::from_settings(home, &settings).context("failed to open repository registry")
}

/// `Ok(None)` means no daemon is listening and the caller should do the work
/// in-process.
pub(crate) fn via_daemon<T>(answer: Result<T, DaemonError>, action: &str) -> Result<Option<T>> {
    match answer {
        Ok(value) => Ok(Some(value)),
        Err(DaemonError::DaemonNotRunning { .. }) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("daemon could not {action}")),
    }
}

/// Warnings from in-process work go to stderr; `RUST_LOG` overrides.
pub(crate) fn init_cli_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Coarse age such as `42s`, `5m`, `3h` or `2d`.
pub(crate) fn format_age(timestamp: DateTime<Utc>) -> String {
    let seconds = Utc::now()
        .signed_duration_since(timestamp)
        .num_seconds()
        .max(0);
    match seconds {
        s if s < 60 => format!("{s}s"),
        s if s < 60 * 60 => format!("{}m", s / 60),
        s if s < 60 * 60 * 24 => format!("{}h", s / (60 * 60)),
        s => format!("{}d", s / (60 * 60 * 24)),
    }
}

pub(crate) fn format_last_sync(timestamp: Option<DateTime<Utc>>) -> String {
    timestamp
        .map(|t| format!("{} ago", format_age(t)))
        .unwrap_or_else(|| "never".to_string())
}
