//! reposync daemon: the periodic [`Scheduler`], the reindex hook, and a
//! Unix-socket control channel for the CLI.

mod error;
pub mod paths;
pub mod protocol;
pub mod reindex;
mod runtime;
pub mod scheduler;

pub use error::DaemonError;
pub use protocol::{ControlClient, DaemonReply, DaemonRequest, DaemonStatus, RepositorySummary};
pub use reindex::{CommandReindexer, ReindexError, Reindexer};
pub use runtime::{
    run, run_once_blocking, serve, start_blocking, sync_one_blocking, Daemon, LogFormat,
};
pub use scheduler::{BatchReport, Scheduler, SchedulerConfig, SchedulerStatus};
