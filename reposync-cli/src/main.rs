//! reposync: keep a fleet of git clones in step with their remotes.
//!
//! # Usage
//!
//! ```text
//! reposync repo add <id> <remote-url> [--path <dir>] [--branch <name>] [--enable] [--writable]
//! reposync repo list [--json]
//! reposync repo show <id> [--json]
//! reposync repo update <id> [--enable|--disable] [--read-only|--writable] [--name <name>]
//! reposync repo remove <id>
//! reposync sync <id>
//! reposync sync --all
//! reposync status [<id>] [--json]
//! reposync daemon start|stop|status|reload
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{daemon::DaemonCommand, repo::RepoCommand, status::StatusArgs, sync::SyncArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "reposync",
    version,
    about = "Keep registered git repositories synchronized with their remotes",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register, inspect and remove managed repositories.
    Repo {
        #[command(subcommand)]
        command: RepoCommand,
    },

    /// Sync one repository, or every enabled one.
    Sync(SyncArgs),

    /// Show local state and last sync result for each repository.
    Status(StatusArgs),

    /// Run and control the background sync daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Repo { command } => commands::repo::run(command),
        Commands::Sync(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
