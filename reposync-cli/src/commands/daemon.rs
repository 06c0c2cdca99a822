//! `reposync daemon`: background scheduler lifecycle.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use reposync_daemon::{start_blocking, ControlClient, DaemonError, LogFormat};

use super::home_dir;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (scheduler + socket server).
    Start(StartArgs),
    /// Ask a running daemon to finish its batch and exit.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status,
    /// Make a running daemon re-read the registry file.
    Reload,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Emit one JSON object per log line.
    #[arg(long)]
    pub json_logs: bool,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = home_dir()?;
    let client = ControlClient::new(&home);

    match command {
        DaemonCommand::Start(args) => {
            let format = if args.json_logs {
                LogFormat::Json
            } else {
                LogFormat::Text
            };
            start_blocking(&home, format).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match client.stop() {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match client.status() {
            Ok(status) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status)
                        .context("failed to render daemon status JSON")?
                );
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let payload = serde_json::json!({
                    "running": false,
                    "socket": client.socket().display().to_string(),
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload)
                        .context("failed to render daemon status JSON")?
                );
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        DaemonCommand::Reload => match client.reload() {
            Ok(count) => println!("daemon reloaded {count} repositories"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to reload daemon registry"),
        },
    }

    Ok(())
}
