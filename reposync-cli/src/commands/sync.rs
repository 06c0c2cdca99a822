//! `reposync sync`: run a sync now, through the daemon when it is up.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use reposync_core::RepoId;
use reposync_daemon::{run_once_blocking, sync_one_blocking, BatchReport, ControlClient};
use reposync_sync::{OutcomeStatus, SyncOutcome};

use super::{home_dir, init_cli_tracing, via_daemon};

/// Arguments for `reposync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Repository id to sync (omit when using `--all`).
    pub repository: Option<String>,

    /// Sync every enabled repository.
    #[arg(long, conflicts_with = "repository")]
    pub all: bool,

    /// Run in this process even if a daemon is listening.
    #[arg(long)]
    pub local: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let daemon = ControlClient::new(&home);

        if self.all {
            let report = if self.local {
                None
            } else {
                via_daemon(daemon.sync_all(), "run the batch")?
            };
            let report = match report {
                Some(report) => report,
                None => {
                    init_cli_tracing();
                    run_once_blocking(&home).context("sync --all failed")?
                }
            };
            print_report(&report);
            if report.error_count > 0 {
                bail!(
                    "{} of {} repositories did not sync",
                    report.error_count,
                    report.attempted
                );
            }
            return Ok(());
        }

        let Some(repository) = self.repository else {
            bail!("provide a repository id or use --all");
        };
        let id = RepoId::from(repository);
        let outcome = if self.local {
            None
        } else {
            via_daemon(daemon.sync_one(&id), &format!("sync '{id}'"))?
        };
        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                init_cli_tracing();
                sync_one_blocking(&home, &id).with_context(|| format!("sync failed for '{id}'"))?
            }
        };
        print_outcome(&outcome);
        if !outcome.is_success() {
            bail!("'{}' did not sync", outcome.repository);
        }
        Ok(())
    }
}

fn print_report(report: &BatchReport) {
    if report.attempted == 0 {
        println!("No enabled repositories. Run 'reposync repo update <id> --enable'.");
        return;
    }
    for outcome in &report.outcomes {
        print_outcome(outcome);
    }
    println!(
        "{} attempted, {} ok, {} failed ({} conflicts) in {}ms",
        report.attempted,
        report.success_count,
        report.error_count,
        report.conflict_count,
        report.duration_ms,
    );
    if let Some(documents) = report.documents_indexed {
        println!("reindexed {documents} documents");
    }
}

fn print_outcome(outcome: &SyncOutcome) {
    let marker = match outcome.status {
        OutcomeStatus::Success => "■".green().bold(),
        OutcomeStatus::Conflict => "■".yellow().bold(),
        OutcomeStatus::Error => "■".red().bold(),
    };
    println!("{marker} {}: {}", outcome.repository, outcome.message);
    if let Some(detail) = &outcome.error_message {
        println!("    {}", detail.bright_black());
    }
}
