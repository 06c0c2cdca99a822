//! `reposync status`: last sync result plus local clone state, no network.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use reposync_core::{registry, RepoId, RepositoryRecord, SyncStatus};
use reposync_sync::RepoStatus;

use super::{format_last_sync, home_dir, init_cli_tracing, open_engine};

/// Arguments for `reposync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Limit the report to one repository.
    pub repository: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        init_cli_tracing();
        let home = home_dir()?;
        let engine = open_engine(&home)?;

        let mut records: Vec<RepositoryRecord> = {
            let registry = registry::lock(engine.registry())?;
            match &self.repository {
                Some(id) => vec![registry.get(&RepoId::from(id.as_str()))?.clone()],
                None => registry.list().to_vec(),
            }
        };
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let rows: Vec<RepositoryState> = records
            .into_iter()
            .map(|record| RepositoryState {
                local: engine.status(&record),
                record,
            })
            .collect();

        if self.json {
            print_json(&rows)?;
        } else {
            print_table(&rows);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct RepositoryState {
    #[serde(flatten)]
    record: RepositoryRecord,
    local: RepoStatus,
}

#[derive(Serialize)]
struct StatusSummaryJson {
    repositories: usize,
    enabled: usize,
    errors: usize,
    conflicts: usize,
}

#[derive(Serialize)]
struct StatusReportJson<'a> {
    summary: StatusSummaryJson,
    repositories: &'a [RepositoryState],
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "repository")]
    repository: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "branch")]
    branch: String,
    #[tabled(rename = "ahead")]
    ahead: usize,
    #[tabled(rename = "behind")]
    behind: usize,
    #[tabled(rename = "local changes")]
    local_changes: String,
    #[tabled(rename = "last sync")]
    last_sync: String,
}

fn summary(rows: &[RepositoryState]) -> StatusSummaryJson {
    let count = |status: SyncStatus| {
        rows.iter()
            .filter(|r| r.record.sync_status == status)
            .count()
    };
    StatusSummaryJson {
        repositories: rows.len(),
        enabled: rows.iter().filter(|r| r.record.enabled).count(),
        errors: count(SyncStatus::Error),
        conflicts: count(SyncStatus::Conflict),
    }
}

fn print_json(rows: &[RepositoryState]) -> Result<()> {
    let payload = StatusReportJson {
        summary: summary(rows),
        repositories: rows,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
    );
    Ok(())
}

fn print_table(rows: &[RepositoryState]) {
    let totals = summary(rows);
    println!(
        "reposync v{} | {} repositories | {} enabled | {} errors | {} conflicts",
        env!("CARGO_PKG_VERSION"),
        totals.repositories,
        totals.enabled,
        totals.errors,
        totals.conflicts,
    );

    if rows.is_empty() {
        println!("No repositories registered.");
        return;
    }

    let separator = "■".repeat(67).bright_black().to_string();
    println!("{separator}");
    println!(
        "Indicators: {} SYNCED  {} CONFLICT  {} ERROR  {} NEVER SYNCED",
        status_indicator(SyncStatus::Synced),
        status_indicator(SyncStatus::Conflict),
        status_indicator(SyncStatus::Error),
        status_indicator(SyncStatus::Never),
    );
    println!("{separator}");

    let table_rows: Vec<StatusTableRow> = rows
        .iter()
        .map(|row| StatusTableRow {
            repository: row.record.id.to_string(),
            status: format!(
                "{} {}",
                status_indicator(row.record.sync_status),
                status_label(row)
            ),
            branch: row
                .local
                .current_branch
                .clone()
                .unwrap_or_else(|| "-".to_string()),
            ahead: row.local.ahead_of_remote,
            behind: row.local.behind_of_remote,
            local_changes: if row.local.has_local_changes { "yes" } else { "no" }.to_string(),
            last_sync: format_last_sync(row.record.last_synced),
        })
        .collect();
    let mut table = Table::new(table_rows);
    table.with(Style::rounded());
    println!("{table}");

    for row in rows {
        if let Some(message) = &row.record.error_message {
            println!("{}: {}", row.record.id.to_string().bold(), message);
        }
    }
    println!("{separator}");

    if totals.conflicts > 0 {
        println!("Resolve conflicts in the clone by hand, then run 'reposync sync <id>'.");
    }
}

fn status_label(row: &RepositoryState) -> String {
    if !row.local.exists {
        return "NOT CLONED".to_string();
    }
    let label = match row.record.sync_status {
        SyncStatus::Never => "NEVER SYNCED",
        SyncStatus::Pending => "PENDING",
        SyncStatus::Synced => "SYNCED",
        SyncStatus::Error => "ERROR",
        SyncStatus::Conflict => "CONFLICT",
        SyncStatus::Unavailable => "UNAVAILABLE",
    };
    if row.record.enabled {
        label.to_string()
    } else {
        format!("{label} (disabled)")
    }
}

fn status_indicator(status: SyncStatus) -> String {
    match status {
        SyncStatus::Synced => "■".green().bold().to_string(),
        SyncStatus::Conflict => "■".yellow().bold().to_string(),
        SyncStatus::Error | SyncStatus::Unavailable => "■".red().bold().to_string(),
        SyncStatus::Never | SyncStatus::Pending => "■".bright_black().bold().to_string(),
    }
}
