//! `reposync repo ...`: registry management.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use reposync_core::{registry, NewRepository, RepoId, RepositoryRecord, RepositoryUpdate};
use reposync_daemon::ControlClient;
use reposync_sync::RepoStatus;

use super::{format_last_sync, home_dir, init_cli_tracing, open_engine, via_daemon};

#[derive(Subcommand, Debug)]
pub enum RepoCommand {
    /// Clone a remote and add it to the registry.
    Add(AddArgs),
    /// List registered repositories.
    List(ListArgs),
    /// Show one repository's record and local clone state.
    Show(ShowArgs),
    /// Change the enabled, read-only or display-name fields.
    Update(UpdateArgs),
    /// Delete the record and its local clone.
    Remove(RemoveArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Repository id, conventionally `owner/name`.
    pub id: String,

    /// Clone URL. Never embed credentials here; set the token env var instead.
    pub remote_url: String,

    /// Clone location relative to the repositories root. Defaults to the id.
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Branch to check out and track.
    #[arg(long, default_value = "main")]
    pub branch: String,

    /// Display name. Defaults to the last segment of the id.
    #[arg(long)]
    pub name: Option<String>,

    /// Include the repository in scheduled syncs.
    #[arg(long)]
    pub enable: bool,

    /// Push local commits back to the remote.
    #[arg(long)]
    pub writable: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    pub id: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    pub id: String,

    #[arg(long, conflicts_with = "disable")]
    pub enable: bool,

    #[arg(long)]
    pub disable: bool,

    #[arg(long, conflicts_with = "writable")]
    pub read_only: bool,

    #[arg(long)]
    pub writable: bool,

    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    pub id: String,
}

pub fn run(cmd: RepoCommand) -> Result<()> {
    init_cli_tracing();
    match cmd {
        RepoCommand::Add(args) => add(args),
        RepoCommand::List(args) => list(args),
        RepoCommand::Show(args) => show(args),
        RepoCommand::Update(args) => update(args),
        RepoCommand::Remove(args) => remove(args),
    }
}

fn add(args: AddArgs) -> Result<()> {
    let home = home_dir()?;
    let engine = open_engine(&home)?;

    let mut new = NewRepository::new(args.id.as_str(), args.remote_url);
    if let Some(path) = args.path {
        new.local_path = path;
    }
    if let Some(name) = args.name {
        new.name = name;
    }
    new.default_branch = args.branch;
    new.enabled = args.enable;
    new.read_only = !args.writable;

    let record = engine
        .register(new)
        .with_context(|| format!("failed to register '{}'", args.id))?;
    let path = registry::lock(engine.registry())?.clone_path(&record);
    println!("registered {} at {}", record.id.to_string().bold(), path.display());
    if !record.enabled {
        println!("Run 'reposync repo update {} --enable' to include it in scheduled syncs.", record.id);
    }
    Ok(())
}

#[derive(Tabled)]
struct RepoTableRow {
    #[tabled(rename = "id")]
    id: String,
    #[tabled(rename = "branch")]
    branch: String,
    #[tabled(rename = "enabled")]
    enabled: String,
    #[tabled(rename = "mode")]
    mode: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "last sync")]
    last_sync: String,
}

fn list(args: ListArgs) -> Result<()> {
    let home = home_dir()?;
    let engine = open_engine(&home)?;
    let records: Vec<RepositoryRecord> = registry::lock(engine.registry())?.list().to_vec();

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&records).context("failed to serialize repositories")?
        );
        return Ok(());
    }

    if records.is_empty() {
        println!("No repositories registered.");
        println!("Run: reposync repo add <id> <remote-url>");
        return Ok(());
    }

    let rows: Vec<RepoTableRow> = records
        .into_iter()
        .map(|r| RepoTableRow {
            id: r.id.to_string(),
            branch: r.default_branch,
            enabled: if r.enabled { "yes" } else { "no" }.to_string(),
            mode: if r.read_only { "read-only" } else { "read-write" }.to_string(),
            status: r.sync_status.to_string(),
            last_sync: format_last_sync(r.last_synced),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

#[derive(Serialize)]
struct ShowJson<'a> {
    record: &'a RepositoryRecord,
    clone_path: PathBuf,
    local: &'a RepoStatus,
}

fn show(args: ShowArgs) -> Result<()> {
    let home = home_dir()?;
    let engine = open_engine(&home)?;
    let id = RepoId::from(args.id);
    let (record, clone_path) = {
        let registry = registry::lock(engine.registry())?;
        let record = registry.get(&id)?.clone();
        let path = registry.clone_path(&record);
        (record, path)
    };
    let local = engine.status(&record);

    if args.json {
        let payload = ShowJson {
            record: &record,
            clone_path,
            local: &local,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to serialize repository")?
        );
        return Ok(());
    }

    println!("{}", record.id.to_string().bold());
    println!("  name:          {}", record.name);
    println!("  remote:        {}", record.remote_url);
    println!("  clone:         {}", clone_path.display());
    println!("  branch:        {}", record.default_branch);
    println!("  enabled:       {}", record.enabled);
    println!("  read-only:     {}", record.read_only);
    println!("  status:        {}", record.sync_status);
    println!("  last sync:     {}", format_last_sync(record.last_synced));
    if let Some(message) = &record.error_message {
        println!("  last error:    {}", message.red());
    }
    if local.exists {
        println!(
            "  checked out:   {}",
            local.current_branch.as_deref().unwrap_or("(detached)")
        );
        println!("  local changes: {}", local.has_local_changes);
        println!(
            "  divergence:    {} ahead, {} behind (as of last fetch)",
            local.ahead_of_remote, local.behind_of_remote
        );
    } else {
        println!("  clone:         {}", "missing".yellow());
    }
    Ok(())
}

fn update(args: UpdateArgs) -> Result<()> {
    let change = RepositoryUpdate {
        enabled: flag_pair(args.enable, args.disable),
        read_only: flag_pair(args.read_only, args.writable),
        name: args.name,
    };
    if change.is_empty() {
        bail!("nothing to update; pass --enable/--disable, --read-only/--writable or --name");
    }

    let home = home_dir()?;
    let id = RepoId::from(args.id);
    let record = match via_daemon(
        ControlClient::new(&home).update(&id, change.clone()),
        &format!("update '{id}'"),
    )? {
        Some(record) => record,
        None => {
            let engine = open_engine(&home)?;
            let updated = registry::lock(engine.registry())?
                .update(&id, change)
                .with_context(|| format!("failed to update '{id}'"))?;
            updated
        }
    };
    println!(
        "updated {}: enabled={} read_only={} name={}",
        record.id, record.enabled, record.read_only, record.name
    );
    Ok(())
}

/// A running daemon does the removal so it never syncs a deleted clone.
fn remove(args: RemoveArgs) -> Result<()> {
    let home = home_dir()?;
    let id = RepoId::from(args.id);
    let removed = match via_daemon(
        ControlClient::new(&home).remove(&id),
        &format!("remove '{id}'"),
    )? {
        Some(record) => record,
        None => open_engine(&home)?
            .unregister(&id)
            .with_context(|| format!("failed to remove '{id}'"))?,
    };
    println!("removed {}", removed.id);
    Ok(())
}

/// `--on` / `--off` style flags; clap rejects both at once.
fn flag_pair(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}
