//! `asw` — manage and switch Aether identities from the command line.
//!
//! Every subcommand is a thin wrapper over the orchestrator, registry, and
//! lifecycle operations; no switching logic lives here.

mod paths;

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use aether_switch_core::{IdentityRecord, Registry, Settings};
use aether_switch_lifecycle::LifecycleController;
use aether_switch_orchestrator::{AppLifecycle, SwitchReport, Switcher};

#[derive(Debug, Parser)]
#[command(name = "asw", about = "Host multiple Aether identities on one machine", version)]
struct Cli {
    /// Override the tool data directory (registry, snapshots, settings).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the Aether state database path (non-standard installs).
    #[arg(long, global = true)]
    state_db: Option<PathBuf>,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List known identities, most recently used first.
    List,
    /// Snapshot the current session as a new or updated identity.
    Add {
        /// Display name; defaults to the email's local part.
        #[arg(long)]
        name: Option<String>,
        /// Account email; discovered from the live database when omitted.
        #[arg(long)]
        email: Option<String>,
    },
    /// Switch the installation to another identity.
    Switch {
        /// Identity id, email, or display name.
        identity: String,
    },
    /// Delete an identity and its snapshot.
    Delete {
        /// Identity id, email, or display name.
        identity: String,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    /// Launch Aether.
    Start,
    /// Stop all running Aether processes.
    Stop {
        /// Seconds to wait for processes to exit.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Snapshot maintenance.
    Snapshots {
        #[command(subcommand)]
        command: SnapshotsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SnapshotsCommand {
    /// Validate every identity's snapshot file.
    Verify,
    /// Remove snapshot files no identity references.
    Gc,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let data_dir = match cli.data_dir.clone() {
        Some(dir) => dir,
        None => paths::default_data_dir()?,
    };
    let settings = Settings::load(&data_dir);
    let registry = Registry::open(&data_dir).context("failed to open the identity registry")?;
    let layouts = paths::state_db_layouts(cli.state_db.clone());
    let lifecycle: Arc<dyn AppLifecycle> = Arc::new(LifecycleController::new());
    let switcher = Switcher::new(registry, layouts, lifecycle, settings.clone());

    match cli.command {
        Command::List => cmd_list(&switcher, cli.json),
        Command::Add { name, email } => {
            cmd_add(&switcher, name.as_deref(), email.as_deref(), cli.json)
        }
        Command::Switch { identity } => cmd_switch(&switcher, &identity, cli.json),
        Command::Delete { identity, yes } => cmd_delete(&switcher, &settings, &identity, yes),
        Command::Start => {
            switcher.start_app().context("failed to launch Aether")?;
            println!("Launch requested.");
            Ok(())
        }
        Command::Stop { timeout } => cmd_stop(&switcher, timeout),
        Command::Snapshots { command } => match command {
            SnapshotsCommand::Verify => cmd_verify(&switcher, cli.json),
            SnapshotsCommand::Gc => {
                let removed = switcher.registry().remove_orphaned_snapshots();
                println!("Removed {removed} orphaned snapshot file(s).");
                Ok(())
            }
        },
    }
}

fn cmd_list(switcher: &Switcher, json: bool) -> Result<()> {
    let identities = switcher.identities();
    if json {
        println!("{}", serde_json::to_string_pretty(&identities)?);
        return Ok(());
    }
    if identities.is_empty() {
        println!("No identities yet. Create one with `asw add`.");
        return Ok(());
    }
    for record in identities {
        println!(
            "{}  {:<24} {:<30} last used {}",
            record.id,
            record.name,
            record.email,
            render_time(record.last_used)
        );
    }
    Ok(())
}

fn cmd_add(switcher: &Switcher, name: Option<&str>, email: Option<&str>, json: bool) -> Result<()> {
    let (record, existed) = switcher
        .snapshot_current(name, email)
        .context("failed to snapshot the current session")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "identity": record,
                "updated_existing": existed,
            }))?
        );
        return Ok(());
    }
    if existed {
        println!("Updated snapshot for {} <{}>.", record.name, record.email);
    } else {
        println!("Created identity {} <{}> ({}).", record.name, record.email, record.id);
    }
    Ok(())
}

fn cmd_switch(switcher: &Switcher, needle: &str, json: bool) -> Result<()> {
    let target = resolve_identity(switcher, needle)?;
    let report = switcher
        .switch(&target.id.to_string())
        .with_context(|| format!("failed to switch to {}", target.name))?;
    print_report(&report, json)
}

fn print_report(report: &SwitchReport, json: bool) -> Result<()> {
    if json {
        let warnings: Vec<String> =
            report.warnings.iter().map(ToString::to_string).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "identity": &report.identity,
                "warnings": warnings,
            }))?
        );
        return Ok(());
    }
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    println!("Switched to {} <{}>.", report.identity.name, report.identity.email);
    Ok(())
}

fn cmd_delete(switcher: &Switcher, settings: &Settings, needle: &str, yes: bool) -> Result<()> {
    let target = resolve_identity(switcher, needle)?;
    if !yes && settings.confirm_before_delete && !confirm(&format!(
        "Delete identity {} <{}>?",
        target.name, target.email
    ))? {
        println!("Aborted.");
        return Ok(());
    }
    let removed = switcher.delete(&target.id.to_string())?;
    println!("Deleted {} <{}>.", removed.name, removed.email);
    Ok(())
}

fn cmd_stop(switcher: &Switcher, timeout: Option<u64>) -> Result<()> {
    let outcome = switcher
        .stop_app(timeout.map(Duration::from_secs))
        .context("failed to stop Aether")?;
    if outcome.attempts == 0 {
        println!("Aether is not running.");
    } else if outcome.forced {
        println!("Stopped after a forced kill ({:.1}s).", outcome.elapsed.as_secs_f64());
    } else {
        println!("Stopped ({:.1}s).", outcome.elapsed.as_secs_f64());
    }
    Ok(())
}

fn cmd_verify(switcher: &Switcher, json: bool) -> Result<()> {
    let results = switcher.registry().verify_snapshots();
    if json {
        let entries: Vec<serde_json::Value> = results
            .iter()
            .map(|(record, result)| {
                serde_json::json!({
                    "id": record.id,
                    "name": &record.name,
                    "valid": result.is_ok(),
                    "reason": result.as_ref().err().map(ToString::to_string),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    let mut invalid = 0usize;
    for (record, result) in &results {
        match result {
            Ok(()) => println!("ok       {} <{}>", record.name, record.email),
            Err(err) => {
                invalid += 1;
                println!("invalid  {} <{}>: {err}", record.name, record.email);
            }
        }
    }
    println!("{} snapshot(s) checked, {invalid} invalid.", results.len());
    Ok(())
}

/// Find one identity by id, email, or display name, in that order.
fn resolve_identity(switcher: &Switcher, needle: &str) -> Result<IdentityRecord> {
    let identities = switcher.identities();
    if let Some(record) = identities.iter().find(|record| record.id.to_string() == needle) {
        return Ok(record.clone());
    }
    if let Some(record) = identities.iter().find(|record| record.email == needle) {
        return Ok(record.clone());
    }
    let by_name: Vec<&IdentityRecord> =
        identities.iter().filter(|record| record.name == needle).collect();
    match by_name.as_slice() {
        [record] => Ok((*record).clone()),
        [] => bail!("no identity matches `{needle}` (try `asw list`)"),
        _ => bail!("`{needle}` is ambiguous, use the identity id instead"),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn render_time(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.to_string())
}
