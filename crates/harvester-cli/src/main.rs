//! Harvester CLI
//!
//! Command-line interface for managing the harvester daemon and triggering
//! workspace harvests.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use harvester_core::HarvesterConfig;
use harvester_engine::{FsObjectStore, LedgerStore};
use harvester_ipc::{HarvestAck, IpcClient, Request, Response, ResponseData, RunStatus, RunSummary};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "harvester")]
#[command(about = "Workspace harvester - incremental catalogue harvesting")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the harvester daemon
    Start {
        /// Run in foreground (for debugging)
        #[arg(short, long)]
        foreground: bool,
    },

    /// Stop the harvester daemon
    Stop,

    /// Show daemon status
    Status,

    /// Check if daemon is running
    Ping,

    /// Trigger a harvest of one workspace
    Harvest {
        /// Workspace id (top-level prefix in the source bucket)
        workspace: String,
    },

    /// Show the last finished run of a workspace
    LastRun {
        workspace: String,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the persisted fingerprint ledger of a workspace
    Ledger { workspace: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt().with_target(false).init();
    }

    let cli = Cli::parse();
    let config = HarvesterConfig::load();
    let client = IpcClient::with_socket_path(&config.socket_path);

    match cli.command {
        Commands::Start { foreground } => cmd_start(&client, foreground).await,
        Commands::Stop => cmd_stop(&client).await,
        Commands::Status => cmd_status(&client).await,
        Commands::Ping => cmd_ping(&client).await,
        Commands::Harvest { workspace } => cmd_harvest(&client, &workspace).await,
        Commands::LastRun { workspace, json } => cmd_last_run(&client, &workspace, json).await,
        Commands::Ledger { workspace } => cmd_ledger(&config, &workspace).await,
    }
}

async fn cmd_start(client: &IpcClient, foreground: bool) -> Result<()> {
    if foreground {
        println!("Starting harvester daemon in foreground...");
        println!("Press Ctrl+C to stop.");

        let status = std::process::Command::new("harvester-daemon")
            .status()
            .context("Failed to start daemon. Is harvester-daemon in PATH?")?;

        if !status.success() {
            anyhow::bail!("Daemon exited with error");
        }
    } else {
        if client.is_daemon_running() {
            println!("Harvester daemon is already running.");
            return Ok(());
        }

        let child = std::process::Command::new("harvester-daemon")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .context("Failed to start daemon")?;

        println!("✓ Harvester daemon started (PID: {})", child.id());
    }

    Ok(())
}

async fn cmd_stop(client: &IpcClient) -> Result<()> {
    if !client.is_daemon_running() {
        println!("Harvester daemon is not running.");
        return Ok(());
    }

    match client.request(Request::Shutdown).await {
        Ok(Response::Ok { .. }) | Ok(Response::Ack) => {
            println!("✓ Harvester daemon stopping...");

            // In-flight runs get time to persist their ledgers
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;

            if !client.is_daemon_running() {
                println!("✓ Daemon stopped.");
            }
        }
        Ok(resp) => {
            println!("Unexpected response: {:?}", resp);
        }
        Err(e) => {
            println!("Failed to stop daemon: {}", e);
        }
    }

    Ok(())
}

async fn cmd_status(client: &IpcClient) -> Result<()> {
    if !client.is_daemon_running() {
        println!("Harvester daemon is not running.");
        println!("\nStart with: harvester start");
        return Ok(());
    }

    match client.get_status().await {
        Ok(ResponseData::Status {
            version,
            uptime_secs,
            active_runs,
            runs_started,
            runs_completed,
            runs_failed,
            runs_throttled,
            batches_emitted,
            avg_run_ms,
            p99_run_ms,
        }) => {
            println!("Harvester Daemon v{}", version);
            println!();
            println!("  Status:     Running");
            println!("  Uptime:     {}", format_duration(uptime_secs));
            println!("  Active:     {} run(s)", active_runs);
            println!();
            println!("  Started:    {}", runs_started);
            println!("  Completed:  {}", runs_completed);
            println!("  Failed:     {}", runs_failed);
            println!("  Throttled:  {}", runs_throttled);
            println!("  Batches:    {}", batches_emitted);
            println!("  Avg Run:    {}ms (p99 {}ms)", avg_run_ms, p99_run_ms);
        }
        Ok(_) => {
            println!("Unexpected status response");
        }
        Err(e) => {
            println!("Failed to get status: {}", e);
        }
    }

    Ok(())
}

async fn cmd_ping(client: &IpcClient) -> Result<()> {
    if !client.is_daemon_running() {
        println!("✗ Daemon not running");
        return Ok(());
    }

    let start = std::time::Instant::now();
    match client.request(Request::Ping).await {
        Ok(Response::Ok {
            data: Some(ResponseData::Pong { .. }),
        }) => {
            let elapsed = start.elapsed();
            println!("✓ Pong! ({:.2}ms)", elapsed.as_secs_f64() * 1000.0);
        }
        Ok(_) => {
            println!("✗ Unexpected response");
        }
        Err(e) => {
            println!("✗ Error: {}", e);
        }
    }

    Ok(())
}

async fn cmd_harvest(client: &IpcClient, workspace: &str) -> Result<()> {
    if !client.is_daemon_running() {
        println!("✗ Daemon not running. Start with: harvester start");
        return Ok(());
    }

    match client.harvest(workspace).await {
        Ok(HarvestAck::Accepted) => {
            println!("✓ Harvest of {} accepted", workspace);
            println!("Check the outcome with: harvester last-run {}", workspace);
        }
        Ok(HarvestAck::Throttled { retry_after_secs }) => {
            println!(
                "✗ Harvest of {} rejected, retry in {}s",
                workspace, retry_after_secs
            );
        }
        Err(e) => {
            println!("✗ Error: {}", e);
        }
    }

    Ok(())
}

async fn cmd_last_run(client: &IpcClient, workspace: &str, json: bool) -> Result<()> {
    if !client.is_daemon_running() {
        println!("✗ Daemon not running");
        return Ok(());
    }

    match client.last_run(workspace).await {
        Ok(Some(summary)) if json => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Ok(Some(summary)) => print_summary(&summary),
        Ok(None) => {
            println!("No finished run recorded for {}", workspace);
        }
        Err(e) => {
            println!("✗ Error: {}", e);
        }
    }

    Ok(())
}

/// Read the ledger straight from storage; works without a daemon.
async fn cmd_ledger(config: &HarvesterConfig, workspace: &str) -> Result<()> {
    let store = Arc::new(FsObjectStore::new(config.storage_root.clone()));
    let options = config.harvest_options();
    let ledgers = LedgerStore::new(
        store,
        options.target_bucket,
        options.ledger_prefix,
        options.storage_timeout,
    );

    let ledger = ledgers.load(workspace).await;
    if ledger.is_empty() {
        println!("No ledger entries for {}", workspace);
        return Ok(());
    }

    println!("Ledger: {}", ledgers.ledger_key(workspace));
    println!("  Persisted:  {}", ledger.last_persisted_at());
    println!("  Entries:    {}", ledger.len());
    println!();
    for (key, fingerprint) in ledger.entries() {
        match ledger.path(key) {
            Some(path) => println!("  {}  {}  -> {}", fingerprint, key, path),
            None => println!("  {}  {}", fingerprint, key),
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let marker = match summary.status {
        RunStatus::Completed => "✓",
        RunStatus::Failed => "✗",
    };
    println!("{} {} ({:?})", marker, summary.workspace, summary.status);
    println!("  Started:    {}", format_timestamp(summary.started_at));
    println!("  Finished:   {}", format_timestamp(summary.finished_at));
    println!("  Listed:     {}", summary.listed);
    println!("  Changed:    {}", summary.changed);
    println!("  Deleted:    {}", summary.deleted);
    println!("  Cascaded:   {}", summary.cascaded);
    println!("  Failures:   {}", summary.failures);
    println!("  Batches:    {}", summary.batches);
    if let Some(error) = &summary.error {
        println!("  Error:      {}", error);
    }
}

fn format_timestamp(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}
