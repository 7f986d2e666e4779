// crates/context-relay-cli/src/main.rs
// ============================================================================
// Module: Context Relay CLI Entry Point
// Description: Command dispatcher for the relay sidecar and its admin tasks.
// Purpose: Run the sidecar and give operators offline access to the cache,
//          the sync queue, and the connection log.
// Dependencies: clap, context-relay-config, context-relay-mcp, tokio
// ============================================================================

//! ## Overview
//! `serve` runs the sidecar with the configured front-side transport. The
//! remaining commands are operator tools that open the store directly, so
//! they work with no upstream reachable: cache statistics and clears, failed
//! queue-row inspection and retry, and the recent connection log. Security
//! posture: inputs are untrusted and validation fails closed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use clap::Subcommand;
use context_relay_config::ConfigError;
use context_relay_config::RelayConfig;
use context_relay_core::SystemClock;
use context_relay_core::UpstreamError;
use context_relay_core::tool_definitions;
use context_relay_engine::CacheEngine;
use context_relay_engine::DEFAULT_MAX_ATTEMPTS;
use context_relay_engine::WriteQueue;
use context_relay_mcp::RelayRuntime;
use context_relay_mcp::RuntimeError;
use context_relay_store_sqlite::SqliteStore;
use context_relay_store_sqlite::SqliteStoreConfig;
use context_relay_store_sqlite::StoreError;
use context_relay_upstream::build_upstream_client;
use serde_json::json;
use thiserror::Error;

// ============================================================================
// SECTION: CLI Surface
// ============================================================================

/// context-relay: an offline-resilient sidecar for MCP knowledge servers.
#[derive(Debug, Parser)]
#[command(name = "context-relay", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Command to run.
    #[command(subcommand)]
    command: CliCommand,
}

/// Top-level commands.
#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Run the sidecar with the configured front-side transport.
    Serve,
    /// Print the static tool catalog as JSON.
    Tools,
    /// Cache administration.
    Cache {
        /// Cache subcommand.
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// Sync-queue administration.
    Queue {
        /// Queue subcommand.
        #[command(subcommand)]
        command: QueueCommand,
    },
    /// Connection log inspection.
    Connection {
        /// Connection subcommand.
        #[command(subcommand)]
        command: ConnectionCommand,
    },
    /// Configuration helpers.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

/// Cache administration subcommands.
#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Print per-tier cache statistics.
    Stats,
    /// Delete cache rows, optionally scoped to one project.
    Clear {
        /// Limit the clear to one project.
        #[arg(long)]
        project: Option<String>,
    },
}

/// Sync-queue administration subcommands.
#[derive(Debug, Subcommand)]
enum QueueCommand {
    /// Print queue statistics.
    Stats,
    /// Replay pending mutations against the upstream now.
    Replay,
    /// List terminally failed rows.
    ListFailed,
    /// Reset a failed row back to pending.
    Retry {
        /// Queue row identifier.
        id: i64,
    },
    /// Delete all terminally failed rows.
    ClearFailed,
}

/// Connection log subcommands.
#[derive(Debug, Subcommand)]
enum ConnectionCommand {
    /// Print the most recent health samples.
    Log {
        /// Maximum samples to print.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

/// Configuration subcommands.
#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Load and validate the configuration, then exit.
    Validate,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI failures.
#[derive(Debug, Error)]
enum CliError {
    /// Configuration loading or validation failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Upstream transport setup or replay failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// Sidecar runtime failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    /// Output serialization failed.
    #[error("output serialization failed: {0}")]
    Output(String),
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Runs the parsed command.
async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    match cli.command {
        CliCommand::Serve => run_serve(cli.config.as_deref()).await,
        CliCommand::Tools => run_tools(),
        CliCommand::Cache { command } => run_cache(cli.config.as_deref(), command),
        CliCommand::Queue { command } => run_queue(cli.config.as_deref(), command).await,
        CliCommand::Connection { command } => run_connection(cli.config.as_deref(), command),
        CliCommand::Config { command } => run_config(cli.config.as_deref(), command),
    }
}

/// Writes an error line to stderr and returns a failing exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = writeln!(std::io::stderr(), "error: {message}");
    ExitCode::FAILURE
}

// ============================================================================
// SECTION: Command Handlers
// ============================================================================

/// Runs the sidecar until the front-side client disconnects.
async fn run_serve(config_path: Option<&std::path::Path>) -> Result<ExitCode, CliError> {
    let config = RelayConfig::load(config_path)?;
    let runtime = RelayRuntime::start(config)?;
    let served = runtime.serve().await;
    runtime.stop().await;
    served?;
    Ok(ExitCode::SUCCESS)
}

/// Prints the static tool catalog.
fn run_tools() -> Result<ExitCode, CliError> {
    print_json(&json!({ "tools": tool_definitions() }))?;
    Ok(ExitCode::SUCCESS)
}

/// Cache administration against the store, no upstream required.
fn run_cache(
    config_path: Option<&std::path::Path>,
    command: CacheCommand,
) -> Result<ExitCode, CliError> {
    let config = RelayConfig::load(config_path)?;
    let store = open_store(&config)?;
    let cache =
        CacheEngine::new(store, Arc::new(SystemClock), config.cache.max_dynamic_bytes);
    match command {
        CacheCommand::Stats => {
            let stats = cache.stats()?;
            print_json(&json!({
                "stats": stats,
                "max_dynamic_bytes": config.cache.max_dynamic_bytes,
            }))?;
        }
        CacheCommand::Clear { project } => {
            let removed = match project {
                Some(project) => cache.clear_project(&project)?,
                None => cache.clear_all()?,
            };
            print_json(&json!({ "removed": removed }))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Sync-queue administration; only `replay` needs the upstream reachable.
async fn run_queue(
    config_path: Option<&std::path::Path>,
    command: QueueCommand,
) -> Result<ExitCode, CliError> {
    let config = RelayConfig::load(config_path)?;
    let store = open_store(&config)?;
    match command {
        QueueCommand::Stats => {
            print_json(&json!({ "stats": store.queue_stats()? }))?;
        }
        QueueCommand::Replay => {
            let upstream = build_upstream_client(&config.upstream)?;
            let queue = WriteQueue::new(
                Arc::clone(&store),
                upstream,
                Arc::new(SystemClock),
                DEFAULT_MAX_ATTEMPTS,
            );
            let summary = queue.replay().await?;
            print_json(&json!({ "synced": summary.synced, "failed": summary.failed }))?;
        }
        QueueCommand::ListFailed => {
            print_json(&json!({ "failed": store.queue_failed()? }))?;
        }
        QueueCommand::Retry { id } => {
            let reset = store.queue_retry(id)?;
            if !reset {
                return Ok(emit_error(&format!("queue row {id} is not a failed row")));
            }
            print_json(&json!({ "retried": id }))?;
        }
        QueueCommand::ClearFailed => {
            print_json(&json!({ "removed": store.queue_clear_failed()? }))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Prints recent connection health samples.
fn run_connection(
    config_path: Option<&std::path::Path>,
    command: ConnectionCommand,
) -> Result<ExitCode, CliError> {
    let config = RelayConfig::load(config_path)?;
    let store = open_store(&config)?;
    match command {
        ConnectionCommand::Log { limit } => {
            print_json(&json!({ "samples": store.recent_connection_log(limit)? }))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Validates the configuration and reports the resolved cache path.
fn run_config(
    config_path: Option<&std::path::Path>,
    command: ConfigCommand,
) -> Result<ExitCode, CliError> {
    match command {
        ConfigCommand::Validate => {
            let config = RelayConfig::load(config_path)?;
            print_json(&json!({
                "ok": true,
                "database": config.cache.database_path(),
            }))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Opens the relay store for offline administration.
fn open_store(config: &RelayConfig) -> Result<Arc<SqliteStore>, CliError> {
    let store = SqliteStore::open(&SqliteStoreConfig::for_path(config.cache.database_path()))?;
    Ok(Arc::new(store))
}

/// Prints a JSON value to stdout.
fn print_json(value: &serde_json::Value) -> Result<(), CliError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|err| CliError::Output(err.to_string()))?;
    println!("{rendered}");
    Ok(())
}
