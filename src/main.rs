//! SymSync - Trigger-based change capture and batch replication
//!
//! Command line entry point: runs a node or one of its jobs on demand.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use symsync::api::HttpServer;
use symsync::config::SyncConfig;
use symsync::engine::SyncEngine;
use symsync::model::RemoteNodeStatus;

/// SymSync - change capture and batch replication for SQLite
#[derive(Parser)]
#[command(name = "symsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "symsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node and run its jobs until interrupted
    Start,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "symsync.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "001")]
        node_id: String,

        /// Node group
        #[arg(long, default_value = "store")]
        group_id: String,

        /// Registration server URL
        #[arg(long, default_value = "http://localhost:31415/sync")]
        registration_url: String,
    },

    /// Rebuild database triggers
    SyncTriggers {
        /// Rebuild every trigger even when nothing changed
        #[arg(long)]
        force: bool,
    },

    /// Route captured changes into batches
    Route,

    /// Push batches to nodes this node pushes to
    Push,

    /// Pull batches from nodes this node pulls from
    Pull,

    /// Queue a reload of a table for one node
    Reload {
        /// Target node
        #[arg(long)]
        node_id: String,

        /// Trigger of the table to reload
        #[arg(long)]
        trigger_id: String,

        /// Restrict the reloaded rows
        #[arg(long = "where")]
        where_clause: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            output,
            node_id,
            group_id,
            registration_url,
        } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(&output, &node_id, &group_id, &registration_url)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_validate(&cli.config)
        }
        command => {
            let config = load_config(&cli.config)?;
            init_logging(
                cli.log_level.as_deref().unwrap_or(&config.logging.level),
                &config.logging.format,
            );
            run_command(config, command).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<SyncConfig> {
    SyncConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

async fn run_command(config: SyncConfig, command: Commands) -> anyhow::Result<()> {
    let engine = SyncEngine::open(config)
        .await
        .context("failed to start the sync engine")?;

    match command {
        Commands::Start => run_start(Arc::new(engine)).await,
        Commands::SyncTriggers { force } => {
            let summary = engine.sync_triggers(force).await?;
            println!(
                "Triggers: {} rebuilt, {} repaired, {} removed, {} failed",
                summary.rebuilt, summary.repaired, summary.removed, summary.failed
            );
            Ok(())
        }
        Commands::Route => {
            let routed = engine.route().await?;
            println!("Routed {} data events", routed);
            Ok(())
        }
        Commands::Push => {
            print_statuses("push", &engine.push().await?);
            Ok(())
        }
        Commands::Pull => {
            print_statuses("pull", &engine.pull().await?);
            Ok(())
        }
        Commands::Reload {
            node_id,
            trigger_id,
            where_clause,
        } => {
            let batch_ids = engine
                .reload_table(&node_id, &trigger_id, where_clause.as_deref())
                .await?;
            println!("Queued reload in batches {:?}", batch_ids);
            Ok(())
        }
        Commands::Init { .. } | Commands::Validate => Ok(()),
    }
}

/// Run the jobs and the API until Ctrl-C
async fn run_start(engine: Arc<SyncEngine>) -> anyhow::Result<()> {
    tracing::info!("Starting node {}", engine.config().node_id());

    let summary = engine.sync_triggers(false).await?;
    if summary.failed > 0 {
        tracing::warn!("{} triggers failed to build", summary.failed);
    }

    let jobs = engine.start();
    let api = HttpServer::new(engine.config().api.clone(), Arc::clone(&engine));
    let api_enabled = engine.config().api.enabled;

    tokio::select! {
        result = api.start(), if api_enabled => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    engine.shutdown();
    for job in jobs {
        if let Err(e) = job.await {
            tracing::warn!("Job task ended abnormally: {}", e);
        }
    }
    tracing::info!("Node {} stopped", engine.config().node_id());
    Ok(())
}

fn run_init(output: &Path, node_id: &str, group_id: &str, registration_url: &str) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    std::fs::write(output, SyncConfig::template(node_id, group_id, registration_url))
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration written to {}", output.display());
    Ok(())
}

fn run_validate(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    println!("Configuration is valid");
    println!("  Node:      {} ({})", config.node_id(), config.node.group_id);
    println!("  Database:  {}", config.database.path.display());
    println!("  Sync URL:  {}", config.sync_url());
    println!("  Peers:     {}", config.peers.len());
    println!("  Links:     {}", config.links.len());
    println!(
        "  API:       {}",
        if config.api.enabled {
            config.api.bind_address.as_str()
        } else {
            "disabled"
        }
    );
    Ok(())
}

fn print_statuses(action: &str, statuses: &[RemoteNodeStatus]) {
    if statuses.is_empty() {
        println!("No nodes to {}", action);
    }
    for status in statuses {
        println!(
            "{} {}: {:?}, {} batches, {} rows{}",
            action,
            status.node_id,
            status.status,
            status.batches_processed,
            status.data_processed,
            status
                .failure_message
                .as_deref()
                .map(|m| format!(" ({})", m))
                .unwrap_or_default()
        );
    }
}
