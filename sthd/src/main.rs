//! Stonesthrow host daemon.
//!
//! Serves one platform of one repository: accepts client connections on the
//! platform's endpoint and runs each request as a tracked session.

#![forbid(unsafe_code)]

mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use st_common::config::ConfigFile;
use st_common::logging::{LogConfig, init_logging};
use st_common::session::discover_test_targets;
use st_common::{Dispatcher, ResolvedConfig};
use std::path::PathBuf;
use tracing::{info, warn};

use server::Server;

#[derive(Parser)]
#[command(name = "sthd")]
#[command(author, version, about = "Stonesthrow host daemon - serve builds for one platform")]
struct Cli {
    /// Configuration file (defaults to ~/.stonesthrow)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Platform to serve
    #[arg(short, long)]
    platform: String,

    /// Repository to serve (defaults to the first one building the platform)
    #[arg(short, long)]
    repository: Option<String>,

    /// Serve as this configured host instead of the platform's owner
    #[arg(long)]
    host: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved configuration and exit
    ShowConfig,
}

fn resolve(cli: &Cli) -> Result<ResolvedConfig> {
    let file = ConfigFile::load_default(cli.config.as_deref())?;
    let repository = match &cli.repository {
        Some(name) => name.clone(),
        None => file.repository_for_platform(&cli.platform)?,
    };
    let config = match &cli.host {
        Some(host) => file.select_local(host, Some(&cli.platform), &repository)?,
        None => file.select_server(&cli.platform, &repository)?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _log_guards = init_logging(&log_config)?;

    let config = resolve(&cli).context("Cannot determine server configuration")?;

    if let Some(Commands::ShowConfig) = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    info!(
        "Starting sthd for {} on {} ({})",
        config.repository.name,
        config.host_id(),
        config.platform_name()
    );

    let targets = discover_test_targets(&config).await;
    info!("{} test targets available", targets.len());
    let dispatcher = Dispatcher::new(&config, &targets);

    let server = Server::bind(config, dispatcher).await?;
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted");
                shutdown.cancel();
            }
            Err(e) => warn!("Cannot listen for interrupts: {}", e),
        }
    });

    server.serve().await?;
    Ok(())
}
