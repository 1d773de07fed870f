//! Stonesthrow client.
//!
//! Snapshots the working tree as `BUILDER_HEAD`, routes the request to the
//! host that builds the selected platform, and prints the session's events.
//! Invoked through a link named after a platform (`st` symlinked as `mac`),
//! the platform defaults to that name.

#![forbid(unsafe_code)]

mod relay;
mod render;
mod router;

use anyhow::{Context, Result, bail};
use clap::Parser;
use st_common::config::{ConfigFile, HostId, ResolvedConfig, local_host_name};
use st_common::connection::LoopbackConnection;
use st_common::dispatch::requires_revision;
use st_common::logging::{LogConfig, init_logging};
use st_common::protocol::{Event, Request};
use st_common::{Channel, Executor, RepoOps};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use render::{Console, OutputMode};

/// Handled on the client: push branches upstream, then hand their config to
/// the server.
const PUSH: &str = "push";
const SET_BRANCH_CONFIG: &str = "set_branch_config";

#[derive(Parser)]
#[command(name = "st")]
#[command(author, version, about = "Stonesthrow - build and test on the host that owns a platform")]
struct Cli {
    /// Configuration file (defaults to ~/.stonesthrow)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server platform (defaults to the name this binary was invoked as)
    #[arg(short, long)]
    platform: Option<String>,

    /// Repository (defaults to the first one building the platform)
    #[arg(short, long)]
    repository: Option<String>,

    /// Act as this configured host instead of the local machine
    #[arg(long)]
    host: Option<String>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Relay stdin/stdout to the local server endpoint
    #[arg(long, hide = true)]
    passthrough: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Command to run on the server (try `help`)
    command: Option<String>,

    /// Arguments for the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    arguments: Vec<String>,
}

/// Platform implied by the binary's name, unless it is plain `st`.
fn platform_from_argv0() -> Option<String> {
    let argv0 = std::env::args_os().next()?;
    let stem = Path::new(&argv0).file_stem()?.to_string_lossy().into_owned();
    (stem != "st").then_some(stem)
}

/// Build the request for `command`, snapshotting the working tree when the
/// command needs it. `push` is carried out here and becomes a
/// `set_branch_config` request.
async fn prepare_request(
    repo: &RepoOps,
    client: &ResolvedConfig,
    server: &ResolvedConfig,
    command: &str,
    arguments: &[String],
) -> Result<Request> {
    let request = Request::new(command)
        .with_arguments(arguments.iter().cloned())
        .with_repository(server.repository.name.clone())
        .with_source_host(client.host_id().to_string());

    if command == PUSH {
        return push_branches(repo, request, arguments).await;
    }
    if requires_revision(command) {
        let revision = repo.create_builder_head().await?;
        debug!("BUILDER_HEAD at {}", revision);
        return Ok(request.with_revision(revision));
    }
    Ok(request)
}

async fn push_branches(repo: &RepoOps, request: Request, arguments: &[String]) -> Result<Request> {
    let requested: Vec<String> = if arguments.is_empty() {
        vec!["HEAD".to_string()]
    } else {
        arguments.to_vec()
    };
    let mut branches = Vec::with_capacity(requested.len());
    for branch in requested {
        if branch == "HEAD" {
            branches.push(repo.current_branch().await.context("HEAD is not on a branch")?);
        } else {
            branches.push(branch);
        }
    }

    let report = repo.push(&branches, false).await?;
    info!("Pushed {} refs", report.known_branches.len());
    let branch_configs = repo.get_branch_config(&branches).await?;
    Ok(Request {
        command: SET_BRANCH_CONFIG.to_string(),
        arguments: Vec::new(),
        branch_configs,
        ..request
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("warn").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _log_guards = init_logging(&log_config)?;

    let Some(platform) = cli.platform.clone().or_else(platform_from_argv0) else {
        bail!("Need to specify a platform (--platform)");
    };
    let file = ConfigFile::load_default(cli.config.as_deref())?;
    let repository = match &cli.repository {
        Some(name) => name.clone(),
        None => file.repository_for_platform(&platform)?,
    };
    let server = file
        .select_server(&platform, &repository)
        .context("Cannot determine server configuration")?;
    let local_name = match &cli.host {
        Some(name) => name.clone(),
        None => local_host_name()?,
    };

    if cli.passthrough {
        let local = file
            .resolve_host(&local_name)
            .map(|host| host.id.clone())
            .unwrap_or_else(|| HostId::new(local_name.as_str()));
        relay::passthrough(&server, &local).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let client = file
        .select_local(&local_name, Some(&platform), &repository)
        .context("Cannot determine local configuration")?;
    let Some(command) = cli.command.as_deref() else {
        bail!("No command given. Try 'st help'.");
    };

    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Plain
    };
    let (sink, events) = mpsc::unbounded_channel::<Event>();
    let console = Console::new(server.host_id().as_str(), mode);
    let printer = tokio::spawn(render::drain(events, console));

    // Local git commands report through the same sink as the server.
    let local_channel = Channel::new(Arc::new(LoopbackConnection::new(sink.clone())));
    let repo = RepoOps::new(
        client.source_path(),
        client.git().clone(),
        Executor::new(client.host_id().as_str(), local_channel),
    );

    let outcome = match prepare_request(&repo, &client, &server, command, &cli.arguments).await {
        Ok(request) => router::run(&file, &client, &server, &repo, request, sink)
            .await
            .map_err(anyhow::Error::from),
        Err(e) => {
            drop(sink);
            Err(e)
        }
    };
    drop(repo);
    let saw_error = printer.await.unwrap_or(true);

    outcome.with_context(|| format!("'{command}' on {platform} failed"))?;
    Ok(if saw_error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
