//! Picks how a request reaches the server for its platform and drives the
//! exchange.
//!
//! Route priority, first match wins:
//!
//! 1. same host: dispatch in-process over a loopback connection;
//! 2. the server platform has an endpoint reachable from this host: dial it;
//! 3. this host has a shell transport to the server host: run a passthrough
//!    client there over the transport;
//! 4. this host has a shell transport to a host that can reach the server:
//!    run the passthrough client on that host instead.

use st_common::config::{ConfigFile, Endpoint, HostId, Network, ResolvedConfig};
use st_common::connection::{Connection, LoopbackConnection, PipeConnection, SocketConnection};
use st_common::errors::{ErrorKind, Result, StError};
use st_common::protocol::{Event, Request};
use st_common::session::discover_test_targets;
use st_common::{Channel, Dispatcher, RepoOps, Session, SessionTracker};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Loopback,
    Direct(Endpoint),
    /// Shell into `relay` (the server host) and run a passthrough client.
    Tunnel { relay: HostId, argv: Vec<String> },
    /// Shell into `relay`, which has an endpoint of its own for the server.
    IndirectTunnel { relay: HostId, argv: Vec<String> },
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loopback => write!(f, "loopback"),
            Self::Direct(endpoint) => write!(f, "direct {endpoint}"),
            Self::Tunnel { relay, .. } => write!(f, "tunnel via {relay}"),
            Self::IndirectTunnel { relay, .. } => write!(f, "indirect tunnel via {relay}"),
        }
    }
}

/// Choose a route from `client` to `server` without touching the network.
pub fn select_route(file: &ConfigFile, client: &ResolvedConfig, server: &ResolvedConfig) -> Result<Route> {
    if client.is_same_host(server) {
        return Ok(Route::Loopback);
    }

    let platform = server.platform()?;
    if let Some(endpoint) = platform.endpoint_for(client.host_id()) {
        return Ok(Route::Direct(endpoint.clone()));
    }

    let repository = server.repository.name.as_str();
    if let Some(transport) = client.host.transport_to(server.host_id()) {
        return Ok(Route::Tunnel {
            relay: server.host_id().clone(),
            argv: transport.shell_command(&server.host, &platform.name, repository),
        });
    }

    for endpoint in &platform.endpoints {
        if let Some(transport) = client.host.transport_to(&endpoint.host)
            && let Some(relay) = file.host(&endpoint.host)
        {
            return Ok(Route::IndirectTunnel {
                relay: relay.id.clone(),
                argv: transport.shell_command(relay, &platform.name, repository),
            });
        }
    }

    Err(StError::with_message(
        ErrorKind::NoRouteToTarget,
        format!(
            "no route from {} to {} for platform {}",
            client.host_id(),
            server.host_id(),
            platform.name
        ),
    ))
}

/// Open a socket to `endpoint`.
pub async fn dial(endpoint: &Endpoint) -> Result<Arc<dyn Connection>> {
    let failed = |e: std::io::Error| {
        StError::with_message(
            ErrorKind::ConnectionFailed,
            format!("cannot connect to {},{}", endpoint.network, endpoint.address),
        )
        .with_source(e)
    };
    match endpoint.network {
        Network::Tcp => {
            let stream = tokio::net::TcpStream::connect(&endpoint.address)
                .await
                .map_err(failed)?;
            Ok(Arc::new(SocketConnection::tcp(stream)))
        }
        #[cfg(unix)]
        Network::Unix => {
            let stream = tokio::net::UnixStream::connect(&endpoint.address)
                .await
                .map_err(failed)?;
            Ok(Arc::new(SocketConnection::unix(stream)))
        }
        #[cfg(not(unix))]
        Network::Unix => Err(StError::with_message(
            ErrorKind::ConnectionFailed,
            "unix endpoints are not supported on this platform",
        )),
    }
}

fn spawn_tunnel(relay: &HostId, argv: &[String]) -> Result<(Arc<dyn Connection>, Child)> {
    let (program, args) = argv.split_first().ok_or_else(|| StError::new(ErrorKind::EmptyCommand))?;
    debug!("Tunnel to {}: {:?}", relay, argv);
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            StError::with_message(
                ErrorKind::ConnectionFailed,
                format!("cannot start transport to {relay}"),
            )
            .with_source(e)
        })?;
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(StError::with_message(
            ErrorKind::ConnectionFailed,
            "transport pipes unavailable",
        ));
    };
    let connection = PipeConnection::new(relay.to_string(), stdout, stdin);
    Ok((Arc::new(connection), child))
}

/// Push `BUILDER_HEAD` so the server can check it out. A repository without
/// an upstream has nothing to push to.
async fn publish_builder_head(repo: &RepoOps) -> Result<()> {
    match repo.push_builder_head().await {
        Ok(report) => {
            debug!("Pushed {:?}", report.known_branches.keys().collect::<Vec<_>>());
            Ok(())
        }
        Err(e) if e.is(ErrorKind::NoUpstream) => {
            debug!("No upstream; not pushing BUILDER_HEAD");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Run `request` in this process against `server`.
async fn run_loopback(
    server: &ResolvedConfig,
    request: Request,
    sink: mpsc::UnboundedSender<Event>,
) -> Result<()> {
    let targets = discover_test_targets(server).await;
    let dispatcher = Dispatcher::new(server, &targets);
    let channel = Channel::new(Arc::new(LoopbackConnection::new(sink)));
    let session = Session::open(
        Arc::new(server.clone()),
        request,
        channel.clone(),
        Arc::new(SessionTracker::new()),
        CancellationToken::new(),
    )?;
    if let Err(e) = dispatcher.dispatch(&session).await {
        debug!("Loopback session ended with {}", e);
    }
    session.close();
    channel.close().await
}

/// Send `request` over `connection` and forward every reply into `sink`.
pub async fn pump(
    connection: &dyn Connection,
    request: Request,
    sink: &mpsc::UnboundedSender<Event>,
) -> Result<()> {
    connection.send(&Event::Request(request)).await?;
    while let Some(event) = connection.recv().await? {
        if sink.send(event).is_err() {
            warn!("Event sink closed; dropping the rest of the session");
            break;
        }
    }
    connection.close().await
}

/// Deliver `request` to the server for `server`'s platform, streaming every
/// event the session produces into `sink`.
pub async fn run(
    file: &ConfigFile,
    client: &ResolvedConfig,
    server: &ResolvedConfig,
    repo: &RepoOps,
    request: Request,
    sink: mpsc::UnboundedSender<Event>,
) -> Result<()> {
    let route = select_route(file, client, server)?;
    info!("Routing '{}' to {} ({})", request.command, server.host_id(), route);

    let (connection, relay) = match route {
        Route::Loopback => return run_loopback(server, request, sink).await,
        Route::Direct(endpoint) => {
            if !request.revision.is_empty() {
                publish_builder_head(repo).await?;
            }
            (dial(&endpoint).await?, None)
        }
        Route::Tunnel { relay, argv } | Route::IndirectTunnel { relay, argv } => {
            if !request.revision.is_empty() {
                publish_builder_head(repo).await?;
            }
            let (connection, child) = spawn_tunnel(&relay, &argv)?;
            (connection, Some((relay, child)))
        }
    };

    let result = pump(connection.as_ref(), request, &sink).await;
    if let Some((relay, mut child)) = relay {
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("Transport to {} exited with {}", relay, status),
                Err(e) => warn!("Transport to {} not reaped: {}", relay, e),
            }
        });
    }
    result
}
