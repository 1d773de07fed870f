//! Accept loop for one platform endpoint.
//!
//! Every accepted connection is handled on its own task: the first event must
//! be a request, which is either answered by the loop itself (`quit`, `join`)
//! or run as a tracked session through the dispatcher.

use st_common::config::{Endpoint, Network, ResolvedConfig};
use st_common::connection::{Connection, SocketConnection};
use st_common::dispatch::{JOIN, QUIT};
use st_common::errors::{ErrorKind, Result, StError};
use st_common::protocol::{Event, Request};
use st_common::{Channel, Dispatcher, Session, SessionId, SessionTracker};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, std::path::PathBuf),
}

impl Listener {
    async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint.network {
            Network::Tcp => {
                let listener = TcpListener::bind(&endpoint.address).await.map_err(|e| {
                    StError::with_message(
                        ErrorKind::ConnectionFailed,
                        format!("cannot listen on {}", endpoint.address),
                    )
                    .with_source(e)
                })?;
                Ok(Self::Tcp(listener))
            }
            #[cfg(unix)]
            Network::Unix => {
                let path = std::path::PathBuf::from(&endpoint.address);
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                let listener = tokio::net::UnixListener::bind(&path).map_err(|e| {
                    StError::with_message(
                        ErrorKind::ConnectionFailed,
                        format!("cannot listen on {}", path.display()),
                    )
                    .with_source(e)
                })?;
                Ok(Self::Unix(listener, path))
            }
            #[cfg(not(unix))]
            Network::Unix => Err(StError::with_message(
                ErrorKind::EndpointNotFound,
                "unix endpoints are not supported on this platform",
            )),
        }
    }

    async fn accept(&self) -> std::io::Result<Arc<dyn Connection>> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Arc::new(SocketConnection::tcp(stream)))
            }
            #[cfg(unix)]
            Self::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok(Arc::new(SocketConnection::unix(stream)))
            }
        }
    }

    fn local_address(&self) -> String {
        match self {
            Self::Tcp(listener) => listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
            #[cfg(unix)]
            Self::Unix(_, path) => path.display().to_string(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Self::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// State shared by every connection task.
struct ServerState {
    config: Arc<ResolvedConfig>,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<SessionTracker>,
    shutdown: CancellationToken,
}

pub struct Server {
    listener: Listener,
    state: Arc<ServerState>,
}

/// The endpoint a server for `config` listens on: the one reachable from the
/// server's own host, else the first configured.
pub fn listen_endpoint(config: &ResolvedConfig) -> Result<&Endpoint> {
    let platform = config.platform()?;
    platform
        .endpoint_for(config.host_id())
        .or_else(|| platform.endpoints.first())
        .ok_or_else(|| {
            StError::with_message(
                ErrorKind::EndpointNotFound,
                format!("platform '{}' has no endpoints", platform.name),
            )
        })
}

impl Server {
    pub async fn bind(config: ResolvedConfig, dispatcher: Dispatcher) -> Result<Self> {
        let endpoint = listen_endpoint(&config)?.clone();
        let listener = Listener::bind(&endpoint).await?;
        info!(
            "Serving {} {} on {},{}",
            config.repository.name,
            config.platform_name(),
            endpoint.network,
            listener.local_address()
        );
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                config: Arc::new(config),
                dispatcher: Arc::new(dispatcher),
                tracker: Arc::new(SessionTracker::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Address actually bound, e.g. with an ephemeral TCP port resolved.
    pub fn local_address(&self) -> String {
        self.listener.local_address()
    }

    /// Cancelling this token stops the accept loop and every running session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    pub async fn serve(&self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.state.shutdown.cancelled() => {
                    info!("Shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(connection) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            let peer = connection.describe();
                            if let Err(e) = state.handle(connection).await {
                                warn!("Connection {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("Accept error: {}", e),
                },
            }
        }
        Ok(())
    }
}

impl ServerState {
    async fn handle(&self, connection: Arc<dyn Connection>) -> Result<()> {
        let request = match connection.recv().await? {
            Some(Event::Request(request)) => request,
            Some(other) => {
                warn!(
                    "Expected a request from {}, got '{}'",
                    connection.describe(),
                    other.kind_name()
                );
                return connection.close().await;
            }
            None => {
                debug!("{} closed before sending a request", connection.describe());
                return Ok(());
            }
        };
        info!(command = %request.command, peer = %connection.describe(), "Request");

        let channel = Channel::new(connection);
        match request.command.as_str() {
            QUIT => {
                channel.info("Quitting").await;
                self.shutdown.cancel();
            }
            JOIN => self.join(&channel, &request).await,
            _ => self.run_session(channel.clone(), request).await,
        }
        channel.close().await
    }

    async fn join(&self, channel: &Channel, request: &Request) {
        let target = request.arguments.first().map(String::as_str).unwrap_or("");
        let result = match target.parse::<SessionId>() {
            Ok(id) => self.tracker.swap_connection(id, channel.connection()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            channel.error(e.to_string()).await;
        }
    }

    async fn run_session(&self, channel: Channel, request: Request) {
        let session = match Session::open(
            Arc::clone(&self.config),
            request,
            channel,
            Arc::clone(&self.tracker),
            self.shutdown.child_token(),
        ) {
            Ok(session) => session,
            Err(e) => {
                warn!("Cannot start session: {}", e);
                return;
            }
        };
        if let Err(e) = self.dispatcher.dispatch(&session).await {
            debug!("Session {} ended with {}", session.id(), e);
        }
        session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use st_common::testing::{TEST_HOST, TEST_PLATFORM, TEST_REPOSITORY, single_host_config};
    use std::time::Duration;
    use tokio::net::TcpStream;

    #[ctor::ctor]
    fn setup() {
        st_common::testing::init_test_logging();
    }

    type Running = (tempfile::TempDir, String, CancellationToken, tokio::task::JoinHandle<Result<()>>);

    async fn start() -> Running {
        start_with(|_, _| {}).await
    }

    async fn start_with(register: impl FnOnce(&mut Dispatcher, &std::path::Path)) -> Running {
        let dir = tempfile::tempdir().unwrap();
        let file = single_host_config(dir.path(), Some("tcp,127.0.0.1:0")).unwrap();
        let config = file.select_server(TEST_PLATFORM, TEST_REPOSITORY).unwrap();
        let mut dispatcher = Dispatcher::new(&config, &[]);
        register(&mut dispatcher, dir.path());
        let server = Server::bind(config, dispatcher).await.unwrap();
        let address = server.local_address();
        let shutdown = server.shutdown_token();
        let handle = tokio::spawn(async move { server.serve().await });
        (dir, address, shutdown, handle)
    }

    /// Runs a shell script in the source directory.
    struct Script(String);

    #[async_trait::async_trait]
    impl st_common::VerbHandler for Script {
        async fn handle(&self, session: &st_common::Session) -> Result<()> {
            session
                .executor()
                .execute(session.config().source_path(), &["sh", "-c", self.0.as_str()])
                .await
        }
    }

    fn register_script(dispatcher: &mut Dispatcher, name: &str, script: String) {
        dispatcher.register(
            name,
            "Run a test script.",
            st_common::HandlerKind::Custom(Arc::new(Script(script))),
        );
    }

    async fn connect(address: &str, request: Request) -> SocketConnection {
        let stream = TcpStream::connect(address).await.unwrap();
        let connection = SocketConnection::tcp(stream);
        connection.send(&Event::Request(request)).await.unwrap();
        connection
    }

    async fn recv_until(connection: &SocketConnection, wanted: &Event) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), connection.recv())
                .await
                .expect("event in time")
                .unwrap()
                .unwrap_or_else(|| panic!("closed before {wanted:?}; saw {events:?}"));
            let done = &event == wanted;
            events.push(event);
            if done {
                return events;
            }
        }
    }

    async fn recv_to_end(connection: &SocketConnection) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            let next = tokio::time::timeout(Duration::from_secs(10), connection.recv())
                .await
                .expect("connection closes in time")
                .unwrap();
            match next {
                Some(event) => events.push(event),
                None => return events,
            }
        }
    }

    /// Id of the running job for `command`, once it has a child process.
    async fn running_job(address: &str, command: &str) -> u64 {
        for _ in 0..100 {
            let events = exchange(address, Request::new("jobs")).await;
            let Some(Event::JobList(list)) = events.first() else {
                panic!("expected a job list, got {events:?}");
            };
            if let Some(job) = list
                .jobs
                .iter()
                .find(|job| job.request.command == command && !job.processes.is_empty())
            {
                return job.id;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job '{command}' never started a process");
    }

    async fn exchange(address: &str, request: Request) -> Vec<Event> {
        let stream = TcpStream::connect(address).await.unwrap();
        let connection = SocketConnection::tcp(stream);
        connection.send(&Event::Request(request)).await.unwrap();
        let mut events = Vec::new();
        while let Some(event) = connection.recv().await.unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn endpoint_for_own_host_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let file = single_host_config(dir.path(), Some("tcp,127.0.0.1:9000")).unwrap();
        let config = file.select_server(TEST_PLATFORM, TEST_REPOSITORY).unwrap();
        let endpoint = listen_endpoint(&config).unwrap();
        assert_eq!(endpoint.address, "127.0.0.1:9000");
        assert_eq!(endpoint.host.as_str(), TEST_HOST);
    }

    #[test]
    fn missing_endpoint_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let file = single_host_config(dir.path(), None).unwrap();
        let config = file.select_server(TEST_PLATFORM, TEST_REPOSITORY).unwrap();
        let err = listen_endpoint(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EndpointNotFound);
    }

    #[tokio::test]
    async fn ping_over_tcp() {
        let (_dir, address, shutdown, handle) = start().await;
        let events = exchange(&address, Request::new("ping")).await;
        assert_eq!(events, vec![Event::info("Pong")]);
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_verb_reports_invalid_method() {
        let (_dir, address, shutdown, _handle) = start().await;
        let events = exchange(&address, Request::new("frobnicate")).await;
        assert_eq!(events, vec![Event::error("Invalid method")]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn quit_stops_the_loop() {
        let (_dir, address, _shutdown, handle) = start().await;
        let events = exchange(&address, Request::new(QUIT)).await;
        assert_eq!(events, vec![Event::info("Quitting")]);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server stops after quit")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn join_rejects_unknown_and_malformed_ids() {
        let (_dir, address, shutdown, _handle) = start().await;

        let events = exchange(&address, Request::new(JOIN).with_arguments(["42"])).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Error(msg) if msg.contains("no job with id 42")));

        let events = exchange(&address, Request::new(JOIN).with_arguments(["abc"])).await;
        assert!(matches!(&events[0], Event::Error(msg) if msg.contains("not a job id")));

        let events = exchange(&address, Request::new(JOIN)).await;
        assert!(matches!(&events[0], Event::Error(_)));
        shutdown.cancel();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killall_ends_a_running_session() {
        let (_dir, address, shutdown, _handle) = start_with(|dispatcher, _| {
            register_script(dispatcher, "hold", "echo started; exec sleep 30".to_string());
        })
        .await;

        let holder = connect(&address, Request::new("hold")).await;
        recv_until(&holder, &Event::stdout("started")).await;
        running_job(&address, "hold").await;

        let events = exchange(&address, Request::new("killall")).await;
        assert_eq!(events.len(), 1, "{events:?}");
        let Event::ProcessList(list) = &events[0] else {
            panic!("expected a process list, got {events:?}");
        };
        assert_eq!(list.processes.len(), 1);
        assert_eq!(list.processes[0].command[0], "sh");
        assert!(list.processes[0].command.iter().any(|arg| arg.contains("sleep 30")));

        let rest = recv_to_end(&holder).await;
        let end = rest
            .iter()
            .position(|e| matches!(e, Event::EndCommand(_)))
            .unwrap_or_else(|| panic!("no EndCommand in {rest:?}"));
        assert!(matches!(&rest[end], Event::EndCommand(end) if end.return_code == 1));
        // Only the failure report may follow.
        assert!(rest[end + 1..].iter().all(|e| matches!(e, Event::Error(_))));
        shutdown.cancel();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn join_takes_over_the_output_of_a_running_job() {
        let (dir, address, shutdown, _handle) = start_with(|dispatcher, source| {
            let gate = source.join("gate");
            let script = format!(
                "echo one; while [ ! -f '{}' ]; do sleep 0.05; done; echo two",
                gate.display()
            );
            register_script(dispatcher, "hold", script);
        })
        .await;

        let original = connect(&address, Request::new("hold")).await;
        recv_until(&original, &Event::stdout("one")).await;
        let id = running_job(&address, "hold").await;

        let joiner = connect(&address, Request::new(JOIN).with_arguments([id.to_string()])).await;
        // The original client is cut off once the joiner is attached.
        let leftover = recv_to_end(&original).await;
        assert!(!leftover.contains(&Event::stdout("two")), "{leftover:?}");

        std::fs::write(dir.path().join("gate"), "").unwrap();
        let events = recv_to_end(&joiner).await;
        assert_eq!(events.len(), 2, "{events:?}");
        assert_eq!(events[0], Event::stdout("two"));
        assert!(matches!(&events[1], Event::EndCommand(end) if end.return_code == 0));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn non_request_first_event_closes_the_connection() {
        let (_dir, address, shutdown, _handle) = start().await;
        let stream = TcpStream::connect(&address).await.unwrap();
        let connection = SocketConnection::tcp(stream);
        connection.send(&Event::info("hello")).await.unwrap();
        assert_eq!(connection.recv().await.unwrap(), None);
        shutdown.cancel();
    }
}
