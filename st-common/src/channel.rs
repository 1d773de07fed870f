//! Session-facing wrapper around a swappable [`Connection`].

use crate::connection::Connection;
use crate::errors::Result;
use crate::protocol::{BeginCommand, CommandList, EndCommand, Event, JobList, ProcessList};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Cloneable handle through which a session emits events.
///
/// The underlying connection may be replaced at any time with
/// [`Channel::swap_connection`]. A send that already picked up the old
/// connection finishes against it; later sends use the new one.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    connection: Mutex<Arc<dyn Connection>>,
    send_lock: tokio::sync::Mutex<()>,
}

impl Channel {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                connection: Mutex::new(connection),
                send_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// The connection currently in use.
    pub fn connection(&self) -> Arc<dyn Connection> {
        match self.inner.connection.lock() {
            Ok(guard) => (*guard).clone(),
            Err(poisoned) => (*poisoned.into_inner()).clone(),
        }
    }

    /// Replace the connection, returning the previous one.
    pub fn swap_connection(&self, connection: Arc<dyn Connection>) -> Arc<dyn Connection> {
        let mut guard = match self.inner.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, connection)
    }

    /// Send one event, reporting failure to the caller.
    pub async fn send(&self, event: &Event) -> Result<()> {
        let _serial = self.inner.send_lock.lock().await;
        let connection = self.connection();
        connection.send(event).await
    }

    /// Send one event; a detached or broken peer is logged and ignored so the
    /// session keeps running for a later `join`.
    pub async fn emit(&self, event: Event) {
        if let Err(e) = self.send(&event).await {
            debug!("Dropping {} event: {}", event.kind_name(), e);
        }
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.emit(Event::Info(message.into())).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.emit(Event::Error(message.into())).await;
    }

    pub async fn stdout(&self, line: impl Into<String>) {
        self.emit(Event::stdout(line)).await;
    }

    pub async fn stderr(&self, line: impl Into<String>) {
        self.emit(Event::stderr(line)).await;
    }

    pub async fn begin_command(&self, begin: BeginCommand) {
        self.emit(Event::BeginCommand(begin)).await;
    }

    pub async fn end_command(&self, end: EndCommand) {
        self.emit(Event::EndCommand(end)).await;
    }

    pub async fn command_list(&self, list: CommandList) {
        self.emit(Event::CommandList(list)).await;
    }

    pub async fn job_list(&self, jobs: JobList) {
        self.emit(Event::JobList(jobs)).await;
    }

    pub async fn process_list(&self, processes: ProcessList) {
        self.emit(Event::ProcessList(processes)).await;
    }

    /// Receive from the current connection.
    pub async fn recv(&self) -> Result<Option<Event>> {
        self.connection().recv().await
    }

    /// Close the current connection.
    pub async fn close(&self) -> Result<()> {
        self.connection().close().await
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("connection", &self.connection().describe())
            .finish()
    }
}
