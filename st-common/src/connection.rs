//! Bidirectional event endpoints.
//!
//! A [`Connection`] moves [`Event`]s between two parties. Sends and receives
//! may happen concurrently from different tasks; each direction is guarded by
//! its own mutex so frames are never interleaved.

use crate::codec::{EventCodec, Framing};
use crate::errors::{ErrorKind, Result, StError};
use crate::protocol::Event;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

/// An endpoint that can send and receive events.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one event.
    async fn send(&self, event: &Event) -> Result<()>;

    /// Receive the next event, or `None` at end-of-stream.
    async fn recv(&self) -> Result<Option<Event>>;

    /// Flush and shut down the outbound half. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Framed read and write halves shared by socket and pipe connections.
struct FramedHalves {
    reader: Mutex<FramedRead<BoxedReader, EventCodec>>,
    writer: Mutex<FramedWrite<BoxedWriter, EventCodec>>,
    closed: AtomicBool,
}

impl FramedHalves {
    fn new(reader: BoxedReader, writer: BoxedWriter, framing: Framing) -> Self {
        Self {
            reader: Mutex::new(FramedRead::new(reader, EventCodec::new(framing))),
            writer: Mutex::new(FramedWrite::new(writer, EventCodec::new(framing))),
            closed: AtomicBool::new(false),
        }
    }

    async fn send(&self, event: &Event) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StError::with_message(
                ErrorKind::ConnectionFailed,
                "send on closed connection",
            ));
        }
        let mut writer = self.writer.lock().await;
        writer.send(event.clone()).await
    }

    async fn recv(&self) -> Result<Option<Event>> {
        let mut reader = self.reader.lock().await;
        reader.next().await.transpose()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        // SinkExt::close flushes and shuts the writer down.
        writer.close().await
    }
}

// ── Socket ──────────────────────────────────────────────────────────────────

/// A TCP or unix-domain stream speaking length delimited frames.
pub struct SocketConnection {
    peer: String,
    halves: FramedHalves,
}

impl SocketConnection {
    pub fn tcp(stream: tokio::net::TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| format!("tcp:{addr}"))
            .unwrap_or_else(|_| "tcp:unknown".to_string());
        let (read, write) = stream.into_split();
        Self {
            peer,
            halves: FramedHalves::new(Box::new(read), Box::new(write), Framing::LengthDelimited),
        }
    }

    #[cfg(unix)]
    pub fn unix(stream: tokio::net::UnixStream) -> Self {
        let peer = stream
            .peer_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
            .map(|p| format!("unix:{p}"))
            .unwrap_or_else(|| "unix:peer".to_string());
        let (read, write) = stream.into_split();
        Self {
            peer,
            halves: FramedHalves::new(Box::new(read), Box::new(write), Framing::LengthDelimited),
        }
    }
}

#[async_trait]
impl Connection for SocketConnection {
    async fn send(&self, event: &Event) -> Result<()> {
        self.halves.send(event).await
    }

    async fn recv(&self) -> Result<Option<Event>> {
        self.halves.recv().await
    }

    async fn close(&self) -> Result<()> {
        self.halves.close().await
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }
}

// ── Pipe pair ───────────────────────────────────────────────────────────────

/// A duplex connection made from one reader and one writer, typically the
/// stdout and stdin of a remote shell.
pub struct PipeConnection {
    label: String,
    halves: FramedHalves,
}

impl PipeConnection {
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_framing(label, reader, writer, Framing::LengthDelimited)
    }

    pub fn with_framing<R, W>(label: impl Into<String>, reader: R, writer: W, framing: Framing) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            label: label.into(),
            halves: FramedHalves::new(Box::new(reader), Box::new(writer), framing),
        }
    }
}

#[async_trait]
impl Connection for PipeConnection {
    async fn send(&self, event: &Event) -> Result<()> {
        self.halves.send(event).await
    }

    async fn recv(&self) -> Result<Option<Event>> {
        self.halves.recv().await
    }

    async fn close(&self) -> Result<()> {
        self.halves.close().await
    }

    fn describe(&self) -> String {
        format!("pipe:{}", self.label)
    }
}

// ── Loopback ────────────────────────────────────────────────────────────────

/// In-process connection: sent events go to an mpsc receiver owned by the
/// embedding client; `recv` always reports end-of-stream.
pub struct LoopbackConnection {
    sink: std::sync::Mutex<Option<mpsc::UnboundedSender<Event>>>,
}

impl LoopbackConnection {
    pub fn new(sink: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            sink: std::sync::Mutex::new(Some(sink)),
        }
    }

    /// A loopback connection plus the receiver of everything sent on it.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn send(&self, event: &Event) -> Result<()> {
        let sink = self
            .sink
            .lock()
            .map_err(|_| StError::with_message(ErrorKind::ConnectionFailed, "loopback poisoned"))?
            .clone();
        match sink {
            Some(sink) => sink.send(event.clone()).map_err(|_| {
                StError::with_message(ErrorKind::ConnectionFailed, "loopback receiver dropped")
            }),
            None => Err(StError::with_message(
                ErrorKind::ConnectionFailed,
                "send on closed connection",
            )),
        }
    }

    async fn recv(&self) -> Result<Option<Event>> {
        Ok(None)
    }

    async fn close(&self) -> Result<()> {
        if let Ok(mut sink) = self.sink.lock()
            && sink.take().is_some()
        {
            debug!("Loopback connection closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "loopback".to_string()
    }
}
