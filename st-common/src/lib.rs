//! Shared library for the Stonesthrow client (`st`) and host daemon (`sthd`).
//!
//! The wire protocol, transports, configuration model, streaming executor,
//! git operations, session tracker, command verbs and dispatcher all live
//! here so both binaries and the in-process loopback path run the same code.

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod errors;
pub mod executor;
pub mod git;
pub mod logging;
pub mod proc_times;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod tracker;

pub use channel::Channel;
pub use codec::{EventCodec, Framing};
pub use config::{ConfigFile, Endpoint, HostConfig, HostId, Network, ResolvedConfig};
pub use connection::{Connection, LoopbackConnection, PipeConnection, SocketConnection};
pub use dispatch::{Dispatcher, HandlerKind, VerbHandler};
pub use errors::{ErrorKind, Result, StError};
pub use executor::{CommandSpec, Executor};
pub use git::{BUILDER_HEAD, RepoOps};
pub use logging::{LogConfig, LogFormat, init_logging};
pub use protocol::{Event, Request};
pub use session::Session;
pub use tracker::{SessionId, SessionTracker};
