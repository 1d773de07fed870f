//! Error kinds shared by the client, the daemon and session handlers.
//!
//! Every failure in the library is an [`StError`]: a [`ErrorKind`] that callers
//! match on, an optional human readable detail, an optional source error and a
//! captured backtrace. Only the display text ever crosses the wire.

use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;
use std::sync::Arc;
use thiserror::Error;

/// Distinguishable failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("configuration error")]
    ConfigurationError,
    #[error("configuration incomplete")]
    ConfigIncomplete,
    #[error("DEPS changed")]
    DepsChanged,
    #[error("empty command")]
    EmptyCommand,
    #[error("external command failed")]
    ExternalCommandFailed,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid message type")]
    InvalidMessageType,
    #[error("invalid platform")]
    InvalidPlatform,
    #[error("invalid repository")]
    InvalidRepository,
    #[error("no route to target")]
    NoRouteToTarget,
    #[error("no target")]
    NoTarget,
    #[error("no upstream")]
    NoUpstream,
    #[error("only valid on master")]
    OnlyOnMaster,
    #[error("timed out")]
    TimedOut,
    #[error("unmerged changes exist")]
    UnmergedChangesExist,
    #[error("unrecognized response")]
    UnrecognizedResponse,
    #[error("work tree dirty")]
    WorkTreeDirty,
    #[error("failed to push git branch")]
    FailedToPushGitBranch,
    #[error("endpoint not found")]
    EndpointNotFound,
    #[error("nothing to do")]
    NothingToDo,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("i/o error")]
    Io,
}

/// The error type used throughout Stonesthrow.
#[derive(Debug, Error)]
#[error("{rendered}")]
pub struct StError {
    kind: ErrorKind,
    detail: Option<String>,
    rendered: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    stack: Arc<Backtrace>,
}

/// Result alias with [`StError`] as the default error.
pub type Result<T, E = StError> = std::result::Result<T, E>;

impl StError {
    /// An error carrying only its kind. Displays as the kind's text.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            detail: None,
            rendered: kind.to_string(),
            source: None,
            stack: Arc::new(Backtrace::capture()),
        }
    }

    /// An error with a detail message. Displays as `<kind>: <detail>`.
    pub fn with_message(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            kind,
            rendered: format!("{kind}: {detail}"),
            detail: Some(detail),
            source: None,
            stack: Arc::new(Backtrace::capture()),
        }
    }

    /// Attach an underlying cause.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Backtrace captured at construction (empty unless `RUST_BACKTRACE` is set).
    pub fn stack(&self) -> &Backtrace {
        &self.stack
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<ErrorKind> for StError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<std::io::Error> for StError {
    fn from(err: std::io::Error) -> Self {
        Self::with_message(ErrorKind::Io, err.to_string()).with_source(err)
    }
}

impl From<serde_json::Error> for StError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_message(ErrorKind::InvalidMessageType, err.to_string()).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_kind_displays_kind_text() {
        let err = StError::new(ErrorKind::InvalidArgument);
        assert_eq!(err.to_string(), "invalid argument");
        assert!(err.detail().is_none());
    }

    #[test]
    fn detail_is_appended_after_kind() {
        let err = StError::with_message(ErrorKind::NoUpstream, "no remote for 'src'");
        assert_eq!(err.to_string(), "no upstream: no remote for 'src'");
        assert_eq!(err.kind(), ErrorKind::NoUpstream);
    }

    #[test]
    fn io_errors_keep_their_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StError = io.into();
        assert!(err.is(ErrorKind::Io));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn kind_round_trips_through_json() {
        let json = serde_json::to_string(&ErrorKind::FailedToPushGitBranch).unwrap();
        assert_eq!(json, "\"failed_to_push_git_branch\"");
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorKind::FailedToPushGitBranch);
    }
}
