//! Wire types exchanged between the client and a host daemon.
//!
//! A connection carries a sequence of [`Envelope`]s. Each envelope holds
//! exactly one populated [`Event`] variant; the client sends one
//! [`Request`] and then consumes events until end-of-stream.

use crate::errors::{ErrorKind, Result, StError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Request ─────────────────────────────────────────────────────────────────

/// A single verb invocation sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub source_host: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branch_configs: Vec<BranchConfig>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn with_source_host(mut self, host: impl Into<String>) -> Self {
        self.source_host = host.into();
        self
    }
}

/// Syncable per-branch git configuration, annotated with the branch's revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub name: String,
    pub revision: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub commits_ahead: u32,
    #[serde(default)]
    pub commits_behind: u32,
}

// ── Command lifecycle ───────────────────────────────────────────────────────

/// Which child stream a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Out,
    Err,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Out => write!(f, "out"),
            Self::Err => write!(f, "err"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutput {
    pub output: String,
    pub stream: OutputStream,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginCommand {
    pub command: Vec<String>,
    pub workdir: String,
    pub host: String,
    #[serde(default)]
    pub interactive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndCommand {
    /// 0 on success, 1 on any failure.
    pub return_code: i32,
    pub system_time_ns: u64,
    pub user_time_ns: u64,
}

// ── Introspection ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub name: String,
    pub doc: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandList {
    #[serde(default)]
    pub synopsis: String,
    #[serde(default)]
    pub config_file: String,
    #[serde(default)]
    pub commands: Vec<CommandInfo>,
}

/// Snapshot of one child process owned by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub command: Vec<String>,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub running: bool,
    /// Absent while the process is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub system_time_ns: u64,
    pub user_time_ns: u64,
}

/// Tracker view of one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: u64,
    pub request: Request,
    pub start_time: DateTime<Utc>,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub processes: Vec<ProcessSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobList {
    pub jobs: Vec<JobRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessList {
    pub processes: Vec<ProcessSnapshot>,
}

// ── Event ───────────────────────────────────────────────────────────────────

/// Everything that may travel over a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Info(String),
    Error(String),
    TerminalOutput(TerminalOutput),
    BeginCommand(BeginCommand),
    EndCommand(EndCommand),
    CommandList(CommandList),
    JobList(JobList),
    ProcessList(ProcessList),
    Request(Request),
}

impl Event {
    pub fn info(message: impl Into<String>) -> Self {
        Self::Info(message.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn stdout(line: impl Into<String>) -> Self {
        Self::TerminalOutput(TerminalOutput {
            output: line.into(),
            stream: OutputStream::Out,
        })
    }

    pub fn stderr(line: impl Into<String>) -> Self {
        Self::TerminalOutput(TerminalOutput {
            output: line.into(),
            stream: OutputStream::Err,
        })
    }

    /// Short variant name, for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Info(_) => "info",
            Self::Error(_) => "error",
            Self::TerminalOutput(_) => "output",
            Self::BeginCommand(_) => "begin",
            Self::EndCommand(_) => "end",
            Self::CommandList(_) => "ls",
            Self::JobList(_) => "jobs",
            Self::ProcessList(_) => "ps",
            Self::Request(_) => "req",
        }
    }
}

// ── Envelope ────────────────────────────────────────────────────────────────

/// Tagged wire form of an [`Event`]. Exactly one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TerminalOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin: Option<BeginCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<EndCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ls: Option<CommandList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<JobList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ps: Option<ProcessList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req: Option<Request>,
}

impl Envelope {
    /// Number of populated variants.
    pub fn populated(&self) -> usize {
        [
            self.info.is_some(),
            self.error.is_some(),
            self.output.is_some(),
            self.begin.is_some(),
            self.end.is_some(),
            self.ls.is_some(),
            self.jobs.is_some(),
            self.ps.is_some(),
            self.req.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    /// Fail unless exactly one variant is populated.
    pub fn validate(&self) -> Result<()> {
        match self.populated() {
            1 => Ok(()),
            0 => Err(StError::with_message(
                ErrorKind::InvalidMessageType,
                "envelope carries no event",
            )),
            n => Err(StError::with_message(
                ErrorKind::InvalidMessageType,
                format!("envelope carries {n} events"),
            )),
        }
    }

    /// Extract the single event.
    pub fn into_event(self) -> Result<Event> {
        self.validate()?;
        let event = if let Some(v) = self.info {
            Event::Info(v)
        } else if let Some(v) = self.error {
            Event::Error(v)
        } else if let Some(v) = self.output {
            Event::TerminalOutput(v)
        } else if let Some(v) = self.begin {
            Event::BeginCommand(v)
        } else if let Some(v) = self.end {
            Event::EndCommand(v)
        } else if let Some(v) = self.ls {
            Event::CommandList(v)
        } else if let Some(v) = self.jobs {
            Event::JobList(v)
        } else if let Some(v) = self.ps {
            Event::ProcessList(v)
        } else if let Some(v) = self.req {
            Event::Request(v)
        } else {
            return Err(StError::new(ErrorKind::InvalidMessageType));
        };
        Ok(event)
    }
}

impl From<Event> for Envelope {
    fn from(event: Event) -> Self {
        let mut env = Envelope::default();
        match event {
            Event::Info(v) => env.info = Some(v),
            Event::Error(v) => env.error = Some(v),
            Event::TerminalOutput(v) => env.output = Some(v),
            Event::BeginCommand(v) => env.begin = Some(v),
            Event::EndCommand(v) => env.end = Some(v),
            Event::CommandList(v) => env.ls = Some(v),
            Event::JobList(v) => env.jobs = Some(v),
            Event::ProcessList(v) => env.ps = Some(v),
            Event::Request(v) => env.req = Some(v),
        }
        env
    }
}
