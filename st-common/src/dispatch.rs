//! Verb name → handler table.
//!
//! One [`Dispatcher`] is built per server from the repository's
//! configuration and its known test targets, then shared by every session.

use crate::config::ResolvedConfig;
use crate::errors::{ErrorKind, Result, StError};
use crate::protocol::{CommandInfo, CommandList};
use crate::session::{Session, Verb};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const SYNOPSIS: &str = "st [options] <command> [arguments...]";

/// Verbs handled by the server loop before a session exists.
pub const QUIT: &str = "quit";
pub const JOIN: &str = "join";

const BUILTINS: &[(&str, Verb, &str)] = &[
    ("build", Verb::Build, "Build the specified targets."),
    ("clean", Verb::Clean, "Clean the specified targets."),
    ("clobber", Verb::Clobber, "Remove the build directory. Specify 'force' to actually do it."),
    ("prepare", Verb::Prepare, "Create the build directory and generate build files."),
    ("status", Verb::Status, "Show the git status of the source tree."),
    ("sync", Verb::Sync, "Run 'gclient sync'."),
    ("ping", Verb::Ping, "Check that the server is alive."),
    ("jobs", Verb::Jobs, "List running jobs."),
    ("killall", Verb::Killall, "Kill every process started by any job."),
    ("help", Verb::Help, "List available commands."),
    ("list", Verb::List, "List things. 'list tests' shows the known test targets."),
    ("branch", Verb::Branch, "Show branches with their revisions and synced configuration."),
    ("pull", Verb::Pull, "Fetch the specified branches from the upstream repository."),
    (
        "set_branch_config",
        Verb::SetBranchConfig,
        "Apply branch configuration carried by the request.",
    ),
];

const SERVER_LOOP: &[(&str, &str)] = &[
    (QUIT, "Stop the server."),
    (JOIN, "Attach to a running job. Specify the job id."),
];

/// Commands that ship the client's working-tree revision with the request.
pub fn requires_revision(command: &str) -> bool {
    !matches!(
        command,
        "status" | "prepare" | "ping" | "clobber" | "help" | "quit" | "list"
    )
}

/// Handler for verbs registered at runtime.
#[async_trait]
pub trait VerbHandler: Send + Sync {
    async fn handle(&self, session: &Session) -> Result<()>;
}

#[derive(Clone)]
pub enum HandlerKind {
    Builtin(Verb),
    TestTarget(String),
    /// Answered by the server loop; never dispatched to a session.
    ServerLoop,
    Custom(Arc<dyn VerbHandler>),
}

impl std::fmt::Debug for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Builtin(verb) => f.debug_tuple("Builtin").field(verb).finish(),
            Self::TestTarget(target) => f.debug_tuple("TestTarget").field(target).finish(),
            Self::ServerLoop => f.write_str("ServerLoop"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandEntry {
    pub doc: String,
    pub kind: HandlerKind,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    entries: BTreeMap<String, CommandEntry>,
    config_file: String,
}

impl Dispatcher {
    /// Install the builtin verbs, the sync verb matching the repository's
    /// role (`sync_workdir` with an upstream, `rebase_update`/`ru` without),
    /// and one verb per test target.
    pub fn new(config: &ResolvedConfig, test_targets: &[String]) -> Self {
        let mut dispatcher = Self {
            entries: BTreeMap::new(),
            config_file: config.config_file.display().to_string(),
        };
        for (name, verb, doc) in BUILTINS {
            dispatcher.register(*name, *doc, HandlerKind::Builtin(*verb));
        }
        for (name, doc) in SERVER_LOOP {
            dispatcher.register(*name, *doc, HandlerKind::ServerLoop);
        }

        if config.git().has_upstream() {
            dispatcher.register(
                "sync_workdir",
                "Check out the client's working tree revision.",
                HandlerKind::Builtin(Verb::SyncWorkdir),
            );
        } else {
            let doc = "Run 'git rebase-update'. Specify 'fetch' to update origin/master first.";
            dispatcher.register("rebase_update", doc, HandlerKind::Builtin(Verb::RebaseUpdate));
            dispatcher.register("ru", doc, HandlerKind::Builtin(Verb::RebaseUpdate));
        }

        for target in test_targets {
            if dispatcher.entries.contains_key(target) {
                debug!("Test target '{}' shadows a command; skipped", target);
                continue;
            }
            dispatcher.register(
                target.clone(),
                format!("Build and run {target}. Specify 'all' or test filters."),
                HandlerKind::TestTarget(target.clone()),
            );
        }
        dispatcher
    }

    /// Add or replace a verb.
    pub fn register(&mut self, name: impl Into<String>, doc: impl Into<String>, kind: HandlerKind) {
        self.entries.insert(
            name.into(),
            CommandEntry {
                doc: doc.into(),
                kind,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&CommandEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn command_list<F>(&self, include: F) -> CommandList
    where
        F: Fn(&HandlerKind) -> bool,
    {
        CommandList {
            synopsis: SYNOPSIS.to_string(),
            config_file: self.config_file.clone(),
            commands: self
                .entries
                .iter()
                .filter(|(_, entry)| include(&entry.kind))
                .map(|(name, entry)| CommandInfo {
                    name: name.clone(),
                    doc: entry.doc.clone(),
                })
                .collect(),
        }
    }

    /// Every verb except test targets.
    pub fn help(&self) -> CommandList {
        self.command_list(|kind| !matches!(kind, HandlerKind::TestTarget(_)))
    }

    pub fn test_targets(&self) -> CommandList {
        self.command_list(|kind| matches!(kind, HandlerKind::TestTarget(_)))
    }

    /// Run the session's request. Failures are reported to the client as an
    /// `Error` event and also returned.
    pub async fn dispatch(&self, session: &Session) -> Result<()> {
        let command = session.request().command.as_str();
        let Some(entry) = self.entries.get(command) else {
            session.channel().error("Invalid method").await;
            return Err(StError::with_message(
                ErrorKind::InvalidArgument,
                format!("Invalid method '{command}'"),
            ));
        };

        let result = match &entry.kind {
            HandlerKind::Builtin(Verb::Help) => {
                session.channel().command_list(self.help()).await;
                Ok(())
            }
            HandlerKind::Builtin(Verb::List) => self.list(session).await,
            HandlerKind::Builtin(verb) => session.run(*verb).await,
            HandlerKind::TestTarget(target) => session.run_test_target(target).await,
            HandlerKind::ServerLoop => Err(StError::with_message(
                ErrorKind::InvalidArgument,
                format!("'{command}' must be sent to the server directly"),
            )),
            HandlerKind::Custom(handler) => handler.handle(session).await,
        };

        if let Err(e) = &result {
            warn!("'{}' failed: {}", command, e);
            session.channel().error(e.to_string()).await;
        }
        result
    }

    async fn list(&self, session: &Session) -> Result<()> {
        match session.request().arguments.first().map(String::as_str) {
            Some("tests") => {
                session.channel().command_list(self.test_targets()).await;
                Ok(())
            }
            Some(other) => Err(StError::with_message(
                ErrorKind::InvalidArgument,
                format!("don't know how to list '{other}'"),
            )),
            None => Err(StError::with_message(
                ErrorKind::InvalidArgument,
                "specify what to list, e.g. 'list tests'",
            )),
        }
    }
}
