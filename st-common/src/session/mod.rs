//! Per-request server state and the command verbs.
//!
//! A [`Session`] lives for exactly one request. It owns the executor bound
//! to the request's channel and files every child process under its
//! tracker id.

mod build;
mod repo;
mod test_runner;

pub use build::{GOMA_STAMP_FILE, GOMA_STAMP_TTL, compiler_proxy_ready};
pub use test_runner::{TestInvocation, discover_test_targets, short_target_name};

use crate::channel::Channel;
use crate::config::ResolvedConfig;
use crate::errors::{ErrorKind, Result, StError};
use crate::executor::{CommandSpec, Executor};
use crate::git::RepoOps;
use crate::protocol::Request;
use crate::tracker::{SessionEntry, SessionId, SessionTracker};
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A lazily compiled argument pattern.
pub(crate) type Pattern = LazyLock<std::result::Result<Regex, regex::Error>>;

pub(crate) fn pattern_matches(pattern: &Pattern, text: &str) -> Result<bool> {
    match &**pattern {
        Ok(re) => Ok(re.is_match(text)),
        Err(e) => Err(StError::with_message(
            ErrorKind::ConfigurationError,
            format!("argument pattern failed to compile: {e}"),
        )),
    }
}

/// Builtin command verbs implemented by [`Session::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Build,
    Clean,
    Clobber,
    Prepare,
    Status,
    Sync,
    SyncWorkdir,
    RebaseUpdate,
    Ping,
    Jobs,
    Killall,
    Help,
    List,
    Branch,
    Pull,
    SetBranchConfig,
}

pub struct Session {
    id: SessionId,
    config: Arc<ResolvedConfig>,
    request: Request,
    channel: Channel,
    tracker: Arc<SessionTracker>,
    executor: Executor,
    repo: RepoOps,
}

impl Session {
    /// Register a new session with `tracker`. Child processes started by the
    /// session are cancelled through `cancel`.
    pub fn open(
        config: Arc<ResolvedConfig>,
        request: Request,
        channel: Channel,
        tracker: Arc<SessionTracker>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut entry = SessionEntry::new(request.clone(), channel.clone());
        let id = tracker.add_session(&mut entry)?;

        let executor = Executor::new(config.host_id().as_str(), channel.clone())
            .with_registrar(tracker.registrar(id))
            .with_cancellation(cancel);
        let repo = RepoOps::new(config.source_path(), config.git().clone(), executor.clone());
        debug!("Session {} opened for '{}'", id, request.command);
        Ok(Self {
            id,
            config,
            request,
            channel,
            tracker,
            executor,
            repo,
        })
    }

    /// Deregister the session, releasing any client waiting on it.
    pub fn close(self) {
        self.tracker.remove_session(self.id);
        debug!("Session {} closed", self.id);
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn repo(&self) -> &RepoOps {
        &self.repo
    }

    fn source_path(&self) -> &Path {
        self.config.source_path()
    }

    /// Stream a command from the source directory.
    async fn run_in_source(&self, argv: &[&str]) -> Result<()> {
        self.executor.execute(self.source_path(), argv).await
    }

    async fn run_spec(&self, spec: CommandSpec) -> Result<()> {
        self.executor.execute_spec(&spec).await.map(|_| ())
    }

    /// Run a builtin verb. `help` and `list` need the dispatcher and are
    /// answered there.
    pub async fn run(&self, verb: Verb) -> Result<()> {
        let args = &self.request.arguments;
        match verb {
            Verb::Build => self.build(args).await,
            Verb::Clean => self.clean(args).await,
            Verb::Clobber => self.clobber(args.first().is_some_and(|a| a == "force")).await,
            Verb::Prepare => self.prepare().await,
            Verb::Status => self.git_status().await,
            Verb::Sync => self.gclient_sync().await,
            Verb::SyncWorkdir => self.sync_workdir_verb().await,
            Verb::RebaseUpdate => {
                self.rebase_update(args.first().is_some_and(|a| a == "fetch"))
                    .await
            }
            Verb::Ping => {
                self.channel.info("Pong").await;
                Ok(())
            }
            Verb::Jobs => {
                self.channel.job_list(self.tracker.get_job_list()).await;
                Ok(())
            }
            Verb::Killall => {
                self.channel
                    .process_list(self.tracker.kill_running_processes())
                    .await;
                Ok(())
            }
            Verb::Branch => self.branch(args).await,
            Verb::Pull => self.pull(args).await,
            Verb::SetBranchConfig => self.apply_branch_config().await,
            Verb::Help | Verb::List => Err(StError::with_message(
                ErrorKind::InvalidArgument,
                format!("'{}' is answered by the dispatcher", self.request.command),
            )),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("command", &self.request.command)
            .field("host", self.config.host_id())
            .finish()
    }
}
