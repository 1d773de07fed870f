//! Repository operations: working-tree snapshots, the synthetic
//! `BUILDER_HEAD` ref, push/fetch through the shared upstream, checkout and
//! branch-config exchange.
//!
//! Queries run silently through [`Executor::run_silently`]; anything that
//! moves data (push, fetch, checkout) is streamed to the session's channel.

mod porcelain;

pub use porcelain::{
    ALL_BRANCHES, GitStatus, PushReport, parse_ahead_behind, parse_branch_config,
    parse_push_output, parse_status,
};

use crate::config::GitSyncConfig;
use crate::errors::{ErrorKind, Result, StError};
use crate::executor::{CommandSpec, Executor};
use crate::protocol::BranchConfig;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the synthetic branch carrying the developer's working tree.
pub const BUILDER_HEAD: &str = "BUILDER_HEAD";
const BUILDER_HEAD_REF: &str = "refs/heads/BUILDER_HEAD";
/// Always fetched alongside requested branches so rebases have a base.
const ORIGIN_MASTER_REF: &str = "refs/remotes/origin/master";
/// Dependency manifest whose changes require a `gclient sync`.
pub const DEPS_FILE: &str = "DEPS";

/// Git operations on one checkout.
#[derive(Clone)]
pub struct RepoOps {
    source_path: PathBuf,
    git: GitSyncConfig,
    executor: Executor,
}

impl RepoOps {
    pub fn new(source_path: impl Into<PathBuf>, git: GitSyncConfig, executor: Executor) -> Self {
        Self {
            source_path: source_path.into(),
            git,
            executor,
        }
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn sync_config(&self) -> &GitSyncConfig {
        &self.git
    }

    async fn query(&self, args: &[&str]) -> Result<String> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push("git");
        argv.extend_from_slice(args);
        self.executor.run_silently(&self.source_path, &argv).await
    }

    async fn stream(&self, args: &[String]) -> Result<()> {
        let argv = std::iter::once("git".to_string()).chain(args.iter().cloned());
        self.executor
            .execute_spec(&CommandSpec::new(&self.source_path, argv))
            .await
            .map(|_| ())
    }

    fn remote(&self) -> Result<&str> {
        self.git
            .remote
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| StError::new(ErrorKind::NoUpstream))
    }

    pub async fn status(&self) -> Result<GitStatus> {
        let output = self
            .query(&[
                "status",
                "--porcelain=2",
                "--untracked-files=no",
                "--ignore-submodules",
            ])
            .await?;
        Ok(parse_status(&output))
    }

    /// `git rev-parse <name>`.
    pub async fn revision(&self, name: &str) -> Result<String> {
        self.query(&["rev-parse", name]).await
    }

    pub async fn tree_for_revision(&self, name: &str) -> Result<String> {
        self.query(&["rev-parse", &format!("{name}^{{tree}}")]).await
    }

    /// Short name of the checked-out branch; fails on a detached head.
    pub async fn current_branch(&self) -> Result<String> {
        self.query(&["symbolic-ref", "--quiet", "--short", "HEAD"])
            .await
    }

    /// Tree id of the working tree, staging tracked modifications.
    pub async fn create_work_tree(&self) -> Result<String> {
        let status = self.status().await?;
        if status.has_unmerged {
            return Err(StError::new(ErrorKind::UnmergedChangesExist));
        }
        if status.has_modified {
            self.query(&["add", "-u"]).await?;
        }
        // The index also carries changes staged by earlier snapshots.
        self.query(&["write-tree"]).await
    }

    /// Point `BUILDER_HEAD` at a commit whose tree is the current working
    /// tree and return that commit. An unchanged tree keeps the existing
    /// commit.
    pub async fn create_builder_head(&self) -> Result<String> {
        let status = self.status().await?;
        if status.has_unmerged {
            return Err(StError::new(ErrorKind::UnmergedChangesExist));
        }

        if !status.modified_files.is_empty() {
            let mut args = vec!["update-index", "--remove", "--"];
            args.extend(status.modified_files.iter().map(String::as_str));
            self.query(&args).await?;
        }
        let tree = self.query(&["write-tree"]).await?;

        if let Ok(existing) = self.tree_for_revision(BUILDER_HEAD).await
            && existing == tree
        {
            debug!("BUILDER_HEAD already at tree {}", tree);
            return self.revision(BUILDER_HEAD).await;
        }

        let head = self.revision("HEAD").await?;
        let commit = self
            .query(&["commit-tree", "-p", &head, "-m", BUILDER_HEAD, &tree])
            .await?;
        self.query(&["update-ref", BUILDER_HEAD_REF, &commit]).await?;
        info!("BUILDER_HEAD is now {} (tree {})", commit, tree);
        Ok(commit)
    }

    async fn refspecs(&self, branches: &[String]) -> Vec<String> {
        let mut refspecs = Vec::with_capacity(branches.len());
        for branch in branches {
            let name = if branch == "HEAD" {
                match self.current_branch().await {
                    Ok(name) => name,
                    Err(e) => {
                        debug!("Skipping HEAD: {}", e);
                        continue;
                    }
                }
            } else {
                branch.clone()
            };
            if !name.is_empty() {
                refspecs.push(format!("+{name}:{name}"));
            }
        }
        refspecs
    }

    /// Force-push `branches` to the upstream remote.
    pub async fn push(&self, branches: &[String], set_upstream: bool) -> Result<PushReport> {
        if branches.is_empty() {
            return Err(StError::with_message(
                ErrorKind::InvalidArgument,
                "no branches to push",
            ));
        }
        let remote = self.remote()?;

        let mut argv = vec![
            "git".to_string(),
            "push".to_string(),
            remote.to_string(),
            "--porcelain".to_string(),
            "--thin".to_string(),
            "--force".to_string(),
        ];
        if set_upstream {
            argv.push("--set-upstream".to_string());
        }
        argv.extend(self.refspecs(branches).await);

        let spec = CommandSpec::new(&self.source_path, argv).capture();
        let output = self.executor.run(&spec).await?;
        let report = parse_push_output(&output.stdout)?;
        if !report.done && !output.success {
            return Err(StError::with_message(
                ErrorKind::ExternalCommandFailed,
                format!("git push to {remote} failed"),
            ));
        }
        Ok(report)
    }

    pub async fn push_builder_head(&self) -> Result<PushReport> {
        self.push(&[BUILDER_HEAD.to_string()], false).await
    }

    /// Fetch `branches` (and `origin/master`) from the upstream remote.
    pub async fn fetch(&self, branches: &[String]) -> Result<()> {
        if branches.is_empty() {
            return Err(StError::with_message(
                ErrorKind::InvalidArgument,
                "no branches to fetch",
            ));
        }
        let remote = self.remote()?.to_string();
        let mut wanted = branches.to_vec();
        wanted.push(ORIGIN_MASTER_REF.to_string());

        let mut args = vec!["fetch".to_string(), remote];
        args.extend(self.refspecs(&wanted).await);
        self.stream(&args).await
    }

    pub async fn fetch_builder_head(&self) -> Result<()> {
        self.fetch(&[BUILDER_HEAD.to_string()]).await
    }

    /// Make the working tree match `revision`, fetching `BUILDER_HEAD` when
    /// the revision is not known locally.
    pub async fn checkout_revision(&self, revision: &str) -> Result<()> {
        let current = self.create_work_tree().await?;
        match self.tree_for_revision(revision).await {
            Ok(target) if target == current => {
                debug!("Working tree already matches {}", revision);
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                debug!("{} not available locally ({}); fetching", revision, e);
                self.fetch_builder_head().await?;
            }
        }
        self.stream(&[
            "checkout".to_string(),
            "--force".to_string(),
            "--quiet".to_string(),
            "--no-progress".to_string(),
            revision.to_string(),
        ])
        .await
    }

    /// Blob id of the dependency manifest.
    pub async fn deps_hash(&self) -> Result<String> {
        self.query(&["hash-object", DEPS_FILE]).await
    }

    /// Syncable config of `branches` (or every branch, given
    /// [`ALL_BRANCHES`]), annotated with revisions and ahead/behind counts
    /// against `base-upstream`. Branches that do not resolve are dropped.
    pub async fn get_branch_config(&self, branches: &[String]) -> Result<Vec<BranchConfig>> {
        // `git config --get-regex` exits 1 when no key matches.
        let output = self
            .executor
            .run_silently_or_empty(
                &self.source_path,
                &["git", "config", "--local", "-z", "--get-regex", r"^branch\..*"],
                1,
            )
            .await?
            .unwrap_or_default();
        let parsed = parse_branch_config(&output, branches, &self.git.syncable_properties)?;

        let mut configs = Vec::with_capacity(parsed.len());
        for mut branch in parsed {
            match self.revision(&branch.name).await {
                Ok(revision) => branch.revision = revision,
                Err(e) => {
                    debug!("Dropping branch {}: {}", branch.name, e);
                    continue;
                }
            }
            if let Some(upstream) = branch.config.get("base-upstream").cloned() {
                let range = format!("{}...{}", branch.name, upstream);
                if let Ok(counts) = self
                    .query(&["rev-list", "--left-right", "--count", &range])
                    .await
                {
                    let (ahead, behind) = parse_ahead_behind(&counts)?;
                    branch.commits_ahead = ahead;
                    branch.commits_behind = behind;
                }
            }
            configs.push(branch);
        }
        Ok(configs)
    }

    /// Apply branch config received from another host. Every branch must
    /// already be at the revision the sender saw.
    pub async fn set_branch_config(&self, configs: &[BranchConfig]) -> Result<()> {
        for branch in configs {
            let actual = self.revision(&branch.name).await.map_err(|_| {
                StError::with_message(
                    ErrorKind::InvalidArgument,
                    format!("Unknown branch {}", branch.name),
                )
            })?;
            if actual != branch.revision {
                return Err(StError::with_message(
                    ErrorKind::InvalidArgument,
                    format!(
                        "Revision mismatch for branch {}. actual {} vs expected {}",
                        branch.name, actual, branch.revision
                    ),
                ));
            }
        }
        for branch in configs {
            for (property, value) in &branch.config {
                let key = format!("branch.{}.{}", branch.name, property);
                self.query(&["config", "--local", &key, value]).await?;
            }
        }
        Ok(())
    }
}
