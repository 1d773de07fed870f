//! Source-tree verbs: status, sync, sync_workdir, rebase_update and the
//! branch-config exchange.

use super::Session;
use crate::errors::{ErrorKind, Result, StError};
use crate::executor::CommandSpec;
use crate::git::ALL_BRANCHES;
use crate::protocol::BranchConfig;
use tracing::{debug, info, warn};

/// Render one branch for the `branch` verb.
pub(crate) fn describe_branch(branch: &BranchConfig) -> String {
    let mut line = format!("{} {}", branch.name, branch.revision);
    if branch.config.contains_key("base-upstream") {
        line.push_str(&format!(
            " [ahead {}, behind {}]",
            branch.commits_ahead, branch.commits_behind
        ));
    }
    for (key, value) in &branch.config {
        line.push_str(&format!(" {key}={value}"));
    }
    line
}

impl Session {
    pub(crate) async fn git_status(&self) -> Result<()> {
        self.run_in_source(&["git", "status"]).await
    }

    pub(crate) async fn gclient_sync(&self) -> Result<()> {
        let mut spec = CommandSpec::new(self.source_path(), ["gclient", "sync"]);
        if self.config.platform_name() == "mac" {
            spec = spec.env("FORCE_MAC_TOOLCHAIN", "1");
        }
        self.run_spec(spec).await
    }

    pub(crate) async fn sync_workdir_verb(&self) -> Result<()> {
        if self.request.revision.is_empty() {
            return Err(StError::with_message(
                ErrorKind::InvalidArgument,
                "no revision to sync to",
            ));
        }
        self.sync_workdir(&self.request.revision).await
    }

    /// Check out `revision` and re-sync dependencies if `DEPS` moved.
    pub(crate) async fn sync_workdir(&self, revision: &str) -> Result<()> {
        if !self.config.git().has_upstream() {
            debug!("No upstream configured; skipping sync");
            self.channel.info("Skipping sync on master").await;
            return Ok(());
        }

        let old_deps = self.repo.deps_hash().await?;
        self.repo.checkout_revision(revision).await?;
        let new_deps = self.repo.deps_hash().await?;
        if old_deps == new_deps {
            return Ok(());
        }

        info!("DEPS changed ({} -> {})", old_deps, new_deps);
        self.channel.info("DEPS changed. Running 'sync'").await;
        self.gclient_sync().await.map_err(|e| {
            StError::with_message(ErrorKind::DepsChanged, "gclient sync failed").with_source(e)
        })
    }

    pub(crate) async fn rebase_update(&self, fetch: bool) -> Result<()> {
        if self.config.git().has_upstream() {
            return Err(StError::new(ErrorKind::OnlyOnMaster));
        }

        let dirty = self
            .executor
            .run_silently(
                self.source_path(),
                &["git", "status", "--porcelain", "--untracked-files=normal"],
            )
            .await?;
        if !dirty.is_empty() {
            self.channel.error("Local modifications exist.").await;
            return Err(StError::new(ErrorKind::WorkTreeDirty));
        }

        // A detached head has no symbolic ref to return to.
        let previous = self.repo.current_branch().await.ok();

        if fetch {
            self.run_in_source(&["git", "checkout", "origin/master"]).await?;
            self.run_in_source(&["git", "pull", "origin", "master"]).await?;
            self.gclient_sync().await?;
        }

        let result = self
            .run_in_source(&["git", "rebase-update", "--no-fetch", "--keep-going"])
            .await;
        if let Some(branch) = previous.filter(|b| !b.is_empty()) {
            if let Err(e) = self.run_in_source(&["git", "checkout", &branch]).await {
                warn!("Could not return to {}: {}", branch, e);
            }
        }
        result
    }

    pub(crate) async fn branch(&self, branches: &[String]) -> Result<()> {
        let wanted = if branches.is_empty() {
            vec![ALL_BRANCHES.to_string()]
        } else {
            branches.to_vec()
        };
        for branch in self.repo.get_branch_config(&wanted).await? {
            self.channel.info(describe_branch(&branch)).await;
        }
        Ok(())
    }

    pub(crate) async fn pull(&self, branches: &[String]) -> Result<()> {
        self.repo.fetch(branches).await
    }

    pub(crate) async fn apply_branch_config(&self) -> Result<()> {
        let configs = &self.request.branch_configs;
        if configs.is_empty() {
            return Err(StError::with_message(
                ErrorKind::NothingToDo,
                "no branch configuration in request",
            ));
        }
        self.repo.set_branch_config(configs).await?;
        for branch in configs {
            self.channel
                .info(format!("Updated configuration for {}", branch.name))
                .await;
        }
        Ok(())
    }
}
