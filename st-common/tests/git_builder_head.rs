//! Builder-head, checkout and branch-config behaviour against real git
//! repositories. Skipped when `git` is not installed.

use st_common::channel::Channel;
use st_common::config::GitSyncConfig;
use st_common::connection::LoopbackConnection;
use st_common::errors::ErrorKind;
use st_common::executor::Executor;
use st_common::git::{ALL_BRANCHES, BUILDER_HEAD, RepoOps};
use st_common::protocol::BranchConfig;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

#[ctor::ctor]
fn setup() {
    st_common::testing::init_test_logging();
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn try_git(dir: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// A repository on branch `main` with one commit holding two files.
fn init_repo() -> Option<TempDir> {
    if which::which("git").is_err() {
        eprintln!("git not installed; skipping");
        return None;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    git(root, &["init", "-q"]);
    git(root, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(root, &["config", "user.email", "builder@example.com"]);
    git(root, &["config", "user.name", "Builder"]);
    git(root, &["config", "commit.gpgsign", "false"]);
    std::fs::write(root.join("a.txt"), "base\n").unwrap();
    std::fs::write(root.join("file two.txt"), "two\n").unwrap();
    std::fs::write(root.join("DEPS"), "deps = {}\n").unwrap();
    git(root, &["add", "."]);
    git(root, &["commit", "-q", "-m", "initial"]);
    Some(dir)
}

fn repo_ops(root: &Path, git: GitSyncConfig) -> RepoOps {
    let (conn, _rx) = LoopbackConnection::pair();
    let executor = Executor::new("testhost", Channel::new(Arc::new(conn)));
    RepoOps::new(root, git, executor)
}

#[tokio::test]
async fn builder_head_is_stable_for_an_unchanged_tree() {
    let Some(dir) = init_repo() else { return };
    let ops = repo_ops(dir.path(), GitSyncConfig::default());

    let first = ops.create_builder_head().await.unwrap();
    let second = ops.create_builder_head().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        git(dir.path(), &["rev-parse", "BUILDER_HEAD^{tree}"]),
        git(dir.path(), &["rev-parse", "HEAD^{tree}"])
    );
    assert_eq!(git(dir.path(), &["rev-parse", "BUILDER_HEAD^"]), git(dir.path(), &["rev-parse", "HEAD"]));
}

#[tokio::test]
async fn builder_head_reflects_working_tree_edits() {
    let Some(dir) = init_repo() else { return };
    let ops = repo_ops(dir.path(), GitSyncConfig::default());
    let clean = ops.create_builder_head().await.unwrap();

    std::fs::write(dir.path().join("file two.txt"), "edited\n").unwrap();
    let edited = ops.create_builder_head().await.unwrap();
    assert_ne!(clean, edited);
    assert_eq!(
        git(dir.path(), &["show", "BUILDER_HEAD:file two.txt"]),
        "edited"
    );
    // HEAD itself does not move.
    assert_eq!(git(dir.path(), &["show", "HEAD:file two.txt"]), "two");

    assert_eq!(ops.create_builder_head().await.unwrap(), edited);
}

#[tokio::test]
async fn unmerged_changes_leave_builder_head_untouched() {
    let Some(dir) = init_repo() else { return };
    let root = dir.path();
    let ops = repo_ops(root, GitSyncConfig::default());
    let before = ops.create_builder_head().await.unwrap();

    git(root, &["checkout", "-q", "-b", "other"]);
    std::fs::write(root.join("a.txt"), "theirs\n").unwrap();
    git(root, &["commit", "-q", "-am", "theirs"]);
    git(root, &["checkout", "-q", "main"]);
    std::fs::write(root.join("a.txt"), "ours\n").unwrap();
    git(root, &["commit", "-q", "-am", "ours"]);
    assert!(!try_git(root, &["merge", "-q", "other"]));

    let err = ops.create_builder_head().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnmergedChangesExist);
    assert_eq!(git(root, &["rev-parse", BUILDER_HEAD]), before);
    assert!(ops.status().await.unwrap().has_unmerged);
}

#[tokio::test]
async fn checkout_revision_restores_a_builder_head() {
    let Some(dir) = init_repo() else { return };
    let root = dir.path();
    let ops = repo_ops(root, GitSyncConfig::default());

    std::fs::write(root.join("a.txt"), "work in progress\n").unwrap();
    let revision = ops.create_builder_head().await.unwrap();
    git(root, &["reset", "-q", "--hard", "HEAD"]);
    assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "base\n");

    ops.checkout_revision(&revision).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(root.join("a.txt")).unwrap(),
        "work in progress\n"
    );
    // Already there: no-op.
    ops.checkout_revision(&revision).await.unwrap();
    assert_eq!(git(root, &["rev-parse", "HEAD"]), revision);
}

#[tokio::test]
async fn deps_hash_tracks_the_manifest() {
    let Some(dir) = init_repo() else { return };
    let ops = repo_ops(dir.path(), GitSyncConfig::default());
    let before = ops.deps_hash().await.unwrap();
    std::fs::write(dir.path().join("DEPS"), "deps = { 'v8': 'x' }\n").unwrap();
    assert_ne!(ops.deps_hash().await.unwrap(), before);
}

#[tokio::test]
async fn branch_config_round_trip() {
    let Some(dir) = init_repo() else { return };
    let root = dir.path();
    git(root, &["branch", "feature"]);
    git(root, &["config", "branch.feature.base-upstream", "main"]);
    git(root, &["config", "branch.feature.description", "local only"]);
    let sync = GitSyncConfig {
        syncable_properties: vec!["base-upstream".to_string()],
        ..GitSyncConfig::default()
    };
    let ops = repo_ops(root, sync);

    let configs = ops.get_branch_config(&[ALL_BRANCHES.to_string()]).await.unwrap();
    let feature = configs.iter().find(|c| c.name == "feature").unwrap();
    assert_eq!(feature.revision, git(root, &["rev-parse", "feature"]));
    assert_eq!(feature.config.get("base-upstream").map(String::as_str), Some("main"));
    assert!(!feature.config.contains_key("description"));
    assert_eq!((feature.commits_ahead, feature.commits_behind), (0, 0));

    let mut update = feature.clone();
    update.config.insert("base-upstream".to_string(), "release".to_string());
    ops.set_branch_config(&[update.clone()]).await.unwrap();
    assert_eq!(git(root, &["config", "branch.feature.base-upstream"]), "release");

    let stale = BranchConfig {
        revision: "0000000000000000000000000000000000000000".to_string(),
        ..update
    };
    let err = ops.set_branch_config(&[stale]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.to_string().contains("Revision mismatch"));
}

#[tokio::test]
async fn branch_config_is_empty_without_branch_keys() {
    let Some(dir) = init_repo() else { return };
    let ops = repo_ops(dir.path(), GitSyncConfig::default());
    let configs = ops.get_branch_config(&[ALL_BRANCHES.to_string()]).await.unwrap();
    assert!(configs.is_empty(), "{configs:?}");
}

#[tokio::test]
async fn branch_config_of_a_broken_repository_fails() {
    let Some(dir) = init_repo() else { return };
    let ops = repo_ops(dir.path(), GitSyncConfig::default());
    std::fs::write(dir.path().join(".git").join("config"), "[core\nbroken = =\n").unwrap();
    let err = ops.get_branch_config(&[ALL_BRANCHES.to_string()]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalCommandFailed);
}

#[tokio::test]
async fn push_without_upstream_is_refused() {
    let Some(dir) = init_repo() else { return };
    let ops = repo_ops(dir.path(), GitSyncConfig::default());
    let err = ops.push_builder_head().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoUpstream);
    let err = ops.push(&[], false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn builder_head_is_pushed_to_the_upstream() {
    let Some(dir) = init_repo() else { return };
    let root = dir.path();
    let upstream = tempfile::tempdir().unwrap();
    git(upstream.path(), &["init", "-q", "--bare"]);
    git(root, &["remote", "add", "mirror", &upstream.path().display().to_string()]);

    let sync = GitSyncConfig {
        remote: Some("mirror".to_string()),
        ..GitSyncConfig::default()
    };
    let ops = repo_ops(root, sync);
    let revision = ops.create_builder_head().await.unwrap();
    let report = ops.push_builder_head().await.unwrap();
    assert!(report.known_branches.contains_key("refs/heads/BUILDER_HEAD"));
    assert_eq!(git(upstream.path(), &["rev-parse", BUILDER_HEAD]), revision);
}
