//! Build-directory verbs: build, clean, clobber, prepare, and the
//! distributed-compiler warm-up that precedes a build.

use super::{Pattern, Session, pattern_matches};
use crate::errors::{ErrorKind, Result, StError};
use crate::executor::CommandSpec;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Touched whenever the compiler proxy is (re)started.
pub const GOMA_STAMP_FILE: &str = "goma_ensure_start_stamp";
/// How long a stamp suppresses further proxy checks.
pub const GOMA_STAMP_TTL: Duration = Duration::from_secs(6 * 60 * 60);

const GOMA_POLL_ATTEMPTS: usize = 5;
const GOMA_POLL_INTERVAL: Duration = Duration::from_secs(1);

static CLEAN_TARGET: Pattern = LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z_]*$"));

/// True when `goma_ctl status` output reports a healthy compiler proxy.
pub fn compiler_proxy_ready(status_output: &str) -> bool {
    status_output.lines().any(|line| {
        let line = line.trim().to_ascii_lowercase();
        line.starts_with("compiler proxy") && line.contains(" status: ") && line.ends_with("ok")
    })
}

fn stamp_is_fresh(stamp: &Path, now: SystemTime) -> bool {
    std::fs::metadata(stamp)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age < GOMA_STAMP_TTL)
}

impl Session {
    fn build_dir(&self) -> Result<PathBuf> {
        Ok(self.config.build_path()?.to_path_buf())
    }

    pub(crate) async fn build(&self, targets: &[String]) -> Result<()> {
        if targets.is_empty() {
            self.channel
                .error("No targets. Specify 'all' to build all targets. (Not recommended)")
                .await;
            return Err(StError::new(ErrorKind::NoTarget));
        }
        if !self.request.revision.is_empty() {
            self.sync_workdir(&self.request.revision).await?;
        }
        self.build_targets(targets).await
    }

    /// Build without syncing first.
    pub(crate) async fn build_targets(&self, targets: &[String]) -> Result<()> {
        let build_dir = self.build_dir()?;

        if let Err(e) = self.ensure_compiler_proxy().await {
            warn!("Compiler proxy unavailable: {}", e);
        }

        // `_run` targets do not track their inputs; drop the stale manifest.
        for target in targets {
            if let Some(base) = target.strip_suffix("_run") {
                let isolated = build_dir.join(format!("{base}.isolated"));
                match tokio::fs::remove_file(&isolated).await {
                    Ok(()) => debug!("Removed {}", isolated.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove {}: {}", isolated.display(), e),
                }
            }
        }

        let mut argv = vec![
            "ninja".to_string(),
            "-C".to_string(),
            build_dir.display().to_string(),
        ];
        if let Some(jobs) = self.config.host.max_build_jobs.filter(|j| *j > 0) {
            argv.push("-j".to_string());
            argv.push(jobs.to_string());
        }
        argv.extend(targets.iter().cloned());
        self.run_spec(CommandSpec::new(self.source_path(), argv)).await
    }

    pub(crate) async fn clean(&self, targets: &[String]) -> Result<()> {
        if targets.is_empty() {
            self.channel
                .error("No targets. Specify 'all' to clean all targets.")
                .await;
            return Err(StError::new(ErrorKind::NoTarget));
        }
        for target in targets {
            if !pattern_matches(&CLEAN_TARGET, target)? {
                debug!("Refusing to clean '{}'", target);
                return Err(StError::new(ErrorKind::InvalidArgument));
            }
        }

        let build_dir = self.build_dir()?;
        let mut argv = vec![
            "ninja".to_string(),
            "-C".to_string(),
            build_dir.display().to_string(),
            "-t".to_string(),
            "clean".to_string(),
        ];
        argv.extend(targets.iter().cloned());
        self.run_spec(CommandSpec::new(self.source_path(), argv)).await
    }

    pub(crate) async fn clobber(&self, force: bool) -> Result<()> {
        let build_dir = self.build_dir()?;
        if !force {
            self.channel
                .info(format!("Use 'force' to remove contents of {}", build_dir.display()))
                .await;
            return Ok(());
        }

        self.channel
            .info(format!("Removing contents of {}", build_dir.display()))
            .await;
        match tokio::fs::remove_dir_all(&build_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.prepare().await
    }

    /// Create the build directory and generate build files for it.
    pub(crate) async fn prepare(&self) -> Result<()> {
        let build_dir = self.build_dir()?;
        create_build_dir(&build_dir).await?;

        let platform = self.config.platform()?;
        let mb_dir = self.source_path().join("tools").join("mb");
        let mut argv = if cfg!(windows) {
            vec![mb_dir.join("mb.bat").display().to_string()]
        } else {
            vec![
                "python".to_string(),
                mb_dir.join("mb.py").display().to_string(),
            ]
        };
        argv.extend(["gen".to_string(), "-c".to_string(), platform.mb_config.clone()]);
        if let Some(goma) = &self.config.host.goma_path {
            argv.push("-g".to_string());
            argv.push(goma.display().to_string());
        }
        argv.push(build_dir.display().to_string());
        self.run_spec(CommandSpec::new(self.source_path(), argv)).await
    }

    /// Make sure the distributed compiler proxy is up, at most once per
    /// stamp period.
    pub(crate) async fn ensure_compiler_proxy(&self) -> Result<()> {
        let Some(goma_path) = self.config.host.goma_path.clone() else {
            return Ok(());
        };
        let build_dir = self.build_dir()?;
        let stamp = build_dir.join(GOMA_STAMP_FILE);
        if stamp_is_fresh(&stamp, SystemTime::now()) {
            return Ok(());
        }
        if let Err(e) = std::fs::File::create(&stamp) {
            debug!("Could not touch {}: {}", stamp.display(), e);
        }

        let ctl = goma_ctl(&goma_path);
        let status: Vec<&str> = ctl.iter().map(String::as_str).chain(["status"]).collect();
        let mut start_attempted = false;
        for _ in 0..GOMA_POLL_ATTEMPTS {
            match self.executor.run_silently(&goma_path, &status).await {
                Ok(output) if compiler_proxy_ready(&output) => {
                    info!("Compiler proxy running");
                    self.channel.info("Compiler proxy running.").await;
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => debug!("goma_ctl status failed: {}", e),
            }

            if !start_attempted {
                start_attempted = true;
                let start = CommandSpec::new(
                    &goma_path,
                    ctl.iter().cloned().chain(["ensure_start".to_string()]),
                );
                if let Err(e) = self.executor.run(&start).await {
                    warn!("goma_ctl ensure_start failed: {}", e);
                }
            }
            self.channel.info("Waiting for compiler proxy ...").await;
            tokio::time::sleep(GOMA_POLL_INTERVAL).await;
        }

        self.channel.error("Timed out.").await;
        Err(StError::with_message(
            ErrorKind::TimedOut,
            "compiler proxy did not start",
        ))
    }
}

fn goma_ctl(goma_path: &Path) -> Vec<String> {
    if cfg!(windows) {
        vec![goma_path.join("goma_ctl.bat").display().to_string()]
    } else {
        vec![
            "python".to_string(),
            goma_path.join("goma_ctl.py").display().to_string(),
        ]
    }
}

async fn create_build_dir(path: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o750);
    builder.create(path).await?;
    Ok(())
}
