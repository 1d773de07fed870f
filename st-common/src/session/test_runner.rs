//! Test-target verbs: argument validation, discovery and execution.

use super::{Pattern, Session, pattern_matches};
use crate::config::ResolvedConfig;
use crate::errors::{ErrorKind, Result, StError};
use crate::executor::CommandSpec;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::{debug, info};

static TEST_FILTER: Pattern = LazyLock::new(|| Regex::new(r"^[\w*][\w*._\-/:]*$"));
static TEST_OPTION: Pattern = LazyLock::new(|| Regex::new(r"^--?\w[\w*,._\-/=]*$"));

const WITH_OUTPUT: &str = "with-output";
const PRINT_TEST_STDIO: &str = "--test-launcher-print-test-stdio=always";

/// A validated command line for a test binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestInvocation {
    pub binary: PathBuf,
    pub arguments: Vec<String>,
}

impl TestInvocation {
    /// Validate `args` for `target`. Each argument is `with-output`, a gtest
    /// filter, or a `-`/`--` option; a lone `all` runs every test.
    pub fn parse(build_dir: &Path, target: &str, args: &[String]) -> Result<Self> {
        if args.is_empty() {
            return Err(StError::with_message(
                ErrorKind::InvalidArgument,
                "Specify \"all\" to run all tests",
            ));
        }
        let args: &[String] = if args.len() == 1 && args[0] == "all" {
            &[]
        } else {
            args
        };

        let mut arguments = Vec::new();
        let mut filters = Vec::new();
        for arg in args {
            if arg == WITH_OUTPUT {
                arguments.push(PRINT_TEST_STDIO.to_string());
            } else if pattern_matches(&TEST_FILTER, arg)? {
                filters.push(arg.as_str());
            } else if pattern_matches(&TEST_OPTION, arg)? {
                arguments.push(arg.clone());
            } else {
                return Err(StError::with_message(
                    ErrorKind::InvalidArgument,
                    format!("'{arg}' is not a test filter or option"),
                ));
            }
        }
        if !filters.is_empty() {
            arguments.push(format!("--gtest_filter={}", filters.join(":")));
        }

        Ok(Self {
            binary: build_dir.join(format!("{target}{}", std::env::consts::EXE_SUFFIX)),
            arguments,
        })
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.binary.display().to_string())
            .chain(self.arguments.iter().cloned())
            .collect()
    }
}

/// `//base:base_unittests` → `base_unittests`; `//tools/gn` → `gn`.
pub fn short_target_name(label: &str) -> &str {
    match label.rsplit_once(':') {
        Some((_, name)) => name,
        None => label.rsplit('/').next().unwrap_or(label),
    }
}

/// Configured test targets plus executables `gn` reports as test-only.
/// Discovery is best effort; a missing `gn` or build directory only yields
/// the configured list.
pub async fn discover_test_targets(config: &ResolvedConfig) -> Vec<String> {
    let mut targets: BTreeSet<String> = config.repository.test_targets.iter().cloned().collect();

    if let Ok(build_dir) = config.build_path() {
        let output = Command::new("gn")
            .arg("ls")
            .arg(build_dir)
            .arg("--type=executable")
            .arg("--testonly=true")
            .arg("--as=label")
            .current_dir(config.source_path())
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                let labels = String::from_utf8_lossy(&output.stdout);
                targets.extend(
                    labels
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(|l| short_target_name(l).to_string()),
                );
            }
            Ok(output) => debug!("gn ls exited with {}", output.status),
            Err(e) => debug!("gn ls unavailable: {}", e),
        }
    }

    info!("{} test targets known", targets.len());
    targets.into_iter().collect()
}

fn symbolizer_path(source: &Path) -> PathBuf {
    source
        .join("third_party")
        .join("llvm-build")
        .join("Release+Asserts")
        .join("bin")
        .join("llvm-symbolizer")
}

impl Session {
    /// Sync, build and run a test target.
    pub async fn run_test_target(&self, target: &str) -> Result<()> {
        let build_dir = self.config.build_path()?.to_path_buf();
        let invocation = match TestInvocation::parse(&build_dir, target, &self.request.arguments) {
            Ok(invocation) => invocation,
            Err(e) => {
                if self.request.arguments.is_empty() {
                    self.channel.error("Specify \"all\" to run all tests").await;
                }
                return Err(e);
            }
        };

        if !self.request.revision.is_empty() {
            self.sync_workdir(&self.request.revision).await?;
        }
        self.build_targets(&[target.to_string()]).await?;

        let mut spec = CommandSpec::new(self.source_path(), invocation.argv());
        let symbolizer = symbolizer_path(self.source_path());
        if symbolizer.is_file() {
            let symbolizer = symbolizer.display().to_string();
            spec = spec
                .env(
                    "ASAN_OPTIONS",
                    format!("detect_leaks=1 symbolize=1 external_symbolizer_path=\"{symbolizer}\""),
                )
                .env("LSAN_SYMBOLIZER_PATH", symbolizer);
        }
        self.run_spec(spec).await
    }
}
