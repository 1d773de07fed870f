//! Process-wide tracing setup shared by the client and the daemon.
//!
//! ```ignore
//! let log_config = LogConfig::from_env("info").with_stderr();
//! let _guards = init_logging(&log_config)?;
//! ```

use crate::errors::{ErrorKind, Result, StError};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Filter directive, e.g. `info` or `st_common=debug`.
pub const LOG_ENV: &str = "ST_LOG";
/// `text` (default) or `json`.
pub const LOG_FORMAT_ENV: &str = "ST_LOG_FORMAT";
/// Optional file receiving a copy of every log line.
pub const LOG_FILE_ENV: &str = "ST_LOG_FILE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = StError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "text" | "pretty" | "compact" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(StError::with_message(
                ErrorKind::ConfigurationError,
                format!("unknown log format '{other}'"),
            )),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub directive: String,
    pub format: LogFormat,
    pub stderr: bool,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Read `ST_LOG`, `ST_LOG_FORMAT` and `ST_LOG_FILE`, falling back to
    /// `default_level` for the filter.
    pub fn from_env(default_level: &str) -> Self {
        let directive = std::env::var(LOG_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let file = std::env::var_os(LOG_FILE_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self {
            directive,
            format,
            stderr: false,
            file,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    /// Override the filter, unless `ST_LOG` was set explicitly.
    pub fn with_level(mut self, level: &str) -> Self {
        if std::env::var_os(LOG_ENV).is_none() {
            self.directive = level.to_string();
        }
        self
    }

    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(&self.directive).map_err(|e| {
            StError::with_message(
                ErrorKind::ConfigurationError,
                format!("invalid log filter '{}': {e}", self.directive),
            )
        })
    }
}

/// Keeps non-blocking writers alive; drop at exit to flush.
#[derive(Default)]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let mut guards = Vec::new();

    let stderr_layer = config.stderr.then(|| match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .boxed(),
    });

    let file_layer = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path.file_name().ok_or_else(|| {
                StError::with_message(
                    ErrorKind::ConfigurationError,
                    format!("log file '{}' has no file name", path.display()),
                )
            })?;
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .json()
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(config.filter()?)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            StError::with_message(
                ErrorKind::ConfigurationError,
                format!("logging already initialized: {e}"),
            )
        })?;

    Ok(LoggingGuards { _guards: guards })
}
