//! Helpers shared by unit and integration tests across the workspace.
//!
//! ```ignore
//! #[ctor::ctor]
//! fn setup() {
//!     st_common::testing::init_test_logging();
//! }
//! ```

use crate::config::ConfigFile;
use crate::errors::Result;
use std::path::Path;
use std::sync::Once;
use tracing_subscriber::prelude::*;

/// Filter level for test output (default `info`).
pub const TEST_LOG_LEVEL_ENV: &str = "ST_TEST_LOG_LEVEL";

pub const TEST_HOST: &str = "localbox";
pub const TEST_REPOSITORY: &str = "chrome";
pub const TEST_PLATFORM: &str = "linux";

static TEST_LOGGING_INIT: Once = Once::new();

/// Route `tracing` output through the test harness's capture. Safe to call
/// more than once.
pub fn init_test_logging() {
    TEST_LOGGING_INIT.call_once(|| {
        let level = std::env::var(TEST_LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "st_common={level},st={level},sthd={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init();
    });
}

/// A one-host configuration serving [`TEST_PLATFORM`] of
/// [`TEST_REPOSITORY`] from `source`, optionally listening on `endpoint`
/// (`"<network>,<address>"`).
pub fn single_host_config(source: &Path, endpoint: Option<&str>) -> Result<ConfigFile> {
    let endpoints = match endpoint {
        Some(endpoint) => serde_json::json!({ TEST_HOST: endpoint }),
        None => serde_json::json!({}),
    };
    let document = serde_json::json!({
        TEST_HOST: {
            "repositories": {
                TEST_REPOSITORY: {
                    "src": source.display().to_string(),
                    "test_targets": ["base_unittests"],
                    "platforms": {
                        TEST_PLATFORM: {
                            "out": "out/Default",
                            "mb_config": "debug_bot",
                            "endpoints": endpoints,
                        }
                    }
                }
            }
        }
    });
    ConfigFile::from_json_str(&document.to_string(), &source.join(".stonesthrow"))
}
