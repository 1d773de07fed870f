//! On-disk configuration schema.
//!
//! The file is a map from host name to host block. JSON is the native format;
//! the same structure may be written as TOML with one table per host.

use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
pub(crate) struct RawConfig {
    pub hosts: BTreeMap<String, RawHost>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawHost {
    #[serde(default)]
    pub alias: Vec<String>,
    #[serde(default)]
    pub repositories: BTreeMap<String, RawRepository>,
    #[serde(default)]
    pub goma_path: Option<String>,
    #[serde(default)]
    pub stonesthrow: Option<String>,
    #[serde(default)]
    pub max_build_jobs: Option<u32>,
    #[serde(default)]
    pub remotes: BTreeMap<String, RawTransport>,
    #[serde(default)]
    pub certificates: Option<RawCertificates>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawCertificates {
    #[serde(default)]
    pub server: Option<RawCertificateLocator>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawCertificateLocator {
    #[serde(default)]
    pub cert: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawRepository {
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub platforms: BTreeMap<String, RawPlatform>,
    #[serde(default)]
    pub git: RawGit,
    #[serde(default)]
    pub test_targets: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawGit {
    #[serde(default)]
    pub syncable_properties: Vec<String>,
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawPlatform {
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    #[serde(default)]
    pub out: Option<String>,
    #[serde(default)]
    pub mb_config: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawTransport {
    #[serde(default)]
    pub ssh_config: Option<String>,
    #[serde(default)]
    pub ssh_command: Vec<String>,
}
