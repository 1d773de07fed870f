//! Host, repository and platform configuration.
//!
//! [`ConfigFile`] owns every host by [`HostId`]. Repositories and platforms
//! record the id of the host they belong to and are always looked up through
//! the owning `ConfigFile`, so the model has no reference cycles.
//!
//! ```json
//! {
//!   "desk": {
//!     "alias": ["d"],
//!     "repositories": {
//!       "chrome": {
//!         "src": "~/chromium/src",
//!         "git": { "remote": "desk-mirror", "hostname": "build" },
//!         "platforms": {
//!           "linux": { "out": "out/Debug", "mb_config": "debug_bot",
//!                      "endpoints": { "desk": "tcp,localhost:9000" } }
//!         }
//!       }
//!     },
//!     "remotes": { "build": { "ssh_config": "build.example.com" } }
//!   }
//! }
//! ```

mod raw;

use crate::errors::{ErrorKind, Result, StError};
use raw::{RawConfig, RawHost, RawPlatform, RawRepository, RawTransport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "ST_CONFIG";
/// Environment variable overriding the detected local host name.
pub const HOST_ENV: &str = "ST_HOST";

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Canonical (primary) name of a configured host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct HostId(String);

impl HostId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Unix,
}

impl std::str::FromStr for Network {
    type Err = StError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            other => Err(StError::with_message(
                ErrorKind::ConfigurationError,
                format!("unsupported network '{other}'"),
            )),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Unix => write!(f, "unix"),
        }
    }
}

// ── Model ───────────────────────────────────────────────────────────────────

/// An address a platform server listens on, reachable from `host`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub network: Network,
    pub address: String,
    pub host: HostId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{} (from {})", self.network, self.address, self.host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformConfig {
    pub name: String,
    pub host: HostId,
    pub repository: String,
    pub relative_build_path: PathBuf,
    pub build_path: PathBuf,
    pub mb_config: String,
    pub endpoints: Vec<Endpoint>,
}

impl PlatformConfig {
    /// The endpoint reachable from `host`, if any.
    pub fn endpoint_for(&self, host: &HostId) -> Option<&Endpoint> {
        self.endpoints.iter().find(|ep| &ep.host == host)
    }
}

/// How a repository mirrors its branches through a shared upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GitSyncConfig {
    /// Name of the git remote used to exchange `BUILDER_HEAD`.
    pub remote: Option<String>,
    /// Host owning the upstream repository.
    pub remote_host: Option<HostId>,
    /// `branch.<name>.<property>` keys copied between hosts.
    pub syncable_properties: Vec<String>,
}

impl GitSyncConfig {
    pub fn has_upstream(&self) -> bool {
        self.remote.as_deref().is_some_and(|r| !r.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryConfig {
    pub name: String,
    pub host: HostId,
    pub source_path: PathBuf,
    pub platforms: BTreeMap<String, PlatformConfig>,
    pub git: GitSyncConfig,
    pub test_targets: Vec<String>,
}

/// How to open a shell on another host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTransport {
    pub target: HostId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_host: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_command: Vec<String>,
}

impl RemoteTransport {
    /// Argv that starts a passthrough client on the target host.
    pub fn shell_command(&self, target: &HostConfig, platform: &str, repository: &str) -> Vec<String> {
        let mut argv = if self.ssh_command.is_empty() {
            vec![
                "ssh".to_string(),
                self.ssh_host.clone().unwrap_or_else(|| target.id.to_string()),
            ]
        } else {
            self.ssh_command.clone()
        };
        let client = match &target.stonesthrow_path {
            Some(dir) => format!("{}/st", dir.display()),
            None => "st".to_string(),
        };
        argv.extend([
            "-T".to_string(),
            client,
            "--platform".to_string(),
            platform.to_string(),
            "--repository".to_string(),
            repository.to_string(),
            "--passthrough".to_string(),
        ]);
        argv
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostConfig {
    pub id: HostId,
    pub aliases: Vec<String>,
    pub repositories: BTreeMap<String, RepositoryConfig>,
    pub goma_path: Option<PathBuf>,
    pub stonesthrow_path: Option<PathBuf>,
    pub max_build_jobs: Option<u32>,
    pub remotes: Vec<RemoteTransport>,
}

impl HostConfig {
    /// Case-insensitive match against the host's name and aliases.
    pub fn is_same_host(&self, name: &str) -> bool {
        self.id.as_str().eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }

    pub fn transport_to(&self, target: &HostId) -> Option<&RemoteTransport> {
        self.remotes.iter().find(|r| &r.target == target)
    }
}

// ── ConfigFile ──────────────────────────────────────────────────────────────

/// Every configured host, keyed by id, plus the alias index.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigFile {
    pub path: PathBuf,
    hosts: BTreeMap<HostId, HostConfig>,
    #[serde(skip)]
    names: BTreeMap<String, HostId>,
}

/// Location of the configuration file when none is given explicitly.
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV)
        && !path.is_empty()
    {
        return Some(PathBuf::from(path));
    }
    if cfg!(windows) {
        std::env::var_os("APPDATA").map(|dir| PathBuf::from(dir).join("StonesThrow.cfg"))
    } else {
        dirs::home_dir().map(|home| home.join(".stonesthrow"))
    }
}

/// Name of the machine we are running on.
pub fn local_host_name() -> Result<String> {
    if let Ok(name) = std::env::var(HOST_ENV)
        && !name.trim().is_empty()
    {
        return Ok(name.trim().to_string());
    }
    let name = hostname::get().map_err(|e| {
        StError::with_message(ErrorKind::ConfigurationError, "cannot determine host name")
            .with_source(e)
    })?;
    Ok(name.to_string_lossy().into_owned())
}

fn config_error(path: &Path, message: impl std::fmt::Display) -> StError {
    StError::with_message(
        ErrorKind::ConfigurationError,
        format!("{}: {}", path.display(), message),
    )
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

impl ConfigFile {
    /// Read and normalize a configuration file. Files ending in `.toml` are
    /// parsed as TOML, anything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error(path, format!("cannot read: {e}")))?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            Self::from_toml_str(&text, path)
        } else {
            Self::from_json_str(&text, path)
        }
    }

    /// Load from `--config`, `ST_CONFIG`, or the platform default.
    pub fn load_default(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => default_config_path().ok_or_else(|| {
                StError::with_message(
                    ErrorKind::ConfigurationError,
                    "no configuration file location (set ST_CONFIG)",
                )
            })?,
        };
        Self::load(&path)
    }

    pub fn from_json_str(text: &str, path: &Path) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(text).map_err(|e| config_error(path, e))?;
        Self::normalize(raw, path)
    }

    pub fn from_toml_str(text: &str, path: &Path) -> Result<Self> {
        let raw: RawConfig = toml::from_str(text).map_err(|e| config_error(path, e))?;
        Self::normalize(raw, path)
    }

    fn normalize(raw: RawConfig, path: &Path) -> Result<Self> {
        if raw.hosts.is_empty() {
            return Err(config_error(path, "no configuration entries found"));
        }

        let mut names: BTreeMap<String, HostId> = BTreeMap::new();
        for (name, host) in &raw.hosts {
            let id = HostId::new(name.clone());
            for key in std::iter::once(name).chain(host.alias.iter()) {
                let key = key.to_ascii_lowercase();
                if let Some(existing) = names.get(&key) {
                    return Err(config_error(
                        path,
                        format!("alias '{key}' is not unique; already assigned to {existing}"),
                    ));
                }
                names.insert(key, id.clone());
            }
        }

        let lookup = |name: &str| names.get(&name.to_ascii_lowercase()).cloned();

        let mut hosts = BTreeMap::new();
        for (name, raw_host) in raw.hosts {
            let id = HostId::new(name);
            let host = normalize_host(&id, raw_host, &lookup, path)?;
            hosts.insert(id, host);
        }

        debug!("Loaded {} hosts from {}", hosts.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            hosts,
            names,
        })
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostConfig> {
        self.hosts.values()
    }

    pub fn host(&self, id: &HostId) -> Option<&HostConfig> {
        self.hosts.get(id)
    }

    /// Find a host by name or alias (case-insensitive). A fully qualified
    /// name also matches its first label.
    pub fn resolve_host(&self, name: &str) -> Option<&HostConfig> {
        let key = name.trim().to_ascii_lowercase();
        let id = self.names.get(&key).or_else(|| {
            key.split_once('.')
                .and_then(|(short, _)| self.names.get(short))
        })?;
        self.hosts.get(id)
    }

    /// The host that serves `platform` for `repository`.
    pub fn host_for_platform(&self, repository: &str, platform: &str) -> Result<&HostConfig> {
        let mut repo_found = false;
        for host in self.hosts.values() {
            if let Some(repo) = host.repositories.get(repository) {
                repo_found = true;
                if repo.platforms.contains_key(platform) {
                    return Ok(host);
                }
            }
        }
        if repo_found {
            Err(StError::with_message(
                ErrorKind::InvalidPlatform,
                format!("no host builds '{platform}' for repository '{repository}'"),
            ))
        } else {
            Err(StError::with_message(
                ErrorKind::InvalidRepository,
                format!("repository '{repository}' is not configured"),
            ))
        }
    }

    /// First repository (by name) that some host builds `platform` for. Used
    /// when no repository is named on the command line.
    pub fn repository_for_platform(&self, platform: &str) -> Result<String> {
        self.hosts
            .values()
            .flat_map(|host| host.repositories.iter())
            .filter(|(_, repo)| repo.platforms.contains_key(platform))
            .map(|(name, _)| name.clone())
            .min()
            .ok_or_else(|| {
                StError::with_message(
                    ErrorKind::InvalidPlatform,
                    format!("{platform} is not a valid platform"),
                )
            })
    }

    /// The configuration a server for `platform` of `repository` runs with.
    pub fn select_server(&self, platform: &str, repository: &str) -> Result<ResolvedConfig> {
        let host = self.host_for_platform(repository, platform)?;
        self.resolve(host, repository, Some(platform))
    }

    /// The configuration of `repository` on the named local host. The platform
    /// is attached when that host also serves it.
    pub fn select_local(
        &self,
        host_name: &str,
        platform: Option<&str>,
        repository: &str,
    ) -> Result<ResolvedConfig> {
        let host = self.resolve_host(host_name).ok_or_else(|| {
            StError::with_message(
                ErrorKind::ConfigIncomplete,
                format!("host '{host_name}' is not configured in {}", self.path.display()),
            )
        })?;
        let repo = host.repositories.get(repository).ok_or_else(|| {
            StError::with_message(
                ErrorKind::InvalidRepository,
                format!("repository '{repository}' is not configured on {}", host.id),
            )
        })?;
        let platform = platform.filter(|p| repo.platforms.contains_key(*p));
        self.resolve(host, repository, platform)
    }

    fn resolve(
        &self,
        host: &HostConfig,
        repository: &str,
        platform: Option<&str>,
    ) -> Result<ResolvedConfig> {
        let repo = host.repositories.get(repository).ok_or_else(|| {
            StError::with_message(
                ErrorKind::InvalidRepository,
                format!("repository '{repository}' is not configured on {}", host.id),
            )
        })?;
        let platform = match platform {
            Some(name) => Some(repo.platforms.get(name).cloned().ok_or_else(|| {
                StError::with_message(
                    ErrorKind::InvalidPlatform,
                    format!("platform '{name}' is not configured for {repository} on {}", host.id),
                )
            })?),
            None => None,
        };
        Ok(ResolvedConfig {
            config_file: self.path.clone(),
            host: host.clone(),
            repository: repo.clone(),
            platform,
        })
    }
}

fn normalize_host(
    id: &HostId,
    raw: RawHost,
    lookup: &dyn Fn(&str) -> Option<HostId>,
    path: &Path,
) -> Result<HostConfig> {
    let certificate = raw
        .certificates
        .and_then(|c| c.server)
        .and_then(|s| s.cert);

    let mut repositories = BTreeMap::new();
    for (name, raw_repo) in raw.repositories {
        let repo = normalize_repository(id, &name, raw_repo, certificate.as_deref(), lookup, path)?;
        repositories.insert(name, repo);
    }

    let mut remotes = Vec::new();
    for (target, raw_transport) in raw.remotes {
        remotes.push(normalize_transport(id, &target, raw_transport, lookup, path)?);
    }

    Ok(HostConfig {
        id: id.clone(),
        aliases: raw.alias,
        repositories,
        goma_path: raw.goma_path.filter(|p| !p.is_empty()).map(|p| expand_path(&p)),
        stonesthrow_path: raw.stonesthrow.filter(|p| !p.is_empty()).map(|p| expand_path(&p)),
        max_build_jobs: raw.max_build_jobs.filter(|n| *n > 0),
        remotes,
    })
}

fn normalize_repository(
    host: &HostId,
    name: &str,
    raw: RawRepository,
    certificate: Option<&str>,
    lookup: &dyn Fn(&str) -> Option<HostId>,
    path: &Path,
) -> Result<RepositoryConfig> {
    if raw.src.trim().is_empty() {
        return Err(config_error(
            path,
            format!("repository '{name}' on {host} has no 'src'"),
        ));
    }
    let source_path = expand_path(&raw.src);

    let remote_host = match raw.git.hostname.as_deref().filter(|h| !h.is_empty()) {
        Some(h) => Some(lookup(h).ok_or_else(|| {
            config_error(path, format!("git upstream host '{h}' of {name} is unknown"))
        })?),
        None => None,
    };

    let mut platforms = BTreeMap::new();
    for (platform_name, raw_platform) in raw.platforms {
        let platform = normalize_platform(
            host,
            name,
            &source_path,
            &platform_name,
            raw_platform,
            certificate,
            lookup,
            path,
        )?;
        platforms.insert(platform_name, platform);
    }

    Ok(RepositoryConfig {
        name: name.to_string(),
        host: host.clone(),
        source_path,
        platforms,
        git: GitSyncConfig {
            remote: raw.git.remote.filter(|r| !r.is_empty()),
            remote_host,
            syncable_properties: raw.git.syncable_properties,
        },
        test_targets: raw.test_targets,
    })
}

#[allow(clippy::too_many_arguments)]
fn normalize_platform(
    host: &HostId,
    repository: &str,
    source_path: &Path,
    name: &str,
    raw: RawPlatform,
    certificate: Option<&str>,
    lookup: &dyn Fn(&str) -> Option<HostId>,
    path: &Path,
) -> Result<PlatformConfig> {
    let out = raw.out.filter(|o| !o.is_empty()).ok_or_else(|| {
        config_error(path, format!("platform '{name}' of {repository} on {host} has no 'out'"))
    })?;
    let mb_config = raw.mb_config.filter(|m| !m.is_empty()).ok_or_else(|| {
        config_error(
            path,
            format!("platform '{name}' of {repository} on {host} has no 'mb_config'"),
        )
    })?;

    let mut endpoints = Vec::new();
    for (from_host, spec) in raw.endpoints {
        let Some((network, address)) = spec.split_once(',') else {
            return Err(config_error(
                path,
                format!("address \"{spec}\" is invalid; expected <network>,<address>"),
            ));
        };
        let network: Network = network
            .parse()
            .map_err(|e: StError| config_error(path, e))?;
        let from = lookup(&from_host).ok_or_else(|| {
            config_error(path, format!("endpoint host '{from_host}' of {name} is unknown"))
        })?;
        endpoints.push(Endpoint {
            network,
            address: address.trim().to_string(),
            host: from,
            certificate: certificate.map(str::to_string),
        });
    }

    let relative_build_path = PathBuf::from(&out);
    Ok(PlatformConfig {
        name: name.to_string(),
        host: host.clone(),
        repository: repository.to_string(),
        build_path: source_path.join(&relative_build_path),
        relative_build_path,
        mb_config,
        endpoints,
    })
}

fn normalize_transport(
    host: &HostId,
    target: &str,
    raw: RawTransport,
    lookup: &dyn Fn(&str) -> Option<HostId>,
    path: &Path,
) -> Result<RemoteTransport> {
    let target_id = lookup(target).ok_or_else(|| {
        config_error(path, format!("remote '{target}' of {host} is not a known host"))
    })?;
    let ssh_host = raw.ssh_config.filter(|s| !s.is_empty());
    if ssh_host.is_none() && raw.ssh_command.is_empty() {
        return Err(config_error(
            path,
            format!("remote '{target}' of {host} has neither 'ssh_config' nor 'ssh_command'"),
        ));
    }
    Ok(RemoteTransport {
        target: target_id,
        ssh_host,
        ssh_command: raw.ssh_command,
    })
}

// ── ResolvedConfig ──────────────────────────────────────────────────────────

/// One host's view of one repository, optionally narrowed to a platform.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub config_file: PathBuf,
    pub host: HostConfig,
    pub repository: RepositoryConfig,
    pub platform: Option<PlatformConfig>,
}

impl ResolvedConfig {
    pub fn host_id(&self) -> &HostId {
        &self.host.id
    }

    pub fn source_path(&self) -> &Path {
        &self.repository.source_path
    }

    pub fn git(&self) -> &GitSyncConfig {
        &self.repository.git
    }

    pub fn platform(&self) -> Result<&PlatformConfig> {
        self.platform.as_ref().ok_or_else(|| {
            StError::with_message(
                ErrorKind::InvalidPlatform,
                format!("no platform selected for {} on {}", self.repository.name, self.host.id),
            )
        })
    }

    pub fn platform_name(&self) -> &str {
        self.platform.as_ref().map_or("", |p| p.name.as_str())
    }

    pub fn build_path(&self) -> Result<&Path> {
        Ok(&self.platform()?.build_path)
    }

    pub fn is_same_host(&self, other: &ResolvedConfig) -> bool {
        self.host.id == other.host.id
    }
}
