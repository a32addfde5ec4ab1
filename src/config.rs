//! Process configuration
//!
//! One YAML document carries a section per server role plus optional `io`
//! and `logging` sections:
//!
//! ```yaml
//! master:
//!   listen_addr: "127.0.0.1:7000"
//!   auth_token: "cluster-secret"
//! user_edge:
//!   listen_addr: "0.0.0.0:7100"
//!   master_addr: "127.0.0.1:7000"
//!   master_token: "cluster-secret"
//! voice_edge:
//!   signal_addr: "0.0.0.0:7200"
//!   media_addr: "0.0.0.0:7201"
//!   master_addr: "127.0.0.1:7000"
//!   master_token: "cluster-secret"
//! ```
//!
//! Every section is parsed on its own from a fresh read of the same file.
//! [`ConfigAggregator::load`] returns either all three role configs or the
//! first error, never a partial set.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::network::acl::AccessList;

/// Longest accepted shared secret.
pub const TOKEN_MAX: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("[{section}] cannot read config {}: {source}", path.display())]
    Read {
        section: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[{section}] section missing from config")]
    MissingSection { section: &'static str },

    #[error("[{section}] {source}")]
    Parse {
        section: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("[{section}] {key}: {reason}")]
    Invalid {
        section: &'static str,
        key: &'static str,
        reason: String,
    },
}

impl ConfigError {
    /// The config section that failed.
    pub fn section(&self) -> &'static str {
        match self {
            ConfigError::Read { section, .. }
            | ConfigError::MissingSection { section }
            | ConfigError::Parse { section, .. }
            | ConfigError::Invalid { section, .. } => section,
        }
    }

    /// The offending key, when it is known.
    pub fn key(&self) -> Option<&'static str> {
        match self {
            ConfigError::Invalid { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Shorthand for the validation checks below.
fn check(
    ok: bool,
    section: &'static str,
    key: &'static str,
    reason: impl FnOnce() -> String,
) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            section,
            key,
            reason: reason(),
        })
    }
}

fn check_token(section: &'static str, key: &'static str, token: &str) -> Result<(), ConfigError> {
    check(!token.is_empty(), section, key, || "cannot be empty".into())?;
    check(token.len() <= TOKEN_MAX, section, key, || {
        format!("too long: {} chars (max {})", token.len(), TOKEN_MAX)
    })
}

fn read_source(section: &'static str, path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        section,
        path: path.to_path_buf(),
        source,
    })
}

/// Pull one top-level section out of a YAML document.
fn extract_section<T: DeserializeOwned>(
    contents: &str,
    section: &'static str,
) -> Result<Option<T>, ConfigError> {
    let doc: serde_yaml::Value =
        serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse { section, source })?;
    match doc.get(section) {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(value) => serde_yaml::from_value(value.clone())
            .map(Some)
            .map_err(|source| ConfigError::Parse { section, source }),
    }
}

/// A role's configuration section.
///
/// Implementors only supply the section name and their semantic checks;
/// loading from a file or a string is shared.
pub trait RoleConfig: DeserializeOwned + Sized {
    const SECTION: &'static str;

    fn validate(&self) -> Result<(), ConfigError>;

    /// Read `path` and parse this role's section out of it.
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = read_source(Self::SECTION, path.as_ref())?;
        Self::from_str(&contents)
    }

    /// Parse this role's section from a YAML string.
    fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = extract_section(contents, Self::SECTION)?
            .ok_or(ConfigError::MissingSection { section: Self::SECTION })?;
        config.validate()?;
        Ok(config)
    }
}

// ============================================
// Master
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    /// Address edge roles register against.
    pub listen_addr: SocketAddr,

    /// Shared secret edges must present (32 char max).
    pub auth_token: String,

    #[serde(default = "default_max_edges")]
    pub max_edges: usize,

    /// Edge links silent for longer than this are dropped.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// Peers allowed to open edge links. Empty = everyone.
    #[serde(default)]
    pub allow: Vec<String>,
}

impl MasterConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// The parsed allow-list. Validated at load time.
    pub fn access_list(&self) -> Result<AccessList, ConfigError> {
        AccessList::parse(&self.allow).map_err(|bad| ConfigError::Invalid {
            section: Self::SECTION,
            key: "allow",
            reason: format!("invalid ip mask {:?}", bad),
        })
    }
}

impl RoleConfig for MasterConfig {
    const SECTION: &'static str = "master";

    fn validate(&self) -> Result<(), ConfigError> {
        let s = Self::SECTION;
        check_token(s, "auth_token", &self.auth_token)?;
        check(self.max_edges >= 1, s, "max_edges", || "must be at least 1".into())?;
        check(self.heartbeat_timeout_secs >= 1, s, "heartbeat_timeout_secs", || {
            "must be at least 1".into()
        })?;
        self.access_list()?;
        Ok(())
    }
}

// ============================================
// User edge
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserEdgeConfig {
    /// Address clients connect to.
    pub listen_addr: SocketAddr,

    pub master_addr: SocketAddr,
    pub master_token: String,

    /// Address announced to the master. Defaults to `listen_addr`.
    #[serde(default)]
    pub advertise_addr: Option<String>,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl UserEdgeConfig {
    pub fn advertise(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.listen_addr.to_string())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl RoleConfig for UserEdgeConfig {
    const SECTION: &'static str = "user_edge";

    fn validate(&self) -> Result<(), ConfigError> {
        let s = Self::SECTION;
        check_token(s, "master_token", &self.master_token)?;
        check(self.max_clients >= 1, s, "max_clients", || "must be at least 1".into())?;
        check(self.idle_timeout_secs >= 1, s, "idle_timeout_secs", || {
            "must be at least 1".into()
        })?;
        check(self.heartbeat_interval_secs >= 1, s, "heartbeat_interval_secs", || {
            "must be at least 1".into()
        })?;
        check(self.reconnect_interval_ms >= 10, s, "reconnect_interval_ms", || {
            format!("too small: {} (min 10)", self.reconnect_interval_ms)
        })?;
        if let Some(addr) = &self.advertise_addr {
            check(!addr.is_empty(), s, "advertise_addr", || "cannot be empty".into())?;
        }
        Ok(())
    }
}

// ============================================
// Voice edge
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoiceEdgeConfig {
    /// TCP signaling address.
    pub signal_addr: SocketAddr,

    /// UDP media address.
    pub media_addr: SocketAddr,

    pub master_addr: SocketAddr,
    pub master_token: String,

    /// Address announced to the master. Defaults to `signal_addr`.
    #[serde(default)]
    pub advertise_addr: Option<String>,

    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    /// Media peers silent for longer than this stop receiving relays.
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl VoiceEdgeConfig {
    pub fn advertise(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.signal_addr.to_string())
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl RoleConfig for VoiceEdgeConfig {
    const SECTION: &'static str = "voice_edge";

    fn validate(&self) -> Result<(), ConfigError> {
        let s = Self::SECTION;
        check_token(s, "master_token", &self.master_token)?;
        check(self.max_channels >= 1, s, "max_channels", || "must be at least 1".into())?;
        check(self.peer_timeout_secs >= 1, s, "peer_timeout_secs", || {
            "must be at least 1".into()
        })?;
        check(self.idle_timeout_secs >= 1, s, "idle_timeout_secs", || {
            "must be at least 1".into()
        })?;
        check(self.heartbeat_interval_secs >= 1, s, "heartbeat_interval_secs", || {
            "must be at least 1".into()
        })?;
        check(self.reconnect_interval_ms >= 10, s, "reconnect_interval_ms", || {
            format!("too small: {} (min 10)", self.reconnect_interval_ms)
        })?;
        if let Some(addr) = &self.advertise_addr {
            check(!addr.is_empty(), s, "advertise_addr", || "cannot be empty".into())?;
        }
        Ok(())
    }
}

// ============================================
// Shared I/O pools and logging
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoConfig {
    /// Threads in the accept ("boss") pool.
    #[serde(default = "default_accept_threads")]
    pub accept_threads: usize,

    /// Threads in the I/O ("worker") pool.
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            accept_threads: default_accept_threads(),
            io_threads: default_io_threads(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl IoConfig {
    pub const SECTION: &'static str = "io";

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Load the optional `io` section, falling back to defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = read_source(Self::SECTION, path.as_ref())?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = extract_section(contents, Self::SECTION)?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = Self::SECTION;
        check(self.accept_threads >= 1, s, "accept_threads", || "must be at least 1".into())?;
        check(self.io_threads >= 1, s, "io_threads", || "must be at least 1".into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl LoggingConfig {
    pub const SECTION: &'static str = "logging";

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = read_source(Self::SECTION, path.as_ref())?;
        Ok(extract_section(&contents, Self::SECTION)?.unwrap_or_default())
    }
}

// ============================================
// Default value functions
// ============================================

fn default_max_edges() -> usize {
    16
}

fn default_heartbeat_timeout_secs() -> u64 {
    30
}

fn default_max_clients() -> usize {
    1024
}

fn default_max_channels() -> usize {
    256
}

fn default_peer_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_reconnect_interval_ms() -> u64 {
    1000
}

fn default_accept_threads() -> usize {
    1
}

fn default_io_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================
// Aggregation
// ============================================

/// The three role configs, loaded together.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleConfigs {
    pub master: MasterConfig,
    pub user_edge: UserEdgeConfig,
    pub voice_edge: VoiceEdgeConfig,
}

/// Derives every role's config from one source.
pub struct ConfigAggregator;

impl ConfigAggregator {
    /// Load all three role configs from `path`.
    ///
    /// Each section re-reads the file. Fails on the first section that does
    /// not parse or validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<RoleConfigs, ConfigError> {
        let path = path.as_ref();
        let master = MasterConfig::from_file(path)?;
        let user_edge = UserEdgeConfig::from_file(path)?;
        let voice_edge = VoiceEdgeConfig::from_file(path)?;
        tracing::debug!("[config] [loaded] path={}", path.display());
        Ok(RoleConfigs {
            master,
            user_edge,
            voice_edge,
        })
    }

    /// Same as [`ConfigAggregator::load`] over an in-memory document.
    pub fn load_str(contents: &str) -> Result<RoleConfigs, ConfigError> {
        Ok(RoleConfigs {
            master: MasterConfig::from_str(contents)?,
            user_edge: UserEdgeConfig::from_str(contents)?,
            voice_edge: VoiceEdgeConfig::from_str(contents)?,
        })
    }
}
