//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration. File: ~/.config/scanrelay/config.toml or /etc/scanrelay/config.toml.
/// Env overrides: SCANRELAY_SERVER_HOST, SCANRELAY_SERVER_PORT, SCANRELAY_LOCAL_PORT,
/// SCANRELAY_CACHE_PATH.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Collector host. Empty disables the uplink.
    #[serde(default)]
    pub server_host: String,
    /// Collector port (default 2583).
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Local line-protocol port on 127.0.0.1 (default 25830).
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    #[serde(default = "default_client_cert")]
    pub client_cert: PathBuf,
    #[serde(default = "default_client_key")]
    pub client_key: PathBuf,
    /// CA bundle for the collector. Web PKI roots when unset.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    #[serde(default = "default_cache_max_mb")]
    pub cache_max_mb: u64,
    #[serde(default = "default_true")]
    pub caching: bool,
    #[serde(default = "default_resend_threshold")]
    pub resend_threshold: i32,
    #[serde(default = "default_ack_interval_secs")]
    pub ack_interval_secs: u64,
    #[serde(default = "default_reconnect_min_secs")]
    pub reconnect_min_secs: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    /// File toggled to `1`/`0` on connect/disconnect (e.g. a sysfs LED).
    #[serde(default)]
    pub indicator_path: Option<PathBuf>,
}

fn default_server_port() -> u16 {
    2583
}
fn default_local_port() -> u16 {
    25830
}
fn default_client_cert() -> PathBuf {
    PathBuf::from("/etc/scanrelay/client.crt")
}
fn default_client_key() -> PathBuf {
    PathBuf::from("/etc/scanrelay/client.key")
}
fn default_cache_path() -> PathBuf {
    PathBuf::from("/var/cache/scanrelay/spillover.bin")
}
fn default_cache_max_mb() -> u64 {
    250
}
fn default_true() -> bool {
    true
}
fn default_resend_threshold() -> i32 {
    5
}
fn default_ack_interval_secs() -> u64 {
    60
}
fn default_reconnect_min_secs() -> u64 {
    1
}
fn default_reconnect_max_secs() -> u64 {
    120
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            server_port: default_server_port(),
            local_port: default_local_port(),
            client_cert: default_client_cert(),
            client_key: default_client_key(),
            ca_cert: None,
            cache_path: default_cache_path(),
            cache_max_mb: default_cache_max_mb(),
            caching: true,
            resend_threshold: default_resend_threshold(),
            ack_interval_secs: default_ack_interval_secs(),
            reconnect_min_secs: default_reconnect_min_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
            indicator_path: None,
        }
    }
}

impl Config {
    pub fn uplink_enabled(&self) -> bool {
        !self.server_host.trim().is_empty()
    }

    pub fn cache_max_bytes(&self) -> u64 {
        self.cache_max_mb.saturating_mul(scanrelay_core::BYTES_PER_MB)
    }

    pub fn ack_interval(&self) -> Duration {
        Duration::from_secs(self.ack_interval_secs.max(1))
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_secs(self.reconnect_min_secs)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Load config: explicit file, else the first search path that exists, else defaults;
/// then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("SCANRELAY_SERVER_HOST") {
        c.server_host = s;
    }
    if let Some(s) = var("SCANRELAY_SERVER_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.server_port = p,
            Err(_) => tracing::warn!(value = %s, "ignoring invalid SCANRELAY_SERVER_PORT"),
        }
    }
    if let Some(s) = var("SCANRELAY_LOCAL_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.local_port = p,
            Err(_) => tracing::warn!(value = %s, "ignoring invalid SCANRELAY_LOCAL_PORT"),
        }
    }
    if let Some(s) = var("SCANRELAY_CACHE_PATH") {
        c.cache_path = PathBuf::from(s);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/scanrelay/config.toml"));
    }
    out.push(PathBuf::from("/etc/scanrelay/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
