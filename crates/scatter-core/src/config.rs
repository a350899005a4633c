//! Configuration system for Scatter.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SCATTER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/scatter/config.toml
//!   3. ~/.config/scatter/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScatterConfig {
    pub network: NetworkConfig,
    pub messenger: MessengerConfig,
    pub store: StoreConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `address:port` to bind the datagram socket to. Port 0 = OS-assigned.
    pub bind: String,
}

/// Reliable-messaging knobs. The defaults are the protocol constants;
/// tests shrink the timeout to keep runs short.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// How long an unacknowledged message waits before it is resent.
    pub ack_timeout_ms: u64,
    /// Consecutive resends to a peer before it is sinbinned.
    pub max_retries: u64,
    /// Sinbin window, in multiples of the ack timeout.
    pub sinbin_factor: u32,
    /// Unacked messages a peer may carry before it can count as overcommitted.
    pub overcommit_floor: u64,
    /// Multiple of the fleet-average unacked count that marks a peer overcommitted.
    pub overcommit_ratio: f64,
    /// Virtual ring positions per worker.
    pub ring_replicas: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root of the local object cache.
    pub local_root: PathBuf,
    /// Remote backing store: an `http://` base URL or a directory path.
    /// Empty = local only.
    pub remote: String,
    /// How long `open_ro` keeps retrying a remote fetch.
    pub open_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// How often the peer-list objects are checked for changes.
    pub peer_refresh_secs: u64,
    /// Ordered receive gives up after this long without any response.
    pub no_progress_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:0".to_string(),
        }
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 2_000,
            max_retries: 10,
            sinbin_factor: 20,
            overcommit_floor: 5,
            overcommit_ratio: 1.2,
            ring_replicas: 64,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            local_root: data_dir().join("objects"),
            remote: String::new(),
            open_timeout_ms: 30_000,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            peer_refresh_secs: 60,
            no_progress_secs: 300,
        }
    }
}

impl MessengerConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn sinbin_window(&self) -> Duration {
        self.ack_timeout() * self.sinbin_factor
    }
}

impl StoreConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

impl DispatchConfig {
    pub fn peer_refresh(&self) -> Duration {
        Duration::from_secs(self.peer_refresh_secs)
    }

    pub fn no_progress(&self) -> Duration {
        Duration::from_secs(self.no_progress_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("scatter")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("scatter")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ScatterConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ScatterConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SCATTER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ScatterConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SCATTER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SCATTER_NETWORK__BIND") {
            self.network.bind = v;
        }
        if let Ok(v) = std::env::var("SCATTER_STORE__LOCAL_ROOT") {
            self.store.local_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SCATTER_STORE__REMOTE") {
            self.store.remote = v;
        }
        if let Ok(v) = std::env::var("SCATTER_MESSENGER__ACK_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.messenger.ack_timeout_ms = ms;
            }
        }
    }
}
