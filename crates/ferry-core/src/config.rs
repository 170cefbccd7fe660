//! Configuration system for Ferry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FERRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ferry/config.toml
//!   3. ~/.config/ferry/config.toml

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::{DEFAULT_CHUNK_SIZE, DEFAULT_PORT, MAX_CHUNK_PAYLOAD};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name announced in discovery replies. Empty = host name.
    pub name: String,
    /// Addresses announced in discovery replies. Empty = auto-detect.
    pub addresses: Vec<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local address the import listener binds to.
    pub bind_addr: IpAddr,
    /// Well-known UDP port for discovery and transfers.
    pub port: u16,
    /// How long an export waits for the single discovery reply.
    pub discovery_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk payload size in bytes.
    pub chunk_size: usize,
    /// Maximum unacknowledged chunks in flight per session.
    pub window: usize,
    /// Per-chunk retransmission timeout.
    pub retransmit_ms: u64,
    /// Retransmissions of one chunk before the session aborts.
    pub max_retries: u32,
    /// How long a transfer may wait for the receiver's accept decision.
    pub accept_timeout_secs: u64,
    /// How long a finished receiver session keeps answering late chunks.
    pub linger_secs: u64,
    /// Silence after which a transferring receiver gives up.
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Payload exported by default, and where imports are written.
    pub data_file: PathBuf,
    /// Accept every incoming transfer without asking.
    pub auto_accept: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            discovery_timeout_ms: 3000,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            window: 8,
            retransmit_ms: 200,
            max_retries: 10,
            accept_timeout_secs: 30,
            linger_secs: 5,
            idle_timeout_secs: 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: home_dir().join("passwd").join("data.txt"),
            auto_accept: false,
        }
    }
}

impl NetworkConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

impl TransferConfig {
    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_secs(self.linger_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("ferry")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Expand a leading `~/` against $HOME.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
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
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FerryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            FerryConfig::default()
        };
        config.apply_env_overrides();
        config.storage.data_file = expand_home(&config.storage.data_file);
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FERRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config to `path` if none exists. Returns the path.
    pub fn write_default_if_missing(path: &Path) -> Result<PathBuf, ConfigError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
            }
            let text = toml::to_string_pretty(&FerryConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(path, text)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        Ok(path.to_path_buf())
    }

    /// Reject settings the protocol cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transfer;
        if t.chunk_size == 0 || t.chunk_size > MAX_CHUNK_PAYLOAD {
            return Err(ConfigError::Invalid {
                field: "transfer.chunk_size",
                reason: format!("must be between 1 and {MAX_CHUNK_PAYLOAD}"),
            });
        }
        if t.window == 0 {
            return Err(ConfigError::Invalid {
                field: "transfer.window",
                reason: "must be at least 1".into(),
            });
        }
        if t.max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "transfer.max_retries",
                reason: "must be at least 1".into(),
            });
        }
        if t.retransmit_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "transfer.retransmit_ms",
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }

    /// Apply FERRY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FERRY_IDENTITY__NAME") {
            self.identity.name = v;
        }
        if let Ok(v) = std::env::var("FERRY_NETWORK__BIND_ADDR") {
            if let Ok(a) = v.parse() {
                self.network.bind_addr = a;
            }
        }
        if let Ok(v) = std::env::var("FERRY_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("FERRY_TRANSFER__WINDOW") {
            if let Ok(w) = v.parse() {
                self.transfer.window = w;
            }
        }
        if let Ok(v) = std::env::var("FERRY_TRANSFER__CHUNK_SIZE") {
            if let Ok(c) = v.parse() {
                self.transfer.chunk_size = c;
            }
        }
        if let Ok(v) = std::env::var("FERRY_STORAGE__DATA_FILE") {
            self.storage.data_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FERRY_STORAGE__AUTO_ACCEPT") {
            self.storage.auto_accept = v == "true" || v == "1";
        }
    }
}
