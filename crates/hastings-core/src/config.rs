//! Configuration system for Hastings.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $HASTINGS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/hastings/config.toml
//!   3. ~/.config/hastings/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::peer::{PeerHandle, PeerHandleParseError};
use crate::reputation::ReputationPolicy;
use crate::wire::{DEFAULT_NEIGHBOUR_COUNT, MAX_DATAGRAM};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HastingsConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub reputation: ReputationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the node key. Auto-generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address the discovery transport binds to.
    pub listen_addr: String,
    /// Address other nodes reach us at, "<ip:port>". Needed when
    /// `listen_addr` is unspecified (0.0.0.0 or ::).
    pub advertise_addr: Option<String>,
    /// Receive buffer size. Datagrams larger than this are dropped.
    pub max_datagram: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Seed peers, "<fingerprint-hex>@<ip:port>".
    pub seed_peers: Vec<String>,
    /// Time-to-live of a pending ping or neighbours request.
    pub request_ttl_ms: u64,
    /// Upper bound on one walk round before it is evaluated anyway.
    pub round_timeout_ms: u64,
    /// Peers discovered before this many are not stored.
    pub burn_in: usize,
    /// Wait before re-seeding when the seed provider yields nothing.
    pub reseed_backoff_ms: u64,
    /// Mementos kept for rollback. 0 = unbounded.
    pub max_history: usize,
    /// Peers returned when answering a neighbours request.
    pub neighbour_count: usize,
    /// Capacity of the response and reputation channels.
    pub channel_capacity: usize,
    /// Fixed seed for candidate selection. None = OS entropy.
    pub rng_seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    #[serde(flatten)]
    pub policy: ReputationPolicy,
    /// JSON file the peer store persists to.
    pub store_path: PathBuf,
    /// How often changed peer records are written to `store_path`.
    pub flush_interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("node.key"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7470".to_string(),
            advertise_addr: None,
            max_datagram: MAX_DATAGRAM,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            seed_peers: Vec::new(),
            request_ttl_ms: 5_000,
            round_timeout_ms: 10_000,
            burn_in: 10,
            reseed_backoff_ms: 30_000,
            max_history: 256,
            neighbour_count: DEFAULT_NEIGHBOUR_COUNT,
            channel_capacity: 1_024,
            rng_seed: None,
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            policy: ReputationPolicy::default(),
            store_path: data_dir().join("peers.json"),
            flush_interval_ms: 5_000,
        }
    }
}

impl NetworkConfig {
    /// The advertised address, if one is configured.
    pub fn advertise_socket_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.advertise_addr
            .as_deref()
            .map(|a| {
                a.parse()
                    .map_err(|_| ConfigError::BadAdvertiseAddr(a.to_string()))
            })
            .transpose()
    }
}

impl ReputationConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl DiscoveryConfig {
    pub fn request_ttl(&self) -> Duration {
        Duration::from_millis(self.request_ttl_ms)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn reseed_backoff(&self) -> Duration {
        Duration::from_millis(self.reseed_backoff_ms)
    }

    /// Parse every configured seed. Fails on the first malformed entry.
    pub fn seed_handles(&self) -> Result<Vec<PeerHandle>, ConfigError> {
        self.seed_peers
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|e| ConfigError::BadSeed(s.clone(), e))
            })
            .collect()
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("hastings")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("hastings")
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
    #[error("bad seed peer {0:?}: {1}")]
    BadSeed(String, PeerHandleParseError),
    #[error("bad network.advertise_addr {0:?}")]
    BadAdvertiseAddr(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl HastingsConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            HastingsConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("HASTINGS_CONFIG")
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
            let text = toml::to_string_pretty(&HastingsConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply HASTINGS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("HASTINGS_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = lookup("HASTINGS_NETWORK__ADVERTISE_ADDR") {
            self.network.advertise_addr = Some(v);
        }
        if let Some(v) = lookup("HASTINGS_DISCOVERY__SEED_PEERS") {
            self.discovery.seed_peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("HASTINGS_DISCOVERY__BURN_IN") {
            if let Ok(n) = v.parse() {
                self.discovery.burn_in = n;
            }
        }
        if let Some(v) = lookup("HASTINGS_DISCOVERY__RNG_SEED") {
            if let Ok(n) = v.parse() {
                self.discovery.rng_seed = Some(n);
            }
        }
        if let Some(v) = lookup("HASTINGS_DISCOVERY__ROUND_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.discovery.round_timeout_ms = n;
            }
        }
    }
}
