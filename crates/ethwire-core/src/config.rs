//! Configuration system for ethwire.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $ETHWIRE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ethwire/config.toml
//!   3. ~/.config/ethwire/config.toml

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ethereum_types::H256;
use serde::{Deserialize, Serialize};

use crate::crypto::NodeId;
use crate::wire::{MAX_FRAME_SIZE, MIN_FRAME_BUDGET};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub sync: SyncConfig,
    pub chain: ChainConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the secp256k1 secret key. Auto-generated on first run.
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP address for inbound sessions.
    pub listen_addr: String,
    /// `enode://<id>@<ip>:<port>` URLs dialed at startup.
    pub bootnodes: Vec<String>,
    pub max_peers: usize,
    /// Client id announced in Hello.
    pub client_id: String,
    pub ping_interval_ms: u64,
    /// Peers silent for longer than this are dropped.
    pub idle_timeout_ms: u64,
    /// Bound on each auth/ack read during the handshake.
    pub handshake_timeout_ms: u64,
    /// Wire bytes each protocol may write per mux turn, frame overhead included.
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Enable the `par` capability and snapshot download.
    pub warp: bool,
    pub snapshot_dir: PathBuf,
    /// Deadline for any outstanding request.
    pub request_timeout_ms: u64,
    pub tick_interval_ms: u64,
    /// Bad chunks tolerated from one peer before it is disabled.
    pub max_chunk_mismatches: u32,
    /// Capacity of the downloader's free-peer queue.
    pub free_peer_buffer: usize,
}

/// Consensus parameters handed to the capabilities at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub network_id: u64,
    pub genesis_hash: H256,
    /// Block whose header must carry the DAO extra data. 0 = no challenge.
    pub dao_hardfork_block: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Port for the HTTP status endpoint on 127.0.0.1. 0 = disabled.
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

const MAINNET_GENESIS: [u8; 32] = [
    0xd4, 0xe5, 0x67, 0x40, 0xf8, 0x76, 0xae, 0xf8, 0xc0, 0x10, 0xb8, 0x6a, 0x40, 0xd5, 0xf5, 0x67,
    0x45, 0xa1, 0x18, 0xd0, 0x90, 0x6a, 0x34, 0xe6, 0x9a, 0xec, 0x8c, 0x0d, 0xb1, 0xcb, 0x8f, 0xa3,
];

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_path: config_dir().join("node.key"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:30303".into(),
            bootnodes: Vec::new(),
            max_peers: 25,
            client_id: format!("ethwire/{}", env!("CARGO_PKG_VERSION")),
            ping_interval_ms: 15_000,
            idle_timeout_ms: 60_000,
            handshake_timeout_ms: 5_000,
            max_frame_bytes: 1024,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            warp: true,
            snapshot_dir: data_dir().join("snapshot"),
            request_timeout_ms: 10_000,
            tick_interval_ms: 1_000,
            max_chunk_mismatches: 3,
            free_peer_buffer: 32,
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            genesis_hash: H256(MAINNET_GENESIS),
            dao_hardfork_block: 1_920_000,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { port: 7420 }
    }
}

impl NetworkConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl ChainConfig {
    pub fn dao_hardfork(&self) -> Option<u64> {
        (self.dao_hardfork_block != 0).then_some(self.dao_hardfork_block)
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ethwire")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("ethwire")
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
    #[error("invalid enode url {0:?}: {1}")]
    InvalidEnode(String, &'static str),
    #[error("invalid {field}: {why}")]
    Invalid { field: &'static str, why: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            NodeConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let frame = self.network.max_frame_bytes;
        if !(MIN_FRAME_BUDGET..=MAX_FRAME_SIZE).contains(&frame) {
            return Err(ConfigError::Invalid {
                field: "network.max_frame_bytes",
                why: format!("{frame} is outside {MIN_FRAME_BUDGET}..={MAX_FRAME_SIZE}"),
            });
        }
        Ok(())
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("ETHWIRE_CONFIG")
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
            let text = toml::to_string_pretty(&NodeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply ETHWIRE_SECTION__FIELD overrides. Unparseable values are ignored.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn flag(v: &str) -> bool {
            v == "true" || v == "1"
        }
        fn set<T: FromStr>(slot: &mut T, v: Option<String>) {
            if let Some(parsed) = v.and_then(|v| v.parse().ok()) {
                *slot = parsed;
            }
        }

        if let Some(v) = var("ETHWIRE_IDENTITY__KEY_PATH") {
            self.identity.key_path = PathBuf::from(v);
        }
        if let Some(v) = var("ETHWIRE_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = var("ETHWIRE_NETWORK__BOOTNODES") {
            self.network.bootnodes = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        set(&mut self.network.max_peers, var("ETHWIRE_NETWORK__MAX_PEERS"));
        if let Some(v) = var("ETHWIRE_NETWORK__CLIENT_ID") {
            self.network.client_id = v;
        }
        set(&mut self.network.ping_interval_ms, var("ETHWIRE_NETWORK__PING_INTERVAL_MS"));
        set(&mut self.network.idle_timeout_ms, var("ETHWIRE_NETWORK__IDLE_TIMEOUT_MS"));
        set(&mut self.network.handshake_timeout_ms, var("ETHWIRE_NETWORK__HANDSHAKE_TIMEOUT_MS"));
        set(&mut self.network.max_frame_bytes, var("ETHWIRE_NETWORK__MAX_FRAME_BYTES"));

        if let Some(v) = var("ETHWIRE_SYNC__WARP") {
            self.sync.warp = flag(&v);
        }
        if let Some(v) = var("ETHWIRE_SYNC__SNAPSHOT_DIR") {
            self.sync.snapshot_dir = PathBuf::from(v);
        }
        set(&mut self.sync.request_timeout_ms, var("ETHWIRE_SYNC__REQUEST_TIMEOUT_MS"));
        set(&mut self.sync.tick_interval_ms, var("ETHWIRE_SYNC__TICK_INTERVAL_MS"));
        set(&mut self.sync.max_chunk_mismatches, var("ETHWIRE_SYNC__MAX_CHUNK_MISMATCHES"));
        set(&mut self.sync.free_peer_buffer, var("ETHWIRE_SYNC__FREE_PEER_BUFFER"));

        set(&mut self.chain.network_id, var("ETHWIRE_CHAIN__NETWORK_ID"));
        set(&mut self.chain.genesis_hash, var("ETHWIRE_CHAIN__GENESIS_HASH"));
        set(&mut self.chain.dao_hardfork_block, var("ETHWIRE_CHAIN__DAO_HARDFORK_BLOCK"));

        set(&mut self.status.port, var("ETHWIRE_STATUS__PORT"));
    }
}

// ── enode URLs ────────────────────────────────────────────────────────────────

/// Parse `enode://<128 hex chars>@<ip>:<port>`. A `?discport=` suffix is ignored.
pub fn parse_enode(url: &str) -> Result<(NodeId, SocketAddr), ConfigError> {
    let invalid = |why| ConfigError::InvalidEnode(url.to_string(), why);

    let rest = url.strip_prefix("enode://").ok_or_else(|| invalid("missing enode:// scheme"))?;
    let (id_hex, addr) = rest.split_once('@').ok_or_else(|| invalid("missing @"))?;
    let addr = addr.split('?').next().unwrap_or(addr);

    let bytes = hex::decode(id_hex).map_err(|_| invalid("node id is not hex"))?;
    if bytes.len() != 64 {
        return Err(invalid("node id must be 64 bytes"));
    }
    let addr = addr.parse().map_err(|_| invalid("bad socket address"))?;
    Ok((NodeId::from_slice(&bytes), addr))
}
