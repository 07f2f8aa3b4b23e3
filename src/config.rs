use std::env;

use serde::{Deserialize, Serialize};

use crate::core::record::NodeId;
use crate::error::{MeshError, MeshResult};

/// Top-level node configuration.
///
/// Every knob has a default; `from_env` overrides them from `MESHKV_*`
/// variables so the bundled binary can be configured without code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable node identity; a random 16-hex id is generated when absent.
    pub node_id: Option<NodeId>,
    /// TCP listen port; `None` runs the node without a listener.
    pub port: Option<u16>,
    /// Peer URLs dialed at startup and kept alive with reconnect backoff.
    pub peers: Vec<String>,
    /// Listen address advertised in the hello handshake.
    pub public_url: Option<String>,
    /// Data directory for the file storage backend; `None` keeps everything
    /// in memory.
    pub data_dir: Option<String>,
    pub sync: SyncConfig,
    pub conflict: ConflictConfig,
    pub store: StoreConfig,
    pub net: NetConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            port: None,
            peers: Vec::new(),
            public_url: None,
            data_dir: None,
            sync: SyncConfig::default(),
            conflict: ConflictConfig::default(),
            store: StoreConfig::default(),
            net: NetConfig::default(),
        }
    }
}

/// Anti-entropy engine knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Periodic sync period in milliseconds; `None` means manual sync only.
    pub interval_ms: Option<u64>,
    /// Entries per sync chunk.
    pub chunk_size: usize,
    /// Retry attempts per sync before the peer is marked failed.
    pub max_attempts: u32,
    /// Delay between retry attempts (ms).
    pub retry_interval_ms: u64,
    /// Timeout waiting for the first sync-response (ms).
    pub initial_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: Some(5 * 60 * 1000), // 5 minutes
            chunk_size: 50,
            max_attempts: 3,
            retry_interval_ms: 5_000,
            initial_timeout_ms: 30_000,
        }
    }
}

/// Conflict resolution configuration. Custom resolver functions are
/// registered through the node API; only named strategies fit in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    pub default_strategy: String,
    /// `(path prefix, strategy name)` pairs; longest prefix wins.
    pub path_strategies: Vec<(String, String)>,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            default_strategy: "vector-dominance".to_string(),
            path_strategies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Prior records retained per path, newest first.
    pub max_versions: usize,
    /// Bound on the recent-commit log namespace.
    pub max_log_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_versions: 10,
            max_log_size: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Hop budget stamped on locally originated broadcasts.
    pub max_hops: u32,
    /// Capacity of the seen-message-id LRU.
    pub message_cache_size: usize,
    /// Per-peer outbound queue bound; overflow drops the oldest non-sync
    /// frame and flags the peer for anti-entropy.
    pub max_queue: usize,
    /// Reconnect backoff start (ms), doubling up to `reconnect_max_ms`.
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_hops: 32,
            message_cache_size: 10_000,
            max_queue: 1_000,
            reconnect_initial_ms: 5_000,
            reconnect_max_ms: 60_000,
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> MeshResult<Self> {
        let mut config = NodeConfig::default();

        config.node_id = env::var("MESHKV_NODE_ID").ok();
        if let Some(id) = &config.node_id {
            if id.len() != 16 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(MeshError::Config(format!(
                    "MESHKV_NODE_ID must be 16 hex characters, got '{}'",
                    id
                )));
            }
        }

        if let Ok(port) = env::var("MESHKV_PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| MeshError::Config(format!("invalid MESHKV_PORT '{}'", port)))?;
            if port == 0 {
                return Err(MeshError::Config("MESHKV_PORT must be 1..65535".to_string()));
            }
            config.port = Some(port);
        }

        if let Ok(peers) = env::var("MESHKV_PEERS") {
            config.peers = peers
                .split(',')
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty())
                .collect();
        }

        config.public_url = env::var("MESHKV_PUBLIC_URL").ok();
        config.data_dir = env::var("MESHKV_DATA_DIR").ok();

        if let Some(interval) = env_u64("MESHKV_SYNC_INTERVAL_MS")? {
            // 0 disables periodic sync entirely.
            config.sync.interval_ms = (interval > 0).then_some(interval);
        }
        if let Some(chunk_size) = env_u64("MESHKV_SYNC_CHUNK_SIZE")? {
            config.sync.chunk_size = chunk_size.max(1) as usize;
        }
        if let Some(attempts) = env_u64("MESHKV_SYNC_MAX_ATTEMPTS")? {
            config.sync.max_attempts = attempts.max(1) as u32;
        }
        if let Some(retry) = env_u64("MESHKV_SYNC_RETRY_INTERVAL_MS")? {
            config.sync.retry_interval_ms = retry;
        }
        if let Some(timeout) = env_u64("MESHKV_SYNC_INITIAL_TIMEOUT_MS")? {
            config.sync.initial_timeout_ms = timeout;
        }

        if let Ok(strategy) = env::var("MESHKV_DEFAULT_STRATEGY") {
            config.conflict.default_strategy = strategy;
        }

        if let Some(max_versions) = env_u64("MESHKV_MAX_VERSIONS")? {
            config.store.max_versions = max_versions.max(1) as usize;
        }
        if let Some(max_log) = env_u64("MESHKV_MAX_LOG_SIZE")? {
            config.store.max_log_size = max_log as usize;
        }

        if let Some(max_hops) = env_u64("MESHKV_MAX_HOPS")? {
            config.net.max_hops = max_hops as u32;
        }
        if let Some(cache) = env_u64("MESHKV_MESSAGE_CACHE_SIZE")? {
            config.net.message_cache_size = cache.max(1) as usize;
        }
        if let Some(max_queue) = env_u64("MESHKV_MAX_QUEUE")? {
            config.net.max_queue = max_queue.max(1) as usize;
        }

        Ok(config)
    }
}

fn env_u64(key: &str) -> MeshResult<Option<u64>> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| MeshError::Config(format!("invalid {} '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}
