use crate::error::{AppError, Result};

pub const INDEXER_URL: &str = "https://api.thegraph.com/subgraphs/name/marketplace/orders";
pub const IPFS_GATEWAY_URL: &str = "https://cloudflare-ipfs.com/";

/// Page size for one indexer query. The poller stops when a page comes back
/// shorter than this.
pub const POLL_PAGE_SIZE: u32 = 1000;

/// Delay before a completed ingress run becomes eligible again (milliseconds).
pub const POLL_DELAY_MS: u64 = 1000;

/// Backoff after a failed ingress run (milliseconds). Attempts are unlimited;
/// the last persisted cursor is the recovery point.
pub const POLL_BACKOFF_MS: u64 = 2000;

/// Cursor record key prefix; the network name is appended per partition.
pub const CURSOR_KEY_PREFIX: &str = "ingress_last_block";

/// Change bus per-topic channel capacity.
pub const BUS_CAPACITY: usize = 1024;

/// Capacity of the enrichment request queue.
pub const CHANNEL_CAPACITY: usize = 1024;

/// How long the enrichment waiter blocks for completion events (milliseconds).
pub const ENRICH_WAIT_TIMEOUT_MS: u64 = 10_000;

/// Capability registry in-memory cache capacity.
pub const REGISTRY_LRU_CAPACITY: usize = 100;

/// In-memory lifetime of registry entries holding undetermined probe results
/// (seconds). Fully determined entries never expire.
pub const REGISTRY_RETRY_TTL_SECS: u64 = 60;

/// Max orders returned by the subscription snapshot initializer.
pub const SNAPSHOT_LIMIT: i64 = 100;

/// Max tokens returned by one batch token read.
pub const TOKENS_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub indexer_url: String,
    /// JSON-RPC endpoint used for capability probes and tokenURI calls.
    pub rpc_url: String,
    /// Partition identifier carried on every record and cursor (NETWORK).
    pub network: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    pub ipfs_gateway_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            indexer_url: std::env::var("INDEXER_URL").unwrap_or_else(|_| INDEXER_URL.to_string()),
            rpc_url: std::env::var("RPC_URL")
                .map_err(|_| AppError::Config("RPC_URL must be set".to_string()))?,
            network: std::env::var("NETWORK").unwrap_or_else(|_| "ethereum".to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "indexer.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            ipfs_gateway_url: std::env::var("IPFS_GATEWAY_URL")
                .unwrap_or_else(|_| IPFS_GATEWAY_URL.to_string()),
        })
    }
}
