use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use sqlx::Row;

use crate::error::Result;
use crate::web3::{
    decode_bool_result, encode_supports_interface, CallOutcome, RpcClient,
    DROP_V1_INTERFACE_ID, ERC2981_INTERFACE_ID, ERC721_INTERFACE_ID,
    ERC721_METADATA_INTERFACE_ID, ROYALTIES_V2_INTERFACE_ID,
};

const KEY_SEPARATOR: &str = "\u{1F}";

/// Outcome of one capability probe. `Undetermined` means the probe could not
/// reach a verdict (node unreachable, malformed response) — it is never a
/// statement about the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Supported,
    Unsupported,
    Undetermined,
}

impl Probe {
    fn supported(self) -> bool {
        self == Probe::Supported
    }

    fn determined(self) -> bool {
        self != Probe::Undetermined
    }
}

/// Live capability probe against a deployed contract.
#[async_trait]
pub trait InterfaceProbe: Send + Sync {
    async fn supports_interface(
        &self,
        network: &str,
        address: &str,
        interface_id: [u8; 4],
    ) -> Probe;
}

/// Probe via `eth_call` to ERC-165 `supportsInterface`. A revert is an
/// on-chain answer (the contract does not implement discovery), so it maps
/// to `Unsupported`; transport failures map to `Undetermined`.
pub struct RpcProbe {
    rpc: Arc<RpcClient>,
}

impl RpcProbe {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl InterfaceProbe for RpcProbe {
    async fn supports_interface(
        &self,
        network: &str,
        address: &str,
        interface_id: [u8; 4],
    ) -> Probe {
        let data = encode_supports_interface(interface_id);
        match self.rpc.eth_call(network, address, &data).await {
            Ok(CallOutcome::Returned(result)) => match decode_bool_result(&result) {
                Some(true) => Probe::Supported,
                Some(false) => Probe::Unsupported,
                None => Probe::Undetermined,
            },
            Ok(CallOutcome::Reverted) => Probe::Unsupported,
            Err(_) => Probe::Undetermined,
        }
    }
}

/// Capability flags for one contract. Flags are immutable once confirmed;
/// a `false` here means either confirmed-unsupported or not-yet-determined.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RegistryEntry {
    pub network: String,
    pub address: String,
    pub is_erc721: bool,
    pub supports_erc721_metadata: bool,
    pub supports_erc2981: bool,
    pub supports_royalties_v2: bool,
    pub supports_drop_v1: bool,
}

struct CachedEntry {
    entry: RegistryEntry,
    /// `Some` when any probe came back undetermined — the entry is retried
    /// after this deadline instead of being trusted forever.
    expires_at: Option<Instant>,
}

/// Cache-aside capability lookup: bounded in-memory LRU, then the durable
/// store, then live probes with write-through. Only fully determined probe
/// sets are persisted; transient probe failures never become permanent
/// negatives on disk.
pub struct CapabilityRegistry {
    lru: Mutex<LruCache<String, CachedEntry>>,
    pool: sqlx::SqlitePool,
    probe: Arc<dyn InterfaceProbe>,
    retry_ttl: Duration,
}

impl CapabilityRegistry {
    pub fn new(
        pool: sqlx::SqlitePool,
        probe: Arc<dyn InterfaceProbe>,
        capacity: usize,
        retry_ttl: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("nonzero capacity");
        Self {
            lru: Mutex::new(LruCache::new(capacity)),
            pool,
            probe,
            retry_ttl,
        }
    }

    pub async fn lookup(&self, network: &str, address: &str) -> Result<RegistryEntry> {
        let key = make_key(network, address);

        {
            let mut lru = self.lru.lock();
            let expired = match lru.get(&key) {
                Some(cached) if cached.expires_at.map_or(true, |at| at > Instant::now()) => {
                    return Ok(cached.entry.clone());
                }
                Some(_) => true,
                None => false,
            };
            if expired {
                lru.pop(&key);
            }
        }

        if let Some(entry) = self.load(network, address).await? {
            self.lru.lock().put(
                key,
                CachedEntry {
                    entry: entry.clone(),
                    expires_at: None,
                },
            );
            return Ok(entry);
        }

        let (entry, determined) = self.probe_all(network, address).await;
        if determined {
            self.save(&entry).await?;
        }
        self.lru.lock().put(
            key,
            CachedEntry {
                entry: entry.clone(),
                expires_at: (!determined).then(|| Instant::now() + self.retry_ttl),
            },
        );

        Ok(entry)
    }

    /// Run the independent probes concurrently and join their results.
    /// ERC-721 base support is inferred: the metadata extension implies it,
    /// and otherwise it is probed directly only when the contract answered
    /// the discovery probe at all.
    async fn probe_all(&self, network: &str, address: &str) -> (RegistryEntry, bool) {
        let erc721 = async {
            let metadata = self
                .probe
                .supports_interface(network, address, ERC721_METADATA_INTERFACE_ID)
                .await;
            let base = match metadata {
                Probe::Supported => Probe::Supported,
                Probe::Unsupported => {
                    self.probe
                        .supports_interface(network, address, ERC721_INTERFACE_ID)
                        .await
                }
                Probe::Undetermined => Probe::Undetermined,
            };
            (base, metadata)
        };

        let ((is_erc721, metadata), erc2981, royalties, drop) = tokio::join!(
            erc721,
            self.probe
                .supports_interface(network, address, ERC2981_INTERFACE_ID),
            self.probe
                .supports_interface(network, address, ROYALTIES_V2_INTERFACE_ID),
            self.probe
                .supports_interface(network, address, DROP_V1_INTERFACE_ID),
        );

        let entry = RegistryEntry {
            network: network.to_string(),
            address: address.to_string(),
            is_erc721: is_erc721.supported(),
            supports_erc721_metadata: metadata.supported(),
            supports_erc2981: erc2981.supported(),
            supports_royalties_v2: royalties.supported(),
            supports_drop_v1: drop.supported(),
        };
        let determined = [is_erc721, metadata, erc2981, royalties, drop]
            .iter()
            .all(|p| p.determined());

        (entry, determined)
    }

    async fn load(&self, network: &str, address: &str) -> Result<Option<RegistryEntry>> {
        let row = sqlx::query("SELECT * FROM registries WHERE network = ? AND address = ?")
            .bind(network)
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| RegistryEntry {
            network: r.get("network"),
            address: r.get("address"),
            is_erc721: r.get::<i64, _>("is_erc721") != 0,
            supports_erc721_metadata: r.get::<i64, _>("supports_erc721_metadata") != 0,
            supports_erc2981: r.get::<i64, _>("supports_erc2981") != 0,
            supports_royalties_v2: r.get::<i64, _>("supports_royalties_v2") != 0,
            supports_drop_v1: r.get::<i64, _>("supports_drop_v1") != 0,
        }))
    }

    async fn save(&self, entry: &RegistryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO registries (network, address, is_erc721, supports_erc721_metadata,
                                    supports_erc2981, supports_royalties_v2, supports_drop_v1)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(network, address) DO UPDATE SET
                is_erc721                = excluded.is_erc721,
                supports_erc721_metadata = excluded.supports_erc721_metadata,
                supports_erc2981         = excluded.supports_erc2981,
                supports_royalties_v2    = excluded.supports_royalties_v2,
                supports_drop_v1         = excluded.supports_drop_v1
            "#,
        )
        .bind(&entry.network)
        .bind(&entry.address)
        .bind(entry.is_erc721 as i64)
        .bind(entry.supports_erc721_metadata as i64)
        .bind(entry.supports_erc2981 as i64)
        .bind(entry.supports_royalties_v2 as i64)
        .bind(entry.supports_drop_v1 as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn make_key(network: &str, address: &str) -> String {
    format!("{network}{KEY_SEPARATOR}{address}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
