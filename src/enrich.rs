use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::bus::ChangeBus;
use crate::db::DocumentStore;
use crate::error::Result;
use crate::registry::CapabilityRegistry;
use crate::types::{ChangeEvent, Order, Token, TOPIC_TOKEN_UPDATED};
use crate::web3::{decode_string_result, encode_token_uri, CallOutcome, RpcClient};

/// Fire-and-forget enrichment request. Completion is observed via a
/// `token_updated` change event, never via a return value.
#[derive(Debug, Clone)]
pub struct EnrichRequest {
    pub order: Option<Order>,
    pub token: Token,
}

// ---------------------------------------------------------------------------
// Enrichment waiter — request-path helper
// ---------------------------------------------------------------------------

/// Enqueue enrichment for `tokens` and block until a completion event has
/// been observed for every id, or `timeout` elapses. Returns the inputs with
/// observed fields merged in — on timeout the remainder comes back
/// un-enriched, which callers must treat as a valid state.
///
/// The bus subscription is registered before enqueueing and released on
/// every exit path when the handle drops.
pub async fn wait_for_enrichment(
    bus: &ChangeBus<ChangeEvent>,
    enrich_tx: &mpsc::Sender<EnrichRequest>,
    tokens: Vec<Token>,
    timeout: Duration,
) -> Vec<Token> {
    let mut sub = bus.subscribe(TOPIC_TOKEN_UPDATED);

    let mut results = tokens;
    let mut pending: HashMap<String, usize> = results
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.clone(), i))
        .collect();

    for token in results.iter() {
        let request = EnrichRequest {
            order: None,
            token: token.clone(),
        };
        if let Err(e) = enrich_tx.send(request).await {
            warn!(token_id = %token.id, "enrichment enqueue failed: {e}");
        }
    }

    let deadline = Instant::now() + timeout;
    while !pending.is_empty() {
        match timeout_at(deadline, sub.recv()).await {
            Ok(Some(ChangeEvent::TokenUpdated(update))) => {
                if let Some(i) = pending.remove(&update.id) {
                    results[i].merge(&update);
                }
            }
            Ok(Some(_)) => {}
            // Timeout or bus gone: return what was accumulated.
            Ok(None) | Err(_) => break,
        }
    }

    results
}

// ---------------------------------------------------------------------------
// Metadata source
// ---------------------------------------------------------------------------

/// Resolves the metadata document for one token.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn metadata(&self, token: &Token) -> Result<Option<serde_json::Value>>;
}

/// Fetches metadata from the token's URI, asking the contract for
/// `tokenURI(token_id)` when the feed did not carry one. `ipfs://` URIs are
/// rewritten to the configured gateway.
pub struct RpcMetadataSource {
    rpc: Arc<RpcClient>,
    http: reqwest::Client,
    ipfs_gateway_url: String,
}

impl RpcMetadataSource {
    pub fn new(rpc: Arc<RpcClient>, ipfs_gateway_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            rpc,
            http,
            ipfs_gateway_url,
        })
    }

    async fn token_uri(&self, token: &Token) -> Result<Option<String>> {
        if let Some(uri) = &token.uri {
            return Ok(Some(uri.clone()));
        }

        let data = encode_token_uri(&token.token_id)?;
        match self
            .rpc
            .eth_call(&token.network, &token.contract, &data)
            .await?
        {
            CallOutcome::Returned(result) => Ok(decode_string_result(&result)),
            CallOutcome::Reverted => Ok(None),
        }
    }
}

#[async_trait]
impl MetadataSource for RpcMetadataSource {
    async fn metadata(&self, token: &Token) -> Result<Option<serde_json::Value>> {
        let Some(uri) = self.token_uri(token).await? else {
            return Ok(None);
        };

        let url = resolve_url(&self.ipfs_gateway_url, &uri);
        let value = self.http.get(&url).send().await?.json().await?;
        Ok(Some(value))
    }
}

/// Rewrite `ipfs://` URIs to an HTTP gateway; anything else passes through.
pub fn resolve_url(gateway: &str, input: &str) -> String {
    match input.strip_prefix("ipfs://") {
        Some(rest) => format!("{gateway}ipfs/{rest}"),
        None => input.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Enrichment worker
// ---------------------------------------------------------------------------

/// Drains the enrichment queue: resolves metadata (capability-gated),
/// persists it, and publishes `token_updated`. Failures are logged and the
/// token stays un-enriched — waiters time out rather than seeing an error.
pub struct EnrichmentWorker {
    rx: mpsc::Receiver<EnrichRequest>,
    store: DocumentStore,
    registry: Arc<CapabilityRegistry>,
    source: Arc<dyn MetadataSource>,
    bus: Arc<ChangeBus<ChangeEvent>>,
}

impl EnrichmentWorker {
    pub fn new(
        rx: mpsc::Receiver<EnrichRequest>,
        store: DocumentStore,
        registry: Arc<CapabilityRegistry>,
        source: Arc<dyn MetadataSource>,
        bus: Arc<ChangeBus<ChangeEvent>>,
    ) -> Self {
        Self {
            rx,
            store,
            registry,
            source,
            bus,
        }
    }

    pub async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            let token_id = request.token.id.clone();
            if let Err(e) = self.enrich(request).await {
                warn!(token_id = %token_id, "enrichment failed: {e}");
            }
        }
    }

    async fn enrich(&self, request: EnrichRequest) -> Result<()> {
        if let Some(order) = &request.order {
            debug!(order_id = %order.id, token_id = %request.token.id, "enrichment from ingress");
        }
        let mut token = request.token;

        if token.metadata.is_none() {
            // Without a feed-supplied URI the contract must support the
            // metadata extension before it is worth asking for tokenURI.
            if token.uri.is_none() {
                let entry = self
                    .registry
                    .lookup(&token.network, &token.contract)
                    .await?;
                if !entry.supports_erc721_metadata {
                    debug!(token_id = %token.id, "contract has no metadata extension, skipping");
                    return Ok(());
                }
            }

            match self.source.metadata(&token).await? {
                Some(metadata) => token.metadata = Some(metadata),
                None => {
                    debug!(token_id = %token.id, "no metadata resolved");
                    return Ok(());
                }
            }
        }

        self.store.upsert_tokens(std::slice::from_ref(&token)).await?;
        self.bus
            .publish(TOPIC_TOKEN_UPDATED, ChangeEvent::TokenUpdated(token));

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
