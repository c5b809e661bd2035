use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::ChangeBus;
use crate::config::{ENRICH_WAIT_TIMEOUT_MS, SNAPSHOT_LIMIT, TOKENS_PAGE_LIMIT};
use crate::db::DocumentStore;
use crate::enrich::{wait_for_enrichment, EnrichRequest};
use crate::error::AppError;
use crate::indexer::{IndexerClient, TokenQuery};
use crate::ingress::project_raw_token;
use crate::metrics::{IngressMetrics, MetricsSnapshot};
use crate::registry::{CapabilityRegistry, RegistryEntry};
use crate::subscription::LiveQueryBuilder;
use crate::types::{ChangeEvent, OrderKind, Token, TOPIC_ORDER_UPDATED};

#[derive(Clone)]
pub struct ApiState {
    pub store: DocumentStore,
    pub registry: Arc<CapabilityRegistry>,
    pub bus: Arc<ChangeBus<ChangeEvent>>,
    pub enrich_tx: mpsc::Sender<EnrichRequest>,
    pub indexer: Arc<IndexerClient>,
    pub metrics: Arc<IngressMetrics>,
    pub network: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/tokens", get(get_tokens))
        .route("/tokens/:id", get(get_token))
        .route("/registries/:network/:address", get(get_registry))
        .route("/enrich", post(post_enrich))
        .route("/orders/subscribe", get(subscribe_orders))
        .route("/stats/ingress", get(get_stats_ingress))
        .with_state(state)
}

async fn get_health() -> &'static str {
    "OK"
}

async fn get_stats_ingress(State(state): State<ApiState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Read one token. A store miss falls back to a live indexer query; missing
/// metadata triggers a bounded enrichment wait. Un-enriched tokens come back
/// with `metadata` absent, never as an error.
async fn get_token(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Token>, AppError> {
    let token = match state.store.get_token(&id).await? {
        Some(token) => {
            if token.metadata.is_some() {
                return Ok(Json(token));
            }
            token
        }
        None => {
            let raw = state
                .indexer
                .token(&id)
                .await?
                .ok_or(AppError::NotFound)?;
            project_raw_token(&state.network, &raw)
        }
    };

    let mut tokens = wait_for_enrichment(
        &state.bus,
        &state.enrich_tx,
        vec![token],
        Duration::from_millis(ENRICH_WAIT_TIMEOUT_MS),
    )
    .await;
    Ok(Json(tokens.remove(0)))
}

#[derive(Debug, Deserialize)]
pub struct TokensQuery {
    /// Comma-separated token ids.
    pub ids: Option<String>,
    pub contract: Option<String>,
    pub owner: Option<String>,
    pub skip: Option<u32>,
    pub first: Option<u32>,
}

/// Batch token read: query the feed, overlay enriched documents from the
/// store, and wait (bounded) for enrichment of the rest. Tokens still
/// missing metadata come back as-is.
async fn get_tokens(
    State(state): State<ApiState>,
    Query(params): Query<TokensQuery>,
) -> Result<Json<Vec<Token>>, AppError> {
    let ids: Vec<String> = params
        .ids
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() && params.contract.is_none() && params.owner.is_none() {
        return Err(AppError::InvalidRequest(
            "at least one of ids, contract or owner is required".to_string(),
        ));
    }

    let query = TokenQuery {
        ids,
        contract: params.contract,
        owner: params.owner,
        skip: params.skip.unwrap_or(0),
        first: params.first.unwrap_or(TOKENS_PAGE_LIMIT).min(TOKENS_PAGE_LIMIT),
    };
    let raws = state.indexer.tokens(&query).await?;
    if raws.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let mut tokens: Vec<Token> = raws
        .iter()
        .map(|r| project_raw_token(&state.network, r))
        .collect();
    let ids: Vec<String> = tokens.iter().map(|t| t.id.clone()).collect();
    let enriched: HashMap<String, Token> = state
        .store
        .tokens_with_metadata(&ids)
        .await?
        .into_iter()
        .map(|t| (t.id.clone(), t))
        .collect();

    let missing: Vec<Token> = tokens
        .iter()
        .filter(|t| !enriched.contains_key(&t.id))
        .cloned()
        .collect();
    for token in tokens.iter_mut() {
        if let Some(doc) = enriched.get(&token.id) {
            token.merge(doc);
        }
    }

    if !missing.is_empty() {
        let waited = wait_for_enrichment(
            &state.bus,
            &state.enrich_tx,
            missing,
            Duration::from_millis(ENRICH_WAIT_TIMEOUT_MS),
        )
        .await;
        let waited: HashMap<String, Token> =
            waited.into_iter().map(|t| (t.id.clone(), t)).collect();
        for token in tokens.iter_mut() {
            if let Some(doc) = waited.get(&token.id) {
                token.merge(doc);
            }
        }
    }

    Ok(Json(tokens))
}

async fn get_registry(
    State(state): State<ApiState>,
    Path((network, address)): Path<(String, String)>,
) -> Result<Json<RegistryEntry>, AppError> {
    let entry = state.registry.lookup(&network, &address).await?;
    Ok(Json(entry))
}

/// Admin path: validate a token payload and enqueue it for enrichment.
async fn post_enrich(
    State(state): State<ApiState>,
    Json(token): Json<Token>,
) -> Result<&'static str, AppError> {
    if token.id.is_empty() || token.contract.is_empty() || token.token_id.is_empty() {
        return Err(AppError::InvalidRequest(
            "token id, contract and token_id are required".to_string(),
        ));
    }

    let request = EnrichRequest { order: None, token };
    state
        .enrich_tx
        .send(request)
        .await
        .map_err(|e| AppError::InvalidRequest(format!("enrichment queue unavailable: {e}")))?;

    Ok("OK")
}

// ---------------------------------------------------------------------------
// Live order subscription
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    /// Send a snapshot of current orders before the live tail.
    pub snapshot: Option<bool>,
    pub maker: Option<String>,
    pub kind: Option<String>,
}

/// Filter derived from the subscription arguments. Construction validates
/// the caller's input so a malformed filter rejects the subscription at
/// setup, not per event.
#[derive(Debug, Clone)]
struct OrderFilter {
    maker: Option<String>,
    kind: Option<OrderKind>,
}

impl OrderFilter {
    fn parse(params: &SubscribeQuery) -> Result<Self, AppError> {
        let maker = match &params.maker {
            Some(maker) if !maker.starts_with("0x") => {
                return Err(AppError::InvalidFilter(format!(
                    "maker must be a 0x-prefixed address, got {maker}"
                )));
            }
            Some(maker) => Some(maker.to_lowercase()),
            None => None,
        };

        let kind = match params.kind.as_deref() {
            Some(s) => match OrderKind::parse(s) {
                OrderKind::Unknown => {
                    return Err(AppError::InvalidFilter(format!("unknown order kind {s}")));
                }
                kind => Some(kind),
            },
            None => None,
        };

        Ok(Self { maker, kind })
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        let ChangeEvent::OrderUpdated(update) = event else {
            return false;
        };
        if let Some(maker) = &self.maker {
            if update.order.maker.to_lowercase() != *maker {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if update.order.kind != kind {
                return false;
            }
        }
        true
    }
}

async fn subscribe_orders(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Query(params): Query<SubscribeQuery>,
) -> Result<Response, AppError> {
    let filter = OrderFilter::parse(&params)?;
    Ok(ws.on_upgrade(move |socket| run_order_subscription(socket, state, params, filter)))
}

async fn run_order_subscription(
    socket: WebSocket,
    state: ApiState,
    params: SubscribeQuery,
    filter: OrderFilter,
) {
    let (mut write, mut read) = socket.split();

    let builder = LiveQueryBuilder::new()
        .restrict(|e: &ChangeEvent| e.network().to_string())
        .filter(move |e: &ChangeEvent| filter.matches(e));

    let mut live_query = if params.snapshot.unwrap_or(false) {
        let store = state.store.clone();
        let network = state.network.clone();
        let result = builder
            .subscribe_with_snapshot(&state.bus, TOPIC_ORDER_UPDATED, || async move {
                let updates = store.recent_orders(&network, SNAPSHOT_LIMIT).await?;
                Ok(vec![updates
                    .into_iter()
                    .map(ChangeEvent::OrderUpdated)
                    .collect()])
            })
            .await;
        match result {
            Ok(live_query) => live_query,
            Err(e) => {
                warn!("subscription snapshot failed: {e}");
                let _ = write.send(Message::Close(None)).await;
                return;
            }
        }
    } else {
        builder.subscribe(&state.bus, TOPIC_ORDER_UPDATED)
    };

    loop {
        tokio::select! {
            batch = live_query.next_batch() => {
                let Some(batch) = batch else { break };
                let text = match serde_json::to_string(&batch) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("subscription serialize failed: {e}");
                        break;
                    }
                };
                if write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            msg = read.next() => {
                match msg {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Caller cancelled or went away: release the bus subscription before
    // dropping the socket.
    live_query.close();
    debug!("order subscription closed");
}
