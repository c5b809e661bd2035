mod api;
mod bus;
mod config;
mod db;
mod enrich;
mod error;
mod indexer;
mod ingress;
mod metrics;
mod registry;
mod subscription;
mod types;
mod web3;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::{router, ApiState};
use crate::bus::ChangeBus;
use crate::config::{
    Config, BUS_CAPACITY, CHANNEL_CAPACITY, REGISTRY_LRU_CAPACITY, REGISTRY_RETRY_TTL_SECS,
};
use crate::db::{CursorStore, DocumentStore};
use crate::enrich::{EnrichmentWorker, RpcMetadataSource};
use crate::error::Result;
use crate::indexer::{IndexerClient, OrderFeed};
use crate::ingress::IngressWorker;
use crate::metrics::IngressMetrics;
use crate::registry::{CapabilityRegistry, RpcProbe};
use crate::web3::RpcClient;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = sqlx::SqlitePool::connect(&format!("sqlite:{}", cfg.db_path)).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready at {}", cfg.db_path);

    let store = DocumentStore::new(pool.clone());
    let cursor = CursorStore::new(pool.clone());
    let bus = ChangeBus::new(BUS_CAPACITY);
    let metrics = Arc::new(IngressMetrics::new());

    // --- Capability registry over the network's RPC endpoint ---
    let rpc = Arc::new(RpcClient::new(HashMap::from([(
        cfg.network.clone(),
        cfg.rpc_url.clone(),
    )]))?);
    let registry = Arc::new(CapabilityRegistry::new(
        pool.clone(),
        Arc::new(RpcProbe::new(Arc::clone(&rpc))),
        REGISTRY_LRU_CAPACITY,
        Duration::from_secs(REGISTRY_RETRY_TTL_SECS),
    ));

    // --- Channels ---
    let (enrich_tx, enrich_rx) = mpsc::channel(CHANNEL_CAPACITY);

    // --- Spawn tasks ---

    // Enrichment worker: drains the queue, publishes token_updated.
    let metadata = Arc::new(RpcMetadataSource::new(
        Arc::clone(&rpc),
        cfg.ipfs_gateway_url.clone(),
    )?);
    let enricher = EnrichmentWorker::new(
        enrich_rx,
        store.clone(),
        Arc::clone(&registry),
        metadata,
        Arc::clone(&bus),
    );
    tokio::spawn(async move { enricher.run().await });

    // Ingress worker: one self-requeueing polling job for this partition.
    let indexer = Arc::new(IndexerClient::new(cfg.indexer_url.clone())?);
    let worker = IngressWorker::new(
        cfg.network.clone(),
        Arc::clone(&indexer) as Arc<dyn OrderFeed>,
        store.clone(),
        cursor,
        Arc::clone(&bus),
        enrich_tx.clone(),
        Arc::clone(&metrics),
    );
    tokio::spawn(async move { worker.run().await });

    // --- HTTP API server ---
    let api_state = ApiState {
        store,
        registry,
        bus,
        enrich_tx,
        indexer,
        metrics,
        network: cfg.network.clone(),
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
