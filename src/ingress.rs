use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::bus::ChangeBus;
use crate::config::{CURSOR_KEY_PREFIX, POLL_BACKOFF_MS, POLL_DELAY_MS, POLL_PAGE_SIZE};
use crate::db::{CursorStore, DocumentStore};
use crate::enrich::EnrichRequest;
use crate::error::{AppError, Result};
use crate::indexer::OrderFeed;
use crate::metrics::IngressMetrics;
use crate::types::{ChangeEvent, Order, OrderUpdate, RawOrder, Token, TOPIC_ORDER_UPDATED};

// ---------------------------------------------------------------------------
// Record projection — pure, no I/O
// ---------------------------------------------------------------------------

/// Split one raw feed record into its order projection. Timestamps arrive as
/// integer-second strings; feed nulls stay `None` so they never overwrite
/// stored values.
pub fn project_order(network: &str, raw: &RawOrder) -> Order {
    Order {
        id: raw.id.clone(),
        network: network.to_string(),
        created_at: raw.created_at.parse().unwrap_or_default(),
        kind: raw.kind,
        open_from: raw.open_from.as_deref().and_then(parse_epoch_secs),
        open_to: raw.open_to.as_deref().and_then(parse_epoch_secs),
        currency: raw.currency.clone(),
        price: raw.price.clone(),
        token: raw.token.id.clone(),
        maker: raw.maker.clone(),
        taker: raw.taker.clone(),
        paid_amount: raw.paid_amount.clone(),
    }
}

/// The token projection of the same record, linked from the order by id.
pub fn project_token(network: &str, raw: &RawOrder) -> Token {
    project_raw_token(network, &raw.token)
}

pub fn project_raw_token(network: &str, raw: &crate::types::RawToken) -> Token {
    Token {
        id: raw.id.clone(),
        network: network.to_string(),
        created_at: raw.created_at.as_deref().and_then(parse_epoch_secs),
        contract: raw.contract.clone(),
        token_id: raw.token_id.clone(),
        owner: raw.owner.clone(),
        uri: raw.uri.clone(),
        metadata: None,
    }
}

fn parse_epoch_secs(s: &str) -> Option<i64> {
    s.parse().ok()
}

/// Ordering tokens are decimal block-derived values; compare numerically,
/// falling back to length-then-lexicographic for values past u128.
fn block_ord(a: &str, b: &str) -> Ordering {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => (a.len(), a).cmp(&(b.len(), b)),
    }
}

// ---------------------------------------------------------------------------
// Ingress worker
// ---------------------------------------------------------------------------

/// Owns the single perpetually-requeued unit of ingestion work for one
/// partition. Each execution drains the feed from the last cursor to the
/// tip, persists the advanced cursor, and requeues itself after a fixed
/// delay — with unlimited fixed-backoff retries on failure, so the last
/// persisted cursor is always the recovery point.
pub struct IngressWorker {
    network: String,
    feed: Arc<dyn OrderFeed>,
    store: DocumentStore,
    cursor: CursorStore,
    bus: Arc<ChangeBus<ChangeEvent>>,
    enrich_tx: mpsc::Sender<EnrichRequest>,
    metrics: Arc<IngressMetrics>,
}

impl IngressWorker {
    pub fn new(
        network: String,
        feed: Arc<dyn OrderFeed>,
        store: DocumentStore,
        cursor: CursorStore,
        bus: Arc<ChangeBus<ChangeEvent>>,
        enrich_tx: mpsc::Sender<EnrichRequest>,
        metrics: Arc<IngressMetrics>,
    ) -> Self {
        Self {
            network,
            feed,
            store,
            cursor,
            bus,
            enrich_tx,
            metrics,
        }
    }

    fn cursor_key(&self) -> String {
        format!("{CURSOR_KEY_PREFIX}:{}", self.network)
    }

    pub async fn run(self) {
        // Seed from the durable cursor, or from genesis if absent.
        let mut cursor: Option<String> = loop {
            match self.cursor.get(&self.cursor_key()).await {
                Ok(value) => break value,
                Err(e) => {
                    error!(network = %self.network, "cursor read failed: {e}");
                    tokio::time::sleep(Duration::from_millis(POLL_BACKOFF_MS)).await;
                }
            }
        };
        info!(
            network = %self.network,
            cursor = cursor.as_deref().unwrap_or("genesis"),
            "ingress worker started"
        );

        loop {
            let started = Instant::now();
            match self.execute(cursor.clone()).await {
                Ok((next, records)) => {
                    self.metrics.record_success(started.elapsed(), records);
                    cursor = next;
                    tokio::time::sleep(Duration::from_millis(POLL_DELAY_MS)).await;
                }
                Err(e) => {
                    // The cursor is left untouched; the next attempt replays
                    // from the last persisted position.
                    self.metrics.record_failure();
                    error!(network = %self.network, "failed to ingress: {e}");
                    tokio::time::sleep(Duration::from_millis(POLL_BACKOFF_MS)).await;
                }
            }
        }
    }

    /// One unit of work. Returns the cursor the next execution must carry
    /// and the number of records seen.
    async fn execute(&self, last_block_gt: Option<String>) -> Result<(Option<String>, u64)> {
        let (last_block, records) = self.poll(last_block_gt.as_deref()).await?;

        if let Some(value) = &last_block {
            if last_block_gt.as_deref() != Some(value.as_str()) {
                self.cursor.put(&self.cursor_key(), value).await?;
            }
        }

        Ok((last_block.or(last_block_gt), records))
    }

    /// Paginate the feed from `last_block_gt` until a short page signals the
    /// tip. Returns the ordering token of the last record seen, or `None`
    /// when the feed had nothing new.
    async fn poll(&self, last_block_gt: Option<&str>) -> Result<(Option<String>, u64)> {
        let mut skip = 0u32;
        let first = POLL_PAGE_SIZE;
        let mut last_block: Option<String> = None;
        let mut records = 0u64;

        loop {
            let page = self.feed.orders(last_block_gt, skip, first).await?;
            let length = page.len();
            if length == 0 {
                break;
            }

            // The feed contract requires ascending ordering tokens within a
            // session; a violation would silently corrupt the cursor.
            for raw in &page {
                if let Some(prev) = &last_block {
                    if block_ord(&raw.last_block, prev) == Ordering::Less {
                        return Err(AppError::Feed(format!(
                            "non-ascending ordering token {} after {} for order {}",
                            raw.last_block, prev, raw.id,
                        )));
                    }
                }
                last_block = Some(raw.last_block.clone());
            }

            self.process(&page).await?;
            records += length as u64;

            if length < first as usize {
                break;
            }
            skip += first;
        }

        Ok((last_block, records))
    }

    /// Persist one page and dispatch downstream: a record whose token was
    /// newly created gets an enrichment request, every other record gets an
    /// `order_updated` change event — exactly one of the two per record.
    async fn process(&self, raws: &[RawOrder]) -> Result<()> {
        let orders: Vec<Order> = raws.iter().map(|r| project_order(&self.network, r)).collect();
        let tokens: Vec<Token> = raws.iter().map(|r| project_token(&self.network, r)).collect();

        let (order_outcome, token_outcome) = tokio::join!(
            self.store.upsert_orders(&orders),
            self.store.upsert_tokens(&tokens),
        );
        let order_outcome = order_outcome?;
        let token_outcome = token_outcome?;

        let mut enqueued = 0usize;
        let mut published = 0usize;

        for i in 0..raws.len() {
            // A record that failed either write gets no downstream event.
            if order_outcome.failed.contains(&i) || token_outcome.failed.contains(&i) {
                continue;
            }
            debug!(order_id = %orders[i].id, token_id = %tokens[i].id, "ingress");

            if token_outcome.inserted.contains(&i) {
                let request = EnrichRequest {
                    order: Some(orders[i].clone()),
                    token: tokens[i].clone(),
                };
                match self.enrich_tx.try_send(request) {
                    Ok(()) => enqueued += 1,
                    Err(e) => {
                        debug!(token_id = %tokens[i].id, "enrichment queue full, skipping: {e}");
                    }
                }
            } else {
                self.bus.publish(
                    TOPIC_ORDER_UPDATED,
                    ChangeEvent::OrderUpdated(OrderUpdate {
                        order: orders[i].clone(),
                        token: tokens[i].clone(),
                    }),
                );
                published += 1;
            }
        }

        info!(
            network = %self.network,
            records = raws.len(),
            enriching = enqueued,
            published,
            "ingress page processed"
        );

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BUS_CAPACITY;
    use crate::types::{OrderKind, RawToken};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn raw(id: &str, last_block: u64) -> RawOrder {
        RawOrder {
            id: id.to_string(),
            last_block: last_block.to_string(),
            created_at: "1600000000".to_string(),
            kind: OrderKind::Direct,
            open_from: None,
            open_to: Some("1700000000".to_string()),
            currency: None,
            price: Some("1000".to_string()),
            maker: "0xmaker".to_string(),
            taker: None,
            paid_amount: None,
            token: RawToken {
                id: format!("0xc-{id}"),
                created_at: Some("1600000000".to_string()),
                contract: "0xc".to_string(),
                token_id: "1".to_string(),
                owner: Some("0xowner".to_string()),
                uri: None,
            },
        }
    }

    /// Serves scripted pages in order, recording every call.
    struct ScriptedFeed {
        pages: Mutex<Vec<Result<Vec<RawOrder>>>>,
        calls: Mutex<Vec<(Option<String>, u32)>>,
    }

    impl ScriptedFeed {
        fn new(pages: Vec<Result<Vec<RawOrder>>>) -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(pages),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl OrderFeed for ScriptedFeed {
        async fn orders(
            &self,
            last_block_gt: Option<&str>,
            skip: u32,
            _first: u32,
        ) -> Result<Vec<RawOrder>> {
            self.calls
                .lock()
                .push((last_block_gt.map(str::to_string), skip));
            let mut pages = self.pages.lock();
            if pages.is_empty() {
                Ok(Vec::new())
            } else {
                pages.remove(0)
            }
        }
    }

    struct Harness {
        worker: IngressWorker,
        cursor: CursorStore,
        store: DocumentStore,
        bus: Arc<ChangeBus<ChangeEvent>>,
        enrich_rx: mpsc::Receiver<EnrichRequest>,
    }

    async fn harness(feed: Arc<ScriptedFeed>) -> Harness {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let store = DocumentStore::new(pool.clone());
        let cursor = CursorStore::new(pool);
        let bus: Arc<ChangeBus<ChangeEvent>> = ChangeBus::new(BUS_CAPACITY);
        let (enrich_tx, enrich_rx) = mpsc::channel(64);

        let worker = IngressWorker::new(
            "ethereum".to_string(),
            feed,
            store.clone(),
            cursor.clone(),
            Arc::clone(&bus),
            enrich_tx,
            Arc::new(IngressMetrics::new()),
        );

        Harness {
            worker,
            cursor,
            store,
            bus,
            enrich_rx,
        }
    }

    #[tokio::test]
    async fn drains_to_tip_and_persists_max_ordering_token() {
        // Page 1: a full page, tokens 100..=150. Page 2: a short page,
        // tokens 150..=160 — short page means tip reached, no third call.
        let full: Vec<RawOrder> = (0..POLL_PAGE_SIZE as u64)
            .map(|i| raw(&format!("o{i}"), 100 + (i * 50) / (POLL_PAGE_SIZE as u64 - 1)))
            .collect();
        let short: Vec<RawOrder> = (0..37u64)
            .map(|i| raw(&format!("p{i}"), 150 + (i * 10) / 36))
            .collect();
        let feed = ScriptedFeed::new(vec![Ok(full), Ok(short)]);

        let h = harness(Arc::clone(&feed)).await;
        let (next, records) = h.worker.execute(None).await.unwrap();

        assert_eq!(next.as_deref(), Some("160"));
        assert_eq!(records, POLL_PAGE_SIZE as u64 + 37);
        assert_eq!(
            h.cursor.get("ingress_last_block:ethereum").await.unwrap().as_deref(),
            Some("160"),
        );

        let calls = feed.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], (None, 0));
        assert_eq!(calls[1], (None, POLL_PAGE_SIZE));

        // The next unit of work carries the advanced cursor.
        let (next, _) = h.worker.execute(next).await.unwrap();
        assert_eq!(next.as_deref(), Some("160"));
        assert_eq!(feed.calls.lock().last().unwrap().0.as_deref(), Some("160"));
    }

    #[tokio::test]
    async fn empty_feed_leaves_cursor_untouched() {
        let feed = ScriptedFeed::new(vec![Ok(Vec::new())]);
        let h = harness(feed).await;

        let (next, records) = h.worker.execute(Some("42".to_string())).await.unwrap();

        assert_eq!(next.as_deref(), Some("42"));
        assert_eq!(records, 0);
        assert_eq!(h.cursor.get("ingress_last_block:ethereum").await.unwrap(), None);
    }

    #[tokio::test]
    async fn feed_failure_fails_the_run_without_cursor_advance() {
        let feed = ScriptedFeed::new(vec![Err(AppError::Feed("boom".to_string()))]);
        let h = harness(feed).await;

        assert!(h.worker.execute(None).await.is_err());
        assert_eq!(h.cursor.get("ingress_last_block:ethereum").await.unwrap(), None);
    }

    #[tokio::test]
    async fn non_ascending_ordering_token_is_rejected() {
        let feed = ScriptedFeed::new(vec![Ok(vec![raw("a", 5), raw("b", 3)])]);
        let h = harness(feed).await;

        let err = h.worker.execute(None).await.unwrap_err();
        assert!(matches!(err, AppError::Feed(_)));
        assert_eq!(h.cursor.get("ingress_last_block:ethereum").await.unwrap(), None);
    }

    #[tokio::test]
    async fn new_token_enriches_existing_order_notifies_never_both() {
        // Seed record "b" so its re-sighting is an update.
        let seed = ScriptedFeed::new(vec![Ok(vec![raw("b", 10)])]);
        let mut h = harness(Arc::clone(&seed)).await;
        h.worker.execute(None).await.unwrap();
        assert!(h.enrich_rx.try_recv().is_ok()); // b's token was new on seed

        let mut order_sub = h.bus.subscribe(TOPIC_ORDER_UPDATED);

        seed.pages.lock().push(Ok(vec![raw("a", 11), raw("b", 12)]));
        h.worker.execute(Some("10".to_string())).await.unwrap();

        // Exactly one enrichment, for the new record's token.
        let request = h.enrich_rx.try_recv().unwrap();
        assert_eq!(request.token.id, "0xc-a");
        assert!(h.enrich_rx.try_recv().is_err());

        // Exactly one change event, for the existing record.
        match order_sub.recv().await.unwrap() {
            ChangeEvent::OrderUpdated(update) => {
                assert_eq!(update.order.id, "b");
                assert_eq!(update.token.id, "0xc-b");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        order_sub.close();
        assert_eq!(order_sub.recv().await.map(|_| ()), None);
    }

    #[tokio::test]
    async fn replayed_page_is_idempotent() {
        let page = vec![raw("a", 10), raw("b", 11)];
        let feed = ScriptedFeed::new(vec![Ok(page.clone()), Ok(page)]);
        let h = harness(feed).await;

        h.worker.execute(None).await.unwrap();
        let first = h.store.get_token("0xc-a").await.unwrap().unwrap();

        // Replay the identical page, as after a crash before cursor flush.
        h.worker.execute(None).await.unwrap();
        let second = h.store.get_token("0xc-a").await.unwrap().unwrap();

        assert_eq!(first.owner, second.owner);
        assert_eq!(first.created_at, second.created_at);
    }

    #[test]
    fn projection_strips_nulls_and_decodes_timestamps() {
        let raw = raw("a", 10);
        let order = project_order("ethereum", &raw);
        let token = project_token("ethereum", &raw);

        assert_eq!(order.created_at, 1_600_000_000);
        assert_eq!(order.open_from, None);
        assert_eq!(order.open_to, Some(1_700_000_000));
        assert_eq!(order.token, token.id);
        assert_eq!(token.created_at, Some(1_600_000_000));
        assert!(token.metadata.is_none());
    }

    #[test]
    fn block_ordering_is_numeric() {
        assert_eq!(block_ord("9", "10"), Ordering::Less);
        assert_eq!(block_ord("100", "100"), Ordering::Equal);
        assert_eq!(block_ord("160", "150"), Ordering::Greater);
    }
}
