use std::collections::HashSet;

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::warn;

use crate::error::Result;
use crate::types::{Currency, Order, OrderKind, OrderUpdate, Token};

/// Per-batch result of a bulk upsert: which input indices created a new
/// document, and which failed outright. Everything else matched an existing
/// document and was merged in place.
#[derive(Debug, Default)]
pub struct UpsertOutcome {
    pub inserted: HashSet<usize>,
    pub failed: HashSet<usize>,
}

/// Durable order/token collections keyed by external id. Upserts are
/// unordered: one record's failure does not block the rest of the batch.
#[derive(Clone)]
pub struct DocumentStore {
    pool: sqlx::SqlitePool,
}

impl DocumentStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Bulk upsert orders keyed by id. Fields the feed signalled as absent
    /// (`None`) never overwrite stored values.
    pub async fn upsert_orders(&self, orders: &[Order]) -> Result<UpsertOutcome> {
        let mut existing = self
            .existing_ids("orders", orders.iter().map(|o| o.id.as_str()))
            .await?;
        let mut outcome = UpsertOutcome::default();

        for (i, order) in orders.iter().enumerate() {
            let currency = order
                .currency
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let res = sqlx::query(
                r#"
                INSERT INTO orders (id, network, created_at, kind, open_from, open_to,
                                    currency, price, token, maker, taker, paid_amount)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    network     = excluded.network,
                    created_at  = excluded.created_at,
                    kind        = excluded.kind,
                    open_from   = COALESCE(excluded.open_from, orders.open_from),
                    open_to     = COALESCE(excluded.open_to, orders.open_to),
                    currency    = COALESCE(excluded.currency, orders.currency),
                    price       = COALESCE(excluded.price, orders.price),
                    token       = excluded.token,
                    maker       = excluded.maker,
                    taker       = COALESCE(excluded.taker, orders.taker),
                    paid_amount = COALESCE(excluded.paid_amount, orders.paid_amount)
                "#,
            )
            .bind(&order.id)
            .bind(&order.network)
            .bind(order.created_at)
            .bind(order.kind.to_string())
            .bind(order.open_from)
            .bind(order.open_to)
            .bind(currency)
            .bind(&order.price)
            .bind(&order.token)
            .bind(&order.maker)
            .bind(&order.taker)
            .bind(&order.paid_amount)
            .execute(&self.pool)
            .await;

            match res {
                Ok(_) => {
                    if existing.insert(order.id.clone()) {
                        outcome.inserted.insert(i);
                    }
                }
                Err(e) => {
                    warn!(order_id = %order.id, "order upsert failed: {e}");
                    outcome.failed.insert(i);
                }
            }
        }

        Ok(outcome)
    }

    /// Bulk upsert tokens keyed by id. `metadata = None` never erases an
    /// enrichment result already on disk.
    pub async fn upsert_tokens(&self, tokens: &[Token]) -> Result<UpsertOutcome> {
        let mut existing = self
            .existing_ids("tokens", tokens.iter().map(|t| t.id.as_str()))
            .await?;
        let mut outcome = UpsertOutcome::default();

        for (i, token) in tokens.iter().enumerate() {
            let metadata = token
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let res = sqlx::query(
                r#"
                INSERT INTO tokens (id, network, created_at, contract, token_id, owner, uri, metadata)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    network    = excluded.network,
                    created_at = COALESCE(excluded.created_at, tokens.created_at),
                    contract   = excluded.contract,
                    token_id   = excluded.token_id,
                    owner      = COALESCE(excluded.owner, tokens.owner),
                    uri        = COALESCE(excluded.uri, tokens.uri),
                    metadata   = COALESCE(excluded.metadata, tokens.metadata)
                "#,
            )
            .bind(&token.id)
            .bind(&token.network)
            .bind(token.created_at)
            .bind(&token.contract)
            .bind(&token.token_id)
            .bind(&token.owner)
            .bind(&token.uri)
            .bind(metadata)
            .execute(&self.pool)
            .await;

            match res {
                Ok(_) => {
                    if existing.insert(token.id.clone()) {
                        outcome.inserted.insert(i);
                    }
                }
                Err(e) => {
                    warn!(token_id = %token.id, "token upsert failed: {e}");
                    outcome.failed.insert(i);
                }
            }
        }

        Ok(outcome)
    }

    pub async fn get_token(&self, id: &str) -> Result<Option<Token>> {
        let row = sqlx::query("SELECT * FROM tokens WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| token_from_row(&r)).transpose()
    }

    /// Enriched subset of the given ids: tokens that already carry metadata.
    pub async fn tokens_with_metadata(&self, ids: &[String]) -> Result<Vec<Token>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT * FROM tokens WHERE id IN ({}) AND metadata IS NOT NULL",
            placeholders(ids.len()),
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(token_from_row).collect()
    }

    /// Latest orders for one partition, each joined with its token. Snapshot
    /// source for new subscribers.
    pub async fn recent_orders(&self, network: &str, limit: i64) -> Result<Vec<OrderUpdate>> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE network = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(network)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let orders: Vec<Order> = rows.iter().map(order_from_row).collect::<Result<_>>()?;

        let token_ids: Vec<String> = orders.iter().map(|o| o.token.clone()).collect();
        let mut tokens = Vec::new();
        if !token_ids.is_empty() {
            let sql = format!(
                "SELECT * FROM tokens WHERE id IN ({})",
                placeholders(token_ids.len()),
            );
            let mut query = sqlx::query(&sql);
            for id in &token_ids {
                query = query.bind(id);
            }
            let rows = query.fetch_all(&self.pool).await?;
            tokens = rows.iter().map(token_from_row).collect::<Result<Vec<_>>>()?;
        }

        Ok(orders
            .into_iter()
            .filter_map(|order| {
                let token = tokens.iter().find(|t| t.id == order.token)?.clone();
                Some(OrderUpdate { order, token })
            })
            .collect())
    }

    async fn existing_ids<'a>(
        &self,
        table: &str,
        ids: impl Iterator<Item = &'a str>,
    ) -> Result<HashSet<String>> {
        let ids: Vec<&str> = ids.collect();
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let sql = format!(
            "SELECT id FROM {table} WHERE id IN ({})",
            placeholders(ids.len()),
        );
        let mut query = sqlx::query(&sql);
        for id in &ids {
            query = query.bind(*id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("id")).collect())
    }
}

fn placeholders(n: usize) -> String {
    let mut s = "?,".repeat(n);
    s.pop();
    s
}

fn order_from_row(row: &SqliteRow) -> Result<Order> {
    let currency: Option<String> = row.get("currency");
    let currency: Option<Currency> = currency
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(Order {
        id: row.get("id"),
        network: row.get("network"),
        created_at: row.get("created_at"),
        kind: OrderKind::parse(&row.get::<String, _>("kind")),
        open_from: row.get("open_from"),
        open_to: row.get("open_to"),
        currency,
        price: row.get("price"),
        token: row.get("token"),
        maker: row.get("maker"),
        taker: row.get("taker"),
        paid_amount: row.get("paid_amount"),
    })
}

fn token_from_row(row: &SqliteRow) -> Result<Token> {
    let metadata: Option<String> = row.get("metadata");
    let metadata: Option<serde_json::Value> = metadata
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(Token {
        id: row.get("id"),
        network: row.get("network"),
        created_at: row.get("created_at"),
        contract: row.get("contract"),
        token_id: row.get("token_id"),
        owner: row.get("owner"),
        uri: row.get("uri"),
        metadata,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> DocumentStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        DocumentStore::new(pool)
    }

    fn order(id: &str, token: &str) -> Order {
        Order {
            id: id.to_string(),
            network: "ethereum".to_string(),
            created_at: 1_600_000_000,
            kind: OrderKind::Direct,
            open_from: None,
            open_to: None,
            currency: None,
            price: Some("1000".to_string()),
            token: token.to_string(),
            maker: "0xmaker".to_string(),
            taker: None,
            paid_amount: None,
        }
    }

    fn token(id: &str) -> Token {
        Token {
            id: id.to_string(),
            network: "ethereum".to_string(),
            created_at: Some(1_600_000_000),
            contract: "0xc".to_string(),
            token_id: "1".to_string(),
            owner: Some("0xowner".to_string()),
            uri: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn first_sighting_is_inserted_resighting_is_update() {
        let store = test_store().await;

        let outcome = store.upsert_orders(&[order("a", "t-1")]).await.unwrap();
        assert!(outcome.inserted.contains(&0));

        let outcome = store.upsert_orders(&[order("a", "t-1")]).await.unwrap();
        assert!(outcome.inserted.is_empty());
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn replaying_a_batch_is_idempotent() {
        let store = test_store().await;
        let batch = vec![order("a", "t-1"), order("b", "t-2")];

        store.upsert_orders(&batch).await.unwrap();
        store.upsert_orders(&batch).await.unwrap();

        let rows = store.recent_orders("ethereum", 10).await.unwrap();
        // Tokens were never written, so the join is empty — count via a
        // direct id probe instead.
        assert!(rows.is_empty());
        let existing = store
            .existing_ids("orders", ["a", "b", "c"].into_iter())
            .await
            .unwrap();
        assert_eq!(existing.len(), 2);
    }

    #[tokio::test]
    async fn absent_fields_do_not_erase_stored_values() {
        let store = test_store().await;

        let mut enriched = token("t-1");
        enriched.metadata = Some(serde_json::json!({ "name": "one" }));
        store.upsert_tokens(&[enriched]).await.unwrap();

        // A re-sighting from the feed carries no metadata and no owner.
        let mut resight = token("t-1");
        resight.owner = None;
        resight.metadata = None;
        store.upsert_tokens(&[resight]).await.unwrap();

        let stored = store.get_token("t-1").await.unwrap().unwrap();
        assert_eq!(stored.metadata.unwrap()["name"], "one");
        assert_eq!(stored.owner.as_deref(), Some("0xowner"));
    }

    #[tokio::test]
    async fn present_fields_overwrite_stored_values() {
        let store = test_store().await;

        store.upsert_tokens(&[token("t-1")]).await.unwrap();

        let mut moved = token("t-1");
        moved.owner = Some("0xnew".to_string());
        store.upsert_tokens(&[moved]).await.unwrap();

        let stored = store.get_token("t-1").await.unwrap().unwrap();
        assert_eq!(stored.owner.as_deref(), Some("0xnew"));
    }

    #[tokio::test]
    async fn tokens_with_metadata_filters_unenriched() {
        let store = test_store().await;

        let mut a = token("t-a");
        a.metadata = Some(serde_json::json!({ "name": "a" }));
        let b = token("t-b");
        store.upsert_tokens(&[a, b]).await.unwrap();

        let enriched = store
            .tokens_with_metadata(&["t-a".to_string(), "t-b".to_string()])
            .await
            .unwrap();
        assert_eq!(enriched.len(), 1);
        assert_eq!(enriched[0].id, "t-a");
    }

    #[tokio::test]
    async fn recent_orders_joins_tokens() {
        let store = test_store().await;

        store.upsert_tokens(&[token("t-1")]).await.unwrap();
        store.upsert_orders(&[order("a", "t-1")]).await.unwrap();

        let rows = store.recent_orders("ethereum", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].order.id, "a");
        assert_eq!(rows[0].token.id, "t-1");
    }
}
