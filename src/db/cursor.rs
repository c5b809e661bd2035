use sqlx::Row;

use crate::error::Result;

/// Durable cursor record: last successfully processed position per partition.
/// Single logical writer per key (the ingress worker); never decreases.
#[derive(Clone)]
pub struct CursorStore {
    pool: sqlx::SqlitePool,
}

impl CursorStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM ingress_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingress_state (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> sqlx::SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let store = CursorStore::new(test_pool().await);
        assert_eq!(store.get("ingress_last_block:ethereum").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_then_get_roundtrips_and_overwrites() {
        let store = CursorStore::new(test_pool().await);

        store.put("k", "100").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("100"));

        store.put("k", "160").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("160"));
    }
}
