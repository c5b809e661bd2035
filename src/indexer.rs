use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::types::{RawOrder, RawToken};

/// One page of orders from the external indexer, ascending by `lastBlock`.
/// The ascending sort is part of the feed contract — cursor correctness
/// depends on it.
const GET_ORDERS_QUERY: &str = r#"
query GetOrders($lastBlock_gt: BigInt = -1, $skip: Int!, $first: Int!) {
  orders(
    orderBy: lastBlock
    orderDirection: asc
    where: { lastBlock_gt: $lastBlock_gt }
    skip: $skip
    first: $first
  ) {
    id
    lastBlock
    createdAt
    kind
    openFrom
    openTo
    currency { id name symbol }
    price
    maker
    taker
    paidAmount
    token { id createdAt contract tokenId owner uri }
  }
}"#;

const GET_TOKENS_QUERY: &str = r#"
query GetTokens($skip: Int!, $first: Int!, $where: Token_filter) {
  tokens(skip: $skip, first: $first, where: $where) {
    id
    createdAt
    contract
    tokenId
    owner
    uri
  }
}"#;

/// Filters for a token query, mirroring the feed's where-input.
#[derive(Debug, Clone, Default)]
pub struct TokenQuery {
    pub ids: Vec<String>,
    pub contract: Option<String>,
    pub owner: Option<String>,
    pub skip: u32,
    pub first: u32,
}

impl TokenQuery {
    fn variables(&self) -> serde_json::Value {
        let mut filter = serde_json::Map::new();
        match self.ids.as_slice() {
            [] => {}
            [id] => {
                filter.insert("id".to_string(), id.clone().into());
            }
            ids => {
                filter.insert("id_in".to_string(), ids.into());
            }
        }
        if let Some(contract) = &self.contract {
            filter.insert("contract".to_string(), contract.clone().into());
        }
        if let Some(owner) = &self.owner {
            filter.insert("owner".to_string(), owner.clone().into());
        }

        serde_json::json!({
            "skip": self.skip,
            "first": self.first,
            "where": filter,
        })
    }
}

/// The paginated order feed consumed by the ingress worker.
#[async_trait]
pub trait OrderFeed: Send + Sync {
    /// Fetch one page of raw orders with ordering token strictly greater
    /// than `last_block_gt` (all of them when `None`), ascending.
    async fn orders(
        &self,
        last_block_gt: Option<&str>,
        skip: u32,
        first: u32,
    ) -> Result<Vec<RawOrder>>;
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OrdersData {
    orders: Vec<RawOrder>,
}

#[derive(Debug, Deserialize)]
struct TokensData {
    tokens: Vec<RawToken>,
}

/// GraphQL client for the external indexer.
pub struct IndexerClient {
    http: reqwest::Client,
    url: String,
}

impl IndexerClient {
    pub fn new(url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, url })
    }

    async fn query<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T> {
        let body = serde_json::json!({ "query": query, "variables": variables });
        let resp: GraphQlResponse<T> = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(errors) = resp.errors {
            let messages: Vec<String> = errors.into_iter().map(|e| e.message).collect();
            return Err(AppError::Feed(messages.join("; ")));
        }

        resp.data
            .ok_or_else(|| AppError::Feed("indexer response had no data".to_string()))
    }

    /// Fetch tokens matching `query`; the batch read path goes through here.
    pub async fn tokens(&self, query: &TokenQuery) -> Result<Vec<RawToken>> {
        let data: TokensData = self.query(GET_TOKENS_QUERY, query.variables()).await?;
        Ok(data.tokens)
    }

    /// Fetch a single token by id, used when a read misses the local store.
    pub async fn token(&self, id: &str) -> Result<Option<RawToken>> {
        let query = TokenQuery {
            ids: vec![id.to_string()],
            first: 1,
            ..Default::default()
        };
        Ok(self.tokens(&query).await?.into_iter().next())
    }
}

#[async_trait]
impl OrderFeed for IndexerClient {
    async fn orders(
        &self,
        last_block_gt: Option<&str>,
        skip: u32,
        first: u32,
    ) -> Result<Vec<RawOrder>> {
        // Omit lastBlock_gt entirely when unset so the query default (-1)
        // applies and the feed returns from genesis.
        let mut variables = serde_json::Map::new();
        variables.insert("skip".to_string(), skip.into());
        variables.insert("first".to_string(), first.into());
        if let Some(cursor) = last_block_gt {
            variables.insert("lastBlock_gt".to_string(), cursor.into());
        }

        let data: OrdersData = self
            .query(GET_ORDERS_QUERY, serde_json::Value::Object(variables))
            .await?;
        debug!(
            last_block_gt = last_block_gt.unwrap_or("-"),
            skip,
            first,
            length = data.orders.len(),
            "indexer page"
        );
        Ok(data.orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_id_queries_by_id_not_id_in() {
        let query = TokenQuery {
            ids: vec!["0xc-1".to_string()],
            first: 1,
            ..Default::default()
        };
        let variables = query.variables();

        assert_eq!(variables["where"]["id"], "0xc-1");
        assert!(variables["where"].get("id_in").is_none());
        assert_eq!(variables["first"], 1);
        assert_eq!(variables["skip"], 0);
    }

    #[test]
    fn multi_id_query_carries_every_filter() {
        let query = TokenQuery {
            ids: vec!["a".to_string(), "b".to_string()],
            contract: Some("0xc".to_string()),
            owner: Some("0xowner".to_string()),
            skip: 10,
            first: 50,
        };
        let variables = query.variables();

        assert_eq!(variables["where"]["id_in"][1], "b");
        assert_eq!(variables["where"]["contract"], "0xc");
        assert_eq!(variables["where"]["owner"], "0xowner");
        assert_eq!(variables["skip"], 10);
        assert_eq!(variables["first"], 50);
    }

    #[test]
    fn empty_query_sends_no_filters() {
        let query = TokenQuery::default();
        let variables = query.variables();

        assert_eq!(variables["where"], serde_json::json!({}));
    }
}
