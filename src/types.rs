use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    Direct,
    Auction,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderKind::Direct => "DIRECT",
            OrderKind::Auction => "AUCTION",
            OrderKind::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

impl OrderKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "DIRECT" => OrderKind::Direct,
            "AUCTION" => OrderKind::Auction,
            _ => OrderKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    pub id: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
}

/// Local order projection. Timestamps are unix seconds decoded from the
/// feed's integer-second strings; `None` means the feed signalled null, so
/// the field must not overwrite a stored value on upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub network: String,
    pub created_at: i64,
    pub kind: OrderKind,
    pub open_from: Option<i64>,
    pub open_to: Option<i64>,
    pub currency: Option<Currency>,
    pub price: Option<String>,
    /// Foreign key to `Token::id`.
    pub token: String,
    pub maker: String,
    pub taker: Option<String>,
    pub paid_amount: Option<String>,
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// Local token projection. `id` is the `{contract}-{token_id}` composite
/// assigned by the feed. Presence of `metadata` marks the token enriched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub network: String,
    pub created_at: Option<i64>,
    pub contract: String,
    pub token_id: String,
    pub owner: Option<String>,
    pub uri: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl Token {
    /// Merge `other` into `self`, taking every field `other` carries a value
    /// for and keeping existing values where `other` is absent.
    pub fn merge(&mut self, other: &Token) {
        if other.created_at.is_some() {
            self.created_at = other.created_at;
        }
        if other.owner.is_some() {
            self.owner = other.owner.clone();
        }
        if other.uri.is_some() {
            self.uri = other.uri.clone();
        }
        if other.metadata.is_some() {
            self.metadata = other.metadata.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types — one raw record from the indexer feed
// ---------------------------------------------------------------------------

/// Raw order record as returned by the indexer, ascending by `last_block`.
/// Nullable feed fields arrive as JSON null and deserialize to `None`; an
/// empty string is a present value and stays `Some("")`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOrder {
    pub id: String,
    /// Ordering token: block-derived, monotonically non-decreasing.
    pub last_block: String,
    /// Integer seconds as a decimal string.
    pub created_at: String,
    pub kind: OrderKind,
    pub open_from: Option<String>,
    pub open_to: Option<String>,
    pub currency: Option<Currency>,
    pub price: Option<String>,
    pub maker: String,
    pub taker: Option<String>,
    pub paid_amount: Option<String>,
    pub token: RawToken,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawToken {
    pub id: String,
    pub created_at: Option<String>,
    pub contract: String,
    pub token_id: String,
    pub owner: Option<String>,
    pub uri: Option<String>,
}

// ---------------------------------------------------------------------------
// Change events — transient, never persisted
// ---------------------------------------------------------------------------

pub const TOPIC_ORDER_UPDATED: &str = "order_updated";
pub const TOPIC_TOKEN_UPDATED: &str = "token_updated";

/// Merged order + token projection published on `order_updated`.
#[derive(Debug, Clone, Serialize)]
pub struct OrderUpdate {
    pub order: Order,
    pub token: Token,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "payload")]
pub enum ChangeEvent {
    OrderUpdated(OrderUpdate),
    TokenUpdated(Token),
}

impl ChangeEvent {
    /// Partition the event belongs to; restriction keys scope live
    /// subscribers to one partition.
    pub fn network(&self) -> &str {
        match self {
            ChangeEvent::OrderUpdated(u) => &u.order.network,
            ChangeEvent::TokenUpdated(t) => &t.network,
        }
    }
}
