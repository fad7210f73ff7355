// =============================================================================
// Shared domain types used across the trading core
// =============================================================================
//
// Prices, quantities and PnL are `rust_decimal::Decimal`, not `f64` — this
// engine accumulates inventory and adverse-move deltas across tens of
// thousands of ticks per tenant and binary floats drift observably over that
// horizon. Purely statistical features (percentiles, stddev of returns) stay
// `f64` since they are recomputed from a bounded window every tick rather
// than accumulated.
// =============================================================================

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: Decimal,
    #[serde(default)]
    pub locked: Decimal,
}

/// Opaque tenant identifier. Wraps a `String` so the registry key can't be
/// confused with a `Symbol` or an order id at the type level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Uppercase trading-pair identifier, e.g. `BTCUSDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Normalise to uppercase. Emptiness is rejected by callers at the
    /// validation boundary (`EngineConfig::validate`), not here — this type
    /// only guarantees the case-normal form.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// `+1` for BUY, `-1` for SELL — used to turn a fill quantity into a
    /// signed inventory delta without a branch at every call site.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("invalid side: {other}")),
        }
    }
}

/// Order type. Only `LIMIT` carries a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Market => write!(f, "MARKET"),
        }
    }
}

/// Order lifecycle state. `NEW -> (PARTIALLY_FILLED)* -> (FILLED | CANCELED |
/// REJECTED)`, strictly monotonic — a terminal state is final (P9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected)
    }

    /// Whether `self -> next` is a legal transition under the state machine
    /// in spec §3 (no return from a terminal state, no re-entering NEW).
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        !matches!((self, next), (OrderStatus::New, OrderStatus::New))
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::New => write!(f, "NEW"),
            OrderStatus::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Canceled => write!(f, "CANCELED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// A single resting order-book level. Both fields are non-negative by
/// construction of the adapter that produces them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderbookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// A full order book snapshot for one symbol. `bids` descend by price,
/// `asks` ascend; when both sides are present, `bids[0].price < asks[0].price`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orderbook {
    pub symbol: Symbol,
    pub bids: Vec<OrderbookLevel>,
    pub asks: Vec<OrderbookLevel>,
    pub update_seq: u64,
}

impl Orderbook {
    pub fn best_bid(&self) -> Option<OrderbookLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<OrderbookLevel> {
        self.asks.first().copied()
    }

    /// Midpoint of the best bid/ask. `None` if either side is empty — a
    /// cycle with no mid-price must abort (spec §4.2 tie-break policy).
    pub fn mid(&self) -> Option<Decimal> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        Some((bid + ask) / Decimal::from(2))
    }

    pub fn spread(&self) -> Option<Decimal> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        Some(ask - bid)
    }
}

/// Canonical order record, independent of any one exchange's wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters to place a new order — the adapter-facing request shape.
#[derive(Debug, Clone)]
pub struct PlaceOrderParams {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub client_id: String,
}

/// An order-state transition delivered from the exchange stream back into
/// the core (`OrderManager::on_order_update` / `HFTEngine::on_order_update`).
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order_id: String,
    pub symbol: Symbol,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub fill_qty_delta: Decimal,
    pub avg_price: Option<Decimal>,
    pub trade_id: Option<String>,
}
