// =============================================================================
// ExchangeAdapter — typed capability over a spot exchange (C1, spec §4.7)
// =============================================================================
//
// Wire specifics of any concrete adapter are out of scope (spec §4.7) except
// for the signing requirement: HMAC of the lexicographically sorted query
// string plus a millisecond timestamp. `binance::client::BinanceAdapter` is
// the one reference implementation; every other core subsystem talks only to
// this trait, so a second venue is a pure addition, never a refactor.
// =============================================================================

use async_trait::async_trait;

use crate::errors::EngineResult;
use crate::types::{Order, Orderbook, OrderUpdate, PlaceOrderParams, Symbol};

/// Outcome of `validate_api_key` — whether the credentials are live and what
/// they're authorized to do.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApiKeyValidation {
    pub valid: bool,
    pub can_trade: bool,
    pub can_withdraw: bool,
    pub error: Option<String>,
}

/// Callback invoked by the adapter's orderbook stream subscription.
pub type OrderbookCallback = Box<dyn Fn(Orderbook) + Send + Sync>;

/// Callback invoked by the adapter's user-data stream subscription
/// (order/fill updates).
pub type UserDataCallback = Box<dyn Fn(OrderUpdate) + Send + Sync>;

/// Typed capability over a spot exchange. One instance is owned exclusively
/// by a single tenant's `UserEngine` (spec §3 Ownership) and holds that
/// tenant's own decrypted credentials — there is no shared, global client.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn get_orderbook(&self, symbol: &Symbol, depth: u32) -> EngineResult<Orderbook>;

    async fn place_order(&self, params: PlaceOrderParams) -> EngineResult<Order>;

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> EngineResult<Order>;

    async fn get_order_status(&self, symbol: &Symbol, order_id: &str) -> EngineResult<Order>;

    /// Subscribe to live orderbook updates for `symbol`. The returned future
    /// resolves only when the subscription ends (error or `disconnect`).
    async fn subscribe_orderbook(&self, symbol: &Symbol, on_update: OrderbookCallback) -> EngineResult<()>;

    /// Subscribe to this tenant's private order/fill stream.
    async fn subscribe_user_data(&self, on_update: UserDataCallback) -> EngineResult<()>;

    async fn validate_api_key(&self) -> EngineResult<ApiKeyValidation>;

    /// Tear down any open streams. Idempotent.
    async fn disconnect(&self);
}
