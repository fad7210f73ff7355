// =============================================================================
// OrderManager — serializes adapter writes per tenant, journals fills (C5)
// =============================================================================
//
// Grounded on the teacher's `ExecutionEngine` (risk pre-check → adapter call
// → journal), generalized from one global client/risk pair to a per-tenant
// lock and a canonical `Order` return type instead of raw JSON.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::datastore::{DataStore, ExecutionLogEntry};
use crate::errors::{EngineError, EngineResult, ExchangeErrorKind};
use crate::exchange::ExchangeAdapter;
use crate::types::{Order, OrderStatus, OrderUpdate, PlaceOrderParams, Symbol, TenantId};

/// Filters accepted by `OrderManager::list`.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub symbol: Option<Symbol>,
    pub status: Option<OrderStatus>,
    pub limit: usize,
    pub offset: usize,
}

struct TenantOrders {
    /// Per-tenant write lock: every adapter-mutating call is serialized
    /// through this so two concurrent cycles never race the same order.
    lock: Mutex<()>,
    orders: parking_lot::RwLock<HashMap<String, Order>>,
    /// `(order_id, trade_id)` pairs already applied, for `record_fill`
    /// idempotency.
    seen_fills: parking_lot::RwLock<HashSet<(String, String)>>,
}

impl Default for TenantOrders {
    fn default() -> Self {
        Self {
            lock: Mutex::new(()),
            orders: parking_lot::RwLock::new(HashMap::new()),
            seen_fills: parking_lot::RwLock::new(HashSet::new()),
        }
    }
}

/// Serializes order placement/cancellation per tenant and keeps a local
/// mirror of order state for `status`/`list` queries (C5, spec §4.3).
pub struct OrderManager {
    tenants: parking_lot::RwLock<HashMap<TenantId, Arc<TenantOrders>>>,
    datastore: Arc<dyn DataStore>,
}

impl OrderManager {
    pub fn new(datastore: Arc<dyn DataStore>) -> Self {
        Self { tenants: parking_lot::RwLock::new(HashMap::new()), datastore }
    }

    fn tenant_orders(&self, tenant: &TenantId) -> Arc<TenantOrders> {
        if let Some(t) = self.tenants.read().get(tenant) {
            return t.clone();
        }
        self.tenants.write().entry(tenant.clone()).or_default().clone()
    }

    /// Place an order through `adapter`, journaling success and surfacing
    /// failure as a typed `ExchangeError` (spec §4.3).
    pub async fn place(
        &self,
        tenant: &TenantId,
        adapter: &dyn ExchangeAdapter,
        params: PlaceOrderParams,
    ) -> EngineResult<Order> {
        let t = self.tenant_orders(tenant);
        let _guard = t.lock.lock().await;

        let symbol = params.symbol.clone();
        match adapter.place_order(params).await {
            Ok(order) => {
                t.orders.write().insert(order.id.clone(), order.clone());
                self.datastore
                    .save_execution_log(ExecutionLogEntry {
                        tenant: tenant.clone(),
                        symbol: symbol.clone(),
                        action: "EXECUTED".to_string(),
                        status: "NEW".to_string(),
                        order_ids: vec![order.id.clone()],
                        reason: None,
                        at: Utc::now(),
                    })
                    .await;
                info!(tenant = %tenant, symbol = %symbol, order_id = %order.id, "order placed");
                Ok(order)
            }
            Err(e) => {
                warn!(tenant = %tenant, symbol = %symbol, error = %e, "order placement failed");
                Err(e)
            }
        }
    }

    /// Cancel an order; idempotent — an `UnknownOrder` response from the
    /// adapter is treated as a successful cancel (spec §4.3).
    pub async fn cancel(&self, tenant: &TenantId, adapter: &dyn ExchangeAdapter, symbol: &Symbol, order_id: &str) -> EngineResult<Order> {
        let t = self.tenant_orders(tenant);
        let _guard = t.lock.lock().await;

        match adapter.cancel_order(symbol, order_id).await {
            Ok(order) => {
                t.orders.write().insert(order.id.clone(), order.clone());
                Ok(order)
            }
            Err(EngineError::Exchange { kind: ExchangeErrorKind::UnknownOrder, .. }) => {
                // Already gone on the exchange side — synthesize a terminal
                // local view so callers see a consistent cancel outcome.
                let mut orders = t.orders.write();
                let order = orders.get(order_id).cloned().map(|mut o| {
                    o.status = OrderStatus::Canceled;
                    o.updated_at = Utc::now();
                    o
                });
                if let Some(order) = order {
                    orders.insert(order.id.clone(), order.clone());
                    Ok(order)
                } else {
                    Err(EngineError::exchange(ExchangeErrorKind::UnknownOrder, None, "order unknown to both adapter and local state".to_string()))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Local view of an order's last-known state, without round-tripping to
    /// the exchange.
    pub fn status(&self, tenant: &TenantId, order_id: &str) -> Option<Order> {
        self.tenant_orders(tenant).orders.read().get(order_id).cloned()
    }

    pub fn list(&self, tenant: &TenantId, filter: &OrderFilter) -> Vec<Order> {
        let t = self.tenant_orders(tenant);
        let orders = t.orders.read();
        let mut matched: Vec<Order> = orders
            .values()
            .filter(|o| filter.symbol.as_ref().map(|s| s == &o.symbol).unwrap_or(true))
            .filter(|o| filter.status.map(|s| s == o.status).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by_key(|o| o.updated_at);
        matched.reverse();

        let limit = if filter.limit == 0 { matched.len() } else { filter.limit };
        matched.into_iter().skip(filter.offset).take(limit).collect()
    }

    /// Apply a fill/status update delivered from the exchange stream.
    /// Idempotent by `(order_id, trade_id)` (spec §4.3).
    pub fn record_fill(&self, tenant: &TenantId, update: OrderUpdate) -> Option<Order> {
        let t = self.tenant_orders(tenant);

        if let Some(trade_id) = &update.trade_id {
            let key = (update.order_id.clone(), trade_id.clone());
            let mut seen = t.seen_fills.write();
            if seen.contains(&key) {
                return t.orders.read().get(&update.order_id).cloned();
            }
            seen.insert(key);
        }

        let mut orders = t.orders.write();
        let entry = orders.entry(update.order_id.clone()).or_insert_with(|| Order {
            id: update.order_id.clone(),
            client_id: String::new(),
            symbol: update.symbol.clone(),
            side: crate::types::Side::Buy,
            order_type: crate::types::OrderType::Limit,
            qty: update.filled_qty,
            price: None,
            status: update.status,
            filled_qty: update.filled_qty,
            avg_price: update.avg_price,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });

        if entry.status.can_transition_to(update.status) {
            entry.status = update.status;
        }
        entry.filled_qty = update.filled_qty;
        entry.avg_price = update.avg_price.or(entry.avg_price);
        entry.updated_at = Utc::now();

        Some(entry.clone())
    }
}

impl std::fmt::Debug for OrderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderManager").field("tenants", &self.tenants.read().len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::InMemoryDataStore;
    use crate::exchange::{ApiKeyValidation, OrderbookCallback, UserDataCallback};
    use crate::types::{Order, Orderbook, OrderType, Side};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeAdapter {
        next_id: AtomicU64,
        fail_cancel_with_unknown: bool,
    }

    #[async_trait]
    impl ExchangeAdapter for FakeAdapter {
        async fn get_orderbook(&self, _symbol: &Symbol, _depth: u32) -> EngineResult<Orderbook> {
            unimplemented!()
        }

        async fn place_order(&self, params: PlaceOrderParams) -> EngineResult<Order> {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
            Ok(Order {
                id,
                client_id: params.client_id,
                symbol: params.symbol,
                side: params.side,
                order_type: params.order_type,
                qty: params.qty,
                price: params.price,
                status: OrderStatus::New,
                filled_qty: decimal_zero(),
                avg_price: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
        }

        async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> EngineResult<Order> {
            if self.fail_cancel_with_unknown {
                return Err(EngineError::exchange(ExchangeErrorKind::UnknownOrder, Some(400), "unknown order"));
            }
            Ok(Order {
                id: order_id.to_string(),
                client_id: String::new(),
                symbol: symbol.clone(),
                side: Side::Buy,
                order_type: OrderType::Limit,
                qty: decimal_zero(),
                price: None,
                status: OrderStatus::Canceled,
                filled_qty: decimal_zero(),
                avg_price: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
        }

        async fn get_order_status(&self, _symbol: &Symbol, _order_id: &str) -> EngineResult<Order> {
            unimplemented!()
        }

        async fn subscribe_orderbook(&self, _symbol: &Symbol, _on_update: OrderbookCallback) -> EngineResult<()> {
            unimplemented!()
        }

        async fn subscribe_user_data(&self, _on_update: UserDataCallback) -> EngineResult<()> {
            unimplemented!()
        }

        async fn validate_api_key(&self) -> EngineResult<ApiKeyValidation> {
            unimplemented!()
        }

        async fn disconnect(&self) {}
    }

    fn decimal_zero() -> rust_decimal::Decimal {
        rust_decimal::Decimal::ZERO
    }

    fn tenant() -> TenantId {
        TenantId::new("t1")
    }

    #[tokio::test]
    async fn place_journals_and_records_locally() {
        let om = OrderManager::new(InMemoryDataStore::new());
        let adapter = FakeAdapter { next_id: AtomicU64::new(1), fail_cancel_with_unknown: false };
        let params = PlaceOrderParams {
            symbol: Symbol::new("BTCUSDT"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: dec!(0.01),
            price: Some(dec!(100)),
            client_id: "c1".into(),
        };
        let order = om.place(&tenant(), &adapter, params).await.unwrap();
        assert_eq!(om.status(&tenant(), &order.id).unwrap().id, order.id);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_unknown_order() {
        let om = OrderManager::new(InMemoryDataStore::new());
        let adapter = FakeAdapter { next_id: AtomicU64::new(1), fail_cancel_with_unknown: false };
        let params = PlaceOrderParams {
            symbol: Symbol::new("BTCUSDT"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: dec!(0.01),
            price: Some(dec!(100)),
            client_id: "c1".into(),
        };
        let order = om.place(&tenant(), &adapter, params).await.unwrap();

        let adapter2 = FakeAdapter { next_id: AtomicU64::new(1), fail_cancel_with_unknown: true };
        let result = om.cancel(&tenant(), &adapter2, &Symbol::new("BTCUSDT"), &order.id).await;
        assert!(result.is_ok());
        assert_eq!(result.unwrap().status, OrderStatus::Canceled);
    }

    #[test]
    fn record_fill_is_idempotent_by_order_and_trade_id() {
        let om = OrderManager::new(InMemoryDataStore::new());
        let update = OrderUpdate {
            order_id: "1".into(),
            symbol: Symbol::new("BTCUSDT"),
            status: OrderStatus::PartiallyFilled,
            filled_qty: dec!(0.5),
            fill_qty_delta: dec!(0.5),
            avg_price: Some(dec!(100)),
            trade_id: Some("tr1".into()),
        };
        om.record_fill(&tenant(), update.clone());
        let first = om.status(&tenant(), "1").unwrap();
        om.record_fill(&tenant(), update);
        let second = om.status(&tenant(), "1").unwrap();
        assert_eq!(first.filled_qty, second.filled_qty);
    }
}
