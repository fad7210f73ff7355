// =============================================================================
// UserEngine — per-tenant composition root (C9, spec §4.11)
// =============================================================================
//
// Owns everything scoped to one tenant: the decrypted exchange credentials
// (via its own `ExchangeAdapter` instance — never shared across tenants,
// spec §3 Ownership), the strategy/HFT engine pair, and the auto-trade
// toggle. Grounded on the teacher's single-tenant `AppState` composition in
// `main.rs`, generalized from one process-wide struct to one instance per
// tenant held by `EngineManager`.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::EngineConfig;
use crate::datastore::DataStore;
use crate::errors::EngineResult;
use crate::event_bus::EventBus;
use crate::exchange::ExchangeAdapter;
use crate::hft_engine::HFTEngine;
use crate::order_manager::{OrderFilter, OrderManager};
use crate::research::ResearchEngine;
use crate::risk::RiskManager;
use crate::strategy::{MarketMakingStrategy, StrategyHandler};
use crate::types::{Order, OrderUpdate, TenantId};

/// Everything owned by one tenant (C9, spec §4.11). Constructed once by
/// `EngineManager::create_engine` and torn down by `shutdown`, which is
/// idempotent (P10) the same way `HFTEngine::stop` is.
pub struct UserEngine {
    tenant: TenantId,
    adapter: Arc<dyn ExchangeAdapter>,
    order_manager: Arc<OrderManager>,
    hft: Arc<HFTEngine>,
    strategy: Arc<MarketMakingStrategy>,
    // Shared with `HFTEngine` so a toggle here (via `set_auto_trade`, e.g.
    // from `POST /api/auto-trade/toggle`) takes effect on the very next tick
    // (spec §4.2 step 1: "If autoTrade=false ... skip").
    auto_trade_enabled: Arc<AtomicBool>,
    datastore: Arc<dyn DataStore>,
    event_bus: Arc<EventBus>,
}

impl UserEngine {
    pub fn new(
        tenant: TenantId,
        config: EngineConfig,
        adapter: Arc<dyn ExchangeAdapter>,
        research: Arc<ResearchEngine>,
        datastore: Arc<dyn DataStore>,
        event_bus: Arc<EventBus>,
        risk: Arc<RiskManager>,
        min_accuracy_threshold: f64,
    ) -> Arc<Self> {
        let order_manager = Arc::new(OrderManager::new(datastore.clone()));
        let strategy = MarketMakingStrategy::new(
            tenant.clone(),
            config.clone(),
            adapter.clone(),
            order_manager.clone(),
            event_bus.clone(),
            datastore.clone(),
            risk.clone(),
        );
        let auto_trade_enabled = Arc::new(AtomicBool::new(false));
        let hft = HFTEngine::new(
            tenant.clone(),
            config,
            adapter.clone(),
            research,
            strategy.clone() as Arc<dyn StrategyHandler>,
            event_bus.clone(),
            datastore.clone(),
            risk,
            min_accuracy_threshold,
            auto_trade_enabled.clone(),
        );

        Arc::new(Self {
            tenant,
            adapter,
            order_manager,
            hft,
            strategy,
            auto_trade_enabled,
            datastore,
            event_bus,
        })
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn adapter(&self) -> Arc<dyn ExchangeAdapter> {
        self.adapter.clone()
    }

    pub fn order_manager(&self) -> Arc<OrderManager> {
        self.order_manager.clone()
    }

    pub fn hft(&self) -> Arc<HFTEngine> {
        self.hft.clone()
    }

    pub fn set_config(&self, config: EngineConfig) {
        self.strategy.set_config(config.clone());
        self.hft.set_config(config);
    }

    pub fn config(&self) -> EngineConfig {
        self.hft.config()
    }

    pub fn is_hft_running(&self) -> bool {
        self.hft.is_running()
    }

    pub fn inventory(&self) -> rust_decimal::Decimal {
        self.strategy.inventory()
    }

    pub fn balance(&self) -> rust_decimal::Decimal {
        self.strategy.balance()
    }

    pub fn auto_trade_enabled(&self) -> bool {
        self.auto_trade_enabled.load(Ordering::SeqCst)
    }

    /// Start the HFT cycle at `interval_ms` (spec §4.1 `startHft`).
    pub fn start_hft(&self, interval_ms: u64) {
        self.hft.start(interval_ms);
        self.event_bus.publish(&self.tenant, "hft_status", serde_json::json!({ "running": true }));
    }

    /// Stop the HFT cycle. Idempotent.
    pub async fn stop_hft(&self) {
        self.hft.stop().await;
    }

    /// Toggle the auto-trade flag (spec §4.1 `startAutoTrade`/`stopAutoTrade`
    /// — a tenant-level switch read by the research/auto-trade surface
    /// independent of whether the HFT cycle itself is running).
    pub fn set_auto_trade(&self, enabled: bool) {
        self.auto_trade_enabled.store(enabled, Ordering::SeqCst);
        info!(tenant = %self.tenant, enabled, "auto-trade flag updated");
    }

    pub fn orders(&self, filter: &OrderFilter) -> Vec<Order> {
        self.order_manager.list(&self.tenant, filter)
    }

    /// Forward an order-state update from the exchange's user-data stream to
    /// both the strategy (position bookkeeping) and the local order mirror.
    pub async fn on_order_update(&self, update: OrderUpdate) {
        self.order_manager.record_fill(&self.tenant, update.clone());
        self.hft.on_order_update(update).await;
    }

    /// Cascading shutdown (spec §4.11): stop the HFT cycle (which cancels
    /// resting orders via the strategy), flip auto-trade off, then
    /// disconnect the adapter. Idempotent — calling twice is safe since
    /// every step it calls into is itself idempotent.
    pub async fn shutdown(&self) {
        self.hft.stop().await;
        self.auto_trade_enabled.store(false, Ordering::SeqCst);
        self.adapter.disconnect().await;
        info!(tenant = %self.tenant, "user engine shut down");
    }

    pub fn datastore(&self) -> Arc<dyn DataStore> {
        self.datastore.clone()
    }
}

impl std::fmt::Debug for UserEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserEngine")
            .field("tenant", &self.tenant)
            .field("hft_running", &self.is_hft_running())
            .field("auto_trade_enabled", &self.auto_trade_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::InMemoryDataStore;
    use crate::errors::EngineResult as Res;
    use crate::exchange::{ApiKeyValidation, OrderbookCallback, UserDataCallback};
    use crate::types::{Orderbook, PlaceOrderParams, Symbol};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    struct FakeAdapter {
        disconnected: StdAtomicBool,
    }

    #[async_trait]
    impl ExchangeAdapter for FakeAdapter {
        async fn get_orderbook(&self, symbol: &Symbol, _depth: u32) -> Res<Orderbook> {
            Ok(Orderbook { symbol: symbol.clone(), bids: vec![], asks: vec![], update_seq: 0 })
        }
        async fn place_order(&self, _params: PlaceOrderParams) -> Res<Order> {
            unimplemented!()
        }
        async fn cancel_order(&self, _symbol: &Symbol, _order_id: &str) -> Res<Order> {
            unimplemented!()
        }
        async fn get_order_status(&self, _symbol: &Symbol, _order_id: &str) -> Res<Order> {
            unimplemented!()
        }
        async fn subscribe_orderbook(&self, _symbol: &Symbol, _cb: OrderbookCallback) -> Res<()> {
            unimplemented!()
        }
        async fn subscribe_user_data(&self, _cb: UserDataCallback) -> Res<()> {
            unimplemented!()
        }
        async fn validate_api_key(&self) -> Res<ApiKeyValidation> {
            unimplemented!()
        }
        async fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    fn engine() -> Arc<UserEngine> {
        UserEngine::new(
            TenantId::new("t1"),
            EngineConfig::new(Symbol::new("BTCUSDT")),
            Arc::new(FakeAdapter { disconnected: StdAtomicBool::new(false) }),
            Arc::new(ResearchEngine::new(vec![])),
            InMemoryDataStore::new(),
            EventBus::new(64),
            Arc::new(RiskManager::new(3, 15)),
            0.85,
        )
    }

    #[tokio::test]
    async fn shutdown_stops_hft_and_disconnects_adapter() {
        let engine = engine();
        engine.start_hft(50);
        assert!(engine.is_hft_running());

        engine.shutdown().await;
        assert!(!engine.is_hft_running());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let engine = engine();
        engine.shutdown().await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn auto_trade_toggle_reflects_immediately() {
        let engine = engine();
        assert!(!engine.auto_trade_enabled());
        engine.set_auto_trade(true);
        assert!(engine.auto_trade_enabled());
        engine.set_auto_trade(false);
        assert!(!engine.auto_trade_enabled());
    }
}
