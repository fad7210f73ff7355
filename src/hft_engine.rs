// =============================================================================
// HFTEngine — per-tenant tick scheduler (C8, spec §4.2)
// =============================================================================
//
// Grounded on the teacher's strategy-loop scheduling in `main.rs` (a
// `tokio::time::interval` ticking a fixed-cadence evaluation) and its
// reconciliation loop's auto-stop-on-repeated-error behavior, generalized
// from one global symbol loop to a per-tenant, per-symbol cycle owning its
// own interval, trade counter and error budget.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::datastore::{DataStore, ResearchLogEntry};
use crate::errors::{EngineError, EngineResult};
use crate::event_bus::EventBus;
use crate::exchange::ExchangeAdapter;
use crate::research::ResearchEngine;
use crate::risk::RiskManager;
use crate::strategy::StrategyHandler;
use crate::types::{OrderUpdate, TenantId};

const MAX_CONSECUTIVE_INTERNAL_ERRORS: u32 = 3;

/// The daily trade counter and the date it applies to. Reset exactly once
/// per UTC day, same rollover idiom as `risk::UserRiskState` (spec §4.2,
/// §4.6 — the two counters roll over independently but on the same rule).
struct DayCounter {
    date: String,
    trades_today: u32,
}

impl DayCounter {
    fn new() -> Self {
        Self { date: Utc::now().format("%Y-%m-%d").to_string(), trades_today: 0 }
    }

    fn roll_if_needed(&mut self) -> bool {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if self.date == today {
            return false;
        }
        self.date = today;
        self.trades_today = 0;
        true
    }
}

/// Per-tenant, per-symbol HFT cycle scheduler (C8, spec §4.2). Owns no
/// exchange connection of its own — it drives `ExchangeAdapter` +
/// `StrategyHandler` it's handed at construction, so `UserEngine` remains
/// the sole owner of tenant credentials.
pub struct HFTEngine {
    tenant: TenantId,
    config: RwLock<EngineConfig>,
    adapter: Arc<dyn ExchangeAdapter>,
    research: Arc<ResearchEngine>,
    strategy: Arc<dyn StrategyHandler>,
    event_bus: Arc<EventBus>,
    datastore: Arc<dyn DataStore>,
    risk: Arc<RiskManager>,
    min_accuracy_threshold: f64,

    /// Shared with `UserEngine`; toggled by `POST /api/auto-trade/toggle`
    /// (spec §4.2 step 1: "If `autoTrade=false` ... skip").
    auto_trade: Arc<AtomicBool>,

    /// Non-reentrant tick guard (spec §5): a tick that finds this locked
    /// drops itself rather than queuing behind the running one.
    cycle_lock: Mutex<()>,
    day_counter: Mutex<DayCounter>,
    consecutive_internal_errors: AtomicU32,
    daily_cap_logged_today: AtomicBool,
    risk_denied_logged: AtomicBool,

    running: AtomicBool,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl HFTEngine {
    pub fn new(
        tenant: TenantId,
        config: EngineConfig,
        adapter: Arc<dyn ExchangeAdapter>,
        research: Arc<ResearchEngine>,
        strategy: Arc<dyn StrategyHandler>,
        event_bus: Arc<EventBus>,
        datastore: Arc<dyn DataStore>,
        risk: Arc<RiskManager>,
        min_accuracy_threshold: f64,
        auto_trade: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tenant,
            config: RwLock::new(config),
            adapter,
            research,
            strategy,
            event_bus,
            datastore,
            risk,
            min_accuracy_threshold,
            auto_trade,
            cycle_lock: Mutex::new(()),
            day_counter: Mutex::new(DayCounter::new()),
            consecutive_internal_errors: AtomicU32::new(0),
            daily_cap_logged_today: AtomicBool::new(false),
            risk_denied_logged: AtomicBool::new(false),
            running: AtomicBool::new(false),
            scheduler: Mutex::new(None),
        })
    }

    pub fn set_config(&self, config: EngineConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Forward a fill/status update to the strategy (spec §4.2 "on order
    /// update" arrow). Called by `UserEngine`'s user-data stream callback.
    pub async fn on_order_update(&self, update: OrderUpdate) {
        self.strategy.on_order_update(&update).await;
    }

    /// Start the tick scheduler at `interval_ms`. A second `start` while
    /// already running is a no-op (P10-adjacent idempotency, mirrored from
    /// `stop`).
    pub fn start(self: &Arc<Self>, interval_ms: u64) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(tenant = %self.tenant, interval_ms, "HFT engine starting");

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1)));
            loop {
                ticker.tick().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.run_tick().await;
            }
        });

        // Replacing a completed handle from a prior stop()/start() round
        // trip is fine; `scheduler` is only ever read by `stop`.
        if let Ok(mut slot) = self.scheduler.try_lock() {
            *slot = Some(handle);
        }
    }

    /// Stop the scheduler and clear pending quotes. Idempotent (P10): a
    /// second call while already stopped returns immediately. Bounded by
    /// roughly `2 * interval + adapter RTT` since it waits for any
    /// in-flight tick to release the cycle lock before tearing down
    /// strategy state.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(tenant = %self.tenant, "HFT engine stopping");

        if let Some(handle) = self.scheduler.lock().await.take() {
            handle.abort();
        }

        // Wait out any tick currently mutating strategy state before
        // canceling resting orders, so shutdown doesn't race a fresh quote
        // the in-flight tick is about to place.
        let _guard = self.cycle_lock.lock().await;
        self.strategy.shutdown().await;
    }

    async fn run_tick(&self) {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            // Previous tick still running — drop this one (spec §5
            // non-reentrancy tie-break).
            return;
        };

        match self.run_tick_inner().await {
            Ok(()) => {
                self.consecutive_internal_errors.store(0, Ordering::SeqCst);
            }
            Err(e) => {
                let count = self.consecutive_internal_errors.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(tenant = %self.tenant, error = %e, consecutive_errors = count, "HFT cycle failed");
                if count >= MAX_CONSECUTIVE_INTERNAL_ERRORS {
                    error!(tenant = %self.tenant, "auto-stopping after repeated cycle failures");
                    self.event_bus.publish(&self.tenant, "hft_error", json!({ "reason": "auto_stop_consecutive_errors" }));
                    // stop() re-acquires cycle_lock; this task already
                    // holds it, so run the rest of the teardown directly
                    // rather than deadlocking on a nested stop().
                    self.running.store(false, Ordering::SeqCst);
                    if let Some(handle) = self.scheduler.lock().await.take() {
                        handle.abort();
                    }
                    self.strategy.shutdown().await;
                }
            }
        }
    }

    async fn run_tick_inner(&self) -> EngineResult<()> {
        // §4.2 step 1: autoTrade=false skips the cycle outright, same as a
        // disabled config — `running` itself is enforced by the scheduler
        // loop in `start`, which stops ticking once `stop()` flips it.
        if !self.auto_trade.load(Ordering::SeqCst) {
            return Ok(());
        }

        let config = self.config.read().clone();
        if !config.enabled {
            return Ok(());
        }

        let orderbook = self.adapter.get_orderbook(&config.symbol, 20).await?;
        if orderbook.bids.is_empty() || orderbook.asks.is_empty() {
            // §4.2 tie-break policy: no mid-price, abort the cycle before
            // research/journal/risk run at all.
            return Ok(());
        }

        let result = self.research.run(&config.symbol, &orderbook).await;

        self.datastore
            .save_research_log(ResearchLogEntry {
                tenant: self.tenant.clone(),
                symbol: config.symbol.clone(),
                signal: result.signal.to_string(),
                accuracy: result.accuracy,
                imbalance: result.imbalance,
                at: Utc::now(),
            })
            .await;

        let mut day_counter = self.day_counter.lock().await;
        if day_counter.roll_if_needed() {
            self.daily_cap_logged_today.store(false, Ordering::SeqCst);
        }

        let cap_reached = day_counter.trades_today >= config.max_trades_per_day;
        if cap_reached && !self.daily_cap_logged_today.swap(true, Ordering::SeqCst) {
            warn!(tenant = %self.tenant, symbol = %config.symbol, "daily trade cap reached");
            self.event_bus.publish(&self.tenant, "hft_error", json!({ "reason": "daily_trade_cap_reached" }));
        }

        // §4.2 step 6: the risk gate runs even when the orderbook has no mid
        // (e.g. one side empty) — `can_trade` just skips the projected-loss
        // check in that case and still enforces the trade-size/cooldown/
        // drawdown checks.
        let risk_decision = self.risk.can_trade(
            &self.tenant,
            &config.symbol,
            &config,
            config.quote_size,
            self.strategy.balance(),
            orderbook.mid(),
            Some(config.adverse_pct),
        );
        if risk_decision.allowed {
            self.risk_denied_logged.store(false, Ordering::SeqCst);
        } else if !self.risk_denied_logged.swap(true, Ordering::SeqCst) {
            warn!(tenant = %self.tenant, reason = ?risk_decision.reason, "trading denied by risk manager");
            self.event_bus.publish(&self.tenant, "hft_error", json!({ "reason": risk_decision.reason }));
        }

        let allow_new_orders = !cap_reached && risk_decision.allowed && result.accuracy >= self.min_accuracy_threshold;

        let placed = self
            .strategy
            .on_research(&result, &orderbook, allow_new_orders)
            .await
            .map_err(|e| EngineError::Internal(format!("strategy cycle failed: {e}")))?;

        if placed {
            day_counter.trades_today += 1;
        }

        Ok(())
    }
}

impl std::fmt::Debug for HFTEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HFTEngine")
            .field("tenant", &self.tenant)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::InMemoryDataStore;
    use crate::errors::ExchangeErrorKind;
    use crate::exchange::{ApiKeyValidation, OrderbookCallback, UserDataCallback};
    use crate::types::{Order, Orderbook, OrderbookLevel, Symbol};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    struct FlakyAdapter {
        calls: AtomicUsize,
        fail_first_n: usize,
    }

    #[async_trait]
    impl ExchangeAdapter for FlakyAdapter {
        async fn get_orderbook(&self, symbol: &Symbol, _depth: u32) -> EngineResult<Orderbook> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                return Err(EngineError::exchange(ExchangeErrorKind::ServerError, Some(500), "boom"));
            }
            Ok(Orderbook {
                symbol: symbol.clone(),
                bids: vec![OrderbookLevel { price: dec!(100), quantity: dec!(5) }],
                asks: vec![OrderbookLevel { price: dec!(100.1), quantity: dec!(5) }],
                update_seq: n as u64,
            })
        }
        async fn place_order(&self, _params: crate::types::PlaceOrderParams) -> EngineResult<Order> {
            unimplemented!()
        }
        async fn cancel_order(&self, _symbol: &Symbol, _order_id: &str) -> EngineResult<Order> {
            unimplemented!()
        }
        async fn get_order_status(&self, _symbol: &Symbol, _order_id: &str) -> EngineResult<Order> {
            unimplemented!()
        }
        async fn subscribe_orderbook(&self, _symbol: &Symbol, _cb: OrderbookCallback) -> EngineResult<()> {
            unimplemented!()
        }
        async fn subscribe_user_data(&self, _cb: UserDataCallback) -> EngineResult<()> {
            unimplemented!()
        }
        async fn validate_api_key(&self) -> EngineResult<ApiKeyValidation> {
            unimplemented!()
        }
        async fn disconnect(&self) {}
    }

    struct NoopStrategy;

    #[async_trait]
    impl StrategyHandler for NoopStrategy {
        async fn on_research(&self, _result: &crate::research::ResearchResult, _orderbook: &Orderbook, _allow_new_orders: bool) -> EngineResult<bool> {
            Ok(false)
        }
        async fn on_order_update(&self, _update: &OrderUpdate) {}
        async fn shutdown(&self) {}
        fn inventory(&self) -> rust_decimal::Decimal {
            rust_decimal::Decimal::ZERO
        }
        fn balance(&self) -> rust_decimal::Decimal {
            dec!(10000)
        }
    }

    fn engine(adapter: Arc<FlakyAdapter>) -> Arc<HFTEngine> {
        HFTEngine::new(
            TenantId::new("t1"),
            EngineConfig::new(Symbol::new("BTCUSDT")),
            adapter,
            Arc::new(ResearchEngine::new(vec![])),
            Arc::new(NoopStrategy),
            EventBus::new(64),
            InMemoryDataStore::new(),
            Arc::new(crate::risk::RiskManager::new(3, 15)),
            0.85,
            Arc::new(AtomicBool::new(true)),
        )
    }

    #[tokio::test]
    async fn auto_stops_after_three_consecutive_internal_errors() {
        let adapter = Arc::new(FlakyAdapter { calls: AtomicUsize::new(0), fail_first_n: 100 });
        let engine = engine(adapter);
        engine.running.store(true, Ordering::SeqCst);

        for _ in 0..3 {
            engine.run_tick().await;
        }

        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn success_resets_consecutive_error_counter() {
        let adapter = Arc::new(FlakyAdapter { calls: AtomicUsize::new(0), fail_first_n: 2 });
        let engine = engine(adapter);
        engine.running.store(true, Ordering::SeqCst);

        engine.run_tick().await;
        engine.run_tick().await;
        assert_eq!(engine.consecutive_internal_errors.load(Ordering::SeqCst), 2);

        engine.run_tick().await; // succeeds now
        assert_eq!(engine.consecutive_internal_errors.load(Ordering::SeqCst), 0);
        assert!(engine.is_running());
    }

    struct RecordingStrategy {
        seen_allow_new_orders: std::sync::Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl StrategyHandler for RecordingStrategy {
        async fn on_research(&self, _result: &crate::research::ResearchResult, _orderbook: &Orderbook, allow_new_orders: bool) -> EngineResult<bool> {
            self.seen_allow_new_orders.lock().unwrap().push(allow_new_orders);
            Ok(false)
        }
        async fn on_order_update(&self, _update: &OrderUpdate) {}
        async fn shutdown(&self) {}
        fn inventory(&self) -> rust_decimal::Decimal {
            rust_decimal::Decimal::ZERO
        }
        fn balance(&self) -> rust_decimal::Decimal {
            dec!(10000)
        }
    }

    // Scenario E: three consecutive failed trades pause the risk gate, and
    // the next cycle is denied new orders even though research accuracy and
    // the daily cap both allow it.
    #[tokio::test]
    async fn risk_pause_suppresses_new_orders_without_failing_the_cycle() {
        let adapter = Arc::new(FlakyAdapter { calls: AtomicUsize::new(0), fail_first_n: 0 });
        let risk = Arc::new(crate::risk::RiskManager::new(3, 15));
        let tenant = TenantId::new("t1");
        for _ in 0..3 {
            risk.record_trade_result(&tenant, dec!(-1), dec!(9990), false);
        }

        let strategy = Arc::new(RecordingStrategy { seen_allow_new_orders: std::sync::Mutex::new(Vec::new()) });
        let engine = HFTEngine::new(
            tenant,
            EngineConfig::new(Symbol::new("BTCUSDT")),
            adapter,
            Arc::new(ResearchEngine::new(vec![])),
            strategy.clone(),
            EventBus::new(64),
            InMemoryDataStore::new(),
            risk,
            0.85,
            Arc::new(AtomicBool::new(true)),
        );
        engine.running.store(true, Ordering::SeqCst);
        engine.run_tick().await;

        assert_eq!(strategy.seen_allow_new_orders.lock().unwrap().as_slice(), &[false]);
        assert!(engine.is_running());
    }

    // spec §4.2 step 1: autoTrade=false skips the cycle before the strategy
    // is ever consulted.
    #[tokio::test]
    async fn auto_trade_disabled_skips_cycle_entirely() {
        let adapter = Arc::new(FlakyAdapter { calls: AtomicUsize::new(0), fail_first_n: 0 });
        let strategy = Arc::new(RecordingStrategy { seen_allow_new_orders: std::sync::Mutex::new(Vec::new()) });
        let auto_trade = Arc::new(AtomicBool::new(false));
        let engine = HFTEngine::new(
            TenantId::new("t1"),
            EngineConfig::new(Symbol::new("BTCUSDT")),
            adapter.clone(),
            Arc::new(ResearchEngine::new(vec![])),
            strategy.clone(),
            EventBus::new(64),
            InMemoryDataStore::new(),
            Arc::new(crate::risk::RiskManager::new(3, 15)),
            0.85,
            auto_trade.clone(),
        );
        engine.running.store(true, Ordering::SeqCst);
        engine.run_tick().await;

        assert!(strategy.seen_allow_new_orders.lock().unwrap().is_empty());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);

        auto_trade.store(true, Ordering::SeqCst);
        engine.run_tick().await;
        assert_eq!(strategy.seen_allow_new_orders.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let adapter = Arc::new(FlakyAdapter { calls: AtomicUsize::new(0), fail_first_n: 0 });
        let engine = engine(adapter);
        engine.start(50);
        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running());
    }
}
