// =============================================================================
// EngineManager — process-wide tenant registry (C10, spec §4.1)
// =============================================================================
//
// Grounded on the teacher's single global `AppState` (one instance for the
// whole process), generalized to a registry keyed by tenant. The lock
// discipline follows spec §5 exactly: the registry lock (`tenants`) is held
// only long enough to look up or insert an `Arc<UserEngine>`; every
// subsequent operation runs against that `Arc` with the registry lock
// already released, so a slow per-tenant call (adapter round-trip, shutdown)
// never blocks unrelated tenants from being looked up or created.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::config::EngineConfig;
use crate::datastore::DataStore;
use crate::errors::{EngineError, EngineResult};
use crate::event_bus::EventBus;
use crate::exchange::ExchangeAdapter;
use crate::research::ResearchEngine;
use crate::risk::RiskManager;
use crate::types::TenantId;
use crate::user_engine::UserEngine;

/// Builds a tenant's `ExchangeAdapter` from its decrypted credentials.
/// Injected so `EngineManager` never hard-codes a single venue (spec §4.7 —
/// a second venue is a pure addition, not a refactor of this type).
pub trait AdapterFactory: Send + Sync {
    fn build(&self, api_key: &str, api_secret: &str, testnet: bool) -> Arc<dyn ExchangeAdapter>;
}

/// Process-wide tenant registry (C10, spec §3 Ownership, §4.1). The sole
/// entry point for creating, looking up, and tearing down per-tenant
/// engines; every HTTP/WS handler goes through this.
pub struct EngineManager {
    tenants: RwLock<HashMap<TenantId, Arc<UserEngine>>>,
    research: Arc<ResearchEngine>,
    datastore: Arc<dyn DataStore>,
    event_bus: Arc<EventBus>,
    adapter_factory: Arc<dyn AdapterFactory>,
    risk: Arc<RiskManager>,
    min_accuracy_threshold: f64,
    default_interval_ms: u64,
}

impl EngineManager {
    pub fn new(
        research: Arc<ResearchEngine>,
        datastore: Arc<dyn DataStore>,
        event_bus: Arc<EventBus>,
        adapter_factory: Arc<dyn AdapterFactory>,
        risk: Arc<RiskManager>,
        min_accuracy_threshold: f64,
        default_interval_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            tenants: RwLock::new(HashMap::new()),
            research,
            datastore,
            event_bus,
            adapter_factory,
            risk,
            min_accuracy_threshold,
            default_interval_ms,
        })
    }

    /// Create a tenant's engine from decrypted credentials (spec §4.1).
    /// Rejects a duplicate tenant unless `reinit=true`, in which case the
    /// existing engine is shut down first and replaced.
    pub async fn create_engine(
        &self,
        tenant: TenantId,
        config: EngineConfig,
        api_key: &str,
        api_secret: &str,
        testnet: bool,
        reinit: bool,
    ) -> EngineResult<Arc<UserEngine>> {
        config.validate()?;

        let existing = self.tenants.read().get(&tenant).cloned();
        if let Some(old) = existing {
            if !reinit {
                return Err(EngineError::AlreadyExists(tenant));
            }
            old.shutdown().await;
        }

        let adapter = self.adapter_factory.build(api_key, api_secret, testnet);
        let engine = UserEngine::new(
            tenant.clone(),
            config,
            adapter,
            self.research.clone(),
            self.datastore.clone(),
            self.event_bus.clone(),
            self.risk.clone(),
            self.min_accuracy_threshold,
        );

        let mut tenants = self.tenants.write();
        if tenants.contains_key(&tenant) && !reinit {
            // Lost a race with a concurrent create_engine for the same
            // tenant between the checks above and this write lock.
            return Err(EngineError::AlreadyExists(tenant));
        }
        tenants.insert(tenant.clone(), engine.clone());
        info!(tenant = %tenant, reinit, "engine created");
        Ok(engine)
    }

    pub fn get_engine(&self, tenant: &TenantId) -> EngineResult<Arc<UserEngine>> {
        self.tenants.read().get(tenant).cloned().ok_or_else(|| EngineError::NotFound(tenant.clone()))
    }

    pub fn list_tenants(&self) -> Vec<TenantId> {
        self.tenants.read().keys().cloned().collect()
    }

    pub fn default_interval_ms(&self) -> u64 {
        self.default_interval_ms
    }

    /// The process-wide `RiskManager`, for a dashboard surface showing a
    /// tenant's pause/cooldown state alongside its engine status.
    pub fn risk(&self) -> Arc<RiskManager> {
        self.risk.clone()
    }

    /// The process-wide `ResearchEngine`, for an ad-hoc research endpoint
    /// (spec §6 `/api/research/run`) that runs outside a tenant's HFT cycle.
    pub fn research(&self) -> Arc<ResearchEngine> {
        self.research.clone()
    }

    /// The process-wide `EventBus`, for the WebSocket control surface.
    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    /// Start a tenant's HFT cycle (spec §4.1). `interval_ms` defaults to the
    /// process-wide `RuntimeConfig::default_interval_ms` when `None`.
    pub fn start_hft(&self, tenant: &TenantId, interval_ms: Option<u64>) -> EngineResult<()> {
        let engine = self.get_engine(tenant)?;
        engine.start_hft(interval_ms.unwrap_or(self.default_interval_ms));
        Ok(())
    }

    pub async fn stop_hft(&self, tenant: &TenantId) -> EngineResult<()> {
        let engine = self.get_engine(tenant)?;
        engine.stop_hft().await;
        Ok(())
    }

    pub fn start_auto_trade(&self, tenant: &TenantId) -> EngineResult<()> {
        self.get_engine(tenant)?.set_auto_trade(true);
        Ok(())
    }

    pub fn stop_auto_trade(&self, tenant: &TenantId) -> EngineResult<()> {
        self.get_engine(tenant)?.set_auto_trade(false);
        Ok(())
    }

    /// Update a tenant's live `EngineConfig` (spec §6 `/api/engine/config`).
    pub fn update_config(&self, tenant: &TenantId, config: EngineConfig) -> EngineResult<()> {
        config.validate()?;
        self.get_engine(tenant)?.set_config(config);
        Ok(())
    }

    /// Tear down and remove a tenant's engine entirely. Looking the tenant
    /// up and removing it from the registry happens under the registry
    /// lock; the actual `shutdown().await` — which may block on an
    /// in-flight HFT tick — runs after the lock is released so it never
    /// blocks other tenants' registry lookups.
    pub async fn shutdown(&self, tenant: &TenantId) -> EngineResult<()> {
        let engine = self.tenants.write().remove(tenant).ok_or_else(|| EngineError::NotFound(tenant.clone()))?;
        engine.shutdown().await;
        info!(tenant = %tenant, "engine removed from registry");
        Ok(())
    }

    /// Tear down every tenant, e.g. on process shutdown. Engines are
    /// collected under the registry lock and shut down after releasing it,
    /// same reasoning as single-tenant `shutdown`.
    pub async fn shutdown_all(&self) {
        let engines: Vec<Arc<UserEngine>> = self.tenants.write().drain().map(|(_, e)| e).collect();
        for engine in engines {
            engine.shutdown().await;
        }
    }
}

impl std::fmt::Debug for EngineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineManager").field("tenants", &self.tenants.read().len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::InMemoryDataStore;
    use crate::errors::EngineResult as Res;
    use crate::exchange::{ApiKeyValidation, OrderbookCallback, UserDataCallback};
    use crate::types::{Order, Orderbook, PlaceOrderParams, Symbol};
    use async_trait::async_trait;

    struct FakeAdapter;

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
        async fn disconnect(&self) {}
    }

    struct FakeAdapterFactory;

    impl AdapterFactory for FakeAdapterFactory {
        fn build(&self, _api_key: &str, _api_secret: &str, _testnet: bool) -> Arc<dyn ExchangeAdapter> {
            Arc::new(FakeAdapter)
        }
    }

    fn manager() -> Arc<EngineManager> {
        EngineManager::new(
            Arc::new(ResearchEngine::new(vec![])),
            InMemoryDataStore::new(),
            EventBus::new(64),
            Arc::new(FakeAdapterFactory),
            Arc::new(RiskManager::new(3, 15)),
            0.85,
            100,
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let mgr = manager();
        let tenant = TenantId::new("t1");
        mgr.create_engine(tenant.clone(), EngineConfig::new(Symbol::new("BTCUSDT")), "key", "secret", true, false).await.unwrap();
        assert!(mgr.get_engine(&tenant).is_ok());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let mgr = manager();
        let tenant = TenantId::new("t1");
        mgr.create_engine(tenant.clone(), EngineConfig::new(Symbol::new("BTCUSDT")), "key", "secret", true, false).await.unwrap();
        let result = mgr.create_engine(tenant, EngineConfig::new(Symbol::new("BTCUSDT")), "key", "secret", true, false).await;
        assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn reinit_replaces_existing_engine() {
        let mgr = manager();
        let tenant = TenantId::new("t1");
        let first = mgr.create_engine(tenant.clone(), EngineConfig::new(Symbol::new("BTCUSDT")), "key", "secret", true, false).await.unwrap();
        let second = mgr.create_engine(tenant.clone(), EngineConfig::new(Symbol::new("ETHUSDT")), "key2", "secret2", true, true).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(mgr.get_engine(&tenant).is_ok());
    }

    #[test]
    fn get_unknown_tenant_not_found() {
        let mgr = manager();
        assert!(matches!(mgr.get_engine(&TenantId::new("ghost")), Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn shutdown_removes_tenant_from_registry() {
        let mgr = manager();
        let tenant = TenantId::new("t1");
        mgr.create_engine(tenant.clone(), EngineConfig::new(Symbol::new("BTCUSDT")), "key", "secret", true, false).await.unwrap();
        mgr.shutdown(&tenant).await.unwrap();
        assert!(mgr.get_engine(&tenant).is_err());
    }

    #[tokio::test]
    async fn invalid_config_rejected_before_registration() {
        let mgr = manager();
        let mut cfg = EngineConfig::new(Symbol::new("BTCUSDT"));
        cfg.max_trades_per_day = 0;
        let result = mgr.create_engine(TenantId::new("t1"), cfg, "key", "secret", true, false).await;
        assert!(result.is_err());
        assert!(mgr.get_engine(&TenantId::new("t1")).is_err());
    }
}
