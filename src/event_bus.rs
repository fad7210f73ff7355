// =============================================================================
// EventBus — per-tenant + admin event fan-out (C11, spec §4.10)
// =============================================================================
//
// Built on `tokio::sync::broadcast` rather than the teacher's dashboard
// polling-diff loop (`app_state::AppState` recomputing a `StateSnapshot`
// every 500ms): a push channel is the natural idiom once there can be many
// tenants, each with their own subscriber set, and it gives backpressure
// handling "for free" — a receiver that falls behind the channel capacity
// gets `RecvError::Lagged` instead of the bus ever blocking a publisher.
// Every tenant event is also re-published on the admin channel so a single
// admin socket sees the whole fleet (spec §4.10).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::TenantId;

/// One event delivered to a WebSocket subscriber. `tenant` is `None` only
/// for events synthesized directly on the admin channel (currently unused —
/// reserved for process-wide announcements).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub tenant: Option<TenantId>,
    pub kind: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Process-wide singleton fan-out (spec §3 Ownership). One broadcast channel
/// per tenant, created lazily on first `publish`/`subscribe_user`, plus one
/// admin channel that mirrors every tenant event.
pub struct EventBus {
    capacity: usize,
    tenants: RwLock<HashMap<TenantId, broadcast::Sender<EngineEvent>>>,
    admin: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (admin, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { capacity: capacity.max(1), tenants: RwLock::new(HashMap::new()), admin })
    }

    fn tenant_sender(&self, tenant: &TenantId) -> broadcast::Sender<EngineEvent> {
        if let Some(tx) = self.tenants.read().get(tenant) {
            return tx.clone();
        }
        self.tenants
            .write()
            .entry(tenant.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish one event to `tenant`'s channel and mirror it onto the admin
    /// channel. A "no subscribers" send error is expected and silent — it
    /// just means nobody is watching right now (spec §4.10).
    pub fn publish(&self, tenant: &TenantId, kind: impl Into<String>, payload: Value) {
        let event = EngineEvent { tenant: Some(tenant.clone()), kind: kind.into(), payload, at: Utc::now() };

        let tx = self.tenant_sender(tenant);
        if tx.send(event.clone()).is_err() {
            debug!(tenant = %tenant, "no subscribers on tenant channel");
        }
        if self.admin.send(event).is_err() {
            debug!("no subscribers on admin channel");
        }
    }

    /// Subscribe to one tenant's event stream (the `/ws` endpoint, spec
    /// §4.10). A receiver that falls more than `capacity` events behind
    /// observes `RecvError::Lagged` on its next `recv` — callers should
    /// treat that as eviction, not retry in place.
    pub fn subscribe_user(&self, tenant: &TenantId) -> broadcast::Receiver<EngineEvent> {
        self.tenant_sender(tenant).subscribe()
    }

    /// Subscribe to every tenant's events (the `/ws/admin` endpoint).
    pub fn subscribe_admin(&self) -> broadcast::Receiver<EngineEvent> {
        self.admin.subscribe()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("capacity", &self.capacity).field("tenants", &self.tenants.read().len()).finish()
    }
}
