// =============================================================================
// Main Entry Point — process wiring for the multi-tenant HFT core
// =============================================================================
//
// Starts with no tenants registered; each is created lazily via
// `POST /api/engine/config` (spec §4.1). The process owns exactly the
// singletons spec §3 calls out: one `EngineManager`, one `RiskManager`, one
// `EventBus`, one `DataStore`, one `KeyVault`.
// =============================================================================

mod api;
mod binance;
mod config;
mod datastore;
mod engine_manager;
mod errors;
mod event_bus;
mod exchange;
mod hft_engine;
mod order_manager;
mod research;
mod risk;
mod strategy;
mod types;
mod user_engine;
mod vault;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::BinanceAdapter;
use crate::config::RuntimeConfig;
use crate::datastore::InMemoryDataStore;
use crate::engine_manager::{AdapterFactory, EngineManager};
use crate::event_bus::EventBus;
use crate::exchange::ExchangeAdapter;
use crate::research::ResearchEngine;
use crate::risk::RiskManager;
use crate::vault::KeyVault;

/// Builds a `BinanceAdapter` per tenant, decrypting credentials through the
/// process `KeyVault` first (spec §4.1 `createEngine`: "decrypts via
/// KeyVault if inputs are ciphertext"). A caller that already sent plaintext
/// credentials is unaffected — `KeyVault::decrypt` returns an empty string
/// on anything that isn't its own ciphertext format, so the raw input is
/// used as a fallback rather than discarded.
struct BinanceAdapterFactory {
    vault: Arc<KeyVault>,
}

impl BinanceAdapterFactory {
    fn resolve(&self, raw: &str) -> String {
        let decrypted = self.vault.decrypt(raw);
        if decrypted.is_empty() {
            raw.to_string()
        } else {
            decrypted
        }
    }
}

impl AdapterFactory for BinanceAdapterFactory {
    fn build(&self, api_key: &str, api_secret: &str, testnet: bool) -> Arc<dyn ExchangeAdapter> {
        Arc::new(BinanceAdapter::new(self.resolve(api_key), self.resolve(api_secret), testnet))
    }
}

/// Derive the vault's 32-byte key from `VAULT_KEY` (expected as 64 hex
/// characters). Missing or malformed input falls back to a fixed all-zero
/// key with a loud warning — acceptable for a local/demo run, never for a
/// deployment handling real credentials.
fn load_vault_key() -> [u8; 32] {
    match std::env::var("VAULT_KEY") {
        Ok(hex_key) => match hex::decode(hex_key.trim()) {
            Ok(bytes) if bytes.len() == 32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                key
            }
            _ => {
                warn!("VAULT_KEY is not 32 bytes of hex — using an insecure default key");
                [0u8; 32]
            }
        },
        Err(_) => {
            warn!("VAULT_KEY not set — using an insecure default key; do not run this way in production");
            [0u8; 32]
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("starting up");

    let runtime_config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    let datastore = InMemoryDataStore::new();
    let event_bus = EventBus::new(runtime_config.ws_backlog);
    let research = Arc::new(ResearchEngine::new(vec![]));
    let risk = Arc::new(RiskManager::new(runtime_config.risk_consecutive_failures_threshold, runtime_config.risk_pause_window_minutes));
    let vault = Arc::new(KeyVault::new(&load_vault_key()));
    let adapter_factory = Arc::new(BinanceAdapterFactory { vault });

    let manager = EngineManager::new(
        research,
        datastore,
        event_bus,
        adapter_factory,
        risk,
        runtime_config.min_accuracy_threshold,
        runtime_config.default_interval_ms,
    );

    let bind_addr = runtime_config.bind_addr.clone();
    let app = api::rest::router(manager.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind API server");
    info!(addr = %bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "API server failed");
        }
    });

    info!("all subsystems running, press ctrl+c to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    server.abort();
    manager.shutdown_all().await;

    if let Err(e) = runtime_config.save("runtime_config.json") {
        tracing::error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("shut down complete");
    Ok(())
}
