// =============================================================================
// RiskManager — per-tenant pause/cooldown gate protecting capital (C4)
// =============================================================================
//
// One process-wide singleton (spec §3 Ownership) keyed by tenant. Unlike a
// simple breaker that stays tripped until manually reset, a tenant here
// self-heals: three consecutive trade failures pause trading for a fixed
// cooldown window, after which the next `can_trade` call automatically
// un-pauses (spec §4.6).
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::types::{Symbol, TenantId};

/// Per-tenant risk state (spec §3). Created lazily on first `can_trade` /
/// `record_trade_result` call for a tenant; `peak_balance` is a monotonic
/// high-water mark that survives day rollover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRiskState {
    pub daily_loss: Decimal,
    pub daily_start_balance: Decimal,
    pub peak_balance: Decimal,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub paused: bool,
    pub paused_reason: Option<String>,
    pub current_date: String,
}

impl UserRiskState {
    fn new(starting_balance: Decimal) -> Self {
        Self {
            daily_loss: Decimal::ZERO,
            daily_start_balance: starting_balance,
            peak_balance: starting_balance,
            consecutive_failures: 0,
            last_failure_time: None,
            paused: false,
            paused_reason: None,
            current_date: Utc::now().format("%Y-%m-%d").to_string(),
        }
    }
}

/// Outcome of a `can_trade` pre-trade gate check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl TradeDecision {
    fn allow() -> Self {
        Self { allowed: true, reason: None }
    }

    fn deny(reason: &str) -> Self {
        Self { allowed: false, reason: Some(reason.to_string()) }
    }
}

/// Per-tenant pause/cooldown risk gate (C4). The threshold and window come
/// from `RuntimeConfig`; the daily-loss cap, drawdown limit and single-trade
/// size cap come from that tenant's `EngineConfig` (spec §4.6).
pub struct RiskManager {
    states: RwLock<HashMap<TenantId, UserRiskState>>,
    consecutive_failures_threshold: u32,
    pause_window: Duration,
}

impl RiskManager {
    pub fn new(consecutive_failures_threshold: u32, pause_window_minutes: i64) -> Self {
        info!(consecutive_failures_threshold, pause_window_minutes, "RiskManager initialised");
        Self {
            states: RwLock::new(HashMap::new()),
            consecutive_failures_threshold,
            pause_window: Duration::minutes(pause_window_minutes),
        }
    }

    /// Snapshot of a tenant's current risk state, for dashboard display.
    pub fn get_state(&self, tenant: &TenantId) -> Option<UserRiskState> {
        self.states.read().get(tenant).cloned()
    }

    /// Pre-trade gate (spec §4.6). `balance` is the tenant's current equity,
    /// used for the drawdown check; `mid_price` and `assumed_adverse_move`
    /// feed the projected-loss check and may be omitted when unavailable
    /// (e.g. an empty orderbook), in which case only the cooldown and
    /// drawdown checks apply.
    pub fn can_trade(
        &self,
        tenant: &TenantId,
        symbol: &Symbol,
        config: &EngineConfig,
        trade_size: Decimal,
        balance: Decimal,
        mid_price: Option<Decimal>,
        assumed_adverse_move: Option<Decimal>,
    ) -> TradeDecision {
        let mut states = self.states.write();
        let state = states.entry(tenant.clone()).or_insert_with(|| UserRiskState::new(balance));
        self.maybe_roll_day(state, balance);

        if trade_size > config.max_trade_size {
            debug!(tenant = %tenant, symbol = %symbol, %trade_size, "trade blocked: exceeds single-trade size cap");
            return TradeDecision::deny("trade_size_cap");
        }

        if state.paused {
            let elapsed_ok = state
                .last_failure_time
                .map(|t| Utc::now() - t >= self.pause_window)
                .unwrap_or(true);
            if !elapsed_ok {
                return TradeDecision::deny("paused_by_risk");
            }
            // Cooldown window elapsed — un-pause and fall through to the
            // remaining checks (spec §4.6 canTrade step 2).
            info!(tenant = %tenant, "risk pause window elapsed, resuming trading");
            state.paused = false;
            state.paused_reason = None;
        }

        if let (Some(mid), Some(adverse)) = (mid_price, assumed_adverse_move) {
            let projected_loss = state.daily_loss + trade_size * mid * adverse;
            if projected_loss > config.daily_loss_cap {
                warn!(tenant = %tenant, symbol = %symbol, %projected_loss, cap = %config.daily_loss_cap, "trade blocked: daily loss cap");
                return TradeDecision::deny("daily_loss_cap");
            }
        }

        if state.peak_balance > Decimal::ZERO {
            let drawdown = (state.peak_balance - balance) / state.peak_balance;
            if drawdown > config.max_drawdown_pct {
                warn!(tenant = %tenant, symbol = %symbol, %drawdown, "trade blocked: drawdown limit");
                return TradeDecision::deny("drawdown");
            }
        }

        TradeDecision::allow()
    }

    /// Update a tenant's risk state after a trade attempt settles (spec
    /// §4.6). `pnl` may be negative; `success` distinguishes an exchange
    /// rejection/error from a normal fill regardless of its PnL sign.
    pub fn record_trade_result(&self, tenant: &TenantId, pnl: Decimal, balance: Decimal, success: bool) {
        let mut states = self.states.write();
        let state = states.entry(tenant.clone()).or_insert_with(|| UserRiskState::new(balance));
        self.maybe_roll_day(state, balance);

        if pnl < Decimal::ZERO {
            state.daily_loss -= pnl;
        }
        if balance > state.peak_balance {
            state.peak_balance = balance;
        }

        if success {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
            state.last_failure_time = Some(Utc::now());
            if state.consecutive_failures >= self.consecutive_failures_threshold {
                state.paused = true;
                state.paused_reason = Some("consecutive_failures".to_string());
                warn!(tenant = %tenant, failures = state.consecutive_failures, "risk pause triggered: consecutive failures");
            }
        }

        debug!(
            tenant = %tenant,
            %pnl,
            success,
            daily_loss = %state.daily_loss,
            consecutive_failures = state.consecutive_failures,
            paused = state.paused,
            "trade result recorded"
        );
    }

    /// Roll `dailyLoss`/`dailyStartBalance` exactly once per UTC day
    /// (spec §4.6, P8). `peakBalance` is left untouched — it is a monotonic
    /// high-water mark, not a daily statistic.
    fn maybe_roll_day(&self, state: &mut UserRiskState, balance: Decimal) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if state.current_date == today {
            return;
        }
        info!(old_date = %state.current_date, new_date = %today, "UTC day rolled over, resetting daily risk counters");
        state.daily_loss = Decimal::ZERO;
        state.daily_start_balance = balance;
        state.current_date = today;
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("consecutive_failures_threshold", &self.consecutive_failures_threshold)
            .field("pause_window", &self.pause_window)
            .field("tenants", &self.states.read().len())
            .finish()
    }
}
