// =============================================================================
// ResearchEngine — orderbook micro-signals + dynamic-threshold scoring (C6)
// =============================================================================
//
// Percentile/median thresholds and additive accuracy scoring are pure,
// synchronous functions over bounded per-symbol history (grounded on the
// teacher's `market_data::orderbook::OrderBookManager` imbalance formula and
// ring-buffer style). External feature lookups (sentiment, on-chain flow,
// multi-day trend) are modeled as an async `FeatureProvider` trait, following
// the teacher's `futures_intel` module's "best-effort signal, never aborts"
// idiom.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Orderbook, Symbol};

const ORDERBOOK_HISTORY_CAP: usize = 50;
const SERIES_HISTORY_CAP: usize = 200;
const VOLATILITY_WINDOW: usize = 20;
const FEATURE_PROVIDER_TIMEOUT: Duration = Duration::from_secs(3);

/// External best-effort signal source (sentiment, on-chain flow, multi-day
/// trend — spec §4.5, §9). A failure or timeout contributes zero and never
/// aborts the research cycle.
#[async_trait]
pub trait FeatureProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self, symbol: &Symbol) -> Option<f64>;
}

/// Trading signal produced by `ResearchEngine::run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Buy => write!(f, "BUY"),
            Signal::Sell => write!(f, "SELL"),
            Signal::Hold => write!(f, "HOLD"),
        }
    }
}

/// The micro-signal set computed from one orderbook snapshot (spec §4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MicroSignals {
    pub imbalance: f64,
    pub spread_pct: f64,
    pub depth: f64,
    pub volume: f64,
    pub price_momentum: f64,
    pub volatility: f64,
}

/// Full output of a `ResearchEngine::run` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResult {
    pub signal: Signal,
    pub accuracy: f64,
    pub imbalance: f64,
    pub micro_signals: MicroSignals,
    pub recommended_action: String,
}

struct PerSymbolHistory {
    orderbooks: VecDeque<Orderbook>,
    spreads_pct: VecDeque<f64>,
    depths: VecDeque<f64>,
    volumes: VecDeque<f64>,
    abs_imbalances: VecDeque<f64>,
    mids: VecDeque<f64>,
}

impl Default for PerSymbolHistory {
    fn default() -> Self {
        Self {
            orderbooks: VecDeque::with_capacity(ORDERBOOK_HISTORY_CAP),
            spreads_pct: VecDeque::with_capacity(SERIES_HISTORY_CAP),
            depths: VecDeque::with_capacity(SERIES_HISTORY_CAP),
            volumes: VecDeque::with_capacity(SERIES_HISTORY_CAP),
            abs_imbalances: VecDeque::with_capacity(SERIES_HISTORY_CAP),
            mids: VecDeque::with_capacity(SERIES_HISTORY_CAP),
        }
    }
}

fn push_capped<T>(buf: &mut VecDeque<T>, item: T, cap: usize) {
    buf.push_back(item);
    if buf.len() > cap {
        buf.pop_front();
    }
}

/// Percentile `p` (0..=100) over a copy of `values`, nearest-rank method.
fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let rank = ((p / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn median(values: &[f64]) -> f64 {
    percentile(values, 50.0)
}

fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn to_f64(d: rust_decimal::Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// Turns orderbook snapshots plus rolling per-symbol history into a trading
/// signal (C6, spec §4.5). Stateless beyond the bounded per-symbol history
/// it accumulates — `run` is pure given that history.
pub struct ResearchEngine {
    histories: RwLock<HashMap<Symbol, PerSymbolHistory>>,
    feature_providers: Vec<Box<dyn FeatureProvider>>,
}

impl ResearchEngine {
    pub fn new(feature_providers: Vec<Box<dyn FeatureProvider>>) -> Self {
        Self { histories: RwLock::new(HashMap::new()), feature_providers }
    }

    /// Compute a `ResearchResult` for `symbol` given the current orderbook.
    /// Missing side of book short-circuits to `HOLD`/`accuracy=0.5` with no
    /// history mutation (spec §4.5 Failure semantics).
    pub async fn run(&self, symbol: &Symbol, orderbook: &Orderbook) -> ResearchResult {
        let (Some(best_bid), Some(best_ask)) = (orderbook.best_bid(), orderbook.best_ask()) else {
            debug!(symbol = %symbol, "research: missing orderbook side, returning HOLD");
            return ResearchResult {
                signal: Signal::Hold,
                accuracy: 0.5,
                imbalance: 0.0,
                micro_signals: MicroSignals { imbalance: 0.0, spread_pct: 0.0, depth: 0.0, volume: 0.0, price_momentum: 0.0, volatility: 0.0 },
                recommended_action: "hold".to_string(),
            };
        };

        let mid = (to_f64(best_bid.price) + to_f64(best_ask.price)) / 2.0;
        let spread_pct = (to_f64(best_ask.price) - to_f64(best_bid.price)) / mid * 100.0;

        let sum_bid_qty: f64 = orderbook.bids.iter().take(10).map(|l| to_f64(l.quantity)).sum();
        let sum_ask_qty: f64 = orderbook.asks.iter().take(10).map(|l| to_f64(l.quantity)).sum();
        let total = sum_bid_qty + sum_ask_qty;
        let imbalance = if total > 0.0 { (sum_bid_qty - sum_ask_qty) / total } else { 0.0 };

        let bid_depth: f64 = orderbook.bids.iter().take(5).map(|l| to_f64(l.price) * to_f64(l.quantity)).sum();
        let ask_depth: f64 = orderbook.asks.iter().take(5).map(|l| to_f64(l.price) * to_f64(l.quantity)).sum();
        let depth = bid_depth + ask_depth;
        let volume = depth;

        // Thresholds and momentum come from history *before* this snapshot
        // is appended (spec §4.5: momentum uses the previous snapshot).
        let (price_momentum, imbalance_threshold, spread_wide_cutoff, depth_low, volume_low, volatility) = {
            let histories = self.histories.read();
            let hist = histories.get(symbol);

            let price_momentum = hist
                .and_then(|h| h.mids.back())
                .filter(|prev| **prev != 0.0)
                .map(|prev| (mid - prev) / prev)
                .unwrap_or(0.0);

            let abs_imbalances: Vec<f64> = hist.map(|h| h.abs_imbalances.iter().copied().collect()).unwrap_or_default();
            let imbalance_threshold = if abs_imbalances.is_empty() {
                0.20
            } else {
                percentile(&abs_imbalances, 70.0).clamp(0.05, 0.40)
            };

            let spreads: Vec<f64> = hist.map(|h| h.spreads_pct.iter().copied().collect()).unwrap_or_default();
            let spread_wide_cutoff = percentile(&spreads, 80.0);

            let depths: Vec<f64> = hist.map(|h| h.depths.iter().copied().collect()).unwrap_or_default();
            let volumes: Vec<f64> = hist.map(|h| h.volumes.iter().copied().collect()).unwrap_or_default();
            let depth_low = median(&depths) * 0.5;
            let volume_low = median(&volumes) * 0.5;

            let recent_mids: Vec<f64> = hist
                .map(|h| h.mids.iter().rev().take(VOLATILITY_WINDOW).copied().collect::<Vec<_>>())
                .unwrap_or_default();
            let returns: Vec<f64> = recent_mids
                .windows(2)
                .filter_map(|w| if w[1] != 0.0 { Some((w[0] - w[1]) / w[1]) } else { None })
                .collect();
            let volatility = stddev(&returns);

            (price_momentum, imbalance_threshold, spread_wide_cutoff, depth_low, volume_low, volatility)
        };

        let micro_signals = MicroSignals { imbalance, spread_pct, depth, volume, price_momentum, volatility };

        let mut accuracy = self.score_accuracy(symbol, &micro_signals).await;

        // Liquidity gate (spec §4.5) clamps regardless of how high the
        // additive score climbed.
        if spread_pct > spread_wide_cutoff || depth < depth_low || volume < volume_low {
            accuracy = accuracy.min(0.49);
        }

        let signal = if accuracy < 0.5 {
            Signal::Hold
        } else if imbalance > imbalance_threshold {
            Signal::Buy
        } else if imbalance < -imbalance_threshold {
            Signal::Sell
        } else {
            Signal::Hold
        };

        let recommended_action = Self::recommended_action(signal, accuracy);

        // Append *after* computing micro-signals so momentum used the prior
        // snapshot, per spec §4.5.
        {
            let mut histories = self.histories.write();
            let hist = histories.entry(symbol.clone()).or_default();
            push_capped(&mut hist.orderbooks, orderbook.clone(), ORDERBOOK_HISTORY_CAP);
            push_capped(&mut hist.spreads_pct, spread_pct, SERIES_HISTORY_CAP);
            push_capped(&mut hist.depths, depth, SERIES_HISTORY_CAP);
            push_capped(&mut hist.volumes, volume, SERIES_HISTORY_CAP);
            push_capped(&mut hist.abs_imbalances, imbalance.abs(), SERIES_HISTORY_CAP);
            push_capped(&mut hist.mids, mid, SERIES_HISTORY_CAP);
        }

        ResearchResult { signal, accuracy, imbalance, micro_signals, recommended_action }
    }

    /// Additive accuracy score (spec §4.5), including best-effort external
    /// feature adjustments. Clamped to `[0.10, 0.95]`.
    async fn score_accuracy(&self, symbol: &Symbol, m: &MicroSignals) -> f64 {
        let mut score = 0.5;

        score += Self::tiered(m.imbalance.abs(), &[(0.10, 0.05), (0.25, 0.10), (0.40, 0.15)]);
        score += Self::tiered_inverse(m.spread_pct, &[(0.05, 0.05), (0.10, 0.03), (0.20, 0.01)]);
        score += Self::tiered(m.volume, &[(1_000.0, 0.05), (10_000.0, 0.10)]);
        if m.depth > 5_000.0 {
            score += 0.05;
        }
        if m.price_momentum.abs() > 0.001 {
            score += 0.05;
        }

        let mut external_penalty = 0.0;
        for provider in &self.feature_providers {
            let result = tokio::time::timeout(FEATURE_PROVIDER_TIMEOUT, provider.fetch(symbol)).await;
            match result {
                Ok(Some(value)) if value >= 0.0 => score += (value * 0.05).min(0.05),
                Ok(Some(value)) => external_penalty = (external_penalty + value.abs() * 0.05).min(0.05),
                Ok(None) => debug!(provider = provider.name(), "feature provider returned no value"),
                Err(_) => debug!(provider = provider.name(), "feature provider timed out"),
            }
        }
        score -= external_penalty;

        score.clamp(0.10, 0.95)
    }

    /// Additive tiers: the *highest* threshold that `value` clears wins (not
    /// cumulative across tiers).
    fn tiered(value: f64, tiers: &[(f64, f64)]) -> f64 {
        tiers.iter().rev().find(|(threshold, _)| value >= *threshold).map(|(_, bonus)| *bonus).unwrap_or(0.0)
    }

    /// Like `tiered` but rewards *smaller* values (tight spreads).
    fn tiered_inverse(value: f64, tiers: &[(f64, f64)]) -> f64 {
        tiers.iter().find(|(threshold, _)| value <= *threshold).map(|(_, bonus)| *bonus).unwrap_or(0.0)
    }

    fn recommended_action(signal: Signal, accuracy: f64) -> String {
        let confidence = if accuracy >= 0.85 {
            "high"
        } else if accuracy >= 0.7 {
            "medium"
        } else {
            "low"
        };
        match signal {
            Signal::Hold => "hold".to_string(),
            Signal::Buy => format!("buy_{confidence}_confidence"),
            Signal::Sell => format!("sell_{confidence}_confidence"),
        }
    }
}

impl std::fmt::Debug for ResearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResearchEngine").field("symbols_tracked", &self.histories.read().len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderbookLevel;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn book(bid: Decimal, ask: Decimal, bid_qty: Decimal, ask_qty: Decimal) -> Orderbook {
        Orderbook {
            symbol: Symbol::new("BTCUSDT"),
            bids: vec![OrderbookLevel { price: bid, quantity: bid_qty }],
            asks: vec![OrderbookLevel { price: ask, quantity: ask_qty }],
            update_seq: 1,
        }
    }

    #[tokio::test]
    async fn missing_side_returns_hold_with_baseline_accuracy() {
        let engine = ResearchEngine::new(vec![]);
        let empty = Orderbook { symbol: Symbol::new("BTCUSDT"), bids: vec![], asks: vec![], update_seq: 1 };
        let result = engine.run(&Symbol::new("BTCUSDT"), &empty).await;
        assert_eq!(result.signal, Signal::Hold);
        assert_eq!(result.accuracy, 0.5);
    }

    #[tokio::test]
    async fn strong_bid_imbalance_with_default_threshold_signals_buy() {
        let engine = ResearchEngine::new(vec![]);
        let ob = book(dec!(100), dec!(100.01), dec!(50), dec!(1));
        let result = engine.run(&Symbol::new("BTCUSDT"), &ob).await;
        assert_eq!(result.signal, Signal::Buy);
        assert!(result.imbalance > 0.2);
    }

    #[tokio::test]
    async fn thin_liquidity_clamps_accuracy_below_half() {
        let engine = ResearchEngine::new(vec![]);
        // Build history with healthy depth first.
        let healthy = book(dec!(100), dec!(100.01), dec!(500), dec!(500));
        for _ in 0..5 {
            engine.run(&Symbol::new("BTCUSDT"), &healthy).await;
        }
        // Then a thin snapshot should trip the liquidity gate.
        let thin = book(dec!(100), dec!(100.01), dec!(0.001), dec!(0.001));
        let result = engine.run(&Symbol::new("BTCUSDT"), &thin).await;
        assert!(result.accuracy <= 0.49);
    }
}
