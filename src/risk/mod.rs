//! Risk Manager - Entry gating and exit triggers
//!
//! Implements:
//! - Fixed-size entries (never scaled)
//! - Maximum concurrent position limit
//! - Daily loss limit (halts entries until the next UTC day)
//! - Stop-loss, take-profit and trailing stop, in that priority
//! - Duplicate market, category and insufficient balance guards
//! - Spread and net expected value gate on the book before an order is placed

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RiskConfig;
use crate::ledger::Ledger;
use crate::types::{ExitReason, Position, Quote, Side, Signal};

/// Tolerance for threshold comparisons so boundaries fire at the stated percentages
pub const EPSILON: f64 = 1e-9;

/// Risk limits
#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    /// Size of every entry (USDC)
    pub max_trade_usd: f64,
    /// Maximum concurrent open positions
    pub max_positions: usize,
    /// Stop-loss as a fraction of entry (e.g., 0.15 = 15%)
    pub stop_loss_pct: f64,
    /// Take-profit as a fraction of entry
    pub take_profit_pct: f64,
    /// Trailing stop retrace from peak
    pub trailing_stop_pct: f64,
    /// Daily realized loss as a fraction of the day's starting balance
    pub max_daily_loss_pct: f64,
    /// Open positions allowed per category
    pub max_positions_per_category: usize,
    /// Market id -> category; unlisted markets are not grouped
    pub market_categories: HashMap<String, String>,
    /// Widest bid/ask spread accepted, as a fraction of the mid
    pub max_spread_pct: f64,
    /// Trading fee estimate
    pub fee_rate: f64,
    /// Slippage estimate
    pub slippage_estimate: f64,
    /// Minimum expected edge after costs
    pub min_net_ev: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_trade_usd: 0.50,       // $0.50 per trade ($10 budget)
            max_positions: 3,          // At most 3 open at once
            stop_loss_pct: 0.15,       // -15% stop-loss
            take_profit_pct: 0.25,     // +25% take-profit
            trailing_stop_pct: 0.10,   // 10% retrace from peak
            max_daily_loss_pct: 0.02,  // 2% of the day's starting balance
            max_positions_per_category: 1,
            market_categories: HashMap::new(),
            max_spread_pct: 0.05,      // 5% of mid
            fee_rate: 0.002,           // 0.2% fee
            slippage_estimate: 0.005,  // 0.5% slippage
            min_net_ev: 0.01,          // 1% edge after costs
        }
    }
}

impl From<&RiskConfig> for RiskLimits {
    fn from(cfg: &RiskConfig) -> Self {
        Self {
            max_trade_usd: cfg.max_trade_usd,
            max_positions: cfg.max_positions,
            stop_loss_pct: cfg.stop_loss_pct,
            take_profit_pct: cfg.take_profit_pct,
            trailing_stop_pct: cfg.trailing_stop_pct,
            max_daily_loss_pct: cfg.max_daily_loss_pct,
            max_positions_per_category: cfg.max_positions_per_category,
            market_categories: cfg.market_categories(),
            max_spread_pct: cfg.max_spread_pct,
            fee_rate: cfg.fee_rate,
            slippage_estimate: cfg.slippage_estimate,
            min_net_ev: cfg.min_net_ev,
        }
    }
}

/// Why an entry was allowed or denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    Approved,
    DailyLossLimit,
    Capacity,
    NoSignal,
    DuplicateMarket,
    CategoryLimit,
    InsufficientBalance,
    NoQuote,
    SpreadTooWide,
    NetEvTooLow,
}

impl DecisionReason {
    /// Denials that apply to every market, so the entry scan can stop
    pub fn ends_entry_scan(&self) -> bool {
        matches!(self, DecisionReason::DailyLossLimit | DecisionReason::Capacity)
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionReason::Approved => write!(f, "APPROVED"),
            DecisionReason::DailyLossLimit => write!(f, "DAILY_LOSS_LIMIT"),
            DecisionReason::Capacity => write!(f, "CAPACITY"),
            DecisionReason::NoSignal => write!(f, "NO_SIGNAL"),
            DecisionReason::DuplicateMarket => write!(f, "DUPLICATE_MARKET"),
            DecisionReason::CategoryLimit => write!(f, "CATEGORY_LIMIT"),
            DecisionReason::InsufficientBalance => write!(f, "INSUFFICIENT_BALANCE"),
            DecisionReason::NoQuote => write!(f, "NO_QUOTE"),
            DecisionReason::SpreadTooWide => write!(f, "SPREAD_TOO_WIDE"),
            DecisionReason::NetEvTooLow => write!(f, "NET_EV_TOO_LOW"),
        }
    }
}

/// Entry decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allow: bool,
    pub size_usd: f64,
    pub reason: DecisionReason,
}

impl Decision {
    fn approve(size_usd: f64) -> Self {
        Self {
            allow: true,
            size_usd,
            reason: DecisionReason::Approved,
        }
    }

    fn deny(reason: DecisionReason) -> Self {
        Self {
            allow: false,
            size_usd: 0.0,
            reason,
        }
    }
}

/// Cost and edge estimate for an entry at the current book
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeEstimate {
    pub spread_pct: f64,
    /// fee + half the spread + slippage
    pub effective_cost: f64,
    /// Distance from the window mean in the trade's favour, relative to the mean
    pub expected_edge: f64,
    pub net_ev: f64,
}

/// A position that must be closed at `price`
#[derive(Debug, Clone, PartialEq)]
pub struct ExitInstruction {
    pub position_id: String,
    pub market_id: String,
    pub reason: ExitReason,
    pub price: f64,
}

/// Risk manager
#[derive(Debug, Clone, Default)]
pub struct RiskManager {
    limits: RiskLimits,
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Decide whether `signal` may open a position in `market_id`. First failing check wins.
    pub fn evaluate_entry(&self, signal: Signal, market_id: &str, ledger: &Ledger) -> Decision {
        if ledger.daily_loss_limit_hit() {
            return Decision::deny(DecisionReason::DailyLossLimit);
        }
        if ledger.open_count() >= self.limits.max_positions {
            return Decision::deny(DecisionReason::Capacity);
        }
        if signal == Signal::Hold {
            return Decision::deny(DecisionReason::NoSignal);
        }
        if ledger.has_market(market_id) {
            return Decision::deny(DecisionReason::DuplicateMarket);
        }
        if self.category_full(market_id, ledger) {
            return Decision::deny(DecisionReason::CategoryLimit);
        }
        if ledger.balance() + EPSILON < self.limits.max_trade_usd {
            return Decision::deny(DecisionReason::InsufficientBalance);
        }
        Decision::approve(self.limits.max_trade_usd)
    }

    pub fn category_of(&self, market_id: &str) -> Option<&str> {
        self.limits.market_categories.get(market_id).map(String::as_str)
    }

    fn category_full(&self, market_id: &str, ledger: &Ledger) -> bool {
        let Some(category) = self.category_of(market_id) else {
            return false;
        };
        let held = ledger
            .open_positions()
            .iter()
            .filter(|p| self.category_of(&p.market_id) == Some(category))
            .count();
        held >= self.limits.max_positions_per_category
    }

    /// Check the book before entering at `price` against the window mean `fair_value`
    pub fn evaluate_edge(
        &self,
        side: Side,
        price: f64,
        fair_value: f64,
        quote: &Quote,
    ) -> Result<EdgeEstimate, DecisionReason> {
        let spread_pct = quote.spread_pct();
        if !spread_pct.is_finite() || spread_pct > self.limits.max_spread_pct + EPSILON {
            return Err(DecisionReason::SpreadTooWide);
        }

        let effective_cost =
            self.limits.fee_rate + 0.5 * spread_pct + self.limits.slippage_estimate;
        let expected_edge = if fair_value > 0.0 {
            side.sign() * (fair_value - price) / fair_value
        } else {
            0.0
        };
        let estimate = EdgeEstimate {
            spread_pct,
            effective_cost,
            expected_edge,
            net_ev: expected_edge - effective_cost,
        };

        if estimate.net_ev < self.limits.min_net_ev - EPSILON {
            return Err(DecisionReason::NetEvTooLow);
        }
        Ok(estimate)
    }

    /// Exit trigger for `position` at `price`, highest priority first
    pub fn check_exit(&self, position: &Position, price: f64) -> Option<ExitReason> {
        let ret = position.return_pct(price);

        if ret <= -self.limits.stop_loss_pct + EPSILON {
            return Some(ExitReason::StopLoss);
        }
        if ret >= self.limits.take_profit_pct - EPSILON {
            return Some(ExitReason::TakeProfit);
        }
        if position.has_been_profitable()
            && position.retrace_from_peak(price) >= self.limits.trailing_stop_pct - EPSILON
        {
            return Some(ExitReason::TrailingStop);
        }
        None
    }

    /// Update peaks and collect exits for every open position with a known price
    pub fn evaluate_exits(
        &self,
        ledger: &mut Ledger,
        current_prices: &HashMap<String, f64>,
    ) -> Vec<ExitInstruction> {
        let mut exits = Vec::new();

        for position in ledger.open_positions() {
            let Some(&price) = current_prices.get(&position.market_id) else {
                continue;
            };
            if !price.is_finite() || !(0.0..=1.0).contains(&price) {
                continue;
            }

            ledger.update_peak(&position.id, price);
            let Some(position) = ledger.position(&position.id) else {
                continue;
            };

            if let Some(reason) = self.check_exit(&position, price) {
                debug!(
                    id = %position.id,
                    market = %position.market_id,
                    entry = position.entry_price,
                    peak = position.peak_price,
                    price,
                    reason = %reason,
                    "[RISK] Exit triggered"
                );
                exits.push(ExitInstruction {
                    position_id: position.id.clone(),
                    market_id: position.market_id.clone(),
                    reason,
                    price,
                });
            }
        }

        exits
    }

    /// Mark the daily loss limit when today's realized loss reaches the cap
    pub fn enforce_daily_loss_limit(&self, ledger: &mut Ledger) -> bool {
        if ledger.daily_loss_limit_hit() {
            return true;
        }
        let pnl = ledger.daily_realized_pnl();
        let basis = ledger.daily_start_balance();
        let hit = if basis > 0.0 {
            pnl / basis <= -self.limits.max_daily_loss_pct + EPSILON
        } else {
            pnl < 0.0
        };
        if hit {
            info!(
                daily_pnl = pnl,
                basis,
                limit_pct = self.limits.max_daily_loss_pct,
                "🛑 [RISK] Daily loss limit reached"
            );
            ledger.mark_daily_loss_limit_hit();
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn open(ledger: &mut Ledger, market: &str, side: Side, entry: f64) -> Position {
        ledger.open_position(market, side, entry, 0.5).unwrap()
    }

    fn prices(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(m, p)| (m.to_string(), *p)).collect()
    }

    #[test]
    fn test_entry_checks_in_order() {
        let rm = RiskManager::default();
        let mut ledger = Ledger::new(3, 10.0);

        assert_eq!(
            rm.evaluate_entry(Signal::Hold, "a", &ledger).reason,
            DecisionReason::NoSignal
        );

        let approved = rm.evaluate_entry(Signal::Buy, "a", &ledger);
        assert!(approved.allow);
        assert_eq!(approved.size_usd, 0.50);

        open(&mut ledger, "a", Side::Long, 0.5);
        assert_eq!(
            rm.evaluate_entry(Signal::Sell, "a", &ledger).reason,
            DecisionReason::DuplicateMarket
        );

        open(&mut ledger, "b", Side::Long, 0.5);
        open(&mut ledger, "c", Side::Long, 0.5);
        // Capacity outranks a missing signal
        assert_eq!(
            rm.evaluate_entry(Signal::Hold, "d", &ledger).reason,
            DecisionReason::Capacity
        );

        ledger.mark_daily_loss_limit_hit();
        assert_eq!(
            rm.evaluate_entry(Signal::Buy, "d", &ledger).reason,
            DecisionReason::DailyLossLimit
        );
    }

    #[test]
    fn test_category_limit() {
        let rm = RiskManager::new(RiskLimits {
            market_categories: HashMap::from([
                ("btc-up".to_string(), "crypto".to_string()),
                ("eth-up".to_string(), "crypto".to_string()),
                ("nba-final".to_string(), "sports".to_string()),
            ]),
            ..Default::default()
        });
        let mut ledger = Ledger::new(3, 10.0);
        open(&mut ledger, "btc-up", Side::Long, 0.5);

        assert_eq!(
            rm.evaluate_entry(Signal::Buy, "eth-up", &ledger).reason,
            DecisionReason::CategoryLimit
        );
        assert!(rm.evaluate_entry(Signal::Buy, "nba-final", &ledger).allow);
        // Unlisted markets are never grouped
        open(&mut ledger, "x", Side::Long, 0.5);
        assert!(rm.evaluate_entry(Signal::Sell, "y", &ledger).allow);
    }

    #[test]
    fn test_edge_gate() {
        let rm = RiskManager::default();
        let tight = Quote::new(0.395, 0.405);

        // 0.49 mean, buying 0.40: edge ~18% against ~1.95% costs
        let estimate = rm.evaluate_edge(Side::Long, 0.40, 0.49, &tight).unwrap();
        assert!((estimate.spread_pct - 0.025).abs() < 1e-9);
        assert!((estimate.effective_cost - 0.0195).abs() < 1e-9);
        assert!(estimate.net_ev > 0.15);

        // Shorting above the mean is symmetric
        assert!(rm
            .evaluate_edge(Side::Short, 0.60, 0.51, &Quote::new(0.595, 0.605))
            .is_ok());

        assert_eq!(
            rm.evaluate_edge(Side::Long, 0.40, 0.49, &Quote::new(0.38, 0.42)),
            Err(DecisionReason::SpreadTooWide)
        );
        // Edge of ~2% is eaten by costs
        assert_eq!(
            rm.evaluate_edge(Side::Long, 0.40, 0.408, &tight),
            Err(DecisionReason::NetEvTooLow)
        );
        // Wrong side of the mean
        assert_eq!(
            rm.evaluate_edge(Side::Short, 0.40, 0.49, &tight),
            Err(DecisionReason::NetEvTooLow)
        );
    }

    #[test]
    fn test_insufficient_balance() {
        let rm = RiskManager::default();
        let ledger = Ledger::new(3, 0.25);
        let decision = rm.evaluate_entry(Signal::Buy, "a", &ledger);
        assert!(!decision.allow);
        assert_eq!(decision.reason, DecisionReason::InsufficientBalance);
    }

    #[test]
    fn test_stop_loss_exact_boundary() {
        let rm = RiskManager::default();
        let mut ledger = Ledger::new(3, 10.0);
        let long = open(&mut ledger, "a", Side::Long, 0.40);
        let short = open(&mut ledger, "b", Side::Short, 0.40);

        assert_eq!(rm.check_exit(&long, 0.34), Some(ExitReason::StopLoss));
        assert_eq!(rm.check_exit(&short, 0.46), Some(ExitReason::StopLoss));
        assert_eq!(rm.check_exit(&long, 0.35), None);
        assert_eq!(rm.check_exit(&short, 0.45), None);
    }

    #[test]
    fn test_take_profit_exact_boundary() {
        let rm = RiskManager::default();
        let mut ledger = Ledger::new(3, 10.0);
        let long = open(&mut ledger, "a", Side::Long, 0.40);
        let short = open(&mut ledger, "b", Side::Short, 0.40);

        assert_eq!(rm.check_exit(&long, 0.50), Some(ExitReason::TakeProfit));
        assert_eq!(rm.check_exit(&short, 0.30), Some(ExitReason::TakeProfit));
        assert_eq!(rm.check_exit(&long, 0.49), None);
    }

    #[test]
    fn test_trailing_stop_long() {
        let rm = RiskManager::default();
        let mut ledger = Ledger::new(3, 10.0);
        let position = open(&mut ledger, "a", Side::Long, 0.50);

        // Price goes up - peak follows, no exit
        assert!(rm
            .evaluate_exits(&mut ledger, &prices(&[("a", 0.60)]))
            .is_empty());

        // 10% retrace from 0.60
        let exits = rm.evaluate_exits(&mut ledger, &prices(&[("a", 0.54)]));
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].position_id, position.id);
        assert_eq!(exits[0].reason, ExitReason::TrailingStop);
    }

    #[test]
    fn test_trailing_stop_short() {
        let rm = RiskManager::default();
        let mut ledger = Ledger::new(3, 10.0);
        open(&mut ledger, "a", Side::Short, 0.50);

        assert!(rm
            .evaluate_exits(&mut ledger, &prices(&[("a", 0.40)]))
            .is_empty());

        let exits = rm.evaluate_exits(&mut ledger, &prices(&[("a", 0.44)]));
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].reason, ExitReason::TrailingStop);
    }

    #[test]
    fn test_trailing_stop_needs_favourable_peak() {
        let rm = RiskManager::default();
        let mut ledger = Ledger::new(3, 10.0);
        let position = open(&mut ledger, "a", Side::Long, 0.50);
        // Down 10% from entry but peak never moved above it
        assert_eq!(rm.check_exit(&position, 0.45), None);
    }

    #[test]
    fn test_take_profit_outranks_trailing_stop() {
        let mut ledger = Ledger::new(3, 10.0);
        let mut position = open(&mut ledger, "a", Side::Long, 0.40);
        position.peak_price = 0.60;

        let rm = RiskManager::default();
        assert_eq!(rm.check_exit(&position, 0.54), Some(ExitReason::TakeProfit));

        let wide_tp = RiskManager::new(RiskLimits {
            take_profit_pct: 0.50,
            ..Default::default()
        });
        assert_eq!(
            wide_tp.check_exit(&position, 0.54),
            Some(ExitReason::TrailingStop)
        );
    }

    #[test]
    fn test_exits_skip_markets_without_price() {
        let rm = RiskManager::default();
        let mut ledger = Ledger::new(3, 10.0);
        open(&mut ledger, "a", Side::Long, 0.40);
        let exits = rm.evaluate_exits(&mut ledger, &prices(&[("b", 0.01)]));
        assert!(exits.is_empty());
    }

    #[test]
    fn test_daily_loss_limit() {
        let rm = RiskManager::default();
        let mut ledger = Ledger::new(3, 10.0);

        for market in ["a", "b"] {
            let p = open(&mut ledger, market, Side::Long, 0.50);
            ledger
                .close_position(&p.id, 0.425, ExitReason::StopLoss)
                .unwrap();
            assert!(!rm.enforce_daily_loss_limit(&mut ledger));
        }

        let p = open(&mut ledger, "c", Side::Long, 0.50);
        ledger
            .close_position(&p.id, 0.425, ExitReason::StopLoss)
            .unwrap();
        // -0.225 on a $10 basis is -2.25%
        assert!(rm.enforce_daily_loss_limit(&mut ledger));
        assert!(ledger.daily_loss_limit_hit());

        let decision = rm.evaluate_entry(Signal::Buy, "d", &ledger);
        assert_eq!(decision.reason, DecisionReason::DailyLossLimit);
    }

    #[test]
    fn test_daily_loss_limit_exact_boundary() {
        let rm = RiskManager::default();
        let mut ledger = Ledger::new(3, 10.0);
        let p = open(&mut ledger, "a", Side::Long, 0.50);
        // 0.5 size at 0.5 entry: exit 0.30 loses exactly $0.20 (2%)
        ledger
            .close_position(&p.id, 0.30, ExitReason::StopLoss)
            .unwrap();
        assert!(rm.enforce_daily_loss_limit(&mut ledger));
    }
}
