//! Core types used throughout pmbot
//!
//! Defines common data structures for prices, signals, positions and trade records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Single observed price for a market (CLOB token id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub market_id: String,
    pub timestamp: DateTime<Utc>,
    /// Outcome token price (0.0 - 1.0)
    pub price: f64,
}

impl PricePoint {
    pub fn new(market_id: impl Into<String>, timestamp: DateTime<Utc>, price: f64) -> Self {
        Self {
            market_id: market_id.into(),
            timestamp,
            price,
        }
    }

    /// Prices must be finite probabilities
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && (0.0..=1.0).contains(&self.price)
    }
}

/// Top of the order book for a market
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    pub fn new(bid: f64, ask: f64) -> Self {
        Self { bid, ask }
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    /// Spread as a fraction of the mid (0.05 = 5%)
    pub fn spread_pct(&self) -> f64 {
        let mid = self.mid();
        if mid <= 0.0 {
            return f64::INFINITY;
        }
        self.spread() / mid
    }
}

/// Mean-reversion trading signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    /// Position side an actionable signal opens
    pub fn side(&self) -> Option<Side> {
        match self {
            Signal::Buy => Some(Side::Long),
            Signal::Sell => Some(Side::Short),
            Signal::Hold => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Buy => write!(f, "BUY"),
            Signal::Sell => write!(f, "SELL"),
            Signal::Hold => write!(f, "HOLD"),
        }
    }
}

/// Position side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    /// Bought the outcome token
    Long,
    /// Sold the outcome token
    Short,
}

impl Side {
    /// +1 for longs, -1 for shorts
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    /// Order side that opens a position on this side
    pub fn entry_order(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that flattens a position on this side
    pub fn exit_order(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Position lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    /// Closed to match the exchange's view after a restart
    Reconciled,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::TakeProfit => write!(f, "TAKE_PROFIT"),
            ExitReason::TrailingStop => write!(f, "TRAILING_STOP"),
            ExitReason::Reconciled => write!(f, "RECONCILED"),
            ExitReason::Manual => write!(f, "MANUAL"),
        }
    }
}

/// Position tracked by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub market_id: String,
    pub side: Side,
    pub entry_price: f64,
    pub size_usd: f64,
    /// Outcome tokens held (size_usd / entry_price)
    pub shares: f64,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    /// Best price seen since open (highest for longs, lowest for shorts)
    pub peak_price: f64,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
}

impl Position {
    /// Signed return relative to entry (positive = in our favour)
    pub fn return_pct(&self, current_price: f64) -> f64 {
        self.side.sign() * (current_price - self.entry_price) / self.entry_price
    }

    /// P&L in USDC if closed at `price`
    pub fn pnl_at(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * (self.size_usd / self.entry_price)
    }

    /// Whether the peak has moved in our favour since entry
    pub fn has_been_profitable(&self) -> bool {
        match self.side {
            Side::Long => self.peak_price > self.entry_price,
            Side::Short => self.peak_price < self.entry_price,
        }
    }

    /// Adverse move from the peak as a fraction of the peak
    pub fn retrace_from_peak(&self, current_price: f64) -> f64 {
        if self.peak_price <= 0.0 {
            return 0.0;
        }
        match self.side {
            Side::Long => (self.peak_price - current_price) / self.peak_price,
            Side::Short => (current_price - self.peak_price) / self.peak_price,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// Trade log action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeAction {
    Open,
    Close,
    /// Entry that never filled on the exchange
    Void,
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeAction::Open => write!(f, "OPEN"),
            TradeAction::Close => write!(f, "CLOSE"),
            TradeAction::Void => write!(f, "VOID"),
        }
    }
}

/// Append-only trade history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub position_id: String,
    pub market_id: String,
    pub action: TradeAction,
    pub side: Side,
    pub price: f64,
    pub size_usd: f64,
    pub pnl: Option<f64>,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(side: Side, entry: f64, peak: f64) -> Position {
        Position {
            id: "p1".to_string(),
            market_id: "token-1".to_string(),
            side,
            entry_price: entry,
            size_usd: 0.5,
            shares: 0.5 / entry,
            opened_at: Utc::now(),
            status: PositionStatus::Open,
            peak_price: peak,
            realized_pnl: None,
            closed_at: None,
            exit_price: None,
            exit_reason: None,
        }
    }

    #[test]
    fn short_pnl_is_mirrored() {
        let long = position(Side::Long, 0.50, 0.50);
        let short = position(Side::Short, 0.50, 0.50);
        assert!((long.pnl_at(0.55) - 0.05).abs() < 1e-12);
        assert!((short.pnl_at(0.55) + 0.05).abs() < 1e-12);
        assert!((short.return_pct(0.45) - 0.10).abs() < 1e-12);
    }

    #[test]
    fn profitability_follows_side() {
        assert!(position(Side::Long, 0.40, 0.45).has_been_profitable());
        assert!(!position(Side::Long, 0.40, 0.40).has_been_profitable());
        assert!(position(Side::Short, 0.40, 0.35).has_been_profitable());
        assert!(!position(Side::Short, 0.40, 0.42).has_been_profitable());
    }

    #[test]
    fn quote_spread_is_relative_to_mid() {
        let quote = Quote::new(0.39, 0.41);
        assert!((quote.mid() - 0.40).abs() < 1e-12);
        assert!((quote.spread_pct() - 0.05).abs() < 1e-12);
        assert_eq!(Quote::new(0.0, 0.0).spread_pct(), f64::INFINITY);
    }

    #[test]
    fn side_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&Side::Long).unwrap(), "\"LONG\"");
        assert_eq!(
            serde_json::to_string(&ExitReason::TrailingStop).unwrap(),
            "\"TRAILING_STOP\""
        );
    }
}
