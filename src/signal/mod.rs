//! Mean-reversion signal engine
//!
//! Implements:
//! - Bounded rolling price window per market
//! - Z-score of the latest price against its window (population std dev)
//! - BUY / SELL / HOLD mapping against injected thresholds

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StrategyConfig;
use crate::types::{PricePoint, Signal};

/// Z-score thresholds for signal generation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalThresholds {
    /// Score below this is oversold (BUY)
    pub buy: f64,
    /// Score above this is overbought (SELL)
    pub sell: f64,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        Self {
            buy: -1.2,
            sell: 1.2,
        }
    }
}

impl From<&StrategyConfig> for SignalThresholds {
    fn from(cfg: &StrategyConfig) -> Self {
        Self {
            buy: cfg.zscore_buy_threshold,
            sell: cfg.zscore_sell_threshold,
        }
    }
}

/// Last N prices for one market, oldest first
#[derive(Debug, Clone, PartialEq)]
pub struct PriceWindow {
    capacity: usize,
    points: VecDeque<PricePoint>,
}

impl PriceWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            points: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a point, discarding the oldest once full
    pub fn push(&mut self, point: PricePoint) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&PricePoint> {
        self.points.back()
    }

    pub fn prices(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.price)
    }

    /// Mean and population standard deviation of the window
    pub fn stats(&self) -> Option<(f64, f64)> {
        if self.points.is_empty() {
            return None;
        }
        let n = self.points.len() as f64;
        let mean = self.prices().sum::<f64>() / n;
        let variance = self.prices().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
        Some((mean, variance.sqrt()))
    }
}

/// Outcome of a signal evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalResult {
    pub market_id: String,
    pub score: f64,
    pub signal: Signal,
    /// Latest price in the window (0.0 when empty)
    pub price: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl SignalResult {
    fn hold(market_id: &str, price: f64, mean: f64, std_dev: f64) -> Self {
        Self {
            market_id: market_id.to_string(),
            score: 0.0,
            signal: Signal::Hold,
            price,
            mean,
            std_dev,
        }
    }
}

/// Compute the mean-reversion signal for the latest price in `window`.
///
/// Fewer than two points or a flat window is not an error: it yields HOLD with score 0.
pub fn compute_signal(
    market_id: &str,
    window: &PriceWindow,
    thresholds: &SignalThresholds,
) -> SignalResult {
    let (price, (mean, std_dev)) = match (window.latest(), window.stats()) {
        (Some(latest), Some(stats)) => (latest.price, stats),
        _ => return SignalResult::hold(market_id, 0.0, 0.0, 0.0),
    };

    if window.len() < 2 || std_dev <= f64::EPSILON {
        return SignalResult::hold(market_id, price, mean, std_dev);
    }

    let score = (price - mean) / std_dev;
    let signal = if score < thresholds.buy {
        Signal::Buy
    } else if score > thresholds.sell {
        Signal::Sell
    } else {
        Signal::Hold
    };

    SignalResult {
        market_id: market_id.to_string(),
        score,
        signal,
        price,
        mean,
        std_dev,
    }
}

/// Owns one rolling window per market
#[derive(Debug, Clone)]
pub struct SignalEngine {
    window_size: usize,
    thresholds: SignalThresholds,
    windows: HashMap<String, PriceWindow>,
}

impl SignalEngine {
    pub fn new(window_size: usize, thresholds: SignalThresholds) -> Self {
        Self {
            window_size,
            thresholds,
            windows: HashMap::new(),
        }
    }

    pub fn from_config(cfg: &StrategyConfig) -> Self {
        Self::new(cfg.window_size, SignalThresholds::from(cfg))
    }

    pub fn thresholds(&self) -> &SignalThresholds {
        &self.thresholds
    }

    /// Record an observed price. Returns false if the price was rejected.
    pub fn record(&mut self, point: PricePoint) -> bool {
        if !point.is_valid() {
            warn!(
                market = %point.market_id,
                price = point.price,
                "⚠️ [SIGNAL] Rejected out-of-range price"
            );
            return false;
        }
        let window_size = self.window_size;
        self.windows
            .entry(point.market_id.clone())
            .or_insert_with(|| PriceWindow::new(window_size))
            .push(point);
        true
    }

    /// Seed a market's window from history (oldest first). Returns points accepted.
    pub fn seed(&mut self, market_id: &str, points: Vec<PricePoint>) -> usize {
        let mut accepted = 0;
        for point in points.into_iter().filter(|p| p.market_id == market_id) {
            if self.record(point) {
                accepted += 1;
            }
        }
        debug!(market = %market_id, accepted, "[SIGNAL] Window seeded");
        accepted
    }

    pub fn evaluate(&self, market_id: &str) -> SignalResult {
        match self.windows.get(market_id) {
            Some(window) => compute_signal(market_id, window, &self.thresholds),
            None => SignalResult::hold(market_id, 0.0, 0.0, 0.0),
        }
    }

    pub fn window(&self, market_id: &str) -> Option<&PriceWindow> {
        self.windows.get(market_id)
    }
}
