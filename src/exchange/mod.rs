//! Exchange seam
//!
//! Everything the engine needs from Polymarket goes through `ExchangeClient`:
//! - `RestClient`: read-only CLOB price feed (midpoint, book, price history)
//! - `PaperExchange`: simulated immediate fills on top of any price feed

pub mod paper;
pub mod rest;

pub use paper::PaperExchange;
pub use rest::RestClient;

pub use crate::ledger::ActualPositionState;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{OrderSide, Position, PricePoint, Quote};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("exchange call timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid price {price} for market {market_id}")]
    InvalidPrice { market_id: String, price: f64 },
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl ExchangeError {
    /// Worth retrying for market data
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Timeout(_) | ExchangeError::Transport(_))
    }
}

/// Order to place on the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub market_id: String,
    pub side: OrderSide,
    pub size_usd: f64,
    /// Price observed when the order was decided
    pub limit_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled { price: f64, size_usd: f64 },
    Pending,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub status: OrderStatus,
}

impl OrderResult {
    pub fn filled(order_id: impl Into<String>, price: f64, size_usd: f64) -> Self {
        Self {
            order_id: order_id.into(),
            status: OrderStatus::Filled { price, size_usd },
        }
    }

    pub fn pending(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            status: OrderStatus::Pending,
        }
    }

    pub fn rejected(order_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            status: OrderStatus::Rejected {
                reason: reason.into(),
            },
        }
    }

    /// Fill price if the order is filled
    pub fn fill_price(&self) -> Option<f64> {
        match self.status {
            OrderStatus::Filled { price, .. } => Some(price),
            _ => None,
        }
    }
}

/// Exchange client used by the trade orchestrator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Current mid price of a market (outcome token)
    async fn get_price(&self, market_id: &str) -> Result<f64, ExchangeError>;

    /// Best bid and ask
    async fn get_quote(&self, market_id: &str) -> Result<Quote, ExchangeError>;

    /// Recent prices, oldest first
    async fn price_history(&self, market_id: &str) -> Result<Vec<PricePoint>, ExchangeError>;

    async fn place_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError>;

    async fn order_status(&self, order_id: &str) -> Result<OrderResult, ExchangeError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;

    /// What the exchange holds for a position the ledger believes is open
    async fn position_state(
        &self,
        position: &Position,
    ) -> Result<ActualPositionState, ExchangeError>;
}

/// Reject prices outside [0, 1]
pub(crate) fn validate_price(market_id: &str, price: f64) -> Result<f64, ExchangeError> {
    if price.is_finite() && (0.0..=1.0).contains(&price) {
        Ok(price)
    } else {
        Err(ExchangeError::InvalidPrice {
            market_id: market_id.to_string(),
            price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_timeout_are_transient() {
        assert!(ExchangeError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ExchangeError::Transport("reset".to_string()).is_transient());
        assert!(!ExchangeError::Rejected("no".to_string()).is_transient());
        assert!(!ExchangeError::Unsupported("orders").is_transient());
    }

    #[test]
    fn validate_price_bounds() {
        assert_eq!(validate_price("m", 0.5), Ok(0.5));
        assert_eq!(validate_price("m", 0.0), Ok(0.0));
        assert!(validate_price("m", -0.1).is_err());
        assert!(validate_price("m", f64::INFINITY).is_err());
    }

    #[test]
    fn fill_price_only_when_filled() {
        assert_eq!(OrderResult::filled("o", 0.4, 0.5).fill_price(), Some(0.4));
        assert_eq!(OrderResult::pending("o").fill_price(), None);
        assert_eq!(OrderResult::rejected("o", "x").fill_price(), None);
    }
}
