//! Paper exchange: immediate fills at the observed mid price
//!
//! Price data is delegated to an inner feed; orders never leave the process.
//! Any price in [0, 1] fills, so positions in a market that resolved to 0 can still close.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::{
    validate_price, ActualPositionState, ExchangeClient, ExchangeError, OrderRequest, OrderResult,
};
use crate::types::{Position, PricePoint, Quote};

pub struct PaperExchange {
    feed: Arc<dyn ExchangeClient>,
    orders: Mutex<HashMap<String, OrderResult>>,
}

impl PaperExchange {
    pub fn new(feed: Arc<dyn ExchangeClient>) -> Self {
        Self {
            feed,
            orders: Mutex::new(HashMap::new()),
        }
    }

    fn remember(&self, result: &OrderResult) {
        let mut orders = match self.orders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        orders.insert(result.order_id.clone(), result.clone());
    }

    fn lookup(&self, order_id: &str) -> Option<OrderResult> {
        let orders = match self.orders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        orders.get(order_id).cloned()
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_price(&self, market_id: &str) -> Result<f64, ExchangeError> {
        self.feed.get_price(market_id).await
    }

    async fn get_quote(&self, market_id: &str) -> Result<Quote, ExchangeError> {
        self.feed.get_quote(market_id).await
    }

    async fn price_history(&self, market_id: &str) -> Result<Vec<PricePoint>, ExchangeError> {
        self.feed.price_history(market_id).await
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError> {
        let price = match request.limit_price {
            Some(price) => price,
            None => self.feed.get_price(&request.market_id).await?,
        };
        let price = validate_price(&request.market_id, price)?;

        let order_id = format!("paper-{}", Uuid::new_v4());
        let result = OrderResult::filled(order_id, price, request.size_usd);
        info!(
            order_id = %result.order_id,
            market = %request.market_id,
            side = %request.side,
            price,
            size_usd = request.size_usd,
            "📝 [PAPER] Order filled"
        );
        self.remember(&result);
        Ok(result)
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderResult, ExchangeError> {
        self.lookup(order_id)
            .ok_or_else(|| ExchangeError::Rejected(format!("unknown order {}", order_id)))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        // Paper orders fill on placement, nothing is ever resting
        match self.lookup(order_id) {
            Some(_) => Ok(()),
            None => Err(ExchangeError::Rejected(format!("unknown order {}", order_id))),
        }
    }

    async fn position_state(
        &self,
        _position: &Position,
    ) -> Result<ActualPositionState, ExchangeError> {
        Ok(ActualPositionState::Open)
    }
}
