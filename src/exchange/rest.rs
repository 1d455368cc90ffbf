//! CLOB REST price feed
//!
//! Read-only client for the public Polymarket CLOB endpoints:
//! - `GET /midpoint?token_id=`
//! - `GET /book?token_id=`
//! - `GET /prices-history?market=&interval=1h&fidelity=1`
//!
//! Order placement needs signed requests and is not available here.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{
    validate_price, ActualPositionState, ExchangeClient, ExchangeError, OrderRequest, OrderResult,
};
use crate::types::{Position, PricePoint, Quote};

#[derive(Debug, Deserialize)]
struct MidpointResponse {
    mid: Value,
}

#[derive(Debug, Deserialize)]
struct BookLevel {
    price: Value,
}

#[derive(Debug, Deserialize)]
struct BookResponse {
    #[serde(default)]
    bids: Vec<BookLevel>,
    #[serde(default)]
    asks: Vec<BookLevel>,
}

#[derive(Debug, Deserialize)]
struct PriceHistoryResponse {
    #[serde(default)]
    history: Vec<HistoryPoint>,
}

#[derive(Debug, Deserialize)]
struct HistoryPoint {
    t: i64,
    p: Value,
}

/// Prices come back either as JSON numbers or as decimal strings
fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn parse_midpoint(market_id: &str, body: MidpointResponse) -> Result<f64, ExchangeError> {
    let price = parse_number(&body.mid).ok_or_else(|| {
        ExchangeError::Transport(format!("unparseable midpoint for {}: {}", market_id, body.mid))
    })?;
    validate_price(market_id, price)
}

/// Best bid and ask from a book. An empty side counts as 0 (bids) or 1 (asks).
fn parse_book(market_id: &str, body: BookResponse) -> Result<Quote, ExchangeError> {
    let levels = |side: &[BookLevel]| -> Result<Vec<f64>, ExchangeError> {
        side.iter()
            .map(|level| {
                let price = parse_number(&level.price).ok_or_else(|| {
                    ExchangeError::Transport(format!(
                        "unparseable book price for {}: {}",
                        market_id, level.price
                    ))
                })?;
                validate_price(market_id, price)
            })
            .collect()
    };
    let bid = levels(&body.bids)?.into_iter().fold(0.0, f64::max);
    let ask = levels(&body.asks)?.into_iter().fold(1.0, f64::min);
    Ok(Quote::new(bid, ask))
}

fn parse_history(market_id: &str, body: PriceHistoryResponse) -> Vec<PricePoint> {
    let mut points: Vec<PricePoint> = body
        .history
        .into_iter()
        .filter_map(|point| {
            let timestamp = Utc.timestamp_opt(point.t, 0).single()?;
            let price = parse_number(&point.p)?;
            Some(PricePoint::new(market_id, timestamp, price))
        })
        .filter(PricePoint::is_valid)
        .collect();
    points.sort_by_key(|p| p.timestamp);
    points
}

/// REST price feed for Polymarket CLOB
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl RestClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn map_error(&self, err: reqwest::Error) -> ExchangeError {
        if err.is_timeout() {
            ExchangeError::Timeout(self.timeout)
        } else {
            ExchangeError::Transport(err.to_string())
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Transport(format!(
                "GET {} failed: {} {}",
                path, status, body
            )));
        }

        response.json::<T>().await.map_err(|e| self.map_error(e))
    }
}

#[async_trait]
impl ExchangeClient for RestClient {
    async fn get_price(&self, market_id: &str) -> Result<f64, ExchangeError> {
        let body: MidpointResponse = self
            .get_json("/midpoint", &[("token_id", market_id)])
            .await?;
        let price = parse_midpoint(market_id, body)?;
        debug!(market = %market_id, price, "[REST] Midpoint");
        Ok(price)
    }

    async fn get_quote(&self, market_id: &str) -> Result<Quote, ExchangeError> {
        let body: BookResponse = self.get_json("/book", &[("token_id", market_id)]).await?;
        let quote = parse_book(market_id, body)?;
        debug!(market = %market_id, bid = quote.bid, ask = quote.ask, "[REST] Book");
        Ok(quote)
    }

    async fn price_history(&self, market_id: &str) -> Result<Vec<PricePoint>, ExchangeError> {
        let body: PriceHistoryResponse = self
            .get_json(
                "/prices-history",
                &[("market", market_id), ("interval", "1h"), ("fidelity", "1")],
            )
            .await?;
        let points = parse_history(market_id, body);
        debug!(market = %market_id, points = points.len(), "[REST] Price history");
        Ok(points)
    }

    async fn place_order(&self, _request: OrderRequest) -> Result<OrderResult, ExchangeError> {
        Err(ExchangeError::Unsupported("place_order"))
    }

    async fn order_status(&self, _order_id: &str) -> Result<OrderResult, ExchangeError> {
        Err(ExchangeError::Unsupported("order_status"))
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<(), ExchangeError> {
        Err(ExchangeError::Unsupported("cancel_order"))
    }

    async fn position_state(
        &self,
        _position: &Position,
    ) -> Result<ActualPositionState, ExchangeError> {
        Err(ExchangeError::Unsupported("position_state"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midpoint_accepts_string_and_number() {
        let body: MidpointResponse = serde_json::from_str(r#"{"mid":"0.505"}"#).unwrap();
        assert_eq!(parse_midpoint("m", body), Ok(0.505));

        let body: MidpointResponse = serde_json::from_str(r#"{"mid":0.25}"#).unwrap();
        assert_eq!(parse_midpoint("m", body), Ok(0.25));
    }

    #[test]
    fn midpoint_out_of_range_is_invalid() {
        let body: MidpointResponse = serde_json::from_str(r#"{"mid":"1.7"}"#).unwrap();
        assert!(matches!(
            parse_midpoint("m", body),
            Err(ExchangeError::InvalidPrice { .. })
        ));
    }

    #[test]
    fn book_takes_best_levels() {
        let body: BookResponse = serde_json::from_str(
            r#"{"bids":[{"price":"0.45","size":"10"},{"price":"0.48","size":"5"}],
                "asks":[{"price":"0.55","size":"3"},{"price":"0.52","size":"8"}]}"#,
        )
        .unwrap();
        assert_eq!(parse_book("m", body), Ok(Quote::new(0.48, 0.52)));
    }

    #[test]
    fn empty_book_is_maximally_wide() {
        let body: BookResponse = serde_json::from_str(r#"{"bids":[],"asks":[]}"#).unwrap();
        let quote = parse_book("m", body).unwrap();
        assert_eq!(quote, Quote::new(0.0, 1.0));
        assert!(quote.spread_pct() > 1.0);
    }

    #[test]
    fn history_is_sorted_and_filtered() {
        let body: PriceHistoryResponse = serde_json::from_str(
            r#"{"history":[{"t":1700000060,"p":0.52},{"t":1700000000,"p":"0.50"},{"t":1700000120,"p":3.0}]}"#,
        )
        .unwrap();
        let points = parse_history("m", body);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].price, 0.50);
        assert_eq!(points[1].price, 0.52);
        assert!(points.iter().all(|p| p.market_id == "m"));
    }

    #[test]
    fn empty_history_body() {
        let body: PriceHistoryResponse = serde_json::from_str("{}").unwrap();
        assert!(parse_history("m", body).is_empty());
    }

    #[tokio::test]
    async fn order_endpoints_are_unsupported() {
        let client = RestClient::new("http://localhost:1/", Duration::from_millis(50)).unwrap();
        let result = client.cancel_order("abc").await;
        assert_eq!(result, Err(ExchangeError::Unsupported("cancel_order")));
    }
}
