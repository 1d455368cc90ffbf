//! Trade Orchestrator - the control loop
//!
//! Each cycle:
//! 1. Roll the ledger's day if the UTC date changed
//! 2. Recheck orders whose outcome was unknown after cancel
//! 3. Poll prices (bounded, retried with exponential backoff)
//! 4. Feed prices to the signal engine
//! 5. Exits first: stop-loss / take-profit / trailing stop
//! 6. Entries: signal -> risk decision -> book check -> order -> confirmed fill -> ledger

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::exchange::{ExchangeClient, ExchangeError, OrderRequest, OrderStatus};
use crate::ledger::{Ledger, LedgerError};
use crate::risk::{DecisionReason, ExitInstruction, RiskManager};
use crate::signal::SignalEngine;
use crate::types::{ExitReason, Position, PricePoint, Side, TradeRecord};

/// Loop timing and limits
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub markets: Vec<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub fill_timeout: Duration,
    pub fill_poll_interval: Duration,
    pub max_retries: usize,
    pub retry_backoff: Duration,
    pub max_entries_per_cycle: usize,
    pub status_every_cycles: u64,
    pub warmup_from_history: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            markets: Vec::new(),
            poll_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            fill_timeout: Duration::from_secs(15),
            fill_poll_interval: Duration::from_secs(1),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            max_entries_per_cycle: 1,
            status_every_cycles: 30,
            warmup_from_history: true,
        }
    }
}

impl From<&AppConfig> for OrchestratorConfig {
    fn from(cfg: &AppConfig) -> Self {
        let exec = &cfg.execution;
        let fill_timeout = Duration::from_millis(exec.fill_timeout_ms);
        Self {
            markets: cfg.bot.markets.clone(),
            poll_interval: Duration::from_secs(exec.poll_interval_secs),
            request_timeout: Duration::from_millis(exec.request_timeout_ms),
            fill_timeout,
            fill_poll_interval: (fill_timeout / 10).max(Duration::from_millis(100)),
            max_retries: exec.max_retries,
            retry_backoff: Duration::from_millis(exec.retry_backoff_ms),
            max_entries_per_cycle: exec.max_entries_per_cycle,
            status_every_cycles: exec.status_every_cycles,
            warmup_from_history: cfg.strategy.warmup_from_history,
        }
    }
}

/// What happened during one cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub prices: HashMap<String, f64>,
    pub price_failures: Vec<String>,
    pub closed: Vec<TradeRecord>,
    pub exits_failed: usize,
    pub opened: Vec<Position>,
    pub entries_failed: usize,
    pub denials: Vec<(String, DecisionReason)>,
    pub daily_limit_hit: bool,
    /// Orders still unresolved at the end of the cycle
    pub unresolved_orders: usize,
}

/// What an order placed by the engine was for
#[derive(Debug, Clone, PartialEq)]
pub enum OrderIntent {
    Entry {
        market_id: String,
        side: Side,
        size_usd: f64,
    },
    Exit {
        position_id: String,
        reason: ExitReason,
    },
}

/// Order whose state could not be read after cancel. Rechecked every cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct UnresolvedOrder {
    pub order_id: String,
    pub intent: OrderIntent,
}

enum FillOutcome {
    Filled(f64),
    Unfilled,
    /// Cancel was sent but the final state is unknown
    Unknown(String),
}

pub struct TradeOrchestrator {
    config: OrchestratorConfig,
    exchange: Arc<dyn ExchangeClient>,
    signals: SignalEngine,
    risk: RiskManager,
    ledger: Ledger,
    unresolved: Vec<UnresolvedOrder>,
    cycles: u64,
}

impl TradeOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        exchange: Arc<dyn ExchangeClient>,
        signals: SignalEngine,
        risk: RiskManager,
        ledger: Ledger,
    ) -> Self {
        Self {
            config,
            exchange,
            signals,
            risk,
            ledger,
            unresolved: Vec::new(),
            cycles: 0,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    pub fn signals(&self) -> &SignalEngine {
        &self.signals
    }

    pub fn signals_mut(&mut self) -> &mut SignalEngine {
        &mut self.signals
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn unresolved_orders(&self) -> &[UnresolvedOrder] {
        &self.unresolved
    }

    // ============================================
    // Startup
    // ============================================

    /// Seed signal windows from recent price history. Returns points loaded.
    pub async fn warm_up(&mut self) -> usize {
        if !self.config.warmup_from_history {
            return 0;
        }
        let mut total = 0;
        for market in self.config.markets.clone() {
            match self.bounded(self.exchange.price_history(&market)).await {
                Ok(points) => {
                    let accepted = self.signals.seed(&market, points);
                    info!(market = %market, points = accepted, "🔥 [WARMUP] Window seeded");
                    total += accepted;
                }
                Err(e) => warn!(market = %market, error = %e, "⚠️ [WARMUP] History unavailable"),
            }
        }
        total
    }

    /// Align restored open positions with the exchange. Returns positions changed.
    pub async fn reconcile_open_positions(&mut self) -> usize {
        let mut changed = 0;
        for position in self.ledger.open_positions() {
            let actual = match self.bounded(self.exchange.position_state(&position)).await {
                Ok(actual) => actual,
                Err(e) => {
                    warn!(
                        id = %position.id,
                        market = %position.market_id,
                        error = %e,
                        "⚠️ [RECONCILE] Exchange state unknown, keeping position open"
                    );
                    continue;
                }
            };
            match self.ledger.reconcile(&position.id, actual) {
                Ok(Some(record)) => {
                    info!(
                        id = %position.id,
                        action = %record.action,
                        "🔄 [RECONCILE] Position updated from exchange"
                    );
                    changed += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(id = %position.id, error = %e, "⚠️ [RECONCILE] Failed"),
            }
        }
        // Closing on reconcile can breach the daily cap
        self.risk.enforce_daily_loss_limit(&mut self.ledger);
        changed
    }

    // ============================================
    // Main loop
    // ============================================

    /// Run cycles until `shutdown` resolves
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            markets = self.config.markets.len(),
            interval_secs = self.config.poll_interval.as_secs(),
            "🚀 [ENGINE] Trading loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(cycles = self.cycles, "🛑 [ENGINE] Shutdown requested, stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    debug!(
                        cycle = report.cycle,
                        prices = report.prices.len(),
                        opened = report.opened.len(),
                        closed = report.closed.len(),
                        "[ENGINE] Cycle complete"
                    );
                }
            }
        }
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycles += 1;
        let mut report = CycleReport {
            cycle: self.cycles,
            ..Default::default()
        };

        self.ledger.roll_day_if_needed();
        self.resolve_orders(&mut report).await;

        // Configured markets plus anything we still hold
        let mut markets = self.config.markets.clone();
        for position in self.ledger.open_positions() {
            if !markets.contains(&position.market_id) {
                markets.push(position.market_id);
            }
        }

        for market in &markets {
            match self.fetch_price(market).await {
                Ok(price) => {
                    self.signals
                        .record(PricePoint::new(market.as_str(), Utc::now(), price));
                    report.prices.insert(market.clone(), price);
                }
                Err(e) => {
                    warn!(market = %market, error = %e, "⚠️ [PRICE] Fetch failed, skipping market this cycle");
                    report.price_failures.push(market.clone());
                }
            }
        }

        // Exits first
        let exits = self.risk.evaluate_exits(&mut self.ledger, &report.prices);
        for exit in exits {
            if self.exit_in_flight(&exit.position_id) {
                debug!(id = %exit.position_id, "[EXIT] Previous exit order unresolved, waiting");
                continue;
            }
            match self.execute_exit(&exit).await {
                Some(record) => report.closed.push(record),
                None => report.exits_failed += 1,
            }
        }

        // Then entries
        for market in self.config.markets.clone() {
            if report.opened.len() >= self.config.max_entries_per_cycle {
                break;
            }
            let Some(&price) = report.prices.get(&market) else {
                continue;
            };
            if price <= 0.0 {
                debug!(market = %market, "[ENTRY] No entry at a zero price");
                continue;
            }
            if self.entry_in_flight(&market) {
                debug!(market = %market, "[ENTRY] Previous entry order unresolved, waiting");
                continue;
            }

            let result = self.signals.evaluate(&market);
            let decision = self.risk.evaluate_entry(result.signal, &market, &self.ledger);
            if !decision.allow {
                debug!(
                    market = %market,
                    score = result.score,
                    reason = %decision.reason,
                    "[RISK] Entry denied"
                );
                report.denials.push((market.clone(), decision.reason));
                if decision.reason.ends_entry_scan() {
                    break;
                }
                continue;
            }
            let Some(side) = result.signal.side() else {
                continue;
            };

            let quote = match self.bounded(self.exchange.get_quote(&market)).await {
                Ok(quote) => quote,
                Err(e) => {
                    debug!(market = %market, error = %e, "[RISK] No book, entry skipped");
                    report.denials.push((market.clone(), DecisionReason::NoQuote));
                    continue;
                }
            };
            let edge = match self.risk.evaluate_edge(side, price, result.mean, &quote) {
                Ok(edge) => edge,
                Err(reason) => {
                    debug!(
                        market = %market,
                        bid = quote.bid,
                        ask = quote.ask,
                        mean = result.mean,
                        reason = %reason,
                        "[RISK] Entry denied on book"
                    );
                    report.denials.push((market.clone(), reason));
                    continue;
                }
            };

            info!(
                market = %market,
                signal = %result.signal,
                score = result.score,
                price,
                mean = result.mean,
                spread_pct = edge.spread_pct,
                net_ev = edge.net_ev,
                "{} [SIGNAL] Entry approved",
                if side == Side::Long { "📈" } else { "📉" }
            );

            match self
                .execute_entry(&market, side, decision.size_usd, price)
                .await
            {
                Some(position) => report.opened.push(position),
                None => report.entries_failed += 1,
            }
        }

        report.daily_limit_hit = self.ledger.daily_loss_limit_hit();
        report.unresolved_orders = self.unresolved.len();

        if self.config.status_every_cycles > 0 && self.cycles % self.config.status_every_cycles == 0
        {
            info!(cycle = self.cycles, "📊 [STATUS] {}", self.ledger.status());
        }

        report
    }

    // ============================================
    // Execution
    // ============================================

    async fn execute_exit(&mut self, exit: &ExitInstruction) -> Option<TradeRecord> {
        let position = self.ledger.position(&exit.position_id)?;
        let request = OrderRequest {
            market_id: position.market_id.clone(),
            side: position.side.exit_order(),
            size_usd: position.size_usd,
            limit_price: Some(exit.price),
        };

        match self.place_and_confirm(request).await {
            FillOutcome::Filled(fill_price) => {
                self.apply_exit_fill(&position.id, fill_price, exit.reason)
            }
            FillOutcome::Unfilled => {
                warn!(
                    id = %position.id,
                    market = %position.market_id,
                    reason = %exit.reason,
                    "⚠️ [EXIT] Exit not filled, position stays open"
                );
                None
            }
            FillOutcome::Unknown(order_id) => {
                self.track_unresolved(
                    order_id,
                    OrderIntent::Exit {
                        position_id: position.id.clone(),
                        reason: exit.reason,
                    },
                );
                None
            }
        }
    }

    async fn execute_entry(
        &mut self,
        market: &str,
        side: Side,
        size_usd: f64,
        price: f64,
    ) -> Option<Position> {
        let request = OrderRequest {
            market_id: market.to_string(),
            side: side.entry_order(),
            size_usd,
            limit_price: Some(price),
        };

        match self.place_and_confirm(request).await {
            FillOutcome::Filled(fill_price) => {
                self.apply_entry_fill(market, side, fill_price, size_usd)
            }
            FillOutcome::Unfilled => None,
            FillOutcome::Unknown(order_id) => {
                self.track_unresolved(
                    order_id,
                    OrderIntent::Entry {
                        market_id: market.to_string(),
                        side,
                        size_usd,
                    },
                );
                None
            }
        }
    }

    fn apply_exit_fill(
        &mut self,
        position_id: &str,
        fill_price: f64,
        reason: ExitReason,
    ) -> Option<TradeRecord> {
        match self.ledger.close_position(position_id, fill_price, reason) {
            Ok(record) => {
                self.risk.enforce_daily_loss_limit(&mut self.ledger);
                Some(record)
            }
            Err(e) => {
                warn!(id = %position_id, error = %e, "⚠️ [EXIT] Ledger close failed");
                None
            }
        }
    }

    fn apply_entry_fill(
        &mut self,
        market: &str,
        side: Side,
        fill_price: f64,
        size_usd: f64,
    ) -> Option<Position> {
        match self.ledger.open_position(market, side, fill_price, size_usd) {
            Ok(position) => Some(position),
            Err(LedgerError::CapacityExceeded { max }) => {
                warn!(market = %market, max, "⚠️ [ENTRY] Filled but ledger is at capacity");
                None
            }
            Err(e) => {
                warn!(market = %market, error = %e, "⚠️ [ENTRY] Ledger open failed");
                None
            }
        }
    }

    // ============================================
    // Orders with unknown outcome
    // ============================================

    fn track_unresolved(&mut self, order_id: String, intent: OrderIntent) {
        error!(
            order_id = %order_id,
            intent = ?intent,
            "🚨 [ORDER] Order state unknown after cancel, will recheck next cycle"
        );
        self.unresolved.push(UnresolvedOrder { order_id, intent });
    }

    fn exit_in_flight(&self, position_id: &str) -> bool {
        self.unresolved.iter().any(|o| {
            matches!(&o.intent, OrderIntent::Exit { position_id: id, .. } if id == position_id)
        })
    }

    fn entry_in_flight(&self, market: &str) -> bool {
        self.unresolved.iter().any(|o| {
            matches!(&o.intent, OrderIntent::Entry { market_id, .. } if market_id == market)
        })
    }

    /// Settle orders left unknown by earlier cycles. A fill is applied to the ledger.
    async fn resolve_orders(&mut self, report: &mut CycleReport) {
        for order in std::mem::take(&mut self.unresolved) {
            let result = match self.bounded(self.exchange.order_status(&order.order_id)).await {
                Ok(result) => result,
                Err(e) => {
                    error!(order_id = %order.order_id, error = %e, "🚨 [ORDER] Order state still unknown");
                    self.unresolved.push(order);
                    continue;
                }
            };

            match result.status {
                OrderStatus::Filled { price, .. } => {
                    info!(order_id = %order.order_id, price, "🔄 [ORDER] Late fill recovered");
                    match order.intent {
                        OrderIntent::Entry {
                            market_id,
                            side,
                            size_usd,
                        } => {
                            if let Some(position) =
                                self.apply_entry_fill(&market_id, side, price, size_usd)
                            {
                                report.opened.push(position);
                            }
                        }
                        OrderIntent::Exit {
                            position_id,
                            reason,
                        } => {
                            if let Some(record) = self.apply_exit_fill(&position_id, price, reason)
                            {
                                report.closed.push(record);
                            }
                        }
                    }
                }
                OrderStatus::Pending => {
                    if let Err(e) = self.bounded(self.exchange.cancel_order(&order.order_id)).await {
                        warn!(order_id = %order.order_id, error = %e, "⚠️ [ORDER] Cancel failed, will recheck");
                        self.unresolved.push(order);
                    } else {
                        info!(order_id = %order.order_id, "[ORDER] Resting order cancelled");
                    }
                }
                OrderStatus::Rejected { reason } => {
                    info!(order_id = %order.order_id, reason = %reason, "[ORDER] Order resolved unfilled");
                }
            }
        }
    }

    /// Place an order and wait for a confirmed fill. Never retried blindly.
    async fn place_and_confirm(&self, request: OrderRequest) -> FillOutcome {
        let market = request.market_id.clone();
        let placed = match self.bounded(self.exchange.place_order(request)).await {
            Ok(placed) => placed,
            Err(e) => {
                warn!(market = %market, error = %e, "⚠️ [ORDER] Placement failed");
                return FillOutcome::Unfilled;
            }
        };

        match placed.status {
            OrderStatus::Filled { price, .. } => FillOutcome::Filled(price),
            OrderStatus::Rejected { reason } => {
                warn!(market = %market, order_id = %placed.order_id, reason = %reason, "⚠️ [ORDER] Rejected");
                FillOutcome::Unfilled
            }
            OrderStatus::Pending => self.await_fill(&placed.order_id).await,
        }
    }

    async fn await_fill(&self, order_id: &str) -> FillOutcome {
        let deadline = Instant::now() + self.config.fill_timeout;

        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(self.config.fill_poll_interval.min(remaining)).await;

            match self.bounded(self.exchange.order_status(order_id)).await {
                Ok(result) => match result.status {
                    OrderStatus::Filled { price, .. } => return FillOutcome::Filled(price),
                    OrderStatus::Rejected { reason } => {
                        warn!(order_id = %order_id, reason = %reason, "⚠️ [ORDER] Rejected while pending");
                        return FillOutcome::Unfilled;
                    }
                    OrderStatus::Pending => {}
                },
                Err(e) => debug!(order_id = %order_id, error = %e, "[ORDER] Status check failed"),
            }
        }

        if let Err(e) = self.bounded(self.exchange.cancel_order(order_id)).await {
            warn!(order_id = %order_id, error = %e, "⚠️ [ORDER] Cancel failed");
        }

        // A fill can land between the last poll and the cancel
        match self.bounded(self.exchange.order_status(order_id)).await {
            Ok(result) => match result.fill_price() {
                Some(price) => FillOutcome::Filled(price),
                None => FillOutcome::Unfilled,
            },
            Err(e) => {
                debug!(order_id = %order_id, error = %e, "[ORDER] Final status check failed");
                FillOutcome::Unknown(order_id.to_string())
            }
        }
    }

    async fn fetch_price(&self, market: &str) -> Result<f64, ExchangeError> {
        let attempts = self.config.max_retries.max(1);
        let mut attempt = 0;
        loop {
            match self.bounded(self.exchange.get_price(market)).await {
                Ok(price) => return Ok(price),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt as u32);
                    debug!(
                        market = %market,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "[PRICE] Retrying"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Bound an exchange call by the request timeout
    async fn bounded<T, F>(&self, call: F) -> Result<T, ExchangeError>
    where
        F: Future<Output = Result<T, ExchangeError>>,
    {
        match timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(self.config.request_timeout)),
        }
    }
}
