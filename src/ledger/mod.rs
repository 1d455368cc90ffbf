//! Position Ledger
//!
//! Authoritative state of all positions, cash balance and the day's realized P&L.
//!
//! Implements:
//! - Capacity-limited position opening (debits balance)
//! - Closing with realized P&L (credits balance, accumulates daily P&L)
//! - Peak tracking for trailing stops
//! - Lazy UTC day rollover of the daily counters
//! - Snapshot / restore with validation, saved through a `StateStore` after every mutation
//! - Reconciliation of restored positions against the exchange's view

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::persistence::{load_json, save_json, CsvTradeLog, StateStore, StoreError};
use crate::types::{ExitReason, Position, PositionStatus, Side, TradeAction, TradeRecord};

/// Time source for rollover and timestamps
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("capacity exceeded: {max} positions already open")]
    CapacityExceeded { max: usize },
    #[error("position not found or already closed: {0}")]
    NotFound(String),
    #[error("invalid price {0}")]
    InvalidPrice(f64),
    #[error("invalid size {0}")]
    InvalidSize(f64),
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persisted risk state, mirrored field for field in the JSON snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub open_positions: BTreeMap<String, Position>,
    pub daily_realized_pnl: f64,
    pub daily_loss_limit_hit: bool,
    pub day_start_timestamp: DateTime<Utc>,
    pub balance: f64,
    pub daily_start_balance: f64,
}

impl RiskState {
    pub fn new(balance: f64, now: DateTime<Utc>) -> Self {
        Self {
            open_positions: BTreeMap::new(),
            daily_realized_pnl: 0.0,
            daily_loss_limit_hit: false,
            day_start_timestamp: start_of_day(now),
            balance,
            daily_start_balance: balance,
        }
    }
}

/// What the exchange says about a position we believe is open
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActualPositionState {
    Open,
    Closed { exit_price: f64 },
    /// The entry order never filled
    NeverFilled,
}

/// Summary for periodic status logging
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerStatus {
    pub open_positions: usize,
    pub max_positions: usize,
    pub balance: f64,
    pub daily_realized_pnl: f64,
    pub daily_loss_limit_hit: bool,
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub total_realized_pnl: f64,
}

impl LedgerStatus {
    pub fn win_rate(&self) -> f64 {
        if self.closed_trades == 0 {
            0.0
        } else {
            self.winning_trades as f64 / self.closed_trades as f64
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "open={}/{} balance=${:.2} daily_pnl=${:+.4} limit_hit={} trades={} win_rate={:.1}% total_pnl=${:+.4}",
            self.open_positions,
            self.max_positions,
            self.balance,
            self.daily_realized_pnl,
            self.daily_loss_limit_hit,
            self.closed_trades,
            self.win_rate() * 100.0,
            self.total_realized_pnl,
        )
    }
}

/// Closed positions and trade records kept in memory; the CSV log holds the rest
pub const DEFAULT_RECENT_LIMIT: usize = 500;

/// Lifetime counters, independent of how much history is kept
#[derive(Debug, Clone, Copy, Default)]
struct TradeTotals {
    closed_trades: usize,
    winning_trades: usize,
    realized_pnl: f64,
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or(now)
}

/// Single-writer position ledger
pub struct Ledger {
    state: RiskState,
    max_positions: usize,
    closed: Vec<Position>,
    history: Vec<TradeRecord>,
    recent_limit: usize,
    totals: TradeTotals,
    store: Option<Arc<dyn StateStore>>,
    trade_log: Option<Arc<CsvTradeLog>>,
    clock: Clock,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("state", &self.state)
            .field("max_positions", &self.max_positions)
            .field("closed_trades", &self.totals.closed_trades)
            .finish()
    }
}

impl Ledger {
    pub fn new(max_positions: usize, initial_balance: f64) -> Self {
        Self {
            state: RiskState::new(initial_balance, Utc::now()),
            max_positions,
            closed: Vec::new(),
            history: Vec::new(),
            recent_limit: DEFAULT_RECENT_LIMIT,
            totals: TradeTotals::default(),
            store: None,
            trade_log: None,
            clock: Arc::new(Utc::now),
        }
    }

    /// Persist every mutation through `store`
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Keep at most `limit` closed positions and trade records in memory
    pub fn with_recent_limit(mut self, limit: usize) -> Self {
        self.recent_limit = limit.max(1);
        self
    }

    /// Append every trade record to `log`
    pub fn with_trade_log(mut self, log: Arc<CsvTradeLog>) -> Self {
        self.trade_log = Some(log);
        self
    }

    /// Replace the time source. Re-stamps the current day, so call before `load`/`restore`.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.state.day_start_timestamp = start_of_day(clock());
        self.clock = clock;
        self
    }

    /// Restore the last snapshot from the store, if any.
    ///
    /// Returns whether a snapshot was found. A corrupt or invalid snapshot is an error.
    pub fn load(&mut self) -> Result<bool, LedgerError> {
        let Some(store) = self.store.clone() else {
            return Ok(false);
        };
        match load_json::<RiskState>(store.as_ref())? {
            Some(state) => {
                self.restore(state)?;
                info!(
                    open = self.state.open_positions.len(),
                    balance = self.state.balance,
                    "📂 [LEDGER] Restored risk state"
                );
                Ok(true)
            }
            None => {
                info!("📂 [LEDGER] No saved risk state, starting fresh");
                Ok(false)
            }
        }
    }

    // ============================================
    // Read views
    // ============================================

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.state.open_positions.values().cloned().collect()
    }

    pub fn position(&self, id: &str) -> Option<Position> {
        self.state.open_positions.get(id).cloned()
    }

    pub fn open_count(&self) -> usize {
        self.state.open_positions.len()
    }

    pub fn has_market(&self, market_id: &str) -> bool {
        self.state
            .open_positions
            .values()
            .any(|p| p.market_id == market_id)
    }

    pub fn balance(&self) -> f64 {
        self.state.balance
    }

    /// Most recently closed positions, oldest first
    pub fn closed_positions(&self) -> &[Position] {
        &self.closed
    }

    /// Most recent records written this run, oldest first
    pub fn trade_history(&self) -> &[TradeRecord] {
        &self.history
    }

    pub fn daily_realized_pnl(&self) -> f64 {
        if self.rollover_due() {
            0.0
        } else {
            self.state.daily_realized_pnl
        }
    }

    pub fn daily_loss_limit_hit(&self) -> bool {
        !self.rollover_due() && self.state.daily_loss_limit_hit
    }

    pub fn daily_start_balance(&self) -> f64 {
        if self.rollover_due() {
            self.state.balance
        } else {
            self.state.daily_start_balance
        }
    }

    pub fn snapshot(&self) -> RiskState {
        self.state.clone()
    }

    pub fn status(&self) -> LedgerStatus {
        LedgerStatus {
            open_positions: self.open_count(),
            max_positions: self.max_positions,
            balance: self.state.balance,
            daily_realized_pnl: self.daily_realized_pnl(),
            daily_loss_limit_hit: self.daily_loss_limit_hit(),
            closed_trades: self.totals.closed_trades,
            winning_trades: self.totals.winning_trades,
            total_realized_pnl: self.totals.realized_pnl,
        }
    }

    // ============================================
    // Mutations
    // ============================================

    pub fn open_position(
        &mut self,
        market_id: &str,
        side: Side,
        entry_price: f64,
        size_usd: f64,
    ) -> Result<Position, LedgerError> {
        if !(entry_price.is_finite() && entry_price > 0.0 && entry_price <= 1.0) {
            return Err(LedgerError::InvalidPrice(entry_price));
        }
        if !(size_usd.is_finite() && size_usd > 0.0) {
            return Err(LedgerError::InvalidSize(size_usd));
        }
        if self.state.open_positions.len() >= self.max_positions {
            return Err(LedgerError::CapacityExceeded {
                max: self.max_positions,
            });
        }
        self.apply_rollover();

        let now = self.now();
        let position = Position {
            id: Uuid::new_v4().to_string(),
            market_id: market_id.to_string(),
            side,
            entry_price,
            size_usd,
            shares: size_usd / entry_price,
            opened_at: now,
            status: PositionStatus::Open,
            peak_price: entry_price,
            realized_pnl: None,
            closed_at: None,
            exit_price: None,
            exit_reason: None,
        };

        self.state.balance -= size_usd;
        self.state
            .open_positions
            .insert(position.id.clone(), position.clone());

        info!(
            id = %position.id,
            market = %market_id,
            side = %side,
            price = entry_price,
            size_usd,
            "📥 [LEDGER] Position opened"
        );

        self.record(TradeRecord {
            timestamp: now,
            position_id: position.id.clone(),
            market_id: position.market_id.clone(),
            action: TradeAction::Open,
            side,
            price: entry_price,
            size_usd,
            pnl: None,
            reason: None,
        });
        self.persist();
        Ok(position)
    }

    pub fn close_position(
        &mut self,
        id: &str,
        exit_price: f64,
        reason: ExitReason,
    ) -> Result<TradeRecord, LedgerError> {
        if !exit_price.is_finite() || !(0.0..=1.0).contains(&exit_price) {
            return Err(LedgerError::InvalidPrice(exit_price));
        }
        let mut position = self
            .state
            .open_positions
            .remove(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        self.apply_rollover();

        let now = self.now();
        let pnl = position.pnl_at(exit_price);
        position.status = PositionStatus::Closed;
        position.realized_pnl = Some(pnl);
        position.closed_at = Some(now);
        position.exit_price = Some(exit_price);
        position.exit_reason = Some(reason);

        self.state.daily_realized_pnl += pnl;
        self.state.balance += position.size_usd + pnl;

        let emoji = if pnl >= 0.0 { "✅" } else { "❌" };
        info!(
            id = %position.id,
            market = %position.market_id,
            side = %position.side,
            entry = position.entry_price,
            exit = exit_price,
            pnl,
            reason = %reason,
            "{} [LEDGER] Position closed",
            emoji
        );

        let record = TradeRecord {
            timestamp: now,
            position_id: position.id.clone(),
            market_id: position.market_id.clone(),
            action: TradeAction::Close,
            side: position.side,
            price: exit_price,
            size_usd: position.size_usd,
            pnl: Some(pnl),
            reason: Some(reason.to_string()),
        };
        self.totals.closed_trades += 1;
        if pnl > 0.0 {
            self.totals.winning_trades += 1;
        }
        self.totals.realized_pnl += pnl;
        self.closed.push(position);
        trim_front(&mut self.closed, self.recent_limit);
        self.record(record.clone());
        self.persist();
        Ok(record)
    }

    /// Track the best price seen. Unknown ids and prices outside [0, 1] are ignored.
    pub fn update_peak(&mut self, id: &str, current_price: f64) {
        if !current_price.is_finite() || !(0.0..=1.0).contains(&current_price) {
            debug!(
                id = %id,
                price = current_price,
                "[LEDGER] Peak update with invalid price ignored"
            );
            return;
        }
        let Some(position) = self.state.open_positions.get_mut(id) else {
            debug!(id = %id, "[LEDGER] Peak update for unknown position ignored");
            return;
        };
        let peak = match position.side {
            Side::Long => position.peak_price.max(current_price),
            Side::Short => position.peak_price.min(current_price),
        };
        if peak != position.peak_price {
            position.peak_price = peak;
            self.persist();
        }
    }

    pub fn mark_daily_loss_limit_hit(&mut self) {
        self.apply_rollover();
        if self.state.daily_loss_limit_hit {
            return;
        }
        self.state.daily_loss_limit_hit = true;
        warn!(
            daily_pnl = self.state.daily_realized_pnl,
            basis = self.state.daily_start_balance,
            "🛑 [LEDGER] Daily loss limit hit, entries halted until next UTC day"
        );
        self.persist();
    }

    /// Reset daily counters when the UTC date has advanced. Returns whether it rolled.
    pub fn roll_day_if_needed(&mut self) -> bool {
        let rolled = self.apply_rollover();
        if rolled {
            self.persist();
        }
        rolled
    }

    /// Replace the state with a validated snapshot
    pub fn restore(&mut self, state: RiskState) -> Result<(), LedgerError> {
        if state.open_positions.len() > self.max_positions {
            return Err(LedgerError::InvalidSnapshot(format!(
                "{} open positions exceed the limit of {}",
                state.open_positions.len(),
                self.max_positions
            )));
        }
        if !state.balance.is_finite()
            || !state.daily_start_balance.is_finite()
            || !state.daily_realized_pnl.is_finite()
        {
            return Err(LedgerError::InvalidSnapshot(
                "non-finite balance or pnl".to_string(),
            ));
        }
        for (id, position) in &state.open_positions {
            if id != &position.id {
                return Err(LedgerError::InvalidSnapshot(format!(
                    "key {} does not match position id {}",
                    id, position.id
                )));
            }
            if position.status != PositionStatus::Open {
                return Err(LedgerError::InvalidSnapshot(format!(
                    "position {} is not open",
                    id
                )));
            }
            // Entries need a positive price to size shares; the peak can reach 0
            let entry_ok = position.entry_price.is_finite()
                && position.entry_price > 0.0
                && position.entry_price <= 1.0;
            let peak_ok =
                position.peak_price.is_finite() && (0.0..=1.0).contains(&position.peak_price);
            if !entry_ok || !peak_ok {
                return Err(LedgerError::InvalidSnapshot(format!(
                    "position {} has an invalid price",
                    id
                )));
            }
            if !(position.size_usd.is_finite() && position.size_usd > 0.0) {
                return Err(LedgerError::InvalidSnapshot(format!(
                    "position {} has a non-positive size",
                    id
                )));
            }
        }
        self.state = state;
        Ok(())
    }

    /// Align a restored position with what the exchange reports
    pub fn reconcile(
        &mut self,
        id: &str,
        actual: ActualPositionState,
    ) -> Result<Option<TradeRecord>, LedgerError> {
        match actual {
            ActualPositionState::Open => {
                if self.state.open_positions.contains_key(id) {
                    Ok(None)
                } else {
                    Err(LedgerError::NotFound(id.to_string()))
                }
            }
            ActualPositionState::Closed { exit_price } => self
                .close_position(id, exit_price, ExitReason::Reconciled)
                .map(Some),
            ActualPositionState::NeverFilled => {
                let mut position = self
                    .state
                    .open_positions
                    .remove(id)
                    .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
                self.apply_rollover();

                let now = self.now();
                self.state.balance += position.size_usd;
                position.status = PositionStatus::Closed;
                position.closed_at = Some(now);

                warn!(
                    id = %position.id,
                    market = %position.market_id,
                    "🔄 [LEDGER] Entry never filled, position voided"
                );

                let record = TradeRecord {
                    timestamp: now,
                    position_id: position.id.clone(),
                    market_id: position.market_id.clone(),
                    action: TradeAction::Void,
                    side: position.side,
                    price: position.entry_price,
                    size_usd: position.size_usd,
                    pnl: Some(0.0),
                    reason: Some("NEVER_FILLED".to_string()),
                };
                self.record(record.clone());
                self.persist();
                Ok(Some(record))
            }
        }
    }

    // ============================================
    // Internals
    // ============================================

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn rollover_due(&self) -> bool {
        self.now().date_naive() > self.state.day_start_timestamp.date_naive()
    }

    fn apply_rollover(&mut self) -> bool {
        if !self.rollover_due() {
            return false;
        }
        let now = self.now();
        info!(
            previous_day_pnl = self.state.daily_realized_pnl,
            balance = self.state.balance,
            "🌅 [LEDGER] New UTC day, daily counters reset"
        );
        self.state.daily_realized_pnl = 0.0;
        self.state.daily_loss_limit_hit = false;
        self.state.daily_start_balance = self.state.balance;
        self.state.day_start_timestamp = start_of_day(now);
        true
    }

    fn record(&mut self, record: TradeRecord) {
        if let Some(log) = &self.trade_log {
            if let Err(e) = log.append(&record) {
                warn!(error = %e, "⚠️ [LEDGER] Failed to append trade record");
            }
        }
        self.history.push(record);
        trim_front(&mut self.history, self.recent_limit);
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        match save_json(store.as_ref(), &self.state) {
            Ok(()) => debug!("💾 [LEDGER] Risk state saved"),
            Err(e) => warn!(error = %e, "⚠️ [LEDGER] Failed to save risk state"),
        }
    }
}

fn trim_front<T>(items: &mut Vec<T>, limit: usize) {
    if items.len() > limit {
        let excess = items.len() - limit;
        items.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use chrono::Duration;
    use std::sync::Mutex;

    fn ledger() -> Ledger {
        Ledger::new(3, 10.0)
    }

    struct FailingStore;

    impl StateStore for FailingStore {
        fn load_raw(&self) -> Result<Option<String>, StoreError> {
            Ok(None)
        }

        fn save_raw(&self, _contents: &str) -> Result<(), StoreError> {
            Err(StoreError::Io {
                path: "nowhere".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            })
        }
    }

    fn manual_clock(start: DateTime<Utc>) -> (Arc<Mutex<DateTime<Utc>>>, Clock) {
        let now = Arc::new(Mutex::new(start));
        let handle = now.clone();
        let clock: Clock = Arc::new(move || *handle.lock().unwrap());
        (now, clock)
    }

    #[test]
    fn fourth_position_is_rejected_without_changing_state() {
        let mut ledger = ledger();
        for market in ["a", "b", "c"] {
            ledger.open_position(market, Side::Long, 0.5, 0.5).unwrap();
        }
        let before = ledger.snapshot();

        let err = ledger.open_position("d", Side::Long, 0.5, 0.5).unwrap_err();
        assert!(matches!(err, LedgerError::CapacityExceeded { max: 3 }));
        assert_eq!(ledger.snapshot(), before);
        assert_eq!(ledger.open_count(), 3);
    }

    #[test]
    fn close_computes_pnl_and_updates_balance() {
        let mut ledger = ledger();
        let position = ledger.open_position("a", Side::Long, 0.50, 0.50).unwrap();
        assert!((ledger.balance() - 9.5).abs() < 1e-12);
        assert!((position.shares - 1.0).abs() < 1e-12);

        let record = ledger
            .close_position(&position.id, 0.425, ExitReason::StopLoss)
            .unwrap();

        let pnl = record.pnl.unwrap();
        assert!((pnl + 0.075).abs() < 1e-9);
        assert!((ledger.daily_realized_pnl() + 0.075).abs() < 1e-9);
        assert!((ledger.balance() - 9.925).abs() < 1e-9);
        assert_eq!(ledger.open_count(), 0);
        assert_eq!(ledger.closed_positions().len(), 1);
        assert_eq!(
            ledger.closed_positions()[0].exit_reason,
            Some(ExitReason::StopLoss)
        );
    }

    #[test]
    fn short_pnl_is_sign_flipped() {
        let mut ledger = ledger();
        let position = ledger.open_position("a", Side::Short, 0.50, 0.50).unwrap();
        let record = ledger
            .close_position(&position.id, 0.40, ExitReason::TakeProfit)
            .unwrap();
        assert!((record.pnl.unwrap() - 0.10).abs() < 1e-9);
    }

    #[test]
    fn closing_twice_is_not_found() {
        let mut ledger = ledger();
        let position = ledger.open_position("a", Side::Long, 0.5, 0.5).unwrap();
        ledger
            .close_position(&position.id, 0.5, ExitReason::Manual)
            .unwrap();
        let err = ledger
            .close_position(&position.id, 0.5, ExitReason::Manual)
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[test]
    fn peak_follows_side() {
        let mut ledger = ledger();
        let long = ledger.open_position("a", Side::Long, 0.40, 0.5).unwrap();
        let short = ledger.open_position("b", Side::Short, 0.40, 0.5).unwrap();

        ledger.update_peak(&long.id, 0.60);
        ledger.update_peak(&long.id, 0.55);
        ledger.update_peak(&short.id, 0.30);
        ledger.update_peak(&short.id, 0.35);
        ledger.update_peak("missing", 0.9);

        assert_eq!(ledger.position(&long.id).unwrap().peak_price, 0.60);
        assert_eq!(ledger.position(&short.id).unwrap().peak_price, 0.30);
    }

    #[test]
    fn snapshot_restore_is_identical() {
        let mut ledger = ledger();
        let a = ledger.open_position("a", Side::Long, 0.5, 0.5).unwrap();
        ledger.open_position("b", Side::Short, 0.3, 0.5).unwrap();
        ledger.update_peak(&a.id, 0.55);
        let snapshot = ledger.snapshot();

        let mut restored = Ledger::new(3, 10.0);
        restored.restore(snapshot.clone()).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
        assert!(restored.has_market("b"));
    }

    #[test]
    fn restore_rejects_invalid_snapshots() {
        let mut source = Ledger::new(4, 10.0);
        for market in ["a", "b", "c", "d"] {
            source.open_position(market, Side::Long, 0.5, 0.5).unwrap();
        }
        let mut ledger = ledger();
        assert!(matches!(
            ledger.restore(source.snapshot()),
            Err(LedgerError::InvalidSnapshot(_))
        ));

        let mut bad_price = ledger.snapshot();
        let mut position = source.open_positions()[0].clone();
        position.entry_price = 1.5;
        bad_price
            .open_positions
            .insert(position.id.clone(), position);
        assert!(matches!(
            ledger.restore(bad_price),
            Err(LedgerError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn mutations_are_persisted_and_reloaded() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let mut ledger = ledger().with_store(store.clone());
        let position = ledger.open_position("a", Side::Long, 0.5, 0.5).unwrap();

        let mut reloaded = Ledger::new(3, 10.0).with_store(store);
        assert!(reloaded.load().unwrap());
        assert_eq!(reloaded.snapshot(), ledger.snapshot());
        assert!(reloaded.position(&position.id).is_some());
    }

    #[test]
    fn corrupt_store_fails_to_load() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::with_contents("{ nope"));
        let mut ledger = ledger().with_store(store);
        assert!(matches!(
            ledger.load(),
            Err(LedgerError::Store(StoreError::Corrupt(_)))
        ));
    }

    #[test]
    fn save_failure_keeps_in_memory_mutation() {
        let mut ledger = ledger().with_store(Arc::new(FailingStore));
        ledger.open_position("a", Side::Long, 0.5, 0.5).unwrap();
        assert_eq!(ledger.open_count(), 1);
    }

    #[test]
    fn reconcile_handles_each_exchange_state() {
        let mut ledger = ledger();
        let open = ledger.open_position("a", Side::Long, 0.5, 0.5).unwrap();
        let closed = ledger.open_position("b", Side::Long, 0.5, 0.5).unwrap();
        let unfilled = ledger.open_position("c", Side::Long, 0.5, 0.5).unwrap();

        assert!(ledger
            .reconcile(&open.id, ActualPositionState::Open)
            .unwrap()
            .is_none());

        let record = ledger
            .reconcile(&closed.id, ActualPositionState::Closed { exit_price: 0.6 })
            .unwrap()
            .unwrap();
        assert_eq!(record.action, TradeAction::Close);
        assert_eq!(record.reason.as_deref(), Some("RECONCILED"));

        let record = ledger
            .reconcile(&unfilled.id, ActualPositionState::NeverFilled)
            .unwrap()
            .unwrap();
        assert_eq!(record.action, TradeAction::Void);
        assert_eq!(record.pnl, Some(0.0));

        assert_eq!(ledger.open_count(), 1);
        // 10 - 1.5 + (0.5 + 0.1) + 0.5
        assert!((ledger.balance() - 9.6).abs() < 1e-9);
    }

    #[test]
    fn day_rollover_clears_limit_and_pnl() {
        let day_one = Utc.with_ymd_and_hms(2024, 3, 1, 22, 0, 0).unwrap();
        let (now, clock) = manual_clock(day_one);
        let mut ledger = ledger().with_clock(clock);

        let position = ledger.open_position("a", Side::Long, 0.5, 0.5).unwrap();
        ledger
            .close_position(&position.id, 0.4, ExitReason::StopLoss)
            .unwrap();
        ledger.mark_daily_loss_limit_hit();
        assert!(ledger.daily_loss_limit_hit());
        assert!(ledger.daily_realized_pnl() < 0.0);

        *now.lock().unwrap() = day_one + Duration::hours(3);

        // Reads report the new day before any mutation
        assert!(!ledger.daily_loss_limit_hit());
        assert_eq!(ledger.daily_realized_pnl(), 0.0);
        assert!(ledger.snapshot().daily_loss_limit_hit);

        assert!(ledger.roll_day_if_needed());
        let state = ledger.snapshot();
        assert!(!state.daily_loss_limit_hit);
        assert_eq!(state.daily_realized_pnl, 0.0);
        assert!((state.daily_start_balance - state.balance).abs() < 1e-12);
        assert_eq!(
            state.day_start_timestamp,
            Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()
        );
        assert!(!ledger.roll_day_if_needed());
    }

    #[test]
    fn open_rejects_non_positive_or_nan_size() {
        let mut ledger = ledger();
        for size in [0.0, -0.5, f64::NAN] {
            assert!(matches!(
                ledger.open_position("a", Side::Long, 0.5, size),
                Err(LedgerError::InvalidSize(_))
            ));
        }
        assert_eq!(ledger.open_count(), 0);
        assert_eq!(ledger.balance(), 10.0);
    }

    #[test]
    fn short_peak_at_zero_survives_reload() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let mut ledger = ledger().with_store(store.clone());
        let position = ledger.open_position("a", Side::Short, 0.5, 0.5).unwrap();

        // Market resolved to zero, exit order never went through
        ledger.update_peak(&position.id, 0.0);
        ledger.update_peak(&position.id, f64::NAN);
        assert_eq!(ledger.position(&position.id).unwrap().peak_price, 0.0);

        let mut reloaded = Ledger::new(3, 10.0).with_store(store);
        assert!(reloaded.load().unwrap());
        assert_eq!(reloaded.position(&position.id).unwrap().peak_price, 0.0);
    }

    #[test]
    fn recent_history_is_capped_but_totals_are_not() {
        let mut ledger = Ledger::new(3, 10.0).with_recent_limit(2);
        for (market, exit) in [("a", 0.6), ("b", 0.4), ("c", 0.7)] {
            let position = ledger.open_position(market, Side::Long, 0.5, 0.5).unwrap();
            ledger
                .close_position(&position.id, exit, ExitReason::Manual)
                .unwrap();
        }

        assert_eq!(ledger.closed_positions().len(), 2);
        assert_eq!(ledger.closed_positions()[0].market_id, "b");
        assert_eq!(ledger.trade_history().len(), 2);
        assert_eq!(ledger.trade_history()[1].action, TradeAction::Close);

        let status = ledger.status();
        assert_eq!(status.closed_trades, 3);
        assert_eq!(status.winning_trades, 2);
        // +0.1 - 0.1 + 0.2
        assert!((status.total_realized_pnl - 0.2).abs() < 1e-9);
    }

    #[test]
    fn history_records_open_and_close() {
        let mut ledger = ledger();
        let position = ledger.open_position("a", Side::Long, 0.5, 0.5).unwrap();
        ledger
            .close_position(&position.id, 0.55, ExitReason::TakeProfit)
            .unwrap();
        let actions: Vec<TradeAction> = ledger.trade_history().iter().map(|r| r.action).collect();
        assert_eq!(actions, vec![TradeAction::Open, TradeAction::Close]);

        let status = ledger.status();
        assert_eq!(status.closed_trades, 1);
        assert_eq!(status.winning_trades, 1);
    }
}
