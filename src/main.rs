//! pmbot - mean-reversion trading agent for Polymarket
//!
//! Polls CLOB mid prices, trades z-score extremes with small fixed-size orders and
//! enforces stop-loss, take-profit, trailing stop and a daily loss limit.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pmbot::config::AppConfig;
use pmbot::exchange::{ExchangeClient, PaperExchange, RestClient};
use pmbot::ledger::Ledger;
use pmbot::orchestrator::{OrchestratorConfig, TradeOrchestrator};
use pmbot::persistence::{CsvTradeLog, JsonFileStore, StateStore};
use pmbot::risk::{RiskLimits, RiskManager};
use pmbot::signal::SignalEngine;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(config.bot.log_json);

    config.validate().context("Invalid configuration")?;
    info!("🤖 pmbot starting: {}", config);

    if config.bot.markets.is_empty() {
        bail!("No markets configured (set bot.markets or PMBOT__BOT__MARKETS)");
    }
    if !config.bot.dry_run {
        bail!("Live order placement is not available; set bot.dry_run = true");
    }
    warn!("📝 DRY RUN: orders are simulated at the observed mid price");

    // Persistence
    let data_dir = Path::new(&config.persistence.data_dir);
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;
    let store: Arc<dyn StateStore> =
        Arc::new(JsonFileStore::new(data_dir.join(&config.persistence.state_file)));
    let trade_log = Arc::new(CsvTradeLog::open(
        data_dir.join(&config.persistence.history_file),
    )?);

    // Ledger: a corrupt snapshot must stop us before any trading
    let mut ledger = Ledger::new(config.risk.max_positions, config.risk.initial_balance)
        .with_store(store)
        .with_trade_log(trade_log);
    ledger
        .load()
        .context("Refusing to trade: saved risk state could not be restored")?;
    info!("📊 [LEDGER] {}", ledger.status());

    // Exchange
    let feed: Arc<dyn ExchangeClient> = Arc::new(RestClient::new(
        &config.execution.clob_url,
        Duration::from_millis(config.execution.request_timeout_ms),
    )?);
    let exchange: Arc<dyn ExchangeClient> = Arc::new(PaperExchange::new(feed));

    let mut orchestrator = TradeOrchestrator::new(
        OrchestratorConfig::from(&config),
        exchange,
        SignalEngine::from_config(&config.strategy),
        RiskManager::new(RiskLimits::from(&config.risk)),
        ledger,
    );

    orchestrator.warm_up().await;
    orchestrator.reconcile_open_positions().await;

    orchestrator
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("👋 Final status: {}", orchestrator.ledger().status());
    Ok(())
}
