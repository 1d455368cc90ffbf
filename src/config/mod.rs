//! Configuration management for pmbot
//!
//! Loads from YAML/TOML files + environment variables via .env

mod types;

pub use types::*;

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Bot version tag for logging
    pub tag: String,
    /// CLOB token ids to trade
    pub markets: Vec<String>,
    /// Dry run mode (paper fills, no real orders)
    pub dry_run: bool,
    /// Emit logs as JSON lines
    pub log_json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Rolling window length per market
    pub window_size: usize,
    /// Buy when z-score drops below this (oversold)
    pub zscore_buy_threshold: f64,
    /// Sell when z-score rises above this (overbought)
    pub zscore_sell_threshold: f64,
    /// Seed windows from exchange price history at startup
    pub warmup_from_history: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Fixed size of every entry in USDC
    pub max_trade_usd: f64,
    /// Maximum concurrent open positions
    pub max_positions: usize,
    /// Stop loss as a fraction of entry (0.15 = 15%)
    pub stop_loss_pct: f64,
    /// Take profit as a fraction of entry
    pub take_profit_pct: f64,
    /// Trailing stop retrace from peak
    pub trailing_stop_pct: f64,
    /// Daily realized loss, as a fraction of the day's starting balance, that halts entries
    pub max_daily_loss_pct: f64,
    /// Starting balance in USDC when no snapshot exists
    pub initial_balance: f64,
    /// Open positions allowed per category
    pub max_positions_per_category: usize,
    /// Category name -> token ids, to avoid stacking correlated markets
    #[serde(default)]
    pub categories: HashMap<String, Vec<String>>,
    /// Widest bid/ask spread accepted, as a fraction of the mid (0.05 = 5%)
    pub max_spread_pct: f64,
    /// Trading fee estimate
    pub fee_rate: f64,
    /// Slippage estimate
    pub slippage_estimate: f64,
    /// Minimum expected edge after costs
    pub min_net_ev: f64,
}

impl RiskConfig {
    /// Token id -> category
    pub fn market_categories(&self) -> HashMap<String, String> {
        self.categories
            .iter()
            .flat_map(|(category, markets)| {
                markets
                    .iter()
                    .map(move |market| (market.clone(), category.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// CLOB API endpoint
    pub clob_url: String,
    /// Main loop interval in seconds
    pub poll_interval_secs: u64,
    /// Upper bound for any single exchange call in milliseconds
    pub request_timeout_ms: u64,
    /// How long a pending entry may wait for a fill
    pub fill_timeout_ms: u64,
    /// Attempts for market data requests
    pub max_retries: usize,
    /// Base backoff between market data attempts (doubles each attempt)
    pub retry_backoff_ms: u64,
    /// Entries allowed per cycle
    pub max_entries_per_cycle: usize,
    /// Log a status summary every N cycles
    pub status_every_cycles: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory
    pub data_dir: String,
    /// Risk state snapshot file name (inside data_dir)
    pub state_file: String,
    /// Trade history CSV file name (inside data_dir)
    pub history_file: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.markets", Vec::<String>::new())?
            .set_default("bot.dry_run", true)?
            .set_default("bot.log_json", false)?
            // Strategy defaults
            .set_default("strategy.window_size", 20)?
            .set_default("strategy.zscore_buy_threshold", -1.2)?
            .set_default("strategy.zscore_sell_threshold", 1.2)?
            .set_default("strategy.warmup_from_history", true)?
            // Risk defaults ($10 budget)
            .set_default("risk.max_trade_usd", 0.50)?
            .set_default("risk.max_positions", 3)?
            .set_default("risk.stop_loss_pct", 0.15)?
            .set_default("risk.take_profit_pct", 0.25)?
            .set_default("risk.trailing_stop_pct", 0.10)?
            .set_default("risk.max_daily_loss_pct", 0.02)?
            .set_default("risk.initial_balance", 10.0)?
            .set_default("risk.max_positions_per_category", 1)?
            .set_default("risk.max_spread_pct", 0.05)?
            .set_default("risk.fee_rate", 0.002)?
            .set_default("risk.slippage_estimate", 0.005)?
            .set_default("risk.min_net_ev", 0.01)?
            // Execution defaults
            .set_default("execution.clob_url", "https://clob.polymarket.com")?
            .set_default("execution.poll_interval_secs", 10)?
            .set_default("execution.request_timeout_ms", 10_000)?
            .set_default("execution.fill_timeout_ms", 15_000)?
            .set_default("execution.max_retries", 3)?
            .set_default("execution.retry_backoff_ms", 1_000)?
            .set_default("execution.max_entries_per_cycle", 1)?
            .set_default("execution.status_every_cycles", 30)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.state_file", "risk_state.json")?
            .set_default("persistence.history_file", "history.csv")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (PMBOT__*)
            .add_source(
                Environment::with_prefix("PMBOT")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("bot.markets"),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} markets={} dry_run={} window={} z=[{:.2},{:.2}] trade=${:.2} max_pos={} sl={:.0}% tp={:.0}% trail={:.0}% daily_loss={:.1}% spread<={:.1}% min_ev={:.1}%",
            self.bot.tag,
            self.bot.markets.len(),
            self.bot.dry_run,
            self.strategy.window_size,
            self.strategy.zscore_buy_threshold,
            self.strategy.zscore_sell_threshold,
            self.risk.max_trade_usd,
            self.risk.max_positions,
            self.risk.stop_loss_pct * 100.0,
            self.risk.take_profit_pct * 100.0,
            self.risk.trailing_stop_pct * 100.0,
            self.risk.max_daily_loss_pct * 100.0,
            self.risk.max_spread_pct * 100.0,
            self.risk.min_net_ev * 100.0,
        )
    }

    /// Reject values the engine cannot trade with
    pub fn validate(&self) -> Result<()> {
        if self.strategy.window_size < 2 {
            bail!("strategy.window_size must be at least 2");
        }
        if self.strategy.zscore_buy_threshold >= self.strategy.zscore_sell_threshold {
            bail!(
                "strategy.zscore_buy_threshold ({}) must be below zscore_sell_threshold ({})",
                self.strategy.zscore_buy_threshold,
                self.strategy.zscore_sell_threshold
            );
        }
        if self.risk.max_trade_usd <= 0.0 {
            bail!("risk.max_trade_usd must be positive");
        }
        if self.risk.max_positions == 0 {
            bail!("risk.max_positions must be at least 1");
        }
        for (name, value) in [
            ("risk.stop_loss_pct", self.risk.stop_loss_pct),
            ("risk.take_profit_pct", self.risk.take_profit_pct),
            ("risk.trailing_stop_pct", self.risk.trailing_stop_pct),
            ("risk.max_daily_loss_pct", self.risk.max_daily_loss_pct),
        ] {
            if !(value > 0.0 && value < 1.0) {
                bail!("{} must be in (0, 1), got {}", name, value);
            }
        }
        if self.risk.initial_balance <= 0.0 {
            bail!("risk.initial_balance must be positive");
        }
        if self.risk.max_positions_per_category == 0 {
            bail!("risk.max_positions_per_category must be at least 1");
        }
        if !(self.risk.max_spread_pct > 0.0) {
            bail!("risk.max_spread_pct must be positive");
        }
        if self.risk.fee_rate < 0.0 || self.risk.slippage_estimate < 0.0 {
            bail!("risk.fee_rate and risk.slippage_estimate must not be negative");
        }
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (category, markets) in &self.risk.categories {
            for market in markets {
                if let Some(other) = seen.insert(market.as_str(), category.as_str()) {
                    bail!(
                        "market {} is listed in both categories {} and {}",
                        market,
                        other,
                        category
                    );
                }
            }
        }
        if self.execution.poll_interval_secs == 0 {
            bail!("execution.poll_interval_secs must be at least 1");
        }
        if self.execution.request_timeout_ms == 0 {
            bail!("execution.request_timeout_ms must be positive");
        }
        Ok(())
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
