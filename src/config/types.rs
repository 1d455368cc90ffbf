//! Configuration types and re-exports

pub use super::{
    AppConfig, BotConfig, ExecutionConfig, PersistenceConfig, RiskConfig, StrategyConfig,
};
