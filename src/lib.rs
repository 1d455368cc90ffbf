//! pmbot Library
//!
//! Mean-reversion trading engine for Polymarket: z-score signals, a persisted
//! position ledger and risk limits, driven by a polling orchestrator.

pub mod config;
pub mod exchange;
pub mod ledger;
pub mod orchestrator;
pub mod persistence;
pub mod risk;
pub mod signal;
pub mod types;
