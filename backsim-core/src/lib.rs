//! BackSim Core: domain types, portfolio and risk state machine, signals,
//! sizing, execution and the deterministic event loop.
//!
//! This crate contains the simulation itself:
//! - Domain types (bars, positions, trades, corporate actions)
//! - Portfolio with accounting identity checks and drawdown halts
//! - Pluggable synchronous and asynchronous signal sources
//! - Position sizing, execution pricing and transaction costs
//! - Rebalancing
//! - The nine-phase per-timestamp engine loop

pub mod config;
pub mod data;
pub mod domain;
pub mod engine;
pub mod error;
pub mod execution;
pub mod portfolio;
pub mod rebalance;
pub mod signal;
pub mod sizing;
pub mod strategy;

pub use config::BacktestConfig;
pub use data::MarketData;
pub use engine::{BacktestEngine, CancelHandle, RunResult};
pub use error::{ConfigError, DataError, EngineError, OrderRejection};
pub use signal::{AsyncSignalSource, SignalSource, SignalStrategy, SignalValue};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: state that crosses task boundaries is Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        // Domain types
        require_send::<domain::Bar>();
        require_sync::<domain::Bar>();
        require_send::<domain::Position>();
        require_sync::<domain::Position>();
        require_send::<domain::Trade>();
        require_sync::<domain::Trade>();
        require_send::<domain::CorporateAction>();
        require_sync::<domain::CorporateAction>();

        // Data and configuration
        require_send::<MarketData>();
        require_sync::<MarketData>();
        require_send::<BacktestConfig>();
        require_sync::<BacktestConfig>();

        // Portfolio
        require_send::<portfolio::Portfolio>();
        require_sync::<portfolio::Portfolio>();
        require_send::<portfolio::RiskManager>();
        require_sync::<portfolio::RiskManager>();

        // Signals
        require_send::<signal::SignalContext>();
        require_sync::<signal::SignalContext>();
        require_send::<signal::SignalStrategy>();
        require_sync::<signal::SignalStrategy>();
        require_send::<signal::RuleSignalSource>();
        require_sync::<signal::RuleSignalSource>();

        // Engine
        require_send::<BacktestEngine>();
        require_send::<RunResult>();
        require_sync::<RunResult>();
        require_send::<CancelHandle>();
        require_sync::<CancelHandle>();
    }
}
