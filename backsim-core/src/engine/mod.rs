//! Backtesting engine: the deterministic per-timestamp simulation loop.
//!
//! Nine ordered phases per calendar timestamp:
//!
//! 1. Resolve bars (missing-data policy), reset daily/weekly peaks on boundaries
//! 2. Fill orders queued at the previous bar (next-bar-open): exits, then entries
//! 3. Mark-to-market when the MTM frequency says so
//! 4. Corporate actions and short-borrow accrual
//! 5. Drawdown limits
//! 6. Rebalancing
//! 7. Exits for open positions
//! 8. Entries (eligibility, signals, ranking, sizing, risk checks)
//! 9. Persist the cursor and advance
//!
//! The engine is the only writer of the portfolio. Signal evaluation may run
//! concurrently but never mutates state.

pub mod calendar;
pub mod loop_runner;
pub mod result;
pub mod state;

pub use result::{RejectedOrder, RunResult};
pub use state::{EngineState, PendingEntry, PendingExit};

use crate::config::{BacktestConfig, RunId};
use crate::data::MarketData;
use crate::error::{DataError, EngineError};
use crate::execution::ExecutionModel;
use crate::portfolio::{Portfolio, RiskLimits};
use crate::rebalance::Rebalancer;
use crate::signal::{OracleSignalSource, SignalOracle, SignalStrategy};
use crate::strategy::StrategyEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Shared flag that stops a run between timesteps.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct BacktestEngine {
    config: BacktestConfig,
    run_id: RunId,
    data: Arc<MarketData>,
    strategy: StrategyEngine,
    execution: ExecutionModel,
    rebalancer: Rebalancer,
    /// Data-index positions of the trading calendar.
    calendar: Vec<usize>,
    state: EngineState,
    cancel: CancelHandle,
}

impl BacktestEngine {
    /// Validate configuration and data and prepare a run.
    pub fn new(
        config: BacktestConfig,
        data: Arc<MarketData>,
        signals: SignalStrategy,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        data.validate()?;
        for ticker in &config.market_data.universe {
            if !data.has_ticker(ticker) {
                return Err(DataError::MissingTicker(ticker.clone()).into());
            }
        }

        let weekdays = config.execution.trading_weekdays()?;
        let calendar = calendar::build_calendar(
            &data.index,
            config.market_data.start_date,
            config.market_data.end_date,
            &weekdays,
        );
        if calendar.is_empty() {
            return Err(DataError::EmptyCalendar.into());
        }

        let strategy = StrategyEngine::new(&config, signals)?;
        let portfolio = Portfolio::new(config.risk.initial_capital, RiskLimits::from_config(&config));
        let run_id = config.run_id();
        info!(
            run_id = %run_id,
            tickers = config.market_data.universe.len(),
            steps = calendar.len(),
            strategy = strategy.signals().name(),
            "backtest prepared"
        );

        Ok(Self {
            execution: ExecutionModel::from_config(&config.execution),
            rebalancer: Rebalancer::new(config.rebalancing.clone(), config.strategy.fractional_shares),
            run_id,
            data,
            strategy,
            calendar,
            state: EngineState::new(portfolio),
            cancel: CancelHandle::default(),
            config,
        })
    }

    /// Engine driven by the configured built-in entry/exit rules.
    pub fn with_rules(config: BacktestConfig, data: Arc<MarketData>) -> Result<Self, EngineError> {
        let signals = SignalStrategy::Sync(Box::new(crate::signal::RuleSignalSource::new(
            config.strategy.entry_rule.clone(),
            config.strategy.exit_rule.clone(),
        )));
        Self::new(config, data, signals)
    }

    /// Engine driven by an external oracle.
    ///
    /// Exit thresholds come from `strategy.upside_threshold` and
    /// `strategy.downside_threshold`; each timestamp's oracle calls share the
    /// `strategy.signal_timeout_ms` deadline.
    pub fn with_oracle<O: SignalOracle + 'static>(
        config: BacktestConfig,
        data: Arc<MarketData>,
        oracle: O,
        entry_prompt: impl Into<String>,
        exit_prompt: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let source = OracleSignalSource::new(oracle, entry_prompt, exit_prompt).with_thresholds(
            config.strategy.upside_threshold,
            config.strategy.downside_threshold,
        );
        let signals = SignalStrategy::Async {
            source: Arc::new(source),
            timeout: config.signal_timeout(),
        };
        Self::new(config, data, signals)
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn calendar_len(&self) -> usize {
        self.calendar.len()
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.state.portfolio
    }

    /// Handle that cancels this run from another task or thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run the remaining timesteps.
    ///
    /// Resumes from the persisted cursor, so calling it again after a
    /// cancellation continues where the run stopped.
    pub async fn run(&mut self) -> Result<RunResult, EngineError> {
        self.state.cancelled = false;
        while self.state.cursor < self.calendar.len() {
            if self.cancel.is_cancelled() {
                self.state.cancelled = true;
                info!(step = self.state.cursor, "backtest cancelled");
                break;
            }
            self.step(self.state.cursor).await;
        }
        let result = self.snapshot();
        info!(
            run_id = %self.run_id,
            final_value = result.final_value,
            trades = result.trades.len(),
            rejected = result.rejected_orders.len(),
            "backtest finished"
        );
        Ok(result)
    }

    /// Run to completion on a current-thread runtime.
    pub fn run_blocking(&mut self) -> Result<RunResult, EngineError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| EngineError::Runtime(e.to_string()))?;
        rt.block_on(self.run())
    }

    /// Result through the last completed timestep.
    pub fn snapshot(&self) -> RunResult {
        let p = &self.state.portfolio;
        RunResult {
            run_id: self.run_id.clone(),
            initial_capital: p.initial_capital,
            final_value: p.value(),
            cash: p.cash,
            equity_curve: p.equity_curve.clone(),
            trades: p.trades.clone(),
            positions: p.positions.values().cloned().collect(),
            rejected_orders: self.state.rejected_orders.clone(),
            ledger: p.ledger.clone(),
            signal_timeouts: self.state.signal_timeouts,
            signal_errors: self.state.signal_errors,
            calendar_len: self.calendar.len(),
            steps_completed: self.state.cursor,
            halted: p.is_halted(),
            halt_reason: p.halt_reason(),
            cancelled: self.state.cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntryRule, ExitRule};
    use crate::domain::Bar;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use std::collections::BTreeMap;

    fn day(n: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(16, 0, 0)
            .unwrap()
            + Duration::days(n)
    }

    fn data(n: i64) -> Arc<MarketData> {
        let index: Vec<NaiveDateTime> = (0..n).map(day).collect();
        let bars = index.iter().map(|ts| Some(Bar::flat(*ts, 100.0))).collect();
        let mut series = BTreeMap::new();
        series.insert("SPY".to_string(), bars);
        Arc::new(MarketData::new(index, series).unwrap())
    }

    fn config() -> BacktestConfig {
        let mut cfg = BacktestConfig::default();
        cfg.market_data.universe = vec!["SPY".into()];
        cfg.strategy.entry_rule = EntryRule::FirstBar;
        cfg.strategy.exit_rule = ExitRule::LastBar;
        cfg
    }

    #[test]
    fn rejects_empty_universe() {
        let mut cfg = config();
        cfg.market_data.universe.clear();
        assert!(matches!(
            BacktestEngine::with_rules(cfg, data(3)),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_unknown_ticker() {
        let mut cfg = config();
        cfg.market_data.universe = vec!["QQQ".into()];
        assert!(matches!(
            BacktestEngine::with_rules(cfg, data(3)),
            Err(EngineError::DataAcquisition(DataError::MissingTicker(_)))
        ));
    }

    #[test]
    fn rejects_empty_calendar() {
        let mut cfg = config();
        cfg.market_data.start_date = NaiveDate::from_ymd_opt(2025, 1, 1);
        assert!(matches!(
            BacktestEngine::with_rules(cfg, data(3)),
            Err(EngineError::DataAcquisition(DataError::EmptyCalendar))
        ));
    }

    #[test]
    fn cancellation_keeps_partial_state() {
        let mut engine = BacktestEngine::with_rules(config(), data(10)).unwrap();
        engine.cancel_handle().cancel();
        let result = engine.run_blocking().unwrap();
        assert!(result.cancelled);
        assert_eq!(result.steps_completed, 0);
        assert!(result.equity_curve.is_empty());
        assert!(!result.is_complete());
    }

    #[test]
    fn full_run_covers_calendar() {
        let mut engine = BacktestEngine::with_rules(config(), data(10)).unwrap();
        let result = engine.run_blocking().unwrap();
        assert!(result.is_complete());
        assert_eq!(result.equity_curve.len(), 10);
        assert_eq!(result.run_id, engine.config().run_id());
    }
}
