//! Backtest runner: wires together engine and metrics.
//!
//! Two entry points:
//! - `run()`: pre-loaded data plus an explicit signal strategy.
//! - `run_with_rules()`: builds the signal strategy from the configured
//!   entry/exit rules. Used by the CLI.

use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use backsim_core::config::RunId;
use backsim_core::domain::{Position, Trade};
use backsim_core::engine::RejectedOrder;
use backsim_core::error::{DataError, EngineError};
use backsim_core::portfolio::{EquityPoint, HaltReason, Ledger};
use backsim_core::signal::SignalOracle;
use backsim_core::{BacktestConfig, BacktestEngine, MarketData, RunResult, SignalStrategy};

use crate::metrics::{
    annual_returns, monthly_returns, AnnualReturn, BenchmarkComparison, MonthlyReturn,
    PerformanceAnalyzer, PerformanceMetrics,
};

/// Errors from the runner.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<DataError> for RunError {
    fn from(err: DataError) -> Self {
        Self::Engine(EngineError::DataAcquisition(err))
    }
}

/// Current schema version for persisted reports.
pub const SCHEMA_VERSION: u32 = 1;

/// Benchmark closes keyed by timestamp.
pub type BenchmarkSeries = Vec<(NaiveDateTime, f64)>;

/// Complete result of a single backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    /// Schema version for forward-compatible deserialization.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub run_id: RunId,
    pub config: BacktestConfig,
    pub summary: PerformanceMetrics,
    pub monthly_returns: Vec<MonthlyReturn>,
    pub annual_returns: Vec<AnnualReturn>,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Trade>,
    /// Open positions at the end of the run.
    pub positions: Vec<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchmark_comparison: Option<BenchmarkComparison>,
    pub rejected_orders: Vec<RejectedOrder>,
    pub ledger: Ledger,
    pub cash: f64,
    pub signal_timeouts: usize,
    pub signal_errors: usize,
    pub halted: bool,
    pub halt_reason: Option<HaltReason>,
    /// False when the run was cancelled before the last timestep.
    pub complete: bool,
    pub calendar_len: usize,
    pub steps_completed: usize,
    #[serde(default)]
    pub has_synthetic: bool,
    #[serde(default)]
    pub dataset_hash: String,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Run a backtest against pre-loaded data with the given signal strategy.
///
/// Only configuration and data failures return an error; rejected orders,
/// signal failures and undefined metrics are reported inside the result.
pub fn run(
    config: BacktestConfig,
    data: Arc<MarketData>,
    strategy: SignalStrategy,
    benchmark: Option<&[(NaiveDateTime, f64)]>,
) -> Result<BacktestReport, RunError> {
    let mut engine = BacktestEngine::new(config.clone(), data, strategy)?;
    let result = engine.run_blocking()?;
    Ok(build_report(config, result, benchmark))
}

/// Run with signals from the configured built-in entry and exit rules.
pub fn run_with_rules(
    config: BacktestConfig,
    data: Arc<MarketData>,
    benchmark: Option<&[(NaiveDateTime, f64)]>,
) -> Result<BacktestReport, RunError> {
    let mut engine = BacktestEngine::with_rules(config.clone(), data)?;
    let result = engine.run_blocking()?;
    Ok(build_report(config, result, benchmark))
}

/// Run with signals from an external oracle.
pub fn run_with_oracle<O: SignalOracle + 'static>(
    config: BacktestConfig,
    data: Arc<MarketData>,
    oracle: O,
    prompts: (&str, &str),
    benchmark: Option<&[(NaiveDateTime, f64)]>,
) -> Result<BacktestReport, RunError> {
    let mut engine = BacktestEngine::with_oracle(config.clone(), data, oracle, prompts.0, prompts.1)?;
    let result = engine.run_blocking()?;
    Ok(build_report(config, result, benchmark))
}

/// Turn a finished (or cancelled) run into a report.
pub fn build_report(
    config: BacktestConfig,
    result: RunResult,
    benchmark: Option<&[(NaiveDateTime, f64)]>,
) -> BacktestReport {
    let analyzer = PerformanceAnalyzer::from_config(&config.output);
    let summary = analyzer.analyze(&result.equity_curve, &result.trades, result.initial_capital);
    let benchmark_comparison = benchmark.map(|b| analyzer.compare(&result.equity_curve, b));

    info!(
        run_id = %result.run_id,
        trades = summary.num_trades,
        final_value = summary.final_value,
        total_return = ?summary.total_return,
        "backtest report ready"
    );

    BacktestReport {
        schema_version: SCHEMA_VERSION,
        run_id: result.run_id.clone(),
        monthly_returns: monthly_returns(&result.equity_curve, result.initial_capital),
        annual_returns: annual_returns(&result.equity_curve, result.initial_capital),
        complete: result.is_complete(),
        config,
        summary,
        benchmark_comparison,
        equity_curve: result.equity_curve,
        trades: result.trades,
        positions: result.positions,
        rejected_orders: result.rejected_orders,
        ledger: result.ledger,
        cash: result.cash,
        signal_timeouts: result.signal_timeouts,
        signal_errors: result.signal_errors,
        halted: result.halted,
        halt_reason: result.halt_reason,
        calendar_len: result.calendar_len,
        steps_completed: result.steps_completed,
        has_synthetic: false,
        dataset_hash: String::new(),
    }
}

/// Extract a benchmark close series for `ticker` from loaded market data.
pub fn benchmark_series(data: &MarketData, ticker: &str) -> Result<BenchmarkSeries, DataError> {
    let series = data
        .series(ticker)
        .ok_or_else(|| DataError::MissingTicker(ticker.to_string()))?;
    Ok(data
        .index
        .iter()
        .zip(series)
        .filter_map(|(ts, slot)| {
            slot.as_ref()
                .filter(|b| b.close.is_finite())
                .map(|b| (*ts, b.close))
        })
        .collect())
}
