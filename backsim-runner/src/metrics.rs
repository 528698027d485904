//! Performance metrics: pure functions over a finished run.
//!
//! Every metric is a pure function: equity curve, trade log and/or benchmark
//! series in, scalar out. Returns and drawdowns are in percent. A metric that
//! cannot be computed (too few points, zero variance, no trades, no losses,
//! non-finite result) is `None` and serializes as `null`.

use std::collections::BTreeMap;

use chrono::{Datelike, Months, NaiveDateTime};
use serde::{Deserialize, Serialize};

use backsim_core::config::OutputConfig;
use backsim_core::domain::Trade;
use backsim_core::error::{finite, NumericError};
use backsim_core::portfolio::EquityPoint;

/// Headline metrics for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub initial_capital: f64,
    pub final_value: f64,
    pub profit_loss: f64,
    pub total_return: Option<f64>,
    pub cagr: Option<f64>,
    /// Most negative (value - running peak) / running peak, percent (≤ 0).
    pub max_drawdown: Option<f64>,
    /// Longest run of consecutive equity points below the running peak.
    pub max_drawdown_duration: usize,
    pub volatility: Option<f64>,
    pub sharpe: Option<f64>,
    pub sortino: Option<f64>,
    pub calmar: Option<f64>,

    pub num_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: Option<f64>,
    pub profit_factor: Option<f64>,
    pub avg_holding_period: Option<f64>,
    pub average_win: Option<f64>,
    pub average_loss: Option<f64>,
    pub largest_win: Option<f64>,
    pub largest_loss: Option<f64>,
}

/// Strategy vs benchmark over the timestamps both series share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkComparison {
    pub benchmark_return: Option<f64>,
    pub alpha: Option<f64>,
    pub beta: Option<f64>,
    pub tracking_error: Option<f64>,
    pub information_ratio: Option<f64>,
    /// Paired return observations used for the regression.
    pub observations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyReturn {
    pub year: i32,
    pub month: u32,
    pub return_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnualReturn {
    pub year: i32,
    pub return_pct: Option<f64>,
}

/// Annualization settings shared by every ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceAnalyzer {
    /// Annual risk-free rate as a fraction.
    pub risk_free_rate: f64,
    pub periods_per_year: f64,
}

impl Default for PerformanceAnalyzer {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.02,
            periods_per_year: 252.0,
        }
    }
}

impl PerformanceAnalyzer {
    pub fn new(risk_free_rate: f64, periods_per_year: f64) -> Self {
        Self {
            risk_free_rate,
            periods_per_year,
        }
    }

    pub fn from_config(cfg: &OutputConfig) -> Self {
        Self::new(cfg.risk_free_rate, cfg.periods_per_year)
    }

    /// Compute every headline metric.
    pub fn analyze(
        &self,
        equity_curve: &[EquityPoint],
        trades: &[Trade],
        initial_capital: f64,
    ) -> PerformanceMetrics {
        let final_value = equity_curve
            .last()
            .map_or(initial_capital, |p| p.value);
        let returns = period_returns(equity_curve);
        let cagr_pct = cagr(equity_curve, initial_capital).ok();
        let max_dd = max_drawdown(equity_curve).ok();
        let stats = TradeStats::from_trades(trades);

        PerformanceMetrics {
            initial_capital,
            final_value,
            profit_loss: final_value - initial_capital,
            total_return: total_return(equity_curve, initial_capital).ok(),
            cagr: cagr_pct,
            max_drawdown: max_dd,
            max_drawdown_duration: max_drawdown_duration(equity_curve),
            volatility: volatility(&returns, self.periods_per_year).ok(),
            sharpe: sharpe_ratio(&returns, self.risk_free_rate, self.periods_per_year).ok(),
            sortino: sortino_ratio(&returns, self.risk_free_rate, self.periods_per_year).ok(),
            calmar: calmar_ratio(cagr_pct, max_dd).ok(),
            num_trades: trades.len(),
            winning_trades: stats.winners,
            losing_trades: stats.losers,
            win_rate: win_rate(trades).ok(),
            profit_factor: profit_factor(trades).ok(),
            avg_holding_period: avg_holding_period(trades).ok(),
            average_win: stats.average_win,
            average_loss: stats.average_loss,
            largest_win: stats.largest_win,
            largest_loss: stats.largest_loss,
        }
    }

    /// Regress strategy returns on benchmark returns.
    ///
    /// Only intervals whose both endpoints exist in the benchmark series are
    /// paired; the benchmark feeds nothing but this comparison.
    pub fn compare(
        &self,
        equity_curve: &[EquityPoint],
        benchmark: &[(NaiveDateTime, f64)],
    ) -> BenchmarkComparison {
        let closes: BTreeMap<NaiveDateTime, f64> = benchmark
            .iter()
            .copied()
            .filter(|(_, c)| c.is_finite() && *c > 0.0)
            .collect();

        let mut strat = Vec::new();
        let mut bench = Vec::new();
        for w in equity_curve.windows(2) {
            let (Some(b0), Some(b1)) = (closes.get(&w[0].timestamp), closes.get(&w[1].timestamp))
            else {
                continue;
            };
            if w[0].value > 0.0 {
                strat.push(w[1].value / w[0].value - 1.0);
                bench.push(b1 / b0 - 1.0);
            }
        }

        let benchmark_return = benchmark_total_return(equity_curve, &closes).ok();
        let beta = beta(&strat, &bench).ok();
        let diffs: Vec<f64> = strat.iter().zip(&bench).map(|(s, b)| s - b).collect();

        BenchmarkComparison {
            benchmark_return,
            alpha: beta.and_then(|b| self.alpha(&strat, &bench, b).ok()),
            beta,
            tracking_error: volatility(&diffs, self.periods_per_year).ok(),
            information_ratio: information_ratio(&diffs, self.periods_per_year).ok(),
            observations: strat.len(),
        }
    }

    /// Annualized Jensen's alpha in percent.
    fn alpha(&self, strat: &[f64], bench: &[f64], beta: f64) -> Result<f64, NumericError> {
        if strat.is_empty() {
            return Err(NumericError::InsufficientData);
        }
        let ann_strat = mean(strat) * self.periods_per_year;
        let ann_bench = mean(bench) * self.periods_per_year;
        let rf = self.risk_free_rate;
        finite((ann_strat - (rf + beta * (ann_bench - rf))) * 100.0)
    }
}

// ─── Return and risk metrics ────────────────────────────────────────

/// Total return in percent against the initial capital.
pub fn total_return(equity_curve: &[EquityPoint], initial_capital: f64) -> Result<f64, NumericError> {
    if initial_capital <= 0.0 {
        return Err(NumericError::DivisionByZero);
    }
    let final_value = equity_curve
        .last()
        .map_or(initial_capital, |p| p.value);
    finite((final_value / initial_capital - 1.0) * 100.0)
}

/// Compound annual growth rate in percent.
///
/// Elapsed time is measured in calendar years between the first and last
/// equity points, so a one-year span is exactly 1.0 in leap years too.
pub fn cagr(equity_curve: &[EquityPoint], initial_capital: f64) -> Result<f64, NumericError> {
    let (Some(first), Some(last)) = (equity_curve.first(), equity_curve.last()) else {
        return Err(NumericError::InsufficientData);
    };
    let years = years_between(first.timestamp, last.timestamp);
    if years <= 0.0 {
        return Err(NumericError::InsufficientData);
    }
    if initial_capital <= 0.0 {
        return Err(NumericError::DivisionByZero);
    }
    let growth = last.value / initial_capital;
    if growth <= 0.0 {
        return Err(NumericError::NonFinite);
    }
    finite((growth.powf(1.0 / years) - 1.0) * 100.0)
}

/// Fractional calendar years from `start` to `end`.
pub fn years_between(start: NaiveDateTime, end: NaiveDateTime) -> f64 {
    if end <= start {
        return 0.0;
    }
    let mut whole = (end.year() - start.year()).max(0) as u32;
    let add = |n: u32| start.checked_add_months(Months::new(n * 12));
    while whole > 0 && add(whole).map_or(true, |anchor| anchor > end) {
        whole -= 1;
    }
    let (Some(anchor), Some(next)) = (add(whole), add(whole + 1)) else {
        return whole as f64;
    };
    let span = (next - anchor).num_seconds() as f64;
    let part = (end - anchor).num_seconds() as f64;
    whole as f64 + if span > 0.0 { part / span } else { 0.0 }
}

/// Largest peak-to-trough decline, as a non-positive percent.
pub fn max_drawdown(equity_curve: &[EquityPoint]) -> Result<f64, NumericError> {
    if equity_curve.is_empty() {
        return Err(NumericError::InsufficientData);
    }
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for p in equity_curve {
        peak = peak.max(p.value);
        if peak > 0.0 {
            worst = worst.min((p.value - peak) / peak);
        }
    }
    finite(worst * 100.0)
}

/// Longest streak of equity points strictly below the running peak.
pub fn max_drawdown_duration(equity_curve: &[EquityPoint]) -> usize {
    let mut peak = f64::MIN;
    let mut current = 0;
    let mut longest = 0;
    for p in equity_curve {
        if p.value >= peak {
            peak = p.value;
            current = 0;
        } else {
            current += 1;
            longest = longest.max(current);
        }
    }
    longest
}

/// Annualized sample standard deviation of returns, percent.
pub fn volatility(returns: &[f64], periods_per_year: f64) -> Result<f64, NumericError> {
    let sd = std_dev(returns)?;
    finite(sd * periods_per_year.sqrt() * 100.0)
}

/// Annualized Sharpe ratio.
pub fn sharpe_ratio(
    returns: &[f64],
    risk_free_rate: f64,
    periods_per_year: f64,
) -> Result<f64, NumericError> {
    let sd = std_dev(returns)?;
    if sd < 1e-15 {
        return Err(NumericError::ZeroVariance);
    }
    let excess = mean(returns) - risk_free_rate / periods_per_year;
    finite(excess / sd * periods_per_year.sqrt())
}

/// Annualized Sortino ratio (semi-deviation below zero).
pub fn sortino_ratio(
    returns: &[f64],
    risk_free_rate: f64,
    periods_per_year: f64,
) -> Result<f64, NumericError> {
    if returns.len() < 2 {
        return Err(NumericError::InsufficientData);
    }
    let downside_sq: f64 = returns.iter().filter(|&&r| r < 0.0).map(|r| r * r).sum();
    let downside = (downside_sq / returns.len() as f64).sqrt();
    if downside < 1e-15 {
        return Err(NumericError::ZeroVariance);
    }
    let excess = mean(returns) - risk_free_rate / periods_per_year;
    finite(excess / downside * periods_per_year.sqrt())
}

/// CAGR / |max drawdown|.
pub fn calmar_ratio(cagr_pct: Option<f64>, max_dd_pct: Option<f64>) -> Result<f64, NumericError> {
    let (Some(c), Some(dd)) = (cagr_pct, max_dd_pct) else {
        return Err(NumericError::InsufficientData);
    };
    if dd.abs() < 1e-12 {
        return Err(NumericError::DivisionByZero);
    }
    finite(c / dd.abs())
}

/// OLS slope of strategy returns on benchmark returns.
pub fn beta(strat: &[f64], bench: &[f64]) -> Result<f64, NumericError> {
    if strat.len() < 2 || strat.len() != bench.len() {
        return Err(NumericError::InsufficientData);
    }
    let (ms, mb) = (mean(strat), mean(bench));
    let n = (strat.len() - 1) as f64;
    let cov = strat
        .iter()
        .zip(bench)
        .map(|(s, b)| (s - ms) * (b - mb))
        .sum::<f64>()
        / n;
    let var = bench.iter().map(|b| (b - mb).powi(2)).sum::<f64>() / n;
    if var < 1e-18 {
        return Err(NumericError::ZeroVariance);
    }
    finite(cov / var)
}

/// Annualized mean active return over annualized tracking error.
pub fn information_ratio(diffs: &[f64], periods_per_year: f64) -> Result<f64, NumericError> {
    let sd = std_dev(diffs)?;
    if sd < 1e-15 {
        return Err(NumericError::ZeroVariance);
    }
    finite(mean(diffs) * periods_per_year / (sd * periods_per_year.sqrt()))
}

fn benchmark_total_return(
    equity_curve: &[EquityPoint],
    closes: &BTreeMap<NaiveDateTime, f64>,
) -> Result<f64, NumericError> {
    let (Some(first), Some(last)) = (equity_curve.first(), equity_curve.last()) else {
        return Err(NumericError::InsufficientData);
    };
    let mut window = closes.range(first.timestamp..=last.timestamp);
    let (Some((_, start)), Some((_, end))) = (window.next(), window.next_back()) else {
        return Err(NumericError::InsufficientData);
    };
    finite((end / start - 1.0) * 100.0)
}

// ─── Trade statistics ───────────────────────────────────────────────

/// Percent of trades with positive net P&L.
pub fn win_rate(trades: &[Trade]) -> Result<f64, NumericError> {
    if trades.is_empty() {
        return Err(NumericError::InsufficientData);
    }
    let winners = trades.iter().filter(|t| t.is_winner()).count();
    Ok(winners as f64 / trades.len() as f64 * 100.0)
}

/// Gross profit / gross loss on net P&L.
pub fn profit_factor(trades: &[Trade]) -> Result<f64, NumericError> {
    if trades.is_empty() {
        return Err(NumericError::InsufficientData);
    }
    let gross_profit: f64 = trades.iter().filter(|t| t.is_winner()).map(|t| t.net_pnl).sum();
    let gross_loss: f64 = trades
        .iter()
        .filter(|t| t.is_loser())
        .map(|t| t.net_pnl.abs())
        .sum();
    if gross_loss < 1e-10 {
        return Err(NumericError::DivisionByZero);
    }
    finite(gross_profit / gross_loss)
}

/// Mean holding period in calendar days.
pub fn avg_holding_period(trades: &[Trade]) -> Result<f64, NumericError> {
    if trades.is_empty() {
        return Err(NumericError::InsufficientData);
    }
    let total: i64 = trades.iter().map(|t| t.holding_period_days).sum();
    Ok(total as f64 / trades.len() as f64)
}

#[derive(Debug, Default)]
struct TradeStats {
    winners: usize,
    losers: usize,
    average_win: Option<f64>,
    average_loss: Option<f64>,
    largest_win: Option<f64>,
    largest_loss: Option<f64>,
}

impl TradeStats {
    fn from_trades(trades: &[Trade]) -> Self {
        let wins: Vec<f64> = trades.iter().filter(|t| t.is_winner()).map(|t| t.net_pnl).collect();
        let losses: Vec<f64> = trades.iter().filter(|t| t.is_loser()).map(|t| t.net_pnl).collect();
        Self {
            winners: wins.len(),
            losers: losses.len(),
            average_win: (!wins.is_empty()).then(|| mean(&wins)),
            average_loss: (!losses.is_empty()).then(|| mean(&losses)),
            largest_win: wins.iter().copied().reduce(f64::max),
            largest_loss: losses.iter().copied().reduce(f64::min),
        }
    }
}

// ─── Period tables ──────────────────────────────────────────────────

/// Month-over-month returns; the first month is measured from `initial_capital`.
pub fn monthly_returns(equity_curve: &[EquityPoint], initial_capital: f64) -> Vec<MonthlyReturn> {
    chain_periods(equity_curve, initial_capital, |ts| (ts.year(), ts.month()))
        .into_iter()
        .map(|((year, month), return_pct)| MonthlyReturn {
            year,
            month,
            return_pct,
        })
        .collect()
}

/// Year-over-year returns; the first year is measured from `initial_capital`.
pub fn annual_returns(equity_curve: &[EquityPoint], initial_capital: f64) -> Vec<AnnualReturn> {
    chain_periods(equity_curve, initial_capital, |ts| ts.year())
        .into_iter()
        .map(|(year, return_pct)| AnnualReturn { year, return_pct })
        .collect()
}

fn chain_periods<K: Ord + Copy>(
    equity_curve: &[EquityPoint],
    initial_capital: f64,
    key: impl Fn(NaiveDateTime) -> K,
) -> Vec<(K, Option<f64>)> {
    let mut closes: BTreeMap<K, f64> = BTreeMap::new();
    for p in equity_curve {
        closes.insert(key(p.timestamp), p.value);
    }
    let mut base = initial_capital;
    closes
        .into_iter()
        .map(|(k, close)| {
            let ret = if base > 0.0 {
                finite((close / base - 1.0) * 100.0).ok()
            } else {
                None
            };
            base = close;
            (k, ret)
        })
        .collect()
}

// ─── Helpers ────────────────────────────────────────────────────────

/// Simple returns between consecutive equity points.
pub fn period_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
    equity_curve
        .windows(2)
        .map(|w| {
            if w[0].value > 0.0 {
                w[1].value / w[0].value - 1.0
            } else {
                0.0
            }
        })
        .collect()
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn std_dev(values: &[f64]) -> Result<f64, NumericError> {
    if values.len() < 2 {
        return Err(NumericError::InsufficientData);
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    finite(var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use backsim_core::domain::{ExitReason, PositionSide};
    use chrono::NaiveDate;

    fn ts(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(16, 0, 0)
            .unwrap()
    }

    fn curve(values: &[f64]) -> Vec<EquityPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, &value)| EquityPoint {
                timestamp: ts(2024, 1, 1) + chrono::Duration::days(i as i64),
                value,
            })
            .collect()
    }

    fn make_trade(net_pnl: f64, days: i64) -> Trade {
        Trade {
            ticker: "SPY".into(),
            side: PositionSide::Long,
            entry_timestamp: ts(2024, 1, 2),
            entry_price: 100.0,
            exit_timestamp: ts(2024, 1, 2) + chrono::Duration::days(days),
            exit_price: 100.0 + net_pnl / 50.0,
            quantity: 50.0,
            gross_pnl: net_pnl,
            entry_costs: 0.0,
            exit_costs: 0.0,
            borrow_cost: 0.0,
            dividends: 0.0,
            net_pnl,
            pnl_pct: net_pnl / 50.0,
            holding_period_days: days,
            exit_reason: ExitReason::StrategySignal,
        }
    }

    // ── Total return / CAGR ──

    #[test]
    fn total_return_against_initial_capital() {
        let eq = curve(&[100_000.0, 104_000.0, 110_000.0]);
        assert!((total_return(&eq, 100_000.0).unwrap() - 10.0).abs() < 1e-10);
    }

    #[test]
    fn total_return_without_points_is_zero() {
        assert_eq!(total_return(&[], 100_000.0), Ok(0.0));
    }

    #[test]
    fn cagr_of_one_year_doubling_is_100() {
        let eq = vec![
            EquityPoint {
                timestamp: ts(2023, 1, 3),
                value: 100_000.0,
            },
            EquityPoint {
                timestamp: ts(2024, 1, 3),
                value: 200_000.0,
            },
        ];
        assert!((cagr(&eq, 100_000.0).unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn cagr_spans_leap_year_exactly() {
        assert!((years_between(ts(2024, 1, 1), ts(2025, 1, 1)) - 1.0).abs() < 1e-12);
        assert!((years_between(ts(2023, 1, 1), ts(2024, 1, 1)) - 1.0).abs() < 1e-12);
        let half = years_between(ts(2023, 1, 1), ts(2023, 7, 2));
        assert!((half - 0.5).abs() < 0.01);
    }

    #[test]
    fn cagr_two_years() {
        let eq = vec![
            EquityPoint {
                timestamp: ts(2022, 3, 1),
                value: 100.0,
            },
            EquityPoint {
                timestamp: ts(2024, 3, 1),
                value: 121.0,
            },
        ];
        assert!((cagr(&eq, 100.0).unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn cagr_single_point_is_undefined() {
        assert!(cagr(&curve(&[100.0]), 100.0).is_err());
    }

    // ── Drawdown ──

    #[test]
    fn max_drawdown_known() {
        let eq = curve(&[100_000.0, 110_000.0, 90_000.0, 95_000.0]);
        let expected = (90_000.0 - 110_000.0) / 110_000.0 * 100.0;
        assert!((max_drawdown(&eq).unwrap() - expected).abs() < 1e-10);
        assert_eq!(max_drawdown_duration(&eq), 2);
    }

    #[test]
    fn max_drawdown_monotonic_is_zero() {
        let eq = curve(&[1.0, 2.0, 3.0]);
        assert_eq!(max_drawdown(&eq), Ok(0.0));
        assert_eq!(max_drawdown_duration(&eq), 0);
    }

    #[test]
    fn drawdown_duration_resets_on_new_peak() {
        let eq = curve(&[100.0, 90.0, 95.0, 101.0, 99.0]);
        assert_eq!(max_drawdown_duration(&eq), 2);
    }

    // ── Ratios ──

    #[test]
    fn sharpe_constant_returns_is_undefined() {
        let returns = vec![0.001; 50];
        assert_eq!(
            sharpe_ratio(&returns, 0.0, 252.0),
            Err(NumericError::ZeroVariance)
        );
    }

    #[test]
    fn sharpe_positive_for_steady_gains() {
        let returns: Vec<f64> = (0..252)
            .map(|i| if i % 2 == 0 { 0.002 } else { 0.0005 })
            .collect();
        let s = sharpe_ratio(&returns, 0.0, 252.0).unwrap();
        assert!(s > 5.0, "got {s}");
    }

    #[test]
    fn sortino_without_downside_is_undefined() {
        let returns = vec![0.01, 0.02, 0.005];
        assert!(sortino_ratio(&returns, 0.0, 252.0).is_err());
    }

    #[test]
    fn sortino_with_downside_is_positive() {
        let mut returns = vec![0.002; 50];
        returns.extend(vec![-0.005; 10]);
        assert!(sortino_ratio(&returns, 0.0, 252.0).unwrap() > 0.0);
    }

    #[test]
    fn calmar_needs_a_drawdown() {
        assert!(calmar_ratio(Some(12.0), Some(0.0)).is_err());
        assert_eq!(calmar_ratio(Some(12.0), Some(-6.0)), Ok(2.0));
        assert!(calmar_ratio(None, Some(-6.0)).is_err());
    }

    #[test]
    fn volatility_annualizes_sample_stdev() {
        let returns = vec![0.01, -0.01, 0.01, -0.01];
        let sd = std_dev(&returns).unwrap();
        let v = volatility(&returns, 252.0).unwrap();
        assert!((v - sd * 252.0_f64.sqrt() * 100.0).abs() < 1e-12);
    }

    // ── Trades ──

    #[test]
    fn trade_statistics() {
        let trades = vec![
            make_trade(500.0, 5),
            make_trade(-200.0, 3),
            make_trade(300.0, 10),
        ];
        assert!((win_rate(&trades).unwrap() - 200.0 / 3.0).abs() < 1e-10);
        assert!((profit_factor(&trades).unwrap() - 4.0).abs() < 1e-10);
        assert!((avg_holding_period(&trades).unwrap() - 6.0).abs() < 1e-10);

        let stats = TradeStats::from_trades(&trades);
        assert_eq!(stats.winners, 2);
        assert_eq!(stats.losers, 1);
        assert_eq!(stats.average_win, Some(400.0));
        assert_eq!(stats.largest_win, Some(500.0));
        assert_eq!(stats.largest_loss, Some(-200.0));
    }

    #[test]
    fn profit_factor_without_losses_is_undefined() {
        let trades = vec![make_trade(500.0, 1)];
        assert_eq!(profit_factor(&trades), Err(NumericError::DivisionByZero));
    }

    #[test]
    fn zero_trades_report_nulls() {
        let analyzer = PerformanceAnalyzer::default();
        let eq = curve(&[100_000.0; 30]);
        let m = analyzer.analyze(&eq, &[], 100_000.0);
        assert_eq!(m.total_return, Some(0.0));
        assert_eq!(m.num_trades, 0);
        assert_eq!(m.win_rate, None);
        assert_eq!(m.profit_factor, None);
        assert_eq!(m.sharpe, None);
        assert_eq!(m.calmar, None);
        assert_eq!(m.max_drawdown, Some(0.0));

        let json = serde_json::to_value(&m).unwrap();
        assert!(json["sharpe"].is_null());
    }

    // ── Benchmark ──

    #[test]
    fn benchmark_identical_series_has_unit_beta() {
        let values = [100.0, 102.0, 101.0, 104.0, 103.0, 107.0];
        let eq = curve(&values);
        let bench: Vec<(NaiveDateTime, f64)> = eq.iter().map(|p| (p.timestamp, p.value)).collect();
        let cmp = PerformanceAnalyzer::new(0.0, 252.0).compare(&eq, &bench);
        assert_eq!(cmp.observations, 5);
        assert!((cmp.beta.unwrap() - 1.0).abs() < 1e-9);
        assert!(cmp.alpha.unwrap().abs() < 1e-6);
        assert_eq!(cmp.tracking_error, Some(0.0));
        assert_eq!(cmp.information_ratio, None);
        assert!((cmp.benchmark_return.unwrap() - 7.0).abs() < 1e-9);
    }

    #[test]
    fn benchmark_with_no_overlap_is_empty() {
        let eq = curve(&[100.0, 101.0, 102.0]);
        let bench = vec![(ts(2020, 1, 1), 10.0), (ts(2020, 1, 2), 11.0)];
        let cmp = PerformanceAnalyzer::default().compare(&eq, &bench);
        assert_eq!(cmp.observations, 0);
        assert_eq!(cmp.beta, None);
        assert_eq!(cmp.alpha, None);
        assert_eq!(cmp.benchmark_return, None);
    }

    // ── Period tables ──

    #[test]
    fn monthly_and_annual_tables_chain_from_initial_capital() {
        let eq = vec![
            EquityPoint {
                timestamp: ts(2023, 12, 15),
                value: 105.0,
            },
            EquityPoint {
                timestamp: ts(2023, 12, 29),
                value: 110.0,
            },
            EquityPoint {
                timestamp: ts(2024, 1, 31),
                value: 121.0,
            },
        ];
        let monthly = monthly_returns(&eq, 100.0);
        assert_eq!(monthly.len(), 2);
        assert_eq!((monthly[0].year, monthly[0].month), (2023, 12));
        assert!((monthly[0].return_pct.unwrap() - 10.0).abs() < 1e-9);
        assert!((monthly[1].return_pct.unwrap() - 10.0).abs() < 1e-9);

        let annual = annual_returns(&eq, 100.0);
        assert_eq!(annual.len(), 2);
        assert_eq!(annual[1].year, 2024);
        assert!((annual[1].return_pct.unwrap() - 10.0).abs() < 1e-9);
    }
}
