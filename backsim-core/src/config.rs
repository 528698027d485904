//! Serializable backtest configuration.
//!
//! Loaded once from TOML and immutable for the lifetime of a run. Every field
//! has a default so a minimal file only needs the universe:
//!
//! ```toml
//! [market_data]
//! universe = ["SPY"]
//!
//! [strategy]
//! position_sizing = "portfolio-percent"
//! portfolio_percent = 50.0
//! ```

use crate::error::ConfigError;
use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Unique identifier for a backtest configuration (content-addressable hash).
pub type RunId = String;

/// Full configuration for a single backtest run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BacktestConfig {
    pub market_data: MarketDataConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub mtm: MtmConfig,
    pub rebalancing: RebalancingConfig,
    pub output: OutputConfig,
}

impl BacktestConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read and parse a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Serialize back to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Computes a deterministic hash ID for this configuration.
    ///
    /// Two runs with identical configs share the same RunId.
    pub fn run_id(&self) -> RunId {
        let json = serde_json::to_string(self).unwrap_or_default();
        blake3::hash(json.as_bytes()).to_hex().to_string()
    }

    /// Check every constraint that can be verified without market data.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let md = &self.market_data;
        if md.universe.is_empty() {
            return Err(ConfigError::EmptyUniverse);
        }
        if let (Some(start), Some(end)) = (md.start_date, md.end_date) {
            if start >= end {
                return Err(ConfigError::InvalidDateRange {
                    start: start.to_string(),
                    end: end.to_string(),
                });
            }
        }

        let risk = &self.risk;
        if risk.initial_capital <= 0.0 || !risk.initial_capital.is_finite() {
            return Err(ConfigError::NonPositiveCapital(risk.initial_capital));
        }
        if risk.leverage_allowed {
            check_range("max_leverage", risk.max_leverage, 1.0, 100.0)?;
        }
        check_opt("max_single_asset_percent", risk.max_single_asset_percent, 100.0)?;
        check_opt("max_sector_percent", risk.max_sector_percent, 100.0)?;
        check_opt("max_net_exposure", risk.max_net_exposure, 10_000.0)?;
        check_opt("max_daily_drawdown", risk.max_daily_drawdown, 100.0)?;
        check_opt("max_weekly_drawdown", risk.max_weekly_drawdown, 100.0)?;
        if risk.use_trailing_stops {
            match risk.trailing_stop_distance {
                Some(d) => check_range("trailing_stop_distance", d, f64::MIN_POSITIVE, 100.0)?,
                None => {
                    return Err(ConfigError::InvalidRule(
                        "use_trailing_stops requires trailing_stop_distance".into(),
                    ))
                }
            }
        }

        let st = &self.strategy;
        if st.max_positions == 0 {
            return Err(ConfigError::ZeroMaxPositions);
        }
        if st.signal_timeout_ms == 0 {
            return Err(ConfigError::NonPositiveTimeout);
        }
        match st.position_sizing {
            PositionSizingMethod::FixedDollar => {
                let amount = st.fixed_dollar_amount.ok_or(ConfigError::MissingSizingParameter {
                    method: "fixed-dollar",
                    field: "fixed_dollar_amount",
                })?;
                check_range("fixed_dollar_amount", amount, f64::MIN_POSITIVE, f64::MAX)?;
            }
            PositionSizingMethod::PortfolioPercent => {
                let pct = st.portfolio_percent.ok_or(ConfigError::MissingSizingParameter {
                    method: "portfolio-percent",
                    field: "portfolio_percent",
                })?;
                check_range("portfolio_percent", pct, f64::MIN_POSITIVE, 100.0 * self.leverage_cap())?;
            }
            PositionSizingMethod::RiskBased => {
                let pct = st.risk_percent.ok_or(ConfigError::MissingSizingParameter {
                    method: "risk-based",
                    field: "risk_percent",
                })?;
                check_range("risk_percent", pct, f64::MIN_POSITIVE, 100.0)?;
                if st.stop_loss.is_none() {
                    return Err(ConfigError::MissingSizingParameter {
                        method: "risk-based",
                        field: "stop_loss",
                    });
                }
                if risk.stop_loss_type == StopLossType::DollarBased {
                    return Err(ConfigError::InvalidRule(
                        "risk-based sizing needs a per-share stop (fixed-percent or volatility-based)"
                            .into(),
                    ));
                }
            }
        }
        if let Some(sl) = st.stop_loss {
            let max = match risk.stop_loss_type {
                StopLossType::FixedPercent => 100.0,
                StopLossType::DollarBased | StopLossType::VolatilityBased => f64::MAX,
            };
            check_range("stop_loss", sl, f64::MIN_POSITIVE, max)?;
        }
        check_opt("take_profit", st.take_profit, f64::MAX)?;
        check_range("upside_threshold", st.upside_threshold, f64::MIN_POSITIVE, f64::MAX)?;
        check_range("downside_threshold", st.downside_threshold, f64::MIN_POSITIVE, 100.0)?;
        st.entry_rule.validate()?;
        st.exit_rule.validate()?;
        if let RankingMethod::Momentum { lookback } = st.ranking {
            if lookback == 0 {
                return Err(ConfigError::InvalidRule("momentum lookback must be >= 1".into()));
            }
        }

        let ex = &self.execution;
        check_range("slippage", ex.slippage, 0.0, 99.0)?;
        check_range("exchange_fees", ex.exchange_fees, 0.0, 99.0)?;
        check_range("commission_amount", ex.commission_amount, 0.0, f64::MAX)?;
        check_range("borrow_cost", ex.borrow_cost, 0.0, 100.0)?;
        ex.trading_weekdays()?;

        self.rebalancing.validate()?;
        Ok(())
    }

    /// Maximum gross exposure multiple of portfolio value.
    pub fn leverage_cap(&self) -> f64 {
        if self.risk.leverage_allowed {
            self.risk.max_leverage
        } else {
            1.0
        }
    }

    /// Async oracle timeout as a `Duration`.
    pub fn signal_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.strategy.signal_timeout_ms)
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

fn check_opt(field: &'static str, value: Option<f64>, max: f64) -> Result<(), ConfigError> {
    match value {
        Some(v) => check_range(field, v, f64::MIN_POSITIVE, max),
        None => Ok(()),
    }
}

// ─── Market data ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarketDataConfig {
    /// Symbols the run may trade.
    pub universe: Vec<String>,
    /// First calendar date (inclusive). Defaults to the start of the data.
    pub start_date: Option<NaiveDate>,
    /// Last calendar date (inclusive). Defaults to the end of the data.
    pub end_date: Option<NaiveDate>,
    pub benchmark: Option<String>,
}

// ─── Strategy ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrategyConfig {
    pub entry_rule: EntryRule,
    pub exit_rule: ExitRule,
    /// Take-profit distance in percent.
    pub take_profit: Option<f64>,
    /// Stop distance; unit depends on `risk.stop_loss_type`.
    pub stop_loss: Option<f64>,
    /// Close after this many calendar days.
    pub time_based_exit: Option<u32>,

    pub position_sizing: PositionSizingMethod,
    pub fixed_dollar_amount: Option<f64>,
    pub portfolio_percent: Option<f64>,
    pub risk_percent: Option<f64>,
    pub fractional_shares: bool,
    pub max_positions: usize,

    /// Restricts entries to these symbols; `None` means the whole universe.
    pub eligible_symbols: Option<Vec<String>>,
    pub ranking: RankingMethod,
    pub trading_mode: TradingMode,

    /// Oracle exit thresholds in percent.
    pub upside_threshold: f64,
    pub downside_threshold: f64,
    /// Bound on async signal evaluation per timestamp.
    pub signal_timeout_ms: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            entry_rule: EntryRule::default(),
            exit_rule: ExitRule::default(),
            take_profit: None,
            stop_loss: None,
            time_based_exit: None,
            position_sizing: PositionSizingMethod::FixedDollar,
            fixed_dollar_amount: Some(1_000.0),
            portfolio_percent: None,
            risk_percent: None,
            fractional_shares: false,
            max_positions: 10,
            eligible_symbols: None,
            ranking: RankingMethod::UniverseOrder,
            trading_mode: TradingMode::LongOnly,
            upside_threshold: 10.0,
            downside_threshold: 5.0,
            signal_timeout_ms: 30_000,
        }
    }
}

/// Built-in entry rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EntryRule {
    /// Enter on the first calendar bar only.
    FirstBar,
    /// Enter on the first bar and then every `days` calendar days.
    EveryNDays { days: u32 },
    /// Enter whenever flat.
    Immediate,
    /// Fast SMA above slow SMA.
    MaCrossover { fast: usize, slow: usize },
    Never,
}

impl Default for EntryRule {
    fn default() -> Self {
        Self::MaCrossover { fast: 5, slow: 20 }
    }
}

impl EntryRule {
    fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::EveryNDays { days: 0 } => {
                Err(ConfigError::InvalidRule("every-n-days requires days >= 1".into()))
            }
            Self::MaCrossover { fast, slow } => validate_crossover(fast, slow),
            _ => Ok(()),
        }
    }
}

/// Built-in exit rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExitRule {
    /// Exit on the final calendar bar.
    LastBar,
    /// Exit once the position has been held `days` calendar days.
    AfterNDays { days: u32 },
    /// Fast SMA below slow SMA.
    MaCrossover { fast: usize, slow: usize },
    Never,
}

impl Default for ExitRule {
    fn default() -> Self {
        Self::MaCrossover { fast: 5, slow: 20 }
    }
}

impl ExitRule {
    fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::AfterNDays { days: 0 } => {
                Err(ConfigError::InvalidRule("after-n-days requires days >= 1".into()))
            }
            Self::MaCrossover { fast, slow } => validate_crossover(fast, slow),
            _ => Ok(()),
        }
    }
}

fn validate_crossover(fast: usize, slow: usize) -> Result<(), ConfigError> {
    if fast == 0 || fast >= slow {
        return Err(ConfigError::InvalidRule(format!(
            "ma-crossover needs 0 < fast < slow, got fast={fast} slow={slow}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PositionSizingMethod {
    FixedDollar,
    PortfolioPercent,
    RiskBased,
}

/// Ordering applied when signals exceed available slots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RankingMethod {
    UniverseOrder,
    SignalScore,
    Momentum { lookback: usize },
    Volume,
}

/// Which directions entry signals may open.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TradingMode {
    LongOnly,
    ShortOnly,
    /// Positive scores open longs, negative scores open shorts.
    LongShort,
}

// ─── Risk ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskConfig {
    pub initial_capital: f64,
    pub leverage_allowed: bool,
    pub max_leverage: f64,
    pub max_single_asset_percent: Option<f64>,
    pub max_sector_percent: Option<f64>,
    /// Gross exposure cap in percent of portfolio value.
    pub max_net_exposure: Option<f64>,
    pub stop_loss_type: StopLossType,
    pub use_trailing_stops: bool,
    /// Trailing distance in percent.
    pub trailing_stop_distance: Option<f64>,
    pub max_daily_drawdown: Option<f64>,
    pub max_weekly_drawdown: Option<f64>,
    pub halt_policy: HaltPolicy,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
            leverage_allowed: false,
            max_leverage: 1.0,
            max_single_asset_percent: None,
            max_sector_percent: None,
            max_net_exposure: None,
            stop_loss_type: StopLossType::FixedPercent,
            use_trailing_stops: false,
            trailing_stop_distance: None,
            max_daily_drawdown: None,
            max_weekly_drawdown: None,
            halt_policy: HaltPolicy::UntilBoundary,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StopLossType {
    /// `stop_loss` percent below (above for shorts) the entry price.
    FixedPercent,
    /// Close once the unrealized loss reaches `stop_loss` dollars.
    DollarBased,
    /// `stop_loss` multiples of ATR(14) away from entry.
    VolatilityBased,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HaltPolicy {
    /// A drawdown halt clears when the window that caused it resets.
    UntilBoundary,
    /// A drawdown halt lasts for the rest of the run.
    Permanent,
}

// ─── Execution ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub entry_timing: EntryTiming,
    pub commission_type: CommissionType,
    pub commission_amount: f64,
    /// Exchange fees in percent of trade value.
    pub exchange_fees: f64,
    /// Slippage in percent of price.
    pub slippage: f64,
    /// Weekday names to trade on; empty means every day present in the data.
    pub trading_days: Vec<String>,
    pub missing_data: MissingDataPolicy,
    pub short_selling_allowed: bool,
    /// Annual short borrow rate in percent.
    pub borrow_cost: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            entry_timing: EntryTiming::NextBarOpen,
            commission_type: CommissionType::PerTrade,
            commission_amount: 0.0,
            exchange_fees: 0.0,
            slippage: 0.0,
            trading_days: Vec::new(),
            missing_data: MissingDataPolicy::Skip,
            short_selling_allowed: false,
            borrow_cost: 0.0,
        }
    }
}

impl ExecutionConfig {
    /// Parse `trading_days` into weekdays. Empty input yields an empty list.
    pub fn trading_weekdays(&self) -> Result<Vec<Weekday>, ConfigError> {
        self.trading_days
            .iter()
            .map(|name| {
                name.trim()
                    .parse::<Weekday>()
                    .map_err(|_| ConfigError::UnknownTradingDay(name.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EntryTiming {
    NextBarOpen,
    SameBarClose,
    Midpoint,
    Vwap,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CommissionType {
    PerTrade,
    PerShare,
    /// One contract = 100 shares.
    PerContract,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MissingDataPolicy {
    Skip,
    ForwardFill,
    Interpolate,
}

// ─── Mark-to-market ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MtmConfig {
    pub frequency: MtmFrequency,
    pub price: MtmPrice,
    pub adjust_for_splits: bool,
    pub book_dividend_cashflows: bool,
}

impl Default for MtmConfig {
    fn default() -> Self {
        Self {
            frequency: MtmFrequency::EveryBar,
            price: MtmPrice::Close,
            adjust_for_splits: false,
            book_dividend_cashflows: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MtmFrequency {
    EveryBar,
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MtmPrice {
    Close,
    Mid,
    Vwap,
    Last,
}

// ─── Rebalancing ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RebalancingConfig {
    pub trigger: RebalanceTrigger,
    pub method: RebalanceMethod,
    /// Turnover cap in percent of portfolio value.
    pub max_turnover: Option<f64>,
    pub min_shares: Option<f64>,
    pub min_notional: Option<f64>,
    /// Close holdings that fall outside the eligible set.
    pub exit_ineligible: bool,
}

impl Default for RebalancingConfig {
    fn default() -> Self {
        Self {
            trigger: RebalanceTrigger::None,
            method: RebalanceMethod::EqualWeight,
            max_turnover: None,
            min_shares: None,
            min_notional: None,
            exit_ineligible: false,
        }
    }
}

impl RebalancingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_opt("max_turnover", self.max_turnover, 10_000.0)?;
        check_opt("min_shares", self.min_shares, f64::MAX)?;
        check_opt("min_notional", self.min_notional, f64::MAX)?;
        match self.trigger {
            RebalanceTrigger::Threshold { drift_pct } | RebalanceTrigger::Hybrid { drift_pct, .. } => {
                check_range("drift_pct", drift_pct, f64::MIN_POSITIVE, 100.0)?
            }
            _ => {}
        }
        match &self.method {
            RebalanceMethod::TargetWeights { weights } => {
                let total: f64 = weights.values().sum();
                if weights.values().any(|w| *w < 0.0) || total > 100.0 + 1e-9 {
                    return Err(ConfigError::InvalidRule(format!(
                        "target weights must be non-negative and sum to <= 100, got {total}"
                    )));
                }
            }
            RebalanceMethod::InverseVolatility { lookback } if *lookback < 2 => {
                return Err(ConfigError::InvalidRule(
                    "inverse-volatility lookback must be >= 2".into(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RebalanceTrigger {
    None,
    Calendar { frequency: RebalanceFrequency },
    /// Fires when any holding drifts more than `drift_pct` points from target.
    Threshold { drift_pct: f64 },
    /// Fires when an entry signal fired at the timestamp.
    Signal,
    /// Calendar check day AND drift exceeded.
    Hybrid {
        frequency: RebalanceFrequency,
        drift_pct: f64,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RebalanceFrequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RebalanceMethod {
    EqualWeight,
    /// Weights in percent of portfolio value, keyed by ticker.
    TargetWeights { weights: BTreeMap<String, f64> },
    InverseVolatility { lookback: usize },
}

// ─── Output ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub formats: Vec<OutputFormat>,
    /// Annual risk-free rate as a fraction.
    pub risk_free_rate: f64,
    pub periods_per_year: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            formats: vec![OutputFormat::Json],
            risk_free_rate: 0.02,
            periods_per_year: 252.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    Json,
    Csv,
    Markdown,
}
