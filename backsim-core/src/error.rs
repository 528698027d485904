//! Error taxonomy for the backtest engine.
//!
//! Only [`EngineError`] aborts a run. Order rejections, signal failures and
//! numeric failures are recovered locally by the component that raised them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid configuration, detected before the first timestep.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("start date {start} must be before end date {end}")]
    InvalidDateRange { start: String, end: String },

    #[error("universe is empty")]
    EmptyUniverse,

    #[error("initial capital must be positive, got {0}")]
    NonPositiveCapital(f64),

    #[error("sizing method '{method}' requires '{field}'")]
    MissingSizingParameter { method: &'static str, field: &'static str },

    #[error("{field} = {value} is out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("max_positions must be at least 1")]
    ZeroMaxPositions,

    #[error("signal timeout must be positive")]
    NonPositiveTimeout,

    #[error("unknown trading day '{0}'")]
    UnknownTradingDay(String),

    #[error("invalid rule parameter: {0}")]
    InvalidRule(String),

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("config I/O error: {0}")]
    Io(String),
}

/// Market data that cannot be used for a run. Fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("series for '{ticker}' has {actual} bars, index has {expected}")]
    Misaligned {
        ticker: String,
        expected: usize,
        actual: usize,
    },

    #[error("timestamps are not strictly increasing at index {index}")]
    NonIncreasingTimestamps { index: usize },

    #[error("no data for ticker '{0}'")]
    MissingTicker(String),

    #[error("trading calendar is empty after filtering")]
    EmptyCalendar,

    #[error("data error: {0}")]
    Other(String),
}

/// Fatal errors that abort a backtest.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("data acquisition error: {0}")]
    DataAcquisition(#[from] DataError),

    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Which risk limit an order would breach.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RiskLimitKind {
    #[error("trading is halted")]
    Halted,

    #[error("short selling is not allowed")]
    ShortSellingDisabled,

    #[error("position already open")]
    AlreadyOpen,

    #[error("all {limit} position slots are taken")]
    MaxPositions { limit: usize },

    #[error("single-asset exposure {pct:.2}% exceeds {limit}%")]
    SingleAsset { pct: f64, limit: f64 },

    #[error("sector '{sector}' exposure {pct:.2}% exceeds {limit}%")]
    Sector { sector: String, pct: f64, limit: f64 },

    #[error("net exposure {pct:.2}% exceeds {limit}%")]
    NetExposure { pct: f64, limit: f64 },

    #[error("leverage {leverage:.2}x exceeds {limit}x")]
    Leverage { leverage: f64, limit: f64 },
}

/// Why a quantity could not be computed.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SizingError {
    #[error("missing sizing parameter '{field}'")]
    MissingParameter { field: String },

    #[error("stop distance is zero")]
    ZeroStopDistance,

    #[error("price must be positive, got {price}")]
    NonPositivePrice { price: f64 },

    #[error("sized quantity rounds to zero")]
    ZeroQuantity,
}

/// An order the engine refused. Logged and recorded; the loop continues.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OrderRejection {
    #[error("risk limit: {0}")]
    RiskLimit(RiskLimitKind),

    #[error("insufficient capital: need {required:.2}, have {available:.2}")]
    InsufficientCapital { required: f64, available: f64 },

    #[error("invalid size: {0}")]
    InvalidSize(SizingError),

    #[error("no price available")]
    NoPrice,
}

impl From<RiskLimitKind> for OrderRejection {
    fn from(kind: RiskLimitKind) -> Self {
        Self::RiskLimit(kind)
    }
}

impl From<SizingError> for OrderRejection {
    fn from(err: SizingError) -> Self {
        Self::InvalidSize(err)
    }
}

/// A signal source failed to produce a value. Treated as hold.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalError {
    #[error("signal source timed out")]
    Timeout,

    #[error("signal source error: {0}")]
    Source(String),
}

/// A metric that cannot be computed. Reported as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NumericError {
    #[error("not enough observations")]
    InsufficientData,

    #[error("zero variance")]
    ZeroVariance,

    #[error("division by zero")]
    DivisionByZero,

    #[error("non-finite result")]
    NonFinite,
}

/// Convert a numeric result into a finite value or `None`.
pub fn finite(value: f64) -> Result<f64, NumericError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(NumericError::NonFinite)
    }
}
