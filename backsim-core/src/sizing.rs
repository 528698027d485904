//! Position sizing: translate capital and risk budgets into share quantities.
//!
//! Sizers are signal-agnostic: they return an unsigned quantity and the caller
//! applies the direction.

use crate::config::{PositionSizingMethod, StrategyConfig};
use crate::error::{ConfigError, SizingError};

/// Small tolerance so exact multiples survive floating-point division before flooring.
const WHOLE_SHARE_EPSILON: f64 = 1e-9;

/// Sizing method with its parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizingMethod {
    /// Fixed dollar amount per trade.
    FixedDollar { amount: f64 },
    /// Percent of current portfolio value per trade.
    PortfolioPercent { pct: f64 },
    /// Risk this percent of capital between entry and stop.
    RiskBased { risk_pct: f64 },
}

/// Raw (fractional) quantity for a sizing method.
///
/// Fails closed on a non-positive price, and on a zero or missing stop distance
/// for risk-based sizing.
pub fn calculate_position_size(
    method: SizingMethod,
    capital: f64,
    price: f64,
    stop_distance: Option<f64>,
) -> Result<f64, SizingError> {
    if price <= 0.0 || !price.is_finite() {
        return Err(SizingError::NonPositivePrice { price });
    }
    let qty = match method {
        SizingMethod::FixedDollar { amount } => amount / price,
        SizingMethod::PortfolioPercent { pct } => capital * pct / 100.0 / price,
        SizingMethod::RiskBased { risk_pct } => {
            let distance = stop_distance.ok_or(SizingError::ZeroStopDistance)?.abs();
            if distance == 0.0 || !distance.is_finite() {
                return Err(SizingError::ZeroStopDistance);
            }
            capital * risk_pct / 100.0 / distance
        }
    };
    Ok(qty.max(0.0))
}

/// Configured sizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSizer {
    pub method: SizingMethod,
    pub fractional_shares: bool,
}

impl PositionSizer {
    pub fn new(method: SizingMethod, fractional_shares: bool) -> Self {
        Self {
            method,
            fractional_shares,
        }
    }

    pub fn from_config(cfg: &StrategyConfig) -> Result<Self, ConfigError> {
        let method = match cfg.position_sizing {
            PositionSizingMethod::FixedDollar => SizingMethod::FixedDollar {
                amount: cfg.fixed_dollar_amount.ok_or(ConfigError::MissingSizingParameter {
                    method: "fixed-dollar",
                    field: "fixed_dollar_amount",
                })?,
            },
            PositionSizingMethod::PortfolioPercent => SizingMethod::PortfolioPercent {
                pct: cfg.portfolio_percent.ok_or(ConfigError::MissingSizingParameter {
                    method: "portfolio-percent",
                    field: "portfolio_percent",
                })?,
            },
            PositionSizingMethod::RiskBased => SizingMethod::RiskBased {
                risk_pct: cfg.risk_percent.ok_or(ConfigError::MissingSizingParameter {
                    method: "risk-based",
                    field: "risk_percent",
                })?,
            },
        };
        Ok(Self::new(method, cfg.fractional_shares))
    }

    /// Unsigned tradable quantity; whole shares unless fractional sizing is enabled.
    pub fn size(
        &self,
        capital: f64,
        price: f64,
        stop_distance: Option<f64>,
    ) -> Result<f64, SizingError> {
        let raw = calculate_position_size(self.method, capital, price, stop_distance)?;
        let qty = if self.fractional_shares {
            raw
        } else {
            (raw + WHOLE_SHARE_EPSILON).floor()
        };
        if qty <= 0.0 {
            return Err(SizingError::ZeroQuantity);
        }
        Ok(qty)
    }

    pub fn name(&self) -> &'static str {
        match self.method {
            SizingMethod::FixedDollar { .. } => "fixed-dollar",
            SizingMethod::PortfolioPercent { .. } => "portfolio-percent",
            SizingMethod::RiskBased { .. } => "risk-based",
        }
    }
}
