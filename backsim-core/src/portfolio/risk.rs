//! Risk manager: pre-trade limit checks and drawdown halts.

use crate::config::{BacktestConfig, HaltPolicy};
use crate::error::{OrderRejection, RiskLimitKind};
use serde::{Deserialize, Serialize};

/// Relative tolerance for ratio limits so exact-at-limit fills pass.
const LIMIT_EPSILON: f64 = 1e-9;

/// Limits enforced on every entry and every drawdown check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub leverage_allowed: bool,
    pub max_leverage: f64,
    pub max_single_asset_percent: Option<f64>,
    pub max_sector_percent: Option<f64>,
    pub max_net_exposure: Option<f64>,
    pub short_selling_allowed: bool,
    pub max_daily_drawdown: Option<f64>,
    pub max_weekly_drawdown: Option<f64>,
    pub halt_policy: HaltPolicy,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            leverage_allowed: false,
            max_leverage: 1.0,
            max_single_asset_percent: None,
            max_sector_percent: None,
            max_net_exposure: None,
            short_selling_allowed: false,
            max_daily_drawdown: None,
            max_weekly_drawdown: None,
            halt_policy: HaltPolicy::UntilBoundary,
        }
    }
}

impl RiskLimits {
    pub fn from_config(cfg: &BacktestConfig) -> Self {
        Self {
            leverage_allowed: cfg.risk.leverage_allowed,
            max_leverage: cfg.risk.max_leverage,
            max_single_asset_percent: cfg.risk.max_single_asset_percent,
            max_sector_percent: cfg.risk.max_sector_percent,
            max_net_exposure: cfg.risk.max_net_exposure,
            short_selling_allowed: cfg.execution.short_selling_allowed,
            max_daily_drawdown: cfg.risk.max_daily_drawdown,
            max_weekly_drawdown: cfg.risk.max_weekly_drawdown,
            halt_policy: cfg.risk.halt_policy,
        }
    }

    pub fn leverage_cap(&self) -> f64 {
        if self.leverage_allowed {
            self.max_leverage
        } else {
            1.0
        }
    }
}

/// Window whose drawdown limit was breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaltReason {
    DailyDrawdown,
    WeeklyDrawdown,
}

/// Drawdowns in percent relative to each window's peak.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawdownSnapshot {
    pub value: f64,
    pub daily_drawdown: f64,
    pub weekly_drawdown: f64,
    pub total_drawdown: f64,
}

/// Exposure picture of the portfolio just before a prospective entry.
#[derive(Debug, Clone, Copy)]
pub struct ExposureView {
    /// Portfolio value after paying the entry costs.
    pub value_after: f64,
    pub cash: f64,
    pub gross_exposure: f64,
    pub sector_exposure: f64,
    pub halted: bool,
}

/// A prospective entry or increase.
#[derive(Debug, Clone, Copy)]
pub struct EntryCheck {
    /// Signed quantity being added.
    pub quantity: f64,
    pub price: f64,
    pub costs: f64,
    /// Existing exposure in this ticker (zero for a new position).
    pub existing_exposure: f64,
}

/// Stateless rule evaluator over [`RiskLimits`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskManager {
    pub limits: RiskLimits,
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    /// Validate an entry against the live exposure view.
    ///
    /// Checks run in a fixed order: halt, short permission, capital, leverage,
    /// single asset, net exposure, sector.
    pub fn validate_entry(
        &self,
        view: &ExposureView,
        check: &EntryCheck,
    ) -> Result<(), OrderRejection> {
        let limits = &self.limits;
        if view.halted {
            return Err(RiskLimitKind::Halted.into());
        }
        if check.quantity < 0.0 && !limits.short_selling_allowed {
            return Err(RiskLimitKind::ShortSellingDisabled.into());
        }

        let added = check.quantity.abs() * check.price;
        let value = view.value_after;
        if value <= 0.0 {
            return Err(OrderRejection::InsufficientCapital {
                required: added + check.costs,
                available: value.max(0.0),
            });
        }
        if !limits.leverage_allowed && added + check.costs > view.cash * (1.0 + LIMIT_EPSILON) {
            return Err(OrderRejection::InsufficientCapital {
                required: added + check.costs,
                available: view.cash,
            });
        }

        let gross_after = view.gross_exposure + added;
        let leverage = gross_after / value;
        if leverage > limits.leverage_cap() * (1.0 + LIMIT_EPSILON) {
            return Err(RiskLimitKind::Leverage {
                leverage,
                limit: limits.leverage_cap(),
            }
            .into());
        }

        if let Some(limit) = limits.max_single_asset_percent {
            let pct = (check.existing_exposure + added) / value * 100.0;
            if pct > limit * (1.0 + LIMIT_EPSILON) {
                return Err(RiskLimitKind::SingleAsset { pct, limit }.into());
            }
        }

        if let Some(limit) = limits.max_net_exposure {
            let pct = gross_after / value * 100.0;
            if pct > limit * (1.0 + LIMIT_EPSILON) {
                return Err(RiskLimitKind::NetExposure { pct, limit }.into());
            }
        }

        Ok(())
    }

    /// Sector check, run separately because the sector name is owned by the caller.
    pub fn validate_sector(
        &self,
        sector: &str,
        view: &ExposureView,
        added: f64,
    ) -> Result<(), OrderRejection> {
        if let Some(limit) = self.limits.max_sector_percent {
            let pct = (view.sector_exposure + added) / view.value_after * 100.0;
            if pct > limit * (1.0 + LIMIT_EPSILON) {
                return Err(RiskLimitKind::Sector {
                    sector: sector.to_string(),
                    pct,
                    limit,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Return every window whose limit the snapshot breaches (strictly greater).
    pub fn breaches(&self, snapshot: &DrawdownSnapshot) -> Vec<HaltReason> {
        let mut out = Vec::new();
        if let Some(limit) = self.limits.max_daily_drawdown {
            if snapshot.daily_drawdown > limit {
                out.push(HaltReason::DailyDrawdown);
            }
        }
        if let Some(limit) = self.limits.max_weekly_drawdown {
            if snapshot.weekly_drawdown > limit {
                out.push(HaltReason::WeeklyDrawdown);
            }
        }
        out
    }
}
