//! Portfolio rebalancing: triggers, target weights and order planning.
//!
//! Rebalancing only resizes what the portfolio already holds (plus explicit
//! target-weight tickers). It never flips a position's direction: weights
//! apply to absolute exposure and the position's sign is kept.

use crate::config::{RebalanceFrequency, RebalanceMethod, RebalanceTrigger, RebalancingConfig};
use crate::data::MarketData;
use crate::portfolio::Portfolio;
use chrono::{Datelike, NaiveDateTime};
use std::collections::BTreeMap;

const WHOLE_SHARE_EPSILON: f64 = 1e-9;

/// A signed quantity change for one ticker.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceOrder {
    pub ticker: String,
    pub delta: f64,
    pub price: f64,
}

/// True if `now` falls in a later period than `prev`.
pub fn period_changed(prev: NaiveDateTime, now: NaiveDateTime, freq: RebalanceFrequency) -> bool {
    let (p, n) = (prev.date(), now.date());
    match freq {
        RebalanceFrequency::Daily => p != n,
        RebalanceFrequency::Weekly => p.iso_week() != n.iso_week(),
        RebalanceFrequency::Monthly => (p.year(), p.month()) != (n.year(), n.month()),
        RebalanceFrequency::Quarterly => (p.year(), p.month0() / 3) != (n.year(), n.month0() / 3),
    }
}

/// Sample standard deviation of simple returns over `closes`.
pub fn return_volatility(closes: &[f64]) -> Option<f64> {
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(var.sqrt())
}

#[derive(Debug, Clone)]
pub struct Rebalancer {
    cfg: RebalancingConfig,
    fractional_shares: bool,
}

impl Rebalancer {
    pub fn new(cfg: RebalancingConfig, fractional_shares: bool) -> Self {
        Self {
            cfg,
            fractional_shares,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.trigger != RebalanceTrigger::None
    }

    pub fn exit_ineligible(&self) -> bool {
        self.cfg.exit_ineligible
    }

    /// The trigger depends on this timestamp's entry signals.
    pub fn uses_signal_trigger(&self) -> bool {
        self.cfg.trigger == RebalanceTrigger::Signal
    }

    /// Whether a rebalance runs at `now`.
    ///
    /// `prev` is the previous calendar timestamp, `drift` the current maximum
    /// weight drift in percentage points and `signal_fired` whether any entry
    /// signal fired at `now`.
    pub fn should_rebalance(
        &self,
        prev: Option<NaiveDateTime>,
        now: NaiveDateTime,
        drift: f64,
        signal_fired: bool,
    ) -> bool {
        let calendar = |freq| prev.is_some_and(|p| period_changed(p, now, freq));
        match self.cfg.trigger {
            RebalanceTrigger::None => false,
            RebalanceTrigger::Calendar { frequency } => calendar(frequency),
            RebalanceTrigger::Threshold { drift_pct } => drift > drift_pct,
            RebalanceTrigger::Signal => signal_fired,
            RebalanceTrigger::Hybrid {
                frequency,
                drift_pct,
            } => calendar(frequency) && drift > drift_pct,
        }
    }

    /// Target weights as fractions of portfolio value.
    ///
    /// Equal-weight and inverse-volatility cover current holdings; target
    /// weights cover the configured tickers and zero out any other holding.
    /// Holdings without enough history for inverse volatility are left out.
    pub fn target_weights(
        &self,
        portfolio: &Portfolio,
        data: &MarketData,
        idx: usize,
    ) -> BTreeMap<String, f64> {
        let held: Vec<&String> = portfolio.positions.keys().collect();
        match &self.cfg.method {
            RebalanceMethod::EqualWeight => {
                if held.is_empty() {
                    return BTreeMap::new();
                }
                let w = 1.0 / held.len() as f64;
                held.into_iter().map(|t| (t.clone(), w)).collect()
            }
            RebalanceMethod::TargetWeights { weights } => {
                let mut out: BTreeMap<String, f64> =
                    held.into_iter().map(|t| (t.clone(), 0.0)).collect();
                for (t, w) in weights {
                    out.insert(t.clone(), w / 100.0);
                }
                out
            }
            RebalanceMethod::InverseVolatility { lookback } => {
                let inv: Vec<(String, f64)> = held
                    .into_iter()
                    .filter_map(|t| {
                        let vol = return_volatility(&data.recent_closes(t, idx, lookback + 1))?;
                        (vol > 0.0).then(|| (t.clone(), 1.0 / vol))
                    })
                    .collect();
                let total: f64 = inv.iter().map(|(_, v)| v).sum();
                if total <= 0.0 {
                    return BTreeMap::new();
                }
                inv.into_iter().map(|(t, v)| (t, v / total)).collect()
            }
        }
    }

    /// Largest absolute gap, in percentage points, between current and target
    /// weight.
    pub fn max_drift(portfolio: &Portfolio, targets: &BTreeMap<String, f64>) -> f64 {
        let value = portfolio.value();
        if value <= 0.0 {
            return 0.0;
        }
        targets
            .iter()
            .map(|(t, w)| {
                let current = portfolio.position(t).map_or(0.0, |p| p.exposure() / value);
                (current - w).abs() * 100.0
            })
            .fold(0.0, f64::max)
    }

    /// Orders moving holdings toward `targets` at `prices`.
    ///
    /// Reductions come first so entries can use the freed cash. Tickers
    /// without a price are left untouched.
    pub fn plan(
        &self,
        portfolio: &Portfolio,
        targets: &BTreeMap<String, f64>,
        prices: &BTreeMap<String, f64>,
    ) -> Vec<RebalanceOrder> {
        let value = portfolio.value();
        if value <= 0.0 {
            return Vec::new();
        }

        let mut orders: Vec<RebalanceOrder> = targets
            .iter()
            .filter_map(|(ticker, w)| {
                let price = *prices.get(ticker)?;
                if price <= 0.0 {
                    return None;
                }
                let current = portfolio.position(ticker).map_or(0.0, |p| p.quantity);
                let sign = if current < 0.0 { -1.0 } else { 1.0 };
                let target = sign * w * value / price;
                Some(RebalanceOrder {
                    ticker: ticker.clone(),
                    delta: self.round(target - current),
                    price,
                })
            })
            .collect();

        if let Some(max_turnover) = self.cfg.max_turnover {
            let cap = value * max_turnover / 100.0;
            let turnover: f64 = orders.iter().map(|o| o.delta.abs() * o.price).sum();
            if turnover > cap && turnover > 0.0 {
                let scale = cap / turnover;
                for o in &mut orders {
                    o.delta = self.round(o.delta * scale);
                }
            }
        }

        orders.retain(|o| {
            o.delta != 0.0
                && self.cfg.min_shares.map_or(true, |m| o.delta.abs() >= m)
                && self.cfg.min_notional.map_or(true, |m| o.delta.abs() * o.price >= m)
        });

        // Decreases (delta opposite to the holding) first.
        orders.sort_by_key(|o| {
            let held = portfolio.position(&o.ticker).map_or(0.0, |p| p.quantity);
            held == 0.0 || o.delta.signum() == held.signum()
        });
        orders
    }

    /// Whole shares toward zero unless fractional shares are enabled.
    fn round(&self, qty: f64) -> f64 {
        if self.fractional_shares {
            qty
        } else {
            qty.signum() * (qty.abs() + WHOLE_SHARE_EPSILON).floor()
        }
    }
}
