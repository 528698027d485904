//! Rule-based exits: stop-loss, trailing stop, take-profit, time exit.
//!
//! Short positions mirror every rule: stops sit above entry, the trailing stop
//! follows the lowest price since entry, take-profit triggers on declines.

use crate::config::{BacktestConfig, StopLossType};
use crate::domain::{Bar, ExitReason, Position};
use chrono::NaiveDateTime;

/// Lookback for the volatility-based stop.
pub const ATR_PERIOD: usize = 14;

/// Average true range over the last `period` bars (oldest first).
///
/// Needs `period + 1` bars so every true range has a previous close.
pub fn atr(bars: &[&Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let window = &bars[bars.len() - period - 1..];
    let sum: f64 = window
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let b = w[1];
            (b.high - b.low)
                .max((b.high - prev_close).abs())
                .max((b.low - prev_close).abs())
        })
        .sum();
    Some(sum / period as f64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitRules {
    pub stop_loss: Option<f64>,
    pub stop_loss_type: StopLossType,
    /// Trailing distance in percent, when trailing stops are enabled.
    pub trailing_stop: Option<f64>,
    pub take_profit: Option<f64>,
    pub time_exit_days: Option<u32>,
}

impl ExitRules {
    pub fn from_config(cfg: &BacktestConfig) -> Self {
        Self {
            stop_loss: cfg.strategy.stop_loss,
            stop_loss_type: cfg.risk.stop_loss_type,
            trailing_stop: cfg
                .risk
                .trailing_stop_distance
                .filter(|_| cfg.risk.use_trailing_stops),
            take_profit: cfg.strategy.take_profit,
            time_exit_days: cfg.strategy.time_based_exit,
        }
    }

    pub fn needs_atr(&self) -> bool {
        self.stop_loss.is_some() && self.stop_loss_type == StopLossType::VolatilityBased
    }

    /// Per-share distance from entry to the stop, used by risk-based sizing.
    ///
    /// A dollar-based stop caps the total loss rather than the per-share move,
    /// so it has no per-share distance and risk-based sizing fails closed.
    pub fn stop_distance(&self, price: f64, atr: Option<f64>) -> Option<f64> {
        let sl = self.stop_loss?;
        match self.stop_loss_type {
            StopLossType::FixedPercent => Some(price * sl / 100.0),
            StopLossType::DollarBased => None,
            StopLossType::VolatilityBased => atr.map(|a| a * sl),
        }
    }

    /// Volatility stops are anchored to the ATR captured at entry; `atr` is
    /// only used for positions opened without one.
    pub fn stop_loss_hit(&self, pos: &Position, price: f64, atr: Option<f64>) -> bool {
        let Some(sl) = self.stop_loss else {
            return false;
        };
        match self.stop_loss_type {
            StopLossType::FixedPercent => {
                if pos.is_short() {
                    price >= pos.entry_price * (1.0 + sl / 100.0)
                } else {
                    price <= pos.entry_price * (1.0 - sl / 100.0)
                }
            }
            StopLossType::DollarBased => pos.quantity * (price - pos.entry_price) <= -sl,
            StopLossType::VolatilityBased => match pos.entry_atr.or(atr) {
                Some(a) if pos.is_short() => price >= pos.entry_price + sl * a,
                Some(a) => price <= pos.entry_price - sl * a,
                None => false,
            },
        }
    }

    pub fn trailing_stop_hit(&self, pos: &Position, price: f64) -> bool {
        let Some(d) = self.trailing_stop else {
            return false;
        };
        if pos.is_short() {
            price >= pos.lowest_price * (1.0 + d / 100.0)
        } else {
            price <= pos.highest_price * (1.0 - d / 100.0)
        }
    }

    pub fn take_profit_hit(&self, pos: &Position, price: f64) -> bool {
        self.take_profit
            .is_some_and(|tp| pos.return_pct_at(price) >= tp)
    }

    pub fn time_exit_hit(&self, pos: &Position, now: NaiveDateTime) -> bool {
        self.time_exit_days
            .is_some_and(|days| pos.holding_days(now) >= i64::from(days))
    }

    /// First rule that fires, in priority order. The strategy signal is
    /// evaluated separately and only when no rule fires.
    pub fn evaluate(
        &self,
        pos: &Position,
        price: f64,
        now: NaiveDateTime,
        atr: Option<f64>,
    ) -> Option<ExitReason> {
        if self.stop_loss_hit(pos, price, atr) {
            Some(ExitReason::StopLoss)
        } else if self.trailing_stop_hit(pos, price) {
            Some(ExitReason::TrailingStop)
        } else if self.take_profit_hit(pos, price) {
            Some(ExitReason::TakeProfit)
        } else if self.time_exit_hit(pos, now) {
            Some(ExitReason::TimeExit)
        } else {
            None
        }
    }
}
