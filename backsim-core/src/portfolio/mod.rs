//! Portfolio: cash, open positions, trade log, equity curve and risk state.
//!
//! The accounting identity `value == cash + Σ quantity × mark` holds at every
//! mark-to-market point. Quantities are signed, so opening a short credits
//! cash and the negative market value offsets it.

pub mod risk;

pub use risk::{DrawdownSnapshot, EntryCheck, ExposureView, HaltReason, RiskLimits, RiskManager};

use crate::config::HaltPolicy;
use crate::domain::{ExitReason, Position, PositionSide, Trade};
use crate::error::{OrderRejection, RiskLimitKind, SizingError};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// Tolerance for the accounting identity, relative to portfolio value.
const IDENTITY_TOLERANCE: f64 = 1e-6;

/// One point on the equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: NaiveDateTime,
    pub value: f64,
}

/// An executed order ready to be booked.
#[derive(Debug, Clone)]
pub struct Fill {
    pub ticker: String,
    /// Signed quantity: positive buys, negative sells short.
    pub quantity: f64,
    pub price: f64,
    pub costs: f64,
    pub timestamp: NaiveDateTime,
    pub sector: Option<String>,
}

/// Running totals used to cross-check the accounting identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    pub realized_gross: f64,
    pub transaction_costs: f64,
    pub borrow_costs: f64,
    pub dividends: f64,
}

#[derive(Debug, Clone)]
pub struct Portfolio {
    pub initial_capital: f64,
    pub cash: f64,
    pub positions: BTreeMap<String, Position>,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub ledger: Ledger,

    pub peak_value: f64,
    pub daily_peak: f64,
    pub weekly_peak: f64,

    halted_daily: bool,
    halted_weekly: bool,
    halt_reason: Option<HaltReason>,

    risk: RiskManager,
}

impl Portfolio {
    pub fn new(initial_capital: f64, limits: RiskLimits) -> Self {
        Self {
            initial_capital,
            cash: initial_capital,
            positions: BTreeMap::new(),
            trades: Vec::new(),
            equity_curve: Vec::new(),
            ledger: Ledger::default(),
            peak_value: initial_capital,
            daily_peak: initial_capital,
            weekly_peak: initial_capital,
            halted_daily: false,
            halted_weekly: false,
            halt_reason: None,
            risk: RiskManager::new(limits),
        }
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    // ─── Valuation ───────────────────────────────────────────────────

    /// Signed market value of all positions at their last marks.
    pub fn positions_value(&self) -> f64 {
        self.positions.values().map(Position::market_value).sum()
    }

    /// Σ |position value|.
    pub fn gross_exposure(&self) -> f64 {
        self.positions.values().map(Position::exposure).sum()
    }

    /// Cash plus position value at the last marks.
    pub fn value(&self) -> f64 {
        self.cash + self.positions_value()
    }

    pub fn sector_exposure(&self, sector: &str) -> f64 {
        self.positions
            .values()
            .filter(|p| p.sector.as_deref() == Some(sector))
            .map(Position::exposure)
            .sum()
    }

    /// Cash available for new longs, or remaining gross capacity under leverage.
    pub fn buying_power(&self) -> f64 {
        let limits = &self.risk.limits;
        if limits.leverage_allowed {
            (self.value() * limits.max_leverage - self.gross_exposure()).max(0.0)
        } else {
            self.cash.max(0.0)
        }
    }

    pub fn has_position(&self, ticker: &str) -> bool {
        self.positions.contains_key(ticker)
    }

    pub fn position(&self, ticker: &str) -> Option<&Position> {
        self.positions.get(ticker)
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    // ─── Halt state ──────────────────────────────────────────────────

    pub fn is_halted(&self) -> bool {
        self.halted_daily || self.halted_weekly
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.halt_reason
    }

    /// Compare current drawdowns against the limits and halt on breach.
    ///
    /// Returns the windows that breached on this call.
    pub fn check_drawdown_limits(&mut self) -> Vec<HaltReason> {
        let snapshot = self.drawdowns();
        let breaches = self.risk.breaches(&snapshot);
        for reason in &breaches {
            let newly = match reason {
                HaltReason::DailyDrawdown => !std::mem::replace(&mut self.halted_daily, true),
                HaltReason::WeeklyDrawdown => !std::mem::replace(&mut self.halted_weekly, true),
            };
            if newly {
                warn!(
                    ?reason,
                    daily_dd = snapshot.daily_drawdown,
                    weekly_dd = snapshot.weekly_drawdown,
                    "drawdown limit breached, halting new entries"
                );
            }
            self.halt_reason = Some(*reason);
        }
        breaches
    }

    /// Reset the daily peak to the current value; under the boundary policy
    /// this also releases a daily halt.
    pub fn reset_daily_peak(&mut self) {
        self.daily_peak = self.value();
        if self.halted_daily && self.risk.limits.halt_policy == HaltPolicy::UntilBoundary {
            self.halted_daily = false;
            info!("daily boundary reached, releasing daily drawdown halt");
            self.refresh_halt_reason();
        }
    }

    /// Reset the weekly peak to the current value; under the boundary policy
    /// this also releases a weekly halt.
    pub fn reset_weekly_peak(&mut self) {
        self.weekly_peak = self.value();
        if self.halted_weekly && self.risk.limits.halt_policy == HaltPolicy::UntilBoundary {
            self.halted_weekly = false;
            info!("weekly boundary reached, releasing weekly drawdown halt");
            self.refresh_halt_reason();
        }
    }

    fn refresh_halt_reason(&mut self) {
        self.halt_reason = if self.halted_weekly {
            Some(HaltReason::WeeklyDrawdown)
        } else if self.halted_daily {
            Some(HaltReason::DailyDrawdown)
        } else {
            None
        };
    }

    /// Drawdowns (percent) of the current value against each peak.
    pub fn drawdowns(&self) -> DrawdownSnapshot {
        let value = self.value();
        let dd = |peak: f64| {
            if peak > 0.0 {
                ((peak - value) / peak * 100.0).max(0.0)
            } else {
                0.0
            }
        };
        DrawdownSnapshot {
            value,
            daily_drawdown: dd(self.daily_peak),
            weekly_drawdown: dd(self.weekly_peak),
            total_drawdown: dd(self.peak_value),
        }
    }

    // ─── Mark-to-market ──────────────────────────────────────────────

    /// Re-mark positions, append an equity point, update peaks.
    ///
    /// Tickers missing from `prices` keep their previous mark.
    pub fn mark_to_market(
        &mut self,
        prices: &BTreeMap<String, f64>,
        timestamp: NaiveDateTime,
    ) -> DrawdownSnapshot {
        for (ticker, pos) in self.positions.iter_mut() {
            if let Some(&price) = prices.get(ticker) {
                pos.update_mark(price);
            }
        }
        let value = self.value();
        if let Some(last) = self.equity_curve.last().filter(|p| p.timestamp >= timestamp) {
            error!(last = %last.timestamp, %timestamp, "equity point out of time order");
        }
        self.equity_curve.push(EquityPoint { timestamp, value });
        self.peak_value = self.peak_value.max(value);
        self.daily_peak = self.daily_peak.max(value);
        self.weekly_peak = self.weekly_peak.max(value);
        self.drawdowns()
    }

    /// Difference between the marked value and the value implied by the ledger.
    pub fn accounting_discrepancy(&self) -> f64 {
        let unrealized: f64 = self.positions.values().map(|p| p.unrealized_pnl).sum();
        let implied = self.initial_capital + self.ledger.realized_gross + unrealized
            - self.ledger.transaction_costs
            - self.ledger.borrow_costs
            + self.ledger.dividends;
        self.value() - implied
    }

    /// Check the accounting identity; returns the current value.
    pub fn verify_equity(&self) -> f64 {
        let value = self.value();
        let err = self.accounting_discrepancy();
        let tolerance = IDENTITY_TOLERANCE * value.abs().max(1.0);
        if err.abs() > tolerance {
            error!(discrepancy = err, value, "accounting identity violated");
        }
        value
    }

    // ─── Order booking ───────────────────────────────────────────────

    fn exposure_view(&self, costs: f64, sector: Option<&str>) -> ExposureView {
        ExposureView {
            value_after: self.value() - costs,
            cash: self.cash,
            gross_exposure: self.gross_exposure(),
            sector_exposure: sector.map_or(0.0, |s| self.sector_exposure(s)),
            halted: self.is_halted(),
        }
    }

    /// Validate an entry without booking it.
    pub fn can_open_position(&self, fill: &Fill) -> Result<(), OrderRejection> {
        if self.has_position(&fill.ticker) {
            return Err(RiskLimitKind::AlreadyOpen.into());
        }
        let view = self.exposure_view(fill.costs, fill.sector.as_deref());
        self.risk.validate_entry(
            &view,
            &EntryCheck {
                quantity: fill.quantity,
                price: fill.price,
                costs: fill.costs,
                existing_exposure: 0.0,
            },
        )?;
        if let Some(sector) = fill.sector.as_deref() {
            self.risk
                .validate_sector(sector, &view, fill.quantity.abs() * fill.price)?;
        }
        Ok(())
    }

    /// Validate and book a new position.
    pub fn open_position(&mut self, fill: Fill) -> Result<(), OrderRejection> {
        if fill.quantity == 0.0 {
            return Err(SizingError::ZeroQuantity.into());
        }
        if fill.price <= 0.0 || !fill.price.is_finite() {
            return Err(OrderRejection::NoPrice);
        }
        self.can_open_position(&fill)?;

        self.cash -= fill.quantity * fill.price + fill.costs;
        self.ledger.transaction_costs += fill.costs;
        debug!(
            ticker = %fill.ticker,
            quantity = fill.quantity,
            price = fill.price,
            costs = fill.costs,
            "opened position"
        );
        let position = Position::open(
            fill.ticker.clone(),
            fill.quantity,
            fill.price,
            fill.timestamp,
            fill.costs,
            fill.sector,
        );
        self.positions.insert(fill.ticker, position);
        Ok(())
    }

    /// Close a position completely, append the trade and credit cash.
    pub fn close_position(
        &mut self,
        ticker: &str,
        exit_price: f64,
        exit_costs: f64,
        timestamp: NaiveDateTime,
        reason: ExitReason,
    ) -> Option<Trade> {
        let mut pos = self.positions.remove(ticker)?;
        pos.update_mark(exit_price);
        self.cash += pos.quantity * exit_price - exit_costs;
        let trade = realize(&pos, pos.quantity, 1.0, exit_price, exit_costs, timestamp, reason);
        self.ledger.realized_gross += trade.gross_pnl;
        self.ledger.transaction_costs += exit_costs;
        info!(
            ticker,
            net_pnl = trade.net_pnl,
            pnl_pct = trade.pnl_pct,
            reason = reason.as_str(),
            "closed position"
        );
        self.trades.push(trade.clone());
        Some(trade)
    }

    /// Change an existing position by a signed `delta`.
    ///
    /// A same-direction delta increases the position at a blended entry price
    /// and is risk-checked like an entry. An opposite delta reduces it and
    /// realizes the proportional P&L as a rebalance trade; a reduction of the
    /// whole quantity or more closes the position without flipping it.
    pub fn adjust_position(
        &mut self,
        ticker: &str,
        delta: f64,
        price: f64,
        costs: f64,
        timestamp: NaiveDateTime,
    ) -> Result<Option<Trade>, OrderRejection> {
        let Some(pos) = self.positions.get(ticker) else {
            return Err(OrderRejection::NoPrice);
        };
        if delta == 0.0 {
            return Ok(None);
        }
        if price <= 0.0 || !price.is_finite() {
            return Err(OrderRejection::NoPrice);
        }

        let increasing = delta.signum() == pos.quantity.signum();
        if increasing {
            let view = self.exposure_view(costs, pos.sector.as_deref());
            let existing = pos.exposure();
            self.risk.validate_entry(
                &view,
                &EntryCheck {
                    quantity: delta,
                    price,
                    costs,
                    existing_exposure: existing,
                },
            )?;
            if let Some(sector) = pos.sector.as_deref() {
                self.risk.validate_sector(sector, &view, delta.abs() * price)?;
            }
            self.cash -= delta * price + costs;
            self.ledger.transaction_costs += costs;
            if let Some(pos) = self.positions.get_mut(ticker) {
                let new_qty = pos.quantity + delta;
                pos.entry_price = (pos.quantity * pos.entry_price + delta * price) / new_qty;
                pos.quantity = new_qty;
                pos.entry_costs += costs;
                pos.cost_basis = new_qty.abs() * pos.entry_price + pos.entry_costs;
                let mark = pos.current_price;
                pos.update_mark(mark);
            }
            debug!(ticker, delta, price, "increased position");
            return Ok(None);
        }

        if delta.abs() >= pos.quantity.abs() {
            return Ok(self.close_position(ticker, price, costs, timestamp, ExitReason::Rebalance));
        }

        let Some(pos) = self.positions.get_mut(ticker) else {
            return Ok(None);
        };
        let closed_qty = -delta;
        let fraction = closed_qty / pos.quantity;
        self.cash += closed_qty * price - costs;
        let trade = realize(pos, closed_qty, fraction, price, costs, timestamp, ExitReason::Rebalance);
        pos.quantity += delta;
        pos.entry_costs *= 1.0 - fraction;
        pos.borrow_cost *= 1.0 - fraction;
        pos.dividends *= 1.0 - fraction;
        pos.cost_basis = pos.quantity.abs() * pos.entry_price + pos.entry_costs;
        let mark = pos.current_price;
        pos.update_mark(mark);

        self.ledger.realized_gross += trade.gross_pnl;
        self.ledger.transaction_costs += costs;
        debug!(ticker, delta, net_pnl = trade.net_pnl, "reduced position");
        self.trades.push(trade.clone());
        Ok(Some(trade))
    }

    // ─── Carrying cash flows ─────────────────────────────────────────

    /// Book a dividend for a held ticker. Shorts pay the dividend.
    pub fn apply_dividend(&mut self, ticker: &str, amount_per_share: f64) -> f64 {
        let Some(pos) = self.positions.get_mut(ticker) else {
            return 0.0;
        };
        let cash_flow = pos.quantity * amount_per_share;
        pos.dividends += cash_flow;
        self.cash += cash_flow;
        self.ledger.dividends += cash_flow;
        debug!(ticker, cash_flow, "booked dividend");
        cash_flow
    }

    pub fn apply_split(&mut self, ticker: &str, ratio: f64) -> bool {
        match self.positions.get_mut(ticker) {
            Some(pos) => {
                pos.apply_split(ratio);
                debug!(ticker, ratio, "applied split");
                true
            }
            None => false,
        }
    }

    /// Charge accrued borrow cost for a short position against cash.
    pub fn accrue_borrow(&mut self, ticker: &str, cost: f64) {
        if cost <= 0.0 {
            return;
        }
        if let Some(pos) = self.positions.get_mut(ticker) {
            pos.borrow_cost += cost;
            self.cash -= cost;
            self.ledger.borrow_costs += cost;
        }
    }
}

/// Build the trade record for closing `closed_qty` of `pos`.
///
/// `fraction` is the share of the position being closed; entry costs, borrow
/// and dividends are attributed proportionally.
fn realize(
    pos: &Position,
    closed_qty: f64,
    fraction: f64,
    exit_price: f64,
    exit_costs: f64,
    timestamp: NaiveDateTime,
    reason: ExitReason,
) -> Trade {
    let entry_costs = pos.entry_costs * fraction;
    let borrow_cost = pos.borrow_cost * fraction;
    let dividends = pos.dividends * fraction;
    let gross_pnl = closed_qty * (exit_price - pos.entry_price);
    let net_pnl = gross_pnl - entry_costs - exit_costs - borrow_cost + dividends;
    let side = PositionSide::from_quantity(closed_qty);
    let pnl_pct = if pos.entry_price != 0.0 {
        side.sign() * (exit_price - pos.entry_price) / pos.entry_price * 100.0
    } else {
        0.0
    };
    Trade {
        ticker: pos.ticker.clone(),
        side,
        entry_timestamp: pos.entry_timestamp,
        entry_price: pos.entry_price,
        exit_timestamp: timestamp,
        exit_price,
        quantity: closed_qty,
        gross_pnl,
        entry_costs,
        exit_costs,
        borrow_cost,
        dividends,
        net_pnl,
        pnl_pct,
        holding_period_days: pos.holding_days(timestamp),
        exit_reason: reason,
    }
}
