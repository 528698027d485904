//! Run output types.

use crate::config::RunId;
use crate::domain::{Position, Trade};
use crate::error::OrderRejection;
use crate::portfolio::{EquityPoint, HaltReason, Ledger};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// An order the engine declined, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedOrder {
    pub timestamp: NaiveDateTime,
    pub ticker: String,
    /// Signed quantity, zero when sizing itself failed.
    pub quantity: f64,
    pub reason: OrderRejection,
}

/// Everything a run produced, through the last completed timestep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub initial_capital: f64,
    pub final_value: f64,
    pub cash: f64,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Trade>,
    /// Open positions marked at the last known prices.
    pub positions: Vec<Position>,
    pub rejected_orders: Vec<RejectedOrder>,
    pub ledger: Ledger,
    pub signal_timeouts: usize,
    pub signal_errors: usize,
    /// Timestamps in the filtered trading calendar.
    pub calendar_len: usize,
    /// Timestamps fully processed.
    pub steps_completed: usize,
    pub halted: bool,
    pub halt_reason: Option<HaltReason>,
    pub cancelled: bool,
}

impl RunResult {
    pub fn total_return_pct(&self) -> f64 {
        if self.initial_capital > 0.0 {
            (self.final_value / self.initial_capital - 1.0) * 100.0
        } else {
            0.0
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.steps_completed == self.calendar_len
    }
}
