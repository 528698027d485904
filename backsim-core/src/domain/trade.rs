//! Trade: an immutable closed-position record.

use super::position::PositionSide;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    TimeExit,
    StrategySignal,
    Rebalance,
    Ineligible,
    Delisted,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::TrailingStop => "trailing_stop",
            Self::TakeProfit => "take_profit",
            Self::TimeExit => "time_exit",
            Self::StrategySignal => "strategy_signal",
            Self::Rebalance => "rebalance",
            Self::Ineligible => "ineligible",
            Self::Delisted => "delisted",
        }
    }
}

/// A complete round trip: entry → exit (or a partial reduction during a rebalance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub ticker: String,
    pub side: PositionSide,

    pub entry_timestamp: NaiveDateTime,
    pub entry_price: f64,

    pub exit_timestamp: NaiveDateTime,
    pub exit_price: f64,

    /// Signed quantity closed.
    pub quantity: f64,

    /// quantity * (exit_price - entry_price).
    pub gross_pnl: f64,
    pub entry_costs: f64,
    pub exit_costs: f64,
    pub borrow_cost: f64,
    pub dividends: f64,
    /// gross - entry costs - exit costs - borrow cost + dividends.
    pub net_pnl: f64,
    /// Price move in percent, signed for the trade's direction.
    pub pnl_pct: f64,

    pub holding_period_days: i64,
    pub exit_reason: ExitReason,
}

impl Trade {
    /// All transaction and carrying costs of the round trip.
    pub fn total_costs(&self) -> f64 {
        self.entry_costs + self.exit_costs + self.borrow_cost
    }

    pub fn is_winner(&self) -> bool {
        self.net_pnl > 0.0
    }

    pub fn is_loser(&self) -> bool {
        self.net_pnl < 0.0
    }
}
