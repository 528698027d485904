//! Mutable engine state that evolves timestep by timestep.

use super::result::RejectedOrder;
use crate::domain::{ExitReason, PositionSide};
use crate::error::OrderRejection;
use crate::portfolio::Portfolio;
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// An entry decided at one bar, filled at the next bar's open.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub ticker: String,
    pub side: PositionSide,
    pub decided_at: NaiveDateTime,
}

/// An exit decided at one bar, filled at the next bar's open.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingExit {
    pub ticker: String,
    pub reason: ExitReason,
    pub decided_at: NaiveDateTime,
}

pub struct EngineState {
    pub portfolio: Portfolio,
    pub pending_entries: Vec<PendingEntry>,
    pub pending_exits: Vec<PendingExit>,
    /// Next calendar step to process.
    pub cursor: usize,
    /// Calendar step of the last mark-to-market.
    pub last_mtm_step: Option<usize>,
    pub prev_timestamp: Option<NaiveDateTime>,
    /// Last price seen per ticker, for marking and forced closes.
    pub last_prices: BTreeMap<String, f64>,
    pub delisted: BTreeSet<String>,
    pub rejected_orders: Vec<RejectedOrder>,
    pub signal_timeouts: usize,
    pub signal_errors: usize,
    pub cancelled: bool,
}

impl EngineState {
    pub fn new(portfolio: Portfolio) -> Self {
        Self {
            portfolio,
            pending_entries: Vec::new(),
            pending_exits: Vec::new(),
            cursor: 0,
            last_mtm_step: None,
            prev_timestamp: None,
            last_prices: BTreeMap::new(),
            delisted: BTreeSet::new(),
            rejected_orders: Vec::new(),
            signal_timeouts: 0,
            signal_errors: 0,
            cancelled: false,
        }
    }

    pub fn reject(
        &mut self,
        timestamp: NaiveDateTime,
        ticker: &str,
        quantity: f64,
        reason: OrderRejection,
    ) {
        debug!(ticker, quantity, %reason, "order rejected");
        self.rejected_orders.push(RejectedOrder {
            timestamp,
            ticker: ticker.to_string(),
            quantity,
            reason,
        });
    }

    pub fn has_pending_entry(&self, ticker: &str) -> bool {
        self.pending_entries.iter().any(|e| e.ticker == ticker)
    }

    pub fn has_pending_exit(&self, ticker: &str) -> bool {
        self.pending_exits.iter().any(|e| e.ticker == ticker)
    }

    /// Held, queued or delisted tickers; none of them may receive a new entry.
    pub fn entry_exclusions(&self) -> BTreeSet<String> {
        self.portfolio
            .positions
            .keys()
            .cloned()
            .chain(self.pending_entries.iter().map(|e| e.ticker.clone()))
            .chain(self.delisted.iter().cloned())
            .collect()
    }

    /// Open plus queued positions.
    pub fn committed_slots(&self) -> usize {
        self.portfolio.position_count() + self.pending_entries.len()
    }
}
