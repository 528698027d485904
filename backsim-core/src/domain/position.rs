//! Position: an open holding in a single ticker.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1.0 for long, -1.0 for short.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn from_quantity(quantity: f64) -> Self {
        if quantity < 0.0 {
            Self::Short
        } else {
            Self::Long
        }
    }
}

/// Open position state.
///
/// Quantity is signed: positive for long, negative for short. The market value
/// is `quantity * current_price`, so a short contributes negative value and the
/// cash credited at entry balances it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_timestamp: NaiveDateTime,
    /// Absolute entry notional plus entry transaction costs.
    pub cost_basis: f64,
    /// Transaction costs paid at entry (commission + exchange fees).
    pub entry_costs: f64,
    /// Last mark price.
    pub current_price: f64,
    pub unrealized_pnl: f64,
    /// Highest price observed since entry (long trailing stop reference).
    pub highest_price: f64,
    /// Lowest price observed since entry (short trailing stop reference).
    pub lowest_price: f64,
    /// Short-borrow cost accrued against cash while the position is open.
    pub borrow_cost: f64,
    /// Dividend cash flows booked while the position is open (negative for shorts).
    pub dividends: f64,
    pub sector: Option<String>,
    /// ATR(14) captured when the position opened; anchors the volatility stop.
    #[serde(default)]
    pub entry_atr: Option<f64>,
}

impl Position {
    pub fn open(
        ticker: impl Into<String>,
        quantity: f64,
        entry_price: f64,
        entry_timestamp: NaiveDateTime,
        entry_costs: f64,
        sector: Option<String>,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            quantity,
            entry_price,
            entry_timestamp,
            cost_basis: quantity.abs() * entry_price + entry_costs,
            entry_costs,
            current_price: entry_price,
            unrealized_pnl: 0.0,
            highest_price: entry_price,
            lowest_price: entry_price,
            borrow_cost: 0.0,
            dividends: 0.0,
            sector,
            entry_atr: None,
        }
    }

    pub fn with_entry_atr(mut self, atr: Option<f64>) -> Self {
        self.entry_atr = atr;
        self
    }

    pub fn side(&self) -> PositionSide {
        PositionSide::from_quantity(self.quantity)
    }

    pub fn is_long(&self) -> bool {
        self.quantity > 0.0
    }

    pub fn is_short(&self) -> bool {
        self.quantity < 0.0
    }

    /// Signed market value at the last mark.
    pub fn market_value(&self) -> f64 {
        self.quantity * self.current_price
    }

    /// Unsigned exposure at the last mark.
    pub fn exposure(&self) -> f64 {
        self.market_value().abs()
    }

    /// Re-mark the position at `price` and refresh the trailing extremes.
    pub fn update_mark(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = self.quantity * (price - self.entry_price);
        self.track_extremes(price);
    }

    /// Extend the since-entry high/low without re-marking.
    pub fn track_extremes(&mut self, price: f64) {
        if price > self.highest_price {
            self.highest_price = price;
        }
        if price < self.lowest_price {
            self.lowest_price = price;
        }
    }

    /// Unrealized return relative to entry, in percent, signed for the position's direction.
    pub fn return_pct_at(&self, price: f64) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        self.side().sign() * (price - self.entry_price) / self.entry_price * 100.0
    }

    /// Calendar days held as of `now`.
    pub fn holding_days(&self, now: NaiveDateTime) -> i64 {
        (now - self.entry_timestamp).num_days()
    }

    /// Apply a share split: quantity scales up by `ratio`, every price reference scales down.
    pub fn apply_split(&mut self, ratio: f64) {
        if ratio <= 0.0 {
            return;
        }
        self.quantity *= ratio;
        self.entry_price /= ratio;
        self.current_price /= ratio;
        self.highest_price /= ratio;
        self.lowest_price /= ratio;
        if let Some(atr) = self.entry_atr.as_mut() {
            *atr /= ratio;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(16, 0, 0)
            .unwrap()
    }

    #[test]
    fn long_mark_updates_pnl_and_high() {
        let mut pos = Position::open("SPY", 100.0, 50.0, ts(2), 1.0, None);
        assert_eq!(pos.cost_basis, 5_001.0);
        pos.update_mark(55.0);
        assert_eq!(pos.unrealized_pnl, 500.0);
        assert_eq!(pos.highest_price, 55.0);
        assert_eq!(pos.lowest_price, 50.0);
        assert_eq!(pos.market_value(), 5_500.0);
    }

    #[test]
    fn short_value_is_negative() {
        let mut pos = Position::open("SPY", -10.0, 100.0, ts(2), 0.0, None);
        assert!(pos.is_short());
        assert_eq!(pos.side(), PositionSide::Short);
        pos.update_mark(90.0);
        assert_eq!(pos.market_value(), -900.0);
        assert_eq!(pos.unrealized_pnl, 100.0);
        assert_eq!(pos.lowest_price, 90.0);
        assert!((pos.return_pct_at(90.0) - 10.0).abs() < 1e-12);
    }

    #[test]
    fn holding_days_counts_calendar_days() {
        let pos = Position::open("SPY", 1.0, 1.0, ts(2), 0.0, None);
        assert_eq!(pos.holding_days(ts(9)), 7);
    }

    #[test]
    fn split_preserves_value() {
        let mut pos = Position::open("SPY", 10.0, 100.0, ts(2), 0.0, None);
        pos.update_mark(120.0);
        let before = pos.market_value();
        pos.apply_split(2.0);
        assert_eq!(pos.quantity, 20.0);
        assert_eq!(pos.entry_price, 50.0);
        assert!((pos.market_value() - before).abs() < 1e-9);
    }

    #[test]
    fn split_rescales_entry_atr() {
        let mut pos = Position::open("SPY", 10.0, 100.0, ts(2), 0.0, None).with_entry_atr(Some(4.0));
        pos.apply_split(2.0);
        assert_eq!(pos.entry_atr, Some(2.0));
    }
}
