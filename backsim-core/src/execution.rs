//! Execution model: fill prices, slippage and transaction costs.
//!
//! Slippage is directional: buyers pay more, sellers receive less.
//! Commission is per trade, per share, or per 100-share contract, plus an
//! exchange fee charged as a percentage of trade value.

use crate::config::{CommissionType, EntryTiming, ExecutionConfig, MtmPrice};
use crate::domain::Bar;
use serde::{Deserialize, Serialize};

/// Shares per contract for per-contract commissions.
pub const CONTRACT_SIZE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that opens a position of the given signed quantity.
    pub fn for_quantity(quantity: f64) -> Self {
        if quantity < 0.0 {
            Self::Sell
        } else {
            Self::Buy
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Price, cost and borrow calculations for fills.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionModel {
    pub timing: EntryTiming,
    pub commission_type: CommissionType,
    pub commission_amount: f64,
    /// Percent of trade value.
    pub exchange_fees: f64,
    /// Percent of price.
    pub slippage: f64,
    /// Annual borrow rate in percent.
    pub borrow_rate: f64,
}

impl ExecutionModel {
    pub fn from_config(cfg: &ExecutionConfig) -> Self {
        Self {
            timing: cfg.entry_timing,
            commission_type: cfg.commission_type,
            commission_amount: cfg.commission_amount,
            exchange_fees: cfg.exchange_fees,
            slippage: cfg.slippage,
            borrow_rate: cfg.borrow_cost,
        }
    }

    pub fn frictionless(timing: EntryTiming) -> Self {
        Self {
            timing,
            commission_type: CommissionType::PerTrade,
            commission_amount: 0.0,
            exchange_fees: 0.0,
            slippage: 0.0,
            borrow_rate: 0.0,
        }
    }

    /// True when orders decided at t fill on the bar after t.
    pub fn is_deferred(&self) -> bool {
        self.timing == EntryTiming::NextBarOpen
    }

    /// Raw (pre-slippage) fill price for `bar` under `timing`.
    ///
    /// For next-bar-open the caller passes the next bar.
    pub fn fill_price(bar: &Bar, timing: EntryTiming) -> f64 {
        match timing {
            EntryTiming::NextBarOpen => bar.open,
            EntryTiming::SameBarClose => bar.close,
            EntryTiming::Midpoint => bar.midpoint(),
            EntryTiming::Vwap => vwap_proxy(bar),
        }
    }

    /// Apply slippage against the trader.
    pub fn apply_slippage(&self, raw_price: f64, side: OrderSide) -> f64 {
        if self.slippage == 0.0 {
            return raw_price;
        }
        let f = self.slippage / 100.0;
        match side {
            OrderSide::Buy => raw_price * (1.0 + f),
            OrderSide::Sell => raw_price * (1.0 - f),
        }
    }

    /// Slipped fill price for an order on `bar` using the configured timing.
    pub fn execution_price(&self, bar: &Bar, side: OrderSide) -> f64 {
        self.apply_slippage(Self::fill_price(bar, self.timing), side)
    }

    /// Commission plus exchange fees for a fill of `quantity` (sign ignored) at `price`.
    pub fn transaction_cost(&self, quantity: f64, price: f64) -> f64 {
        let shares = quantity.abs();
        let commission = match self.commission_type {
            CommissionType::PerTrade => self.commission_amount,
            CommissionType::PerShare => self.commission_amount * shares,
            CommissionType::PerContract => self.commission_amount * shares / CONTRACT_SIZE,
        };
        let fees = shares * price * self.exchange_fees / 100.0;
        commission + fees
    }

    /// Borrow cost for holding a short of `position_value` for `days` calendar days.
    pub fn borrow_cost(&self, position_value: f64, days: f64) -> f64 {
        position_value.abs() * self.borrow_rate / 100.0 / 365.0 * days
    }
}

/// Price used to mark a position on `bar`.
pub fn mark_price(bar: &Bar, source: MtmPrice) -> f64 {
    match source {
        MtmPrice::Close | MtmPrice::Last => bar.close,
        MtmPrice::Mid => bar.midpoint(),
        MtmPrice::Vwap => vwap_proxy(bar),
    }
}

/// Single-bar VWAP proxy: typical price when volume traded, close otherwise.
fn vwap_proxy(bar: &Bar) -> f64 {
    if bar.volume > 0.0 {
        bar.typical_price()
    } else {
        bar.close
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn bar(volume: f64) -> Bar {
        Bar::new(
            NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(16, 0, 0)
                .unwrap(),
            100.0,
            110.0,
            90.0,
            104.0,
            volume,
        )
    }

    fn model() -> ExecutionModel {
        ExecutionModel::frictionless(EntryTiming::SameBarClose)
    }

    #[test]
    fn fill_price_by_timing() {
        let b = bar(1_000.0);
        assert_eq!(ExecutionModel::fill_price(&b, EntryTiming::NextBarOpen), 100.0);
        assert_eq!(ExecutionModel::fill_price(&b, EntryTiming::SameBarClose), 104.0);
        assert_eq!(ExecutionModel::fill_price(&b, EntryTiming::Midpoint), 100.0);
        assert!((ExecutionModel::fill_price(&b, EntryTiming::Vwap) - 304.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn vwap_without_volume_falls_back_to_close() {
        assert_eq!(ExecutionModel::fill_price(&bar(0.0), EntryTiming::Vwap), 104.0);
        assert_eq!(mark_price(&bar(0.0), MtmPrice::Vwap), 104.0);
    }

    #[test]
    fn slippage_is_adverse() {
        let m = ExecutionModel {
            slippage: 0.5,
            ..model()
        };
        assert!((m.apply_slippage(100.0, OrderSide::Buy) - 100.5).abs() < 1e-10);
        assert!((m.apply_slippage(100.0, OrderSide::Sell) - 99.5).abs() < 1e-10);
    }

    #[test]
    fn commission_variants() {
        let per_trade = ExecutionModel {
            commission_amount: 5.0,
            ..model()
        };
        assert_eq!(per_trade.transaction_cost(300.0, 10.0), 5.0);

        let per_share = ExecutionModel {
            commission_type: CommissionType::PerShare,
            commission_amount: 0.01,
            ..model()
        };
        assert!((per_share.transaction_cost(-300.0, 10.0) - 3.0).abs() < 1e-12);

        let per_contract = ExecutionModel {
            commission_type: CommissionType::PerContract,
            commission_amount: 0.65,
            ..model()
        };
        assert!((per_contract.transaction_cost(300.0, 10.0) - 1.95).abs() < 1e-12);
    }

    #[test]
    fn exchange_fees_are_percent_of_value() {
        let m = ExecutionModel {
            exchange_fees: 0.1,
            ..model()
        };
        assert!((m.transaction_cost(100.0, 50.0) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn borrow_cost_for_a_year() {
        let m = ExecutionModel {
            borrow_rate: 10.0,
            ..model()
        };
        assert!((m.borrow_cost(-10_000.0, 365.0) - 1_000.0).abs() < 1e-9);
        assert!((m.borrow_cost(10_000.0, 1.0) - 10_000.0 * 0.1 / 365.0).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn slippage_never_favors_trader(price in 0.01f64..10_000.0, slip in 0.0f64..5.0) {
            let m = ExecutionModel { slippage: slip, ..model() };
            prop_assert!(m.apply_slippage(price, OrderSide::Buy) >= price);
            prop_assert!(m.apply_slippage(price, OrderSide::Sell) <= price);
        }
    }
}
