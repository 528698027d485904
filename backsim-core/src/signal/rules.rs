//! Built-in rule-based signal source.
//!
//! Covers the plain-language strategies the configuration can express without
//! an external oracle: first-bar, every-N-days, immediate and moving-average
//! crossover entries; last-bar, after-N-days and crossover exits.

use super::{SignalContext, SignalSource, SignalValue};
use crate::config::{EntryRule, ExitRule};
use crate::domain::Position;
use crate::error::SignalError;
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::Mutex;

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Fast and slow SMAs over the recent closes, if enough history exists.
fn crossover_state(ctx: &SignalContext, fast: usize, slow: usize) -> Option<(f64, f64)> {
    let closes = ctx.recent_closes(slow);
    Some((sma(&closes, fast)?, sma(&closes, slow)?))
}

#[derive(Debug)]
pub struct RuleSignalSource {
    entry_rule: EntryRule,
    exit_rule: ExitRule,
    /// Last filled entry per ticker; only fills restart the every-N-days cadence.
    last_entry: Mutex<HashMap<String, NaiveDateTime>>,
    name: String,
}

impl RuleSignalSource {
    pub fn new(entry_rule: EntryRule, exit_rule: ExitRule) -> Self {
        let name = format!("rules({entry_rule:?} / {exit_rule:?})");
        Self {
            entry_rule,
            exit_rule,
            last_entry: Mutex::new(HashMap::new()),
            name,
        }
    }

    fn every_n_days(&self, ctx: &SignalContext, days: u32) -> Result<bool, SignalError> {
        let last = self
            .last_entry
            .lock()
            .map_err(|_| SignalError::Source("entry state poisoned".into()))?;
        Ok(match last.get(&ctx.ticker) {
            None => true,
            Some(prev) => (ctx.timestamp - *prev).num_days() >= i64::from(days),
        })
    }
}

impl SignalSource for RuleSignalSource {
    fn entry(&self, ctx: &SignalContext) -> Result<SignalValue, SignalError> {
        if ctx.bar.is_none() {
            return Ok(SignalValue::HOLD);
        }
        let fire = match self.entry_rule {
            EntryRule::FirstBar => ctx.is_first_bar(),
            EntryRule::EveryNDays { days } => self.every_n_days(ctx, days)?,
            EntryRule::Immediate => true,
            EntryRule::MaCrossover { fast, slow } => {
                crossover_state(ctx, fast, slow).is_some_and(|(f, s)| f > s)
            }
            EntryRule::Never => false,
        };
        Ok(fire.into())
    }

    fn exit(&self, ctx: &SignalContext, position: &Position) -> Result<SignalValue, SignalError> {
        let fire = match self.exit_rule {
            ExitRule::LastBar => ctx.is_last_bar(),
            ExitRule::AfterNDays { days } => {
                position.holding_days(ctx.timestamp) >= i64::from(days)
            }
            ExitRule::MaCrossover { fast, slow } => {
                let cross = crossover_state(ctx, fast, slow);
                if position.is_short() {
                    cross.is_some_and(|(f, s)| f > s)
                } else {
                    cross.is_some_and(|(f, s)| f < s)
                }
            }
            ExitRule::Never => false,
        };
        Ok(fire.into())
    }

    fn entry_filled(&self, ticker: &str, timestamp: NaiveDateTime) {
        if let Ok(mut last) = self.last_entry.lock() {
            last.insert(ticker.to_string(), timestamp);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MarketData;
    use crate::domain::Bar;
    use chrono::{Duration, NaiveDate};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn day(n: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(16, 0, 0)
            .unwrap()
            + Duration::days(n)
    }

    fn data(closes: &[f64]) -> Arc<MarketData> {
        let index: Vec<NaiveDateTime> = (0..closes.len() as i64).map(day).collect();
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, c)| Some(Bar::flat(index[i], *c)))
            .collect();
        let mut series = BTreeMap::new();
        series.insert("SPY".to_string(), bars);
        Arc::new(MarketData::new(index, series).unwrap())
    }

    fn ctx(data: &Arc<MarketData>, step: usize) -> SignalContext {
        SignalContext {
            data: Arc::clone(data),
            ticker: "SPY".into(),
            index: step,
            timestamp: data.index[step],
            bar: data.bar("SPY", step).cloned(),
            step,
            calendar_len: data.len(),
        }
    }

    #[test]
    fn sma_basics() {
        assert_eq!(sma(&[1.0, 2.0, 3.0, 4.0], 2), Some(3.5));
        assert_eq!(sma(&[1.0], 2), None);
        assert_eq!(sma(&[1.0], 0), None);
    }

    #[test]
    fn first_bar_and_last_bar() {
        let d = data(&[10.0, 11.0, 12.0]);
        let src = RuleSignalSource::new(EntryRule::FirstBar, ExitRule::LastBar);
        assert!(src.entry(&ctx(&d, 0)).unwrap().is_active());
        assert!(!src.entry(&ctx(&d, 1)).unwrap().is_active());

        let pos = Position::open("SPY", 1.0, 10.0, day(0), 0.0, None);
        assert!(!src.exit(&ctx(&d, 1), &pos).unwrap().is_active());
        assert!(src.exit(&ctx(&d, 2), &pos).unwrap().is_active());
    }

    #[test]
    fn every_n_days_counts_from_filled_entries() {
        let d = data(&[10.0; 10]);
        let src = RuleSignalSource::new(EntryRule::EveryNDays { days: 3 }, ExitRule::Never);
        let fired: Vec<bool> = (0..10)
            .map(|i| {
                let c = ctx(&d, i);
                let fire = src.entry(&c).unwrap().is_active();
                if fire {
                    src.entry_filled("SPY", c.timestamp);
                }
                fire
            })
            .collect();
        assert_eq!(
            fired,
            vec![true, false, false, true, false, false, true, false, false, true]
        );
    }

    #[test]
    fn unfilled_every_n_days_signal_keeps_firing() {
        let d = data(&[10.0; 5]);
        let src = RuleSignalSource::new(EntryRule::EveryNDays { days: 3 }, ExitRule::Never);
        // Entries at steps 0 and 1 were rejected downstream; only step 2 fills.
        assert!(src.entry(&ctx(&d, 0)).unwrap().is_active());
        assert!(src.entry(&ctx(&d, 1)).unwrap().is_active());
        src.entry_filled("SPY", day(2));
        assert!(!src.entry(&ctx(&d, 3)).unwrap().is_active());
        assert!(!src.entry(&ctx(&d, 4)).unwrap().is_active());
    }

    #[test]
    fn after_n_days_exit() {
        let d = data(&[10.0; 6]);
        let src = RuleSignalSource::new(EntryRule::Never, ExitRule::AfterNDays { days: 4 });
        let pos = Position::open("SPY", 1.0, 10.0, day(1), 0.0, None);
        assert!(!src.exit(&ctx(&d, 4), &pos).unwrap().is_active());
        assert!(src.exit(&ctx(&d, 5), &pos).unwrap().is_active());
    }

    #[test]
    fn crossover_needs_history_and_direction() {
        let rising: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let d = data(&rising);
        let src = RuleSignalSource::new(
            EntryRule::MaCrossover { fast: 2, slow: 5 },
            ExitRule::MaCrossover { fast: 2, slow: 5 },
        );
        assert!(!src.entry(&ctx(&d, 2)).unwrap().is_active());
        assert!(src.entry(&ctx(&d, 9)).unwrap().is_active());

        let long = Position::open("SPY", 1.0, 1.0, day(0), 0.0, None);
        let short = Position::open("SPY", -1.0, 1.0, day(0), 0.0, None);
        assert!(!src.exit(&ctx(&d, 9), &long).unwrap().is_active());
        assert!(src.exit(&ctx(&d, 9), &short).unwrap().is_active());
    }

    #[test]
    fn no_bar_means_no_entry() {
        let d = data(&[10.0]);
        let src = RuleSignalSource::new(EntryRule::Immediate, ExitRule::Never);
        let mut c = ctx(&d, 0);
        assert!(src.entry(&c).unwrap().is_active());
        c.bar = None;
        assert!(!src.entry(&c).unwrap().is_active());
    }
}
