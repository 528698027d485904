//! Timestamp-aligned market data handed to the engine.

use crate::domain::{Bar, CorporateAction};
use crate::error::DataError;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Bars for every ticker on a common timestamp index.
///
/// Each series has exactly one slot per index entry; gaps are `None` (or a
/// void bar) and are resolved by the engine's missing-data policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketData {
    /// Common timestamp axis, strictly increasing.
    pub index: Vec<NaiveDateTime>,
    /// Per-ticker series aligned to `index`.
    pub series: BTreeMap<String, Vec<Option<Bar>>>,
    /// Dividend, split and delisting events, sorted by timestamp.
    pub corporate_actions: Vec<CorporateAction>,
    /// Optional sector tag per ticker.
    pub sectors: BTreeMap<String, String>,
}

impl MarketData {
    /// Build from pre-aligned series, validating shape and ordering.
    pub fn new(
        index: Vec<NaiveDateTime>,
        series: BTreeMap<String, Vec<Option<Bar>>>,
    ) -> Result<Self, DataError> {
        let data = Self {
            index,
            series,
            corporate_actions: Vec::new(),
            sectors: BTreeMap::new(),
        };
        data.validate()?;
        Ok(data)
    }

    /// Align ragged per-ticker bar lists onto the union of their timestamps.
    ///
    /// Duplicate timestamps within one ticker keep the last bar.
    pub fn align(ticker_bars: BTreeMap<String, Vec<Bar>>) -> Self {
        let all: BTreeSet<NaiveDateTime> = ticker_bars
            .values()
            .flat_map(|bars| bars.iter().map(|b| b.timestamp))
            .collect();
        let index: Vec<NaiveDateTime> = all.into_iter().collect();

        let series = ticker_bars
            .into_iter()
            .map(|(ticker, bars)| {
                let by_ts: HashMap<NaiveDateTime, Bar> =
                    bars.into_iter().map(|b| (b.timestamp, b)).collect();
                let aligned = index.iter().map(|ts| by_ts.get(ts).cloned()).collect();
                (ticker, aligned)
            })
            .collect();

        Self {
            index,
            series,
            corporate_actions: Vec::new(),
            sectors: BTreeMap::new(),
        }
    }

    pub fn with_corporate_actions(mut self, mut actions: Vec<CorporateAction>) -> Self {
        actions.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.ticker.cmp(&b.ticker))
        });
        self.corporate_actions = actions;
        self
    }

    pub fn with_sectors(mut self, sectors: BTreeMap<String, String>) -> Self {
        self.sectors = sectors;
        self
    }

    /// Check that every series matches the index and the index is strictly increasing.
    pub fn validate(&self) -> Result<(), DataError> {
        for i in 1..self.index.len() {
            if self.index[i] <= self.index[i - 1] {
                return Err(DataError::NonIncreasingTimestamps { index: i });
            }
        }
        for (ticker, bars) in &self.series {
            if bars.len() != self.index.len() {
                return Err(DataError::Misaligned {
                    ticker: ticker.clone(),
                    expected: self.index.len(),
                    actual: bars.len(),
                });
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn has_ticker(&self, ticker: &str) -> bool {
        self.series.contains_key(ticker)
    }

    pub fn tickers(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn series(&self, ticker: &str) -> Option<&[Option<Bar>]> {
        self.series.get(ticker).map(Vec::as_slice)
    }

    /// Raw bar at an index position, ignoring gaps and void bars.
    pub fn bar(&self, ticker: &str, idx: usize) -> Option<&Bar> {
        self.series
            .get(ticker)?
            .get(idx)?
            .as_ref()
            .filter(|b| b.is_sane())
    }

    pub fn sector(&self, ticker: &str) -> Option<&str> {
        self.sectors.get(ticker).map(String::as_str)
    }

    /// Up to `n` most recent valid closes at or before `idx`, oldest first.
    pub fn recent_closes(&self, ticker: &str, idx: usize, n: usize) -> Vec<f64> {
        let Some(series) = self.series.get(ticker) else {
            return Vec::new();
        };
        let end = (idx + 1).min(series.len());
        let mut closes: Vec<f64> = series[..end]
            .iter()
            .rev()
            .filter_map(|b| b.as_ref().filter(|b| b.is_sane()).map(|b| b.close))
            .take(n)
            .collect();
        closes.reverse();
        closes
    }

    /// Up to `n` most recent valid bars at or before `idx`, oldest first.
    pub fn recent_bars(&self, ticker: &str, idx: usize, n: usize) -> Vec<&Bar> {
        let Some(series) = self.series.get(ticker) else {
            return Vec::new();
        };
        let end = (idx + 1).min(series.len());
        let mut bars: Vec<&Bar> = series[..end]
            .iter()
            .rev()
            .filter_map(|b| b.as_ref().filter(|b| b.is_sane()))
            .take(n)
            .collect();
        bars.reverse();
        bars
    }

    /// Corporate actions with `after < timestamp <= upto`.
    pub fn actions_between(
        &self,
        after: Option<NaiveDateTime>,
        upto: NaiveDateTime,
    ) -> impl Iterator<Item = &CorporateAction> {
        self.corporate_actions
            .iter()
            .filter(move |a| a.timestamp <= upto && after.map_or(true, |p| a.timestamp > p))
    }
}
