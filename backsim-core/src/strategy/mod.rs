//! Strategy engine: eligibility, entry signals, ranking, sizing and exits.
//!
//! The engine asks the strategy for decisions; the strategy never touches the
//! portfolio. Entry and exit results come back in a deterministic order
//! (universe order for entries, ticker order for exits) regardless of how the
//! underlying signal source schedules its work.

pub mod exits;

pub use exits::{atr, ExitRules, ATR_PERIOD};

use crate::config::{BacktestConfig, RankingMethod, TradingMode};
use crate::data::MarketData;
use crate::domain::{Bar, ExitReason, Position, PositionSide};
use crate::error::{ConfigError, SignalError, SizingError};
use crate::signal::{RuleSignalSource, SignalContext, SignalStrategy, SignalValue};
use crate::sizing::PositionSizer;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// An actionable entry signal.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySignal {
    pub ticker: String,
    pub value: SignalValue,
    pub side: PositionSide,
}

/// Signal evaluation outcome for one timestamp.
#[derive(Debug, Clone)]
pub struct SignalBatch<T> {
    pub items: Vec<T>,
    pub timeouts: usize,
    pub errors: usize,
}

impl<T> Default for SignalBatch<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            timeouts: 0,
            errors: 0,
        }
    }
}

/// A position the strategy wants closed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitDecision {
    pub ticker: String,
    pub reason: ExitReason,
}

/// Input for exit evaluation of one open position.
#[derive(Debug, Clone)]
pub struct ExitRequest {
    pub context: SignalContext,
    pub position: Position,
    /// Price the rules are checked against.
    pub price: f64,
    pub atr: Option<f64>,
}

pub struct StrategyEngine {
    signals: SignalStrategy,
    sizer: PositionSizer,
    exit_rules: ExitRules,
    ranking: RankingMethod,
    trading_mode: TradingMode,
    universe: Vec<String>,
    eligible: Option<BTreeSet<String>>,
    max_positions: usize,
}

impl StrategyEngine {
    pub fn new(cfg: &BacktestConfig, signals: SignalStrategy) -> Result<Self, ConfigError> {
        Ok(Self {
            signals,
            sizer: PositionSizer::from_config(&cfg.strategy)?,
            exit_rules: ExitRules::from_config(cfg),
            ranking: cfg.strategy.ranking.clone(),
            trading_mode: cfg.strategy.trading_mode,
            universe: cfg.market_data.universe.clone(),
            eligible: cfg
                .strategy
                .eligible_symbols
                .as_ref()
                .map(|s| s.iter().cloned().collect()),
            max_positions: cfg.strategy.max_positions,
        })
    }

    /// Strategy built from the configured built-in entry and exit rules.
    pub fn with_rules(cfg: &BacktestConfig) -> Result<Self, ConfigError> {
        let source = RuleSignalSource::new(
            cfg.strategy.entry_rule.clone(),
            cfg.strategy.exit_rule.clone(),
        );
        Self::new(cfg, SignalStrategy::Sync(Box::new(source)))
    }

    pub fn signals(&self) -> &SignalStrategy {
        &self.signals
    }

    pub fn sizer(&self) -> &PositionSizer {
        &self.sizer
    }

    pub fn exit_rules(&self) -> &ExitRules {
        &self.exit_rules
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn universe(&self) -> &[String] {
        &self.universe
    }

    /// Universe tickers that may receive an entry at this timestamp.
    ///
    /// A ticker must be in the eligible set (if configured), have a resolved
    /// bar, and not be excluded (held, queued or delisted). Universe order is
    /// preserved.
    pub fn filter_eligible_universe(
        &self,
        resolved: &BTreeMap<String, Bar>,
        excluded: &BTreeSet<String>,
    ) -> Vec<String> {
        self.universe
            .iter()
            .filter(|t| self.eligible.as_ref().map_or(true, |e| e.contains(*t)))
            .filter(|t| resolved.contains_key(*t))
            .filter(|t| !excluded.contains(*t))
            .cloned()
            .collect()
    }

    /// True if `ticker` is inside the eligible set.
    pub fn is_eligible(&self, ticker: &str) -> bool {
        self.universe.iter().any(|t| t == ticker)
            && self.eligible.as_ref().map_or(true, |e| e.contains(ticker))
    }

    /// Evaluate entry signals and keep the actionable ones, in universe order.
    pub async fn generate_entry_signals(
        &self,
        contexts: Vec<SignalContext>,
    ) -> SignalBatch<EntrySignal> {
        let tickers: Vec<String> = contexts.iter().map(|c| c.ticker.clone()).collect();
        let results = self.signals.entries(contexts).await;
        let mut batch = SignalBatch::default();
        for (ticker, result) in tickers.into_iter().zip(results) {
            match result {
                Ok(value) => {
                    if let Some(side) = value.direction(self.trading_mode) {
                        batch.items.push(EntrySignal {
                            ticker,
                            value,
                            side,
                        });
                    }
                }
                Err(err) => record_signal_error(&mut batch, &ticker, "entry", err),
            }
        }
        batch
    }

    /// Check exits for every open position in priority order:
    /// stop-loss, trailing stop, take-profit, time exit, strategy signal.
    ///
    /// The strategy signal is only consulted for positions no rule closed.
    pub async fn evaluate_exits(&self, requests: Vec<ExitRequest>) -> SignalBatch<ExitDecision> {
        let mut decided: Vec<Option<ExitReason>> = requests
            .iter()
            .map(|r| {
                self.exit_rules
                    .evaluate(&r.position, r.price, r.context.timestamp, r.atr)
            })
            .collect();

        let pending: Vec<usize> = (0..requests.len()).filter(|i| decided[*i].is_none()).collect();
        let signal_inputs: Vec<(SignalContext, Position)> = pending
            .iter()
            .map(|i| (requests[*i].context.clone(), requests[*i].position.clone()))
            .collect();
        let results = self.signals.exits(signal_inputs).await;

        let mut batch = SignalBatch::default();
        for (i, result) in pending.into_iter().zip(results) {
            match result {
                Ok(value) => decided[i] = check_exit_signal(&value),
                Err(err) => {
                    record_signal_error(&mut batch, &requests[i].position.ticker, "exit", err)
                }
            }
        }

        batch.items = requests
            .iter()
            .zip(decided)
            .filter_map(|(r, reason)| {
                reason.map(|reason| ExitDecision {
                    ticker: r.position.ticker.clone(),
                    reason,
                })
            })
            .collect();
        batch
    }

    /// Keep at most `slots` signals according to the ranking method.
    ///
    /// When a group of equal ranking keys straddles the slot boundary the whole
    /// group is dropped rather than picking arbitrarily.
    pub fn rank_signals(
        &self,
        signals: Vec<EntrySignal>,
        slots: usize,
        data: &MarketData,
        idx: usize,
        resolved: &BTreeMap<String, Bar>,
    ) -> Vec<EntrySignal> {
        if signals.len() <= slots {
            return signals;
        }
        if slots == 0 {
            return Vec::new();
        }

        let keyed: Vec<(f64, EntrySignal)> = match &self.ranking {
            RankingMethod::UniverseOrder => {
                return signals.into_iter().take(slots).collect();
            }
            RankingMethod::SignalScore => signals
                .into_iter()
                .map(|s| (s.value.score().abs(), s))
                .collect(),
            RankingMethod::Momentum { lookback } => signals
                .into_iter()
                .map(|s| {
                    let closes = data.recent_closes(&s.ticker, idx, lookback + 1);
                    let key = match (closes.first(), closes.last()) {
                        (Some(first), Some(last)) if closes.len() == lookback + 1 && *first > 0.0 => {
                            s.side.sign() * (last / first - 1.0)
                        }
                        _ => f64::NEG_INFINITY,
                    };
                    (key, s)
                })
                .collect(),
            RankingMethod::Volume => signals
                .into_iter()
                .map(|s| {
                    let v = resolved.get(&s.ticker).map_or(f64::NEG_INFINITY, |b| b.volume);
                    (v, s)
                })
                .collect(),
        };

        select_top(keyed, slots)
    }

    /// Unsigned quantity for an entry at `price`.
    pub fn calculate_position_size(
        &self,
        capital: f64,
        price: f64,
        atr: Option<f64>,
    ) -> Result<f64, SizingError> {
        let stop_distance = self.exit_rules.stop_distance(price, atr);
        self.sizer.size(capital, price, stop_distance)
    }
}

/// Exit reason implied by a strategy exit signal.
pub fn check_exit_signal(value: &SignalValue) -> Option<ExitReason> {
    value.is_active().then_some(ExitReason::StrategySignal)
}

fn record_signal_error<T>(batch: &mut SignalBatch<T>, ticker: &str, kind: &str, err: SignalError) {
    match err {
        SignalError::Timeout => {
            batch.timeouts += 1;
            warn!(ticker, kind, "signal source timed out, holding");
        }
        SignalError::Source(msg) => {
            batch.errors += 1;
            warn!(ticker, kind, error = %msg, "signal source failed, holding");
        }
    }
}

/// Stable descending sort on `key`, then take `slots`, failing closed on a
/// tie that crosses the boundary.
fn select_top(mut keyed: Vec<(f64, EntrySignal)>, slots: usize) -> Vec<EntrySignal> {
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    let boundary = keyed[slots - 1].0;
    let straddles = keyed[slots].0 == boundary;
    let picked: Vec<EntrySignal> = keyed
        .into_iter()
        .take(slots)
        .filter(|(k, _)| !(straddles && *k == boundary) && k.is_finite())
        .map(|(_, s)| s)
        .collect();
    if straddles {
        debug!(boundary, "ranking tie at slot boundary, skipping tied group");
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use std::sync::Arc;

    fn t(i: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(16, 0, 0)
            .unwrap()
            + Duration::days(i)
    }

    fn cfg(universe: &[&str]) -> BacktestConfig {
        let mut cfg = BacktestConfig::default();
        cfg.market_data.universe = universe.iter().map(|s| s.to_string()).collect();
        cfg.strategy.entry_rule = crate::config::EntryRule::Immediate;
        cfg.strategy.exit_rule = crate::config::ExitRule::Never;
        cfg
    }

    fn data(closes: &[(&str, &[f64])]) -> MarketData {
        let n = closes[0].1.len();
        let index: Vec<NaiveDateTime> = (0..n as i64).map(t).collect();
        let series = closes
            .iter()
            .map(|(tk, cs)| {
                let bars = cs
                    .iter()
                    .enumerate()
                    .map(|(i, c)| Some(Bar::new(index[i], *c, *c, *c, *c, 100.0 * (i as f64 + 1.0) * *c)))
                    .collect();
                (tk.to_string(), bars)
            })
            .collect();
        MarketData::new(index, series).unwrap()
    }

    fn sig(ticker: &str, score: f64) -> EntrySignal {
        EntrySignal {
            ticker: ticker.into(),
            value: SignalValue::Score(score),
            side: PositionSide::Long,
        }
    }

    fn resolved(data: &MarketData, idx: usize) -> BTreeMap<String, Bar> {
        data.tickers()
            .filter_map(|tk| data.bar(tk, idx).map(|b| (tk.to_string(), b.clone())))
            .collect()
    }

    #[test]
    fn eligible_universe_filters_and_keeps_order() {
        let mut c = cfg(&["CCC", "AAA", "BBB", "DDD"]);
        c.strategy.eligible_symbols = Some(vec!["AAA".into(), "BBB".into(), "CCC".into()]);
        let engine = StrategyEngine::with_rules(&c).unwrap();
        let d = data(&[("AAA", &[1.0]), ("BBB", &[1.0]), ("CCC", &[1.0]), ("DDD", &[1.0])]);
        let excluded: BTreeSet<String> = ["BBB".to_string()].into_iter().collect();
        assert_eq!(
            engine.filter_eligible_universe(&resolved(&d, 0), &excluded),
            vec!["CCC".to_string(), "AAA".to_string()]
        );
        assert!(engine.is_eligible("AAA"));
        assert!(!engine.is_eligible("DDD"));
    }

    #[test]
    fn universe_order_ranking_takes_first() {
        let engine = StrategyEngine::with_rules(&cfg(&["A", "B"])).unwrap();
        let d = data(&[("A", &[1.0]), ("B", &[1.0])]);
        let ranked = engine.rank_signals(vec![sig("A", 1.0), sig("B", 1.0)], 1, &d, 0, &resolved(&d, 0));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].ticker, "A");
    }

    #[test]
    fn score_ranking_with_boundary_tie_fails_closed() {
        let mut c = cfg(&["A", "B", "C"]);
        c.strategy.ranking = RankingMethod::SignalScore;
        let engine = StrategyEngine::with_rules(&c).unwrap();
        let d = data(&[("A", &[1.0]), ("B", &[1.0]), ("C", &[1.0])]);
        let r = resolved(&d, 0);

        let ranked = engine.rank_signals(vec![sig("A", 0.2), sig("B", 0.9), sig("C", 0.5)], 2, &d, 0, &r);
        let names: Vec<&str> = ranked.iter().map(|s| s.ticker.as_str()).collect();
        assert_eq!(names, vec!["B", "C"]);

        let tied = engine.rank_signals(vec![sig("A", 0.9), sig("B", 0.5), sig("C", 0.5)], 2, &d, 0, &r);
        let names: Vec<&str> = tied.iter().map(|s| s.ticker.as_str()).collect();
        assert_eq!(names, vec!["A"]);
    }

    #[test]
    fn momentum_ranking_prefers_strongest_trend() {
        let mut c = cfg(&["A", "B"]);
        c.strategy.ranking = RankingMethod::Momentum { lookback: 2 };
        let engine = StrategyEngine::with_rules(&c).unwrap();
        let d = data(&[("A", &[10.0, 10.5, 11.0]), ("B", &[10.0, 12.0, 14.0])]);
        let ranked = engine.rank_signals(vec![sig("A", 1.0), sig("B", 1.0)], 1, &d, 2, &resolved(&d, 2));
        assert_eq!(ranked[0].ticker, "B");
    }

    #[test]
    fn volume_ranking() {
        let mut c = cfg(&["A", "B"]);
        c.strategy.ranking = RankingMethod::Volume;
        let engine = StrategyEngine::with_rules(&c).unwrap();
        let d = data(&[("A", &[50.0]), ("B", &[10.0])]);
        let ranked = engine.rank_signals(vec![sig("A", 1.0), sig("B", 1.0)], 1, &d, 0, &resolved(&d, 0));
        assert_eq!(ranked[0].ticker, "A");
    }

    #[tokio::test]
    async fn entry_signals_respect_trading_mode() {
        let mut c = cfg(&["A"]);
        c.strategy.trading_mode = TradingMode::ShortOnly;
        let engine = StrategyEngine::with_rules(&c).unwrap();
        let d = Arc::new(data(&[("A", &[10.0])]));
        let ctx = SignalContext {
            data: Arc::clone(&d),
            ticker: "A".into(),
            index: 0,
            timestamp: t(0),
            bar: d.bar("A", 0).cloned(),
            step: 0,
            calendar_len: 1,
        };
        let batch = engine.generate_entry_signals(vec![ctx]).await;
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].side, PositionSide::Short);
        assert_eq!(batch.timeouts, 0);
    }

    #[tokio::test]
    async fn rule_exits_take_priority_over_signal() {
        let mut c = cfg(&["A"]);
        c.strategy.exit_rule = crate::config::ExitRule::LastBar;
        c.strategy.stop_loss = Some(5.0);
        let engine = StrategyEngine::with_rules(&c).unwrap();
        let d = Arc::new(data(&[("A", &[100.0, 90.0])]));
        let ctx = SignalContext {
            data: Arc::clone(&d),
            ticker: "A".into(),
            index: 1,
            timestamp: t(1),
            bar: d.bar("A", 1).cloned(),
            step: 1,
            calendar_len: 2,
        };
        let pos = Position::open("A", 10.0, 100.0, t(0), 0.0, None);
        let batch = engine
            .evaluate_exits(vec![ExitRequest {
                context: ctx.clone(),
                position: pos.clone(),
                price: 90.0,
                atr: None,
            }])
            .await;
        assert_eq!(batch.items[0].reason, ExitReason::StopLoss);

        let batch = engine
            .evaluate_exits(vec![ExitRequest {
                context: ctx,
                position: pos,
                price: 99.0,
                atr: None,
            }])
            .await;
        assert_eq!(batch.items[0].reason, ExitReason::StrategySignal);
    }

    #[test]
    fn sizing_uses_stop_distance() {
        let mut c = cfg(&["A"]);
        c.strategy.position_sizing = crate::config::PositionSizingMethod::RiskBased;
        c.strategy.risk_percent = Some(1.0);
        c.strategy.stop_loss = Some(2.0);
        let engine = StrategyEngine::with_rules(&c).unwrap();
        assert_eq!(engine.calculate_position_size(100_000.0, 50.0, None), Ok(1_000.0));
    }
}
