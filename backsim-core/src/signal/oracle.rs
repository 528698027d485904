//! External-oracle signal source.
//!
//! An oracle (for example a hosted analysis chain) is consulted per ticker and
//! timestamp through [`SignalOracle`]. Verdicts are cached per
//! (kind, ticker, timestamp) so repeated lookups within a run are free.
//! Failed calls are cached as holds.

use super::{AsyncSignalSource, SignalContext, SignalValue};
use crate::domain::Position;
use crate::error::SignalError;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Closes forwarded to the oracle with every request.
const HISTORY_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Entry,
    Exit,
}

/// What the oracle is asked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleRequest {
    pub kind: SignalKind,
    pub ticker: String,
    pub timestamp: NaiveDateTime,
    pub recent_closes: Vec<f64>,
    pub prompt: String,
    /// Entry price of the held position (exit requests only).
    pub entry_price: Option<f64>,
    pub upside_threshold: f64,
    pub downside_threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Buy,
    Sell,
    Hold,
}

/// The oracle's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub verdict: Verdict,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub reasoning: String,
}

impl OracleVerdict {
    pub fn hold() -> Self {
        Self {
            verdict: Verdict::Hold,
            confidence: 0.5,
            reasoning: String::new(),
        }
    }

    /// Classify free text by keywords, falling back to sentiment word counts.
    ///
    /// Matching is case-insensitive and checks buy, then sell, then hold.
    pub fn from_text(content: &str) -> Self {
        let text = content.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| text.contains(w));

        let (verdict, confidence) = if has(&["buy", "purchase", "long", "enter"]) {
            let c = if has(&["strong buy", "highly recommend"]) {
                0.9
            } else if has(&["moderate buy", "recommend buy"]) {
                0.7
            } else {
                0.6
            };
            (Verdict::Buy, c)
        } else if has(&["sell", "exit", "close", "short"]) {
            let c = if has(&["strong sell", "highly recommend sell"]) {
                0.9
            } else if has(&["moderate sell", "recommend sell"]) {
                0.7
            } else {
                0.6
            };
            (Verdict::Sell, c)
        } else if has(&["hold", "maintain", "keep", "retain"]) {
            (Verdict::Hold, 0.5)
        } else {
            let positive = ["positive", "bullish", "upward", "growth", "increase", "good", "strong"];
            let negative = ["negative", "bearish", "downward", "decline", "decrease", "weak", "poor"];
            let pos = positive.iter().filter(|w| text.contains(*w)).count();
            let neg = negative.iter().filter(|w| text.contains(*w)).count();
            match pos.cmp(&neg) {
                std::cmp::Ordering::Greater => (Verdict::Buy, 0.6),
                std::cmp::Ordering::Less => (Verdict::Sell, 0.6),
                std::cmp::Ordering::Equal => (Verdict::Hold, 0.5),
            }
        };

        Self {
            verdict,
            confidence,
            reasoning: content.chars().take(500).collect(),
        }
    }
}

/// External oracle contract.
#[async_trait]
pub trait SignalOracle: Send + Sync {
    async fn evaluate(&self, request: OracleRequest) -> Result<OracleVerdict, SignalError>;
}

/// Oracle-backed async signal source with a per-run verdict cache.
pub struct OracleSignalSource<O: SignalOracle> {
    oracle: O,
    entry_prompt: String,
    exit_prompt: String,
    upside_threshold: f64,
    downside_threshold: f64,
    cache: Mutex<HashMap<(SignalKind, String, NaiveDateTime), SignalValue>>,
}

impl<O: SignalOracle> OracleSignalSource<O> {
    pub fn new(oracle: O, entry_prompt: impl Into<String>, exit_prompt: impl Into<String>) -> Self {
        Self {
            oracle,
            entry_prompt: entry_prompt.into(),
            exit_prompt: exit_prompt.into(),
            upside_threshold: 10.0,
            downside_threshold: 5.0,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_thresholds(mut self, upside: f64, downside: f64) -> Self {
        self.upside_threshold = upside;
        self.downside_threshold = downside;
        self
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn lookup(&self, key: &(SignalKind, String, NaiveDateTime)) -> Option<SignalValue> {
        self.cache.lock().ok()?.get(key).copied()
    }

    fn store(&self, key: (SignalKind, String, NaiveDateTime), value: SignalValue) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, value);
        }
    }

    fn request(&self, kind: SignalKind, ctx: &SignalContext, entry_price: Option<f64>) -> OracleRequest {
        OracleRequest {
            kind,
            ticker: ctx.ticker.clone(),
            timestamp: ctx.timestamp,
            recent_closes: ctx.recent_closes(HISTORY_WINDOW),
            prompt: match kind {
                SignalKind::Entry => self.entry_prompt.clone(),
                SignalKind::Exit => self.exit_prompt.clone(),
            },
            entry_price,
            upside_threshold: self.upside_threshold,
            downside_threshold: self.downside_threshold,
        }
    }

    /// Call the oracle through the cache; failures are cached as holds.
    async fn consult(
        &self,
        key: (SignalKind, String, NaiveDateTime),
        request: OracleRequest,
        interpret: impl FnOnce(&OracleVerdict) -> SignalValue + Send,
    ) -> Result<SignalValue, SignalError> {
        if let Some(hit) = self.lookup(&key) {
            return Ok(hit);
        }
        match self.oracle.evaluate(request).await {
            Ok(verdict) => {
                let value = interpret(&verdict);
                debug!(ticker = %key.1, kind = ?key.0, verdict = ?verdict.verdict, "oracle verdict");
                self.store(key, value);
                Ok(value)
            }
            Err(err) => {
                warn!(ticker = %key.1, kind = ?key.0, error = %err, "oracle call failed, holding");
                self.store(key, SignalValue::HOLD);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<O: SignalOracle> AsyncSignalSource for OracleSignalSource<O> {
    async fn entry(&self, ctx: SignalContext) -> Result<SignalValue, SignalError> {
        let key = (SignalKind::Entry, ctx.ticker.clone(), ctx.timestamp);
        let request = self.request(SignalKind::Entry, &ctx, None);
        self.consult(key, request, |v| match v.verdict {
            Verdict::Buy => SignalValue::Score(v.confidence),
            Verdict::Sell => SignalValue::Score(-v.confidence),
            Verdict::Hold => SignalValue::HOLD,
        })
        .await
    }

    async fn exit(&self, ctx: SignalContext, position: Position) -> Result<SignalValue, SignalError> {
        let key = (SignalKind::Exit, ctx.ticker.clone(), ctx.timestamp);
        let request = self.request(SignalKind::Exit, &ctx, Some(position.entry_price));
        let price = ctx.bar.as_ref().map_or(position.current_price, |b| b.close);
        let move_pct = position.return_pct_at(price);
        let (up, down) = (self.upside_threshold, self.downside_threshold);
        let closing = if position.is_short() {
            Verdict::Buy
        } else {
            Verdict::Sell
        };
        self.consult(key, request, move |v| {
            let threshold_hit = move_pct >= up || move_pct <= -down;
            SignalValue::Bool(v.verdict == closing || threshold_hit)
        })
        .await
    }

    fn name(&self) -> &str {
        "oracle"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MarketData;
    use crate::domain::Bar;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Scripted {
        calls: Arc<AtomicUsize>,
        answer: Result<OracleVerdict, SignalError>,
    }

    #[async_trait]
    impl SignalOracle for Scripted {
        async fn evaluate(&self, _request: OracleRequest) -> Result<OracleVerdict, SignalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    fn ctx(close: f64) -> SignalContext {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(16, 0, 0)
            .unwrap();
        let mut series = BTreeMap::new();
        series.insert("AAPL".to_string(), vec![Some(Bar::flat(ts, close))]);
        let data = MarketData::new(vec![ts], series).unwrap();
        SignalContext {
            data: Arc::new(data),
            ticker: "AAPL".into(),
            index: 0,
            timestamp: ts,
            bar: Some(Bar::flat(ts, close)),
            step: 0,
            calendar_len: 1,
        }
    }

    fn verdict(v: Verdict) -> OracleVerdict {
        OracleVerdict {
            verdict: v,
            confidence: 0.8,
            reasoning: String::new(),
        }
    }

    #[test]
    fn text_classification() {
        assert_eq!(OracleVerdict::from_text("STRONG BUY here").verdict, Verdict::Buy);
        assert_eq!(OracleVerdict::from_text("strong buy").confidence, 0.9);
        assert_eq!(OracleVerdict::from_text("We should sell").verdict, Verdict::Sell);
        assert_eq!(OracleVerdict::from_text("hold steady").verdict, Verdict::Hold);
        assert_eq!(OracleVerdict::from_text("bearish and weak").verdict, Verdict::Sell);
        assert_eq!(OracleVerdict::from_text("nothing to see").verdict, Verdict::Hold);
    }

    #[tokio::test]
    async fn entry_verdicts_are_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = OracleSignalSource::new(
            Scripted {
                calls: Arc::clone(&calls),
                answer: Ok(verdict(Verdict::Buy)),
            },
            "enter?",
            "exit?",
        );
        let first = source.entry(ctx(100.0)).await.unwrap();
        let second = source.entry(ctx(100.0)).await.unwrap();
        assert_eq!(first, SignalValue::Score(0.8));
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.cached_len(), 1);
    }

    #[tokio::test]
    async fn failures_cached_as_hold() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = OracleSignalSource::new(
            Scripted {
                calls: Arc::clone(&calls),
                answer: Err(SignalError::Source("down".into())),
            },
            "enter?",
            "exit?",
        );
        assert!(source.entry(ctx(100.0)).await.is_err());
        assert_eq!(source.entry(ctx(100.0)).await, Ok(SignalValue::HOLD));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exit_uses_verdict_or_thresholds() {
        let hold = OracleSignalSource::new(
            Scripted {
                calls: Arc::new(AtomicUsize::new(0)),
                answer: Ok(verdict(Verdict::Hold)),
            },
            "",
            "",
        )
        .with_thresholds(10.0, 5.0);
        let c = ctx(100.0);
        let pos = Position::open("AAPL", 10.0, 95.0, c.timestamp, 0.0, None);
        assert!(!hold.exit(c, pos).await.unwrap().is_active());

        let c = ctx(111.0);
        let pos = Position::open("AAPL", 10.0, 100.0, c.timestamp, 0.0, None);
        let hold2 = OracleSignalSource::new(
            Scripted {
                calls: Arc::new(AtomicUsize::new(0)),
                answer: Ok(verdict(Verdict::Hold)),
            },
            "",
            "",
        );
        assert!(hold2.exit(c, pos).await.unwrap().is_active());

        let sell = OracleSignalSource::new(
            Scripted {
                calls: Arc::new(AtomicUsize::new(0)),
                answer: Ok(verdict(Verdict::Sell)),
            },
            "",
            "",
        );
        let c = ctx(100.0);
        let pos = Position::open("AAPL", 10.0, 100.0, c.timestamp, 0.0, None);
        assert!(sell.exit(c, pos).await.unwrap().is_active());
    }
}
