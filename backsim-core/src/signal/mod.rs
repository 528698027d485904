//! Signal sources: pluggable entry/exit decisions.
//!
//! A source is either synchronous ([`SignalSource`]) or asynchronous
//! ([`AsyncSignalSource`]), chosen once through [`SignalStrategy`]. Sources are
//! read-only with respect to the portfolio: they see market data and, for
//! exits, a copy of the position.
//!
//! Synchronous entry evaluation fans out across tickers with rayon.
//! Asynchronous evaluation runs every request for a timestamp concurrently
//! under a single deadline; anything unfinished at the deadline is a hold.

pub mod oracle;
pub mod rules;

pub use oracle::{OracleRequest, OracleSignalSource, OracleVerdict, SignalOracle, Verdict};
pub use rules::RuleSignalSource;

use crate::config::TradingMode;
use crate::data::MarketData;
use crate::domain::{Bar, Position, PositionSide};
use crate::error::SignalError;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Output of a signal function: a boolean trigger or a signed score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Bool(bool),
    Score(f64),
}

impl SignalValue {
    pub const HOLD: Self = Self::Bool(false);

    /// True when the signal asks for action.
    pub fn is_active(&self) -> bool {
        match *self {
            Self::Bool(b) => b,
            Self::Score(s) => s.is_finite() && s != 0.0,
        }
    }

    /// Numeric strength used for ranking; `true` counts as 1.
    pub fn score(&self) -> f64 {
        match *self {
            Self::Bool(true) => 1.0,
            Self::Bool(false) => 0.0,
            Self::Score(s) if s.is_finite() => s,
            Self::Score(_) => 0.0,
        }
    }

    /// Direction this entry signal opens under `mode`, if any.
    pub fn direction(&self, mode: TradingMode) -> Option<PositionSide> {
        if !self.is_active() {
            return None;
        }
        match mode {
            TradingMode::LongOnly => Some(PositionSide::Long),
            TradingMode::ShortOnly => Some(PositionSide::Short),
            TradingMode::LongShort => {
                if self.score() < 0.0 {
                    Some(PositionSide::Short)
                } else {
                    Some(PositionSide::Long)
                }
            }
        }
    }
}

impl From<bool> for SignalValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Everything a signal function may look at for one ticker at one timestamp.
///
/// Owned so it can cross into spawned tasks.
#[derive(Debug, Clone)]
pub struct SignalContext {
    pub data: Arc<MarketData>,
    pub ticker: String,
    /// Position in the data index.
    pub index: usize,
    pub timestamp: NaiveDateTime,
    /// Bar after missing-data resolution.
    pub bar: Option<Bar>,
    /// Position in the filtered trading calendar.
    pub step: usize,
    pub calendar_len: usize,
}

impl SignalContext {
    pub fn is_first_bar(&self) -> bool {
        self.step == 0
    }

    pub fn is_last_bar(&self) -> bool {
        self.step + 1 == self.calendar_len
    }

    /// Up to `n` recent valid closes ending at this timestamp, oldest first.
    pub fn recent_closes(&self, n: usize) -> Vec<f64> {
        self.data.recent_closes(&self.ticker, self.index, n)
    }
}

/// Synchronous signal capability.
pub trait SignalSource: Send + Sync {
    fn entry(&self, ctx: &SignalContext) -> Result<SignalValue, SignalError>;

    fn exit(&self, ctx: &SignalContext, position: &Position) -> Result<SignalValue, SignalError>;

    /// Called by the engine once an entry for `ticker` has actually filled.
    fn entry_filled(&self, _ticker: &str, _timestamp: NaiveDateTime) {}

    fn name(&self) -> &str;
}

/// Asynchronous signal capability (e.g. an external oracle).
#[async_trait]
pub trait AsyncSignalSource: Send + Sync {
    async fn entry(&self, ctx: SignalContext) -> Result<SignalValue, SignalError>;

    async fn exit(&self, ctx: SignalContext, position: Position)
        -> Result<SignalValue, SignalError>;

    fn entry_filled(&self, _ticker: &str, _timestamp: NaiveDateTime) {}

    fn name(&self) -> &str;
}

/// Signal source selected at configuration time.
pub enum SignalStrategy {
    Sync(Box<dyn SignalSource>),
    Async {
        source: Arc<dyn AsyncSignalSource>,
        timeout: Duration,
    },
}

impl SignalStrategy {
    pub fn name(&self) -> &str {
        match self {
            Self::Sync(s) => s.name(),
            Self::Async { source, .. } => source.name(),
        }
    }

    /// Forward a confirmed entry fill to the source.
    pub fn entry_filled(&self, ticker: &str, timestamp: NaiveDateTime) {
        match self {
            Self::Sync(s) => s.entry_filled(ticker, timestamp),
            Self::Async { source, .. } => source.entry_filled(ticker, timestamp),
        }
    }

    /// Evaluate entry signals, returning results in input order.
    pub async fn entries(&self, contexts: Vec<SignalContext>) -> Vec<Result<SignalValue, SignalError>> {
        match self {
            Self::Sync(source) => contexts.par_iter().map(|ctx| source.entry(ctx)).collect(),
            Self::Async { source, timeout } => {
                let source = Arc::clone(source);
                evaluate_with_deadline(contexts, *timeout, move |ctx| {
                    let source = Arc::clone(&source);
                    async move { source.entry(ctx).await }
                })
                .await
            }
        }
    }

    /// Evaluate exit signals for open positions, returning results in input order.
    pub async fn exits(
        &self,
        requests: Vec<(SignalContext, Position)>,
    ) -> Vec<Result<SignalValue, SignalError>> {
        match self {
            Self::Sync(source) => requests
                .iter()
                .map(|(ctx, pos)| source.exit(ctx, pos))
                .collect(),
            Self::Async { source, timeout } => {
                let source = Arc::clone(source);
                evaluate_with_deadline(requests, *timeout, move |(ctx, pos)| {
                    let source = Arc::clone(&source);
                    async move { source.exit(ctx, pos).await }
                })
                .await
            }
        }
    }
}

impl std::fmt::Debug for SignalStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(s) => f.debug_tuple("Sync").field(&s.name()).finish(),
            Self::Async { source, timeout } => f
                .debug_struct("Async")
                .field("source", &source.name())
                .field("timeout", timeout)
                .finish(),
        }
    }
}

/// Run one task per request under a shared deadline.
///
/// Requests still pending at the deadline are aborted and reported as
/// [`SignalError::Timeout`].
async fn evaluate_with_deadline<R, F, Fut>(
    requests: Vec<R>,
    timeout: Duration,
    call: F,
) -> Vec<Result<SignalValue, SignalError>>
where
    R: Send + 'static,
    F: Fn(R) -> Fut,
    Fut: std::future::Future<Output = Result<SignalValue, SignalError>> + Send + 'static,
{
    let mut results: Vec<Option<Result<SignalValue, SignalError>>> = vec![None; requests.len()];
    let mut set = JoinSet::new();
    for (i, request) in requests.into_iter().enumerate() {
        let fut = call(request);
        set.spawn(async move { (i, fut.await) });
    }

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    loop {
        match tokio::time::timeout_at(deadline, set.join_next()).await {
            Ok(Some(Ok((i, result)))) => results[i] = Some(result),
            Ok(Some(Err(join_err))) => {
                tracing::warn!(error = %join_err, "signal task failed");
            }
            Ok(None) => break,
            Err(_) => {
                timed_out = true;
                set.abort_all();
                break;
            }
        }
    }

    results
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| {
                if timed_out {
                    Err(SignalError::Timeout)
                } else {
                    Err(SignalError::Source("signal task failed".into()))
                }
            })
        })
        .collect()
}
