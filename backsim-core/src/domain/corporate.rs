//! Corporate actions delivered alongside the bar data.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Kind of corporate action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CorporateActionKind {
    /// Cash dividend going ex at the action timestamp.
    Dividend { amount_per_share: f64 },
    /// Share split: `ratio` new shares per old share (2.0 for a 2-for-1).
    Split { ratio: f64 },
    /// The ticker stops trading; any open position is closed at its last price.
    Delisting,
}

/// A corporate action for one ticker at one timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorporateAction {
    pub ticker: String,
    pub timestamp: NaiveDateTime,
    #[serde(flatten)]
    pub kind: CorporateActionKind,
}
