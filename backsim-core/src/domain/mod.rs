//! Domain types for BackSim

pub mod bar;
pub mod corporate;
pub mod position;
pub mod trade;

pub use bar::Bar;
pub use corporate::{CorporateAction, CorporateActionKind};
pub use position::{Position, PositionSide};
pub use trade::{ExitReason, Trade};

/// Ticker type alias
pub type Ticker = String;
