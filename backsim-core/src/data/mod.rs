//! Market data container and missing-data resolution.

pub mod market;
pub mod missing;

pub use market::MarketData;
pub use missing::resolve_bar;
