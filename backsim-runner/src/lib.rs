//! BackSim Runner: backtest orchestration, metrics, data loading, export.
//!
//! This crate builds on `backsim-core` to provide:
//! - Data loading from CSV/Parquet directories with synthetic fallback
//! - Single-backtest runner producing a serializable report
//! - Performance analytics (returns, risk ratios, trade stats, benchmark)
//! - JSON, CSV and Markdown export

pub mod data_loader;
pub mod export;
pub mod metrics;
pub mod runner;

pub use data_loader::{generate_synthetic, load_directory, LoadError, LoadedData};
pub use export::{export_json, generate_report, import_json, save_artifacts};
pub use metrics::{BenchmarkComparison, PerformanceAnalyzer, PerformanceMetrics};
pub use runner::{
    benchmark_series, run, run_with_oracle, run_with_rules, BacktestReport, BenchmarkSeries, RunError,
    SCHEMA_VERSION,
};
