//! BackSim CLI: run, validate and synthetic-data commands.
//!
//! Commands:
//! - `run`: execute a backtest from a TOML config against a data directory
//! - `validate`: parse and validate a TOML config without running it
//! - `synth`: write seeded random-walk bar files for demos and tests

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use backsim_core::BacktestConfig;
use backsim_runner::data_loader::{
    generate_synthetic_bars, write_csv_bars, write_parquet_bars, LoadedData,
};
use backsim_runner::{
    benchmark_series, generate_synthetic, load_directory, run_with_rules, save_artifacts,
    BacktestReport,
};

#[derive(Parser)]
#[command(name = "backsim", about = "BackSim CLI: deterministic portfolio backtesting")]
struct Cli {
    /// Log filter (e.g. info, debug, backsim_core=trace). Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a backtest from a TOML config file.
    Run {
        /// Path to a TOML config file.
        #[arg(long)]
        config: PathBuf,

        /// Directory with one {TICKER}.csv or {TICKER}.parquet per ticker.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,

        /// Benchmark ticker (overrides market_data.benchmark).
        #[arg(long)]
        benchmark: Option<String>,

        /// Output directory for report artifacts.
        #[arg(long, default_value = "results")]
        output_dir: PathBuf,

        /// Generate synthetic bars instead of reading the data directory.
        #[arg(long, default_value_t = false)]
        synthetic: bool,

        /// Bars per ticker when --synthetic is set.
        #[arg(long, default_value_t = 504)]
        days: usize,
    },
    /// Parse and validate a TOML config file.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// Write synthetic bar files.
    Synth {
        /// Comma-separated tickers (e.g. AAA,BBB).
        #[arg(long, value_delimiter = ',', required = true)]
        tickers: Vec<String>,

        /// Weekday bars per ticker.
        #[arg(long, default_value_t = 252)]
        days: usize,

        /// First date (YYYY-MM-DD).
        #[arg(long, default_value = "2020-01-02")]
        start: String,

        #[arg(long, value_enum, default_value_t = FileFormat::Csv)]
        format: FileFormat,

        #[arg(long, default_value = "data")]
        output_dir: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FileFormat {
    Csv,
    Parquet,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match cli.command {
        Commands::Run {
            config,
            data_dir,
            benchmark,
            output_dir,
            synthetic,
            days,
        } => run_backtest_cmd(&config, &data_dir, benchmark, &output_dir, synthetic, days),
        Commands::Validate { config } => run_validate(&config),
        Commands::Synth {
            tickers,
            days,
            start,
            format,
            output_dir,
        } => run_synth(&tickers, days, &start, format, &output_dir),
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(l) => EnvFilter::new(l),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: &Path) -> Result<BacktestConfig> {
    let cfg = BacktestConfig::from_file(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

fn run_backtest_cmd(
    config_path: &Path,
    data_dir: &Path,
    benchmark: Option<String>,
    output_dir: &Path,
    synthetic: bool,
    days: usize,
) -> Result<()> {
    let cfg = load_config(config_path)?;
    let benchmark = benchmark.or_else(|| cfg.market_data.benchmark.clone());

    let mut tickers = cfg.market_data.universe.clone();
    if let Some(b) = &benchmark {
        if !tickers.contains(b) {
            tickers.push(b.clone());
        }
    }

    let loaded: LoadedData = if synthetic {
        let start = cfg
            .market_data
            .start_date
            .unwrap_or_else(|| NaiveDate::from_ymd_opt(2020, 1, 2).unwrap_or_default());
        generate_synthetic(&tickers, start, days)
    } else {
        load_directory(data_dir, &tickers)
            .with_context(|| format!("failed to load data from {}", data_dir.display()))?
    };

    let bench = benchmark
        .as_deref()
        .map(|b| benchmark_series(&loaded.data, b))
        .transpose()?;

    info!(config = %config_path.display(), run_id = %cfg.run_id(), "starting backtest");
    let mut report = run_with_rules(cfg.clone(), Arc::new(loaded.data), bench.as_deref())?;
    report.has_synthetic = loaded.has_synthetic;
    report.dataset_hash = loaded.dataset_hash;

    print_summary(&report);

    let run_dir = save_artifacts(&report, &cfg.output.formats, output_dir)?;
    println!("Artifacts saved to: {}", run_dir.display());
    Ok(())
}

fn run_validate(config_path: &Path) -> Result<()> {
    let cfg = load_config(config_path)?;
    println!("Config OK: {}", config_path.display());
    println!("Run ID:    {}", cfg.run_id());
    println!("Universe:  {}", cfg.market_data.universe.join(", "));
    Ok(())
}

fn run_synth(
    tickers: &[String],
    days: usize,
    start: &str,
    format: FileFormat,
    output_dir: &Path,
) -> Result<()> {
    let start = NaiveDate::parse_from_str(start, "%Y-%m-%d")
        .with_context(|| format!("invalid start date '{start}'"))?;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    for ticker in tickers {
        let bars = generate_synthetic_bars(ticker, start, days);
        let path = match format {
            FileFormat::Csv => write_csv_bars(output_dir, ticker, &bars)?,
            FileFormat::Parquet => write_parquet_bars(output_dir, ticker, &bars)?,
        };
        println!("Wrote {} bars to {}", bars.len(), path.display());
    }
    Ok(())
}

fn fmt_pct(v: Option<f64>) -> String {
    v.map_or_else(|| "n/a".into(), |x| format!("{x:.2}%"))
}

fn fmt_ratio(v: Option<f64>) -> String {
    v.map_or_else(|| "n/a".into(), |x| format!("{x:.3}"))
}

fn print_summary(report: &BacktestReport) {
    let m = &report.summary;
    println!();
    println!("=== Backtest Result ===");
    println!("Run ID:         {}", report.run_id);
    println!("Universe:       {}", report.config.market_data.universe.join(", "));
    if let (Some(first), Some(last)) = (report.equity_curve.first(), report.equity_curve.last()) {
        println!("Period:         {} to {}", first.timestamp, last.timestamp);
    }
    println!(
        "Steps:          {} / {}",
        report.steps_completed, report.calendar_len
    );
    println!("Trades:         {}", m.num_trades);
    println!("Rejected:       {}", report.rejected_orders.len());
    println!();
    println!("--- Performance ---");
    println!("Final Value:    {:.2}", m.final_value);
    println!("Total Return:   {}", fmt_pct(m.total_return));
    println!("CAGR:           {}", fmt_pct(m.cagr));
    println!("Volatility:     {}", fmt_pct(m.volatility));
    println!("Sharpe:         {}", fmt_ratio(m.sharpe));
    println!("Sortino:        {}", fmt_ratio(m.sortino));
    println!("Calmar:         {}", fmt_ratio(m.calmar));
    println!("Max Drawdown:   {}", fmt_pct(m.max_drawdown));
    println!("Win Rate:       {}", fmt_pct(m.win_rate));
    println!("Profit Factor:  {}", fmt_ratio(m.profit_factor));
    if let Some(b) = &report.benchmark_comparison {
        println!();
        println!("--- Benchmark ---");
        println!("Benchmark:      {}", fmt_pct(b.benchmark_return));
        println!("Alpha:          {}", fmt_pct(b.alpha));
        println!("Beta:           {}", fmt_ratio(b.beta));
        println!("Tracking Error: {}", fmt_pct(b.tracking_error));
        println!("Info Ratio:     {}", fmt_ratio(b.information_ratio));
    }
    if report.halted {
        println!();
        println!("HALTED: {:?}", report.halt_reason);
    }
    if report.has_synthetic {
        println!();
        println!("WARNING: Results based on SYNTHETIC data");
    }
}
