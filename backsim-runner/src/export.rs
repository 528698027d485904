//! Reporting and export: JSON, CSV, and Markdown artifact generation.
//!
//! - **JSON**: the full report with schema versioning
//! - **CSV**: trade log and equity curve for external analysis tools
//! - **Markdown**: human-readable single-run summary
//!
//! Persisted reports carry a `schema_version`; newer versions are rejected on load.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::info;

use backsim_core::config::OutputFormat;
use backsim_core::domain::Trade;
use backsim_core::portfolio::EquityPoint;

use crate::runner::{BacktestReport, SCHEMA_VERSION};

// ─── JSON export ────────────────────────────────────────────────────

/// Serialize a report to pretty JSON.
pub fn export_json(report: &BacktestReport) -> Result<String> {
    serde_json::to_string_pretty(report).context("failed to serialize BacktestReport to JSON")
}

/// Deserialize a report, rejecting unknown schema versions.
pub fn import_json(json: &str) -> Result<BacktestReport> {
    let report: BacktestReport =
        serde_json::from_str(json).context("failed to deserialize BacktestReport from JSON")?;
    if report.schema_version > SCHEMA_VERSION {
        bail!(
            "unsupported schema version {} (max supported: {})",
            report.schema_version,
            SCHEMA_VERSION
        );
    }
    Ok(report)
}

// ─── CSV export ─────────────────────────────────────────────────────

/// Trade log as CSV, one row per closed trade.
pub fn export_trades_csv(trades: &[Trade]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "ticker",
        "side",
        "entry_timestamp",
        "entry_price",
        "exit_timestamp",
        "exit_price",
        "quantity",
        "gross_pnl",
        "costs",
        "dividends",
        "net_pnl",
        "pnl_pct",
        "holding_period_days",
        "exit_reason",
    ])?;
    for t in trades {
        wtr.write_record([
            t.ticker.clone(),
            format!("{:?}", t.side),
            t.entry_timestamp.to_string(),
            format!("{:.6}", t.entry_price),
            t.exit_timestamp.to_string(),
            format!("{:.6}", t.exit_price),
            format!("{:.6}", t.quantity),
            format!("{:.2}", t.gross_pnl),
            format!("{:.2}", t.total_costs()),
            format!("{:.2}", t.dividends),
            format!("{:.2}", t.net_pnl),
            format!("{:.4}", t.pnl_pct),
            t.holding_period_days.to_string(),
            t.exit_reason.as_str().to_string(),
        ])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// Equity curve as `timestamp,value` CSV.
pub fn export_equity_csv(equity_curve: &[EquityPoint]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["timestamp", "value"])?;
    for p in equity_curve {
        wtr.write_record([&p.timestamp.to_string(), &format!("{:.2}", p.value)])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

// ─── Artifact bundle ────────────────────────────────────────────────

/// Write the configured output formats under `output_dir/{run_id prefix}/`.
///
/// - `json` → `report.json`
/// - `csv` → `trades.csv` and `equity.csv`
/// - `markdown` → `report.md`
///
/// Returns the run directory.
pub fn save_artifacts(
    report: &BacktestReport,
    formats: &[OutputFormat],
    output_dir: &Path,
) -> Result<PathBuf> {
    let short_id: String = report.run_id.chars().take(12).collect();
    let run_dir = output_dir.join(format!("run_{short_id}"));
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create artifact dir: {}", run_dir.display()))?;

    for format in formats {
        match format {
            OutputFormat::Json => write(&run_dir.join("report.json"), &export_json(report)?)?,
            OutputFormat::Csv => {
                write(&run_dir.join("trades.csv"), &export_trades_csv(&report.trades)?)?;
                write(
                    &run_dir.join("equity.csv"),
                    &export_equity_csv(&report.equity_curve)?,
                )?;
            }
            OutputFormat::Markdown => write(&run_dir.join("report.md"), &generate_report(report))?,
        }
    }
    info!(dir = %run_dir.display(), "artifacts saved");
    Ok(run_dir)
}

fn write(path: &Path, body: &str) -> Result<()> {
    std::fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
}

/// Load a report from an artifact directory's `report.json`.
pub fn load_artifacts(dir: &Path) -> Result<BacktestReport> {
    let path = dir.join("report.json");
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    import_json(&json)
}

// ─── Markdown report ────────────────────────────────────────────────

fn fmt_opt(v: Option<f64>, suffix: &str) -> String {
    match v {
        Some(x) => format!("{x:.2}{suffix}"),
        None => "n/a".into(),
    }
}

/// Human-readable summary of a single run.
pub fn generate_report(report: &BacktestReport) -> String {
    let m = &report.summary;
    let mut md = String::with_capacity(2048);

    let _ = writeln!(md, "# Backtest Report\n");
    let _ = writeln!(md, "- **Run ID**: `{}`", report.run_id);
    let _ = writeln!(
        md,
        "- **Universe**: {}",
        report.config.market_data.universe.join(", ")
    );
    if let (Some(first), Some(last)) = (report.equity_curve.first(), report.equity_curve.last()) {
        let _ = writeln!(md, "- **Period**: {} to {}", first.timestamp, last.timestamp);
    }
    if report.has_synthetic {
        let _ = writeln!(md, "- **Data**: synthetic");
    }
    if !report.complete {
        let _ = writeln!(
            md,
            "- **Status**: incomplete ({} of {} steps)",
            report.steps_completed, report.calendar_len
        );
    }
    if report.halted {
        let reason = report
            .halt_reason
            .map(|r| format!("{r:?}"))
            .unwrap_or_default();
        let _ = writeln!(md, "- **Halted**: {reason}");
    }

    let _ = writeln!(md, "\n## Performance\n");
    let _ = writeln!(md, "| Metric | Value |");
    let _ = writeln!(md, "|--------|-------|");
    let rows = [
        ("Initial Capital", format!("{:.2}", m.initial_capital)),
        ("Final Value", format!("{:.2}", m.final_value)),
        ("Profit/Loss", format!("{:.2}", m.profit_loss)),
        ("Total Return", fmt_opt(m.total_return, "%")),
        ("CAGR", fmt_opt(m.cagr, "%")),
        ("Max Drawdown", fmt_opt(m.max_drawdown, "%")),
        ("Max DD Duration", format!("{} bars", m.max_drawdown_duration)),
        ("Volatility", fmt_opt(m.volatility, "%")),
        ("Sharpe", fmt_opt(m.sharpe, "")),
        ("Sortino", fmt_opt(m.sortino, "")),
        ("Calmar", fmt_opt(m.calmar, "")),
    ];
    for (name, value) in rows {
        let _ = writeln!(md, "| {name} | {value} |");
    }

    let _ = writeln!(md, "\n## Trades\n");
    let _ = writeln!(md, "| Metric | Value |");
    let _ = writeln!(md, "|--------|-------|");
    let rows = [
        ("Trades", m.num_trades.to_string()),
        ("Winners / Losers", format!("{} / {}", m.winning_trades, m.losing_trades)),
        ("Win Rate", fmt_opt(m.win_rate, "%")),
        ("Profit Factor", fmt_opt(m.profit_factor, "")),
        ("Avg Holding Period", fmt_opt(m.avg_holding_period, " days")),
        ("Average Win", fmt_opt(m.average_win, "")),
        ("Average Loss", fmt_opt(m.average_loss, "")),
        ("Largest Win", fmt_opt(m.largest_win, "")),
        ("Largest Loss", fmt_opt(m.largest_loss, "")),
        ("Rejected Orders", report.rejected_orders.len().to_string()),
        (
            "Signal Timeouts / Errors",
            format!("{} / {}", report.signal_timeouts, report.signal_errors),
        ),
    ];
    for (name, value) in rows {
        let _ = writeln!(md, "| {name} | {value} |");
    }

    if let Some(b) = &report.benchmark_comparison {
        let _ = writeln!(md, "\n## Benchmark\n");
        let _ = writeln!(md, "| Metric | Value |");
        let _ = writeln!(md, "|--------|-------|");
        let _ = writeln!(md, "| Benchmark Return | {} |", fmt_opt(b.benchmark_return, "%"));
        let _ = writeln!(md, "| Alpha | {} |", fmt_opt(b.alpha, "%"));
        let _ = writeln!(md, "| Beta | {} |", fmt_opt(b.beta, ""));
        let _ = writeln!(md, "| Tracking Error | {} |", fmt_opt(b.tracking_error, "%"));
        let _ = writeln!(md, "| Information Ratio | {} |", fmt_opt(b.information_ratio, ""));
    }

    if !report.annual_returns.is_empty() {
        let _ = writeln!(md, "\n## Annual Returns\n");
        let _ = writeln!(md, "| Year | Return |");
        let _ = writeln!(md, "|------|--------|");
        for r in &report.annual_returns {
            let _ = writeln!(md, "| {} | {} |", r.year, fmt_opt(r.return_pct, "%"));
        }
    }

    if !report.positions.is_empty() {
        let _ = writeln!(md, "\n## Open Positions\n");
        let _ = writeln!(md, "| Ticker | Quantity | Entry | Mark | Unrealized |");
        let _ = writeln!(md, "|--------|----------|-------|------|------------|");
        for p in &report.positions {
            let _ = writeln!(
                md,
                "| {} | {:.4} | {:.2} | {:.2} | {:.2} |",
                p.ticker, p.quantity, p.entry_price, p.current_price, p.unrealized_pnl
            );
        }
    }

    md
}
