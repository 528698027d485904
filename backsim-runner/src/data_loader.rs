//! Bar loading for the runner.
//!
//! Reads one file per ticker from a data directory and aligns them into a
//! [`MarketData`]:
//! 1. `{TICKER}.parquet` if present, else `{TICKER}.csv` (both read through polars)
//! 2. optional `corporate_actions.csv` (`ticker,date,action,value`)
//! 3. optional `sectors.csv` (`ticker,sector`)
//!
//! Gaps stay explicit: a ticker with no row (or a null close) at an index
//! timestamp gets an empty slot for the engine's missing-data policy.
//!
//! Synthetic data is a seeded random walk for demos and benchmarks; results
//! built on it are tagged via [`LoadedData::has_synthetic`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate, NaiveDateTime, Weekday};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use backsim_core::domain::{Bar, CorporateAction, CorporateActionKind};
use backsim_core::error::DataError;
use backsim_core::MarketData;

pub const CORPORATE_ACTIONS_FILE: &str = "corporate_actions.csv";
pub const SECTORS_FILE: &str = "sectors.csv";

/// Errors from the data loading layer.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no data file for '{ticker}' in {}", dir.display())]
    MissingFile { ticker: String, dir: PathBuf },

    #[error("failed to read {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },

    #[error("{}: row {row}: {reason}", path.display())]
    InvalidRow {
        path: PathBuf,
        row: usize,
        reason: String,
    },

    #[error("failed to write {}: {reason}", path.display())]
    Write { path: PathBuf, reason: String },

    #[error("data error: {0}")]
    Data(#[from] DataError),
}

impl From<LoadError> for DataError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::Data(inner) => inner,
            other => DataError::Other(other.to_string()),
        }
    }
}

/// Loaded, aligned market data plus provenance.
#[derive(Debug, Clone)]
pub struct LoadedData {
    pub data: MarketData,
    /// BLAKE3 over every bar in ticker order.
    pub dataset_hash: String,
    pub has_synthetic: bool,
}

/// Load `tickers` from `dir`, aligning them to the union of their timestamps.
pub fn load_directory(dir: &Path, tickers: &[String]) -> Result<LoadedData, LoadError> {
    let mut per_ticker = BTreeMap::new();
    for ticker in tickers {
        let path = ticker_file(dir, ticker).ok_or_else(|| LoadError::MissingFile {
            ticker: ticker.clone(),
            dir: dir.to_path_buf(),
        })?;
        let bars = load_bar_file(&path)?;
        debug!(ticker = %ticker, bars = bars.len(), path = %path.display(), "loaded bars");
        per_ticker.insert(ticker.clone(), bars);
    }

    let mut data = MarketData::align(per_ticker);

    let actions_path = dir.join(CORPORATE_ACTIONS_FILE);
    if actions_path.exists() {
        let actions = load_corporate_actions(&actions_path)?;
        debug!(count = actions.len(), "loaded corporate actions");
        data = data.with_corporate_actions(actions);
    }
    let sectors_path = dir.join(SECTORS_FILE);
    if sectors_path.exists() {
        data = data.with_sectors(load_sectors(&sectors_path)?);
    }
    data.validate()?;

    info!(
        tickers = tickers.len(),
        timestamps = data.len(),
        dir = %dir.display(),
        "market data loaded"
    );
    Ok(LoadedData {
        dataset_hash: compute_dataset_hash(&data),
        data,
        has_synthetic: false,
    })
}

/// Parquet wins over CSV when both exist.
fn ticker_file(dir: &Path, ticker: &str) -> Option<PathBuf> {
    ["parquet", "csv"]
        .iter()
        .map(|ext| dir.join(format!("{ticker}.{ext}")))
        .find(|p| p.exists())
}

/// Read one ticker's bars from CSV or Parquet, by extension.
pub fn load_bar_file(path: &Path) -> Result<Vec<Bar>, LoadError> {
    let read_err = |e: PolarsError| LoadError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let df = match path.extension().and_then(|e| e.to_str()) {
        Some("parquet") => {
            let file = fs::File::open(path).map_err(|e| LoadError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            ParquetReader::new(file).finish().map_err(read_err)?
        }
        _ => LazyCsvReader::new(path)
            .with_has_header(true)
            .finish()
            .and_then(|lf| lf.collect())
            .map_err(read_err)?,
    };
    dataframe_to_bars(&df, path)
}

/// Convert a frame with `timestamp|date, open, high, low, close[, volume]` columns.
///
/// Rows with a null close are dropped and become gaps after alignment.
fn dataframe_to_bars(df: &DataFrame, path: &Path) -> Result<Vec<Bar>, LoadError> {
    let col_err = |reason: String| LoadError::Read {
        path: path.to_path_buf(),
        reason,
    };
    let ts_col = df
        .column("timestamp")
        .or_else(|_| df.column("date"))
        .map_err(|_| col_err("missing 'timestamp' or 'date' column".into()))?
        .cast(&DataType::String)
        .map_err(|e| col_err(format!("timestamp column: {e}")))?;
    let stamps = ts_col
        .str()
        .map_err(|e| col_err(format!("timestamp column: {e}")))?;

    let numeric = |name: &str, required: bool| -> Result<Option<Column>, LoadError> {
        match df.column(name) {
            Ok(c) => c
                .cast(&DataType::Float64)
                .map(Some)
                .map_err(|e| col_err(format!("{name} column: {e}"))),
            Err(_) if !required => Ok(None),
            Err(_) => Err(col_err(format!("missing '{name}' column"))),
        }
    };
    let close_col = numeric("close", true)?;
    let open_col = numeric("open", false)?;
    let high_col = numeric("high", false)?;
    let low_col = numeric("low", false)?;
    let volume_col = numeric("volume", false)?;

    let as_f64 = |c: &Option<Column>| -> Result<Option<Float64Chunked>, LoadError> {
        c.as_ref()
            .map(|c| c.f64().cloned())
            .transpose()
            .map_err(|e| col_err(e.to_string()))
    };
    let close = as_f64(&close_col)?.ok_or_else(|| col_err("missing 'close' column".into()))?;
    let open = as_f64(&open_col)?;
    let high = as_f64(&high_col)?;
    let low = as_f64(&low_col)?;
    let volume = as_f64(&volume_col)?;

    let mut bars = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let Some(c) = close.get(row) else {
            continue;
        };
        let raw = stamps.get(row).ok_or_else(|| LoadError::InvalidRow {
            path: path.to_path_buf(),
            row,
            reason: "null timestamp".into(),
        })?;
        let timestamp = parse_timestamp(raw).ok_or_else(|| LoadError::InvalidRow {
            path: path.to_path_buf(),
            row,
            reason: format!("unparseable timestamp '{raw}'"),
        })?;
        let pick = |col: &Option<Float64Chunked>| col.as_ref().and_then(|ca| ca.get(row));
        bars.push(Bar::new(
            timestamp,
            pick(&open).unwrap_or(c),
            pick(&high).unwrap_or(c),
            pick(&low).unwrap_or(c),
            c,
            pick(&volume).unwrap_or(0.0),
        ));
    }
    bars.sort_by_key(|b| b.timestamp);
    Ok(bars)
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS[.f]` and the `T`-separated form.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[derive(Debug, Deserialize)]
struct ActionRow {
    ticker: String,
    date: String,
    action: String,
    #[serde(default)]
    value: Option<f64>,
}

/// Read `ticker,date,action,value` rows; `action` is dividend, split or delisting.
pub fn load_corporate_actions(path: &Path) -> Result<Vec<CorporateAction>, LoadError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| LoadError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut actions = Vec::new();
    for (row, record) in reader.deserialize::<ActionRow>().enumerate() {
        let invalid = |reason: String| LoadError::InvalidRow {
            path: path.to_path_buf(),
            row,
            reason,
        };
        let r = record.map_err(|e| invalid(e.to_string()))?;
        let timestamp =
            parse_timestamp(&r.date).ok_or_else(|| invalid(format!("bad date '{}'", r.date)))?;
        let value = || r.value.ok_or_else(|| invalid(format!("{} needs a value", r.action)));
        let kind = match r.action.to_ascii_lowercase().as_str() {
            "dividend" => CorporateActionKind::Dividend {
                amount_per_share: value()?,
            },
            "split" => {
                let ratio = value()?;
                if ratio <= 0.0 {
                    return Err(invalid(format!("split ratio must be positive, got {ratio}")));
                }
                CorporateActionKind::Split { ratio }
            }
            "delisting" | "delist" => CorporateActionKind::Delisting,
            other => return Err(invalid(format!("unknown action '{other}'"))),
        };
        actions.push(CorporateAction {
            ticker: r.ticker,
            timestamp,
            kind,
        });
    }
    Ok(actions)
}

#[derive(Debug, Deserialize)]
struct SectorRow {
    ticker: String,
    sector: String,
}

pub fn load_sectors(path: &Path) -> Result<BTreeMap<String, String>, LoadError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| LoadError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    reader
        .deserialize::<SectorRow>()
        .enumerate()
        .map(|(row, rec)| {
            rec.map(|r| (r.ticker, r.sector))
                .map_err(|e| LoadError::InvalidRow {
                    path: path.to_path_buf(),
                    row,
                    reason: e.to_string(),
                })
        })
        .collect()
}

/// Deterministic BLAKE3 hash over all bar data, in ticker order.
pub fn compute_dataset_hash(data: &MarketData) -> String {
    let mut hasher = blake3::Hasher::new();
    for (ticker, series) in &data.series {
        hasher.update(ticker.as_bytes());
        for (ts, slot) in data.index.iter().zip(series) {
            hasher.update(ts.to_string().as_bytes());
            match slot {
                Some(bar) => {
                    for v in [bar.open, bar.high, bar.low, bar.close, bar.volume] {
                        hasher.update(&v.to_le_bytes());
                    }
                }
                None => {
                    hasher.update(b"-");
                }
            }
        }
    }
    hasher.finalize().to_hex().to_string()
}

// ── Synthetic data ──────────────────────────────────────────────────

/// Seeded random-walk bars for `tickers`, `days` weekdays from `start`.
pub fn generate_synthetic(tickers: &[String], start: NaiveDate, days: usize) -> LoadedData {
    let per_ticker: BTreeMap<String, Vec<Bar>> = tickers
        .iter()
        .map(|t| (t.clone(), generate_synthetic_bars(t, start, days)))
        .collect();
    let data = MarketData::align(per_ticker);
    warn!(
        tickers = tickers.len(),
        days, "using synthetic market data; results are tagged as synthetic"
    );
    LoadedData {
        dataset_hash: compute_dataset_hash(&data),
        data,
        has_synthetic: true,
    }
}

/// One ticker's random walk from 100.0, closing at 16:00 on weekdays.
///
/// The seed is derived from the ticker, so the same ticker always gets the
/// same path and different tickers get different paths.
pub fn generate_synthetic_bars(ticker: &str, start: NaiveDate, days: usize) -> Vec<Bar> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let seed: [u8; 32] = *blake3::hash(ticker.as_bytes()).as_bytes();
    let mut rng = StdRng::from_seed(seed);

    let mut bars = Vec::with_capacity(days);
    let mut price = 100.0_f64;
    let mut current = start;

    while bars.len() < days {
        if matches!(current.weekday(), Weekday::Sat | Weekday::Sun) {
            current += chrono::Duration::days(1);
            continue;
        }
        let daily_return: f64 = rng.gen_range(-0.03..0.03);
        let open = price;
        let close = price * (1.0 + daily_return);
        let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.01));
        let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.01));
        let volume = rng.gen_range(500_000..5_000_000u64) as f64;

        if let Some(ts) = current.and_hms_opt(16, 0, 0) {
            bars.push(Bar::new(ts, open, high, low, close, volume));
        }
        price = close;
        current += chrono::Duration::days(1);
    }
    bars
}

// ── Writers ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct BarRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Write bars as `{dir}/{ticker}.csv` in the layout [`load_directory`] reads.
pub fn write_csv_bars(dir: &Path, ticker: &str, bars: &[Bar]) -> Result<PathBuf, LoadError> {
    let path = dir.join(format!("{ticker}.csv"));
    let write_err = |reason: String| LoadError::Write {
        path: path.clone(),
        reason,
    };
    let mut writer = csv::Writer::from_path(&path).map_err(|e| write_err(e.to_string()))?;
    for b in bars {
        writer
            .serialize(BarRow {
                timestamp: b.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                open: b.open,
                high: b.high,
                low: b.low,
                close: b.close,
                volume: b.volume,
            })
            .map_err(|e| write_err(e.to_string()))?;
    }
    writer.flush().map_err(|e| write_err(e.to_string()))?;
    Ok(path)
}

/// Write bars as `{dir}/{ticker}.parquet`.
pub fn write_parquet_bars(dir: &Path, ticker: &str, bars: &[Bar]) -> Result<PathBuf, LoadError> {
    let path = dir.join(format!("{ticker}.parquet"));
    let write_err = |reason: String| LoadError::Write {
        path: path.clone(),
        reason,
    };
    let stamps: Vec<String> = bars
        .iter()
        .map(|b| b.timestamp.format(TIMESTAMP_FORMAT).to_string())
        .collect();
    let mut df = DataFrame::new(vec![
        Column::new("timestamp".into(), stamps),
        Column::new("open".into(), bars.iter().map(|b| b.open).collect::<Vec<_>>()),
        Column::new("high".into(), bars.iter().map(|b| b.high).collect::<Vec<_>>()),
        Column::new("low".into(), bars.iter().map(|b| b.low).collect::<Vec<_>>()),
        Column::new("close".into(), bars.iter().map(|b| b.close).collect::<Vec<_>>()),
        Column::new("volume".into(), bars.iter().map(|b| b.volume).collect::<Vec<_>>()),
    ])
    .map_err(|e| write_err(e.to_string()))?;

    let file = fs::File::create(&path).map_err(|e| write_err(e.to_string()))?;
    ParquetWriter::new(file)
        .finish(&mut df)
        .map_err(|e| write_err(e.to_string()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn write_file(dir: &Path, name: &str, body: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn parse_timestamp_formats() {
        let day = d(2024, 1, 2);
        assert_eq!(parse_timestamp("2024-01-02"), day.and_hms_opt(0, 0, 0));
        assert_eq!(
            parse_timestamp("2024-01-02 16:00:00"),
            day.and_hms_opt(16, 0, 0)
        );
        assert_eq!(
            parse_timestamp("2024-01-02T09:30:00"),
            day.and_hms_opt(9, 30, 0)
        );
        assert_eq!(parse_timestamp("01/02/2024"), None);
    }

    #[test]
    fn load_csv_directory_aligns_tickers() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "AAA.csv",
            "date,open,high,low,close,volume\n\
             2024-01-02,100,102,99,101,1000\n\
             2024-01-03,101,103,100,102,1100\n",
        );
        write_file(
            dir.path(),
            "BBB.csv",
            "date,open,high,low,close,volume\n2024-01-02,50,51,49,50.5,500\n",
        );

        let loaded =
            load_directory(dir.path(), &["AAA".to_string(), "BBB".to_string()]).unwrap();
        assert_eq!(loaded.data.len(), 2);
        assert_eq!(loaded.data.bar("AAA", 1).unwrap().close, 102.0);
        assert!(loaded.data.bar("BBB", 1).is_none());
        assert!(!loaded.has_synthetic);
        assert_eq!(loaded.dataset_hash.len(), 64);
    }

    #[test]
    fn missing_ticker_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_directory(dir.path(), &["NOPE".to_string()]).unwrap_err();
        assert!(matches!(err, LoadError::MissingFile { .. }));
        let data_err: DataError = err.into();
        assert!(data_err.to_string().contains("NOPE"));
    }

    #[test]
    fn corporate_actions_and_sectors_are_attached() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "AAA.csv",
            "date,close\n2024-01-02,100\n2024-01-03,101\n",
        );
        write_file(
            dir.path(),
            CORPORATE_ACTIONS_FILE,
            "ticker,date,action,value\n\
             AAA,2024-01-03,dividend,0.5\n\
             AAA,2024-01-03,split,2\n",
        );
        write_file(dir.path(), SECTORS_FILE, "ticker,sector\nAAA,Tech\n");

        let loaded = load_directory(dir.path(), &["AAA".to_string()]).unwrap();
        assert_eq!(loaded.data.corporate_actions.len(), 2);
        assert_eq!(loaded.data.sector("AAA"), Some("Tech"));
        let bar = loaded.data.bar("AAA", 0).unwrap();
        assert_eq!((bar.open, bar.high, bar.low), (100.0, 100.0, 100.0));
    }

    #[test]
    fn unknown_corporate_action_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CORPORATE_ACTIONS_FILE);
        write_file(
            dir.path(),
            CORPORATE_ACTIONS_FILE,
            "ticker,date,action,value\nAAA,2024-01-03,merger,1\n",
        );
        let err = load_corporate_actions(&path).unwrap_err();
        assert!(err.to_string().contains("merger"));
    }

    #[test]
    fn csv_writer_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let bars = generate_synthetic_bars("SPY", d(2024, 1, 1), 20);
        write_csv_bars(dir.path(), "SPY", &bars).unwrap();
        let back = load_bar_file(&dir.path().join("SPY.csv")).unwrap();
        assert_eq!(back.len(), 20);
        assert_eq!(back[0].timestamp, bars[0].timestamp);
        assert!((back[19].close - bars[19].close).abs() < 1e-9);
    }

    #[test]
    fn parquet_writer_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let bars = generate_synthetic_bars("QQQ", d(2024, 1, 1), 10);
        write_parquet_bars(dir.path(), "QQQ", &bars).unwrap();
        let loaded = load_directory(dir.path(), &["QQQ".to_string()]).unwrap();
        assert_eq!(loaded.data.len(), 10);
        assert_eq!(loaded.data.bar("QQQ", 9).unwrap().close, bars[9].close);
    }

    #[test]
    fn synthetic_data_is_deterministic_and_skips_weekends() {
        let a = generate_synthetic_bars("SPY", d(2024, 1, 1), 30);
        let b = generate_synthetic_bars("SPY", d(2024, 1, 1), 30);
        let c = generate_synthetic_bars("QQQ", d(2024, 1, 1), 30);
        assert_eq!(a, b);
        assert_eq!(a.len(), 30);
        assert_ne!(a[0].close, c[0].close);
        assert!(a
            .iter()
            .all(|bar| !matches!(bar.timestamp.weekday(), Weekday::Sat | Weekday::Sun)));
        assert!(a.iter().all(|bar| bar.is_sane()));
    }

    #[test]
    fn synthetic_market_is_tagged() {
        let loaded = generate_synthetic(&["A".to_string(), "B".to_string()], d(2024, 1, 1), 15);
        assert!(loaded.has_synthetic);
        assert_eq!(loaded.data.len(), 15);
        assert!(loaded.data.validate().is_ok());
    }
}
