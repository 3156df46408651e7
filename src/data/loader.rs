use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};
use rayon::prelude::*;
use serde_json::Value;

use super::series::{IvDataPoint, IvTimeSeries};
use super::{EarningsCalendar, SpotOhlc};
use crate::config::BacktestConfig;

/// Calendar-day lookback for the rolling IV percentile/rank fill. Calendar
/// days, not trading days: gaps in the data shrink the effective sample.
const PERCENTILE_LOOKBACK_DAYS: i64 = 252;

/// Minimum prior samples inside the lookback window before a percentile is
/// computed.
const MIN_LOOKBACK_SAMPLES: usize = 20;

pub type IvData = BTreeMap<String, IvTimeSeries>;

/// Loads and partitions historical IV data for backtesting.
///
/// Two per-symbol file layouts are supported, tried in order:
/// 1. `<root>/historical/{SYMBOL}.json`: pre-extracted research records
///    (`trade_date`, `iv30`, `contango` field names).
/// 2. `<root>/iv_daily_summary/{SYMBOL}.json`: daily summary exports
///    (`iv_rank (IV)` / `iv_rank (HV)` synonyms, `close` for spot).
///
/// Missing files drop the symbol with a warning; malformed records are
/// skipped individually. An empty overall result is the caller's problem;
/// the engine reports it as an invalid run.
pub struct DataLoader {
    root: PathBuf,
    symbols: Vec<String>,
    start: NaiveDate,
    end: NaiveDate,
}

impl DataLoader {
    pub fn new(config: &BacktestConfig) -> Self {
        Self {
            root: config.resolve_data_root(),
            symbols: config.symbols.clone(),
            start: config.start_date,
            end: config.end_date,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Load every configured symbol. Independent file reads run on the rayon
    /// pool; the join into a `BTreeMap` keeps downstream iteration
    /// deterministic.
    pub fn load_all(&self) -> IvData {
        let loaded: Vec<(String, Option<IvTimeSeries>)> = self
            .symbols
            .par_iter()
            .map(|symbol| (symbol.clone(), self.load_symbol(symbol)))
            .collect();

        let mut data = IvData::new();
        for (symbol, series) in loaded {
            match series {
                Some(series) if !series.is_empty() => {
                    if let (Some(start), Some(end)) = (series.start_date(), series.end_date()) {
                        tracing::info!(
                            symbol = %symbol,
                            points = series.len(),
                            %start,
                            %end,
                            "loaded IV series"
                        );
                    }
                    data.insert(symbol, series);
                }
                _ => tracing::warn!(symbol = %symbol, "no IV data found, symbol omitted"),
            }
        }
        data
    }

    fn load_symbol(&self, symbol: &str) -> Option<IvTimeSeries> {
        let historical = self.root.join("historical").join(format!("{symbol}.json"));
        if let Some(series) = self.load_records(symbol, &historical) {
            return Some(series);
        }

        let summary = self
            .root
            .join("iv_daily_summary")
            .join(format!("{symbol}.json"));
        self.load_records(symbol, &summary)
    }

    /// Read one records file and build the series, filling missing
    /// percentile/rank from the rolling window.
    fn load_records(&self, symbol: &str, path: &Path) -> Option<IvTimeSeries> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(symbol, path = %path.display(), %err, "unreadable data file");
                return None;
            }
        };

        let records: Vec<Value> = match serde_json::from_str(&raw) {
            Ok(Value::Array(records)) => records,
            Ok(_) => {
                tracing::warn!(symbol, path = %path.display(), "expected a JSON array of records");
                return None;
            }
            Err(err) => {
                tracing::warn!(symbol, path = %path.display(), %err, "failed to parse data file");
                return None;
            }
        };

        // First pass: every parseable record with an IV, in date order. The
        // rolling window may reach back before the configured start date.
        let mut all_points: Vec<IvDataPoint> = records
            .iter()
            .filter_map(|record| match parse_record(record, symbol) {
                Some(point) => Some(point),
                None => {
                    tracing::debug!(symbol, "skipping malformed record");
                    None
                }
            })
            .collect();
        all_points.sort_by_key(|p| p.date);

        let iv_history: Vec<(NaiveDate, f64)> = all_points
            .iter()
            .filter_map(|p| p.atm_iv.map(|iv| (p.date, iv)))
            .collect();

        // Second pass: fill missing percentile/rank, keep in-range points.
        let mut series = IvTimeSeries::new(symbol);
        for point in &mut all_points {
            if point.date < self.start || point.date > self.end {
                continue;
            }
            if let Some(current_iv) = point.atm_iv {
                if point.iv_percentile.is_none() || point.iv_rank.is_none() {
                    fill_window_metrics(point, current_iv, &iv_history);
                }
            }
            if point.is_valid() {
                series.add(point.clone());
            }
        }

        if series.is_empty() {
            None
        } else {
            Some(series)
        }
    }

    /// Best-effort close prices from `<root>/spot_prices/{SYMBOL}.json`.
    pub fn load_spot_prices(&self, symbol: &str) -> BTreeMap<NaiveDate, f64> {
        self.load_spot_ohlc(symbol)
            .into_iter()
            .map(|(date, bar)| (date, bar.close))
            .collect()
    }

    /// Best-effort OHLC bars for gap analysis.
    pub fn load_spot_ohlc(&self, symbol: &str) -> BTreeMap<NaiveDate, SpotOhlc> {
        let path = self
            .root
            .join("spot_prices")
            .join(format!("{symbol}.json"));
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return BTreeMap::new();
        };
        let Ok(Value::Array(records)) = serde_json::from_str::<Value>(&raw) else {
            tracing::debug!(symbol, path = %path.display(), "no usable spot history");
            return BTreeMap::new();
        };

        let mut bars = BTreeMap::new();
        for record in &records {
            let Some(date) = field_date(record, &["date"]) else {
                continue;
            };
            let Some(close) = field_f64(record, &["close"]) else {
                continue;
            };
            if close <= 0.0 {
                continue;
            }
            bars.insert(
                date,
                SpotOhlc {
                    date,
                    open: field_f64(record, &["open"]).unwrap_or(close),
                    high: field_f64(record, &["high"]).unwrap_or(close),
                    low: field_f64(record, &["low"]).unwrap_or(close),
                    close,
                },
            );
        }
        bars
    }

    /// Best-effort earnings calendar from `<root>/earnings.json`
    /// (`{"SYMBOL": ["YYYY-MM-DD", ...]}`).
    pub fn load_earnings_calendar(&self) -> EarningsCalendar {
        let path = self.root.join("earnings.json");
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return EarningsCalendar::default();
        };
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&raw) else {
            tracing::warn!(path = %path.display(), "earnings calendar is not a JSON object");
            return EarningsCalendar::default();
        };

        let mut dates = BTreeMap::new();
        for (symbol, entries) in map {
            let Value::Array(entries) = entries else {
                continue;
            };
            let parsed: Vec<NaiveDate> = entries
                .iter()
                .filter_map(|v| v.as_str().and_then(parse_date))
                .collect();
            if !parsed.is_empty() {
                dates.insert(symbol.to_uppercase(), parsed);
            }
        }
        EarningsCalendar::new(dates)
    }
}

/// Union of all trading dates across symbols, ascending.
pub fn all_trading_dates(data: &IvData) -> Vec<NaiveDate> {
    let mut dates: Vec<NaiveDate> = data.values().flat_map(IvTimeSeries::dates).collect();
    dates.sort_unstable();
    dates.dedup();
    dates
}

/// Split every symbol's series at a single date (inclusive on the in-sample
/// side).
pub fn split_by_date(data: &IvData, split_date: NaiveDate) -> (IvData, IvData) {
    let mut in_sample = IvData::new();
    let mut out_sample = IvData::new();

    for (symbol, series) in data {
        let (before, after): (Vec<_>, Vec<_>) = series
            .iter()
            .cloned()
            .partition(|p| p.date <= split_date);

        if !before.is_empty() {
            in_sample.insert(symbol.clone(), IvTimeSeries::from_points(symbol, before));
        }
        if !after.is_empty() {
            out_sample.insert(symbol.clone(), IvTimeSeries::from_points(symbol, after));
        }
    }
    (in_sample, out_sample)
}

/// Split per symbol using each symbol's own date range, so both partitions
/// contain data even when symbols have disjoint histories. Returns the split
/// date chosen for each symbol.
pub fn split_by_ratio(
    data: &IvData,
    in_sample_ratio: f64,
) -> (IvData, IvData, BTreeMap<String, NaiveDate>) {
    let mut in_sample = IvData::new();
    let mut out_sample = IvData::new();
    let mut split_dates = BTreeMap::new();

    for (symbol, series) in data {
        let (Some(start), Some(end)) = (series.start_date(), series.end_date()) else {
            continue;
        };
        let total_days = (end - start).num_days();
        let in_days = (total_days as f64 * in_sample_ratio) as i64;
        let split_date = start + Duration::days(in_days);
        split_dates.insert(symbol.clone(), split_date);

        let (before, after): (Vec<_>, Vec<_>) = series
            .iter()
            .cloned()
            .partition(|p| p.date <= split_date);

        tracing::info!(
            symbol = %symbol,
            split = %split_date,
            in_sample = before.len(),
            out_sample = after.len(),
            "per-symbol split"
        );

        if !before.is_empty() {
            in_sample.insert(symbol.clone(), IvTimeSeries::from_points(symbol, before));
        }
        if !after.is_empty() {
            out_sample.insert(symbol.clone(), IvTimeSeries::from_points(symbol, after));
        }
    }
    (in_sample, out_sample, split_dates)
}

/// Fill missing `iv_percentile` / `iv_rank` from prior points inside the
/// lookback window. Percentile counts strictly-below prior IVs; rank places
/// the current IV inside the window's min/max band.
fn fill_window_metrics(point: &mut IvDataPoint, current_iv: f64, history: &[(NaiveDate, f64)]) {
    let window: Vec<f64> = history
        .iter()
        .filter(|(d, _)| {
            *d < point.date && (point.date - *d).num_days() <= PERCENTILE_LOOKBACK_DAYS
        })
        .map(|(_, iv)| *iv)
        .collect();

    if window.len() < MIN_LOOKBACK_SAMPLES {
        return;
    }

    if point.iv_percentile.is_none() {
        let below = window.iter().filter(|iv| **iv < current_iv).count();
        point.iv_percentile = Some(below as f64 / window.len() as f64 * 100.0);
    }

    if point.iv_rank.is_none() {
        let min = window.iter().copied().fold(current_iv, f64::min);
        let max = window.iter().copied().fold(current_iv, f64::max);
        if max > min {
            point.iv_rank = Some((current_iv - min) / (max - min) * 100.0);
        }
    }
}

/// Build one point from a raw record, tolerating both layouts' field names.
/// Returns `None` when the record lacks a parseable date or is not an object.
fn parse_record(record: &Value, symbol: &str) -> Option<IvDataPoint> {
    if !record.is_object() {
        return None;
    }
    let date = field_date(record, &["date", "trade_date"])?;

    Some(IvDataPoint {
        date,
        symbol: symbol.to_string(),
        atm_iv: field_f64(record, &["atm_iv", "iv30"]).map(normalize_iv),
        iv_rank: field_f64(record, &["iv_rank", "iv_rank (IV)", "iv_rank (HV)"]),
        iv_percentile: field_f64(
            record,
            &["iv_percentile", "iv_percentile (IV)", "iv_percentile (HV)"],
        ),
        hv30: field_f64(record, &["hv30"]).map(normalize_iv),
        skew: field_f64(record, &["skew"]),
        term_m1_m2: field_f64(record, &["term_m1_m2", "contango"]),
        term_m1_m3: field_f64(record, &["term_m1_m3"]),
        spot_price: field_f64(record, &["spot_price", "close"]),
    })
}

/// Boundary normalisation: IV above 2.0 is a percent figure, store decimal.
fn normalize_iv(value: f64) -> f64 {
    if value > 2.0 {
        value / 100.0
    } else {
        value
    }
}

fn field_f64(record: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match record.get(key) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(parsed) = s.parse::<f64>() {
                    return Some(parsed);
                }
            }
            _ => {}
        }
    }
    None
}

fn field_date(record: &Value, keys: &[&str]) -> Option<NaiveDate> {
    for key in keys {
        if let Some(Value::String(s)) = record.get(key) {
            if let Some(date) = parse_date(s) {
                return Some(date);
            }
        }
    }
    None
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}
