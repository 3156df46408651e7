#![allow(dead_code)]

use std::path::Path;

use chrono::NaiveDate;
use serde_json::{json, Value};

use premia::config::BacktestConfig;

pub fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// One synthetic IV record for the pre-extracted historical layout.
pub struct DayRecord {
    pub date: NaiveDate,
    pub atm_iv: f64,
    pub iv_percentile: f64,
    pub spot: f64,
    pub term_m1_m2: Option<f64>,
}

impl DayRecord {
    pub fn new(date: NaiveDate, atm_iv: f64, iv_percentile: f64) -> Self {
        Self {
            date,
            atm_iv,
            iv_percentile,
            spot: 100.0,
            term_m1_m2: None,
        }
    }

    pub fn with_term(mut self, term: f64) -> Self {
        self.term_m1_m2 = Some(term);
        self
    }

    fn to_json(&self) -> Value {
        let mut record = json!({
            "date": self.date.to_string(),
            "atm_iv": self.atm_iv,
            "iv_percentile": self.iv_percentile,
            "spot_price": self.spot,
        });
        if let Some(term) = self.term_m1_m2 {
            record["term_m1_m2"] = json!(term);
        }
        record
    }
}

/// Write a symbol's series into `<root>/historical/{symbol}.json`.
pub fn write_symbol(root: &Path, symbol: &str, days: &[DayRecord]) {
    let dir = root.join("historical");
    std::fs::create_dir_all(&dir).unwrap();
    let records: Vec<Value> = days.iter().map(DayRecord::to_json).collect();
    std::fs::write(
        dir.join(format!("{symbol}.json")),
        serde_json::to_string_pretty(&records).unwrap(),
    )
    .unwrap();
}

/// Write `<root>/earnings.json`.
pub fn write_earnings(root: &Path, entries: &[(&str, &[&str])]) {
    let mut map = serde_json::Map::new();
    for (symbol, dates) in entries {
        map.insert((*symbol).to_string(), json!(dates));
    }
    std::fs::write(
        root.join("earnings.json"),
        serde_json::to_string(&Value::Object(map)).unwrap(),
    )
    .unwrap();
}

/// A config over the 2024 window with frictionless costs. A ratio of 1.0
/// keeps everything in-sample, which the single-trade scenarios use to avoid
/// splitting a two-point series.
pub fn config_for(
    strategy_yaml: &str,
    root: &Path,
    symbols: &[&str],
    in_sample_ratio: f64,
    extra_yaml: &str,
) -> BacktestConfig {
    let yaml = format!(
        "{strategy_yaml}\nsymbols: [{}]\nstart_date: 2024-01-01\nend_date: 2024-12-31\ndata_root: {}\nsample_split:\n  in_sample_ratio: {in_sample_ratio}\ncosts:\n  commission_per_contract: 0\n  slippage_pct: 0\n{extra_yaml}",
        symbols.join(", "),
        root.display(),
    );
    serde_yaml::from_str(&yaml).unwrap()
}

pub fn condor_config(
    root: &Path,
    symbols: &[&str],
    in_sample_ratio: f64,
    extra_yaml: &str,
) -> BacktestConfig {
    config_for(
        "strategy_type: iron_condor",
        root,
        symbols,
        in_sample_ratio,
        extra_yaml,
    )
}

pub fn calendar_config(
    root: &Path,
    symbols: &[&str],
    in_sample_ratio: f64,
    extra_yaml: &str,
) -> BacktestConfig {
    config_for(
        "strategy_type: calendar",
        root,
        symbols,
        in_sample_ratio,
        extra_yaml,
    )
}
