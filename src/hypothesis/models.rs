use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{
    BacktestConfig, Costs, EntryRules, ExitRules, PositionSizing, SampleSplit, StrategyParams,
};
use crate::engine::types::{BacktestResult, PerformanceMetrics, SymbolMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisStatus {
    Draft,
    Running,
    Completed,
    Failed,
}

/// Flat, sweep-friendly configuration for a hypothesis. A deliberately small
/// surface: the parameters people actually vary when comparing ideas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypothesisConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,

    pub symbols: Vec<String>,
    pub strategy_type: String,

    pub start_date: NaiveDate,
    pub end_date: NaiveDate,

    pub iv_percentile_min: f64,
    #[serde(default)]
    pub iv_rank_min: Option<f64>,

    pub profit_target_pct: f64,
    pub stop_loss_pct: f64,
    pub max_days_in_trade: i64,

    pub max_risk_per_trade: f64,

    /// Optional expectations for manual review, e.g. ">65%".
    #[serde(default)]
    pub expected_win_rate: Option<String>,
    #[serde(default)]
    pub expected_sharpe: Option<String>,
}

impl HypothesisConfig {
    pub fn new(name: impl Into<String>, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            symbols: vec!["SPY".to_string()],
            strategy_type: "iron_condor".to_string(),
            start_date,
            end_date,
            iv_percentile_min: 60.0,
            iv_rank_min: None,
            profit_target_pct: 50.0,
            stop_loss_pct: 100.0,
            max_days_in_trade: 45,
            max_risk_per_trade: 200.0,
            expected_win_rate: None,
            expected_sharpe: None,
        }
    }

    /// Expand into a full backtest configuration. The strategy tag reuses
    /// the config deserialiser so legacy names keep resolving.
    pub fn to_backtest_config(&self) -> BacktestConfig {
        let strategy: StrategyParams = serde_json::from_value(serde_json::json!({
            "strategy_type": self.strategy_type,
        }))
        .unwrap_or_else(|err| {
            tracing::warn!(strategy = %self.strategy_type, %err, "unknown strategy, using iron condor");
            StrategyParams::default()
        });

        BacktestConfig {
            strategy,
            symbols: self.symbols.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            target_dte: 45,
            entry_rules: EntryRules {
                iv_percentile_min: self.iv_percentile_min,
                iv_rank_min: self.iv_rank_min,
                ..EntryRules::default()
            },
            exit_rules: ExitRules {
                profit_target_pct: self.profit_target_pct,
                stop_loss_pct: self.stop_loss_pct,
                max_days_in_trade: self.max_days_in_trade,
                ..ExitRules::default()
            },
            position_sizing: PositionSizing {
                max_risk_per_trade: self.max_risk_per_trade,
                ..PositionSizing::default()
            },
            sample_split: SampleSplit::default(),
            costs: Costs::default(),
            use_greeks_model: false,
            data_root: None,
        }
    }

    /// Set a parameter by name, used by batch sweeps. Returns false for an
    /// unknown field or a type mismatch.
    pub fn set_field(&mut self, name: &str, value: &serde_json::Value) -> bool {
        match name {
            "name" => set_string(&mut self.name, value),
            "description" => set_string(&mut self.description, value),
            "strategy_type" => set_string(&mut self.strategy_type, value),
            "symbols" => {
                if let Some(list) = value.as_array() {
                    let symbols: Vec<String> = list
                        .iter()
                        .filter_map(|v| v.as_str().map(ToString::to_string))
                        .collect();
                    if symbols.len() == list.len() {
                        self.symbols = symbols;
                        return true;
                    }
                }
                false
            }
            "iv_percentile_min" => set_f64(&mut self.iv_percentile_min, value),
            "iv_rank_min" => {
                if value.is_null() {
                    self.iv_rank_min = None;
                    return true;
                }
                value.as_f64().is_some_and(|v| {
                    self.iv_rank_min = Some(v);
                    true
                })
            }
            "profit_target_pct" => set_f64(&mut self.profit_target_pct, value),
            "stop_loss_pct" => set_f64(&mut self.stop_loss_pct, value),
            "max_days_in_trade" => value.as_i64().is_some_and(|v| {
                self.max_days_in_trade = v;
                true
            }),
            "max_risk_per_trade" => set_f64(&mut self.max_risk_per_trade, value),
            "start_date" => set_date(&mut self.start_date, value),
            "end_date" => set_date(&mut self.end_date, value),
            _ => false,
        }
    }
}

fn set_string(slot: &mut String, value: &serde_json::Value) -> bool {
    value.as_str().is_some_and(|v| {
        *slot = v.to_string();
        true
    })
}

fn set_f64(slot: &mut f64, value: &serde_json::Value) -> bool {
    value.as_f64().is_some_and(|v| {
        *slot = v;
        true
    })
}

fn set_date(slot: &mut NaiveDate, value: &serde_json::Value) -> bool {
    value
        .as_str()
        .and_then(|s| s.parse::<NaiveDate>().ok())
        .is_some_and(|d| {
            *slot = d;
            true
        })
}

const WIN_RATE_WEIGHT: f64 = 0.30;
const SHARPE_WEIGHT: f64 = 0.35;
const STABILITY_WEIGHT: f64 = 0.20;
const FREQUENCY_WEIGHT: f64 = 0.15;

/// Composite 0-100 quality score for ranking hypotheses.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HypothesisScore {
    pub win_rate_score: f64,
    pub sharpe_score: f64,
    pub stability_score: f64,
    pub trade_frequency_score: f64,
}

impl HypothesisScore {
    pub fn from_metrics(
        metrics: &PerformanceMetrics,
        degradation_score: f64,
        total_trades: usize,
        date_range_days: i64,
    ) -> Self {
        // 50% win rate scores 0, 80% scores 100.
        let win_rate_score = ((metrics.win_rate * 100.0 - 50.0) * (100.0 / 30.0)).clamp(0.0, 100.0);
        // Sharpe 2.0 scores 100.
        let sharpe_score = (metrics.sharpe_ratio * 50.0).clamp(0.0, 100.0);
        // 0% degradation scores 100, 50% scores 0.
        let stability_score = 2.0f64.mul_add(-degradation_score, 100.0).clamp(0.0, 100.0);
        // 0.5 trades/month scores 0, 4+ scores 100.
        let trades_per_month = if date_range_days > 0 {
            total_trades as f64 / date_range_days as f64 * 30.0
        } else {
            0.0
        };
        let trade_frequency_score =
            ((trades_per_month - 0.5) * (100.0 / 3.5)).clamp(0.0, 100.0);

        Self {
            win_rate_score,
            sharpe_score,
            stability_score,
            trade_frequency_score,
        }
    }

    pub fn total_score(&self) -> f64 {
        self.win_rate_score * WIN_RATE_WEIGHT
            + self.sharpe_score * SHARPE_WEIGHT
            + self.stability_score * STABILITY_WEIGHT
            + self.trade_frequency_score * FREQUENCY_WEIGHT
    }
}

/// Compact persisted view of a backtest result; the full trade list stays
/// in memory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub total_trades: usize,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub degradation_score: Option<f64>,
    pub is_valid: bool,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub sharpe_ratio: f64,
    pub profit_factor: f64,
    pub max_drawdown_pct: f64,
    pub avg_days_in_trade: f64,
    pub exits_by_reason: BTreeMap<String, usize>,
    pub metrics_by_symbol: BTreeMap<String, SymbolMetrics>,
}

impl ResultSummary {
    pub fn from_result(result: &BacktestResult) -> Self {
        let m = result.combined_metrics.clone().unwrap_or_default();
        Self {
            total_trades: result.trades.len(),
            start_date: result.start_date,
            end_date: result.end_date,
            degradation_score: result.degradation_score,
            is_valid: result.is_valid,
            win_rate: m.win_rate,
            total_pnl: m.total_pnl,
            sharpe_ratio: m.sharpe_ratio,
            profit_factor: m.profit_factor,
            max_drawdown_pct: m.max_drawdown_pct,
            avg_days_in_trade: m.avg_days_in_trade,
            exits_by_reason: m.exits_by_reason,
            metrics_by_symbol: m.metrics_by_symbol,
        }
    }
}

fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// A named, testable trading idea: configuration plus (after a run) its
/// result summary, score, and status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: String,
    pub config: HypothesisConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    pub status: HypothesisStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub score: Option<HypothesisScore>,
    #[serde(default)]
    pub result_summary: Option<ResultSummary>,

    /// Full result of the most recent run; in-memory only.
    #[serde(skip)]
    pub result: Option<BacktestResult>,
}

impl Hypothesis {
    pub fn new(config: HypothesisConfig) -> Self {
        Self {
            id: generate_id(),
            config,
            created_at: Utc::now(),
            run_at: None,
            status: HypothesisStatus::Draft,
            tags: Vec::new(),
            error_message: None,
            score: None,
            result_summary: None,
            result: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_completed(&self) -> bool {
        self.status == HypothesisStatus::Completed && self.result_summary.is_some()
    }

    /// Fresh Draft copy with a new id; results are not carried over.
    pub fn clone_as_draft(&self, new_name: Option<&str>) -> Self {
        let mut config = self.config.clone();
        config.name = match new_name {
            Some(name) => name.to_string(),
            None => format!("{} (copy)", self.config.name),
        };

        Self {
            id: generate_id(),
            config,
            created_at: Utc::now(),
            run_at: None,
            status: HypothesisStatus::Draft,
            tags: self.tags.clone(),
            error_message: None,
            score: None,
            result_summary: None,
            result: None,
        }
    }

    /// Wipe run artefacts, reverting to Draft. Destructive; callers log.
    pub fn clear_results(&mut self) {
        self.status = HypothesisStatus::Draft;
        self.run_at = None;
        self.error_message = None;
        self.score = None;
        self.result_summary = None;
        self.result = None;
    }
}

/// A cohort of hypotheses produced by varying one parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypothesisBatch {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub hypothesis_ids: Vec<String>,
    #[serde(default)]
    pub varied_parameter: Option<String>,
    #[serde(default)]
    pub varied_values: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn config() -> HypothesisConfig {
        HypothesisConfig::new("baseline", ymd(2024, 1, 1), ymd(2024, 12, 31))
    }

    #[test]
    fn ids_are_eight_hex_chars() {
        let h = Hypothesis::new(config());
        assert_eq!(h.id.len(), 8);
        assert!(h.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_are_unique() {
        let a = Hypothesis::new(config());
        let b = Hypothesis::new(config());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn clone_as_draft_resets_state() {
        let mut original = Hypothesis::new(config());
        original.status = HypothesisStatus::Completed;
        original.score = Some(HypothesisScore::default());
        original.tags = vec!["v1".to_string()];

        let clone = original.clone_as_draft(None);
        assert_ne!(clone.id, original.id);
        assert_eq!(clone.status, HypothesisStatus::Draft);
        assert!(clone.score.is_none());
        assert_eq!(clone.config.name, "baseline (copy)");
        assert_eq!(clone.tags, original.tags);

        let named = original.clone_as_draft(Some("variant"));
        assert_eq!(named.config.name, "variant");
    }

    #[test]
    fn to_backtest_config_maps_fields() {
        let mut hc = config();
        hc.iv_percentile_min = 70.0;
        hc.profit_target_pct = 40.0;
        hc.max_risk_per_trade = 300.0;
        hc.symbols = vec!["QQQ".to_string()];

        let bc = hc.to_backtest_config();
        assert_eq!(bc.entry_rules.iv_percentile_min, 70.0);
        assert_eq!(bc.exit_rules.profit_target_pct, 40.0);
        assert_eq!(bc.position_sizing.max_risk_per_trade, 300.0);
        assert_eq!(bc.symbols, vec!["QQQ".to_string()]);
        assert!(bc.strategy.is_credit());
    }

    #[test]
    fn to_backtest_config_resolves_calendar() {
        let mut hc = config();
        hc.strategy_type = "calendar".to_string();
        assert!(hc.to_backtest_config().strategy.is_calendar());

        hc.strategy_type = "naked_put".to_string();
        let bc = hc.to_backtest_config();
        assert!(matches!(bc.strategy, StrategyParams::Generic { .. }));
    }

    #[test]
    fn set_field_known_and_unknown() {
        let mut hc = config();
        assert!(hc.set_field("iv_percentile_min", &serde_json::json!(80.0)));
        assert_eq!(hc.iv_percentile_min, 80.0);

        assert!(hc.set_field("max_days_in_trade", &serde_json::json!(30)));
        assert_eq!(hc.max_days_in_trade, 30);

        assert!(hc.set_field("start_date", &serde_json::json!("2023-06-01")));
        assert_eq!(hc.start_date, ymd(2023, 6, 1));

        assert!(!hc.set_field("nonsense", &serde_json::json!(1)));
        assert!(!hc.set_field("iv_percentile_min", &serde_json::json!("text")));
    }

    #[test]
    fn score_weights_and_clamps() {
        let metrics = PerformanceMetrics {
            win_rate: 0.65,
            sharpe_ratio: 1.2,
            total_trades: 24,
            ..PerformanceMetrics::default()
        };
        // Two years, 24 trades → 1 trade/month.
        let score = HypothesisScore::from_metrics(&metrics, 10.0, 24, 730);

        assert!((score.win_rate_score - 50.0).abs() < 1e-9);
        assert!((score.sharpe_score - 60.0).abs() < 1e-9);
        assert!((score.stability_score - 80.0).abs() < 1e-9);
        // (24/730*30 - 0.5) * 100/3.5 ≈ 13.9
        assert!(score.trade_frequency_score > 0.0 && score.trade_frequency_score < 20.0);

        let total = score.total_score();
        assert!(total > 0.0 && total <= 100.0);
    }

    #[test]
    fn score_saturates() {
        let metrics = PerformanceMetrics {
            win_rate: 0.95,
            sharpe_ratio: 5.0,
            total_trades: 200,
            ..PerformanceMetrics::default()
        };
        let score = HypothesisScore::from_metrics(&metrics, 0.0, 200, 365);
        assert_eq!(score.win_rate_score, 100.0);
        assert_eq!(score.sharpe_score, 100.0);
        assert_eq!(score.stability_score, 100.0);
        assert_eq!(score.trade_frequency_score, 100.0);
        assert!((score.total_score() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn hypothesis_serialises_without_full_result() {
        let mut h = Hypothesis::new(config());
        h.result = Some(BacktestResult::default());
        let json = serde_json::to_string(&h).unwrap();
        assert!(!json.contains("\"result\":"));

        let back: Hypothesis = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, h.id);
        assert!(back.result.is_none());
    }
}
