use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};
use garde::Validate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}

/// Entry criteria for the signal generator. The `*_min` thresholds drive the
/// high-IV (credit) variant, the `*_max` thresholds the low-IV (calendar)
/// variant; optional filters are only enforced when the data field is present.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EntryRules {
    #[garde(range(min = 0.0, max = 100.0))]
    pub iv_percentile_min: f64,
    #[garde(inner(range(min = 0.0, max = 100.0)))]
    pub iv_percentile_max: Option<f64>,
    #[garde(inner(range(min = 0.0, max = 100.0)))]
    pub iv_rank_min: Option<f64>,
    #[garde(inner(range(min = 0.0, max = 100.0)))]
    pub iv_rank_max: Option<f64>,
    #[garde(skip)]
    pub skew_min: Option<f64>,
    #[garde(skip)]
    pub skew_max: Option<f64>,
    #[garde(skip)]
    pub term_structure_min: Option<f64>,
    #[garde(skip)]
    pub term_structure_max: Option<f64>,
    #[garde(skip)]
    pub iv_hv_spread_min: Option<f64>,
    /// Reject entries when the next earnings date falls within this many days.
    #[garde(inner(range(min = 0)))]
    pub min_days_until_earnings: Option<i64>,
}

impl Default for EntryRules {
    fn default() -> Self {
        Self {
            iv_percentile_min: 60.0,
            iv_percentile_max: None,
            iv_rank_min: None,
            iv_rank_max: None,
            skew_min: None,
            skew_max: None,
            term_structure_min: None,
            term_structure_max: None,
            iv_hv_spread_min: None,
            min_days_until_earnings: None,
        }
    }
}

/// Exit discipline thresholds. Percentages apply to the credit received
/// (credit strategies) or the debit paid (calendars).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ExitRules {
    #[garde(range(min = 0.0))]
    pub profit_target_pct: f64,
    #[garde(range(min = 0.0))]
    pub stop_loss_pct: f64,
    /// Exit when remaining DTE reaches this floor (gamma-risk avoidance).
    #[garde(range(min = 0))]
    pub min_dte: i64,
    #[garde(range(min = 1))]
    pub max_days_in_trade: i64,
    /// Vol points of IV drop below entry that realise the mean-reversion thesis.
    #[garde(range(min = 0.0))]
    pub iv_collapse_threshold: f64,
    /// Vol points of IV spike treated as a delta-breach proxy. When unset the
    /// evaluator uses the strategy-family default (15 for condors, 8 for
    /// calendars).
    #[garde(inner(range(min = 0.0)))]
    pub delta_breach_iv_spike: Option<f64>,
    /// Absolute spot move (percent of entry spot) that triggers delta breach.
    #[garde(range(min = 0.0))]
    pub spot_move_breach_pct: f64,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            profit_target_pct: 50.0,
            stop_loss_pct: 100.0,
            min_dte: 5,
            max_days_in_trade: 45,
            iv_collapse_threshold: 10.0,
            delta_breach_iv_spike: None,
            spot_move_breach_pct: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PositionSizing {
    #[garde(range(min = 1.0))]
    pub max_risk_per_trade: f64,
    #[garde(range(min = 1))]
    pub max_positions_per_symbol: usize,
    #[garde(range(min = 1))]
    pub max_total_positions: usize,
}

impl Default for PositionSizing {
    fn default() -> Self {
        Self {
            max_risk_per_trade: 200.0,
            max_positions_per_symbol: 1,
            max_total_positions: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SampleSplit {
    /// Fraction of each symbol's history used for the in-sample partition.
    #[garde(range(min = 0.0, max = 1.0))]
    pub in_sample_ratio: f64,
}

impl Default for SampleSplit {
    fn default() -> Self {
        Self {
            in_sample_ratio: 0.30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Costs {
    #[garde(range(min = 0.0))]
    pub commission_per_contract: f64,
    /// Entry slippage as percent of credit (reduces credit, increases debit).
    #[garde(range(min = 0.0, max = 100.0))]
    pub slippage_pct: f64,
}

impl Default for Costs {
    fn default() -> Self {
        Self {
            commission_per_contract: 1.0,
            slippage_pct: 5.0,
        }
    }
}

fn default_wing_width() -> f64 {
    5.0
}

fn default_short_delta() -> f64 {
    0.16
}

fn default_near_dte() -> i64 {
    37
}

fn default_far_dte() -> i64 {
    75
}

/// Strategy-specific parameters, tagged by `strategy_type`. The simulator and
/// signal generator branch on this variant; strategy names never travel as
/// bare strings through the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy_type", rename_all = "snake_case")]
pub enum StrategyParams {
    IronCondor {
        /// Strike distance between short and long legs, in points.
        #[serde(default = "default_wing_width", alias = "iron_condor_wing_width")]
        wing_width: f64,
        /// Target delta magnitude for the short strikes.
        #[serde(default = "default_short_delta", alias = "iron_condor_short_delta")]
        short_delta: f64,
        /// Standard-deviation distance of the short strikes; affects credit.
        #[serde(default)]
        stddev_range: Option<f64>,
        /// Reject entries whose max_loss/credit exceeds this ratio.
        #[serde(default)]
        min_risk_reward: Option<f64>,
    },
    Calendar {
        #[serde(default = "default_near_dte")]
        near_dte: i64,
        #[serde(default = "default_far_dte")]
        far_dte: i64,
    },
    /// Other credit structures (naked put, vertical credit spreads, ATM iron
    /// butterfly) share the condor's high-IV entry and IV-proxy P&L path.
    #[serde(
        alias = "naked_put",
        alias = "short_put_spread",
        alias = "short_call_spread",
        alias = "atm_iron_butterfly"
    )]
    Generic {
        #[serde(default = "default_wing_width")]
        wing_width: f64,
        #[serde(default)]
        stddev_range: Option<f64>,
        #[serde(default)]
        min_risk_reward: Option<f64>,
    },
}

impl StrategyParams {
    pub fn is_calendar(&self) -> bool {
        matches!(self, StrategyParams::Calendar { .. })
    }

    /// Credit strategies sell premium and profit from IV contraction.
    pub fn is_credit(&self) -> bool {
        !self.is_calendar()
    }

    pub fn label(&self) -> &'static str {
        match self {
            StrategyParams::IronCondor { .. } => "iron_condor",
            StrategyParams::Calendar { .. } => "calendar",
            StrategyParams::Generic { .. } => "generic_credit",
        }
    }

    pub fn wing_width(&self) -> Option<f64> {
        match self {
            StrategyParams::IronCondor { wing_width, .. }
            | StrategyParams::Generic { wing_width, .. } => Some(*wing_width),
            StrategyParams::Calendar { .. } => None,
        }
    }

    pub fn stddev_range(&self) -> Option<f64> {
        match self {
            StrategyParams::IronCondor { stddev_range, .. }
            | StrategyParams::Generic { stddev_range, .. } => *stddev_range,
            StrategyParams::Calendar { .. } => None,
        }
    }

    pub fn min_risk_reward(&self) -> Option<f64> {
        match self {
            StrategyParams::IronCondor {
                min_risk_reward, ..
            }
            | StrategyParams::Generic {
                min_risk_reward, ..
            } => *min_risk_reward,
            StrategyParams::Calendar { .. } => None,
        }
    }
}

impl Default for StrategyParams {
    fn default() -> Self {
        StrategyParams::IronCondor {
            wing_width: default_wing_width(),
            short_delta: default_short_delta(),
            stddev_range: None,
            min_risk_reward: None,
        }
    }
}

fn default_symbols() -> Vec<String> {
    ["SPY", "QQQ", "IWM", "AAPL", "MSFT"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_target_dte() -> i64 {
    45
}

/// Top-level backtest configuration, normally loaded from YAML.
///
/// `start_date` and `end_date` are required: the upstream tooling this was
/// distilled from shipped two conflicting defaults, so the date range must be
/// stated explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BacktestConfig {
    #[serde(flatten)]
    #[garde(skip)]
    pub strategy: StrategyParams,

    #[serde(default = "default_symbols")]
    #[garde(length(min = 1))]
    pub symbols: Vec<String>,

    #[garde(skip)]
    pub start_date: NaiveDate,
    #[garde(custom(validate_date_order(self.start_date)))]
    pub end_date: NaiveDate,

    /// Days to expiration targeted at entry (primary expiry for calendars is
    /// derived from the leg DTEs instead).
    #[serde(default = "default_target_dte")]
    #[garde(range(min = 1))]
    pub target_dte: i64,

    #[serde(default)]
    #[garde(dive)]
    pub entry_rules: EntryRules,
    #[serde(default)]
    #[garde(dive)]
    pub exit_rules: ExitRules,
    #[serde(default)]
    #[garde(dive)]
    pub position_sizing: PositionSizing,
    #[serde(default)]
    #[garde(dive)]
    pub sample_split: SampleSplit,
    #[serde(default)]
    #[garde(dive)]
    pub costs: Costs,

    /// Use the Black-Scholes Greeks P&L model instead of the IV proxy.
    #[serde(default)]
    #[garde(skip)]
    pub use_greeks_model: bool,

    /// Root directory for historical data files. Falls back to the
    /// `PREMIA_DATA_ROOT` environment variable, then `./data`.
    #[serde(default)]
    #[garde(skip)]
    pub data_root: Option<PathBuf>,
}

fn validate_date_order(start: NaiveDate) -> impl FnOnce(&NaiveDate, &()) -> garde::Result {
    move |end: &NaiveDate, (): &()| {
        if *end < start {
            return Err(garde::Error::new(format!(
                "end_date ({end}) must not precede start_date ({start})"
            )));
        }
        Ok(())
    }
}

impl BacktestConfig {
    /// Load and validate a config from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// In-sample end date derived from the configured split ratio over the
    /// whole backtest window. Per-symbol splits (preferred) are computed by
    /// the loader from each symbol's own range.
    pub fn in_sample_end_date(&self) -> NaiveDate {
        let total_days = (self.end_date - self.start_date).num_days();
        let in_sample_days = (total_days as f64 * self.sample_split.in_sample_ratio) as i64;
        self.start_date + Duration::days(in_sample_days)
    }

    pub fn resolve_data_root(&self) -> PathBuf {
        if let Some(root) = &self.data_root {
            return root.clone();
        }
        std::env::var("PREMIA_DATA_ROOT")
            .map_or_else(|_| PathBuf::from("data"), PathBuf::from)
    }

    /// Effective IV-spike threshold (vol points) for the delta-breach proxy.
    pub fn delta_breach_iv_spike(&self) -> f64 {
        self.exit_rules
            .delta_breach_iv_spike
            .unwrap_or(if self.strategy.is_calendar() { 8.0 } else { 15.0 })
    }
}
