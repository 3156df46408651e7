use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// Why a trade left the book. The serialised names match the historical
/// export format consumed by downstream tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ProfitTarget,
    StopLoss,
    #[serde(rename = "time_decay_dte")]
    TimeDecay,
    #[serde(rename = "max_days_in_trade")]
    MaxDit,
    IvCollapse,
    DeltaBreach,
    NearLegDte,
    Expiration,
    Manual,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::ProfitTarget => "profit_target",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TimeDecay => "time_decay_dte",
            ExitReason::MaxDit => "max_days_in_trade",
            ExitReason::IvCollapse => "iv_collapse",
            ExitReason::DeltaBreach => "delta_breach",
            ExitReason::NearLegDte => "near_leg_dte",
            ExitReason::Expiration => "expiration",
            ExitReason::Manual => "manual",
        }
    }
}

/// Entry signal emitted by the signal generator. Transient: consumed by the
/// simulator on the day it is produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySignal {
    pub date: NaiveDate,
    pub symbol: String,
    pub iv_at_entry: f64,
    pub iv_rank_at_entry: Option<f64>,
    pub iv_percentile_at_entry: f64,
    pub hv_at_entry: Option<f64>,
    pub skew_at_entry: Option<f64>,
    pub term_at_entry: Option<f64>,
    pub spot_at_entry: Option<f64>,
    /// Composite score, 0-100.
    pub signal_strength: f64,
}

/// P&L breakdown produced by every model variant.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PnlEstimate {
    pub total_pnl: f64,
    pub vega_pnl: f64,
    pub theta_pnl: f64,
    pub costs: f64,
    /// P&L as a percentage of max risk.
    pub pnl_pct: f64,
}

/// Aggregated position Greeks for an iron condor at a point in time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GreeksSnapshot {
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
    /// Net credit of the four-leg structure, per contract.
    pub position_price: f64,
}

/// A simulated trade through its lifecycle. Owned by the simulator from
/// creation until close; history buffers are append-only while open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedTrade {
    // Identity + entry snapshot
    pub entry_date: NaiveDate,
    pub symbol: String,
    pub strategy_type: String,
    pub iv_at_entry: f64,
    pub iv_percentile_at_entry: f64,
    pub iv_rank_at_entry: Option<f64>,
    pub spot_at_entry: Option<f64>,
    pub target_expiry: NaiveDate,

    // Calendar legs (None for single-expiry structures)
    pub short_expiry: Option<NaiveDate>,
    pub long_expiry: Option<NaiveDate>,
    pub entry_debit: Option<f64>,

    // Sizing
    pub max_risk: f64,
    /// Credit received at entry; 0 for debit strategies.
    pub estimated_credit: f64,
    pub num_contracts: u32,

    // Mutable state
    pub status: TradeStatus,
    pub current_pnl: f64,
    pub days_in_trade: i64,

    // Exit snapshot (set once on close)
    pub exit_date: Option<NaiveDate>,
    pub exit_reason: Option<ExitReason>,
    pub iv_at_exit: Option<f64>,
    pub spot_at_exit: Option<f64>,
    pub final_pnl: f64,

    // History tracking; iv/pnl/date always advance together
    pub pnl_history: Vec<f64>,
    pub iv_history: Vec<f64>,
    pub spot_history: Vec<f64>,
    pub date_history: Vec<NaiveDate>,

    pub greeks_at_entry: Option<GreeksSnapshot>,
    pub greeks_history: Vec<GreeksSnapshot>,
}

impl SimulatedTrade {
    /// Close the trade. Terminal: a second call is ignored so callers never
    /// observe a re-opened or re-priced exit.
    pub fn close(
        &mut self,
        exit_date: NaiveDate,
        exit_reason: ExitReason,
        final_pnl: f64,
        iv_at_exit: Option<f64>,
        spot_at_exit: Option<f64>,
    ) {
        if self.status == TradeStatus::Closed {
            tracing::debug!(symbol = %self.symbol, "ignoring close on already-closed trade");
            return;
        }
        self.status = TradeStatus::Closed;
        self.exit_date = Some(exit_date);
        self.exit_reason = Some(exit_reason);
        self.final_pnl = final_pnl;
        self.iv_at_exit = iv_at_exit;
        self.spot_at_exit = spot_at_exit;
        self.days_in_trade = (exit_date - self.entry_date).num_days();
    }

    pub fn is_closed(&self) -> bool {
        self.status == TradeStatus::Closed
    }

    pub fn is_winner(&self) -> bool {
        self.is_closed() && self.final_pnl > 0.0
    }

    pub fn is_calendar(&self) -> bool {
        self.short_expiry.is_some()
    }

    /// R-multiple: final P&L over the risk taken.
    pub fn return_on_risk(&self) -> f64 {
        if self.max_risk <= 0.0 {
            return 0.0;
        }
        self.final_pnl / self.max_risk
    }
}

/// Per-symbol slice of the performance metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolMetrics {
    pub total_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub avg_winner: f64,
    pub avg_loser: f64,
    pub profit_factor: f64,
    pub sharpe_ratio: f64,
}

/// Aggregate statistics over closed trades. Pure function of the trade list
/// plus initial capital; `win_rate` is a fraction (0-1), drawdown and return
/// figures are percentages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,

    pub total_pnl: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub average_pnl: f64,
    pub average_winner: f64,
    /// Positive magnitude of the average losing trade.
    pub average_loser: f64,
    pub profit_factor: f64,
    pub expectancy: f64,

    pub total_return_pct: f64,
    pub cagr: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub volatility: f64,

    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub max_drawdown_duration_days: i64,
    pub calmar_ratio: Option<f64>,
    pub ret_dd: Option<f64>,

    pub sqn: f64,

    pub avg_days_in_trade: f64,
    pub avg_days_winner: f64,
    pub avg_days_loser: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,

    pub exits_by_reason: BTreeMap<String, usize>,
    pub metrics_by_symbol: BTreeMap<String, SymbolMetrics>,
}

/// One equity-curve step, recorded at a trade's exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: f64,
    pub cumulative_pnl: f64,
    pub trade_pnl: f64,
    pub symbol: String,
    pub exit_reason: Option<ExitReason>,
}

/// Complete result of one backtest run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestResult {
    pub config_summary: serde_json::Value,

    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Per-symbol in-sample end dates chosen by the ratio split.
    pub split_dates: BTreeMap<String, NaiveDate>,

    pub trades: Vec<SimulatedTrade>,
    pub in_sample_trade_count: usize,
    pub out_sample_trade_count: usize,

    pub in_sample_metrics: Option<PerformanceMetrics>,
    pub out_sample_metrics: Option<PerformanceMetrics>,
    pub combined_metrics: Option<PerformanceMetrics>,

    pub equity_curve: Vec<EquityPoint>,

    /// None when the out-of-sample partition produced no trades.
    pub degradation_score: Option<f64>,
    pub is_valid: bool,
    pub validation_messages: Vec<String>,
}

impl BacktestResult {
    pub fn summary(&self) -> serde_json::Value {
        let combined = self.combined_metrics.as_ref();
        serde_json::json!({
            "total_trades": self.trades.len(),
            "in_sample_trades": self.in_sample_trade_count,
            "out_sample_trades": self.out_sample_trade_count,
            "date_range": format!(
                "{} to {}",
                self.start_date.map_or_else(|| "?".to_string(), |d| d.to_string()),
                self.end_date.map_or_else(|| "?".to_string(), |d| d.to_string()),
            ),
            "degradation_score": self.degradation_score,
            "is_valid": self.is_valid,
            "total_pnl": combined.map_or(0.0, |m| m.total_pnl),
            "win_rate": combined.map_or(0.0, |m| m.win_rate),
            "sharpe_ratio": combined.map_or(0.0, |m| m.sharpe_ratio),
            "max_drawdown_pct": combined.map_or(0.0, |m| m.max_drawdown_pct),
        })
    }
}

#[cfg(test)]
pub(crate) fn make_test_trade(symbol: &str, entry: NaiveDate) -> SimulatedTrade {
    SimulatedTrade {
        entry_date: entry,
        symbol: symbol.to_string(),
        strategy_type: "iron_condor".to_string(),
        iv_at_entry: 0.30,
        iv_percentile_at_entry: 75.0,
        iv_rank_at_entry: Some(60.0),
        spot_at_entry: Some(100.0),
        target_expiry: entry + chrono::Duration::days(45),
        short_expiry: None,
        long_expiry: None,
        entry_debit: None,
        max_risk: 200.0,
        estimated_credit: 100.0,
        num_contracts: 1,
        status: TradeStatus::Open,
        current_pnl: 0.0,
        days_in_trade: 0,
        exit_date: None,
        exit_reason: None,
        iv_at_exit: None,
        spot_at_exit: None,
        final_pnl: 0.0,
        pnl_history: Vec::new(),
        iv_history: Vec::new(),
        spot_history: Vec::new(),
        date_history: Vec::new(),
        greeks_at_entry: None,
        greeks_history: Vec::new(),
    }
}
