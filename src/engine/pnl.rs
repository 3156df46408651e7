use chrono::NaiveDate;

use super::types::{EntrySignal, ExitReason, GreeksSnapshot, PnlEstimate, SimulatedTrade};
use crate::config::{BacktestConfig, Costs, ExitRules, StrategyParams};

/// Dollar vega per vol point per $100 of max risk for a short-premium
/// structure.
const IC_VEGA_SENSITIVITY: f64 = 1.5;
/// Fraction of credit captured by theta over the full DTE.
const IC_THETA_DECAY_FACTOR: f64 = 0.5;

/// Dollar vega per vol point per $100 of debit; calendars are net long vega.
const CAL_VEGA_SENSITIVITY: f64 = 2.0;
/// Fraction of debit captured from the near/far theta differential.
const CAL_THETA_DIFFERENTIAL: f64 = 0.15;
/// Floor on the estimated calendar debit, dollars per contract.
const CAL_MIN_DEBIT: f64 = 50.0;
/// Fallback debit when no spot price is available to size the legs.
const CAL_FALLBACK_DEBIT: f64 = 200.0;

/// Market snapshot handed to a model when marking a position.
#[derive(Debug, Clone, Copy)]
pub struct MarkInputs {
    pub current_date: NaiveDate,
    pub current_iv: f64,
    pub current_spot: Option<f64>,
    pub current_term: Option<f64>,
    pub term_at_entry: Option<f64>,
}

/// Daily P&L estimation without intraday option quotes.
///
/// Implementations estimate the entry credit/debit, the running mark, and the
/// exit-adjusted final P&L. The simulator talks to this trait only; model
/// selection happens once, from configuration.
pub trait PnlModel: Send + Sync {
    /// Credit received (credit structures) or debit paid (calendars) at
    /// entry, in dollars, before slippage.
    fn estimate_entry_cost(&self, signal: &EntrySignal) -> f64;

    fn estimate_pnl(&self, trade: &SimulatedTrade, mark: &MarkInputs) -> PnlEstimate;

    fn estimate_exit_pnl(
        &self,
        trade: &SimulatedTrade,
        mark: &MarkInputs,
        reason: ExitReason,
    ) -> f64;

    /// Position Greeks at entry, when the model tracks them.
    fn entry_greeks(&self, _signal: &EntrySignal) -> Option<GreeksSnapshot> {
        None
    }

    /// Position Greeks for the current mark, when the model tracks them.
    fn greeks_snapshot(&self, _trade: &SimulatedTrade, _mark: &MarkInputs) -> Option<GreeksSnapshot> {
        None
    }
}

/// Select the P&L model for a configuration.
pub fn model_for(config: &BacktestConfig) -> Box<dyn PnlModel> {
    match &config.strategy {
        StrategyParams::Calendar { .. } => Box::new(CalendarSpreadPnlModel::new(config)),
        _ if config.use_greeks_model => {
            Box::new(super::greeks::GreeksPnlModel::new(config))
        }
        _ => Box::new(IronCondorPnlModel::new(config)),
    }
}

/// Exit-reason adjustments shared by the credit-structure models.
pub(crate) fn credit_exit_adjustment(
    reason: ExitReason,
    running: f64,
    credit: f64,
    max_risk: f64,
    exit_rules: &ExitRules,
    spot_at_entry: Option<f64>,
    spot_at_exit: Option<f64>,
) -> f64 {
    match reason {
        ExitReason::ProfitTarget => {
            running.min(credit * exit_rules.profit_target_pct / 100.0)
        }
        ExitReason::StopLoss => running.max(-credit * exit_rules.stop_loss_pct / 100.0),
        ExitReason::IvCollapse => running.max(0.0),
        ExitReason::DeltaBreach => match (spot_at_entry, spot_at_exit) {
            (Some(entry), Some(exit)) if entry > 0.0 => {
                let spot_move_pct = ((exit - entry) / entry).abs() * 100.0;
                // ~50% of max risk at a 5% move, approaching full loss at 15%.
                let loss_factor = ((spot_move_pct / 15.0).min(1.0)).mul_add(0.8, 0.2);
                (-max_risk * loss_factor).max(-max_risk)
            }
            _ => -max_risk * 0.6,
        },
        _ => running,
    }
}

/// IV-proxy model for iron condors and related credit structures.
///
/// Without bid/ask or Greeks history, the mark is decomposed into a vega leg
/// (IV change since entry) and a theta leg (square-root time decay of the
/// credit), capped to the structure's bounded risk/reward.
pub struct IronCondorPnlModel {
    wing_width: f64,
    stddev_range: Option<f64>,
    target_dte: i64,
    exit_rules: ExitRules,
    costs: Costs,
}

impl IronCondorPnlModel {
    pub fn new(config: &BacktestConfig) -> Self {
        Self {
            wing_width: config.strategy.wing_width().unwrap_or(5.0),
            stddev_range: config.strategy.stddev_range(),
            target_dte: config.target_dte,
            exit_rules: config.exit_rules.clone(),
            costs: config.costs.clone(),
        }
    }

    /// Credit as a fraction of wing width, scaled by IV level, DTE, and the
    /// short strikes' standard-deviation distance; capped to 20-50%.
    pub fn estimate_credit(&self, iv_at_entry: f64) -> f64 {
        let wing_width = self.wing_width * 100.0;

        let base_ratio = 0.30;
        let iv_adjustment = iv_at_entry / 0.20;
        let dte_adjustment = (self.target_dte as f64 / 45.0).min(1.2);
        let stddev_adjustment = match self.stddev_range {
            Some(range) if range > 0.0 => (1.5 / range).powf(0.6).clamp(0.5, 1.5),
            _ => 1.0,
        };

        let ratio =
            (base_ratio * iv_adjustment * dte_adjustment * stddev_adjustment).clamp(0.20, 0.50);
        wing_width * ratio
    }

    pub(crate) fn commission(&self, max_risk: f64) -> f64 {
        let contracts = ((max_risk / self.wing_width / 100.0) as i64).max(1);
        // Four legs per condor.
        contracts as f64 * 4.0 * self.costs.commission_per_contract
    }
}

impl PnlModel for IronCondorPnlModel {
    fn estimate_entry_cost(&self, signal: &EntrySignal) -> f64 {
        self.estimate_credit(signal.iv_at_entry)
    }

    fn estimate_pnl(&self, trade: &SimulatedTrade, mark: &MarkInputs) -> PnlEstimate {
        let iv_drop_vp = (trade.iv_at_entry - mark.current_iv) * 100.0;
        let vega_pnl = iv_drop_vp * IC_VEGA_SENSITIVITY * (trade.max_risk / 100.0);

        let time_fraction = if self.target_dte > 0 {
            trade.days_in_trade as f64 / self.target_dte as f64
        } else {
            0.0
        };
        let theta_pnl =
            trade.estimated_credit * time_fraction.max(0.0).sqrt() * IC_THETA_DECAY_FACTOR;

        let costs = self.commission(trade.max_risk);

        let total_pnl =
            (vega_pnl + theta_pnl - costs).clamp(-trade.max_risk, trade.estimated_credit);
        let pnl_pct = if trade.max_risk > 0.0 {
            total_pnl / trade.max_risk * 100.0
        } else {
            0.0
        };

        PnlEstimate {
            total_pnl,
            vega_pnl,
            theta_pnl,
            costs,
            pnl_pct,
        }
    }

    fn estimate_exit_pnl(
        &self,
        trade: &SimulatedTrade,
        mark: &MarkInputs,
        reason: ExitReason,
    ) -> f64 {
        let running = self.estimate_pnl(trade, mark).total_pnl;
        credit_exit_adjustment(
            reason,
            running,
            trade.estimated_credit,
            trade.max_risk,
            &self.exit_rules,
            trade.spot_at_entry,
            mark.current_spot,
        )
    }
}

/// Vega-long model for ATM call calendars.
///
/// These are volatility-mispricing trades, not theta trades: entered when IV
/// is depressed, exited quickly when the term structure normalises or the IV
/// move happens.
pub struct CalendarSpreadPnlModel {
    near_dte: i64,
    far_dte: i64,
    exit_rules: ExitRules,
    costs: Costs,
}

impl CalendarSpreadPnlModel {
    pub fn new(config: &BacktestConfig) -> Self {
        let (near_dte, far_dte) = match config.strategy {
            StrategyParams::Calendar { near_dte, far_dte } => (near_dte, far_dte),
            _ => (37, 75),
        };
        Self {
            near_dte,
            far_dte,
            exit_rules: config.exit_rules.clone(),
            costs: config.costs.clone(),
        }
    }

    /// ATM time value ≈ 0.4 · spot · iv · √(dte/365); the debit is the
    /// far/near differential with a spread haircut and a hard floor.
    pub fn estimate_debit(&self, iv_at_entry: f64, spot_price: f64) -> f64 {
        let near_tv = 0.4 * spot_price * iv_at_entry * (self.near_dte as f64 / 365.0).sqrt();
        let far_tv = 0.4 * spot_price * iv_at_entry * (self.far_dte as f64 / 365.0).sqrt();

        let debit = (far_tv - near_tv) * 0.70 * 100.0;
        debit.max(CAL_MIN_DEBIT)
    }

    fn entry_debit(trade: &SimulatedTrade) -> f64 {
        trade.entry_debit.unwrap_or(trade.max_risk)
    }

    fn near_dte_at_entry(&self, trade: &SimulatedTrade) -> i64 {
        trade
            .short_expiry
            .map_or(self.near_dte, |e| (e - trade.entry_date).num_days())
    }
}

impl PnlModel for CalendarSpreadPnlModel {
    fn estimate_entry_cost(&self, signal: &EntrySignal) -> f64 {
        match signal.spot_at_entry {
            Some(spot) if spot > 0.0 => self.estimate_debit(signal.iv_at_entry, spot),
            _ => CAL_FALLBACK_DEBIT,
        }
    }

    fn estimate_pnl(&self, trade: &SimulatedTrade, mark: &MarkInputs) -> PnlEstimate {
        let entry_debit = Self::entry_debit(trade);

        let iv_change_vp = (mark.current_iv - trade.iv_at_entry) * 100.0;
        let vega_pnl = iv_change_vp * CAL_VEGA_SENSITIVITY * (entry_debit / 100.0);

        let near_dte = self.near_dte_at_entry(trade);
        let time_fraction = if near_dte > 0 {
            trade.days_in_trade as f64 / near_dte as f64
        } else {
            0.0
        };
        let theta_progress = time_fraction.max(0.0).powf(0.7).min(1.0);
        let theta_pnl = entry_debit * theta_progress * CAL_THETA_DIFFERENTIAL;

        // Profit when an inverted term structure narrows back.
        let term_pnl = match (mark.term_at_entry, mark.current_term) {
            (Some(entry), Some(current)) => (entry - current) * (entry_debit / 100.0) * 0.5,
            _ => 0.0,
        };

        let costs = 2.0 * self.costs.commission_per_contract;

        let total_pnl =
            (vega_pnl + theta_pnl + term_pnl - costs).clamp(-entry_debit, entry_debit);
        let pnl_pct = if entry_debit > 0.0 {
            total_pnl / entry_debit * 100.0
        } else {
            0.0
        };

        PnlEstimate {
            total_pnl,
            vega_pnl,
            theta_pnl: theta_pnl + term_pnl,
            costs,
            pnl_pct,
        }
    }

    fn estimate_exit_pnl(
        &self,
        trade: &SimulatedTrade,
        mark: &MarkInputs,
        reason: ExitReason,
    ) -> f64 {
        let entry_debit = Self::entry_debit(trade);
        let running = self.estimate_pnl(trade, mark).total_pnl;

        match reason {
            ExitReason::ProfitTarget => {
                running.min(entry_debit * self.exit_rules.profit_target_pct / 100.0)
            }
            ExitReason::StopLoss => {
                running.max(-entry_debit * self.exit_rules.stop_loss_pct / 100.0)
            }
            _ => running,
        }
    }
}
