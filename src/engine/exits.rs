use chrono::NaiveDate;

use super::types::{ExitReason, SimulatedTrade};
use crate::config::BacktestConfig;

/// A triggered exit with its human-readable rationale.
#[derive(Debug, Clone)]
pub struct ExitDecision {
    pub reason: ExitReason,
    pub message: String,
}

/// Evaluates exit conditions for open trades in a fixed priority order; the
/// first rule that fires wins and at most one decision is produced per trade
/// per day.
///
/// Priority: profit target, stop loss, time decay (near-leg DTE for
/// calendars), delta breach, IV collapse, max days in trade, and an
/// expiration failsafe. On days without IV data the P&L- and IV-driven rules
/// (1, 2, 4, 5) are skipped; the time-based rules still run.
///
/// Delta breach is a proxy: without Greeks, a large IV spike or a large spot
/// move stands in for the position delta exceeding its threshold.
pub struct ExitEvaluator {
    profit_target_pct: f64,
    stop_loss_pct: f64,
    min_dte: i64,
    max_days_in_trade: i64,
    iv_collapse_threshold: f64,
    iv_spike_threshold: f64,
    spot_move_breach_pct: f64,
}

impl ExitEvaluator {
    pub fn new(config: &BacktestConfig) -> Self {
        Self {
            profit_target_pct: config.exit_rules.profit_target_pct,
            stop_loss_pct: config.exit_rules.stop_loss_pct,
            min_dte: config.exit_rules.min_dte,
            max_days_in_trade: config.exit_rules.max_days_in_trade,
            iv_collapse_threshold: config.exit_rules.iv_collapse_threshold,
            iv_spike_threshold: config.delta_breach_iv_spike(),
            spot_move_breach_pct: config.exit_rules.spot_move_breach_pct,
        }
    }

    /// Check all exit conditions for a trade on a day. `current_pnl` is the
    /// model's mark for this day, present only when IV data was available.
    pub fn evaluate(
        &self,
        trade: &SimulatedTrade,
        current_date: NaiveDate,
        current_iv: Option<f64>,
        current_spot: Option<f64>,
        current_pnl: Option<f64>,
    ) -> Option<ExitDecision> {
        let days_in_trade = (current_date - trade.entry_date).num_days();
        let remaining_dte = (trade.target_expiry - current_date).num_days();

        // Basis for the percentage rules: credit received, or debit paid.
        let basis = if trade.is_calendar() {
            trade.entry_debit.unwrap_or(trade.max_risk)
        } else {
            trade.estimated_credit
        };

        // 1. Profit target
        if let Some(pnl) = current_pnl {
            let target = basis * self.profit_target_pct / 100.0;
            if pnl >= target {
                return Some(ExitDecision {
                    reason: ExitReason::ProfitTarget,
                    message: format!("profit target reached: {pnl:.2} >= {target:.2}"),
                });
            }
        }

        // 2. Stop loss
        if let Some(pnl) = current_pnl {
            let stop = basis * self.stop_loss_pct / 100.0;
            if pnl <= -stop {
                return Some(ExitDecision {
                    reason: ExitReason::StopLoss,
                    message: format!("stop loss triggered: {pnl:.2} <= -{stop:.2}"),
                });
            }
        }

        // 3. Time decay / near-leg DTE
        if trade.is_calendar() {
            if let Some(short_expiry) = trade.short_expiry {
                let near_dte = (short_expiry - current_date).num_days();
                if near_dte <= self.min_dte {
                    return Some(ExitDecision {
                        reason: ExitReason::NearLegDte,
                        message: format!(
                            "near leg at {near_dte} DTE <= {} DTE minimum",
                            self.min_dte
                        ),
                    });
                }
            }
        } else if remaining_dte <= self.min_dte {
            return Some(ExitDecision {
                reason: ExitReason::TimeDecay,
                message: format!(
                    "time decay exit: {remaining_dte} DTE <= {} DTE minimum",
                    self.min_dte
                ),
            });
        }

        // 4. Delta breach (IV-spike proxy, or spot move when available)
        if let Some(iv) = current_iv {
            let iv_spike_vp = (iv - trade.iv_at_entry) * 100.0;
            if iv_spike_vp >= self.iv_spike_threshold {
                return Some(ExitDecision {
                    reason: ExitReason::DeltaBreach,
                    message: format!("delta breach proxy: IV up {iv_spike_vp:.1} vol points"),
                });
            }
            if let (Some(entry), Some(spot)) = (trade.spot_at_entry, current_spot) {
                if entry > 0.0 {
                    let move_pct = ((spot - entry) / entry).abs() * 100.0;
                    if move_pct >= self.spot_move_breach_pct {
                        return Some(ExitDecision {
                            reason: ExitReason::DeltaBreach,
                            message: format!("delta breach: spot moved {move_pct:.1}%"),
                        });
                    }
                }
            }
        }

        // 5. IV collapse: the short-vega thesis played out. Not meaningful
        // for vega-long calendars.
        if !trade.is_calendar() {
            if let Some(iv) = current_iv {
                let iv_drop_vp = (trade.iv_at_entry - iv) * 100.0;
                if iv_drop_vp >= self.iv_collapse_threshold {
                    return Some(ExitDecision {
                        reason: ExitReason::IvCollapse,
                        message: format!("IV collapse: down {iv_drop_vp:.1} vol points"),
                    });
                }
            }
        }

        // 6. Max days in trade
        if days_in_trade >= self.max_days_in_trade {
            return Some(ExitDecision {
                reason: ExitReason::MaxDit,
                message: format!(
                    "max DIT reached: {days_in_trade} >= {}",
                    self.max_days_in_trade
                ),
            });
        }

        // 7. Expiration failsafe
        if remaining_dte <= 0 {
            return Some(ExitDecision {
                reason: ExitReason::Expiration,
                message: "position expired".to_string(),
            });
        }

        None
    }
}
