use statrs::distribution::{Continuous, ContinuousCDF, Normal};

use super::pnl::{credit_exit_adjustment, IronCondorPnlModel, MarkInputs, PnlModel};
use super::types::{EntrySignal, ExitReason, GreeksSnapshot, PnlEstimate, SimulatedTrade};
use crate::config::{BacktestConfig, Costs, ExitRules};

/// Risk-free rate used for Black-Scholes pricing; matches the metrics module.
const RISK_FREE_RATE: f64 = 0.04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    Call,
    Put,
}

/// Per-share price and Greeks for a single option leg.
#[derive(Debug, Clone, Copy)]
pub struct LegGreeks {
    pub price: f64,
    pub delta: f64,
    pub gamma: f64,
    /// Per 1 vol point (1% IV).
    pub vega: f64,
    /// Per calendar day.
    pub theta: f64,
}

/// Black-Scholes price and Greeks for a European option.
pub fn black_scholes(
    option_type: OptionType,
    spot: f64,
    strike: f64,
    dte: i64,
    iv: f64,
) -> LegGreeks {
    let t = dte.max(0) as f64 / 365.0;

    if t <= 0.0 || iv <= 0.0 || spot <= 0.0 || strike <= 0.0 {
        // Expired or degenerate: intrinsic value, flat Greeks.
        let intrinsic = match option_type {
            OptionType::Call => (spot - strike).max(0.0),
            OptionType::Put => (strike - spot).max(0.0),
        };
        let delta = match option_type {
            OptionType::Call if spot > strike => 1.0,
            OptionType::Put if spot < strike => -1.0,
            _ => 0.0,
        };
        return LegGreeks {
            price: intrinsic,
            delta,
            gamma: 0.0,
            vega: 0.0,
            theta: 0.0,
        };
    }

    let normal = Normal::standard();
    let sqrt_t = t.sqrt();
    let d1 = ((spot / strike).ln() + (RISK_FREE_RATE + 0.5 * iv * iv) * t) / (iv * sqrt_t);
    let d2 = d1 - iv * sqrt_t;
    let discount = (-RISK_FREE_RATE * t).exp();
    let pdf_d1 = normal.pdf(d1);

    let (price, delta, theta_annual) = match option_type {
        OptionType::Call => {
            let price = spot * normal.cdf(d1) - strike * discount * normal.cdf(d2);
            let theta = -spot * pdf_d1 * iv / (2.0 * sqrt_t)
                - RISK_FREE_RATE * strike * discount * normal.cdf(d2);
            (price, normal.cdf(d1), theta)
        }
        OptionType::Put => {
            let price = strike * discount * normal.cdf(-d2) - spot * normal.cdf(-d1);
            let theta = -spot * pdf_d1 * iv / (2.0 * sqrt_t)
                + RISK_FREE_RATE * strike * discount * normal.cdf(-d2);
            (price, normal.cdf(d1) - 1.0, theta)
        }
    };

    LegGreeks {
        price,
        delta,
        gamma: pdf_d1 / (spot * iv * sqrt_t),
        vega: spot * pdf_d1 * sqrt_t / 100.0,
        theta: theta_annual / 365.0,
    }
}

/// Synthesise the four condor legs from spot and ATM IV, and aggregate the
/// position Greeks (`-short + long` on both wings).
///
/// The short strikes sit roughly at the 0.20-delta band (`spot ∓
/// 0.85·iv·spot`); the long wings one IV-sigma further out.
pub fn calculate_ic_greeks(spot: f64, iv: f64, dte: i64) -> GreeksSnapshot {
    let width = 0.85 * iv * spot;
    let wing = iv * spot;

    let short_put_strike = spot - width;
    let long_put_strike = short_put_strike - wing;
    let short_call_strike = spot + width;
    let long_call_strike = short_call_strike + wing;

    let short_put = black_scholes(OptionType::Put, spot, short_put_strike, dte, iv);
    let long_put = black_scholes(OptionType::Put, spot, long_put_strike, dte, iv);
    let short_call = black_scholes(OptionType::Call, spot, short_call_strike, dte, iv);
    let long_call = black_scholes(OptionType::Call, spot, long_call_strike, dte, iv);

    let aggregate = |f: fn(&LegGreeks) -> f64| {
        -f(&short_put) + f(&long_put) - f(&short_call) + f(&long_call)
    };

    let position_price =
        (short_put.price - long_put.price) + (short_call.price - long_call.price);

    GreeksSnapshot {
        delta: aggregate(|g| g.delta),
        gamma: aggregate(|g| g.gamma),
        vega: aggregate(|g| g.vega),
        theta: aggregate(|g| g.theta),
        // Net credit per contract; floored so the structure never prices free.
        position_price: (position_price * 100.0).max(0.01),
    }
}

/// Greeks-based P&L model for iron condors.
///
/// Daily P&L combines a gamma term on the spot move, averaged theta bleed,
/// and the change in position vega. Falls back to the IV-proxy model whenever
/// spot data is missing, so a sparse spot history degrades gracefully.
pub struct GreeksPnlModel {
    max_risk: f64,
    stddev_range: Option<f64>,
    target_dte: i64,
    exit_rules: ExitRules,
    costs: Costs,
    wing_width: f64,
    fallback: IronCondorPnlModel,
}

impl GreeksPnlModel {
    pub fn new(config: &BacktestConfig) -> Self {
        Self {
            max_risk: config.position_sizing.max_risk_per_trade,
            stddev_range: config.strategy.stddev_range(),
            target_dte: config.target_dte,
            exit_rules: config.exit_rules.clone(),
            costs: config.costs.clone(),
            wing_width: config.strategy.wing_width().unwrap_or(5.0),
            fallback: IronCondorPnlModel::new(config),
        }
    }

    /// Credit from synthetic leg prices, clamped to the 15-50% wing-width
    /// band. The band keeps a near-zero-priced structure from sizing the
    /// trade absurdly; a real deployment would widen strikes or refuse the
    /// trade instead.
    fn estimate_credit_from_greeks(&self, spot: f64, iv: f64) -> f64 {
        let entry = calculate_ic_greeks(spot, iv, self.target_dte);
        let mut ratio = (entry.position_price / (self.max_risk / 2.0)).clamp(0.15, 0.50);

        if let Some(range) = self.stddev_range {
            if range > 0.0 {
                let adjustment = (1.5 / range).powf(0.6).clamp(0.5, 1.5);
                ratio = (ratio * adjustment).clamp(0.15, 0.50);
            }
        }

        (self.max_risk * ratio).max(1.0)
    }
}

impl PnlModel for GreeksPnlModel {
    fn estimate_entry_cost(&self, signal: &EntrySignal) -> f64 {
        match signal.spot_at_entry {
            Some(spot) if spot > 0.0 => {
                self.estimate_credit_from_greeks(spot, signal.iv_at_entry)
            }
            _ => self.fallback.estimate_entry_cost(signal),
        }
    }

    fn estimate_pnl(&self, trade: &SimulatedTrade, mark: &MarkInputs) -> PnlEstimate {
        let (Some(entry_greeks), Some(spot_entry), Some(spot_current)) =
            (trade.greeks_at_entry, trade.spot_at_entry, mark.current_spot)
        else {
            return self.fallback.estimate_pnl(trade, mark);
        };

        let remaining_dte = (trade.target_expiry - mark.current_date).num_days().max(0);
        let current = calculate_ic_greeks(spot_current, mark.current_iv, remaining_dte);

        let spot_move = spot_current - spot_entry;
        let gamma_pnl = 0.5 * entry_greeks.gamma * spot_move * spot_move * 100.0;
        let avg_theta = (entry_greeks.theta + current.theta) / 2.0;
        let theta_pnl = avg_theta * trade.days_in_trade as f64 * 100.0;
        let vega_pnl = (current.vega - entry_greeks.vega) * 100.0;

        let contracts = ((trade.max_risk / self.wing_width / 100.0) as i64).max(1);
        let costs = contracts as f64 * 4.0 * self.costs.commission_per_contract;

        let total_pnl = (gamma_pnl + theta_pnl + vega_pnl - costs)
            .clamp(-trade.max_risk, trade.estimated_credit);
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

    fn entry_greeks(&self, signal: &EntrySignal) -> Option<GreeksSnapshot> {
        signal
            .spot_at_entry
            .filter(|spot| *spot > 0.0)
            .map(|spot| calculate_ic_greeks(spot, signal.iv_at_entry, self.target_dte))
    }

    fn greeks_snapshot(&self, trade: &SimulatedTrade, mark: &MarkInputs) -> Option<GreeksSnapshot> {
        let spot = mark.current_spot.filter(|s| *s > 0.0)?;
        let remaining_dte = (trade.target_expiry - mark.current_date).num_days().max(0);
        Some(calculate_ic_greeks(spot, mark.current_iv, remaining_dte))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::make_test_trade;
    use chrono::NaiveDate;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn config() -> BacktestConfig {
        let mut config: BacktestConfig = serde_yaml::from_str(
            "strategy_type: iron_condor\nstart_date: 2024-01-01\nend_date: 2024-12-31\nuse_greeks_model: true\n",
        )
        .unwrap();
        config.costs.commission_per_contract = 0.0;
        config
    }

    // --- Black-Scholes sanity ---

    #[test]
    fn atm_call_delta_near_half() {
        let leg = black_scholes(OptionType::Call, 100.0, 100.0, 45, 0.20);
        assert!(leg.delta > 0.5 && leg.delta < 0.6, "delta {}", leg.delta);
        assert!(leg.price > 0.0);
    }

    #[test]
    fn put_call_parity() {
        let call = black_scholes(OptionType::Call, 100.0, 105.0, 60, 0.25);
        let put = black_scholes(OptionType::Put, 100.0, 105.0, 60, 0.25);
        let t = 60.0 / 365.0;
        let parity = call.price - put.price - (100.0 - 105.0 * (-RISK_FREE_RATE * t).exp());
        assert!(parity.abs() < 1e-9, "parity gap {parity}");
    }

    #[test]
    fn deep_otm_put_near_zero() {
        let leg = black_scholes(OptionType::Put, 100.0, 40.0, 30, 0.20);
        assert!(leg.price < 0.01);
        assert!(leg.delta.abs() < 0.01);
    }

    #[test]
    fn expired_option_is_intrinsic() {
        let call = black_scholes(OptionType::Call, 110.0, 100.0, 0, 0.20);
        assert_eq!(call.price, 10.0);
        assert_eq!(call.delta, 1.0);
        assert_eq!(call.vega, 0.0);
    }

    #[test]
    fn theta_is_negative_for_long_options() {
        let call = black_scholes(OptionType::Call, 100.0, 100.0, 45, 0.20);
        assert!(call.theta < 0.0);
    }

    // --- condor aggregation ---

    #[test]
    fn ic_greeks_profile() {
        let greeks = calculate_ic_greeks(100.0, 0.20, 45);
        // Short premium: negative vega, positive theta, roughly delta-neutral.
        assert!(greeks.vega < 0.0, "vega {}", greeks.vega);
        assert!(greeks.theta > 0.0, "theta {}", greeks.theta);
        assert!(greeks.delta.abs() < 0.2, "delta {}", greeks.delta);
        assert!(greeks.gamma < 0.0, "gamma {}", greeks.gamma);
        assert!(greeks.position_price > 0.0);
    }

    // --- model behaviour ---

    fn entry_signal(spot: Option<f64>) -> EntrySignal {
        EntrySignal {
            date: ymd(2024, 1, 1),
            symbol: "SPY".to_string(),
            iv_at_entry: 0.25,
            iv_rank_at_entry: None,
            iv_percentile_at_entry: 80.0,
            hv_at_entry: None,
            skew_at_entry: None,
            term_at_entry: None,
            spot_at_entry: spot,
            signal_strength: 70.0,
        }
    }

    #[test]
    fn credit_stays_in_band() {
        let model = GreeksPnlModel::new(&config());
        let credit = model.estimate_entry_cost(&entry_signal(Some(100.0)));
        // 15-50% of the $200 max risk.
        assert!(credit >= 30.0 && credit <= 100.0, "credit {credit}");
    }

    #[test]
    fn entry_cost_falls_back_without_spot() {
        let model = GreeksPnlModel::new(&config());
        let proxy = IronCondorPnlModel::new(&config());
        let signal = entry_signal(None);
        assert_eq!(
            model.estimate_entry_cost(&signal),
            proxy.estimate_entry_cost(&signal)
        );
    }

    #[test]
    fn mark_falls_back_without_entry_greeks() {
        let model = GreeksPnlModel::new(&config());
        let mut trade = make_test_trade("SPY", ymd(2024, 1, 1));
        trade.greeks_at_entry = None;
        trade.days_in_trade = 5;

        let mark = MarkInputs {
            current_date: ymd(2024, 1, 6),
            current_iv: 0.25,
            current_spot: Some(100.0),
            current_term: None,
            term_at_entry: None,
        };
        let proxy = IronCondorPnlModel::new(&config()).estimate_pnl(&trade, &mark);
        let est = model.estimate_pnl(&trade, &mark);
        assert!((est.total_pnl - proxy.total_pnl).abs() < 1e-9);
    }

    #[test]
    fn flat_market_bleeds_theta_to_the_seller() {
        let model = GreeksPnlModel::new(&config());
        let mut trade = make_test_trade("SPY", ymd(2024, 1, 1));
        trade.iv_at_entry = 0.25;
        trade.spot_at_entry = Some(100.0);
        trade.greeks_at_entry = Some(calculate_ic_greeks(100.0, 0.25, 45));
        trade.days_in_trade = 20;

        let mark = MarkInputs {
            current_date: ymd(2024, 1, 21),
            current_iv: 0.25,
            current_spot: Some(100.0),
            current_term: None,
            term_at_entry: None,
        };
        let est = model.estimate_pnl(&trade, &mark);
        // No spot move, no IV change: gamma ≈ 0, theta accrues to the short.
        assert!(est.total_pnl > 0.0, "total {}", est.total_pnl);
    }

    #[test]
    fn mark_is_bounded_by_risk_and_credit() {
        let model = GreeksPnlModel::new(&config());
        let mut trade = make_test_trade("SPY", ymd(2024, 1, 1));
        trade.iv_at_entry = 0.25;
        trade.spot_at_entry = Some(100.0);
        trade.estimated_credit = 60.0;
        trade.greeks_at_entry = Some(calculate_ic_greeks(100.0, 0.25, 45));
        trade.days_in_trade = 10;

        // Violent move against the structure.
        let crash = MarkInputs {
            current_date: ymd(2024, 1, 11),
            current_iv: 0.80,
            current_spot: Some(60.0),
            current_term: None,
            term_at_entry: None,
        };
        let est = model.estimate_pnl(&trade, &crash);
        assert!(est.total_pnl >= -trade.max_risk);
        assert!(est.total_pnl <= trade.estimated_credit);
    }

    #[test]
    fn greeks_history_hook_requires_spot() {
        let model = GreeksPnlModel::new(&config());
        let trade = make_test_trade("SPY", ymd(2024, 1, 1));

        let with_spot = MarkInputs {
            current_date: ymd(2024, 1, 2),
            current_iv: 0.25,
            current_spot: Some(100.0),
            current_term: None,
            term_at_entry: None,
        };
        assert!(model.greeks_snapshot(&trade, &with_spot).is_some());

        let without = MarkInputs {
            current_spot: None,
            ..with_spot
        };
        assert!(model.greeks_snapshot(&trade, &without).is_none());
    }
}
