use std::collections::BTreeSet;

use chrono::NaiveDate;

use super::types::EntrySignal;
use crate::config::BacktestConfig;
use crate::data::loader::IvData;
use crate::data::series::IvDataPoint;
use crate::data::EarningsCalendar;

/// Default IV-percentile ceiling for the low-IV (calendar) variant when the
/// config does not set one.
const CALENDAR_IV_PERCENTILE_MAX: f64 = 40.0;

/// Generates entry signals from daily IV metrics.
///
/// Credit strategies use the high-IV variant (sell premium when IV is
/// elevated); calendars use the symmetric low-IV variant (buy vega when IV is
/// depressed and the term structure shows front-month mispricing). Optional
/// filters are only enforced when the underlying data field is present.
pub struct SignalGenerator {
    config: BacktestConfig,
    earnings: EarningsCalendar,
    earnings_blocks: u64,
}

impl SignalGenerator {
    pub fn new(config: BacktestConfig, earnings: EarningsCalendar) -> Self {
        Self {
            config,
            earnings,
            earnings_blocks: 0,
        }
    }

    /// Scan all symbols for entry signals on a date. Symbols with an open
    /// position are skipped; the simulator enforces uniqueness and the global
    /// count limit on insertion, so output order carries no meaning.
    pub fn scan_for_signals(
        &mut self,
        iv_data: &IvData,
        trading_date: NaiveDate,
        open_symbols: &BTreeSet<String>,
    ) -> Vec<EntrySignal> {
        let mut signals = Vec::new();

        for (symbol, series) in iv_data {
            if open_symbols.contains(symbol) {
                continue;
            }
            if self.earnings_too_close(symbol, trading_date) {
                self.earnings_blocks += 1;
                continue;
            }
            let Some(point) = series.get(trading_date) else {
                continue;
            };
            if !point.is_valid() {
                continue;
            }
            if let Some(signal) = self.evaluate_entry(point) {
                signals.push(signal);
            }
        }

        signals
    }

    /// Signals blocked by earnings proximity since construction.
    pub fn earnings_blocks(&self) -> u64 {
        self.earnings_blocks
    }

    /// Evaluate a single point against the entry rules, ignoring position
    /// state and the earnings gate. Used by the validation exporter to
    /// reconstruct per-day entry decisions.
    pub fn evaluate_point(&self, point: &IvDataPoint) -> Option<EntrySignal> {
        if !point.is_valid() {
            return None;
        }
        self.evaluate_entry(point)
    }

    fn earnings_too_close(&self, symbol: &str, trading_date: NaiveDate) -> bool {
        let Some(min_days) = self.config.entry_rules.min_days_until_earnings else {
            return false;
        };
        if min_days <= 0 {
            return false;
        }
        let Some(next) = self.earnings.next_earnings(symbol, trading_date) else {
            return false;
        };
        (next - trading_date).num_days() < min_days
    }

    fn evaluate_entry(&self, dp: &IvDataPoint) -> Option<EntrySignal> {
        let accepted = if self.config.strategy.is_calendar() {
            self.check_low_iv(dp)
        } else {
            self.check_high_iv(dp)
        };
        if !accepted {
            return None;
        }

        Some(EntrySignal {
            date: dp.date,
            symbol: dp.symbol.clone(),
            iv_at_entry: dp.atm_iv?,
            iv_rank_at_entry: dp.iv_rank,
            iv_percentile_at_entry: dp.iv_percentile?,
            hv_at_entry: dp.hv30,
            skew_at_entry: dp.skew,
            term_at_entry: dp.term_m1_m2,
            spot_at_entry: dp.spot_price,
            signal_strength: self.signal_strength(dp),
        })
    }

    /// High-IV entry: elevated percentile, optional rank floor, optional
    /// range filters on skew / term structure / IV-HV spread.
    fn check_high_iv(&self, dp: &IvDataPoint) -> bool {
        let rules = &self.config.entry_rules;

        let Some(percentile) = dp.iv_percentile else {
            return false;
        };
        if percentile < rules.iv_percentile_min {
            return false;
        }

        if let Some(rank_min) = rules.iv_rank_min {
            match dp.iv_rank {
                Some(rank) if rank >= rank_min => {}
                _ => return false,
            }
        }

        if let (Some(skew_min), Some(skew)) = (rules.skew_min, dp.skew) {
            if skew < skew_min {
                return false;
            }
        }
        if let (Some(skew_max), Some(skew)) = (rules.skew_max, dp.skew) {
            if skew > skew_max {
                return false;
            }
        }

        if let (Some(term_min), Some(term)) = (rules.term_structure_min, dp.term_m1_m2) {
            if term < term_min {
                return false;
            }
        }
        if let (Some(term_max), Some(term)) = (rules.term_structure_max, dp.term_m1_m2) {
            if term > term_max {
                return false;
            }
        }

        if let Some(spread_min) = rules.iv_hv_spread_min {
            if let (Some(iv), Some(hv)) = (dp.atm_iv, dp.hv30) {
                if iv - hv < spread_min {
                    return false;
                }
            }
        }

        true
    }

    /// Low-IV entry for calendars: depressed percentile/rank, and optionally
    /// front-month IV at or above the back month (mispricing to fade).
    fn check_low_iv(&self, dp: &IvDataPoint) -> bool {
        let rules = &self.config.entry_rules;

        let Some(percentile) = dp.iv_percentile else {
            return false;
        };
        let percentile_max = rules
            .iv_percentile_max
            .unwrap_or(CALENDAR_IV_PERCENTILE_MAX);
        if percentile > percentile_max {
            return false;
        }

        if let Some(rank_max) = rules.iv_rank_max {
            match dp.iv_rank {
                Some(rank) if rank <= rank_max => {}
                _ => return false,
            }
        }

        if let (Some(term_min), Some(term)) = (rules.term_structure_min, dp.term_m1_m2) {
            if term < term_min {
                return false;
            }
        }

        true
    }

    /// Composite 0-100 strength: IV percentile (weight 50), IV-HV spread
    /// (25), IV rank (25), normalised by the weights actually present. The
    /// percentile leg is inverted for the low-IV variant.
    fn signal_strength(&self, dp: &IvDataPoint) -> f64 {
        let mut score = 0.0;
        let mut weights_used = 0.0;

        if let Some(percentile) = dp.iv_percentile {
            let effective = if self.config.strategy.is_calendar() {
                100.0 - percentile
            } else {
                percentile
            };
            score += ((effective - 60.0) / 40.0).max(0.0).min(1.0) * 50.0;
            weights_used += 50.0;
        }

        if let (Some(iv), Some(hv)) = (dp.atm_iv, dp.hv30) {
            let spread = iv - hv;
            score += (spread / 0.10).max(0.0).min(1.0) * 25.0;
            weights_used += 25.0;
        }

        if let Some(rank) = dp.iv_rank {
            let normalized = if rank > 1.0 { rank / 100.0 } else { rank };
            score += normalized * 25.0;
            weights_used += 25.0;
        }

        if weights_used > 0.0 {
            score = score / weights_used * 100.0;
        }
        (score * 100.0).round() / 100.0
    }
}

/// Post-processing helpers over a day's signal set.
pub struct SignalFilter;

impl SignalFilter {
    pub fn by_strength(signals: Vec<EntrySignal>, min_strength: f64) -> Vec<EntrySignal> {
        signals
            .into_iter()
            .filter(|s| s.signal_strength >= min_strength)
            .collect()
    }

    pub fn by_symbols(signals: Vec<EntrySignal>, symbols: &[&str]) -> Vec<EntrySignal> {
        signals
            .into_iter()
            .filter(|s| symbols.contains(&s.symbol.as_str()))
            .collect()
    }

    /// Strongest first.
    pub fn rank(mut signals: Vec<EntrySignal>) -> Vec<EntrySignal> {
        signals.sort_by(|a, b| {
            b.signal_strength
                .partial_cmp(&a.signal_strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        signals
    }

    pub fn limit(signals: Vec<EntrySignal>, max_signals: usize) -> Vec<EntrySignal> {
        let mut ranked = Self::rank(signals);
        ranked.truncate(max_signals);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::series::IvTimeSeries;
    use std::collections::BTreeMap;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn condor_config() -> BacktestConfig {
        serde_yaml::from_str(
            "strategy_type: iron_condor\nstart_date: 2024-01-01\nend_date: 2024-12-31\n",
        )
        .unwrap()
    }

    fn calendar_config() -> BacktestConfig {
        serde_yaml::from_str(
            "strategy_type: calendar\nstart_date: 2024-01-01\nend_date: 2024-12-31\n",
        )
        .unwrap()
    }

    fn point(symbol: &str, date: NaiveDate, iv: f64, percentile: f64) -> IvDataPoint {
        IvDataPoint {
            date,
            symbol: symbol.to_string(),
            atm_iv: Some(iv),
            iv_rank: None,
            iv_percentile: Some(percentile),
            hv30: None,
            skew: None,
            term_m1_m2: None,
            term_m1_m3: None,
            spot_price: Some(100.0),
        }
    }

    fn data_with(points: Vec<IvDataPoint>) -> IvData {
        let mut data = IvData::new();
        for p in points {
            data.entry(p.symbol.clone())
                .or_insert_with(|| IvTimeSeries::new(p.symbol.clone()))
                .add(p);
        }
        data
    }

    #[test]
    fn high_iv_accepts_above_percentile_min() {
        let mut generator = SignalGenerator::new(condor_config(), EarningsCalendar::default());
        let data = data_with(vec![point("SPY", ymd(2024, 6, 3), 0.30, 75.0)]);

        let signals = generator.scan_for_signals(&data, ymd(2024, 6, 3), &BTreeSet::new());
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].symbol, "SPY");
        assert_eq!(signals[0].iv_at_entry, 0.30);
    }

    #[test]
    fn high_iv_rejects_below_percentile_min() {
        let mut generator = SignalGenerator::new(condor_config(), EarningsCalendar::default());
        let data = data_with(vec![point("SPY", ymd(2024, 6, 3), 0.30, 45.0)]);

        let signals = generator.scan_for_signals(&data, ymd(2024, 6, 3), &BTreeSet::new());
        assert!(signals.is_empty());
    }

    #[test]
    fn open_position_suppresses_signal() {
        let mut generator = SignalGenerator::new(condor_config(), EarningsCalendar::default());
        let data = data_with(vec![point("SPY", ymd(2024, 6, 3), 0.30, 75.0)]);
        let open: BTreeSet<String> = ["SPY".to_string()].into();

        let signals = generator.scan_for_signals(&data, ymd(2024, 6, 3), &open);
        assert!(signals.is_empty());
    }

    #[test]
    fn rank_floor_requires_rank_present() {
        let mut config = condor_config();
        config.entry_rules.iv_rank_min = Some(50.0);
        let mut generator = SignalGenerator::new(config, EarningsCalendar::default());

        // Rank missing → reject while the floor is configured.
        let data = data_with(vec![point("SPY", ymd(2024, 6, 3), 0.30, 75.0)]);
        assert!(generator
            .scan_for_signals(&data, ymd(2024, 6, 3), &BTreeSet::new())
            .is_empty());

        let mut p = point("SPY", ymd(2024, 6, 3), 0.30, 75.0);
        p.iv_rank = Some(60.0);
        let data = data_with(vec![p]);
        assert_eq!(
            generator
                .scan_for_signals(&data, ymd(2024, 6, 3), &BTreeSet::new())
                .len(),
            1
        );
    }

    #[test]
    fn optional_filters_skip_missing_fields() {
        let mut config = condor_config();
        config.entry_rules.skew_max = Some(2.0);
        config.entry_rules.term_structure_max = Some(1.0);
        let mut generator = SignalGenerator::new(config, EarningsCalendar::default());

        // Neither skew nor term present: filters must not reject.
        let data = data_with(vec![point("SPY", ymd(2024, 6, 3), 0.30, 75.0)]);
        assert_eq!(
            generator
                .scan_for_signals(&data, ymd(2024, 6, 3), &BTreeSet::new())
                .len(),
            1
        );

        // Skew present and out of range: reject.
        let mut p = point("SPY", ymd(2024, 6, 3), 0.30, 75.0);
        p.skew = Some(3.5);
        let data = data_with(vec![p]);
        assert!(generator
            .scan_for_signals(&data, ymd(2024, 6, 3), &BTreeSet::new())
            .is_empty());
    }

    #[test]
    fn iv_hv_spread_filter() {
        let mut config = condor_config();
        config.entry_rules.iv_hv_spread_min = Some(0.05);
        let mut generator = SignalGenerator::new(config, EarningsCalendar::default());

        let mut p = point("SPY", ymd(2024, 6, 3), 0.30, 75.0);
        p.hv30 = Some(0.28);
        let data = data_with(vec![p]);
        assert!(generator
            .scan_for_signals(&data, ymd(2024, 6, 3), &BTreeSet::new())
            .is_empty());

        let mut p = point("SPY", ymd(2024, 6, 3), 0.30, 75.0);
        p.hv30 = Some(0.20);
        let data = data_with(vec![p]);
        assert_eq!(
            generator
                .scan_for_signals(&data, ymd(2024, 6, 3), &BTreeSet::new())
                .len(),
            1
        );
    }

    #[test]
    fn low_iv_variant_is_symmetric() {
        let mut generator = SignalGenerator::new(calendar_config(), EarningsCalendar::default());

        // Percentile 30 ≤ default ceiling of 40 → accept.
        let data = data_with(vec![point("SPY", ymd(2024, 6, 3), 0.15, 30.0)]);
        assert_eq!(
            generator
                .scan_for_signals(&data, ymd(2024, 6, 3), &BTreeSet::new())
                .len(),
            1
        );

        // Percentile 75 → reject for a calendar.
        let data = data_with(vec![point("SPY", ymd(2024, 6, 3), 0.15, 75.0)]);
        assert!(generator
            .scan_for_signals(&data, ymd(2024, 6, 3), &BTreeSet::new())
            .is_empty());
    }

    #[test]
    fn calendar_term_structure_floor() {
        let mut config = calendar_config();
        config.entry_rules.term_structure_min = Some(0.5);
        let mut generator = SignalGenerator::new(config, EarningsCalendar::default());

        let mut p = point("SPY", ymd(2024, 6, 3), 0.15, 30.0);
        p.term_m1_m2 = Some(-1.0);
        let data = data_with(vec![p]);
        assert!(generator
            .scan_for_signals(&data, ymd(2024, 6, 3), &BTreeSet::new())
            .is_empty());

        let mut p = point("SPY", ymd(2024, 6, 3), 0.15, 30.0);
        p.term_m1_m2 = Some(1.5);
        let data = data_with(vec![p]);
        assert_eq!(
            generator
                .scan_for_signals(&data, ymd(2024, 6, 3), &BTreeSet::new())
                .len(),
            1
        );
    }

    #[test]
    fn earnings_block_counts() {
        let mut config = condor_config();
        config.entry_rules.min_days_until_earnings = Some(30);

        let mut dates = BTreeMap::new();
        dates.insert("AAPL".to_string(), vec![ymd(2024, 6, 15)]);
        let mut generator = SignalGenerator::new(config, EarningsCalendar::new(dates));

        let data = data_with(vec![point("AAPL", ymd(2024, 6, 1), 0.35, 80.0)]);
        let signals = generator.scan_for_signals(&data, ymd(2024, 6, 1), &BTreeSet::new());

        assert!(signals.is_empty());
        assert_eq!(generator.earnings_blocks(), 1);
    }

    #[test]
    fn earnings_far_enough_passes() {
        let mut config = condor_config();
        config.entry_rules.min_days_until_earnings = Some(10);

        let mut dates = BTreeMap::new();
        dates.insert("AAPL".to_string(), vec![ymd(2024, 6, 15)]);
        let mut generator = SignalGenerator::new(config, EarningsCalendar::new(dates));

        let data = data_with(vec![point("AAPL", ymd(2024, 6, 1), 0.35, 80.0)]);
        let signals = generator.scan_for_signals(&data, ymd(2024, 6, 1), &BTreeSet::new());

        assert_eq!(signals.len(), 1);
        assert_eq!(generator.earnings_blocks(), 0);
    }

    #[test]
    fn strength_full_marks() {
        let generator = SignalGenerator::new(condor_config(), EarningsCalendar::default());
        let mut p = point("SPY", ymd(2024, 6, 3), 0.40, 100.0);
        p.hv30 = Some(0.25); // spread 0.15 ≥ 0.10 → full spread score
        p.iv_rank = Some(100.0);

        assert!((generator.signal_strength(&p) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn strength_normalises_missing_components() {
        let generator = SignalGenerator::new(condor_config(), EarningsCalendar::default());
        // Only the percentile component present: 80 → (80-60)/40 = 0.5 → 25
        // of 50 available points → normalised to 50.
        let p = point("SPY", ymd(2024, 6, 3), 0.40, 80.0);
        assert!((generator.signal_strength(&p) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn strength_inverts_percentile_for_calendars() {
        let generator = SignalGenerator::new(calendar_config(), EarningsCalendar::default());
        // Percentile 0 → inverted 100 → full percentile score.
        let p = point("SPY", ymd(2024, 6, 3), 0.15, 0.0);
        assert!((generator.signal_strength(&p) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn filter_helpers() {
        let mk = |symbol: &str, strength: f64| EntrySignal {
            date: ymd(2024, 6, 3),
            symbol: symbol.to_string(),
            iv_at_entry: 0.3,
            iv_rank_at_entry: None,
            iv_percentile_at_entry: 80.0,
            hv_at_entry: None,
            skew_at_entry: None,
            term_at_entry: None,
            spot_at_entry: None,
            signal_strength: strength,
        };
        let signals = vec![mk("A", 20.0), mk("B", 80.0), mk("C", 50.0)];

        let strong = SignalFilter::by_strength(signals.clone(), 50.0);
        assert_eq!(strong.len(), 2);

        let ranked = SignalFilter::rank(signals.clone());
        assert_eq!(ranked[0].symbol, "B");
        assert_eq!(ranked[2].symbol, "A");

        let top = SignalFilter::limit(signals.clone(), 1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].symbol, "B");

        let only = SignalFilter::by_symbols(signals, &["C"]);
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].symbol, "C");
    }
}
