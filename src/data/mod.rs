pub mod loader;
pub mod series;

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Daily spot bar used for gap analysis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpotOhlc {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl SpotOhlc {
    /// Overnight gap percent from the previous session's close.
    pub fn gap_pct(&self, prev_close: f64) -> f64 {
        if prev_close <= 0.0 {
            return 0.0;
        }
        (self.open - prev_close) / prev_close * 100.0
    }

    pub fn intraday_range_pct(&self) -> f64 {
        if self.open <= 0.0 {
            return 0.0;
        }
        (self.high - self.low) / self.open * 100.0
    }
}

/// Upcoming earnings dates per symbol. Immutable after load; shared read-only
/// across partitions.
#[derive(Debug, Clone, Default)]
pub struct EarningsCalendar {
    dates: BTreeMap<String, Vec<NaiveDate>>,
}

impl EarningsCalendar {
    pub fn new(mut dates: BTreeMap<String, Vec<NaiveDate>>) -> Self {
        for entries in dates.values_mut() {
            entries.sort_unstable();
        }
        Self { dates }
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// First earnings date on or after `reference` for the symbol.
    pub fn next_earnings(&self, symbol: &str, reference: NaiveDate) -> Option<NaiveDate> {
        self.dates
            .get(&symbol.to_uppercase())
            .and_then(|dates| dates.iter().find(|d| **d >= reference).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn gap_pct_down() {
        let bar = SpotOhlc {
            date: ymd(2024, 1, 2),
            open: 95.0,
            high: 97.0,
            low: 94.0,
            close: 96.0,
        };
        assert!((bar.gap_pct(100.0) - (-5.0)).abs() < 1e-10);
    }

    #[test]
    fn gap_pct_zero_prev_close() {
        let bar = SpotOhlc {
            date: ymd(2024, 1, 2),
            open: 95.0,
            high: 97.0,
            low: 94.0,
            close: 96.0,
        };
        assert_eq!(bar.gap_pct(0.0), 0.0);
    }

    #[test]
    fn intraday_range() {
        let bar = SpotOhlc {
            date: ymd(2024, 1, 2),
            open: 100.0,
            high: 103.0,
            low: 98.0,
            close: 101.0,
        };
        assert!((bar.intraday_range_pct() - 5.0).abs() < 1e-10);
    }

    #[test]
    fn next_earnings_finds_first_on_or_after() {
        let mut map = BTreeMap::new();
        map.insert(
            "AAPL".to_string(),
            vec![ymd(2024, 6, 15), ymd(2024, 3, 15), ymd(2024, 9, 15)],
        );
        let cal = EarningsCalendar::new(map);

        assert_eq!(
            cal.next_earnings("AAPL", ymd(2024, 4, 1)),
            Some(ymd(2024, 6, 15))
        );
        assert_eq!(
            cal.next_earnings("aapl", ymd(2024, 6, 15)),
            Some(ymd(2024, 6, 15))
        );
        assert_eq!(cal.next_earnings("AAPL", ymd(2024, 10, 1)), None);
        assert_eq!(cal.next_earnings("MSFT", ymd(2024, 1, 1)), None);
    }
}
