use std::collections::btree_map::Values;
use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One day of IV metrics for a symbol. Values are normalised at the loader
/// boundary: `atm_iv` and `hv30` are stored as decimals (0.20 = 20%),
/// `iv_rank` and `iv_percentile` on the 0-100 scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvDataPoint {
    pub date: NaiveDate,
    pub symbol: String,
    pub atm_iv: Option<f64>,
    pub iv_rank: Option<f64>,
    pub iv_percentile: Option<f64>,
    pub hv30: Option<f64>,
    pub skew: Option<f64>,
    pub term_m1_m2: Option<f64>,
    pub term_m1_m3: Option<f64>,
    pub spot_price: Option<f64>,
}

impl IvDataPoint {
    /// Minimum fields required for the point to drive signals and marks.
    pub fn is_valid(&self) -> bool {
        self.atm_iv.is_some() && self.iv_percentile.is_some()
    }
}

/// Ordered IV history for a single symbol. Dates are unique; inserting a
/// point for an existing date replaces it. Read-only once the loader is done.
#[derive(Debug, Clone, Default)]
pub struct IvTimeSeries {
    symbol: String,
    points: BTreeMap<NaiveDate, IvDataPoint>,
}

impl IvTimeSeries {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            points: BTreeMap::new(),
        }
    }

    pub fn from_points(
        symbol: impl Into<String>,
        points: impl IntoIterator<Item = IvDataPoint>,
    ) -> Self {
        let mut series = Self::new(symbol);
        for point in points {
            series.add(point);
        }
        series
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn add(&mut self, point: IvDataPoint) {
        self.points.insert(point.date, point);
    }

    pub fn get(&self, date: NaiveDate) -> Option<&IvDataPoint> {
        self.points.get(&date)
    }

    /// Points within `[start, end]`, in date order.
    pub fn get_range(&self, start: NaiveDate, end: NaiveDate) -> Vec<&IvDataPoint> {
        self.points.range(start..=end).map(|(_, p)| p).collect()
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.points.keys().copied().collect()
    }

    pub fn iter(&self) -> Values<'_, NaiveDate, IvDataPoint> {
        self.points.values()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn start_date(&self) -> Option<NaiveDate> {
        self.points.keys().next().copied()
    }

    pub fn end_date(&self) -> Option<NaiveDate> {
        self.points.keys().next_back().copied()
    }
}

impl<'a> IntoIterator for &'a IvTimeSeries {
    type Item = &'a IvDataPoint;
    type IntoIter = Values<'a, NaiveDate, IvDataPoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn point(date: NaiveDate, iv: f64) -> IvDataPoint {
        IvDataPoint {
            date,
            symbol: "SPY".to_string(),
            atm_iv: Some(iv),
            iv_rank: None,
            iv_percentile: Some(50.0),
            hv30: None,
            skew: None,
            term_m1_m2: None,
            term_m1_m3: None,
            spot_price: None,
        }
    }

    #[test]
    fn dates_are_ordered_regardless_of_insertion() {
        let mut series = IvTimeSeries::new("SPY");
        series.add(point(ymd(2024, 3, 1), 0.22));
        series.add(point(ymd(2024, 1, 1), 0.20));
        series.add(point(ymd(2024, 2, 1), 0.21));

        assert_eq!(
            series.dates(),
            vec![ymd(2024, 1, 1), ymd(2024, 2, 1), ymd(2024, 3, 1)]
        );
        assert_eq!(series.start_date(), Some(ymd(2024, 1, 1)));
        assert_eq!(series.end_date(), Some(ymd(2024, 3, 1)));
    }

    #[test]
    fn same_date_insert_replaces() {
        let mut series = IvTimeSeries::new("SPY");
        series.add(point(ymd(2024, 1, 1), 0.20));
        series.add(point(ymd(2024, 1, 1), 0.30));

        assert_eq!(series.len(), 1);
        assert_eq!(series.get(ymd(2024, 1, 1)).unwrap().atm_iv, Some(0.30));
    }

    #[test]
    fn range_query_is_inclusive() {
        let series = IvTimeSeries::from_points(
            "SPY",
            (1..=5).map(|d| point(ymd(2024, 1, d), 0.20)),
        );

        let range = series.get_range(ymd(2024, 1, 2), ymd(2024, 1, 4));
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].date, ymd(2024, 1, 2));
        assert_eq!(range[2].date, ymd(2024, 1, 4));
    }

    #[test]
    fn iteration_in_date_order() {
        let series = IvTimeSeries::from_points(
            "SPY",
            [
                point(ymd(2024, 1, 3), 0.23),
                point(ymd(2024, 1, 1), 0.21),
                point(ymd(2024, 1, 2), 0.22),
            ],
        );

        let ivs: Vec<f64> = series.iter().filter_map(|p| p.atm_iv).collect();
        assert_eq!(ivs, vec![0.21, 0.22, 0.23]);
    }

    #[test]
    fn validity_requires_iv_and_percentile() {
        let mut p = point(ymd(2024, 1, 1), 0.20);
        assert!(p.is_valid());
        p.iv_percentile = None;
        assert!(!p.is_valid());
    }
}
