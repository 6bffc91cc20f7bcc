//! Internal resistance growth from impedance tests.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AgingError, TestRecord};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ImpedancePoint {
    pub index: usize,
    pub cycle_id: Option<i64>,
    pub re: f64,
    pub rct: f64,
    pub total_resistance: f64,
    /// `None` when the first total is zero or non-finite.
    pub resistance_increase_pct: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ImpedanceSeries {
    pub points: Vec<ImpedancePoint>,
}

impl ImpedanceSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn total_resistances(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.total_resistance).collect()
    }

    pub fn initial_resistance(&self) -> Option<f64> {
        self.points.first().map(|p| p.total_resistance)
    }

    pub fn final_resistance(&self) -> Option<f64> {
        self.points.last().map(|p| p.total_resistance)
    }

    /// Growth of the last measurement over the first, in percent.
    pub fn final_increase_pct(&self) -> Option<f64> {
        self.points.last().and_then(|p| p.resistance_increase_pct)
    }

    pub fn max_increase_pct(&self) -> Option<f64> {
        self.points
            .iter()
            .filter_map(|p| p.resistance_increase_pct)
            .reduce(f64::max)
    }
}

pub fn compute_impedance_series(impedance: &[TestRecord]) -> Result<ImpedanceSeries, AgingError> {
    let rows: Vec<(&TestRecord, f64, f64)> = impedance
        .iter()
        .filter_map(|r| Some((r, r.re?, r.rct?)))
        .collect();
    let baseline = match rows.first() {
        Some((_, re, rct)) => re + rct,
        None => return Err(AgingError::insufficient("impedance series", 1, 0)),
    };
    let baseline = if baseline == 0.0 || !baseline.is_finite() {
        debug!("resistance growth undefined: first total resistance is {}", baseline);
        None
    } else {
        Some(baseline)
    };

    let points = rows
        .into_iter()
        .enumerate()
        .map(|(index, (record, re, rct))| {
            let total = re + rct;
            ImpedancePoint {
                index,
                cycle_id: record.cycle_id,
                re,
                rct,
                total_resistance: total,
                resistance_increase_pct: baseline.map(|b| (total - b) / b * 100.0),
            }
        })
        .collect();
    Ok(ImpedanceSeries { points })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestType;

    fn rows(pairs: &[(f64, f64)]) -> Vec<TestRecord> {
        pairs
            .iter()
            .enumerate()
            .map(|(i, &(re, rct))| {
                let mut r = TestRecord::new(TestType::Impedance, "B0005");
                r.cycle_id = Some(i as i64);
                r.re = Some(re);
                r.rct = Some(rct);
                r
            })
            .collect()
    }

    #[test]
    fn reference_scenario() {
        let series = compute_impedance_series(&rows(&[(0.1, 0.2), (0.12, 0.25)])).unwrap();
        let totals = series.total_resistances();
        assert!((totals[0] - 0.3).abs() < 1e-12);
        assert!((totals[1] - 0.37).abs() < 1e-12);
        assert_eq!(series.points[0].resistance_increase_pct, Some(0.0));
        assert!((series.points[1].resistance_increase_pct.unwrap() - 23.333_333).abs() < 1e-4);
        assert_eq!(series.max_increase_pct(), series.final_increase_pct());
    }

    #[test]
    fn single_row_has_zero_increase() {
        let series = compute_impedance_series(&rows(&[(0.05, 0.15)])).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series.points[0].resistance_increase_pct, Some(0.0));
    }

    #[test]
    fn zero_baseline_keeps_resistances() {
        let series = compute_impedance_series(&rows(&[(0.0, 0.0), (0.1, 0.2)])).unwrap();
        assert_eq!(series.len(), 2);
        assert!((series.final_resistance().unwrap() - 0.3).abs() < 1e-12);
        assert!(series.points.iter().all(|p| p.resistance_increase_pct.is_none()));
        assert_eq!(series.final_increase_pct(), None);
        assert_eq!(series.max_increase_pct(), None);
    }

    #[test]
    fn empty_is_insufficient() {
        assert!(matches!(
            compute_impedance_series(&[]),
            Err(AgingError::InsufficientData { .. })
        ));
    }

    #[test]
    fn max_increase_tracks_peak_not_last() {
        let series =
            compute_impedance_series(&rows(&[(0.1, 0.1), (0.15, 0.15), (0.12, 0.12)])).unwrap();
        assert!((series.max_increase_pct().unwrap() - 50.0).abs() < 1e-9);
        assert!((series.final_increase_pct().unwrap() - 20.0).abs() < 1e-9);
    }
}
