//! Caller-owned analysis session: one loaded dataset, one parameter set,
//! and per-unit results handed back by value.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capacity::{
    capacity_retention, compute_discharge_series, degradation_rate, CapacityRetention,
    DegradationPoint, DischargeSeries,
};
use crate::classify::classify;
use crate::detail::{
    efficiency_trend, iv_curve, load_cycle_details, thermal_profile, EfficiencyTrend, IvCurve,
    SkippedFile, ThermalProfile,
};
use crate::forecast::{
    capacity_vs_resistance, remaining_useful_life, CapacityResistanceCorrelation, RulEstimate,
};
use crate::impedance::{compute_impedance_series, ImpedanceSeries};
use crate::store::{Dataset, Denylist};
use crate::{AgingError, AnalysisParams, TestRecord, TestType};

pub const VERDICT_REPLACE_FADE_PCT: f64 = 30.0;
pub const VERDICT_ADVANCED_FADE_PCT: f64 = 20.0;
pub const VERDICT_MODERATE_FADE_PCT: f64 = 10.0;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    ModerateAging,
    AdvancedDegradation,
    Replace,
}

impl HealthVerdict {
    pub fn from_fade(fade_pct: f64) -> Self {
        if fade_pct > VERDICT_REPLACE_FADE_PCT {
            HealthVerdict::Replace
        } else if fade_pct > VERDICT_ADVANCED_FADE_PCT {
            HealthVerdict::AdvancedDegradation
        } else if fade_pct > VERDICT_MODERATE_FADE_PCT {
            HealthVerdict::ModerateAging
        } else {
            HealthVerdict::Healthy
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutiveSummary {
    pub total_cycles: usize,
    pub initial_capacity: f64,
    pub final_capacity: f64,
    /// Fade of the last discharge relative to the first one.
    pub capacity_fade_pct: f64,
    pub initial_resistance: Option<f64>,
    pub final_resistance: Option<f64>,
    pub resistance_increase_pct: Option<f64>,
    pub total_throughput: f64,
    pub average_throughput: f64,
    pub average_degradation_rate_pct: Option<f64>,
    pub rul: Option<RulEstimate>,
    pub verdict: HealthVerdict,
}

/// Everything derived from the metadata of one unit. `None` means "no data".
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UnitAnalysis {
    pub unit_id: String,
    pub charge_cycles: usize,
    pub discharge: Option<DischargeSeries>,
    pub impedance: Option<ImpedanceSeries>,
    pub degradation: Option<Vec<DegradationPoint>>,
    pub retention: Option<CapacityRetention>,
    pub correlation: Option<CapacityResistanceCorrelation>,
    pub summary: Option<ExecutiveSummary>,
}

/// Results computed from the per-sample detail files of one unit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetailedAnalysis {
    pub unit_id: String,
    pub cycles_loaded: usize,
    pub skipped: Vec<SkippedFile>,
    pub efficiency: Option<EfficiencyTrend>,
    pub thermal: Option<ThermalProfile>,
    pub iv_curves: Vec<IvCurve>,
}

#[derive(Clone, Debug)]
pub struct AnalysisSession {
    dataset: Dataset,
    params: AnalysisParams,
    data_dir: Option<PathBuf>,
}

impl AnalysisSession {
    pub fn new(dataset: Dataset, params: AnalysisParams) -> Self {
        Self {
            dataset,
            params,
            data_dir: None,
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn params(&self) -> &AnalysisParams {
        &self.params
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn denylist(&self) -> Denylist {
        self.params.denylist()
    }

    pub fn available_units(&self) -> Vec<String> {
        self.dataset.available_units(&self.denylist())
    }

    pub fn analyze(&self, unit: &str) -> Result<UnitAnalysis, AgingError> {
        let records = self.dataset.records_for(unit)?;
        let cycles = classify(records);

        let discharge = cycles.discharge.as_deref().and_then(|rows| {
            available(
                "discharge series",
                compute_discharge_series(rows, self.params.peak_window),
            )
        });
        let impedance = cycles
            .impedance
            .as_deref()
            .and_then(|rows| available("impedance series", compute_impedance_series(rows)));

        let degradation = discharge
            .as_ref()
            .and_then(|series| available("degradation rate", degradation_rate(series)));
        let retention = discharge.as_ref().and_then(capacity_retention);
        let correlation = match (&discharge, &impedance) {
            (Some(d), Some(z)) => available("capacity/resistance", capacity_vs_resistance(d, z)),
            _ => None,
        };
        let summary = discharge.as_ref().and_then(|series| {
            build_summary(
                series,
                impedance.as_ref(),
                degradation.as_deref(),
                self.params.eol_fade_pct,
            )
        });

        Ok(UnitAnalysis {
            unit_id: unit.to_string(),
            charge_cycles: cycles.charge.as_ref().map_or(0, Vec::len),
            discharge,
            impedance,
            degradation,
            retention,
            correlation,
            summary,
        })
    }

    /// Load the unit's discharge detail files and compute the sample-level metrics.
    pub fn analyze_details(&self, unit: &str) -> Result<DetailedAnalysis, AgingError> {
        let data_dir = self
            .data_dir
            .as_deref()
            .ok_or_else(|| AgingError::Config("no detail data directory configured".into()))?;
        let mut records: Vec<TestRecord> = self
            .dataset
            .records_for(unit)?
            .iter()
            .filter(|r| r.test_type == TestType::Discharge)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.cycle_id.is_none(), r.cycle_id));

        let load = load_cycle_details(data_dir, &records);
        let band = &self.params.efficiency_band;
        let efficiency = efficiency_trend(&load.cycles, band);
        let thermal = thermal_profile(&load.all_samples());

        let mut by_uid: Vec<_> = load.cycles.iter().collect();
        by_uid.sort_by_key(|c| (c.sample_uid.parse::<i64>().map_err(|_| ()), c.sample_uid.clone()));
        let iv_curves = by_uid
            .into_iter()
            .take(self.params.iv_curve_cycles)
            .filter_map(|c| iv_curve(c, self.params.iv_min_points))
            .collect();

        Ok(DetailedAnalysis {
            unit_id: unit.to_string(),
            cycles_loaded: load.cycles.len(),
            skipped: load.skipped,
            efficiency,
            thermal,
            iv_curves,
        })
    }
}

fn available<T>(metric: &str, result: Result<T, AgingError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            debug!("{} unavailable: {}", metric, err);
            None
        }
    }
}

fn build_summary(
    discharge: &DischargeSeries,
    impedance: Option<&ImpedanceSeries>,
    degradation: Option<&[DegradationPoint]>,
    eol_fade_pct: f64,
) -> Option<ExecutiveSummary> {
    let initial_capacity = discharge.points.first()?.capacity;
    let final_capacity = discharge.points.last()?.capacity;
    if initial_capacity <= 0.0 {
        debug!("executive summary unavailable: first discharge capacity is not positive");
        return None;
    }
    let total_cycles = discharge.len();
    let capacity_fade_pct = (initial_capacity - final_capacity) / initial_capacity * 100.0;
    let average_degradation_rate_pct = degradation
        .filter(|rates| !rates.is_empty())
        .map(|rates| rates.iter().map(|r| r.rate_pct).sum::<f64>() / rates.len() as f64);

    Some(ExecutiveSummary {
        total_cycles,
        initial_capacity,
        final_capacity,
        capacity_fade_pct,
        initial_resistance: impedance.and_then(ImpedanceSeries::initial_resistance),
        final_resistance: impedance.and_then(ImpedanceSeries::final_resistance),
        resistance_increase_pct: impedance.and_then(ImpedanceSeries::final_increase_pct),
        total_throughput: discharge.total_throughput(),
        average_throughput: discharge.total_throughput() / total_cycles as f64,
        average_degradation_rate_pct,
        rul: remaining_useful_life(total_cycles, capacity_fade_pct, eol_fade_pct),
        verdict: HealthVerdict::from_fade(capacity_fade_pct),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn discharge(unit: &str, cycle: i64, capacity: Option<f64>) -> TestRecord {
        let mut r = TestRecord::new(TestType::Discharge, unit);
        r.cycle_id = Some(cycle);
        r.sample_uid = cycle.to_string();
        r.detail_filename = format!("{:05}.csv", cycle);
        r.capacity = capacity;
        r
    }

    fn impedance(unit: &str, cycle: i64, re: f64, rct: f64) -> TestRecord {
        let mut r = TestRecord::new(TestType::Impedance, unit);
        r.cycle_id = Some(cycle);
        r.re = Some(re);
        r.rct = Some(rct);
        r
    }

    fn dataset() -> Dataset {
        Dataset::from_records(vec![
            discharge("B0005", 6, Some(1.8)),
            discharge("B0005", 0, Some(2.0)),
            discharge("B0005", 2, Some(1.9)),
            discharge("B0005", 4, None),
            discharge("B0005", 8, Some(1.0)),
            impedance("B0005", 1, 0.1, 0.2),
            impedance("B0005", 5, 0.12, 0.25),
            TestRecord::new(TestType::Charge, "B0005"),
            discharge("B0038", 0, Some(1.8)),
            impedance("B0006", 1, 0.1, 0.2),
        ])
    }

    #[test]
    fn analyze_reference_unit() {
        let session = AnalysisSession::new(dataset(), AnalysisParams::default());
        let analysis = session.analyze("B0005").unwrap();
        assert_eq!(analysis.charge_cycles, 1);

        let series = analysis.discharge.as_ref().unwrap();
        let cycle_ids: Vec<_> = series.points.iter().map(|p| p.cycle_id).collect();
        assert_eq!(cycle_ids, vec![Some(0), Some(2), Some(6), Some(8)]);
        let efc: Vec<_> = series.points.iter().map(|p| p.efc).collect();
        assert_eq!(efc, vec![0, 1, 2, 3]);
        assert!((series.points[3].soc - 50.0).abs() < 1e-9);

        let impedance = analysis.impedance.as_ref().unwrap();
        assert!((impedance.points[1].resistance_increase_pct.unwrap() - 23.3333).abs() < 1e-3);
        assert_eq!(analysis.degradation.as_ref().unwrap().len(), 3);
        assert!(analysis.correlation.is_some());

        let summary = analysis.summary.unwrap();
        assert_eq!(summary.total_cycles, 4);
        assert!((summary.capacity_fade_pct - 50.0).abs() < 1e-9);
        assert_eq!(summary.verdict, HealthVerdict::Replace);
        let rul = summary.rul.unwrap();
        assert!((rul.cycles_to_eol + 1.6).abs() < 1e-9);
        assert!((summary.total_throughput - 6.7).abs() < 1e-9);
    }

    #[test]
    fn missing_series_are_absent_not_errors() {
        let session = AnalysisSession::new(dataset(), AnalysisParams::default());
        let only_impedance = session.analyze("B0006").unwrap();
        assert!(only_impedance.discharge.is_none());
        assert!(only_impedance.degradation.is_none());
        assert!(only_impedance.summary.is_none());
        assert!(only_impedance.impedance.is_some());
        assert!(only_impedance.correlation.is_none());

        let single = session.analyze("B0038").unwrap();
        assert!(single.degradation.is_none());
        let summary = single.summary.unwrap();
        assert!(summary.rul.is_none());
        assert_eq!(summary.verdict, HealthVerdict::Healthy);
    }

    #[test]
    fn zero_first_impedance_keeps_series_and_correlation() {
        let dataset = Dataset::from_records(vec![
            discharge("U", 0, Some(2.0)),
            discharge("U", 2, Some(1.8)),
            impedance("U", 1, 0.0, 0.0),
            impedance("U", 3, 0.1, 0.2),
        ]);
        let session = AnalysisSession::new(dataset, AnalysisParams::default());
        let analysis = session.analyze("U").unwrap();
        let series = analysis.impedance.as_ref().unwrap();
        assert_eq!(series.total_resistances(), vec![0.0, 0.1 + 0.2]);
        assert_eq!(series.final_increase_pct(), None);
        assert!(analysis.correlation.is_some());
        let summary = analysis.summary.unwrap();
        assert_eq!(summary.initial_resistance, Some(0.0));
        assert_eq!(summary.resistance_increase_pct, None);
    }

    #[test]
    fn unknown_unit_is_reported() {
        let session = AnalysisSession::new(dataset(), AnalysisParams::default());
        assert!(matches!(
            session.analyze("B9999"),
            Err(AgingError::UnknownUnit(_))
        ));
    }

    #[test]
    fn denylist_comes_from_params() {
        let mut params = AnalysisParams::default();
        params.denylist.insert("B0038".to_string());
        let session = AnalysisSession::new(dataset(), params);
        assert_eq!(
            session.available_units(),
            vec!["B0005".to_string(), "B0006".to_string()]
        );
    }

    #[test]
    fn repeated_analysis_is_identical() {
        let session = AnalysisSession::new(dataset(), AnalysisParams::default());
        assert_eq!(session.analyze("B0005").unwrap(), session.analyze("B0005").unwrap());
    }

    #[test]
    fn verdict_tiers() {
        assert_eq!(HealthVerdict::from_fade(5.0), HealthVerdict::Healthy);
        assert_eq!(HealthVerdict::from_fade(10.0), HealthVerdict::Healthy);
        assert_eq!(HealthVerdict::from_fade(15.0), HealthVerdict::ModerateAging);
        assert_eq!(HealthVerdict::from_fade(25.0), HealthVerdict::AdvancedDegradation);
        assert_eq!(HealthVerdict::from_fade(30.5), HealthVerdict::Replace);
    }

    #[test]
    fn details_require_a_data_dir() {
        let session = AnalysisSession::new(dataset(), AnalysisParams::default());
        assert!(matches!(
            session.analyze_details("B0005"),
            Err(AgingError::Config(_))
        ));
    }

    #[test]
    fn details_tolerate_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let header = "Voltage_measured,Current_measured,Temperature_measured,Current_load,Voltage_load,Time\n";
        let mut body = String::from(header);
        for i in 0..12 {
            body.push_str(&format!("{},-2.0,{},1.9,3.0,{}\n", 4.0 - 0.05 * i as f64, 24.0 + i as f64, i * 10));
        }
        fs::write(dir.path().join("00000.csv"), &body).unwrap();
        fs::write(dir.path().join("00002.csv"), &body).unwrap();

        let session =
            AnalysisSession::new(dataset(), AnalysisParams::default()).with_data_dir(dir.path());
        let details = session.analyze_details("B0005").unwrap();
        assert_eq!(details.cycles_loaded, 2);
        assert_eq!(details.skipped.len(), 3);
        assert_eq!(details.iv_curves.len(), 2);

        let efficiency = details.efficiency.unwrap();
        assert_eq!(efficiency.points.len(), 2);
        assert!(efficiency.points.iter().all(|p| p.efficiency_pct > 0.0 && p.efficiency_pct <= 200.0));

        let thermal = details.thermal.unwrap();
        assert_eq!(thermal.range_c, 11.0);
        assert_eq!(thermal.stability, crate::ThermalStability::Moderate);
    }
}
