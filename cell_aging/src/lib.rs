//! Battery aging analytics computed from per-cycle test records.
//!
//! The crate turns the metadata table of a cycling campaign (one row per
//! charge, discharge or impedance test) plus the optional per-sample detail
//! files into derived health series: capacity fade, SOC/DOD trajectories,
//! throughput, resistance growth, energy efficiency and a remaining useful
//! life estimate. Everything here is a pure function of its inputs; the
//! [`session::AnalysisSession`] ties the pieces together for one unit.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod capacity;
pub mod classify;
pub mod detail;
pub mod forecast;
pub mod impedance;
pub mod session;
pub mod store;

pub use capacity::{
    capacity_retention, compute_discharge_series, degradation_rate, peak_capacity,
    CapacityRetention, DegradationPoint, DischargePoint, DischargeSeries, RetentionStatus,
};
pub use classify::{classify, ClassifiedCycles};
pub use detail::{
    efficiency_trend, energy_efficiency, iv_curve, load_cycle_details, load_detail_file,
    thermal_profile, CycleDetail, DetailLoad, EfficiencyPoint, EfficiencyResult, EfficiencyTrend,
    IvCurve, SkippedFile, ThermalProfile, ThermalStability,
};
pub use forecast::{
    capacity_vs_resistance, remaining_useful_life, CapacityResistanceCorrelation, LinearFit,
    RulEstimate,
};
pub use impedance::{compute_impedance_series, ImpedancePoint, ImpedanceSeries};
pub use session::{AnalysisSession, DetailedAnalysis, ExecutiveSummary, HealthVerdict, UnitAnalysis};
pub use store::{load_metadata, load_metadata_path, Dataset, Denylist, LoadReport, SchemaMismatch};

/// Number of rows inspected when picking the "as-new" reference capacity.
pub const DEFAULT_PEAK_WINDOW: usize = 30;
/// Capacity fade (percent) treated as end of life by the RUL forecast.
pub const DEFAULT_EOL_FADE_PCT: f64 = 30.0;
pub const DEFAULT_EFFICIENCY_MIN_PCT: f64 = 0.0;
pub const DEFAULT_EFFICIENCY_MAX_PCT: f64 = 200.0;

#[derive(Error, Debug)]
pub enum AgingError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid analysis parameters: {0}")]
    Config(String),
    #[error("unknown unit: {0}")]
    UnknownUnit(String),
    #[error("insufficient data for {metric}: need {required}, found {found}")]
    InsufficientData {
        metric: &'static str,
        required: usize,
        found: usize,
    },
    #[error("correlation undefined: {0} has zero variance")]
    UndefinedCorrelation(&'static str),
}

impl AgingError {
    pub(crate) fn insufficient(metric: &'static str, required: usize, found: usize) -> Self {
        AgingError::InsufficientData {
            metric,
            required,
            found,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Discharge,
    Charge,
    Impedance,
}

impl TestType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "discharge" => Some(TestType::Discharge),
            "charge" => Some(TestType::Charge),
            "impedance" => Some(TestType::Impedance),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Discharge => "discharge",
            TestType::Charge => "charge",
            TestType::Impedance => "impedance",
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the metadata table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TestRecord {
    pub test_type: TestType,
    pub start_time: Option<NaiveDateTime>,
    pub ambient_temperature: Option<f64>,
    pub unit_id: String,
    pub cycle_id: Option<i64>,
    pub sample_uid: String,
    pub detail_filename: String,
    pub capacity: Option<f64>,
    pub re: Option<f64>,
    pub rct: Option<f64>,
}

impl TestRecord {
    pub fn new(test_type: TestType, unit_id: impl Into<String>) -> Self {
        Self {
            test_type,
            start_time: None,
            ambient_temperature: None,
            unit_id: unit_id.into(),
            cycle_id: None,
            sample_uid: String::new(),
            detail_filename: String::new(),
            capacity: None,
            re: None,
            rct: None,
        }
    }
}

/// One row of a per-cycle detail file. Only the timestamp is guaranteed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetailSample {
    pub sample_uid: String,
    pub t: f64,
    pub voltage_measured: Option<f64>,
    pub current_measured: Option<f64>,
    pub voltage_load: Option<f64>,
    pub current_load: Option<f64>,
    pub temperature: Option<f64>,
}

/// Accepted range for an integrated efficiency ratio, in percent.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct EfficiencyBand {
    pub min_pct: f64,
    pub max_pct: f64,
}

impl Default for EfficiencyBand {
    fn default() -> Self {
        Self {
            min_pct: DEFAULT_EFFICIENCY_MIN_PCT,
            max_pct: DEFAULT_EFFICIENCY_MAX_PCT,
        }
    }
}

impl EfficiencyBand {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min_pct && value <= self.max_pct
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisParams {
    pub peak_window: usize,
    pub efficiency_band: EfficiencyBand,
    pub eol_fade_pct: f64,
    pub iv_curve_cycles: usize,
    pub iv_min_points: usize,
    pub denylist: BTreeSet<String>,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            peak_window: DEFAULT_PEAK_WINDOW,
            efficiency_band: EfficiencyBand::default(),
            eol_fade_pct: DEFAULT_EOL_FADE_PCT,
            iv_curve_cycles: 5,
            iv_min_points: 10,
            denylist: BTreeSet::new(),
        }
    }
}

impl AnalysisParams {
    /// Parse parameters from JSON; missing keys keep their defaults.
    pub fn from_json_str(text: &str) -> Result<Self, AgingError> {
        let params: AnalysisParams =
            serde_json::from_str(text).map_err(|e| AgingError::Config(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), AgingError> {
        if self.peak_window == 0 {
            return Err(AgingError::Config("peak_window must be >= 1".into()));
        }
        let band = &self.efficiency_band;
        if !band.min_pct.is_finite() || !band.max_pct.is_finite() || band.min_pct > band.max_pct {
            return Err(AgingError::Config(format!(
                "efficiency band [{}, {}] is not a valid range",
                band.min_pct, band.max_pct
            )));
        }
        if !self.eol_fade_pct.is_finite() || self.eol_fade_pct <= 0.0 {
            return Err(AgingError::Config("eol_fade_pct must be > 0".into()));
        }
        Ok(())
    }

    pub fn denylist(&self) -> Denylist {
        Denylist::from_iter(self.denylist.iter().cloned())
    }
}
