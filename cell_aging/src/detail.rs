//! Per-sample detail files: loading, integrated energy efficiency, thermal
//! profile and I-V curve extraction.

use std::cmp::Ordering;
use std::fs::File;
use std::path::Path;

use ordered_float::OrderedFloat;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{AgingError, DetailSample, EfficiencyBand, TestRecord};

pub const THERMAL_EXCELLENT_RANGE_C: f64 = 5.0;
pub const THERMAL_GOOD_RANGE_C: f64 = 10.0;
pub const THERMAL_MODERATE_RANGE_C: f64 = 20.0;

#[derive(Debug, Deserialize)]
struct RawDetailRow {
    #[serde(rename = "Time", default, deserialize_with = "csv::invalid_option")]
    time: Option<f64>,
    #[serde(rename = "Voltage_measured", default, deserialize_with = "csv::invalid_option")]
    voltage_measured: Option<f64>,
    #[serde(rename = "Current_measured", default, deserialize_with = "csv::invalid_option")]
    current_measured: Option<f64>,
    #[serde(rename = "Voltage_load", default, deserialize_with = "csv::invalid_option")]
    voltage_load: Option<f64>,
    #[serde(rename = "Current_load", default, deserialize_with = "csv::invalid_option")]
    current_load: Option<f64>,
    #[serde(rename = "Temperature_measured", default, deserialize_with = "csv::invalid_option")]
    temperature: Option<f64>,
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// Read one detail CSV. Rows without a usable time are dropped; missing
/// measurements stay `None`.
pub fn load_detail_file(path: &Path, sample_uid: &str) -> Result<Vec<DetailSample>, AgingError> {
    let file = File::open(path).map_err(|source| AgingError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut samples = Vec::new();
    for row in reader.deserialize::<RawDetailRow>() {
        let row = row?;
        let Some(t) = finite(row.time) else {
            continue;
        };
        samples.push(DetailSample {
            sample_uid: sample_uid.to_string(),
            t,
            voltage_measured: finite(row.voltage_measured),
            current_measured: finite(row.current_measured),
            voltage_load: finite(row.voltage_load),
            current_load: finite(row.current_load),
            temperature: finite(row.temperature),
        });
    }
    Ok(samples)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CycleDetail {
    pub cycle_id: Option<i64>,
    pub sample_uid: String,
    pub detail_filename: String,
    pub samples: Vec<DetailSample>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SkippedFile {
    pub cycle_id: Option<i64>,
    pub detail_filename: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DetailLoad {
    pub cycles: Vec<CycleDetail>,
    pub skipped: Vec<SkippedFile>,
}

impl DetailLoad {
    /// All samples of every loaded cycle, in cycle order.
    pub fn all_samples(&self) -> Vec<DetailSample> {
        self.cycles
            .iter()
            .flat_map(|c| c.samples.iter().cloned())
            .collect()
    }
}

fn load_one(data_dir: &Path, record: &TestRecord) -> Result<CycleDetail, SkippedFile> {
    let skipped = |reason: String| SkippedFile {
        cycle_id: record.cycle_id,
        detail_filename: record.detail_filename.clone(),
        reason,
    };
    if record.detail_filename.is_empty() {
        return Err(skipped("no detail file referenced".into()));
    }
    let path = data_dir.join(&record.detail_filename);
    let samples = load_detail_file(&path, &record.sample_uid).map_err(|e| skipped(e.to_string()))?;
    Ok(CycleDetail {
        cycle_id: record.cycle_id,
        sample_uid: record.sample_uid.clone(),
        detail_filename: record.detail_filename.clone(),
        samples,
    })
}

/// Load the detail files referenced by `records`. Files are read
/// independently (in parallel with the `parallel` feature); a missing or
/// unreadable file is reported in `skipped` and never fails the batch.
pub fn load_cycle_details(data_dir: &Path, records: &[TestRecord]) -> DetailLoad {
    #[cfg(feature = "parallel")]
    let results: Vec<Result<CycleDetail, SkippedFile>> = records
        .par_iter()
        .map(|record| load_one(data_dir, record))
        .collect();
    #[cfg(not(feature = "parallel"))]
    let results: Vec<Result<CycleDetail, SkippedFile>> = records
        .iter()
        .map(|record| load_one(data_dir, record))
        .collect();

    let mut load = DetailLoad::default();
    for result in results {
        match result {
            Ok(cycle) => load.cycles.push(cycle),
            Err(skip) => {
                warn!(
                    "Skipping detail file '{}' (cycle {:?}): {}",
                    skip.detail_filename, skip.cycle_id, skip.reason
                );
                load.skipped.push(skip);
            }
        }
    }
    load.cycles.sort_by(|a, b| match (a.cycle_id, b.cycle_id) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    load
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct EfficiencyResult {
    pub efficiency_pct: f64,
    pub energy_supplied_j: f64,
    pub energy_received_j: f64,
    pub samples_used: usize,
}

/// Integrated energy efficiency of one cycle, or `None` when the cycle has no
/// load channels, no usable intervals, or a ratio outside `band`.
pub fn energy_efficiency(samples: &[DetailSample], band: &EfficiencyBand) -> Option<EfficiencyResult> {
    if !samples
        .iter()
        .any(|s| s.voltage_load.is_some() && s.current_load.is_some())
    {
        return None;
    }

    let mut sorted: Vec<&DetailSample> = samples.iter().collect();
    sorted.sort_by_key(|s| OrderedFloat(s.t));

    let mut supplied = 0.0;
    let mut received = 0.0;
    let mut used = 0usize;
    for i in 1..sorted.len() {
        let dt = sorted[i].t - sorted[i - 1].t;
        if dt <= 0.0 {
            continue;
        }
        let s = sorted[i];
        if let (Some(v), Some(c)) = (s.voltage_load, s.current_load) {
            supplied += v * c * dt;
        }
        if let (Some(v), Some(i)) = (s.voltage_measured, s.current_measured) {
            received += v * i.abs() * dt;
        }
        used += 1;
    }
    if used == 0 || supplied <= 0.0 || received <= 0.0 {
        return None;
    }

    let efficiency_pct = supplied / received * 100.0;
    if !band.contains(efficiency_pct) {
        debug!(
            "discarding efficiency {:.2}% outside [{}, {}]",
            efficiency_pct, band.min_pct, band.max_pct
        );
        return None;
    }
    Some(EfficiencyResult {
        efficiency_pct,
        energy_supplied_j: supplied,
        energy_received_j: received,
        samples_used: used,
    })
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EfficiencyPoint {
    pub cycle_id: Option<i64>,
    pub sample_uid: String,
    pub efficiency_pct: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EfficiencyTrend {
    pub points: Vec<EfficiencyPoint>,
    pub average_pct: f64,
    pub final_pct: f64,
}

/// Efficiency per cycle; cycles without a valid result are left out.
pub fn efficiency_trend(cycles: &[CycleDetail], band: &EfficiencyBand) -> Option<EfficiencyTrend> {
    let points: Vec<EfficiencyPoint> = cycles
        .iter()
        .filter_map(|cycle| {
            let result = energy_efficiency(&cycle.samples, band)?;
            Some(EfficiencyPoint {
                cycle_id: cycle.cycle_id,
                sample_uid: cycle.sample_uid.clone(),
                efficiency_pct: result.efficiency_pct,
            })
        })
        .collect();
    let final_pct = points.last()?.efficiency_pct;
    let average_pct = points.iter().map(|p| p.efficiency_pct).sum::<f64>() / points.len() as f64;
    Some(EfficiencyTrend {
        points,
        average_pct,
        final_pct,
    })
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThermalStability {
    Excellent,
    Good,
    Moderate,
    HighVariation,
}

impl ThermalStability {
    pub fn from_range(range_c: f64) -> Self {
        if range_c < THERMAL_EXCELLENT_RANGE_C {
            ThermalStability::Excellent
        } else if range_c < THERMAL_GOOD_RANGE_C {
            ThermalStability::Good
        } else if range_c < THERMAL_MODERATE_RANGE_C {
            ThermalStability::Moderate
        } else {
            ThermalStability::HighVariation
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ThermalProfile {
    pub mean_c: f64,
    pub min_c: f64,
    pub max_c: f64,
    pub range_c: f64,
    pub samples: usize,
    pub stability: ThermalStability,
}

/// Temperature statistics over samples that also carry measured voltage and current.
pub fn thermal_profile(samples: &[DetailSample]) -> Option<ThermalProfile> {
    let temps: Vec<f64> = samples
        .iter()
        .filter(|s| s.voltage_measured.is_some() && s.current_measured.is_some())
        .filter_map(|s| s.temperature)
        .collect();
    if temps.is_empty() {
        return None;
    }
    let min_c = temps.iter().copied().fold(f64::INFINITY, f64::min);
    let max_c = temps.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean_c = temps.iter().sum::<f64>() / temps.len() as f64;
    let range_c = max_c - min_c;
    Some(ThermalProfile {
        mean_c,
        min_c,
        max_c,
        range_c,
        samples: temps.len(),
        stability: ThermalStability::from_range(range_c),
    })
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IvCurve {
    pub cycle_id: Option<i64>,
    pub sample_uid: String,
    pub current_a: Vec<f64>,
    pub voltage_v: Vec<f64>,
}

/// `(|I|, V)` pairs of the discharge-current samples of one cycle; `None`
/// unless more than `min_points` such samples exist.
pub fn iv_curve(cycle: &CycleDetail, min_points: usize) -> Option<IvCurve> {
    let (current_a, voltage_v): (Vec<f64>, Vec<f64>) = cycle
        .samples
        .iter()
        .filter_map(|s| Some((s.current_measured?, s.voltage_measured?)))
        .filter(|(i, _)| *i < 0.0)
        .map(|(i, v)| (i.abs(), v))
        .unzip();
    if current_a.len() <= min_points {
        return None;
    }
    Some(IvCurve {
        cycle_id: cycle.cycle_id,
        sample_uid: cycle.sample_uid.clone(),
        current_a,
        voltage_v,
    })
}
