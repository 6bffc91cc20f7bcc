//! Capacity and usage metrics over the cleaned discharge cycles of one unit.

use serde::{Deserialize, Serialize};

use crate::{AgingError, TestRecord};

/// Final retention (percent of peak) below which a unit is at end of life.
pub const RETENTION_EOL_PCT: f64 = 70.0;
/// Final retention below which a unit is in advanced aging.
pub const RETENTION_ADVANCED_PCT: f64 = 80.0;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DischargePoint {
    pub efc: usize,
    pub cycle_id: Option<i64>,
    pub sample_uid: String,
    pub capacity: f64,
    pub soc: f64,
    pub dod: f64,
    pub capacity_fade: f64,
    pub throughput: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DischargeSeries {
    pub peak_capacity: f64,
    pub points: Vec<DischargePoint>,
}

impl DischargeSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacities(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.capacity).collect()
    }

    pub fn total_throughput(&self) -> f64 {
        self.points.last().map(|p| p.throughput).unwrap_or(0.0)
    }

    pub fn average_throughput(&self) -> Option<f64> {
        if self.points.is_empty() {
            None
        } else {
            Some(self.total_throughput() / self.points.len() as f64)
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DegradationPoint {
    pub efc: usize,
    pub rate_pct: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetentionStatus {
    Good,
    AdvancedAging,
    EndOfLife,
}

impl RetentionStatus {
    pub fn from_retention(pct: f64) -> Self {
        if pct < RETENTION_EOL_PCT {
            RetentionStatus::EndOfLife
        } else if pct < RETENTION_ADVANCED_PCT {
            RetentionStatus::AdvancedAging
        } else {
            RetentionStatus::Good
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CapacityRetention {
    pub efc: Vec<usize>,
    pub retention_pct: Vec<f64>,
    pub final_retention_pct: f64,
    pub status: RetentionStatus,
}

/// Reference capacity: the maximum over the first `window` rows with a
/// capacity, so a late recalibration reading cannot inflate the "as-new" value.
/// A window holding no positive capacity is insufficient data.
pub fn peak_capacity(discharge: &[TestRecord], window: usize) -> Result<f64, AgingError> {
    let window_rows: Vec<f64> = discharge
        .iter()
        .filter_map(|r| r.capacity)
        .take(window.max(1))
        .collect();
    let peak = window_rows.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !peak.is_finite() || peak <= 0.0 {
        let positive = window_rows.iter().filter(|c| **c > 0.0).count();
        return Err(AgingError::insufficient("positive peak capacity", 1, positive));
    }
    Ok(peak)
}

/// Derive SOC, DOD, fade and throughput. `discharge` must already be the
/// cleaned, cycle-ordered list; rows without capacity are skipped.
pub fn compute_discharge_series(
    discharge: &[TestRecord],
    peak_window: usize,
) -> Result<DischargeSeries, AgingError> {
    let rows: Vec<(&TestRecord, f64)> = discharge
        .iter()
        .filter_map(|r| r.capacity.map(|c| (r, c)))
        .collect();
    if rows.is_empty() {
        return Err(AgingError::insufficient("discharge series", 1, 0));
    }

    let peak = peak_capacity(discharge, peak_window)?;

    let mut throughput = 0.0;
    let points = rows
        .into_iter()
        .enumerate()
        .map(|(efc, (record, capacity))| {
            throughput += capacity;
            let soc = capacity / peak * 100.0;
            DischargePoint {
                efc,
                cycle_id: record.cycle_id,
                sample_uid: record.sample_uid.clone(),
                capacity,
                soc,
                dod: 100.0 - soc,
                capacity_fade: (peak - capacity) / peak * 100.0,
                throughput,
            }
        })
        .collect();

    Ok(DischargeSeries {
        peak_capacity: peak,
        points,
    })
}

/// Percent capacity lost between each pair of adjacent cycles.
pub fn degradation_rate(series: &DischargeSeries) -> Result<Vec<DegradationPoint>, AgingError> {
    if series.len() < 2 {
        return Err(AgingError::insufficient("degradation rate", 2, series.len()));
    }
    let rates = series
        .points
        .windows(2)
        .filter(|w| w[0].capacity != 0.0)
        .map(|w| DegradationPoint {
            efc: w[1].efc,
            rate_pct: (w[0].capacity - w[1].capacity) / w[0].capacity * 100.0,
        })
        .collect();
    Ok(rates)
}

pub fn capacity_retention(series: &DischargeSeries) -> Option<CapacityRetention> {
    let last = series.points.last()?;
    let final_retention_pct = last.soc;
    Some(CapacityRetention {
        efc: series.points.iter().map(|p| p.efc).collect(),
        retention_pct: series.points.iter().map(|p| p.soc).collect(),
        final_retention_pct,
        status: RetentionStatus::from_retention(final_retention_pct),
    })
}
