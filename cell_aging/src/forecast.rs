//! Capacity/resistance correlation and linear remaining-useful-life forecast.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::{AgingError, DischargeSeries, ImpedanceSeries};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearFit {
    pub fn evaluate(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CapacityResistanceCorrelation {
    /// Total resistance interpolated onto each discharge EFC.
    pub interpolated_resistance: Vec<f64>,
    pub capacity: Vec<f64>,
    pub pearson_r: f64,
    pub r_squared: f64,
    /// Least-squares line of capacity against resistance.
    pub trend: LinearFit,
}

/// Correlate capacity with resistance. Impedance tests are sparser than
/// discharges, so the resistance is interpolated onto the discharge EFC axis
/// using the impedance row index as its x coordinate (uniform spacing assumed).
pub fn capacity_vs_resistance(
    discharge: &DischargeSeries,
    impedance: &ImpedanceSeries,
) -> Result<CapacityResistanceCorrelation, AgingError> {
    if impedance.len() < 2 {
        return Err(AgingError::insufficient("capacity/resistance correlation", 2, impedance.len()));
    }
    if discharge.len() < 2 {
        return Err(AgingError::insufficient("capacity/resistance correlation", 2, discharge.len()));
    }

    let xp: Vec<f64> = (0..impedance.len()).map(|i| i as f64).collect();
    let fp = impedance.total_resistances();
    let interpolated: Vec<f64> = discharge
        .points
        .iter()
        .map(|p| interpolate(p.efc as f64, &xp, &fp))
        .collect();
    let capacity = discharge.capacities();

    if is_constant(&interpolated) {
        return Err(AgingError::UndefinedCorrelation("interpolated resistance"));
    }
    if is_constant(&capacity) {
        return Err(AgingError::UndefinedCorrelation("capacity"));
    }

    let x = Array1::from_vec(interpolated.clone());
    let y = Array1::from_vec(capacity.clone());
    let mean_x = x.sum() / x.len() as f64;
    let mean_y = y.sum() / y.len() as f64;
    let dx = &x - mean_x;
    let dy = &y - mean_y;
    let sxx = dx.dot(&dx);
    let syy = dy.dot(&dy);
    let sxy = dx.dot(&dy);

    let pearson_r = (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0);
    let slope = sxy / sxx;
    Ok(CapacityResistanceCorrelation {
        interpolated_resistance: interpolated,
        capacity,
        pearson_r,
        r_squared: pearson_r * pearson_r,
        trend: LinearFit {
            slope,
            intercept: mean_y - slope * mean_x,
        },
    })
}

fn is_constant(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] == w[1])
}

/// Piecewise-linear interpolation; targets outside `xs` clamp to the end values.
pub(crate) fn interpolate(target: f64, xs: &[f64], ys: &[f64]) -> f64 {
    let len = xs.len().min(ys.len());
    if len == 0 {
        return f64::NAN;
    }
    if target <= xs[0] {
        return ys[0];
    }
    for i in 1..len {
        if target <= xs[i] {
            let x0 = xs[i - 1];
            let x1 = xs[i];
            let y0 = ys[i - 1];
            let y1 = ys[i];
            if (x1 - x0).abs() < f64::EPSILON {
                return y1;
            }
            let frac = ((target - x0) / (x1 - x0)).clamp(0.0, 1.0);
            return y0 + (y1 - y0) * frac;
        }
    }
    ys[len - 1]
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct RulEstimate {
    /// Cycles until the fade threshold at the observed average fade rate.
    /// Negative once the threshold has already been crossed.
    pub cycles_to_eol: f64,
    pub remaining_life_pct: f64,
}

/// Linear extrapolation of fade to `eol_threshold_pct`. `None` when no fade
/// has been observed (nothing to extrapolate from).
pub fn remaining_useful_life(
    total_cycles: usize,
    capacity_fade_pct: f64,
    eol_threshold_pct: f64,
) -> Option<RulEstimate> {
    if total_cycles == 0
        || !capacity_fade_pct.is_finite()
        || !eol_threshold_pct.is_finite()
        || capacity_fade_pct <= 0.0
    {
        return None;
    }
    let cycles = total_cycles as f64;
    let fade_per_cycle = capacity_fade_pct / cycles;
    let cycles_to_eol = (eol_threshold_pct - capacity_fade_pct) / fade_per_cycle;
    Some(RulEstimate {
        cycles_to_eol,
        remaining_life_pct: cycles_to_eol / cycles * 100.0,
    })
}
