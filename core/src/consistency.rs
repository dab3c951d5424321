//! Normalized innovation squared (NIS) consistency diagnostics.
//!
//! For a consistent filter the NIS of an $n$-dimensional measurement follows a chi-square
//! distribution with $n$ degrees of freedom:
//!
//! $$
//! \epsilon = y^T S^{-1} y \sim \chi^2_n
//! $$
//!
//! About 5% of samples should exceed the 95% bound. A much larger share means the filter is
//! overconfident (process noise too small); a share near zero means it is underconfident.

use std::collections::HashMap;

use crate::measurements::SensorType;

/// 95% chi-square bound for a given number of degrees of freedom (1 to 5).
pub fn chi_square_95(degrees_of_freedom: usize) -> Option<f64> {
    match degrees_of_freedom {
        1 => Some(3.841),
        2 => Some(5.991),
        3 => Some(7.815),
        4 => Some(9.488),
        5 => Some(11.070),
        _ => None,
    }
}

/// Summary of the NIS samples recorded for one sensor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NisSummary {
    pub samples: usize,
    pub mean: f64,
    /// Share of samples above the 95% chi-square bound
    pub fraction_above_95: f64,
}

/// Accumulates NIS samples per sensor.
#[derive(Clone, Debug, Default)]
pub struct NisMonitor {
    samples: HashMap<SensorType, Vec<f64>>,
}

impl NisMonitor {
    pub fn new() -> Self {
        NisMonitor::default()
    }
    pub fn record(&mut self, sensor: SensorType, nis: f64) {
        self.samples.entry(sensor).or_default().push(nis);
    }
    pub fn samples(&self, sensor: SensorType) -> &[f64] {
        self.samples.get(&sensor).map(Vec::as_slice).unwrap_or(&[])
    }
    /// Summary for `sensor`, or None when nothing has been recorded for it.
    pub fn summary(&self, sensor: SensorType) -> Option<NisSummary> {
        let samples = self.samples.get(&sensor)?;
        if samples.is_empty() {
            return None;
        }
        let bound = chi_square_95(sensor.dimension())?;
        let n = samples.len() as f64;
        let above = samples.iter().filter(|&&nis| nis > bound).count() as f64;
        Some(NisSummary {
            samples: samples.len(),
            mean: samples.iter().sum::<f64>() / n,
            fraction_above_95: above / n,
        })
    }
}
