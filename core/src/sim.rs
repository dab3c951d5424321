//! Synthetic scenarios, the closed-loop filter driver, and error metrics.
//!
//! This module provides:
//! - `ScenarioConfig` and `SimulationConfig` describing a synthetic run
//! - `generate_scenario` for producing ground truth and alternating laser/radar measurements
//! - `run_filter` for feeding a scenario through the filter and collecting `TrackResult` rows
//! - `rmse` over `[px, py, vx, vy]` sequences
//! - CSV import/export of `TrackResult` rows

use std::io;
use std::path::Path;

use log::{debug, info};
use nalgebra::DVector;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigFile, FilterConfig};
use crate::consistency::NisMonitor;
use crate::kalman::{MICROS_PER_SECOND, UnscentedKalmanFilter};
use crate::measurements::{Measurement, MeasurementModel, SensorType};
use crate::motion::{CtrvState, ctrv_forward};
use crate::{FilterError, wrap_to_pi};

fn default_initial_state() -> CtrvState {
    CtrvState::new(0.6, 0.6, 5.2, 0.0, 0.1)
}
fn default_steps() -> usize {
    100
}
fn default_interval_us() -> i64 {
    50_000
}
fn default_true() -> bool {
    true
}
fn default_seed() -> u64 {
    42
}

/// Description of a synthetic tracking run.
///
/// The ground truth follows the noise-free CTRV model from `initial_state`. Measurements alternate
/// between the laser (even steps) and the radar (odd steps), one every `interval_us` microseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default = "default_steps")]
    pub steps: usize,
    /// Time between consecutive measurements in microseconds
    #[serde(default = "default_interval_us")]
    pub interval_us: i64,
    /// Add zero-mean Gaussian noise with the configured sensor standard deviations
    #[serde(default = "default_true")]
    pub add_noise: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Truth state at the first measurement
    #[serde(default = "default_initial_state")]
    pub initial_state: CtrvState,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            steps: default_steps(),
            interval_us: default_interval_us(),
            add_noise: true,
            seed: default_seed(),
            initial_state: default_initial_state(),
        }
    }
}

impl ConfigFile for ScenarioConfig {}

/// Filter and scenario settings read by the command line tool.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub scenario: ScenarioConfig,
}

impl ConfigFile for SimulationConfig {}

/// Measurements paired index-by-index with the true state at their timestamps.
#[derive(Clone, Debug)]
pub struct Scenario {
    pub measurements: Vec<Measurement>,
    pub ground_truth: Vec<CtrvState>,
}

/// Build a scenario from the noise-free CTRV truth.
///
/// # Arguments
/// * `scenario` - Trajectory, timing, and noise settings.
/// * `sensors` - Supplies the measurement noise standard deviations.
///
/// # Errors
/// * [`FilterError::InvalidConfig`] for a non-positive interval or unusable noise settings.
/// * [`FilterError::DegenerateObservation`] if the truth passes through the radar origin on a
///   radar step.
pub fn generate_scenario(scenario: &ScenarioConfig, sensors: &FilterConfig) -> Result<Scenario, FilterError> {
    sensors.validate()?;
    if scenario.interval_us <= 0 {
        return Err(FilterError::InvalidConfig(format!(
            "interval_us must be positive, got {}",
            scenario.interval_us
        )));
    }
    let mut rng = StdRng::seed_from_u64(scenario.seed);
    let laser_x = gaussian(sensors.std_laspx)?;
    let laser_y = gaussian(sensors.std_laspy)?;
    let range_noise = gaussian(sensors.std_radr)?;
    let bearing_noise = gaussian(sensors.std_radphi)?;
    let range_rate_noise = gaussian(sensors.std_radrd)?;
    let radar = sensors.radar_model();
    let dt = scenario.interval_us as f64 / MICROS_PER_SECOND;

    let mut measurements = Vec::with_capacity(scenario.steps);
    let mut ground_truth = Vec::with_capacity(scenario.steps);
    let mut truth = scenario.initial_state;
    for step in 0..scenario.steps {
        if step > 0 {
            truth = ctrv_forward(&truth, 0.0, 0.0, dt);
            truth.yaw = wrap_to_pi(truth.yaw);
        }
        let timestamp = step as i64 * scenario.interval_us;
        let measurement = if step % 2 == 0 {
            let (mut x, mut y) = (truth.x, truth.y);
            if scenario.add_noise {
                x += laser_x.sample(&mut rng);
                y += laser_y.sample(&mut rng);
            }
            Measurement::laser(x, y, timestamp)
        } else {
            let z = radar.get_expected_measurement(&DVector::from(truth))?;
            let (mut range, mut bearing, mut range_rate) = (z[0], z[1], z[2]);
            if scenario.add_noise {
                range += range_noise.sample(&mut rng);
                bearing = wrap_to_pi(bearing + bearing_noise.sample(&mut rng));
                range_rate += range_rate_noise.sample(&mut rng);
            }
            Measurement::radar(range, bearing, range_rate, timestamp)
        };
        measurements.push(measurement);
        ground_truth.push(truth);
    }
    debug!(
        "Generated {} measurements over {:.2} s",
        measurements.len(),
        scenario.steps.saturating_sub(1) as f64 * dt
    );
    Ok(Scenario {
        measurements,
        ground_truth,
    })
}

fn gaussian(std: f64) -> Result<Normal<f64>, FilterError> {
    Normal::new(0.0, std).map_err(|e| FilterError::InvalidConfig(format!("measurement noise: {}", e)))
}

/// One row of a filter run: the estimate after processing a measurement next to the truth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackResult {
    /// Measurement timestamp in microseconds
    pub timestamp: i64,
    pub sensor: SensorType,
    pub est_x: f64,
    pub est_y: f64,
    pub est_speed: f64,
    pub est_yaw: f64,
    pub est_yaw_rate: f64,
    pub true_x: f64,
    pub true_y: f64,
    pub true_speed: f64,
    pub true_yaw: f64,
    pub true_yaw_rate: f64,
    /// NIS of the update applied for this measurement, empty if none was applied
    pub nis: Option<f64>,
    /// The filter rejected this measurement
    pub rejected: bool,
}

impl TrackResult {
    pub fn new(
        timestamp: i64,
        sensor: SensorType,
        estimate: &CtrvState,
        truth: &CtrvState,
        nis: Option<f64>,
        rejected: bool,
    ) -> Self {
        TrackResult {
            timestamp,
            sensor,
            est_x: estimate.x,
            est_y: estimate.y,
            est_speed: estimate.speed,
            est_yaw: estimate.yaw,
            est_yaw_rate: estimate.yaw_rate,
            true_x: truth.x,
            true_y: truth.y,
            true_speed: truth.speed,
            true_yaw: truth.yaw,
            true_yaw_rate: truth.yaw_rate,
            nis,
            rejected,
        }
    }
    pub fn estimate(&self) -> CtrvState {
        CtrvState::new(
            self.est_x,
            self.est_y,
            self.est_speed,
            self.est_yaw,
            self.est_yaw_rate,
        )
    }
    pub fn truth(&self) -> CtrvState {
        CtrvState::new(
            self.true_x,
            self.true_y,
            self.true_speed,
            self.true_yaw,
            self.true_yaw_rate,
        )
    }
    /// Writes result rows to a CSV file with a header.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    /// Reads result rows written by [`TrackResult::to_csv`].
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn std::error::Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
}

/// `[px, py, vx, vy]` form of a CTRV state, as used for RMSE.
pub fn cartesian(state: &CtrvState) -> DVector<f64> {
    let (vx, vy) = state.velocity();
    DVector::from_vec(vec![state.x, state.y, vx, vy])
}

/// Root mean squared error per component.
///
/// Returns None if either sequence is empty, the lengths differ, or the vectors are not all the
/// same size.
pub fn rmse(estimates: &[DVector<f64>], ground_truth: &[DVector<f64>]) -> Option<DVector<f64>> {
    if estimates.is_empty() || estimates.len() != ground_truth.len() {
        return None;
    }
    let n = estimates[0].len();
    let mut sum = DVector::<f64>::zeros(n);
    for (estimate, truth) in estimates.iter().zip(ground_truth) {
        if estimate.len() != n || truth.len() != n {
            return None;
        }
        let residual = estimate - truth;
        sum += residual.component_mul(&residual);
    }
    Some((sum / estimates.len() as f64).map(f64::sqrt))
}

/// Output of [`run_filter`].
#[derive(Clone, Debug, Default)]
pub struct FilterRun {
    pub results: Vec<TrackResult>,
    pub nis: NisMonitor,
    pub rejected: usize,
}

impl FilterRun {
    /// RMSE of `[px, py, vx, vy]` over every row, or None for an empty run.
    pub fn rmse(&self) -> Option<DVector<f64>> {
        let estimates: Vec<_> = self.results.iter().map(|r| cartesian(&r.estimate())).collect();
        let truth: Vec<_> = self.results.iter().map(|r| cartesian(&r.truth())).collect();
        rmse(&estimates, &truth)
    }
    pub fn final_result(&self) -> Option<&TrackResult> {
        self.results.last()
    }
}

/// Feed every scenario measurement through `filter`, recording the estimate after each one.
///
/// Rejected measurements are counted and flagged in their row. The run continues with the filter
/// in whatever state the rejection left it.
pub fn run_filter(filter: &mut UnscentedKalmanFilter, scenario: &Scenario) -> FilterRun {
    let mut run = FilterRun::default();
    for (measurement, truth) in scenario.measurements.iter().zip(&scenario.ground_truth) {
        let sensor = measurement.sensor();
        let updates = filter.is_initialized()
            && match sensor {
                SensorType::Laser => filter.config().use_laser,
                SensorType::Radar => filter.config().use_radar,
            };
        let (nis, rejected) = match filter.process_measurement(measurement) {
            Ok(()) => (if updates { filter.last_nis(sensor) } else { None }, false),
            Err(e) => {
                debug!("Measurement at t = {} us recorded as rejected: {}", measurement.timestamp(), e);
                (None, true)
            }
        };
        if let Some(value) = nis {
            run.nis.record(sensor, value);
        }
        if rejected {
            run.rejected += 1;
        }
        run.results.push(TrackResult::new(
            measurement.timestamp(),
            sensor,
            &filter.get_state(),
            truth,
            nis,
            rejected,
        ));
    }
    info!(
        "Processed {} measurements ({} rejected)",
        run.results.len(),
        run.rejected
    );
    run
}
