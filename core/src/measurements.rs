//! Sensor measurements and measurement models for the laser and radar.
//!
//! A [`Measurement`] is the immutable record handed to the filter: which sensor produced it, the
//! raw values, and a timestamp in microseconds. The [`MeasurementModel`] implementations map the
//! CTRV state into each sensor's measurement space and carry the sensor noise.

use std::fmt::{self, Display};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::motion::STATE_SIZE;
use crate::{FilterError, wrap_to_pi};

/// Radar sigma points closer than this to the sensor (m) make the range-rate undefined.
pub const MIN_RADAR_RANGE: f64 = 1e-4;

/// Closed set of sensor modalities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    /// Planar position sensor reporting `[x, y]`
    Laser,
    /// Range sensor reporting `[range, bearing, range_rate]`
    Radar,
}

impl SensorType {
    /// Length of the raw measurement vector for this sensor.
    pub fn dimension(&self) -> usize {
        match self {
            SensorType::Laser => 2,
            SensorType::Radar => 3,
        }
    }
}

impl Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorType::Laser => write!(f, "laser"),
            SensorType::Radar => write!(f, "radar"),
        }
    }
}

/// A single timestamped sensor reading.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    sensor: SensorType,
    values: DVector<f64>,
    timestamp: i64,
}

impl Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Measurement({}, t: {} us, values: {:?})",
            self.sensor,
            self.timestamp,
            self.values.as_slice()
        )
    }
}

impl Measurement {
    /// Build a measurement from raw values, checking the length and finiteness.
    ///
    /// # Arguments
    /// * `sensor` - The producing sensor.
    /// * `values` - `[x, y]` for the laser, `[range, bearing, range_rate]` for the radar.
    /// * `timestamp` - Time of the reading in microseconds.
    pub fn new(sensor: SensorType, values: Vec<f64>, timestamp: i64) -> Result<Self, FilterError> {
        let measurement = Measurement {
            sensor,
            values: DVector::from_vec(values),
            timestamp,
        };
        measurement.validate()?;
        Ok(measurement)
    }
    /// Laser position reading.
    pub fn laser(x: f64, y: f64, timestamp: i64) -> Self {
        Measurement {
            sensor: SensorType::Laser,
            values: DVector::from_vec(vec![x, y]),
            timestamp,
        }
    }
    /// Radar range, bearing, and range-rate reading.
    pub fn radar(range: f64, bearing: f64, range_rate: f64, timestamp: i64) -> Self {
        Measurement {
            sensor: SensorType::Radar,
            values: DVector::from_vec(vec![range, bearing, range_rate]),
            timestamp,
        }
    }
    pub fn sensor(&self) -> SensorType {
        self.sensor
    }
    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
    /// Check the value vector against the sensor's dimension and reject non-finite entries.
    pub fn validate(&self) -> Result<(), FilterError> {
        let expected = self.sensor.dimension();
        if self.values.len() != expected || self.values.iter().any(|v| !v.is_finite()) {
            return Err(FilterError::InvalidMeasurement {
                sensor: self.sensor,
                expected,
                found: self.values.len(),
            });
        }
        Ok(())
    }
    /// Cartesian position implied by the reading.
    pub fn position(&self) -> (f64, f64) {
        match self.sensor {
            SensorType::Laser => (self.values[0], self.values[1]),
            SensorType::Radar => {
                let (range, bearing) = (self.values[0], self.values[1]);
                (range * bearing.cos(), range * bearing.sin())
            }
        }
    }
}

/// Generic measurement model trait shared by the laser and radar
pub trait MeasurementModel {
    /// The sensor this model describes
    fn sensor(&self) -> SensorType;
    /// Get the dimension of the measurement vector
    fn get_dimension(&self) -> usize {
        self.sensor().dimension()
    }
    /// Get the measurement noise covariance
    fn get_noise(&self) -> DMatrix<f64>;
    /// Map a state vector into measurement space.
    fn get_expected_measurement(&self, state: &DVector<f64>) -> Result<DVector<f64>, FilterError>;
    /// Difference between two measurement-space vectors, with angular components wrapped.
    fn residual(&self, a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
        a - b
    }
}

/// Laser position model: observes `x` and `y` directly.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LaserModel {
    pub std_px: f64,
    pub std_py: f64,
}

impl LaserModel {
    pub fn new(std_px: f64, std_py: f64) -> Self {
        LaserModel { std_px, std_py }
    }
    /// Linear observation matrix H selecting the first two state components.
    pub fn observation_matrix(&self) -> DMatrix<f64> {
        let mut h = DMatrix::<f64>::zeros(2, STATE_SIZE);
        h[(0, 0)] = 1.0;
        h[(1, 1)] = 1.0;
        h
    }
}

impl MeasurementModel for LaserModel {
    fn sensor(&self) -> SensorType {
        SensorType::Laser
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![
            self.std_px.powi(2),
            self.std_py.powi(2),
        ]))
    }
    fn get_expected_measurement(&self, state: &DVector<f64>) -> Result<DVector<f64>, FilterError> {
        Ok(DVector::from_vec(vec![state[0], state[1]]))
    }
}

/// Radar model: range, bearing, and range-rate from the sensor origin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RadarModel {
    pub std_range: f64,
    pub std_bearing: f64,
    pub std_range_rate: f64,
}

impl RadarModel {
    pub fn new(std_range: f64, std_bearing: f64, std_range_rate: f64) -> Self {
        RadarModel {
            std_range,
            std_bearing,
            std_range_rate,
        }
    }
}

impl MeasurementModel for RadarModel {
    fn sensor(&self) -> SensorType {
        SensorType::Radar
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![
            self.std_range.powi(2),
            self.std_bearing.powi(2),
            self.std_range_rate.powi(2),
        ]))
    }
    fn get_expected_measurement(&self, state: &DVector<f64>) -> Result<DVector<f64>, FilterError> {
        let (px, py, speed, yaw) = (state[0], state[1], state[2], state[3]);
        let range = px.hypot(py);
        if !(range >= MIN_RADAR_RANGE) {
            return Err(FilterError::DegenerateObservation { range });
        }
        let bearing = py.atan2(px);
        let range_rate = (px * yaw.cos() * speed + py * yaw.sin() * speed) / range;
        Ok(DVector::from_vec(vec![range, bearing, range_rate]))
    }
    fn residual(&self, a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
        let mut diff = a - b;
        diff[1] = wrap_to_pi(diff[1]);
        diff
    }
}
