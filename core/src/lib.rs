//! Laser/radar sensor fusion with an Unscented Kalman Filter
//!
//! This crate estimates the planar kinematic state of a single moving object observed by two
//! heterogeneous sensors: a laser (lidar) that reports Cartesian position and a radar that reports
//! range, bearing, and range-rate. Measurements arrive asynchronously and are fused by an
//! Unscented Kalman Filter (UKF) built on a nonlinear constant turn rate and velocity (CTRV)
//! motion model.
//!
//! This crate is primarily built off of a small set of dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools for the filter.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provides random number generation for synthetic measurement noise.
//! - [`log`](https://crates.io/crates/log): Logging facade used throughout the filter.
//!
//! All other functionality is auxiliary (configuration files, CSV output, the command line tool).
//!
//! ## Crate overview
//!
//! - [config]: Construction-time filter configuration and configuration file I/O.
//! - [consistency]: Normalized innovation squared (NIS) consistency diagnostics.
//! - [kalman]: The unscented Kalman filter itself.
//! - [linalg]: Linear algebra helpers for covariance square roots and SPD solves.
//! - [measurements]: Sensor measurements and the laser/radar measurement models.
//! - [motion]: The CTRV motion model.
//! - [sim]: Synthetic scenarios, the closed-loop driver, and error metrics.
//!
//! ## State definition
//!
//! The filter state is the five-element CTRV vector
//!
//! $$
//! x = [p_x, p_y, v, \psi, \dot{\psi}]
//! $$
//!
//! Where:
//! - $p_x$ and $p_y$ are the planar position (m).
//! - $v$ is the speed magnitude (m/s).
//! - $\psi$ is the heading (rad), kept in $(-\pi, \pi]$.
//! - $\dot{\psi}$ is the heading rate (rad/s).
//!
//! During prediction the state is augmented with two zero-mean process noise terms, the
//! longitudinal acceleration $\nu_a$ and the yaw acceleration $\nu_{\ddot{\psi}}$.
pub mod config;
pub mod consistency;
pub mod kalman;
pub mod linalg;
pub mod measurements;
pub mod motion;
pub mod sim;

use std::f64::consts::PI;
use std::fmt::{self, Display};

use crate::measurements::SensorType;

/// Errors produced while configuring or running the filter.
///
/// All of these are deterministic local failures; the filter rejects the offending step and keeps
/// its prior state rather than retrying.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterError {
    /// A covariance could not be factored or inverted, or the step produced non-finite values.
    NumericalInstability { context: &'static str },
    /// A radar sigma point fell too close to the sensor origin to evaluate the observation model.
    DegenerateObservation { range: f64 },
    /// The raw measurement vector has the wrong length or a non-finite entry.
    InvalidMeasurement {
        sensor: SensorType,
        expected: usize,
        found: usize,
    },
    /// A measurement arrived with a timestamp earlier than the last processed one.
    OutOfOrderMeasurement { previous: i64, current: i64 },
    /// The filter configuration is not usable.
    InvalidConfig(String),
}

impl Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::NumericalInstability { context } => {
                write!(f, "numerical instability during {}", context)
            }
            FilterError::DegenerateObservation { range } => {
                write!(f, "degenerate radar observation at range {:e} m", range)
            }
            FilterError::InvalidMeasurement {
                sensor,
                expected,
                found,
            } => write!(
                f,
                "invalid {} measurement: expected {} finite values, found {}",
                sensor, expected, found
            ),
            FilterError::OutOfOrderMeasurement { previous, current } => write!(
                f,
                "measurement timestamp {} precedes last processed timestamp {}",
                current, previous
            ),
            FilterError::InvalidConfig(reason) => write!(f, "invalid filter configuration: {}", reason),
        }
    }
}

impl std::error::Error for FilterError {}

/// Wrap an angle to the range $(-\pi, \pi]$ radians
///
/// Values already inside the interval are returned untouched. Non-finite inputs are passed through
/// so that the caller's finiteness checks can catch them.
///
/// # Arguments
/// * `angle` - The angle in radians.
/// # Returns
/// * The equivalent angle in $(-\pi, \pi]$.
/// # Example
/// ```rust
/// use fusion::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped + PI / 2.0).abs() < 1e-12);
/// assert_eq!(wrap_to_pi(-PI), PI);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    if (angle > -PI && angle <= PI) || !angle.is_finite() {
        return angle;
    }
    let wrapped = PI - (PI - angle).rem_euclid(2.0 * PI);
    // rem_euclid may round up to the full period
    if wrapped <= -PI { PI } else { wrapped }
}
