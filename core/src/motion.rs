//! Constant turn rate and velocity (CTRV) motion model
//!
//! The CTRV model assumes the object keeps a constant speed and a constant yaw rate between
//! measurements. Process noise enters as a longitudinal acceleration $\nu_a$ and a yaw
//! acceleration $\nu_{\ddot{\psi}}$, both held constant over the interval.
//!
//! For $|\dot{\psi}| > \epsilon$ the position is integrated in closed form along the arc:
//!
//! $$
//! \begin{aligned}
//! p_x' &= p_x + \frac{v}{\dot{\psi}} \left( \sin(\psi + \dot{\psi}\Delta t) - \sin\psi \right) + \tfrac{1}{2}\Delta t^2 \cos\psi \, \nu_a \\\\
//! p_y' &= p_y + \frac{v}{\dot{\psi}} \left( \cos\psi - \cos(\psi + \dot{\psi}\Delta t) \right) + \tfrac{1}{2}\Delta t^2 \sin\psi \, \nu_a
//! \end{aligned}
//! $$
//!
//! and below the threshold it falls back to straight-line integration. The remaining states are
//!
//! $$
//! \begin{aligned}
//! v' &= v + \Delta t \, \nu_a \\\\
//! \psi' &= \psi + \dot{\psi}\Delta t + \tfrac{1}{2}\Delta t^2 \nu_{\ddot{\psi}} \\\\
//! \dot{\psi}' &= \dot{\psi} + \Delta t \, \nu_{\ddot{\psi}}
//! \end{aligned}
//! $$

use std::fmt::{self, Display};

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Number of elements in the CTRV state vector.
pub const STATE_SIZE: usize = 5;
/// Number of process noise terms appended to the state during prediction.
pub const NOISE_SIZE: usize = 2;
/// Below this yaw rate magnitude (rad/s) the position is integrated along a straight line.
pub const YAW_RATE_THRESHOLD: f64 = 1e-3;

/// Index of the heading within the state vector.
pub const YAW_INDEX: usize = 3;

/// Named view of the five-element CTRV state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CtrvState {
    /// Position along x in meters
    pub x: f64,
    /// Position along y in meters
    pub y: f64,
    /// Speed magnitude in m/s
    pub speed: f64,
    /// Heading in radians
    pub yaw: f64,
    /// Heading rate in rad/s
    pub yaw_rate: f64,
}

impl Display for CtrvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CtrvState(x: {:.4}, y: {:.4}, v: {:.4}, yaw: {:.4}, yaw_rate: {:.4})",
            self.x, self.y, self.speed, self.yaw, self.yaw_rate
        )
    }
}

impl CtrvState {
    pub fn new(x: f64, y: f64, speed: f64, yaw: f64, yaw_rate: f64) -> Self {
        CtrvState {
            x,
            y,
            speed,
            yaw,
            yaw_rate,
        }
    }
    /// Cartesian velocity components `(vx, vy)`.
    pub fn velocity(&self) -> (f64, f64) {
        (self.speed * self.yaw.cos(), self.speed * self.yaw.sin())
    }
}

impl From<&CtrvState> for DVector<f64> {
    fn from(state: &CtrvState) -> Self {
        DVector::from_vec(vec![state.x, state.y, state.speed, state.yaw, state.yaw_rate])
    }
}

impl From<CtrvState> for DVector<f64> {
    fn from(state: CtrvState) -> Self {
        DVector::from(&state)
    }
}

impl From<&DVector<f64>> for CtrvState {
    /// Reads the first five entries; the caller guarantees the vector is at least that long.
    fn from(v: &DVector<f64>) -> Self {
        CtrvState::new(v[0], v[1], v[2], v[3], v[4])
    }
}

/// Propagate a CTRV state over `dt` seconds under constant noise accelerations.
///
/// # Arguments
/// * `state` - The state at the start of the interval.
/// * `accel_noise` - Longitudinal acceleration noise $\nu_a$ (m/s²).
/// * `yaw_accel_noise` - Yaw acceleration noise $\nu_{\ddot{\psi}}$ (rad/s²).
/// * `dt` - Elapsed time in seconds; zero is allowed and returns the input state.
///
/// # Returns
/// The propagated state. The heading is not wrapped here; residual computations wrap it.
pub fn ctrv_forward(state: &CtrvState, accel_noise: f64, yaw_accel_noise: f64, dt: f64) -> CtrvState {
    let CtrvState {
        x,
        y,
        speed,
        yaw,
        yaw_rate,
    } = *state;
    let (sin_yaw, cos_yaw) = yaw.sin_cos();

    let (mut x_p, mut y_p) = if yaw_rate.abs() > YAW_RATE_THRESHOLD {
        let yaw_end = yaw + yaw_rate * dt;
        (
            x + speed / yaw_rate * (yaw_end.sin() - sin_yaw),
            y + speed / yaw_rate * (cos_yaw - yaw_end.cos()),
        )
    } else {
        (x + speed * dt * cos_yaw, y + speed * dt * sin_yaw)
    };

    let half_dt2 = 0.5 * dt * dt;
    x_p += half_dt2 * cos_yaw * accel_noise;
    y_p += half_dt2 * sin_yaw * accel_noise;

    CtrvState {
        x: x_p,
        y: y_p,
        speed: speed + dt * accel_noise,
        yaw: yaw + yaw_rate * dt + half_dt2 * yaw_accel_noise,
        yaw_rate: yaw_rate + dt * yaw_accel_noise,
    }
}
