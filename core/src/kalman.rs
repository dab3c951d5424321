//! Unscented Kalman filter over the CTRV motion model
//!
//! The filter fuses asynchronous laser and radar measurements. Every measurement after the first
//! triggers a prediction over the elapsed time followed by the update that matches the sensor:
//!
//! - **Laser**: the observation is linear in the state (H selects $p_x, p_y$), so a standard
//!   Kalman update is used with the Joseph-form covariance correction
//!   $P = (I - KH) P (I - KH)^T + K R K^T$.
//! - **Radar**: the observation is nonlinear, so the predicted sigma points are pushed through
//!   the range/bearing/range-rate model and the update is formed from the unscented statistics:
//!
//! $$
//! \begin{aligned}
//! S &= \sum_i w_i (Z_i - \hat{z})(Z_i - \hat{z})^T + R \\\\
//! T &= \sum_i w_i (X_i - \bar{x})(Z_i - \hat{z})^T \\\\
//! K &= T S^{-1} \\\\
//! x &= \bar{x} + K (z - \hat{z}) \\\\
//! P &= \bar{P} - K S K^T
//! \end{aligned}
//! $$
//!
//! Prediction works on a seven-element augmented state (the CTRV state plus the two process noise
//! terms) so that the noise passes through the nonlinear motion model. The sigma point spreading
//! parameter is $\lambda = 3 - n_x$ and the weights are
//! $w_0 = \lambda / (\lambda + n_{aug})$, $w_i = 1 / (2(\lambda + n_{aug}))$.
//!
//! Every heading and bearing residual is wrapped into $(-\pi, \pi]$ before it enters an outer
//! product or a state correction.

use std::fmt::{self, Debug, Display};

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};

use crate::config::FilterConfig;
use crate::linalg::{
    SolveOptions, chol_solve_spd, is_positive_definite, matrix_square_root, symmetrize,
};
use crate::measurements::{LaserModel, Measurement, MeasurementModel, RadarModel, SensorType};
use crate::motion::{CtrvState, NOISE_SIZE, STATE_SIZE, YAW_INDEX, ctrv_forward};
use crate::{FilterError, wrap_to_pi};

/// Size of the state augmented with the process noise terms.
pub const AUGMENTED_SIZE: usize = STATE_SIZE + NOISE_SIZE;
/// Number of sigma points generated from the augmented state.
pub const SIGMA_POINT_COUNT: usize = 2 * AUGMENTED_SIZE + 1;
/// Measurement timestamps are in microseconds.
pub const MICROS_PER_SECOND: f64 = 1e6;
/// Initial variances of the states a single measurement cannot observe.
const INITIAL_SPEED_VARIANCE: f64 = 1000.0;
const INITIAL_YAW_VARIANCE: f64 = 1.0;
const INITIAL_YAW_RATE_VARIANCE: f64 = 1.0;

/// Unscented Kalman Filter for laser/radar fusion
#[derive(Clone)]
pub struct UnscentedKalmanFilter {
    config: FilterConfig,
    laser: LaserModel,
    radar: RadarModel,
    mean_state: DVector<f64>,
    covariance: DMatrix<f64>,
    /// Sigma points propagated by the last prediction (5 x 15)
    predicted_sigma_points: DMatrix<f64>,
    /// False once an update has moved the estimate away from the predicted sigma points
    sigma_points_current: bool,
    lambda: f64,
    weights: DVector<f64>,
    is_initialized: bool,
    last_timestamp: i64,
    nis_laser: Option<f64>,
    nis_radar: Option<f64>,
}

impl Debug for UnscentedKalmanFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UKF")
            .field("mean_state", &self.mean_state)
            .field("covariance", &self.covariance)
            .field("lambda", &self.lambda)
            .field("is_initialized", &self.is_initialized)
            .field("last_timestamp", &self.last_timestamp)
            .finish()
    }
}

impl Display for UnscentedKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_initialized {
            return write!(f, "UnscentedKalmanFilter(uninitialized)");
        }
        write!(
            f,
            "UnscentedKalmanFilter(t: {} us, {})",
            self.last_timestamp,
            self.get_state()
        )
    }
}

impl UnscentedKalmanFilter {
    /// Create an uninitialized filter. The first measurement seeds the state.
    ///
    /// # Example
    ///
    /// ```rust
    /// use fusion::config::FilterConfig;
    /// use fusion::kalman::UnscentedKalmanFilter;
    /// use fusion::measurements::Measurement;
    ///
    /// let mut ukf = UnscentedKalmanFilter::new(FilterConfig::default()).unwrap();
    /// ukf.process_measurement(&Measurement::laser(1.0, 2.0, 0)).unwrap();
    /// ukf.process_measurement(&Measurement::radar(2.3, 1.1, 0.0, 50_000)).unwrap();
    /// let state = ukf.get_state();
    /// assert!((state.x - 1.0).abs() < 0.5);
    /// ```
    pub fn new(config: FilterConfig) -> Result<UnscentedKalmanFilter, FilterError> {
        config.validate()?;
        let lambda = 3.0 - STATE_SIZE as f64;
        let spread = lambda + AUGMENTED_SIZE as f64;
        let mut weights = DVector::from_element(SIGMA_POINT_COUNT, 0.5 / spread);
        weights[0] = lambda / spread;
        Ok(UnscentedKalmanFilter {
            laser: config.laser_model(),
            radar: config.radar_model(),
            config,
            mean_state: DVector::zeros(STATE_SIZE),
            covariance: DMatrix::identity(STATE_SIZE, STATE_SIZE),
            predicted_sigma_points: DMatrix::zeros(STATE_SIZE, SIGMA_POINT_COUNT),
            sigma_points_current: false,
            lambda,
            weights,
            is_initialized: false,
            last_timestamp: 0,
            nis_laser: None,
            nis_radar: None,
        })
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }
    /// Timestamp (us) of the last measurement the filter advanced to.
    pub fn last_timestamp(&self) -> Option<i64> {
        self.is_initialized.then_some(self.last_timestamp)
    }
    pub fn get_estimate(&self) -> DVector<f64> {
        self.mean_state.clone()
    }
    pub fn get_certainty(&self) -> DMatrix<f64> {
        self.covariance.clone()
    }
    pub fn get_state(&self) -> CtrvState {
        CtrvState::from(&self.mean_state)
    }
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }
    pub fn lambda(&self) -> f64 {
        self.lambda
    }
    /// NIS of the most recent update for `sensor`, if one has been applied.
    pub fn last_nis(&self, sensor: SensorType) -> Option<f64> {
        match sensor {
            SensorType::Laser => self.nis_laser,
            SensorType::Radar => self.nis_radar,
        }
    }

    /// Feed one measurement to the filter.
    ///
    /// The first measurement initializes the state regardless of the sensor flags. Every later
    /// measurement predicts forward to its timestamp and then applies the update for its sensor,
    /// unless that sensor is disabled in the configuration.
    ///
    /// # Errors
    /// - [`FilterError::InvalidMeasurement`] and [`FilterError::OutOfOrderMeasurement`] leave the
    ///   filter untouched.
    /// - A failed prediction leaves the filter untouched.
    /// - A failed update leaves the filter at the predicted state for this timestamp.
    pub fn process_measurement(&mut self, measurement: &Measurement) -> Result<(), FilterError> {
        measurement
            .validate()
            .inspect_err(|e| warn!("Rejecting measurement: {}", e))?;
        if !self.is_initialized {
            self.initialize(measurement);
            return Ok(());
        }
        let timestamp = measurement.timestamp();
        if timestamp < self.last_timestamp {
            let err = FilterError::OutOfOrderMeasurement {
                previous: self.last_timestamp,
                current: timestamp,
            };
            warn!("Rejecting measurement: {}", err);
            return Err(err);
        }
        let dt = timestamp
            .checked_sub(self.last_timestamp)
            .map(|elapsed| elapsed as f64 / MICROS_PER_SECOND)
            .ok_or(FilterError::NumericalInstability {
                context: "time step overflow",
            })
            .inspect_err(|e| warn!("Rejecting measurement: {}", e))?;
        self.predict(dt)
            .inspect_err(|e| warn!("Prediction to t = {} us rejected: {}", timestamp, e))?;
        self.last_timestamp = timestamp;

        let enabled = match measurement.sensor() {
            SensorType::Laser => self.config.use_laser,
            SensorType::Radar => self.config.use_radar,
        };
        if !enabled {
            debug!(
                "{} disabled, skipping update at t = {} us",
                measurement.sensor(),
                timestamp
            );
            return Ok(());
        }
        self.update(measurement).inspect_err(|e| {
            warn!(
                "{} update at t = {} us rejected, keeping prediction: {}",
                measurement.sensor(),
                timestamp,
                e
            )
        })
    }

    /// Seed the state from the first measurement.
    fn initialize(&mut self, measurement: &Measurement) {
        let (x, y) = measurement.position();
        self.mean_state = DVector::from_vec(vec![x, y, 0.0, 0.0, 0.0]);
        self.covariance = DMatrix::from_diagonal(&DVector::from_vec(vec![
            self.config.std_laspx.powi(2),
            self.config.std_laspy.powi(2),
            INITIAL_SPEED_VARIANCE,
            INITIAL_YAW_VARIANCE,
            INITIAL_YAW_RATE_VARIANCE,
        ]));
        self.last_timestamp = measurement.timestamp();
        self.is_initialized = true;
        self.sigma_points_current = false;
        info!(
            "Initialized from {} measurement at t = {} us: position ({:.3}, {:.3})",
            measurement.sensor(),
            self.last_timestamp,
            x,
            y
        );
    }

    /// Generate the augmented sigma points (7 x 15) for the current mean and covariance.
    ///
    /// # Errors
    /// [`FilterError::NumericalInstability`] when the augmented covariance cannot be factored.
    pub fn get_sigma_points(&self) -> Result<DMatrix<f64>, FilterError> {
        let mut mean_aug = DVector::<f64>::zeros(AUGMENTED_SIZE);
        mean_aug.rows_mut(0, STATE_SIZE).copy_from(&self.mean_state);

        let mut p_aug = DMatrix::<f64>::zeros(AUGMENTED_SIZE, AUGMENTED_SIZE);
        p_aug
            .view_mut((0, 0), (STATE_SIZE, STATE_SIZE))
            .copy_from(&self.covariance);
        p_aug[(STATE_SIZE, STATE_SIZE)] = self.config.std_a.powi(2);
        p_aug[(STATE_SIZE + 1, STATE_SIZE + 1)] = self.config.std_yawdd.powi(2);

        let sqrt_p = matrix_square_root(&p_aug).ok_or(FilterError::NumericalInstability {
            context: "sigma point generation",
        })?;
        let spread = (self.lambda + AUGMENTED_SIZE as f64).sqrt();

        let mut pts = DMatrix::<f64>::zeros(AUGMENTED_SIZE, SIGMA_POINT_COUNT);
        pts.column_mut(0).copy_from(&mean_aug);
        for i in 0..AUGMENTED_SIZE {
            let offset = sqrt_p.column(i) * spread;
            pts.column_mut(i + 1).copy_from(&(&mean_aug + &offset));
            pts.column_mut(i + 1 + AUGMENTED_SIZE)
                .copy_from(&(&mean_aug - &offset));
        }
        Ok(pts)
    }

    /// Time update over `dt` seconds.
    ///
    /// On error the mean, covariance, and sigma points are left as they were. A predicted
    /// covariance that cannot be factored is an error, since it could not seed the next step.
    pub fn predict(&mut self, dt: f64) -> Result<(), FilterError> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(FilterError::NumericalInstability {
                context: "prediction with a negative or non-finite time step",
            });
        }
        let augmented = self.get_sigma_points()?;

        let mut predicted = DMatrix::<f64>::zeros(STATE_SIZE, SIGMA_POINT_COUNT);
        for (i, point) in augmented.column_iter().enumerate() {
            let state = CtrvState::new(point[0], point[1], point[2], point[3], point[4]);
            let next = ctrv_forward(&state, point[STATE_SIZE], point[STATE_SIZE + 1], dt);
            predicted.set_column(i, &DVector::from(next));
        }

        let mut mu_bar = DVector::<f64>::zeros(STATE_SIZE);
        for (i, sigma_point) in predicted.column_iter().enumerate() {
            mu_bar += self.weights[i] * sigma_point;
        }
        let mut p_bar = DMatrix::<f64>::zeros(STATE_SIZE, STATE_SIZE);
        for (i, sigma_point) in predicted.column_iter().enumerate() {
            let diff = state_residual(&sigma_point.clone_owned(), &mu_bar);
            p_bar += self.weights[i] * &diff * diff.transpose();
        }
        mu_bar[YAW_INDEX] = wrap_to_pi(mu_bar[YAW_INDEX]);

        let p_bar = symmetrize(&p_bar);
        if !mu_bar.iter().all(|v| v.is_finite()) || !is_positive_definite(&p_bar) {
            return Err(FilterError::NumericalInstability {
                context: "prediction",
            });
        }
        debug!("Predicted over dt = {:.6} s", dt);
        self.mean_state = mu_bar;
        self.covariance = p_bar;
        self.predicted_sigma_points = predicted;
        self.sigma_points_current = true;
        Ok(())
    }

    /// Measurement update for a single reading, without any time update or sensor flag checks.
    ///
    /// Radar updates reuse the sigma points from the last prediction. If an update has happened
    /// since then, the sigma points are regenerated with a zero-length prediction first.
    ///
    /// On error the filter keeps its current (predicted) state.
    pub fn update(&mut self, measurement: &Measurement) -> Result<(), FilterError> {
        measurement.validate()?;
        match measurement.sensor() {
            SensorType::Laser => {
                let nis = self.update_laser(measurement.values())?;
                self.nis_laser = Some(nis);
            }
            SensorType::Radar => {
                if !self.sigma_points_current {
                    self.predict(0.0)?;
                }
                let radar = self.radar;
                let nis = self.unscented_update(&radar, measurement.values())?;
                self.nis_radar = Some(nis);
            }
        }
        self.sigma_points_current = false;
        Ok(())
    }

    /// Linear Kalman update with the laser position. Returns the NIS.
    fn update_laser(&mut self, z: &DVector<f64>) -> Result<f64, FilterError> {
        let h = self.laser.observation_matrix();
        let r = self.laser.get_noise();
        let z_pred = &h * &self.mean_state;
        let y = self.laser.residual(z, &z_pred);

        let ph_t = &self.covariance * h.transpose();
        let s = &h * &ph_t + &r;
        let k = kalman_gain(&ph_t, &s)?;

        let mut mean = &self.mean_state + &k * &y;
        mean[YAW_INDEX] = wrap_to_pi(mean[YAW_INDEX]);
        let i_kh = DMatrix::<f64>::identity(STATE_SIZE, STATE_SIZE) - &k * &h;
        let covariance = &i_kh * &self.covariance * i_kh.transpose() + &k * &r * k.transpose();
        let nis = normalized_innovation_squared(&y, &s)?;

        self.commit(mean, covariance, "laser update")?;
        debug!("Laser update: innovation {:?}, NIS {:.4}", y.as_slice(), nis);
        Ok(nis)
    }

    /// Unscented update through a nonlinear measurement model. Returns the NIS.
    fn unscented_update<M: MeasurementModel>(
        &mut self,
        model: &M,
        z: &DVector<f64>,
    ) -> Result<f64, FilterError> {
        let n_z = model.get_dimension();
        let mut measurement_sigma_points = DMatrix::<f64>::zeros(n_z, SIGMA_POINT_COUNT);
        for (i, sigma_point) in self.predicted_sigma_points.column_iter().enumerate() {
            let expected = model.get_expected_measurement(&sigma_point.clone_owned())?;
            measurement_sigma_points.set_column(i, &expected);
        }

        // Mean taken relative to the center point so that angular components average correctly
        let center = measurement_sigma_points.column(0).clone_owned();
        let mut z_hat = center.clone();
        for (i, sigma_point) in measurement_sigma_points.column_iter().enumerate() {
            z_hat += self.weights[i] * model.residual(&sigma_point.clone_owned(), &center);
        }
        let z_hat = model.residual(&z_hat, &DVector::zeros(n_z));

        let mut s = DMatrix::<f64>::zeros(n_z, n_z);
        let mut cross_covariance = DMatrix::<f64>::zeros(STATE_SIZE, n_z);
        for (i, measurement_sigma_point) in measurement_sigma_points.column_iter().enumerate() {
            let measurement_diff = model.residual(&measurement_sigma_point.clone_owned(), &z_hat);
            let state_diff = state_residual(
                &self.predicted_sigma_points.column(i).clone_owned(),
                &self.mean_state,
            );
            s += self.weights[i] * &measurement_diff * measurement_diff.transpose();
            cross_covariance += self.weights[i] * &state_diff * measurement_diff.transpose();
        }
        s += model.get_noise();

        let k = kalman_gain(&cross_covariance, &s)?;
        let y = model.residual(z, &z_hat);

        let mut mean = &self.mean_state + &k * &y;
        mean[YAW_INDEX] = wrap_to_pi(mean[YAW_INDEX]);
        let covariance = &self.covariance - &k * &s * k.transpose();
        let nis = normalized_innovation_squared(&y, &s)?;

        self.commit(mean, covariance, "unscented update")?;
        debug!(
            "{} update: innovation {:?}, NIS {:.4}",
            model.sensor(),
            y.as_slice(),
            nis
        );
        Ok(nis)
    }

    /// Store an updated estimate. The covariance must still factor, otherwise the update is
    /// rejected and the filter keeps its current state.
    fn commit(
        &mut self,
        mean: DVector<f64>,
        covariance: DMatrix<f64>,
        context: &'static str,
    ) -> Result<(), FilterError> {
        let covariance = symmetrize(&covariance);
        if !mean.iter().all(|v| v.is_finite()) || !is_positive_definite(&covariance) {
            return Err(FilterError::NumericalInstability { context });
        }
        self.mean_state = mean;
        self.covariance = covariance;
        Ok(())
    }
}

/// State difference with the heading wrapped into (-pi, pi].
fn state_residual(a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
    let mut diff = a - b;
    diff[YAW_INDEX] = wrap_to_pi(diff[YAW_INDEX]);
    diff
}

/// K = T S^-1 computed as (S^-1 T^T)^T with a Cholesky solve.
fn kalman_gain(cross_covariance: &DMatrix<f64>, s: &DMatrix<f64>) -> Result<DMatrix<f64>, FilterError> {
    let kt = chol_solve_spd(s, &cross_covariance.transpose(), SolveOptions::default()).ok_or(
        FilterError::NumericalInstability {
            context: "innovation covariance inversion",
        },
    )?;
    Ok(kt.transpose())
}

/// NIS = y^T S^-1 y
fn normalized_innovation_squared(y: &DVector<f64>, s: &DMatrix<f64>) -> Result<f64, FilterError> {
    let rhs = DMatrix::from_column_slice(y.len(), 1, y.as_slice());
    let solved = chol_solve_spd(s, &rhs, SolveOptions::default()).ok_or(
        FilterError::NumericalInstability {
            context: "innovation covariance inversion",
        },
    )?;
    Ok(y.dot(&solved.column(0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{is_positive_semidefinite, is_symmetric};
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn new_filter() -> UnscentedKalmanFilter {
        UnscentedKalmanFilter::new(FilterConfig::default()).unwrap()
    }

    fn filter_with_state(state: CtrvState) -> UnscentedKalmanFilter {
        let mut ukf = new_filter();
        ukf.process_measurement(&Measurement::laser(state.x, state.y, 0))
            .unwrap();
        ukf.mean_state = DVector::from(state);
        ukf
    }

    fn assert_covariance_valid(ukf: &UnscentedKalmanFilter) {
        let p = ukf.get_certainty();
        assert!(is_symmetric(&p, 1e-9), "covariance not symmetric: {}", p);
        assert!(is_positive_semidefinite(&p, 1e-9), "covariance not PSD: {}", p);
    }

    #[test]
    fn ukf_construction() {
        let ukf = new_filter();
        assert!(!ukf.is_initialized());
        assert_eq!(ukf.last_timestamp(), None);
        assert_eq!(ukf.lambda(), -2.0);
        let weights = ukf.weights();
        assert_eq!(weights.len(), SIGMA_POINT_COUNT);
        assert_approx_eq!(weights[0], -0.4, 1e-12);
        for i in 1..weights.len() {
            assert_approx_eq!(weights[i], 0.1, 1e-12);
        }
        assert_approx_eq!(weights.sum(), 1.0, 1e-12);
        assert_eq!(ukf.to_string(), "UnscentedKalmanFilter(uninitialized)");
    }

    #[test]
    fn ukf_rejects_invalid_config() {
        let config = FilterConfig {
            std_laspx: -1.0,
            ..FilterConfig::default()
        };
        assert!(matches!(
            UnscentedKalmanFilter::new(config),
            Err(FilterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn initialize_from_laser() {
        let mut ukf = new_filter();
        ukf.process_measurement(&Measurement::laser(1.0, 2.0, 1_000))
            .unwrap();
        assert!(ukf.is_initialized());
        assert_eq!(ukf.get_estimate().as_slice(), &[1.0, 2.0, 0.0, 0.0, 0.0]);
        assert_eq!(ukf.last_timestamp(), Some(1_000));
        let p = ukf.get_certainty();
        assert_approx_eq!(p[(0, 0)], 0.0225, 1e-15);
        assert_approx_eq!(p[(1, 1)], 0.0225, 1e-15);
        assert_eq!(p[(2, 2)], 1000.0);
        assert_eq!(p[(3, 3)], 1.0);
        assert_eq!(p[(4, 4)], 1.0);
        assert_eq!(p[(0, 1)], 0.0);
        // initialization does not produce an innovation
        assert_eq!(ukf.last_nis(SensorType::Laser), None);
    }

    #[test]
    fn initialize_from_radar() {
        let mut ukf = new_filter();
        ukf.process_measurement(&Measurement::radar(5.0, 0.0, 0.0, 0))
            .unwrap();
        assert_eq!(ukf.get_estimate().as_slice(), &[5.0, 0.0, 0.0, 0.0, 0.0]);

        let mut ukf = new_filter();
        ukf.process_measurement(&Measurement::radar(2.0, PI / 2.0, 1.0, 0))
            .unwrap();
        let state = ukf.get_state();
        assert_approx_eq!(state.x, 0.0, 1e-12);
        assert_approx_eq!(state.y, 2.0, 1e-12);
        assert_eq!(state.speed, 0.0);
    }

    #[test]
    fn initialize_ignores_sensor_flags() {
        let config = FilterConfig {
            use_radar: false,
            ..FilterConfig::default()
        };
        let mut ukf = UnscentedKalmanFilter::new(config).unwrap();
        ukf.process_measurement(&Measurement::radar(5.0, 0.0, 0.0, 0))
            .unwrap();
        assert!(ukf.is_initialized());
        assert_eq!(ukf.get_state().x, 5.0);
    }

    #[test]
    fn sigma_points_capture_mean_and_covariance() {
        let ukf = filter_with_state(CtrvState::new(1.0, -1.0, 3.0, 0.5, 0.1));
        let pts = ukf.get_sigma_points().unwrap();
        assert_eq!(pts.nrows(), AUGMENTED_SIZE);
        assert_eq!(pts.ncols(), SIGMA_POINT_COUNT);

        let mean = &pts * ukf.weights();
        assert_approx_eq!(mean[0], 1.0, 1e-12);
        assert_approx_eq!(mean[2], 3.0, 1e-12);
        assert_approx_eq!(mean[5], 0.0, 1e-12);
        assert_approx_eq!(mean[6], 0.0, 1e-12);
        for i in 0..AUGMENTED_SIZE {
            let plus = pts.column(i + 1) - pts.column(0);
            let minus = pts.column(0) - pts.column(i + 1 + AUGMENTED_SIZE);
            assert!((plus - minus).norm() < 1e-12);
        }

        let mut cov = DMatrix::<f64>::zeros(AUGMENTED_SIZE, AUGMENTED_SIZE);
        for (i, column) in pts.column_iter().enumerate() {
            let diff = column - &mean;
            cov += ukf.weights()[i] * &diff * diff.transpose();
        }
        assert_approx_eq!(cov[(0, 0)], 0.0225, 1e-12);
        assert_approx_eq!(cov[(2, 2)], 1000.0, 1e-9);
        assert_approx_eq!(cov[(5, 5)], 9.0, 1e-12);
        assert_approx_eq!(cov[(6, 6)], 6.25, 1e-12);
        assert_approx_eq!(cov[(0, 2)], 0.0, 1e-12);
    }

    #[test]
    fn predict_zero_dt_is_identity() {
        let mut ukf = filter_with_state(CtrvState::new(1.0, 2.0, 3.0, 0.4, 0.2));
        let mean_before = ukf.get_estimate();
        let cov_before = ukf.get_certainty();
        ukf.predict(0.0).unwrap();
        for i in 0..STATE_SIZE {
            assert_approx_eq!(ukf.get_estimate()[i], mean_before[i], 1e-9);
            for j in 0..STATE_SIZE {
                assert_approx_eq!(ukf.get_certainty()[(i, j)], cov_before[(i, j)], 1e-8);
            }
        }
    }

    #[test]
    fn predict_moves_along_heading() {
        let mut ukf = filter_with_state(CtrvState::new(0.0, 0.0, 2.0, 0.0, 0.0));
        ukf.predict(1.0).unwrap();
        let state = ukf.get_state();
        assert_approx_eq!(state.speed, 2.0, 1e-9);
        // straight ahead, shortened by the wide heading uncertainty
        assert!(state.x > 0.5 && state.x < 2.0, "x = {}", state.x);
        assert_approx_eq!(state.y, 0.0, 1e-9);
        assert!(ukf.get_certainty()[(0, 0)] > 0.0225);
        assert_covariance_valid(&ukf);
    }

    #[test]
    fn predict_rejects_negative_dt() {
        let mut ukf = filter_with_state(CtrvState::new(0.0, 0.0, 2.0, 0.0, 0.0));
        assert!(ukf.predict(-0.1).is_err());
        assert!(ukf.predict(f64::NAN).is_err());
        assert_eq!(ukf.get_state().x, 0.0);
    }

    #[test]
    fn predict_wraps_heading_near_pi() {
        let mut near_zero = filter_with_state(CtrvState::new(0.0, 0.0, 2.0, 0.0, 0.3));
        let mut near_pi = filter_with_state(CtrvState::new(0.0, 0.0, 2.0, PI - 0.05, 0.3));
        near_zero.predict(0.5).unwrap();
        near_pi.predict(0.5).unwrap();
        let p_zero = near_zero.get_certainty();
        let p_pi = near_pi.get_certainty();
        // heading variance does not depend on where the heading sits on the circle
        assert_approx_eq!(p_pi[(3, 3)], p_zero[(3, 3)], 1e-9);
        assert_approx_eq!(p_pi[(2, 2)], p_zero[(2, 2)], 1e-9);
        let yaw = near_pi.get_state().yaw;
        assert!(yaw > -PI && yaw <= PI);
        assert_approx_eq!(wrap_to_pi(yaw - (PI - 0.05 + 0.15)), 0.0, 1e-9);
        assert_covariance_valid(&near_pi);
    }

    #[test]
    fn predict_rejects_indefinite_covariance() {
        let mut ukf = filter_with_state(CtrvState::new(1.0, 1.0, 1.0, 0.0, 0.0));
        ukf.covariance[(0, 0)] = -10.0;
        let mean_before = ukf.get_estimate();
        let err = ukf.predict(0.1).unwrap_err();
        assert_eq!(
            err,
            FilterError::NumericalInstability {
                context: "sigma point generation"
            }
        );
        assert_eq!(ukf.get_estimate(), mean_before);
        assert_eq!(ukf.get_certainty()[(0, 0)], -10.0);
    }

    #[test]
    fn process_measurement_keeps_state_on_failed_prediction() {
        let mut ukf = new_filter();
        ukf.process_measurement(&Measurement::laser(1.0, 1.0, 0))
            .unwrap();
        ukf.covariance[(1, 1)] = f64::NAN;
        let result = ukf.process_measurement(&Measurement::laser(1.1, 1.0, 100_000));
        assert!(matches!(result, Err(FilterError::NumericalInstability { .. })));
        assert_eq!(ukf.last_timestamp(), Some(0));
    }

    #[test]
    fn laser_update_pulls_toward_measurement() {
        let mut ukf = new_filter();
        ukf.process_measurement(&Measurement::laser(0.0, 0.0, 0))
            .unwrap();
        ukf.process_measurement(&Measurement::laser(0.5, -0.5, 100_000))
            .unwrap();
        let state = ukf.get_state();
        assert!(state.x > 0.0 && state.x < 0.5, "x = {}", state.x);
        assert!(state.y < 0.0 && state.y > -0.5, "y = {}", state.y);
        let nis = ukf.last_nis(SensorType::Laser).unwrap();
        assert!(nis > 0.0);
        assert_eq!(ukf.last_nis(SensorType::Radar), None);
        assert!(ukf.get_certainty()[(0, 0)] < 0.0225 + 1e-9);
        assert_covariance_valid(&ukf);
    }

    #[test]
    fn laser_update_joseph_form_matches_simple_form() {
        let mut ukf = filter_with_state(CtrvState::new(1.0, 1.0, 1.0, 0.3, 0.0));
        ukf.predict(0.1).unwrap();
        let p = ukf.get_certainty();
        let h = ukf.laser.observation_matrix();
        let s = &h * &p * h.transpose() + ukf.laser.get_noise();
        let k = &p * h.transpose() * s.try_inverse().unwrap();
        let simple = (DMatrix::<f64>::identity(5, 5) - &k * &h) * &p;

        ukf.update(&Measurement::laser(1.2, 0.9, 100_000)).unwrap();
        let joseph = ukf.get_certainty();
        for i in 0..STATE_SIZE {
            for j in 0..STATE_SIZE {
                assert_approx_eq!(joseph[(i, j)], simple[(i, j)], 1e-6);
            }
        }
    }

    #[test]
    fn radar_update_pulls_toward_measurement() {
        let mut ukf = new_filter();
        ukf.process_measurement(&Measurement::laser(10.0, 0.0, 0))
            .unwrap();
        ukf.process_measurement(&Measurement::radar(10.3, 0.02, 1.0, 50_000))
            .unwrap();
        let state = ukf.get_state();
        assert!(state.x > 10.0 && state.x < 10.3, "x = {}", state.x);
        assert!(state.y > 0.0, "y = {}", state.y);
        assert!(state.speed > 0.0, "speed = {}", state.speed);
        assert!(ukf.last_nis(SensorType::Radar).unwrap() > 0.0);
        assert_covariance_valid(&ukf);
    }

    #[test]
    fn radar_update_wraps_bearing_across_pi() {
        let mut ukf = new_filter();
        ukf.process_measurement(&Measurement::laser(-10.0, 0.0, 0))
            .unwrap();
        // object sits just below the negative x-axis: bearing close to -pi
        ukf.process_measurement(&Measurement::radar(10.0, -PI + 0.005, 0.0, 50_000))
            .unwrap();
        let state = ukf.get_state();
        assert!((state.x + 10.0).abs() < 0.2, "x = {}", state.x);
        assert!(state.y.abs() < 0.2, "y = {}", state.y);
        assert!(ukf.last_nis(SensorType::Radar).unwrap() < 50.0);
        assert_covariance_valid(&ukf);
    }

    #[test]
    fn radar_update_rejects_degenerate_range() {
        let mut ukf = new_filter();
        ukf.process_measurement(&Measurement::laser(0.0, 0.0, 0))
            .unwrap();
        let err = ukf
            .process_measurement(&Measurement::radar(1.0, 0.0, 0.0, 0))
            .unwrap_err();
        assert!(matches!(err, FilterError::DegenerateObservation { .. }));
        let state = ukf.get_state();
        assert_approx_eq!(state.x, 0.0, 1e-9);
        assert_approx_eq!(state.y, 0.0, 1e-9);
        assert_eq!(ukf.last_nis(SensorType::Radar), None);
        assert_covariance_valid(&ukf);
    }

    #[test]
    fn update_regenerates_stale_sigma_points() {
        let mut ukf = new_filter();
        ukf.process_measurement(&Measurement::laser(5.0, 5.0, 0))
            .unwrap();
        // no prediction has run yet
        ukf.update(&Measurement::radar(7.1, PI / 4.0, 0.0, 0)).unwrap();
        let state = ukf.get_state();
        assert!((state.x - 5.0).abs() < 0.2 && (state.y - 5.0).abs() < 0.2);
        assert_covariance_valid(&ukf);
    }

    #[test]
    fn out_of_order_measurement_is_rejected() {
        let mut ukf = new_filter();
        ukf.process_measurement(&Measurement::laser(1.0, 1.0, 200))
            .unwrap();
        let before = ukf.get_estimate();
        let err = ukf
            .process_measurement(&Measurement::laser(2.0, 2.0, 100))
            .unwrap_err();
        assert_eq!(
            err,
            FilterError::OutOfOrderMeasurement {
                previous: 200,
                current: 100
            }
        );
        assert_eq!(ukf.get_estimate(), before);
        assert_eq!(ukf.last_timestamp(), Some(200));
    }

    #[test]
    fn invalid_measurement_is_rejected() {
        let mut ukf = new_filter();
        assert!(matches!(
            ukf.process_measurement(&Measurement::laser(f64::NAN, 0.0, 0)),
            Err(FilterError::InvalidMeasurement { .. })
        ));
        assert!(!ukf.is_initialized());
    }

    #[test]
    fn disabled_sensor_predicts_without_update() {
        let config = FilterConfig {
            use_laser: false,
            ..FilterConfig::default()
        };
        let mut ukf = UnscentedKalmanFilter::new(config).unwrap();
        ukf.process_measurement(&Measurement::laser(1.0, 1.0, 0))
            .unwrap();
        ukf.process_measurement(&Measurement::laser(3.0, 3.0, 1_000_000))
            .unwrap();
        assert_eq!(ukf.last_nis(SensorType::Laser), None);
        assert_eq!(ukf.last_timestamp(), Some(1_000_000));
        // the reading was ignored, but uncertainty grew over the elapsed second
        let state = ukf.get_state();
        assert_approx_eq!(state.x, 1.0, 1e-9);
        assert_approx_eq!(state.y, 1.0, 1e-9);
        assert!(ukf.get_certainty()[(0, 0)] > 0.0225);
    }

    #[test]
    fn sensors_are_not_alternately_suppressed() {
        let mut ukf = new_filter();
        ukf.process_measurement(&Measurement::laser(1.0, 0.0, 0))
            .unwrap();
        for step in 1..=3 {
            ukf.process_measurement(&Measurement::laser(1.0 + 0.1 * step as f64, 0.0, step * 100_000))
                .unwrap();
            assert!(ukf.last_nis(SensorType::Laser).is_some());
            ukf.nis_laser = None;
        }
    }

    #[test]
    fn commit_rejects_indefinite_covariance() {
        let mut ukf = filter_with_state(CtrvState::new(1.0, 1.0, 2.0, 0.3, 0.1));
        let mean_before = ukf.get_estimate();
        let cov_before = ukf.get_certainty();
        let mut covariance = cov_before.clone();
        // |P14| above sqrt(P11 P44)
        covariance[(1, 4)] = -3.49;
        covariance[(4, 1)] = -3.49;
        let err = ukf
            .commit(mean_before.add_scalar(0.5), covariance, "unscented update")
            .unwrap_err();
        assert_eq!(
            err,
            FilterError::NumericalInstability {
                context: "unscented update"
            }
        );
        assert_eq!(ukf.get_estimate(), mean_before);
        assert_eq!(ukf.get_certainty(), cov_before);
    }

    #[test]
    fn covariance_stays_factorable_under_inconsistent_measurements() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..300 {
            let mut ukf = new_filter();
            let mut t = 0i64;
            ukf.process_measurement(&Measurement::radar(
                rng.random_range(0.3..5.3),
                rng.random_range(-PI..PI),
                rng.random_range(-2.0..2.0),
                t,
            ))
            .unwrap();
            for step in 0..6 {
                t += rng.random_range(20_000i64..1_500_000);
                let range: f64 = rng.random_range(0.3..5.3);
                let bearing: f64 = rng.random_range(-PI..PI);
                let measurement = if step % 2 == 0 {
                    Measurement::radar(range, bearing, rng.random_range(-3.0..3.0), t)
                } else {
                    Measurement::laser(range * bearing.cos(), range * bearing.sin(), t)
                };
                if let Err(e) = ukf.process_measurement(&measurement) {
                    assert!(matches!(
                        e,
                        FilterError::NumericalInstability { .. }
                            | FilterError::DegenerateObservation { .. }
                    ));
                }
                let p = ukf.get_certainty();
                assert!(is_symmetric(&p, 1e-9));
                assert!(is_positive_semidefinite(&p, 1e-6), "covariance not PSD: {}", p);
                assert!(is_positive_definite(&p));
            }
            // the filter still takes a consistent reading after whatever came before
            let state = ukf.get_state();
            let now = ukf.last_timestamp().unwrap();
            ukf.process_measurement(&Measurement::laser(state.x, state.y, now))
                .unwrap();
            assert!(is_positive_definite(&ukf.get_certainty()));
        }
    }

    #[test]
    fn timestamp_overflow_is_rejected() {
        let mut ukf = new_filter();
        ukf.process_measurement(&Measurement::laser(1.0, 1.0, i64::MIN))
            .unwrap();
        let err = ukf
            .process_measurement(&Measurement::laser(1.0, 1.0, i64::MAX))
            .unwrap_err();
        assert_eq!(
            err,
            FilterError::NumericalInstability {
                context: "time step overflow"
            }
        );
        assert_eq!(ukf.last_timestamp(), Some(i64::MIN));
        ukf.process_measurement(&Measurement::laser(1.0, 1.0, i64::MIN + 100_000))
            .unwrap();
    }

    #[test]
    fn display_after_initialization() {
        let mut ukf = new_filter();
        ukf.process_measurement(&Measurement::laser(1.0, 2.0, 7))
            .unwrap();
        let text = ukf.to_string();
        assert!(text.starts_with("UnscentedKalmanFilter(t: 7 us"), "{}", text);
    }
}
