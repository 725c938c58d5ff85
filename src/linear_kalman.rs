//! Two-state linear Kalman filter for tracking position and velocity along a
//! single axis, driven by a measured acceleration.
//!
//! The system model is
//!
//! $$
//! \begin{bmatrix} p \\\\ v \end{bmatrix}_{k+1} =
//! \begin{bmatrix} 1 & \Delta t \\\\ 0 & 1 \end{bmatrix}
//! \begin{bmatrix} p \\\\ v \end{bmatrix}_k +
//! \begin{bmatrix} \frac{1}{2} \Delta t^2 \\\\ \Delta t \end{bmatrix} a
//! $$
//!
//! and every step is a predict followed by a correct against a measurement
//! `z = H x`.

use nalgebra::{Matrix2, Matrix2x1, Vector2};

use crate::error::{check_covariance, check_finite, ConfigResult};

/// Configuration of a [`LinearKalman`] filter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinearKalmanConfig {
    /// Process noise `q`, used as `Q = q I`.
    pub process_noise: f64,
    /// Measurement noise `r`, used as `R = r I`.
    pub measurement_noise: f64,
    /// Observer matrix `H` mapping the state onto the measurement.
    ///
    /// The identity means both position and velocity are measured directly.
    /// See [`Self::position_only`] for a filter fed by position alone.
    pub observer: Matrix2<f64>,
    /// Initial position.
    pub position: f64,
    /// Initial velocity.
    pub velocity: f64,
}

impl LinearKalmanConfig {
    /// A filter that measures position and velocity directly (`H = I`).
    #[must_use]
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            process_noise,
            measurement_noise,
            observer: Matrix2::identity(),
            position: 0.0,
            velocity: 0.0,
        }
    }

    /// A filter that only trusts the position measurement, `H = diag(1, 0)`.
    ///
    /// The velocity passed to [`LinearKalman::correct`] is ignored.
    #[must_use]
    pub fn position_only(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            observer: Matrix2::new(1.0, 0.0, 0.0, 0.0),
            ..Self::new(process_noise, measurement_noise)
        }
    }

    /// Set the initial state.
    #[must_use]
    pub fn with_initial_state(mut self, position: f64, velocity: f64) -> Self {
        self.position = position;
        self.velocity = velocity;
        self
    }

    /// Check that both noise terms are strictly positive and everything else
    /// is finite.
    ///
    /// # Errors
    ///
    /// Returns the first offending parameter.
    pub fn validate(&self) -> ConfigResult<()> {
        check_covariance("process_noise", self.process_noise)?;
        check_covariance("measurement_noise", self.measurement_noise)?;
        check_finite("observer", self.observer.iter())?;
        check_finite("initial state", &[self.position, self.velocity])
    }
}

impl Default for LinearKalmanConfig {
    fn default() -> Self {
        Self::new(1e-3, 1.0)
    }
}

/// One step's worth of input for [`LinearKalman::step`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinearKalmanInput {
    /// Time elapsed since the previous step, in seconds.
    pub dt: f64,
    /// Measured position.
    pub position: f64,
    /// Measured velocity.
    pub velocity: f64,
    /// Control input: acceleration along the tracked axis.
    pub acceleration: f64,
}

/// Filtered position and velocity.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinearKalmanOutput {
    /// Estimated position.
    pub position: f64,
    /// Estimated velocity.
    pub velocity: f64,
}

/// Two-state position/velocity Kalman filter.
///
/// # Example
///
/// ```
/// use mems_ahrs::linear_kalman::{LinearKalman, LinearKalmanConfig, LinearKalmanInput};
///
/// let mut altitude = LinearKalman::new(&LinearKalmanConfig::position_only(1e-3, 0.5));
///
/// let out = altitude.step(&LinearKalmanInput {
///     dt: 0.01,
///     position: 12.0,
///     velocity: 0.0,
///     acceleration: 0.0,
/// });
/// assert!(out.position > 0.0 && out.position < 12.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinearKalman {
    /// State `[position, velocity]`.
    x: Vector2<f64>,
    /// Error covariance.
    p: Matrix2<f64>,
    /// Process noise.
    q: Matrix2<f64>,
    /// Measurement noise.
    r: Matrix2<f64>,
    /// System matrix, `a[(0, 1)]` is refreshed from `dt` every step.
    a: Matrix2<f64>,
    /// Control matrix, refreshed from `dt` every step.
    b: Matrix2x1<f64>,
    /// Observer matrix.
    h: Matrix2<f64>,
}

impl LinearKalman {
    /// Create a filter from `config`, with `P = I`.
    ///
    /// The configuration is not validated, see [`Self::try_new`].
    #[must_use]
    pub fn new(config: &LinearKalmanConfig) -> Self {
        log::debug!(
            "linear kalman filter: q = {}, r = {}, H = {:?}",
            config.process_noise,
            config.measurement_noise,
            config.observer
        );

        Self {
            x: Vector2::new(config.position, config.velocity),
            p: Matrix2::identity(),
            q: Matrix2::from_diagonal_element(config.process_noise),
            r: Matrix2::from_diagonal_element(config.measurement_noise),
            a: Matrix2::identity(),
            b: Matrix2x1::zeros(),
            h: config.observer,
        }
    }

    /// Validate `config`, then create the filter.
    ///
    /// # Errors
    ///
    /// See [`LinearKalmanConfig::validate`].
    pub fn try_new(config: &LinearKalmanConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Run one predict and correct cycle and return the corrected state.
    pub fn step(&mut self, input: &LinearKalmanInput) -> LinearKalmanOutput {
        self.predict(input.dt, input.acceleration);
        self.correct(input.position, input.velocity);
        self.output()
    }

    /// Propagate the state by `dt` seconds under `acceleration`.
    pub fn predict(&mut self, dt: f64, acceleration: f64) {
        self.a[(0, 1)] = dt;
        self.b = Matrix2x1::new(0.5 * dt * dt, dt);

        // x = A x + B u
        self.x = self.a * self.x + self.b * acceleration;
        // P = A P A^T + Q
        self.p = self.a * self.p * self.a.transpose() + self.q;
    }

    /// Blend a measurement of position and velocity into the state.
    ///
    /// If the innovation covariance `H P H^T + R` is singular the measurement
    /// is dropped for this step and the predicted state is kept.
    pub fn correct(&mut self, position: f64, velocity: f64) {
        let z = Vector2::new(position, velocity);
        let h_t = self.h.transpose();

        // K = P H^T (H P H^T + R)^-1
        let s = self.h * self.p * h_t + self.r;
        let Some(s_inv) = s.try_inverse() else {
            log::warn!("singular innovation covariance {s:?}, skipping correction");
            return;
        };
        let k = self.p * h_t * s_inv;

        // x = x + K (z - H x)
        self.x += k * (z - self.h * self.x);
        // P = (I - K H) P
        self.p = (Matrix2::identity() - k * self.h) * self.p;
    }

    /// The current state estimate.
    #[must_use]
    pub fn output(&self) -> LinearKalmanOutput {
        LinearKalmanOutput {
            position: self.x[0],
            velocity: self.x[1],
        }
    }

    /// Estimated position.
    #[must_use]
    pub fn position(&self) -> f64 {
        self.x[0]
    }

    /// Estimated velocity.
    #[must_use]
    pub fn velocity(&self) -> f64 {
        self.x[1]
    }

    /// Current error covariance.
    #[must_use]
    pub fn covariance(&self) -> &Matrix2<f64> {
        &self.p
    }
}
