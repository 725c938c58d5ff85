//! Extended Kalman filter over roll, pitch and yaw.
//!
//! The state is the Euler angle triple $(\phi, \theta, \psi)$ with a 3x3 error
//! covariance $P$. Every [`Ekf::step`] first propagates the angles with the
//! gyroscope rates, then corrects them with whichever of the accelerometer and
//! magnetometer flagged new data:
//!
//! - the accelerometer corrects roll and pitch only, since gravity carries no
//!   information about heading;
//! - the magnetometer is compared in the yaw-only ("vehicle-1") frame and
//!   corrects yaw only.
//!
//! Splitting the update this way keeps every matrix at 3x3 so the whole
//! filter runs on the [`matrix3`](crate::matrix3) kernel.
//!
//! # Limitations
//!
//! The Euler rate transform divides by $\cos\theta$ and is singular at
//! $\theta = \pm\pi/2$. Nothing guards against it; near that pitch the rates
//! and the covariance blow up. Zero measurement covariances make the
//! innovation covariance singular with the same effect. Use
//! [`Ekf::is_finite`] to detect a diverged filter.

use std::f64::consts::{PI, TAU};

use nalgebra::UnitQuaternion;

use crate::{
    error::{check_covariance, check_finite, ConfigResult},
    matrix3::{
        add, determinant, diagonal, elementwise_mul, identity, inverse, mul, mul_vec, scale,
        sub, sub_vec, transpose, Mat3, Vec3,
    },
    Attitude, EulerAngles, STANDARD_GRAVITY,
};

/// How angles are brought back into `(-π, π]` after every update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AngleWrap {
    /// Shift by `2π`, preserving the orientation the angle describes.
    #[default]
    FullTurn,
    /// Shift by `π`.
    ///
    /// This reproduces the behaviour of older firmware. It only lands on an
    /// equivalent orientation when the angle crossed `±π` by a small amount
    /// and is kept for comparing recorded runs. Both `-π` and `π` are left
    /// as they are, so the range is `[-π, π]`.
    HalfTurn,
}

impl AngleWrap {
    /// Wrap `angle` into `(-π, π]`, or `[-π, π]` for [`Self::HalfTurn`].
    ///
    /// Angles already in range are returned unchanged. Non-finite angles are
    /// returned as they are.
    #[must_use]
    pub fn wrap(self, mut angle: f64) -> f64 {
        if !angle.is_finite() {
            return angle;
        }

        let period = match self {
            Self::FullTurn => TAU,
            Self::HalfTurn => PI,
        };

        if angle.abs() > 64.0 * TAU {
            angle %= period;
        }

        while angle > PI {
            angle -= period;
        }
        match self {
            Self::FullTurn => {
                while angle <= -PI {
                    angle += period;
                }
            }
            Self::HalfTurn => {
                while angle < -PI {
                    angle += period;
                }
            }
        }

        angle
    }
}

/// Sensor calibration and noise tuning for the [`Ekf`].
///
/// Immutable once the filter is built.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EkfConfig {
    /// Per-axis gyroscope scale factors.
    pub gyro_scales: Vec3,
    /// Gyroscope bias in rad/s, subtracted before scaling.
    pub gyro_biases: Vec3,
    /// Gyroscope cross-axis alignment.
    pub gyro_alignment: Mat3,
    /// Accelerometer bias.
    pub acc_biases: Vec3,
    /// Accelerometer alignment.
    pub acc_alignment: Mat3,
    /// Magnetometer bias.
    pub mag_biases: Vec3,
    /// Magnetometer alignment (soft-iron calibration).
    pub mag_alignment: Mat3,
    /// Gravity as read by the accelerometer in the earth frame.
    pub acc_ref: Vec3,
    /// Magnetic field in the earth frame.
    pub mag_ref: Vec3,
    /// Process noise, used as `Q = q I`.
    pub process_covariance: f64,
    /// Accelerometer measurement noise, used as `R_acc = r I`.
    pub acc_covariance: f64,
    /// Magnetometer measurement noise, used as `R_mag = r I`.
    pub mag_covariance: f64,
    /// Initial variance of every angle.
    pub initial_covariance: f64,
    /// Angle wrapping policy.
    pub angle_wrap: AngleWrap,
}

impl Default for EkfConfig {
    fn default() -> Self {
        Self {
            gyro_scales: Vec3::from_element(1.0),
            gyro_biases: Vec3::zeros(),
            gyro_alignment: identity(),
            acc_biases: Vec3::zeros(),
            acc_alignment: identity(),
            mag_biases: Vec3::zeros(),
            mag_alignment: identity(),
            acc_ref: Vec3::new(0.0, 0.0, -STANDARD_GRAVITY),
            mag_ref: Vec3::new(1.0, 0.0, 0.0),
            process_covariance: 1e-3,
            acc_covariance: 1.0,
            mag_covariance: 1.0,
            initial_covariance: 0.01,
            angle_wrap: AngleWrap::default(),
        }
    }
}

impl EkfConfig {
    /// Check that every covariance is strictly positive and every calibration
    /// entry is finite.
    ///
    /// # Errors
    ///
    /// Returns the first offending parameter.
    pub fn validate(&self) -> ConfigResult<()> {
        check_covariance("process_covariance", self.process_covariance)?;
        check_covariance("acc_covariance", self.acc_covariance)?;
        check_covariance("mag_covariance", self.mag_covariance)?;
        check_covariance("initial_covariance", self.initial_covariance)?;

        check_finite("gyro_scales", self.gyro_scales.iter())?;
        check_finite("gyro_biases", self.gyro_biases.iter())?;
        check_finite("gyro_alignment", self.gyro_alignment.iter())?;
        check_finite("acc_biases", self.acc_biases.iter())?;
        check_finite("acc_alignment", self.acc_alignment.iter())?;
        check_finite("mag_biases", self.mag_biases.iter())?;
        check_finite("mag_alignment", self.mag_alignment.iter())?;
        check_finite("acc_ref", self.acc_ref.iter())?;
        check_finite("mag_ref", self.mag_ref.iter())
    }

    /// Bias- and alignment-corrected accelerometer sample.
    fn corrected_acc(&self, acc: &Vec3) -> Vec3 {
        mul_vec(&self.acc_alignment, &sub_vec(acc, &self.acc_biases))
    }

    /// Bias- and alignment-corrected magnetometer sample.
    fn corrected_mag(&self, mag: &Vec3) -> Vec3 {
        mul_vec(&self.mag_alignment, &sub_vec(mag, &self.mag_biases))
    }

    /// Body rates `p, q, r` from a raw gyroscope sample.
    fn body_rates(&self, gyro: &Vec3) -> Vec3 {
        let scaled = elementwise_mul(&self.gyro_scales, &sub_vec(gyro, &self.gyro_biases));
        mul_vec(&self.gyro_alignment, &scaled)
    }
}

/// Raw readings for one control-loop iteration.
///
/// The gyroscope is assumed fresh on every sample. The accelerometer and
/// magnetometer readings are only used when their flag is set, and
/// [`Ekf::step`] clears the flags once the reading has been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawSensorSample {
    /// Angular rate in rad/s.
    pub gyro: Vec3,
    /// Whether `acc` holds a reading not yet consumed.
    pub new_acc_data: bool,
    /// Acceleration.
    pub acc: Vec3,
    /// Whether `mag` holds a reading not yet consumed.
    pub new_mag_data: bool,
    /// Magnetic field.
    pub mag: Vec3,
}

impl RawSensorSample {
    /// A sample carrying only a gyroscope reading.
    #[must_use]
    pub fn from_gyro(gyro: Vec3) -> Self {
        Self {
            gyro,
            ..Self::default()
        }
    }

    /// Attach a fresh accelerometer reading.
    #[must_use]
    pub fn with_acc(mut self, acc: Vec3) -> Self {
        self.acc = acc;
        self.new_acc_data = true;
        self
    }

    /// Attach a fresh magnetometer reading.
    #[must_use]
    pub fn with_mag(mut self, mag: Vec3) -> Self {
        self.mag = mag;
        self.new_mag_data = true;
        self
    }
}

/// The estimate carried between steps.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EkfState {
    /// Roll angle $\phi$.
    pub roll: f64,
    /// Pitch angle $\theta$.
    pub pitch: f64,
    /// Yaw angle $\psi$.
    pub yaw: f64,
    /// $\dot\phi$ from the last prediction.
    pub roll_rate: f64,
    /// $\dot\theta$ from the last prediction.
    pub pitch_rate: f64,
    /// $\dot\psi$ from the last prediction.
    pub yaw_rate: f64,
    /// Process noise.
    pub q: Mat3,
    /// Accelerometer measurement noise.
    pub r_acc: Mat3,
    /// Magnetometer measurement noise.
    pub r_mag: Mat3,
    /// Error covariance.
    pub p: Mat3,
}

impl EkfState {
    /// A zeroed state with noise matrices taken from `config`.
    #[must_use]
    pub fn new(config: &EkfConfig) -> Self {
        Self {
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            roll_rate: 0.0,
            pitch_rate: 0.0,
            yaw_rate: 0.0,
            q: diagonal(config.process_covariance),
            r_acc: diagonal(config.acc_covariance),
            r_mag: diagonal(config.mag_covariance),
            p: diagonal(config.initial_covariance),
        }
    }

    fn unroll(&mut self, wrap: AngleWrap) {
        self.roll = wrap.wrap(self.roll);
        self.pitch = wrap.wrap(self.pitch);
        self.yaw = wrap.wrap(self.yaw);
    }
}

/// Rotation from the earth frame into the body frame for the given angles.
#[must_use]
pub fn inertial_to_body(angles: &EulerAngles<f64>) -> Mat3 {
    let (s_phi, c_phi) = angles.roll.sin_cos();
    let (s_theta, c_theta) = angles.pitch.sin_cos();
    let (s_psi, c_psi) = angles.yaw.sin_cos();

    Mat3::new(
        c_psi * c_theta,
        c_theta * s_psi,
        -s_theta,
        c_psi * s_phi * s_theta - c_phi * s_psi,
        c_phi * c_psi + s_phi * s_psi * s_theta,
        c_theta * s_phi,
        s_phi * s_psi + c_phi * c_psi * s_theta,
        c_phi * s_psi * s_theta - c_psi * s_phi,
        c_phi * c_theta,
    )
}

/// The orientation EKF.
///
/// # Example
///
/// ```
/// use mems_ahrs::{Attitude, Ekf, EkfConfig, RawSensorSample};
/// use nalgebra::Vector3;
///
/// let mut ekf = Ekf::new(EkfConfig::default());
///
/// for _ in 0..100 {
///     let mut sample = RawSensorSample::from_gyro(Vector3::zeros())
///         .with_acc(Vector3::new(0.0, 0.0, -9.8065));
///     ekf.step(&mut sample, 0.01);
///     assert!(!sample.new_acc_data);
/// }
///
/// let angles = ekf.euler_angles();
/// assert!(angles.roll.abs() < 1e-9 && angles.pitch.abs() < 1e-9);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ekf {
    /// Calibration and tuning.
    config: EkfConfig,
    /// The current estimate.
    pub state: EkfState,
}

impl Ekf {
    /// Cold-start the filter at zero roll, pitch and yaw.
    ///
    /// The configuration is not validated, see [`Self::try_new`].
    #[must_use]
    pub fn new(config: EkfConfig) -> Self {
        log::debug!(
            "ekf cold start: q = {}, r_acc = {}, r_mag = {}",
            config.process_covariance,
            config.acc_covariance,
            config.mag_covariance
        );

        Self {
            state: EkfState::new(&config),
            config,
        }
    }

    /// Validate `config`, then cold-start the filter.
    ///
    /// # Errors
    ///
    /// See [`EkfConfig::validate`].
    pub fn try_new(config: EkfConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Start the filter with roll and pitch taken from the accelerometer
    /// reading in `sample`, and zero yaw.
    ///
    /// The angles are the ones for which the accelerometer measurement model
    /// predicts exactly this reading, assuming the configured gravity
    /// reference is vertical.
    #[must_use]
    pub fn from_sample(config: EkfConfig, sample: &RawSensorSample) -> Self {
        let mut ekf = Self::new(config);
        ekf.reset_from_sample(sample);
        ekf
    }

    /// Reset to the cold-start state.
    pub fn reset(&mut self) {
        self.state = EkfState::new(&self.config);
    }

    /// Reset, seeding roll and pitch from the accelerometer reading in
    /// `sample`. See [`Self::from_sample`].
    pub fn reset_from_sample(&mut self, sample: &RawSensorSample) {
        self.state = EkfState::new(&self.config);

        let acc = self.config.corrected_acc(&sample.acc);
        let reference = self.config.corrected_acc(&self.config.acc_ref);
        let sign = reference.z.signum();

        self.state.roll = (sign * acc.y).atan2(sign * acc.z);
        self.state.pitch = (-sign * acc.x).atan2(acc.y.hypot(acc.z));
        self.state.unroll(self.config.angle_wrap);

        log::debug!(
            "ekf seeded from accelerometer: roll = {}, pitch = {}",
            self.state.roll,
            self.state.pitch
        );
    }

    /// The filter configuration.
    #[must_use]
    pub fn config(&self) -> &EkfConfig {
        &self.config
    }

    /// Advance the filter by `dt` seconds.
    ///
    /// Predicts with the gyroscope reading, then corrects with the
    /// accelerometer and the magnetometer if their new-data flags are set.
    /// Consumed flags are cleared.
    pub fn step(&mut self, sample: &mut RawSensorSample, dt: f64) {
        self.predict(&sample.gyro, dt);

        if sample.new_acc_data {
            sample.new_acc_data = false;
            self.correct_acc(&sample.acc);
        }

        if sample.new_mag_data {
            sample.new_mag_data = false;
            self.correct_mag(&sample.mag);
        }

        log::trace!(
            "ekf: roll = {}, pitch = {}, yaw = {}",
            self.state.roll,
            self.state.pitch,
            self.state.yaw
        );
    }

    /// Propagate angles and covariance by `dt` seconds using a raw gyroscope
    /// reading.
    pub fn predict(&mut self, gyro: &Vec3, dt: f64) {
        let rates = self.config.body_rates(gyro);
        let (p, q, r) = (rates.x, rates.y, rates.z);

        let state = &mut self.state;
        let (s_phi, c_phi) = state.roll.sin_cos();
        let (s_theta, c_theta) = state.pitch.sin_cos();
        let t_theta = s_theta / c_theta;

        // body rates to Euler angle rates
        state.roll_rate = p + s_phi * t_theta * q + c_phi * t_theta * r;
        state.pitch_rate = c_phi * q - s_phi * r;
        state.yaw_rate = (s_phi / c_theta) * q + (c_phi / c_theta) * r;

        // linearize the rate equations around the current angles, yaw does
        // not appear on the right-hand side so its column stays zero
        let sec_squared = t_theta * t_theta + 1.0;
        let c_theta_squared = c_theta * c_theta;

        #[rustfmt::skip]
        let a = Mat3::new(
            q * c_phi * t_theta - r * s_phi * t_theta,
            r * c_phi * sec_squared + q * s_phi * sec_squared,
            0.0,

            -r * c_phi - q * s_phi,
            0.0,
            0.0,

            q * c_phi / c_theta - r * s_phi / c_theta,
            r * c_phi * s_theta / c_theta_squared + q * s_phi * s_theta / c_theta_squared,
            0.0,
        );

        state.roll += dt * state.roll_rate;
        state.pitch += dt * state.pitch_rate;
        state.yaw += dt * state.yaw_rate;

        // P = P + dt (A P + P A^T + Q)
        let ap = mul(&a, &state.p);
        let pa_t = mul(&state.p, &transpose(&a));
        let derivative = add(&add(&ap, &pa_t), &state.q);
        state.p = add(&state.p, &scale(dt, &derivative));

        state.unroll(self.config.angle_wrap);
    }

    /// Correct roll and pitch with an accelerometer reading.
    ///
    /// The gain is computed for all three angles but the yaw component of
    /// the correction is discarded, gravity does not observe heading.
    pub fn correct_acc(&mut self, acc: &Vec3) {
        let angles = self.euler_angles();
        let (s_phi, c_phi) = angles.roll.sin_cos();
        let (s_theta, c_theta) = angles.pitch.sin_cos();
        let (s_psi, c_psi) = angles.yaw.sin_cos();

        let reference = self.config.corrected_acc(&self.config.acc_ref);
        let expected = mul_vec(&inertial_to_body(&angles), &reference);
        let (ax, ay, az) = (reference.x, reference.y, reference.z);

        // d(expected) / d(roll, pitch, yaw)
        #[rustfmt::skip]
        let c = Mat3::new(
            0.0,
            -az * c_theta - ax * c_psi * s_theta - ay * s_psi * s_theta,
            ay * c_psi * c_theta - ax * c_theta * s_psi,

            ax * (s_phi * s_psi + c_phi * c_psi * s_theta)
                - ay * (c_psi * s_phi - c_phi * s_psi * s_theta)
                + az * c_phi * c_theta,
            ax * c_psi * c_theta * s_phi - az * s_phi * s_theta + ay * c_theta * s_phi * s_psi,
            -ax * (c_phi * c_psi + s_phi * s_psi * s_theta)
                - ay * (c_phi * s_psi - c_psi * s_phi * s_theta),

            ax * (c_phi * s_psi - c_psi * s_phi * s_theta)
                - ay * (c_phi * c_psi + s_phi * s_psi * s_theta)
                - az * c_theta * s_phi,
            ax * c_phi * c_psi * c_theta - az * c_phi * s_theta + ay * c_phi * c_theta * s_psi,
            ax * (c_psi * s_phi - c_phi * s_psi * s_theta)
                + ay * (s_phi * s_psi + c_phi * c_psi * s_theta),
        );

        let noise = self.state.r_acc;
        let gain = self.update_covariance(&c, &noise);

        let innovation = sub_vec(&self.config.corrected_acc(acc), &expected);
        let correction = mul_vec(&gain, &innovation);

        self.state.roll += correction.x;
        self.state.pitch += correction.y;
        self.state.unroll(self.config.angle_wrap);
    }

    /// Correct yaw with a magnetometer reading.
    ///
    /// Both the reference field and the measurement are expressed in the
    /// vehicle-1 frame, the body frame with roll and pitch undone, so only
    /// yaw is observed.
    pub fn correct_mag(&mut self, mag: &Vec3) {
        let (s_phi, c_phi) = self.state.roll.sin_cos();
        let (s_theta, c_theta) = self.state.pitch.sin_cos();
        let (s_psi, c_psi) = self.state.yaw.sin_cos();

        let reference = self.config.corrected_mag(&self.config.mag_ref);

        #[rustfmt::skip]
        let c = Mat3::new(
            0.0, 0.0, reference.y * c_psi - reference.x * s_psi,
            0.0, 0.0, -reference.x * c_psi - reference.y * s_psi,
            0.0, 0.0, 0.0,
        );

        #[rustfmt::skip]
        let earth_to_vehicle1 = Mat3::new(
            c_psi, s_psi, 0.0,
            -s_psi, c_psi, 0.0,
            0.0, 0.0, 1.0,
        );
        let expected = mul_vec(&earth_to_vehicle1, &reference);

        #[rustfmt::skip]
        let body_to_vehicle1 = Mat3::new(
            c_theta, s_phi * s_theta, c_phi * s_theta,
            0.0, c_phi, -s_phi,
            -s_theta, c_theta * s_phi, c_phi * c_theta,
        );
        let measured = mul_vec(&body_to_vehicle1, &self.config.corrected_mag(mag));

        let noise = self.state.r_mag;
        let gain = self.update_covariance(&c, &noise);

        let correction = mul_vec(&gain, &sub_vec(&measured, &expected));

        self.state.yaw += correction.z;
        self.state.unroll(self.config.angle_wrap);
    }

    /// Compute the Kalman gain `L = P C^T (C P C^T + R)^-1` for the
    /// measurement Jacobian `c` and apply `P = (I - L C) P`.
    fn update_covariance(&mut self, c: &Mat3, noise: &Mat3) -> Mat3 {
        let p = &self.state.p;
        let p_c_t = mul(p, &transpose(c));
        let innovation_covariance = add(&mul(c, &p_c_t), noise);

        let det = determinant(&innovation_covariance);
        if det == 0.0 || !det.is_finite() {
            log::warn!("ekf innovation covariance is singular (det = {det})");
        }

        let gain = mul(&p_c_t, &inverse(&innovation_covariance));
        self.state.p = mul(&sub(&identity(), &mul(&gain, c)), p);
        gain
    }

    /// Current angle rates from the last prediction.
    #[must_use]
    pub fn euler_rates(&self) -> EulerAngles<f64> {
        EulerAngles {
            roll: self.state.roll_rate,
            pitch: self.state.pitch_rate,
            yaw: self.state.yaw_rate,
        }
    }

    /// Current error covariance.
    #[must_use]
    pub fn covariance(&self) -> &Mat3 {
        &self.state.p
    }

    /// Returns `false` once any angle or covariance entry became `inf` or
    /// `NaN`.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        let s = &self.state;
        [s.roll, s.pitch, s.yaw].iter().all(|x| x.is_finite())
            && s.p.iter().all(|x| x.is_finite())
    }
}

impl Attitude for Ekf {
    type Scalar = f64;

    fn euler_angles(&self) -> EulerAngles<f64> {
        EulerAngles {
            roll: self.state.roll,
            pitch: self.state.pitch,
            yaw: self.state.yaw,
        }
    }

    fn orientation(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_euler_angles(self.state.roll, self.state.pitch, self.state.yaw)
    }
}
