//! Madgwick's gradient-descent orientation filter.
//!
//! The filter integrates the gyroscope rate as a quaternion derivative and
//! pulls it towards the orientation that best explains the measured gravity
//! (and magnetic field) direction. The pull is a normalized gradient step
//! scaled by a single gain `beta`: large values converge fast but let
//! accelerometer and magnetometer noise through, small values trust the
//! gyroscope.
//!
//! The correction is skipped whenever the accelerometer magnitude is further
//! than [`MadgwickConfig::accel_cutoff`] from gravity, so that linear
//! acceleration does not tilt the estimate.

use std::time::Duration;

use nalgebra::{Matrix3x4, Matrix6x4, Quaternion, UnitQuaternion, Vector3, Vector6};

use crate::{
    error::{check_covariance, check_gain, ConfigResult},
    quaternion::{from_accel_mag, rotate_vector, to_euler},
    Attitude, EulerAngles, STANDARD_GRAVITY,
};

/// Parameters of the [`Madgwick`] filter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MadgwickConfig {
    /// Gain of the gradient step, in rad/s.
    pub beta: f32,
    /// Maximum deviation of the accelerometer magnitude from
    /// [`Self::gravity`] for the correction to run, in m/s^2.
    pub accel_cutoff: f32,
    /// Expected accelerometer magnitude at rest, in m/s^2.
    pub gravity: f32,
}

impl Default for MadgwickConfig {
    #[allow(clippy::cast_possible_truncation)]
    fn default() -> Self {
        Self {
            beta: 0.1,
            accel_cutoff: 1.5,
            gravity: STANDARD_GRAVITY as f32,
        }
    }
}

impl MadgwickConfig {
    /// Check that the gain is non-negative and the cutoff positive.
    ///
    /// # Errors
    ///
    /// Returns the first offending parameter.
    pub fn validate(&self) -> ConfigResult<()> {
        check_gain("beta", f64::from(self.beta))?;
        check_covariance("accel_cutoff", f64::from(self.accel_cutoff))?;
        check_covariance("gravity", f64::from(self.gravity))
    }
}

/// A linear ramp of `beta` from a fast-convergence value down to its steady
/// value.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BetaSchedule {
    /// Gain at start-up.
    pub initial: f32,
    /// Gain once the ramp has finished.
    pub steady: f32,
    /// Length of the ramp.
    pub duration: Duration,
}

impl BetaSchedule {
    /// The gain after `elapsed` of filtering.
    #[must_use]
    pub fn beta_at(&self, elapsed: Duration) -> f32 {
        if elapsed >= self.duration {
            return self.steady;
        }

        let progress = elapsed.as_secs_f32() / self.duration.as_secs_f32();
        self.initial + (self.steady - self.initial) * progress
    }
}

/// The gradient-descent filter.
///
/// # Example
///
/// ```
/// use mems_ahrs::{Attitude, Madgwick, MadgwickConfig};
/// use nalgebra::Vector3;
///
/// let mut filter = Madgwick::new(MadgwickConfig::default());
/// filter.update_imu(
///     &Vector3::new(0.0, 0.0, 0.1),
///     &Vector3::new(0.0, 0.0, -9.81),
///     0.01,
/// );
///
/// assert!((filter.quaternion().norm() - 1.0).abs() < 1e-5);
/// assert!(filter.euler_angles().yaw > 0.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Madgwick {
    config: MadgwickConfig,
    /// Orientation of the sensor frame relative to the earth frame.
    q: Quaternion<f32>,
    schedule: Option<BetaSchedule>,
    /// Time integrated so far, drives the schedule.
    elapsed: Duration,
}

impl Madgwick {
    /// Start at the identity orientation.
    #[must_use]
    pub fn new(config: MadgwickConfig) -> Self {
        Self::with_orientation(config, UnitQuaternion::identity())
    }

    /// Validate `config`, then start at the identity orientation.
    ///
    /// # Errors
    ///
    /// See [`MadgwickConfig::validate`].
    pub fn try_new(config: MadgwickConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Start at the orientation given by one accelerometer and magnetometer
    /// sample, see [`from_accel_mag`].
    #[must_use]
    pub fn from_sample(config: MadgwickConfig, accel: &Vector3<f32>, mag: &Vector3<f32>) -> Self {
        Self::with_orientation(config, from_accel_mag(accel, mag))
    }

    /// Start at `orientation`.
    #[must_use]
    pub fn with_orientation(config: MadgwickConfig, orientation: UnitQuaternion<f32>) -> Self {
        log::debug!(
            "madgwick filter: beta = {}, start = {:?}",
            config.beta,
            orientation
        );

        Self {
            config,
            q: orientation.into_inner(),
            schedule: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Drive `beta` from `schedule` instead of keeping it fixed.
    #[must_use]
    pub fn with_schedule(mut self, schedule: BetaSchedule) -> Self {
        self.config.beta = schedule.beta_at(self.elapsed);
        self.schedule = Some(schedule);
        self
    }

    /// Current gain.
    #[must_use]
    pub fn beta(&self) -> f32 {
        self.config.beta
    }

    /// Override the gain. Removes any schedule.
    pub fn set_beta(&mut self, beta: f32) {
        self.schedule = None;
        self.config.beta = beta;
    }

    /// The filter parameters.
    #[must_use]
    pub fn config(&self) -> &MadgwickConfig {
        &self.config
    }

    /// The raw unit quaternion `(w, x, y, z)`.
    #[must_use]
    pub fn quaternion(&self) -> &Quaternion<f32> {
        &self.q
    }

    /// Update with gyroscope (rad/s), accelerometer and magnetometer readings.
    ///
    /// A magnetometer reading of exactly zero means "no data" and falls back
    /// to [`Self::update_imu`].
    pub fn update(
        &mut self,
        gyro: &Vector3<f32>,
        accel: &Vector3<f32>,
        mag: &Vector3<f32>,
        dt: f32,
    ) {
        if *mag == Vector3::zeros() {
            self.update_imu(gyro, accel, dt);
            return;
        }

        let step = if self.accel_usable(accel) {
            self.marg_gradient(&accel.normalize(), &mag.normalize())
        } else {
            None
        };
        self.integrate(gyro, step, dt);
    }

    /// Update with gyroscope (rad/s) and accelerometer readings only.
    pub fn update_imu(&mut self, gyro: &Vector3<f32>, accel: &Vector3<f32>, dt: f32) {
        let step = if self.accel_usable(accel) {
            self.imu_gradient(&accel.normalize())
        } else {
            None
        };
        self.integrate(gyro, step, dt);
    }

    /// The accelerometer is only trusted near 1 g; this also rules out the
    /// zero vector.
    fn accel_usable(&self, accel: &Vector3<f32>) -> bool {
        let usable = (accel.norm() - self.config.gravity).abs() < self.config.accel_cutoff;
        if !usable {
            log::trace!("madgwick: accelerometer {accel:?} outside cutoff, gyro only");
        }
        usable
    }

    /// Normalized gradient of the gravity objective.
    fn imu_gradient(&self, a: &Vector3<f32>) -> Option<Quaternion<f32>> {
        let (qw, qx, qy, qz) = (self.q.w, self.q.i, self.q.j, self.q.k);

        // a level sensor reads -g on z, so the measured direction is the
        // negated gravity prediction
        let f = Vector3::new(
            2.0 * (qx * qz - qw * qy) + a.x,
            2.0 * (qw * qx + qy * qz) + a.y,
            2.0 * (0.5 - qx * qx - qy * qy) + a.z,
        );

        #[rustfmt::skip]
        let jacobian = Matrix3x4::new(
            -2.0 * qy, 2.0 * qz, -2.0 * qw, 2.0 * qx,
            2.0 * qx, 2.0 * qw, 2.0 * qz, 2.0 * qy,
            0.0, -4.0 * qx, -4.0 * qy, 0.0,
        );

        normalized_step(&(jacobian.transpose() * f))
    }

    /// Normalized gradient of the combined gravity and magnetic field
    /// objective.
    fn marg_gradient(&self, a: &Vector3<f32>, m: &Vector3<f32>) -> Option<Quaternion<f32>> {
        let (qw, qx, qy, qz) = (self.q.w, self.q.i, self.q.j, self.q.k);

        // earth-frame field with its horizontal part folded onto x
        let h = rotate_vector(&self.q, m);
        let bx = h.x.hypot(h.y);
        let bz = h.z;

        let f = Vector6::new(
            2.0 * (qx * qz - qw * qy) + a.x,
            2.0 * (qw * qx + qy * qz) + a.y,
            2.0 * (0.5 - qx * qx - qy * qy) + a.z,
            2.0 * bx * (0.5 - qy * qy - qz * qz) + 2.0 * bz * (qx * qz - qw * qy) - m.x,
            2.0 * bx * (qx * qy - qw * qz) + 2.0 * bz * (qw * qx + qy * qz) - m.y,
            2.0 * bx * (qw * qy + qx * qz) + 2.0 * bz * (0.5 - qx * qx - qy * qy) - m.z,
        );

        #[rustfmt::skip]
        let jacobian = Matrix6x4::new(
            -2.0 * qy, 2.0 * qz, -2.0 * qw, 2.0 * qx,
            2.0 * qx, 2.0 * qw, 2.0 * qz, 2.0 * qy,
            0.0, -4.0 * qx, -4.0 * qy, 0.0,
            -2.0 * bz * qy, 2.0 * bz * qz, -4.0 * bx * qy - 2.0 * bz * qw, -4.0 * bx * qz + 2.0 * bz * qx,
            -2.0 * bx * qz + 2.0 * bz * qx, 2.0 * bx * qy + 2.0 * bz * qw, 2.0 * bx * qx + 2.0 * bz * qz, -2.0 * bx * qw + 2.0 * bz * qy,
            2.0 * bx * qy, 2.0 * bx * qz - 4.0 * bz * qx, 2.0 * bx * qw - 4.0 * bz * qy, 2.0 * bx * qx,
        );

        normalized_step(&(jacobian.transpose() * f))
    }

    /// Integrate `q_dot = 1/2 q ⊗ [0, ω] - beta * step` over `dt` and
    /// renormalize.
    fn integrate(&mut self, gyro: &Vector3<f32>, step: Option<Quaternion<f32>>, dt: f32) {
        let mut q_dot = self.q * Quaternion::from_imag(*gyro) * 0.5;
        if let Some(step) = step {
            q_dot -= step * self.config.beta;
        }

        self.q = (self.q + q_dot * dt).normalize();

        // negative or non-finite steps do not advance the schedule
        self.elapsed += Duration::try_from_secs_f32(dt).unwrap_or_default();
        if let Some(schedule) = &self.schedule {
            self.config.beta = schedule.beta_at(self.elapsed);
        }
    }
}

/// The gradient as a quaternion, scaled to unit length. `None` when the
/// estimate already minimizes the objective.
fn normalized_step(gradient: &nalgebra::Vector4<f32>) -> Option<Quaternion<f32>> {
    let norm = gradient.norm();
    if norm > f32::EPSILON {
        let s = gradient / norm;
        Some(Quaternion::new(s[0], s[1], s[2], s[3]))
    } else {
        None
    }
}

impl Attitude for Madgwick {
    type Scalar = f32;

    fn euler_angles(&self) -> EulerAngles<f32> {
        to_euler(&self.q)
    }

    fn orientation(&self) -> UnitQuaternion<f32> {
        UnitQuaternion::new_unchecked(self.q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    const G: f32 = 9.8065;

    fn sensor_readings(truth: &UnitQuaternion<f32>) -> (Vector3<f32>, Vector3<f32>) {
        let inverse = truth.inverse();
        (
            inverse * Vector3::new(0.0, 0.0, -G),
            inverse * Vector3::new(0.3, 0.0, 0.4),
        )
    }

    #[test]
    fn quaternion_stays_normalized() {
        let mut filter = Madgwick::new(MadgwickConfig {
            beta: 0.5,
            ..MadgwickConfig::default()
        });

        for i in 0..500_u16 {
            let t = f32::from(i) * 0.01;
            let gyro = Vector3::new(t.sin(), 0.5 * t.cos(), -0.3);
            let accel = Vector3::new(0.5 * t.cos(), 0.2, -G);
            let mag = Vector3::new(0.3, 0.1 * t.sin(), 0.4);

            if i % 2 == 0 {
                filter.update(&gyro, &accel, &mag, 0.01);
            } else {
                filter.update_imu(&gyro, &accel, 0.01);
            }

            assert_abs_diff_eq!(filter.quaternion().norm(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn accelerometer_outside_cutoff_is_pure_integration() {
        let start = UnitQuaternion::from_euler_angles(0.2, -0.1, 0.7);
        let mut filter = Madgwick::with_orientation(
            MadgwickConfig {
                beta: 1.0,
                accel_cutoff: 1.0,
                ..MadgwickConfig::default()
            },
            start,
        );

        let gyro = Vector3::new(0.3, -0.2, 0.1);
        let dt = 0.01;
        let q = *start.quaternion();
        let expected = (q + q * Quaternion::from_imag(gyro) * 0.5 * dt).normalize();

        // 2 g of linear acceleration
        filter.update_imu(&gyro, &Vector3::new(0.0, 0.0, -2.0 * G), dt);
        assert_relative_eq!(*filter.quaternion(), expected, epsilon = 1e-6);

        // free fall
        let mut free_fall = Madgwick::with_orientation(filter.config().clone(), start);
        free_fall.update(&gyro, &Vector3::zeros(), &Vector3::new(0.3, 0.0, 0.4), dt);
        assert_relative_eq!(*free_fall.quaternion(), expected, epsilon = 1e-6);
    }

    #[test]
    fn converges_to_static_tilt() {
        let truth = UnitQuaternion::from_euler_angles(0.3, -0.2, 0.0);
        let (accel, _) = sensor_readings(&truth);

        let mut filter = Madgwick::new(MadgwickConfig {
            beta: 0.2,
            ..MadgwickConfig::default()
        });
        for _ in 0..2000 {
            filter.update_imu(&Vector3::zeros(), &accel, 0.01);
        }

        let angles = filter.euler_angles();
        assert_abs_diff_eq!(angles.roll, 0.3, epsilon = 0.02);
        assert_abs_diff_eq!(angles.pitch, -0.2, epsilon = 0.02);
    }

    #[test]
    fn magnetometer_converges_heading() {
        let truth = UnitQuaternion::from_euler_angles(-0.2, 0.1, 1.0);
        let (accel, mag) = sensor_readings(&truth);

        let mut filter = Madgwick::new(MadgwickConfig {
            beta: 0.3,
            ..MadgwickConfig::default()
        });
        for _ in 0..3000 {
            filter.update(&Vector3::zeros(), &accel, &mag, 0.01);
        }

        assert_abs_diff_eq!(filter.orientation().angle_to(&truth), 0.0, epsilon = 0.03);
    }

    #[test]
    fn zero_magnetometer_falls_back_to_imu() {
        let start = UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3);
        let mut marg = Madgwick::with_orientation(MadgwickConfig::default(), start);
        let mut imu = marg.clone();

        let gyro = Vector3::new(0.01, 0.02, 0.03);
        let accel = Vector3::new(0.5, -0.3, -9.7);
        marg.update(&gyro, &accel, &Vector3::zeros(), 0.01);
        imu.update_imu(&gyro, &accel, 0.01);

        assert_eq!(marg, imu);
    }

    #[test]
    fn seeded_start_matches_readings() {
        let truth = UnitQuaternion::from_euler_angles(0.25, -0.15, -2.0);
        let (accel, mag) = sensor_readings(&truth);

        let filter = Madgwick::from_sample(MadgwickConfig::default(), &accel, &mag);
        assert_abs_diff_eq!(filter.orientation().angle_to(&truth), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn beta_schedule_ramps_down() {
        let schedule = BetaSchedule {
            initial: 2.5,
            steady: 0.1,
            duration: Duration::from_secs(4),
        };
        assert_abs_diff_eq!(schedule.beta_at(Duration::ZERO), 2.5);
        assert_abs_diff_eq!(schedule.beta_at(Duration::from_secs(2)), 1.3, epsilon = 1e-6);
        assert_abs_diff_eq!(schedule.beta_at(Duration::from_secs(10)), 0.1);

        let mut filter = Madgwick::new(MadgwickConfig::default()).with_schedule(schedule);
        assert_abs_diff_eq!(filter.beta(), 2.5);

        for _ in 0..100 {
            filter.update_imu(&Vector3::zeros(), &Vector3::new(0.0, 0.0, -G), 0.01);
        }
        assert_abs_diff_eq!(filter.beta(), 1.9, epsilon = 1e-3);

        for _ in 0..400 {
            filter.update_imu(&Vector3::zeros(), &Vector3::new(0.0, 0.0, -G), 0.01);
        }
        assert_abs_diff_eq!(filter.beta(), 0.1);

        filter.set_beta(0.05);
        filter.update_imu(&Vector3::zeros(), &Vector3::new(0.0, 0.0, -G), 0.01);
        assert_abs_diff_eq!(filter.beta(), 0.05);
    }

    #[test]
    fn validation() {
        assert!(MadgwickConfig::default().validate().is_ok());
        assert!(Madgwick::try_new(MadgwickConfig {
            beta: -1.0,
            ..MadgwickConfig::default()
        })
        .is_err());
    }
}
