//! Mahony's proportional-integral orientation filter.
//!
//! The gravity and magnetic field directions predicted by the current
//! quaternion are compared with the measured ones. Their cross product is a
//! small-angle estimate of the rotation error, which is fed back into the
//! gyroscope rate through a proportional and an integral term before the
//! rate is integrated. The integral term absorbs a constant gyroscope bias.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::{
    error::{check_gain, ConfigResult},
    quaternion::{from_accel_mag, inverse, rotate_vector, to_euler},
    Attitude, EulerAngles,
};

/// Gains of the [`Mahony`] filter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MahonyConfig {
    /// Twice the proportional gain.
    pub two_kp: f32,
    /// Twice the integral gain. Zero disables integral feedback.
    pub two_ki: f32,
}

impl Default for MahonyConfig {
    fn default() -> Self {
        Self {
            two_kp: 2.0 * 0.5,
            two_ki: 0.0,
        }
    }
}

impl MahonyConfig {
    /// Check that both gains are non-negative.
    ///
    /// # Errors
    ///
    /// Returns the first offending gain.
    pub fn validate(&self) -> ConfigResult<()> {
        check_gain("two_kp", f64::from(self.two_kp))?;
        check_gain("two_ki", f64::from(self.two_ki))
    }
}

/// The PI filter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mahony {
    config: MahonyConfig,
    /// Orientation of the sensor frame relative to the earth frame.
    q: Quaternion<f32>,
    /// Integral of the scaled rotation error, in rad/s.
    integral_feedback: Vector3<f32>,
}

impl Mahony {
    /// Start at the identity orientation.
    #[must_use]
    pub fn new(config: MahonyConfig) -> Self {
        Self::with_orientation(config, UnitQuaternion::identity())
    }

    /// Validate `config`, then start at the identity orientation.
    ///
    /// # Errors
    ///
    /// See [`MahonyConfig::validate`].
    pub fn try_new(config: MahonyConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Start at the orientation given by one accelerometer and magnetometer
    /// sample.
    #[must_use]
    pub fn from_sample(config: MahonyConfig, accel: &Vector3<f32>, mag: &Vector3<f32>) -> Self {
        Self::with_orientation(config, from_accel_mag(accel, mag))
    }

    /// Start at `orientation`.
    #[must_use]
    pub fn with_orientation(config: MahonyConfig, orientation: UnitQuaternion<f32>) -> Self {
        log::debug!(
            "mahony filter: two_kp = {}, two_ki = {}",
            config.two_kp,
            config.two_ki
        );

        Self {
            config,
            q: orientation.into_inner(),
            integral_feedback: Vector3::zeros(),
        }
    }

    /// The raw unit quaternion `(w, x, y, z)`.
    #[must_use]
    pub fn quaternion(&self) -> &Quaternion<f32> {
        &self.q
    }

    /// Accumulated integral feedback, which converges to minus the gyroscope
    /// bias.
    #[must_use]
    pub fn integral_feedback(&self) -> &Vector3<f32> {
        &self.integral_feedback
    }

    /// Update with gyroscope (rad/s), accelerometer and magnetometer readings.
    ///
    /// A magnetometer reading of exactly zero falls back to
    /// [`Self::update_imu`]. A zero accelerometer reading skips the feedback
    /// and only integrates the gyroscope.
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

        let mut rate = *gyro;
        if *accel != Vector3::zeros() {
            let a = accel.normalize();
            let m = mag.normalize();

            // earth-frame field with its horizontal part folded onto x
            let h = rotate_vector(&self.q, &m);
            let b = Vector3::new(h.x.hypot(h.y), 0.0, h.z);

            let to_body = inverse(&self.q);
            let half_v = rotate_vector(&to_body, &gravity_direction()) * 0.5;
            let half_w = rotate_vector(&to_body, &b) * 0.5;

            let half_error = a.cross(&half_v) + m.cross(&half_w);
            rate += self.feedback(&half_error, dt);
        }

        self.integrate(&rate, dt);
    }

    /// Update with gyroscope (rad/s) and accelerometer readings only.
    pub fn update_imu(&mut self, gyro: &Vector3<f32>, accel: &Vector3<f32>, dt: f32) {
        let mut rate = *gyro;
        if *accel != Vector3::zeros() {
            let a = accel.normalize();
            let half_v = rotate_vector(&inverse(&self.q), &gravity_direction()) * 0.5;

            let half_error = a.cross(&half_v);
            rate += self.feedback(&half_error, dt);
        }

        self.integrate(&rate, dt);
    }

    /// Proportional plus integral rate correction for `half_error`.
    fn feedback(&mut self, half_error: &Vector3<f32>, dt: f32) -> Vector3<f32> {
        if self.config.two_ki > 0.0 {
            self.integral_feedback += half_error * (self.config.two_ki * dt);
        } else {
            self.integral_feedback = Vector3::zeros();
        }

        self.integral_feedback + half_error * self.config.two_kp
    }

    fn integrate(&mut self, rate: &Vector3<f32>, dt: f32) {
        let q_dot = self.q * Quaternion::from_imag(*rate) * 0.5;
        self.q = (self.q + q_dot * dt).normalize();
    }
}

/// Earth-frame direction a level accelerometer reads, `-z`.
fn gravity_direction() -> Vector3<f32> {
    -Vector3::z()
}

impl Attitude for Mahony {
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
    use approx::assert_abs_diff_eq;

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
        let mut filter = Mahony::new(MahonyConfig {
            two_kp: 2.0,
            two_ki: 0.2,
        });

        for i in 0..500_u16 {
            let t = f32::from(i) * 0.01;
            let gyro = Vector3::new(0.4 * t.cos(), -0.2, 0.6 * t.sin());
            let accel = Vector3::new(0.3, 0.5 * t.sin(), -G);
            let mag = Vector3::new(0.3, 0.0, 0.4 + 0.1 * t.cos());

            filter.update(&gyro, &accel, &mag, 0.01);
            assert_abs_diff_eq!(filter.quaternion().norm(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn converges_with_magnetometer() {
        let truth = UnitQuaternion::from_euler_angles(0.15, -0.3, 2.0);
        let (accel, mag) = sensor_readings(&truth);

        let mut filter = Mahony::new(MahonyConfig {
            two_kp: 2.0,
            two_ki: 0.0,
        });
        for _ in 0..4000 {
            filter.update(&Vector3::zeros(), &accel, &mag, 0.01);
        }

        assert_abs_diff_eq!(filter.orientation().angle_to(&truth), 0.0, epsilon = 0.01);
    }

    #[test]
    fn integral_feedback_cancels_gyro_bias() {
        let bias = Vector3::new(0.05, -0.03, 0.0);
        let accel = Vector3::new(0.0, 0.0, -G);

        let mut filter = Mahony::new(MahonyConfig {
            two_kp: 2.0,
            two_ki: 0.5,
        });
        for _ in 0..6000 {
            filter.update_imu(&bias, &accel, 0.01);
        }

        let integral = filter.integral_feedback();
        assert_abs_diff_eq!(integral.x, -bias.x, epsilon = 5e-3);
        assert_abs_diff_eq!(integral.y, -bias.y, epsilon = 5e-3);

        let angles = filter.euler_angles();
        assert_abs_diff_eq!(angles.roll, 0.0, epsilon = 0.01);
        assert_abs_diff_eq!(angles.pitch, 0.0, epsilon = 0.01);
    }

    #[test]
    fn zero_integral_gain_keeps_integral_clear() {
        let mut filter = Mahony::with_orientation(
            MahonyConfig::default(),
            UnitQuaternion::from_euler_angles(0.3, 0.0, 0.0),
        );
        filter.update_imu(&Vector3::zeros(), &Vector3::new(0.0, 0.0, -G), 0.01);

        assert_eq!(*filter.integral_feedback(), Vector3::zeros());
    }

    #[test]
    fn zero_accelerometer_is_gyro_only() {
        let start = UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3);
        let mut filter = Mahony::with_orientation(MahonyConfig::default(), start);

        let gyro = Vector3::new(0.0, 0.0, 1.0);
        filter.update(&gyro, &Vector3::zeros(), &Vector3::new(0.3, 0.0, 0.4), 0.01);

        let q = *start.quaternion();
        let expected = (q + q * Quaternion::from_imag(gyro) * 0.5 * 0.01).normalize();
        assert_abs_diff_eq!((filter.quaternion() - expected).norm(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn zero_magnetometer_falls_back_to_imu() {
        let start = UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3);
        let mut marg = Mahony::with_orientation(MahonyConfig::default(), start);
        let mut imu = marg.clone();

        let gyro = Vector3::new(0.01, 0.02, 0.03);
        let accel = Vector3::new(0.5, -0.3, -9.7);
        marg.update(&gyro, &accel, &Vector3::zeros(), 0.01);
        imu.update_imu(&gyro, &accel, 0.01);

        assert_eq!(marg, imu);
    }

    #[test]
    fn seeded_start_matches_readings() {
        let truth = UnitQuaternion::from_euler_angles(-0.3, 0.2, 0.8);
        let (accel, mag) = sensor_readings(&truth);

        let filter = Mahony::from_sample(MahonyConfig::default(), &accel, &mag);
        assert_abs_diff_eq!(filter.orientation().angle_to(&truth), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn validation() {
        assert!(MahonyConfig::default().validate().is_ok());
        assert!(Mahony::try_new(MahonyConfig {
            two_kp: f32::NAN,
            two_ki: 0.0,
        })
        .is_err());
    }
}
