//! Attitude and heading estimation for low-cost MEMS inertial sensors.
//!
//! The crate fuses angular rate, acceleration and magnetic field samples into
//! an orientation estimate, and tracks position and velocity along an axis:
//!
//! - [`Ekf`]: an extended Kalman filter over roll, pitch and yaw with a full
//!   3x3 error covariance, corrected independently by the accelerometer and
//!   the magnetometer.
//! - [`Madgwick`]: a gradient-descent quaternion filter with a single gain.
//! - [`Mahony`]: a proportional-integral quaternion filter.
//! - [`LinearKalman`]: a two-state position/velocity Kalman filter.
//!
//! Every estimator is a plain value that owns its state. Stepping one never
//! allocates, blocks, performs I/O or returns an error; independent instances
//! may live on different threads.

pub mod ekf;
pub mod error;
pub mod linear_kalman;
pub mod madgwick;
pub mod mahony;
pub mod matrix3;
pub mod quaternion;

use nalgebra::{RealField, UnitQuaternion};

pub use ekf::{AngleWrap, Ekf, EkfConfig, EkfState, RawSensorSample};
pub use error::ConfigError;
pub use linear_kalman::{LinearKalman, LinearKalmanConfig, LinearKalmanInput, LinearKalmanOutput};
pub use madgwick::{BetaSchedule, Madgwick, MadgwickConfig};
pub use mahony::{Mahony, MahonyConfig};

/// Standard gravity used as the accelerometer reference magnitude, in m/s^2.
pub const STANDARD_GRAVITY: f64 = 9.8065;

/// Roll, pitch and yaw in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EulerAngles<T> {
    /// Rotation about the x axis.
    pub roll: T,
    /// Rotation about the y axis.
    pub pitch: T,
    /// Rotation about the z axis.
    pub yaw: T,
}

/// Read access shared by the orientation estimators.
pub trait Attitude {
    /// Scalar type of the estimator.
    type Scalar: RealField + Copy;

    /// Current orientation as roll, pitch and yaw.
    fn euler_angles(&self) -> EulerAngles<Self::Scalar>;

    /// Current orientation as a rotation from the body into the earth frame.
    fn orientation(&self) -> UnitQuaternion<Self::Scalar>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;

    fn heading<A: Attitude<Scalar = f32>>(estimator: &A) -> f32 {
        estimator.euler_angles().yaw
    }

    /// The accelerometer reading the EKF expects from a level sensor.
    #[allow(clippy::cast_possible_truncation)]
    fn level_reading() -> Vector3<f32> {
        EkfConfig::default().acc_ref.map(|v| v as f32)
    }

    #[test]
    fn estimators_agree_on_a_pure_yaw_rotation() {
        let gyro = Vector3::new(0.0_f32, 0.0, 0.5);
        let level = level_reading();

        let mut madgwick = Madgwick::new(MadgwickConfig::default());
        let mut mahony = Mahony::new(MahonyConfig::default());
        let mut ekf = Ekf::new(EkfConfig::default());

        for _ in 0..100 {
            madgwick.update_imu(&gyro, &level, 0.01);
            mahony.update_imu(&gyro, &level, 0.01);

            let mut sample = RawSensorSample::from_gyro(gyro.cast())
                .with_acc(EkfConfig::default().acc_ref);
            ekf.step(&mut sample, 0.01);
        }

        assert_abs_diff_eq!(heading(&madgwick), 0.5, epsilon = 1e-3);
        assert_abs_diff_eq!(heading(&mahony), 0.5, epsilon = 1e-3);
        assert_abs_diff_eq!(ekf.euler_angles().yaw, 0.5, epsilon = 1e-9);

        let q = ekf.orientation();
        assert_abs_diff_eq!(q.angle(), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn estimators_share_the_accelerometer_convention() {
        let level = level_reading();
        let tilted = UnitQuaternion::from_euler_angles(0.05_f32, 0.0, 0.0);

        let mut madgwick = Madgwick::with_orientation(MadgwickConfig::default(), tilted);
        let mut mahony = Mahony::with_orientation(MahonyConfig::default(), tilted);
        let mut ekf = Ekf::new(EkfConfig::default());
        ekf.state.roll = 0.05;

        for _ in 0..3000 {
            madgwick.update_imu(&Vector3::zeros(), &level, 0.01);
            mahony.update_imu(&Vector3::zeros(), &level, 0.01);

            let mut sample =
                RawSensorSample::from_gyro(Vector3::zeros()).with_acc(level.cast());
            ekf.step(&mut sample, 0.01);
        }

        assert_abs_diff_eq!(madgwick.euler_angles().roll, 0.0, epsilon = 0.01);
        assert_abs_diff_eq!(mahony.euler_angles().roll, 0.0, epsilon = 0.01);
        assert_abs_diff_eq!(ekf.euler_angles().roll, 0.0, epsilon = 0.01);

        let seeded = quaternion::from_accel_mag(&level, &Vector3::new(0.3, 0.0, 0.4));
        assert_abs_diff_eq!(seeded.angle(), 0.0, epsilon = 1e-6);
    }
}
