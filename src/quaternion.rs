//! Quaternion and vector helpers shared by the quaternion filters.
//!
//! Quaternions here follow the same convention as the filters: `q` rotates a
//! vector from the sensor (body) frame into the earth frame. A level
//! accelerometer at rest reads `-g` on its z axis, so the reading expected
//! for `q` points along `q⁻¹ ⊗ [0, 0, 0, -1] ⊗ q`.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::EulerAngles;

/// Rotate `v` by `q`, i.e. `q ⊗ v ⊗ q*`.
///
/// For a non-unit `q` the result is additionally scaled by `|q|²`.
#[must_use]
pub fn rotate_vector(q: &Quaternion<f32>, v: &Vector3<f32>) -> Vector3<f32> {
    let (r, i, j, k) = (q.w, q.i, q.j, q.k);

    Vector3::new(
        2.0 * (r * v.z * j + i * v.z * k - r * v.y * k + i * v.y * j)
            + v.x * (r * r + i * i - j * j - k * k),
        2.0 * (r * v.x * k + i * v.x * j - r * v.z * i + j * v.z * k)
            + v.y * (r * r - i * i + j * j - k * k),
        2.0 * (r * v.y * i - r * v.x * j + i * v.x * k + j * v.y * k)
            + v.z * (r * r - i * i - j * j + k * k),
    )
}

/// The multiplicative inverse `q* / |q|²`.
#[must_use]
pub fn inverse(q: &Quaternion<f32>) -> Quaternion<f32> {
    let recip_norm_squared = 1.0 / q.norm_squared();
    Quaternion::new(q.w, -q.i, -q.j, -q.k) * recip_norm_squared
}

/// Convert to roll, pitch and yaw (Z-Y-X convention), in radians.
///
/// Pitch is clamped to `±π/2` when rounding pushes the `asin` argument
/// outside `[-1, 1]`.
#[must_use]
pub fn to_euler(q: &Quaternion<f32>) -> EulerAngles<f32> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    let (ww, xx, yy, zz) = (w * w, x * x, y * y, z * z);

    EulerAngles {
        roll: (2.0 * (y * z + x * w)).atan2(-xx - yy + zz + ww),
        pitch: (-2.0 * (x * z - y * w)).clamp(-1.0, 1.0).asin(),
        yaw: (2.0 * (x * y + z * w)).atan2(xx - yy - zz + ww),
    }
}

/// Seed an orientation from a single accelerometer and magnetometer sample.
///
/// Roll and pitch come from the gravity direction, assuming a sensor at rest
/// reads `-g` on its z axis when level. Heading comes from the magnetometer
/// after projecting it onto the horizontal plane with that roll and pitch, so
/// that the earth-frame field points along `+x`.
///
/// A zero magnetometer sample yields a heading of zero.
#[must_use]
pub fn from_accel_mag(accel: &Vector3<f32>, mag: &Vector3<f32>) -> UnitQuaternion<f32> {
    let roll = (-accel.y).atan2(-accel.z);
    let pitch = accel.x.atan2(accel.y.hypot(accel.z));

    let (sin_roll, cos_roll) = roll.sin_cos();
    let (sin_pitch, cos_pitch) = pitch.sin_cos();

    // horizontal components of the field
    let mag_x =
        mag.x * cos_pitch + mag.y * sin_roll * sin_pitch + mag.z * cos_roll * sin_pitch;
    let mag_y = mag.y * cos_roll - mag.z * sin_roll;
    let yaw = (-mag_y).atan2(mag_x);

    UnitQuaternion::from_euler_angles(roll, pitch, yaw)
}

/// Fast approximation of `1 / sqrt(x)`, with one Newton iteration.
///
/// The relative error is below `2e-3`. Use it where that is acceptable,
/// e.g. for normalizing a direction that only feeds a correction term.
#[must_use]
pub fn fast_inv_sqrt(x: f32) -> f32 {
    let half_x = 0.5 * x;
    let y = f32::from_bits(0x5f37_59df - (x.to_bits() >> 1));
    y * (1.5 - half_x * y * y)
}
