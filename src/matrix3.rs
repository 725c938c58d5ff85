//! Small linear-algebra kernel for 3x3 matrices and 3-vectors.
//!
//! Every operation takes its operands by reference and returns the result by
//! value. The whole result is computed before it is handed back, so writing it
//! over one of the operands is always safe:
//!
//! ```
//! use mems_ahrs::matrix3::{add, mul, Mat3};
//!
//! let mut p = Mat3::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 10.0);
//! p = add(&p, &p);
//! p = mul(&p, &p);
//! assert_eq!(p[(0, 0)], 4.0 * (1.0 + 8.0 + 21.0));
//! ```
//!
//! No operation allocates or fails. In particular [`inverse`] does not check
//! for singular input: the entries come out as `inf`/`NaN` and it is up to the
//! caller to keep the matrix well conditioned.

use nalgebra::{Matrix3, Vector3};

/// 3x3 matrix in double precision.
pub type Mat3 = Matrix3<f64>;
/// 3-vector in double precision.
pub type Vec3 = Vector3<f64>;

/// `a + b`.
#[inline]
#[must_use]
pub fn add(a: &Mat3, b: &Mat3) -> Mat3 {
    a + b
}

/// `a - b`.
#[inline]
#[must_use]
pub fn sub(a: &Mat3, b: &Mat3) -> Mat3 {
    a - b
}

/// Matrix product `a * b`.
#[inline]
#[must_use]
pub fn mul(a: &Mat3, b: &Mat3) -> Mat3 {
    a * b
}

/// `m^T`.
#[inline]
#[must_use]
pub fn transpose(m: &Mat3) -> Mat3 {
    m.transpose()
}

/// `s * m`.
#[inline]
#[must_use]
pub fn scale(s: f64, m: &Mat3) -> Mat3 {
    m * s
}

/// The 3x3 identity.
#[inline]
#[must_use]
pub fn identity() -> Mat3 {
    Mat3::identity()
}

/// A diagonal matrix with `value` on every diagonal entry.
#[inline]
#[must_use]
pub fn diagonal(value: f64) -> Mat3 {
    Mat3::from_diagonal_element(value)
}

/// Matrix-vector product `m * v`.
#[inline]
#[must_use]
pub fn mul_vec(m: &Mat3, v: &Vec3) -> Vec3 {
    m * v
}

/// `a - b` for vectors.
#[inline]
#[must_use]
pub fn sub_vec(a: &Vec3, b: &Vec3) -> Vec3 {
    a - b
}

/// Element-wise product of two vectors.
#[inline]
#[must_use]
pub fn elementwise_mul(a: &Vec3, b: &Vec3) -> Vec3 {
    a.component_mul(b)
}

/// Determinant by cofactor expansion along the first column.
#[must_use]
pub fn determinant(m: &Mat3) -> f64 {
    let a = |i: usize, j: usize| m[(i, j)];

    a(0, 0) * (a(2, 2) * a(1, 1) - a(2, 1) * a(1, 2))
        - a(1, 0) * (a(2, 2) * a(0, 1) - a(2, 1) * a(0, 2))
        + a(2, 0) * (a(1, 2) * a(0, 1) - a(1, 1) * a(0, 2))
}

/// Closed-form inverse, `adj(m) / det(m)`.
///
/// # Note
///
/// A singular `m` is not detected. The division by a zero determinant yields
/// `inf`/`NaN` entries which propagate into whatever consumes the result.
#[must_use]
pub fn inverse(m: &Mat3) -> Mat3 {
    let a = |i: usize, j: usize| m[(i, j)];
    let det = determinant(m);

    #[rustfmt::skip]
    let adjugate = Mat3::new(
        a(2, 2) * a(1, 1) - a(2, 1) * a(1, 2),
        -(a(2, 2) * a(0, 1) - a(2, 1) * a(0, 2)),
        a(1, 2) * a(0, 1) - a(1, 1) * a(0, 2),

        -(a(2, 2) * a(1, 0) - a(2, 0) * a(1, 2)),
        a(2, 2) * a(0, 0) - a(2, 0) * a(0, 2),
        -(a(1, 2) * a(0, 0) - a(1, 0) * a(0, 2)),

        a(2, 1) * a(1, 0) - a(2, 0) * a(1, 1),
        -(a(2, 1) * a(0, 0) - a(2, 0) * a(0, 1)),
        a(1, 1) * a(0, 0) - a(1, 0) * a(0, 1),
    );

    adjugate / det
}
