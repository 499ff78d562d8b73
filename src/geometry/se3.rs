//! SE(3) rigid body transforms.
//!
//! A pose is stored as a unit quaternion plus a translation. Camera poses in
//! the trajectory map camera coordinates to world coordinates (T_wc), so
//! `pose.transform_point(p_cam)` yields the world-frame point and
//! `pose.inverse().transform_point(p_world)` projects back into the camera.
//!
//! The 6-dim tangent used by the optimizer is ordered `[ρ; φ]`: translation
//! part first, rotation (scaled axis) second.

use nalgebra::{Matrix3, UnitQuaternion, Vector3, Vector6};

/// Small angle threshold below which the series expansions are used.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-8;

/// A rigid body transform in 3D.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    /// Rotation component.
    pub rotation: UnitQuaternion<f64>,
    /// Translation component.
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build a transform from its rotation and translation parts.
    pub fn from_parts(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// A pure translation.
    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(x, y, z),
        }
    }

    /// Compose two transforms: `self` followed by `other` in `self`'s frame.
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.translation + self.rotation * other.translation,
        }
    }

    /// The inverse transform.
    pub fn inverse(&self) -> SE3 {
        let inv_rot = self.rotation.inverse();
        SE3 {
            rotation: inv_rot,
            translation: -(inv_rot * self.translation),
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// The rotation as a 3×3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Exponential map from the tangent `[ρ; φ]` to the group.
    pub fn exp(tangent: &Vector6<f64>) -> SE3 {
        let rho = Vector3::new(tangent[0], tangent[1], tangent[2]);
        let phi = Vector3::new(tangent[3], tangent[4], tangent[5]);
        SE3 {
            rotation: UnitQuaternion::from_scaled_axis(phi),
            translation: left_jacobian(&phi) * rho,
        }
    }

    /// Logarithm map from the group to the tangent `[ρ; φ]`.
    pub fn log(&self) -> Vector6<f64> {
        let phi = self.rotation.scaled_axis();
        let rho = left_jacobian_inv(&phi) * self.translation;
        Vector6::new(rho.x, rho.y, rho.z, phi.x, phi.y, phi.z)
    }

    /// The transform as a 3×4 matrix in row-major order, for the text dump.
    pub fn matrix3x4(&self) -> [f64; 12] {
        let r = self.rotation_matrix();
        let t = self.translation;
        [
            r[(0, 0)], r[(0, 1)], r[(0, 2)], t.x,
            r[(1, 0)], r[(1, 1)], r[(1, 2)], t.y,
            r[(2, 0)], r[(2, 1)], r[(2, 2)], t.z,
        ]
    }

    /// Rebuild a transform from a row-major 3×4 matrix.
    ///
    /// The rotation block is re-orthonormalized, so a matrix written out with
    /// finite precision comes back as a valid rotation.
    pub fn from_matrix3x4(m: &[f64; 12]) -> SE3 {
        let rot = Matrix3::new(m[0], m[1], m[2], m[4], m[5], m[6], m[8], m[9], m[10]);
        SE3 {
            rotation: UnitQuaternion::from_matrix(&rot),
            translation: Vector3::new(m[3], m[7], m[11]),
        }
    }
}

/// The skew-symmetric matrix `[v]×` with `[v]× u = v × u`.
#[inline]
fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Left Jacobian of SO(3):
/// `J(φ) = I + (1 − cos θ)/θ² [φ]× + (θ − sin θ)/θ³ [φ]×²`.
fn left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let k = skew(phi);
    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + 0.5 * k + (k * k) / 6.0;
    }
    let theta_sq = theta * theta;
    Matrix3::identity()
        + ((1.0 - theta.cos()) / theta_sq) * k
        + ((theta - theta.sin()) / (theta_sq * theta)) * (k * k)
}

/// Inverse of the left Jacobian:
/// `J⁻¹(φ) = I − ½[φ]× + (1/θ² − (1 + cos θ)/(2θ sin θ)) [φ]×²`.
fn left_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let k = skew(phi);
    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * k + (k * k) / 12.0;
    }
    let theta_sq = theta * theta;
    let coeff = 1.0 / theta_sq - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() - 0.5 * k + coeff * (k * k)
}
