//! Kinect/Xtion depth sensor model.
//!
//! Converts between image coordinates plus depth and 3D camera-frame points,
//! and propagates the per-pixel measurement noise into a 3×3 covariance. The
//! inverse covariance is the information matrix that weights landmark
//! observation edges in the pose graph.

use std::fs::File;
use std::path::Path;

use nalgebra::{Matrix3, UnitQuaternion, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::error::{MapError, Result};
use crate::geometry::SE3;

/// Sentinel returned by [`DepthSensorModel::inverse_model`] for points that
/// do not project into the valid image window and depth range.
pub const INVALID_PROJECTION: Vector3<f64> = Vector3::new(-1.0, -1.0, -1.0);

/// Calibration and noise parameters of the depth sensor.
///
/// Defaults are the Kinect/Xtion calibration used by the reference sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Focal lengths `(fx, fy)` in pixels.
    #[serde(default = "default_focal_length")]
    pub focal_length: [f64; 2],

    /// Principal point `(cx, cy)` in pixels.
    #[serde(default = "default_principal_point")]
    pub principal_point: [f64; 2],

    /// Pixel coordinate variance along u.
    #[serde(default = "default_var_u")]
    pub var_u: f64,

    /// Pixel coordinate variance along v.
    #[serde(default = "default_var_v")]
    pub var_v: f64,

    /// Disparity variance polynomial `c0 + c1·z + c2·z² + c3·z³`,
    /// coefficients in ascending order of the depth power.
    #[serde(default = "default_dist_var_coefs")]
    pub dist_var_coefs: [f64; 4],

    /// Image window `(width, height)` in pixels.
    #[serde(default = "default_image_size")]
    pub image_size: [u32; 2],

    /// Usable depth range `(min, max)` in meters.
    #[serde(default = "default_depth_range")]
    pub depth_range: [f64; 2],

    /// Pose of the sensor in the robot frame.
    #[serde(default)]
    pub pose: SensorPose,
}

/// Serializable sensor mounting pose (translation + unit quaternion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorPose {
    #[serde(default)]
    pub translation: [f64; 3],
    /// Quaternion as `(qw, qx, qy, qz)`.
    #[serde(default = "default_quaternion")]
    pub quaternion: [f64; 4],
}

fn default_focal_length() -> [f64; 2] {
    [582.64, 586.97]
}

fn default_principal_point() -> [f64; 2] {
    [320.17, 260.0]
}

fn default_var_u() -> f64 {
    1.1046
}

fn default_var_v() -> f64 {
    0.6416
}

fn default_dist_var_coefs() -> [f64; 4] {
    [-1.7512e-6, 3.6512e-6, 3.069e-3, -8.9997e-6]
}

fn default_image_size() -> [u32; 2] {
    [640, 480]
}

fn default_depth_range() -> [f64; 2] {
    [0.8, 6.0]
}

fn default_quaternion() -> [f64; 4] {
    [1.0, 0.0, 0.0, 0.0]
}

impl Default for SensorPose {
    fn default() -> Self {
        Self {
            translation: [0.0; 3],
            quaternion: default_quaternion(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            focal_length: default_focal_length(),
            principal_point: default_principal_point(),
            var_u: default_var_u(),
            var_v: default_var_v(),
            dist_var_coefs: default_dist_var_coefs(),
            image_size: default_image_size(),
            depth_range: default_depth_range(),
            pose: SensorPose::default(),
        }
    }
}

impl SensorConfig {
    /// Load a sensor configuration from a YAML file.
    ///
    /// Missing fields fall back to the defaults; an unreadable or malformed
    /// file is a fatal configuration fault.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            MapError::Configuration(format!("cannot open {}: {}", path.display(), e))
        })?;
        serde_yaml::from_reader(file).map_err(|e| {
            MapError::Configuration(format!("cannot parse {}: {}", path.display(), e))
        })
    }

    /// The sensor mounting pose as a rigid transform.
    pub fn sensor_pose(&self) -> SE3 {
        let [qw, qx, qy, qz] = self.quaternion_parts();
        SE3::from_parts(
            UnitQuaternion::from_quaternion(nalgebra::Quaternion::from_parts(
                qw,
                Vector3::new(qx, qy, qz),
            )),
            Vector3::new(
                self.pose.translation[0],
                self.pose.translation[1],
                self.pose.translation[2],
            ),
        )
    }

    fn quaternion_parts(&self) -> [f64; 4] {
        self.pose.quaternion
    }
}

/// Pin-hole depth sensor model with (u, v, disparity) noise propagation.
#[derive(Debug, Clone)]
pub struct DepthSensorModel {
    config: SensorConfig,
    /// Pin-hole back-projection matrix: `point = depth · P · (u, v, 1)ᵀ`.
    phcp: Matrix3<f64>,
}

impl DepthSensorModel {
    /// Build the model from a configuration. Fails on non-positive focal
    /// lengths, which would make the projection singular.
    pub fn new(config: SensorConfig) -> Result<Self> {
        let [fx, fy] = config.focal_length;
        if fx <= 0.0 || fy <= 0.0 {
            return Err(MapError::Configuration(format!(
                "non-positive focal length ({fx}, {fy})"
            )));
        }
        let [cx, cy] = config.principal_point;
        let phcp = Matrix3::new(
            1.0 / fx, 0.0, -cx / fx,
            0.0, 1.0 / fy, -cy / fy,
            0.0, 0.0, 1.0,
        );
        Ok(Self { config, phcp })
    }

    /// Load the model from a YAML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(SensorConfig::from_file(path)?)
    }

    /// The configuration this model was built from.
    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Back-project image coordinates and depth to a camera-frame point.
    pub fn get_point(&self, u: f64, v: f64, depth: f64) -> Vector3<f64> {
        depth * (self.phcp * Vector3::new(u, v, 1.0))
    }

    /// Project a camera-frame point to `(u, v, depth)`.
    ///
    /// Returns [`INVALID_PROJECTION`] when the point lands outside the image
    /// window or the usable depth range. Callers treat that sentinel as the
    /// visibility predicate, not as an error.
    pub fn inverse_model(&self, x: f64, y: f64, z: f64) -> Vector3<f64> {
        let [fx, fy] = self.config.focal_length;
        let [cx, cy] = self.config.principal_point;
        let [depth_min, depth_max] = self.config.depth_range;
        if z < depth_min || z > depth_max {
            return INVALID_PROJECTION;
        }
        let u = fx * x / z + cx;
        let v = fy * y / z + cy;
        let [width, height] = self.config.image_size;
        if u < 0.0 || u > f64::from(width) || v < 0.0 || v > f64::from(height) {
            return INVALID_PROJECTION;
        }
        Vector3::new(u, v, z)
    }

    /// Covariance of the back-projected point at `(u, v, depth)`:
    /// `J · diag(varU, varV, σ²(z)) · Jᵀ` with `J = ∂(X,Y,Z)/∂(u,v,d)`.
    pub fn compute_cov(&self, u: f64, v: f64, depth: f64) -> Matrix3<f64> {
        let [fx, fy] = self.config.focal_length;
        let [cx, cy] = self.config.principal_point;
        let jacobian = Matrix3::new(
            depth / fx, 0.0, (u - cx) / fx,
            0.0, depth / fy, (v - cy) / fy,
            0.0, 0.0, 1.0,
        );
        let ruvd = Matrix3::from_diagonal(&Vector3::new(
            self.config.var_u,
            self.config.var_v,
            self.disparity_variance(depth),
        ));
        jacobian * ruvd * jacobian.transpose()
    }

    /// Information matrix for a camera-frame point.
    ///
    /// Re-projects through [`Self::inverse_model`] first; `None` when the
    /// point is not observable or the covariance is singular.
    pub fn information_matrix(&self, x: f64, y: f64, z: f64) -> Option<Matrix3<f64>> {
        let projected = self.inverse_model(x, y, z);
        if projected == INVALID_PROJECTION {
            return None;
        }
        self.information_matrix_from_image_coordinates(projected.x, projected.y, projected.z)
    }

    /// Information matrix straight from the measured image coordinates.
    ///
    /// Preferred over [`Self::information_matrix`]: the Jacobian is evaluated
    /// at the original `(u, v, depth)` measurement instead of a point that
    /// already went through the projection once.
    pub fn information_matrix_from_image_coordinates(
        &self,
        u: f64,
        v: f64,
        depth: f64,
    ) -> Option<Matrix3<f64>> {
        self.compute_cov(u, v, depth).try_inverse()
    }

    /// Evaluate the disparity variance polynomial at a depth.
    fn disparity_variance(&self, depth: f64) -> f64 {
        let c = Vector4::from(self.config.dist_var_coefs);
        c[0] + c[1] * depth + c[2] * depth * depth + c[3] * depth * depth * depth
    }
}
