//! Typed vertices and edges of the pose graph.
//!
//! Pose and landmark ids live in disjoint ranges (landmarks start at
//! [`crate::map::FEATURE_START_ID`]), but the graph keeps them apart with a
//! tagged [`VertexId`] instead of relying on the numeric split.

use nalgebra::{Matrix3, Matrix6, Vector3};

use crate::geometry::SE3;

/// Identifier of a graph vertex: a camera pose or a 3D landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VertexId {
    Pose(u32),
    Landmark(u32),
}

impl std::fmt::Display for VertexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VertexId::Pose(id) => write!(f, "P{id}"),
            VertexId::Landmark(id) => write!(f, "L{id}"),
        }
    }
}

/// A camera pose vertex (SE(3) estimate plus the frame timestamp).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseVertex {
    pub id: u32,
    /// Camera-to-world transform.
    pub pose: SE3,
    pub timestamp: f64,
}

impl PoseVertex {
    pub fn new(id: u32, pose: SE3, timestamp: f64) -> Self {
        Self {
            id,
            pose,
            timestamp,
        }
    }
}

/// A 3D landmark vertex (world-frame position estimate).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkVertex {
    pub id: u32,
    pub position: Vector3<f64>,
}

impl LandmarkVertex {
    pub fn new(id: u32, position: Vector3<f64>) -> Self {
        Self { id, position }
    }
}

/// A landmark observation: the landmark as seen in the camera frame of
/// `from_pose`, weighted by a 3×3 information matrix.
#[derive(Debug, Clone, Copy)]
pub struct Edge3D {
    pub measurement: Vector3<f64>,
    pub information: Matrix3<f64>,
    pub from_pose: u32,
    pub to_landmark: u32,
}

/// A pose-to-pose constraint (odometry or loop closure): the transform from
/// `from_pose` to `to_pose` expressed in the first pose's frame.
#[derive(Debug, Clone, Copy)]
pub struct EdgeSE3 {
    pub measurement: SE3,
    pub information: Matrix6<f64>,
    pub from_pose: u32,
    pub to_pose: u32,
}

/// Robust loss family applied to observation edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobustKernelKind {
    Huber,
    Cauchy,
    Tukey,
}

impl RobustKernelKind {
    /// Parse a kernel by its conventional name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "huber" => Some(Self::Huber),
            "cauchy" => Some(Self::Cauchy),
            "tukey" => Some(Self::Tukey),
            _ => None,
        }
    }
}

/// A robust kernel: loss family plus its width parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustKernel {
    pub kind: RobustKernelKind,
    pub delta: f64,
}

impl RobustKernel {
    pub fn new(kind: RobustKernelKind, delta: f64) -> Self {
        Self { kind, delta }
    }

    /// Reweighting factor for an edge with squared Mahalanobis residual
    /// `chi2`. Inlier-range residuals keep full weight; large residuals are
    /// down-weighted (to zero for Tukey).
    pub fn weight(&self, chi2: f64) -> f64 {
        let delta_sq = self.delta * self.delta;
        match self.kind {
            RobustKernelKind::Huber => {
                if chi2 <= delta_sq {
                    1.0
                } else {
                    self.delta / chi2.sqrt()
                }
            }
            RobustKernelKind::Cauchy => 1.0 / (1.0 + chi2 / delta_sq),
            RobustKernelKind::Tukey => {
                if chi2 < delta_sq {
                    let r = 1.0 - chi2 / delta_sq;
                    r * r
                } else {
                    0.0
                }
            }
        }
    }
}
