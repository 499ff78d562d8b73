//! Landmark types stored in and exchanged with the map.

use nalgebra::{DMatrix, Vector3};

/// First landmark id. Pose ids count up from zero, landmark ids from here,
/// so both kinds share the graph's id space without colliding.
pub const FEATURE_START_ID: u32 = 1 << 20;

/// A descriptor taken from one observing pose, so the matcher can pick the
/// view closest to the current one.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedDescriptor {
    /// Pose the descriptor was extracted from.
    pub pose_id: u32,
    /// Image-patch or coefficient matrix, row-major in the text dump.
    pub descriptor: DMatrix<f64>,
}

impl ExtendedDescriptor {
    pub fn new(pose_id: u32, descriptor: DMatrix<f64>) -> Self {
        Self {
            pose_id,
            descriptor,
        }
    }
}

/// A landmark in the world frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MapFeature {
    /// Globally unique id, at least [`FEATURE_START_ID`].
    pub id: u32,
    /// Image coordinates of the first observation.
    pub u: u16,
    pub v: u16,
    /// Position in the world frame.
    pub position: Vector3<f64>,
    /// Every pose that observed this landmark, in insertion order.
    pub poses_ids: Vec<u32>,
    /// One descriptor per observing pose.
    pub descriptors: Vec<ExtendedDescriptor>,
}

/// A freshly detected feature as delivered by the matcher. Its position is
/// in the camera frame of the observing pose; never stored as-is.
#[derive(Debug, Clone)]
pub struct RgbdFeature {
    pub u: u16,
    pub v: u16,
    /// Position in the camera frame.
    pub position: Vector3<f64>,
    pub descriptors: Vec<ExtendedDescriptor>,
}

/// A re-observation of a known landmark from a new pose: the matcher's
/// association plus the fresh camera-frame measurement.
#[derive(Debug, Clone)]
pub struct FeatureMeasurement {
    /// Id of the already-mapped landmark.
    pub feature_id: u32,
    pub u: u16,
    pub v: u16,
    /// Measured position in the camera frame.
    pub position: Vector3<f64>,
}
