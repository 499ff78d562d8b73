//! Depth sensor model: pin-hole projection and measurement uncertainty.

pub mod depth_model;

pub use depth_model::{DepthSensorModel, SensorConfig, INVALID_PROJECTION};
