//! Map and pose-graph backend for an RGB-D visual SLAM pipeline.
//!
//! A live tracker feeds camera poses, landmark observations, and inter-pose
//! constraints into a [`map::FeaturesMap`] and queries it for visible
//! features and the current pose, while a background thread keeps
//! relinearizing the underlying [`graph::PoseGraph`] and hands refined
//! estimates back through a double-buffered, non-blocking reconciliation
//! protocol. The [`sensor::DepthSensorModel`] turns per-pixel measurement
//! noise into the information matrices that weight the observation edges.
//!
//! Feature detection, matching, and frame grabbing are external
//! collaborators; this crate starts where their per-frame output ends.

pub mod config;
pub mod error;
pub mod geometry;
pub mod graph;
pub mod io;
pub mod map;
pub mod sensor;

pub use config::MapConfig;
pub use error::{MapError, Result};
pub use geometry::SE3;
pub use map::{
    DepthImage, FeatureMeasurement, FeaturesMap, MapFeature, RgbdFeature, FEATURE_START_ID,
};
pub use sensor::{DepthSensorModel, SensorConfig};
