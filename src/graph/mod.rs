//! Pose graph: typed vertex/edge store and the least-squares solver behind it.

pub mod pose_graph;
pub mod solver;
pub mod types;

pub use pose_graph::PoseGraph;
pub use solver::SolveReport;
pub use types::{
    Edge3D, EdgeSE3, LandmarkVertex, PoseVertex, RobustKernel, RobustKernelKind, VertexId,
};
