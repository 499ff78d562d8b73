//! Adapter over the nonlinear least-squares solver.
//!
//! The graph keeps typed vertex and edge stores behind a single mutex so the
//! tracker can keep appending while an optimization pass runs: `optimize`
//! snapshots the graph under the lock, solves outside it, and writes the
//! updated estimates back under the lock. Vertices and edges added during a
//! solve are simply not part of that pass.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use nalgebra::Vector3;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{MapError, Result};

use super::solver::{self, Problem, SolveReport};
use super::types::{Edge3D, EdgeSE3, LandmarkVertex, PoseVertex, RobustKernel, VertexId};

#[derive(Default)]
struct GraphState {
    poses: Vec<PoseVertex>,
    pose_index: HashMap<u32, usize>,
    landmarks: Vec<LandmarkVertex>,
    landmark_index: HashMap<u32, usize>,
    edges_3d: Vec<Edge3D>,
    edges_se3: Vec<EdgeSE3>,
    fixed: HashSet<VertexId>,
    kernel: Option<RobustKernel>,
}

impl GraphState {
    fn pose(&self, id: u32) -> Option<&PoseVertex> {
        self.pose_index.get(&id).map(|&i| &self.poses[i])
    }

    fn landmark(&self, id: u32) -> Option<&LandmarkVertex> {
        self.landmark_index.get(&id).map(|&i| &self.landmarks[i])
    }

    fn snapshot(&self) -> Problem {
        Problem {
            poses: self.poses.iter().map(|v| (v.id, v.pose)).collect(),
            landmarks: self.landmarks.iter().map(|v| (v.id, v.position)).collect(),
            edges_3d: self.edges_3d.clone(),
            edges_se3: self.edges_se3.clone(),
            fixed: self.fixed.clone(),
            kernel: self.kernel,
        }
    }
}

/// Typed pose graph store and solver driver.
pub struct PoseGraph {
    state: Mutex<GraphState>,
}

impl Default for PoseGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl PoseGraph {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GraphState::default()),
        }
    }

    /// Add a camera pose vertex. Re-adding an identical vertex is a no-op;
    /// a conflicting estimate under the same id fails loudly.
    pub fn add_vertex_pose(&self, vertex: PoseVertex) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.pose(vertex.id) {
            if *existing == vertex {
                return Ok(());
            }
            return Err(MapError::DuplicateVertex(vertex.id));
        }
        let index = state.poses.len();
        state.pose_index.insert(vertex.id, index);
        state.poses.push(vertex);
        Ok(())
    }

    /// Add a landmark vertex. Same idempotence rule as pose vertices.
    pub fn add_vertex_feature(&self, vertex: LandmarkVertex) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.landmark(vertex.id) {
            if *existing == vertex {
                return Ok(());
            }
            return Err(MapError::DuplicateVertex(vertex.id));
        }
        let index = state.landmarks.len();
        state.landmark_index.insert(vertex.id, index);
        state.landmarks.push(vertex);
        Ok(())
    }

    /// Append a landmark observation edge. Unknown endpoints drop the edge.
    pub fn add_edge_3d(&self, edge: Edge3D) -> Result<()> {
        let mut state = self.state.lock();
        if state.pose(edge.from_pose).is_none() {
            return Err(MapError::UnknownPose(edge.from_pose));
        }
        if state.landmark(edge.to_landmark).is_none() {
            return Err(MapError::UnknownFeature(edge.to_landmark));
        }
        state.edges_3d.push(edge);
        Ok(())
    }

    /// Append a pose-to-pose constraint edge.
    pub fn add_edge_se3(&self, edge: EdgeSE3) -> Result<()> {
        let mut state = self.state.lock();
        if state.pose(edge.from_pose).is_none() {
            return Err(MapError::UnknownPose(edge.from_pose));
        }
        if state.pose(edge.to_pose).is_none() {
            return Err(MapError::UnknownPose(edge.to_pose));
        }
        state.edges_se3.push(edge);
        Ok(())
    }

    /// Apply a robust loss to observation edges from the next pass on.
    pub fn set_robust_kernel(&self, kernel: RobustKernel) {
        self.state.lock().kernel = Some(kernel);
    }

    /// Remove the robust loss.
    pub fn disable_robust_kernel(&self) {
        self.state.lock().kernel = None;
    }

    /// Run a bounded relinearization pass and write the updated estimates
    /// back into the graph. Blocking for the caller, but the graph lock is
    /// only held to snapshot and to apply, never across the solve.
    pub fn optimize(&self, max_iterations: usize) -> Result<SolveReport> {
        let problem = self.state.lock().snapshot();
        let solution = solver::solve(&problem, max_iterations)?;

        let mut state = self.state.lock();
        for vertex in &mut state.poses {
            if let Some(pose) = solution.poses.get(&vertex.id) {
                vertex.pose = *pose;
            }
        }
        for vertex in &mut state.landmarks {
            if let Some(position) = solution.landmarks.get(&vertex.id) {
                vertex.position = *position;
            }
        }
        debug!(
            iterations = solution.report.iterations,
            initial_chi2 = solution.report.initial_chi2,
            final_chi2 = solution.report.final_chi2,
            converged = solution.report.converged,
            "optimization pass finished"
        );
        Ok(solution.report)
    }

    /// Snapshot of all current landmark estimates.
    pub fn optimized_features(&self) -> Vec<LandmarkVertex> {
        self.state.lock().landmarks.clone()
    }

    /// Snapshot of all current pose estimates.
    pub fn optimized_poses(&self) -> Vec<PoseVertex> {
        self.state.lock().poses.clone()
    }

    /// Remove observation edges whose squared Mahalanobis residual at the
    /// current estimates exceeds `threshold`. Returns how many were dropped.
    pub fn prune_edges_3d(&self, threshold: f64) -> usize {
        let mut state = self.state.lock();
        let before = state.edges_3d.len();
        let poses: HashMap<u32, _> = state.poses.iter().map(|v| (v.id, v.pose)).collect();
        let landmarks: HashMap<u32, _> =
            state.landmarks.iter().map(|v| (v.id, v.position)).collect();
        state.edges_3d.retain(|edge| {
            match (poses.get(&edge.from_pose), landmarks.get(&edge.to_landmark)) {
                (Some(pose), Some(landmark)) => {
                    solver::edge_3d_chi2(edge, pose, landmark) <= threshold
                }
                _ => false,
            }
        });
        let removed = before - state.edges_3d.len();
        if removed > 0 {
            debug!(removed, threshold, "pruned observation edges");
        }
        removed
    }

    /// Remove landmarks observed from fewer than `min_observations` distinct
    /// poses, together with their edges. Returns how many landmarks went.
    pub fn remove_weak_features(&self, min_observations: u32) -> usize {
        let mut state = self.state.lock();
        let mut observers: HashMap<u32, HashSet<u32>> = HashMap::new();
        for edge in &state.edges_3d {
            observers
                .entry(edge.to_landmark)
                .or_default()
                .insert(edge.from_pose);
        }
        let weak: HashSet<u32> = state
            .landmarks
            .iter()
            .map(|v| v.id)
            .filter(|id| {
                observers.get(id).map_or(0, |poses| poses.len()) < min_observations as usize
            })
            .collect();
        if weak.is_empty() {
            return 0;
        }
        state.landmarks.retain(|v| !weak.contains(&v.id));
        let landmark_index: HashMap<u32, usize> = state
            .landmarks
            .iter()
            .enumerate()
            .map(|(i, v)| (v.id, i))
            .collect();
        state.landmark_index = landmark_index;
        state.edges_3d.retain(|e| !weak.contains(&e.to_landmark));
        for id in &weak {
            state.fixed.remove(&VertexId::Landmark(*id));
        }
        debug!(removed = weak.len(), min_observations, "removed weak features");
        weak.len()
    }

    /// Hold every current vertex constant for subsequent passes, so only
    /// vertices added later get optimized.
    pub fn fix_optimized_vertices(&self) {
        let mut state = self.state.lock();
        let fixed: Vec<VertexId> = state
            .poses
            .iter()
            .map(|v| VertexId::Pose(v.id))
            .chain(state.landmarks.iter().map(|v| VertexId::Landmark(v.id)))
            .collect();
        state.fixed.extend(fixed);
    }

    /// Release every fixed vertex (the gauge anchor stays implicit).
    pub fn release_fixed_vertices(&self) {
        self.state.lock().fixed.clear();
    }

    /// Observation edges and the current estimate of one landmark.
    pub fn measurements_of(&self, feature_id: u32) -> Result<(Vec<Edge3D>, Vector3<f64>)> {
        let state = self.state.lock();
        let vertex = state
            .landmark(feature_id)
            .ok_or(MapError::UnknownFeature(feature_id))?;
        let edges = state
            .edges_3d
            .iter()
            .filter(|e| e.to_landmark == feature_id)
            .copied()
            .collect();
        Ok((edges, vertex.position))
    }

    /// Number of pose vertices.
    pub fn num_poses(&self) -> usize {
        self.state.lock().poses.len()
    }

    /// Number of landmark vertices.
    pub fn num_landmarks(&self) -> usize {
        self.state.lock().landmarks.len()
    }

    /// Number of observation edges.
    pub fn num_edges_3d(&self) -> usize {
        self.state.lock().edges_3d.len()
    }

    /// Number of pose-to-pose edges.
    pub fn num_edges_se3(&self) -> usize {
        self.state.lock().edges_se3.len()
    }

    /// Write the trajectory in RGBD-SLAM benchmark format:
    /// `timestamp tx ty tz qx qy qz qw` per pose.
    pub fn export_rgbdslam<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let state = self.state.lock();
        let mut file = BufWriter::new(File::create(path)?);
        for vertex in &state.poses {
            let t = vertex.pose.translation;
            let q = vertex.pose.rotation;
            writeln!(
                file,
                "{} {} {} {} {} {} {} {}",
                vertex.timestamp, t.x, t.y, t.z, q.i, q.j, q.k, q.w
            )?;
        }
        Ok(())
    }

    /// Write the graph in g2o text format.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let state = self.state.lock();
        let mut file = BufWriter::new(File::create(path)?);
        for vertex in &state.poses {
            let t = vertex.pose.translation;
            let q = vertex.pose.rotation;
            writeln!(
                file,
                "VERTEX_SE3:QUAT {} {} {} {} {} {} {} {}",
                vertex.id, t.x, t.y, t.z, q.i, q.j, q.k, q.w
            )?;
            if state.fixed.contains(&VertexId::Pose(vertex.id)) {
                writeln!(file, "FIX {}", vertex.id)?;
            }
        }
        for vertex in &state.landmarks {
            let p = vertex.position;
            writeln!(file, "VERTEX_TRACKXYZ {} {} {} {}", vertex.id, p.x, p.y, p.z)?;
        }
        for edge in &state.edges_3d {
            let m = edge.measurement;
            write!(
                file,
                "EDGE_SE3_TRACKXYZ {} {} {} {} {}",
                edge.from_pose, edge.to_landmark, m.x, m.y, m.z
            )?;
            for row in 0..3 {
                for col in row..3 {
                    write!(file, " {}", edge.information[(row, col)])?;
                }
            }
            writeln!(file)?;
        }
        for edge in &state.edges_se3 {
            let t = edge.measurement.translation;
            let q = edge.measurement.rotation;
            write!(
                file,
                "EDGE_SE3:QUAT {} {} {} {} {} {} {} {} {}",
                edge.from_pose, edge.to_pose, t.x, t.y, t.z, q.i, q.j, q.k, q.w
            )?;
            for row in 0..6 {
                for col in row..6 {
                    write!(file, " {}", edge.information[(row, col)])?;
                }
            }
            writeln!(file)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PoseGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PoseGraph")
            .field("poses", &state.poses.len())
            .field("landmarks", &state.landmarks.len())
            .field("edges_3d", &state.edges_3d.len())
            .field("edges_se3", &state.edges_se3.len())
            .field("fixed", &state.fixed.len())
            .finish()
    }
}
