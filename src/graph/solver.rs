//! Levenberg–Marquardt core behind the pose graph adapter.
//!
//! Works on an immutable snapshot of the graph in three phases: the adapter
//! collects the snapshot under its lock, the solve here runs without any
//! lock, and the adapter writes the returned estimates back. Poses are
//! parametrized by their SE(3) tangent, landmarks by their position;
//! Jacobians are per-edge central differences on the involved blocks.

use std::collections::{HashMap, HashSet};

use nalgebra::{Cholesky, DMatrix, DVector, Matrix3, Matrix6, Vector3, Vector6};

use crate::error::MapError;
use crate::geometry::SE3;

use super::types::{Edge3D, EdgeSE3, RobustKernel, VertexId};

const GRADIENT_TOLERANCE: f64 = 1e-8;
const PARAM_TOLERANCE: f64 = 1e-8;
const JACOBIAN_EPS: f64 = 1e-6;
const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;
const LAMBDA_MIN: f64 = 1e-10;
const LAMBDA_MAX: f64 = 1e10;

/// Snapshot of the graph handed to the solver.
pub(crate) struct Problem {
    /// Pose vertices in insertion order (id, current estimate).
    pub poses: Vec<(u32, SE3)>,
    /// Landmark vertices in insertion order (id, current estimate).
    pub landmarks: Vec<(u32, Vector3<f64>)>,
    pub edges_3d: Vec<Edge3D>,
    pub edges_se3: Vec<EdgeSE3>,
    /// Vertices held constant in addition to the gauge anchor.
    pub fixed: HashSet<VertexId>,
    /// Robust loss applied to observation edges.
    pub kernel: Option<RobustKernel>,
}

/// Outcome statistics of a solve.
#[derive(Debug, Clone, Copy)]
pub struct SolveReport {
    pub iterations: usize,
    pub initial_chi2: f64,
    pub final_chi2: f64,
    pub converged: bool,
}

/// Updated estimates plus statistics.
pub(crate) struct Solution {
    pub poses: HashMap<u32, SE3>,
    pub landmarks: HashMap<u32, Vector3<f64>>,
    pub report: SolveReport,
}

struct Layout {
    /// Parameter offset of each free pose (6 tangent coordinates).
    pose_offsets: HashMap<u32, usize>,
    /// Parameter offset of each free landmark (3 coordinates).
    landmark_offsets: HashMap<u32, usize>,
    n_params: usize,
}

impl Layout {
    fn build(problem: &Problem) -> Self {
        // The lowest pose id anchors the gauge: the world origin convention
        // says pose 0 defines the frame everything else is expressed in.
        let anchor = problem.poses.iter().map(|(id, _)| *id).min();

        let mut pose_offsets = HashMap::new();
        let mut landmark_offsets = HashMap::new();
        let mut offset = 0;
        for (id, _) in &problem.poses {
            if Some(*id) == anchor || problem.fixed.contains(&VertexId::Pose(*id)) {
                continue;
            }
            pose_offsets.insert(*id, offset);
            offset += 6;
        }
        for (id, _) in &problem.landmarks {
            if problem.fixed.contains(&VertexId::Landmark(*id)) {
                continue;
            }
            landmark_offsets.insert(*id, offset);
            offset += 3;
        }
        Self {
            pose_offsets,
            landmark_offsets,
            n_params: offset,
        }
    }
}

struct Evaluator<'a> {
    problem: &'a Problem,
    layout: &'a Layout,
    /// Snapshot estimates used for every vertex not in the parameter vector.
    held_poses: HashMap<u32, SE3>,
    held_landmarks: HashMap<u32, Vector3<f64>>,
    /// Square roots of the edge information matrices (upper Cholesky factors).
    sqrt_info_3d: Vec<Matrix3<f64>>,
    sqrt_info_se3: Vec<Matrix6<f64>>,
}

impl<'a> Evaluator<'a> {
    fn new(problem: &'a Problem, layout: &'a Layout) -> Self {
        let held_poses = problem.poses.iter().copied().collect();
        let held_landmarks = problem.landmarks.iter().copied().collect();
        let sqrt_info_3d = problem
            .edges_3d
            .iter()
            .map(|e| sqrt_information3(&e.information))
            .collect();
        let sqrt_info_se3 = problem
            .edges_se3
            .iter()
            .map(|e| sqrt_information6(&e.information))
            .collect();
        Self {
            problem,
            layout,
            held_poses,
            held_landmarks,
            sqrt_info_3d,
            sqrt_info_se3,
        }
    }

    fn initial_params(&self) -> DVector<f64> {
        let mut params = DVector::zeros(self.layout.n_params);
        for (id, pose) in &self.problem.poses {
            if let Some(&offset) = self.layout.pose_offsets.get(id) {
                let tangent = pose.log();
                for i in 0..6 {
                    params[offset + i] = tangent[i];
                }
            }
        }
        for (id, position) in &self.problem.landmarks {
            if let Some(&offset) = self.layout.landmark_offsets.get(id) {
                for i in 0..3 {
                    params[offset + i] = position[i];
                }
            }
        }
        params
    }

    fn pose_at(&self, params: &DVector<f64>, id: u32) -> SE3 {
        if let Some(&offset) = self.layout.pose_offsets.get(&id) {
            let tangent = Vector6::new(
                params[offset],
                params[offset + 1],
                params[offset + 2],
                params[offset + 3],
                params[offset + 4],
                params[offset + 5],
            );
            SE3::exp(&tangent)
        } else {
            self.held_poses.get(&id).copied().unwrap_or_else(SE3::identity)
        }
    }

    fn landmark_at(&self, params: &DVector<f64>, id: u32) -> Vector3<f64> {
        if let Some(&offset) = self.layout.landmark_offsets.get(&id) {
            Vector3::new(params[offset], params[offset + 1], params[offset + 2])
        } else {
            self.held_landmarks.get(&id).copied().unwrap_or_else(Vector3::zeros)
        }
    }

    fn edge_3d_error(&self, params: &DVector<f64>, edge: &Edge3D) -> Vector3<f64> {
        let pose = self.pose_at(params, edge.from_pose);
        let point = self.landmark_at(params, edge.to_landmark);
        edge.measurement - pose.inverse().transform_point(&point)
    }

    fn edge_se3_error(&self, params: &DVector<f64>, edge: &EdgeSE3) -> Vector6<f64> {
        let pose_i = self.pose_at(params, edge.from_pose);
        let pose_j = self.pose_at(params, edge.to_pose);
        let predicted = pose_i.inverse().compose(&pose_j);
        edge.measurement.inverse().compose(&predicted).log()
    }

    /// Robust weight of an observation edge at the current estimates.
    fn edge_3d_weight(&self, params: &DVector<f64>, edge: &Edge3D) -> f64 {
        match self.problem.kernel {
            Some(kernel) => {
                let r = self.edge_3d_error(params, edge);
                kernel.weight(r.dot(&(edge.information * r)))
            }
            None => 1.0,
        }
    }

    fn total_chi2(&self, params: &DVector<f64>) -> f64 {
        let mut total = 0.0;
        for edge in &self.problem.edges_3d {
            let r = self.edge_3d_error(params, edge);
            let chi2 = r.dot(&(edge.information * r));
            let weight = self
                .problem
                .kernel
                .map_or(1.0, |kernel| kernel.weight(chi2));
            total += weight * chi2;
        }
        for edge in &self.problem.edges_se3 {
            let r = self.edge_se3_error(params, edge);
            total += r.dot(&(edge.information * r));
        }
        total
    }

    /// Build the weighted residual vector and its Jacobian by central
    /// differences on the parameter blocks each edge touches.
    fn linearize(&self, params: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>) {
        let n_residuals = 3 * self.problem.edges_3d.len() + 6 * self.problem.edges_se3.len();
        let mut residuals = DVector::zeros(n_residuals);
        let mut jacobian = DMatrix::zeros(n_residuals, self.layout.n_params);
        let mut scratch = params.clone();

        for (edge_idx, edge) in self.problem.edges_3d.iter().enumerate() {
            let row = 3 * edge_idx;
            let sqrt_weight = self.edge_3d_weight(params, edge).sqrt();
            let sqrt_info = &self.sqrt_info_3d[edge_idx];
            let r = sqrt_info * self.edge_3d_error(params, edge) * sqrt_weight;
            for i in 0..3 {
                residuals[row + i] = r[i];
            }

            let pose_block = self.layout.pose_offsets.get(&edge.from_pose).map(|&b| (b, 6));
            let landmark_block = self
                .layout
                .landmark_offsets
                .get(&edge.to_landmark)
                .map(|&b| (b, 3));
            for (base, width) in pose_block.into_iter().chain(landmark_block) {
                for p in 0..width {
                    let col = base + p;
                    let saved = scratch[col];
                    scratch[col] = saved + JACOBIAN_EPS;
                    let plus = sqrt_info * self.edge_3d_error(&scratch, edge);
                    scratch[col] = saved - JACOBIAN_EPS;
                    let minus = sqrt_info * self.edge_3d_error(&scratch, edge);
                    scratch[col] = saved;
                    for i in 0..3 {
                        jacobian[(row + i, col)] =
                            (plus[i] - minus[i]) / (2.0 * JACOBIAN_EPS) * sqrt_weight;
                    }
                }
            }
        }

        let se3_base = 3 * self.problem.edges_3d.len();
        for (edge_idx, edge) in self.problem.edges_se3.iter().enumerate() {
            let row = se3_base + 6 * edge_idx;
            let sqrt_info = &self.sqrt_info_se3[edge_idx];
            let r = sqrt_info * self.edge_se3_error(params, edge);
            for i in 0..6 {
                residuals[row + i] = r[i];
            }

            for pose_id in [edge.from_pose, edge.to_pose] {
                let Some(&base) = self.layout.pose_offsets.get(&pose_id) else { continue };
                for p in 0..6 {
                    let col = base + p;
                    let saved = scratch[col];
                    scratch[col] = saved + JACOBIAN_EPS;
                    let plus = sqrt_info * self.edge_se3_error(&scratch, edge);
                    scratch[col] = saved - JACOBIAN_EPS;
                    let minus = sqrt_info * self.edge_se3_error(&scratch, edge);
                    scratch[col] = saved;
                    for i in 0..6 {
                        jacobian[(row + i, col)] =
                            (plus[i] - minus[i]) / (2.0 * JACOBIAN_EPS);
                    }
                }
            }
        }

        (residuals, jacobian)
    }
}

/// Run bounded Levenberg–Marquardt on the snapshot.
///
/// Returns `Err` only for a non-finite error surface; hitting the iteration
/// bound without meeting the tolerances is reported via
/// [`SolveReport::converged`], with the best estimates found so far.
pub(crate) fn solve(problem: &Problem, max_iterations: usize) -> Result<Solution, MapError> {
    let layout = Layout::build(problem);
    let evaluator = Evaluator::new(problem, &layout);

    let mut params = evaluator.initial_params();
    let initial_chi2 = evaluator.total_chi2(&params);
    if !initial_chi2.is_finite() {
        return Err(MapError::Solver("non-finite initial error".into()));
    }

    let mut chi2 = initial_chi2;
    let mut lambda = LAMBDA_INIT;
    let mut iterations = 0;
    let mut converged = layout.n_params == 0;

    while iterations < max_iterations && !converged {
        iterations += 1;

        let (residuals, jacobian) = evaluator.linearize(&params);
        let gradient = jacobian.transpose() * &residuals;
        if gradient.norm() < GRADIENT_TOLERANCE {
            converged = true;
            break;
        }

        let mut damped = jacobian.transpose() * &jacobian;
        for i in 0..layout.n_params {
            damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
        }

        let Some(delta) = damped.lu().solve(&(-&gradient)) else {
            break;
        };
        if delta.norm() < PARAM_TOLERANCE * (params.norm() + PARAM_TOLERANCE) {
            converged = true;
            break;
        }

        let trial = &params + &delta;
        let trial_chi2 = evaluator.total_chi2(&trial);
        if trial_chi2.is_finite() && trial_chi2 < chi2 {
            params = trial;
            chi2 = trial_chi2;
            lambda = (lambda * LAMBDA_DOWN).max(LAMBDA_MIN);
        } else {
            lambda = (lambda * LAMBDA_UP).min(LAMBDA_MAX);
        }
    }

    let poses = problem
        .poses
        .iter()
        .map(|(id, _)| (*id, evaluator.pose_at(&params, *id)))
        .collect();
    let landmarks = problem
        .landmarks
        .iter()
        .map(|(id, _)| (*id, evaluator.landmark_at(&params, *id)))
        .collect();

    Ok(Solution {
        poses,
        landmarks,
        report: SolveReport {
            iterations,
            initial_chi2,
            final_chi2: chi2,
            converged,
        },
    })
}

/// Squared Mahalanobis residual of an observation edge at given estimates.
pub(crate) fn edge_3d_chi2(edge: &Edge3D, pose: &SE3, landmark: &Vector3<f64>) -> f64 {
    let r = edge.measurement - pose.inverse().transform_point(landmark);
    r.dot(&(edge.information * r))
}

fn sqrt_information3(information: &Matrix3<f64>) -> Matrix3<f64> {
    Cholesky::new(*information)
        .map(|c| c.l().transpose())
        .unwrap_or_else(Matrix3::identity)
}

fn sqrt_information6(information: &Matrix6<f64>) -> Matrix6<f64> {
    Cholesky::new(*information)
        .map(|c| c.l().transpose())
        .unwrap_or_else(Matrix6::identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::RobustKernelKind;
    use approx::assert_relative_eq;

    fn observation(from_pose: u32, to_landmark: u32, measurement: Vector3<f64>) -> Edge3D {
        Edge3D {
            measurement,
            information: Matrix3::identity(),
            from_pose,
            to_landmark,
        }
    }

    #[test]
    fn test_landmark_converges_to_triangulated_position() {
        let pose0 = SE3::identity();
        let pose1 = SE3::from_translation(0.5, 0.0, 0.0);
        let truth = Vector3::new(0.0, 0.0, 1.0);

        let problem = Problem {
            poses: vec![(0, pose0), (1, pose1)],
            landmarks: vec![(100, truth + Vector3::new(0.1, -0.05, 0.2))],
            edges_3d: vec![
                observation(0, 100, pose0.inverse().transform_point(&truth)),
                observation(1, 100, pose1.inverse().transform_point(&truth)),
            ],
            edges_se3: vec![],
            fixed: HashSet::from([VertexId::Pose(1)]),
            kernel: None,
        };

        let solution = solve(&problem, 50).unwrap();
        assert_relative_eq!(solution.landmarks[&100], truth, epsilon = 1e-6);
        assert!(solution.report.final_chi2 < 1e-10);
    }

    #[test]
    fn test_loop_closure_corrects_drifted_chain() {
        let step = SE3::from_translation(1.0, 0.0, 0.0);
        let info = Matrix6::identity();
        // Odometry says one meter per step, the drifted estimates disagree.
        let poses = vec![
            (0, SE3::identity()),
            (1, SE3::from_translation(1.1, 0.0, 0.0)),
            (2, SE3::from_translation(2.2, 0.1, 0.0)),
            (3, SE3::from_translation(3.3, 0.2, 0.0)),
        ];
        let edges_se3 = vec![
            EdgeSE3 { measurement: step, information: info, from_pose: 0, to_pose: 1 },
            EdgeSE3 { measurement: step, information: info, from_pose: 1, to_pose: 2 },
            EdgeSE3 { measurement: step, information: info, from_pose: 2, to_pose: 3 },
            EdgeSE3 {
                measurement: SE3::from_translation(3.0, 0.0, 0.0),
                information: info,
                from_pose: 0,
                to_pose: 3,
            },
        ];

        let problem = Problem {
            poses,
            landmarks: vec![],
            edges_3d: vec![],
            edges_se3,
            fixed: HashSet::new(),
            kernel: None,
        };

        let solution = solve(&problem, 100).unwrap();
        assert_relative_eq!(
            solution.poses[&3].translation,
            Vector3::new(3.0, 0.0, 0.0),
            epsilon = 1e-4
        );
        assert!(solution.report.final_chi2 < 1e-8);
        // The anchor never moves.
        assert_relative_eq!(
            solution.poses[&0].translation,
            Vector3::zeros(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_fixed_landmark_stays_put() {
        let initial = Vector3::new(0.0, 0.0, 1.0);
        let problem = Problem {
            poses: vec![(0, SE3::identity())],
            landmarks: vec![(100, initial)],
            // The measurement disagrees, but the landmark is held constant.
            edges_3d: vec![observation(0, 100, Vector3::new(0.5, 0.5, 1.5))],
            edges_se3: vec![],
            fixed: HashSet::from([VertexId::Landmark(100)]),
            kernel: None,
        };

        let solution = solve(&problem, 20).unwrap();
        assert_relative_eq!(solution.landmarks[&100], initial, epsilon = 1e-12);
    }

    #[test]
    fn test_tukey_kernel_ignores_gross_outlier() {
        let truth = Vector3::new(0.0, 0.0, 1.0);
        let poses = vec![
            (0, SE3::identity()),
            (1, SE3::from_translation(0.2, 0.0, 0.0)),
            (2, SE3::from_translation(-0.2, 0.0, 0.0)),
        ];
        let edges_3d = vec![
            observation(0, 100, truth),
            observation(1, 100, poses[1].1.inverse().transform_point(&truth)),
            observation(2, 100, Vector3::new(5.0, 5.0, 5.0)),
        ];
        let problem = Problem {
            poses,
            landmarks: vec![(100, truth)],
            edges_3d,
            edges_se3: vec![],
            fixed: HashSet::from([VertexId::Pose(1), VertexId::Pose(2)]),
            kernel: Some(RobustKernel::new(RobustKernelKind::Tukey, 1.0)),
        };

        let solution = solve(&problem, 50).unwrap();
        assert_relative_eq!(solution.landmarks[&100], truth, epsilon = 1e-3);
    }

    #[test]
    fn test_empty_problem_is_trivially_converged() {
        let problem = Problem {
            poses: vec![(0, SE3::identity())],
            landmarks: vec![],
            edges_3d: vec![],
            edges_se3: vec![],
            fixed: HashSet::new(),
            kernel: None,
        };
        let solution = solve(&problem, 10).unwrap();
        assert!(solution.report.converged);
        assert_eq!(solution.report.iterations, 0);
    }
}
