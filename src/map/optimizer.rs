//! Background optimization driver.
//!
//! Runs on its own thread: waits for the map to hold at least one feature,
//! then keeps relinearizing the pose graph, staging refined landmark
//! positions through the modifier, and writing optimized poses back into the
//! trajectory. All map interaction goes through the non-blocking
//! `update_map`, so a solve never stalls the tracker. Shutdown is
//! cooperative: the flag is checked between passes, never mid-solve, and one
//! terminal pass runs before the thread exits.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::graph::RobustKernel;

use super::features_map::FeaturesMap;

/// Sleep interval while waiting for the first feature.
const EMPTY_MAP_POLL: Duration = Duration::from_millis(200);

/// Solver iterations of the terminal pass.
const FINAL_PASS_ITERATIONS: usize = 10;

/// The optimizer-thread body, owning its shared handle to the map.
pub struct OptimizationDriver {
    map: Arc<FeaturesMap>,
    iterations: usize,
    kernel: Option<RobustKernel>,
}

impl OptimizationDriver {
    pub fn new(map: Arc<FeaturesMap>, iterations: usize, kernel: Option<RobustKernel>) -> Self {
        Self {
            map,
            iterations,
            kernel,
        }
    }

    /// Thread main loop.
    pub fn run(self) {
        // Nothing to optimize until the tracker adds a feature.
        while self.map.keep_optimizing() && self.map.map_is_empty() {
            std::thread::sleep(EMPTY_MAP_POLL);
        }

        while self.map.keep_optimizing() {
            self.run_pass(self.iterations);
        }

        debug!("running terminal optimization pass");
        self.terminal_pass();
        info!(
            passes = self.map.optimization_passes(),
            "optimization thread finished"
        );
    }

    fn run_pass(&self, iterations: usize) {
        self.configure_kernel();

        let report = match self.map.graph().optimize(iterations) {
            Ok(report) => report,
            Err(e) => {
                // The estimates are untouched; skip the apply and keep going.
                warn!(error = %e, "optimization pass failed");
                return;
            }
        };

        let updates = self.map.graph().optimized_features();
        self.map.modifier().stage_updates(updates);
        self.map.update_map();

        let pruning_threshold = self.map.config().edges_3d_pruning_threshold;
        if pruning_threshold > 0.0 {
            self.map.graph().prune_edges_3d(pruning_threshold);
        }

        let poses = self.map.graph().optimized_poses();
        self.map.update_cam_trajectory(&poses);

        if self.map.config().fix_vertices {
            self.map.graph().fix_optimized_vertices();
        }

        debug!(
            iterations = report.iterations,
            final_chi2 = report.final_chi2,
            "optimization pass applied"
        );
        self.map.note_pass_complete();
    }

    /// One last full pass after shutdown was requested: drop weak landmarks
    /// and pruned edges from the exported graph, release fixed vertices, and
    /// leave the map holding the final estimates.
    fn terminal_pass(&self) {
        self.configure_kernel();

        let weak_threshold = self.map.config().weak_feature_thr;
        if weak_threshold > 0 {
            let removed = self.map.graph().remove_weak_features(weak_threshold);
            info!(removed, weak_threshold, "weak features removed");
        }
        if self.map.config().fix_vertices {
            self.map.graph().release_fixed_vertices();
        }
        let pruning_threshold = self.map.config().edges_3d_pruning_threshold;
        if pruning_threshold > 0.0 {
            self.map.graph().prune_edges_3d(pruning_threshold);
        }

        match self.map.graph().optimize(FINAL_PASS_ITERATIONS) {
            Ok(_) => {
                self.apply_results();
                self.map.note_pass_complete();
            }
            Err(e) => warn!(error = %e, "terminal optimization pass failed"),
        }
    }

    /// Stage optimized landmarks, attempt the hand-off, and write optimized
    /// poses back into the trajectory.
    fn apply_results(&self) {
        let updates = self.map.graph().optimized_features();
        self.map.modifier().stage_updates(updates);
        self.map.update_map();

        let poses = self.map.graph().optimized_poses();
        self.map.update_cam_trajectory(&poses);
    }

    fn configure_kernel(&self) {
        match self.kernel {
            Some(kernel) => self.map.graph().set_robust_kernel(kernel),
            None => self.map.graph().disable_robust_kernel(),
        }
    }
}
