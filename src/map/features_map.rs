//! The concurrent feature map: camera trajectory, landmarks, and the
//! double-buffered reconciliation protocol between tracker and optimizer.
//!
//! One tracker thread ingests poses, features, and measurements and runs the
//! queries; one optimizer thread refines the graph in the background. Three
//! locks protect the shared state: the trajectory lock (trajectory, odometry,
//! frame sequences, `last_optimized_pose`), the map lock (landmark vector),
//! and the modifier's buffer lock. `update_map` is the only place two of
//! them are held together, and it starts with a try-lock, so the tracker
//! never waits on the optimizer and vice versa.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use image::RgbImage;
use nalgebra::{Matrix3, Matrix6, Vector3};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::MapConfig;
use crate::error::{MapError, Result};
use crate::geometry::SE3;
use crate::graph::{Edge3D, EdgeSE3, LandmarkVertex, PoseGraph, PoseVertex, RobustKernel};
use crate::io;
use crate::sensor::DepthSensorModel;

use super::feature::{FeatureMeasurement, MapFeature, RgbdFeature, FEATURE_START_ID};
use super::modifier::MapModifier;
use super::optimizer::OptimizationDriver;

/// Depth frame: one 16-bit depth value per pixel.
pub type DepthImage = image::ImageBuffer<image::Luma<u16>, Vec<u16>>;

struct TrajectoryState {
    /// Camera poses, indexable by pose id.
    trajectory: Vec<PoseVertex>,
    /// `odometry[i]` maps pose `i-1` to pose `i`; identity at index 0.
    odometry: Vec<SE3>,
    /// Per-pose RGB and depth frames, parallel to the trajectory.
    images: Vec<RgbImage>,
    depths: Vec<DepthImage>,
    /// Largest pose id whose stored pose reflects an optimized estimate.
    last_optimized_pose: u32,
}

/// The map hub shared between the tracker and the optimization thread.
pub struct FeaturesMap {
    config: MapConfig,
    sensor: DepthSensorModel,
    graph: PoseGraph,
    trajectory: Mutex<TrajectoryState>,
    /// The live landmark vector ("map lock").
    features: Mutex<Vec<MapFeature>>,
    modifier: MapModifier,
    next_feature_id: AtomicU32,
    /// True until the first feature lands; the optimizer idles on it.
    empty_map: AtomicBool,
    continue_opt: AtomicBool,
    passes: AtomicU64,
    opt_thread: Mutex<Option<JoinHandle<()>>>,
}

impl FeaturesMap {
    /// Build an empty map. Construction is explicit and caller-owned; share
    /// it with the optimizer thread through an [`Arc`].
    pub fn new(config: MapConfig, sensor: DepthSensorModel) -> Self {
        Self {
            config,
            sensor,
            graph: PoseGraph::new(),
            trajectory: Mutex::new(TrajectoryState {
                trajectory: Vec::new(),
                odometry: Vec::new(),
                images: Vec::new(),
                depths: Vec::new(),
                last_optimized_pose: 0,
            }),
            features: Mutex::new(Vec::new()),
            modifier: MapModifier::new(),
            next_feature_id: AtomicU32::new(FEATURE_START_ID),
            empty_map: AtomicBool::new(true),
            continue_opt: AtomicBool::new(false),
            passes: AtomicU64::new(0),
            opt_thread: Mutex::new(None),
        }
    }

    /// Load both configurations from YAML files and build the map.
    pub fn from_files<P: AsRef<std::path::Path>>(map_config: P, sensor_config: P) -> Result<Self> {
        let config = MapConfig::from_file(map_config)?;
        let sensor = DepthSensorModel::from_file(sensor_config)?;
        Ok(Self::new(config, sensor))
    }

    /// The map configuration.
    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    /// The depth sensor model shared with callers.
    pub fn sensor(&self) -> &DepthSensorModel {
        &self.sensor
    }

    /// The underlying pose graph.
    pub fn graph(&self) -> &PoseGraph {
        &self.graph
    }

    // ── Ingestion ────────────────────────────────────────────────────────

    /// Append a new camera pose from an odometry increment and return its id.
    ///
    /// The first pose is taken as given (the tracker fixes the world origin
    /// with it); later poses compose onto the previous one.
    pub fn add_new_pose(
        &self,
        pose_change: &SE3,
        timestamp: f64,
        image: RgbImage,
        depth: DepthImage,
    ) -> u32 {
        let vertex = {
            let mut traj = self.trajectory.lock();
            traj.images.push(image);
            traj.depths.push(depth);

            let id = traj.trajectory.len() as u32;
            let previous = traj.trajectory.last().copied();
            let vertex = match previous {
                None => {
                    traj.odometry.push(SE3::identity());
                    PoseVertex::new(id, *pose_change, timestamp)
                }
                Some(previous) => {
                    if timestamp < previous.timestamp {
                        warn!(
                            pose_id = id,
                            timestamp,
                            previous = previous.timestamp,
                            "timestamp regression in trajectory"
                        );
                    }
                    traj.odometry.push(*pose_change);
                    PoseVertex::new(id, previous.pose.compose(pose_change), timestamp)
                }
            };
            traj.trajectory.push(vertex);
            vertex
        };

        if let Err(e) = self.graph.add_vertex_pose(vertex) {
            warn!(pose_id = vertex.id, error = %e, "pose vertex rejected by graph");
        }
        vertex.id
    }

    /// RGB and depth frame recorded with a pose.
    pub fn get_images(&self, pose_no: u32) -> Option<(RgbImage, DepthImage)> {
        let traj = self.trajectory.lock();
        let image = traj.images.get(pose_no as usize)?.clone();
        let depth = traj.depths.get(pose_no as usize)?.clone();
        Some((image, depth))
    }

    /// Add newly triangulated features observed from `pose_id` (last pose if
    /// `None`). Features arrive in the camera frame and are transformed into
    /// the world frame here; each gets a fresh landmark id, is staged for
    /// insertion, and lands in the graph with its observation edge.
    pub fn add_features(&self, features: &[RgbdFeature], pose_id: Option<u32>) -> Result<()> {
        let (camera_pose, pose_id) = {
            let traj = self.trajectory.lock();
            let id = resolve_pose_id(&traj, pose_id)?;
            (traj.trajectory[id as usize].pose, id)
        };

        for feature in features {
            let world_position = camera_pose.transform_point(&feature.position);
            let id = self.next_feature_id.fetch_add(1, Ordering::SeqCst);
            self.modifier.stage_addition(MapFeature {
                id,
                u: feature.u,
                v: feature.v,
                position: world_position,
                poses_ids: vec![pose_id],
                descriptors: feature.descriptors.clone(),
            });

            let information =
                self.observation_information(feature.u, feature.v, feature.position.z);
            if let Err(e) = self
                .graph
                .add_vertex_feature(LandmarkVertex::new(id, world_position))
            {
                warn!(feature_id = id, error = %e, "landmark vertex rejected by graph");
                continue;
            }
            if let Err(e) = self.graph.add_edge_3d(Edge3D {
                measurement: feature.position,
                information,
                from_pose: pose_id,
                to_landmark: id,
            }) {
                warn!(feature_id = id, error = %e, "observation edge rejected by graph");
            }
        }

        self.empty_map.store(false, Ordering::SeqCst);
        self.update_map();
        Ok(())
    }

    /// Record re-observations of known landmarks from `pose_id` (last pose
    /// if `None`). Appends the pose to each landmark's observation list and
    /// adds the observation edge; landmark positions are only ever moved by
    /// the optimizer. Unknown ids drop that measurement and are reported via
    /// the returned error, without touching the rest.
    pub fn add_measurements(
        &self,
        measurements: &[FeatureMeasurement],
        pose_id: Option<u32>,
    ) -> Result<()> {
        let pose_id = {
            let traj = self.trajectory.lock();
            resolve_pose_id(&traj, pose_id)?
        };

        let mut first_unknown = None;
        for measurement in measurements {
            let known = {
                let mut features = self.features.lock();
                match features
                    .iter_mut()
                    .find(|f| f.id == measurement.feature_id)
                {
                    Some(feature) => {
                        feature.poses_ids.push(pose_id);
                        true
                    }
                    None => false,
                }
            } || self
                .modifier
                .append_pose_to_pending(measurement.feature_id, pose_id);

            if !known {
                warn!(
                    feature_id = measurement.feature_id,
                    pose_id, "measurement references unknown feature, dropped"
                );
                first_unknown.get_or_insert(measurement.feature_id);
                continue;
            }

            let information = self.observation_information(
                measurement.u,
                measurement.v,
                measurement.position.z,
            );
            if let Err(e) = self.graph.add_edge_3d(Edge3D {
                measurement: measurement.position,
                information,
                from_pose: pose_id,
                to_landmark: measurement.feature_id,
            }) {
                warn!(
                    feature_id = measurement.feature_id,
                    error = %e,
                    "measurement edge rejected by graph"
                );
            }
        }

        match first_unknown {
            Some(id) => Err(MapError::UnknownFeature(id)),
            None => Ok(()),
        }
    }

    /// Add a pose-to-pose constraint (loop closure or externally estimated
    /// odometry) with identity information.
    pub fn add_measurement(&self, pose_from: u32, pose_to: u32, transform: &SE3) -> Result<()> {
        self.graph.add_edge_se3(EdgeSE3 {
            measurement: *transform,
            information: Matrix6::identity(),
            from_pose: pose_from,
            to_pose: pose_to,
        })
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Snapshot of every landmark in the live map.
    pub fn get_all_features(&self) -> Vec<MapFeature> {
        let snapshot = self.features.lock().clone();
        self.update_map();
        snapshot
    }

    /// World position of one landmark.
    pub fn get_feature_position(&self, feature_id: u32) -> Result<Vector3<f64>> {
        let position = {
            let features = self.features.lock();
            features
                .iter()
                .find(|f| f.id == feature_id)
                .map(|f| f.position)
                .ok_or(MapError::UnknownFeature(feature_id))?
        };
        self.update_map();
        Ok(position)
    }

    /// Landmarks that project into the image window from a camera pose.
    pub fn get_visible_features(&self, camera_pose: &SE3) -> Vec<MapFeature> {
        let camera_from_world = camera_pose.inverse();
        let visible = {
            let features = self.features.lock();
            features
                .iter()
                .filter(|f| {
                    let in_camera = camera_from_world.transform_point(&f.position);
                    let projected =
                        self.sensor
                            .inverse_model(in_camera.x, in_camera.y, in_camera.z);
                    projected != crate::sensor::INVALID_PROJECTION
                })
                .cloned()
                .collect()
        };
        self.update_map();
        visible
    }

    /// For each query landmark, the observing pose whose viewing ray best
    /// matches the current one (maximum dot product of the camera z-axes in
    /// the feature-relative frame). `None` for a landmark nothing observed.
    pub fn find_nearest_frame(&self, features: &[MapFeature]) -> Vec<Option<u32>> {
        let current_pose = self.get_sensor_pose(None);
        features
            .iter()
            .map(|feature| match feature.poses_ids.as_slice() {
                [] => None,
                [only] => Some(*only),
                poses_ids => {
                    let world_from_feature = SE3::from_parts(
                        nalgebra::UnitQuaternion::identity(),
                        feature.position,
                    );
                    let feature_from_world = world_from_feature.inverse();
                    let current_ray = view_ray(&feature_from_world, &current_pose);
                    let mut best = (f64::NEG_INFINITY, poses_ids[0]);
                    for &pose_id in poses_ids {
                        let pose = self.get_sensor_pose(Some(pose_id));
                        let dot = view_ray(&feature_from_world, &pose).dot(&current_ray);
                        if dot > best.0 {
                            best = (dot, pose_id);
                        }
                    }
                    Some(best.1)
                }
            })
            .collect()
    }

    /// Best-effort pose of the sensor (last pose if `None`).
    ///
    /// Optimized poses are served as stored; for the unoptimized tail the
    /// pose is composed from the last optimized one through the raw odometry
    /// increments, so the tracker gets a usable estimate without waiting for
    /// the optimizer to catch up.
    pub fn get_sensor_pose(&self, pose_id: Option<u32>) -> SE3 {
        let traj = self.trajectory.lock();
        if traj.trajectory.is_empty() {
            return SE3::identity();
        }
        let last = traj.trajectory.len() as u32 - 1;
        let pose_id = pose_id.unwrap_or(last).min(last);

        if pose_id <= traj.last_optimized_pose {
            return traj.trajectory[pose_id as usize].pose;
        }
        let mut pose = traj.trajectory[traj.last_optimized_pose as usize].pose;
        for i in (traj.last_optimized_pose + 1)..=pose_id {
            pose = pose.compose(&traj.odometry[i as usize]);
        }
        pose
    }

    /// Number of poses in the trajectory.
    pub fn trajectory_len(&self) -> usize {
        self.trajectory.lock().trajectory.len()
    }

    // ── Reconciliation ───────────────────────────────────────────────────

    /// Drain the modifier into the live map if the map lock is free right
    /// now. Never blocks: when the lock is contended the drain is simply
    /// deferred to the next caller. Returns whether a drain happened.
    pub fn update_map(&self) -> bool {
        let Some(mut features) = self.features.try_lock() else {
            return false;
        };
        let (additions, updates) = self.modifier.take();
        if !additions.is_empty() {
            debug!(count = additions.len(), "merging staged features into map");
            features.extend(additions);
        }
        for update in updates {
            if let Some(feature) = features.iter_mut().find(|f| f.id == update.id) {
                feature.position = update.position;
            }
        }
        true
    }

    /// Write optimized poses back into the trajectory and advance the
    /// optimized prefix marker.
    pub fn update_cam_trajectory(&self, poses: &[PoseVertex]) {
        let mut traj = self.trajectory.lock();
        for updated in poses {
            let index = updated.id as usize;
            if index >= traj.trajectory.len() {
                continue;
            }
            traj.trajectory[index].pose = updated.pose;
            if updated.id > traj.last_optimized_pose {
                traj.last_optimized_pose = updated.id;
            }
        }
    }

    // ── Optimization lifecycle ───────────────────────────────────────────

    /// Spawn the background optimization thread for a shared map. Each pass
    /// runs at most `iterations` solver iterations with the given robust
    /// kernel.
    pub fn start_optimization_thread(
        map: &Arc<FeaturesMap>,
        iterations: usize,
        kernel: Option<RobustKernel>,
    ) -> Result<()> {
        let mut slot = map.opt_thread.lock();
        if slot.is_some() {
            warn!("optimization thread already running");
            return Ok(());
        }
        map.continue_opt.store(true, Ordering::SeqCst);
        let driver = OptimizationDriver::new(Arc::clone(map), iterations, kernel);
        let handle = thread::Builder::new()
            .name("map-optimizer".into())
            .spawn(move || driver.run())?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stop the optimization thread (it runs one terminal pass first), then
    /// export the trajectory and the graph.
    pub fn finish_optimization<P: AsRef<std::path::Path>>(
        &self,
        trajectory_path: P,
        graph_path: P,
    ) -> Result<()> {
        self.continue_opt.store(false, Ordering::SeqCst);
        let handle = self.opt_thread.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| MapError::Solver("optimization thread panicked".into()))?;
        }
        self.graph.export_rgbdslam(trajectory_path)?;
        self.graph.save_to_file(graph_path)?;
        Ok(())
    }

    /// Completed optimization passes, including the terminal one.
    pub fn optimization_passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Human-readable text dump of trajectory, landmarks, and descriptors.
    pub fn save_map<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let trajectory = self.trajectory.lock().trajectory.clone();
        let features = self.features.lock().clone();
        io::map_file::save_map(path, &trajectory, &features)
    }

    /// Octave/MATLAB script plotting landmarks, measurements, and
    /// covariance ellipses.
    pub fn export_plot_script<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        io::octave::export_plot_script(path, &self.graph)
    }

    // ── Driver internals ─────────────────────────────────────────────────

    pub(crate) fn modifier(&self) -> &MapModifier {
        &self.modifier
    }

    pub(crate) fn keep_optimizing(&self) -> bool {
        self.continue_opt.load(Ordering::SeqCst)
    }

    pub(crate) fn map_is_empty(&self) -> bool {
        self.empty_map.load(Ordering::SeqCst)
    }

    pub(crate) fn note_pass_complete(&self) {
        self.passes.fetch_add(1, Ordering::SeqCst);
    }

    fn observation_information(&self, u: u16, v: u16, depth: f64) -> Matrix3<f64> {
        if !self.config.use_uncertainty {
            return Matrix3::identity();
        }
        match self
            .sensor
            .information_matrix_from_image_coordinates(f64::from(u), f64::from(v), depth)
        {
            Some(information) => information,
            None => {
                warn!(
                    u = u32::from(u),
                    v = u32::from(v),
                    depth,
                    "singular measurement covariance, using identity"
                );
                Matrix3::identity()
            }
        }
    }
}

fn resolve_pose_id(traj: &TrajectoryState, pose_id: Option<u32>) -> Result<u32> {
    let len = traj.trajectory.len() as u32;
    match pose_id {
        Some(id) if id < len => Ok(id),
        Some(id) => Err(MapError::UnknownPose(id)),
        None if len > 0 => Ok(len - 1),
        None => Err(MapError::UnknownPose(0)),
    }
}

/// Camera viewing ray (z-axis) expressed in the feature-relative frame.
fn view_ray(feature_from_world: &SE3, camera_pose: &SE3) -> Vector3<f64> {
    let rotation = feature_from_world.compose(camera_pose).rotation_matrix();
    Vector3::new(rotation[(0, 2)], rotation[(1, 2)], rotation[(2, 2)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::RobustKernelKind;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use std::time::Duration;

    fn blank_frames() -> (RgbImage, DepthImage) {
        (RgbImage::new(1, 1), DepthImage::new(1, 1))
    }

    fn test_map() -> Arc<FeaturesMap> {
        Arc::new(FeaturesMap::new(
            MapConfig::default(),
            DepthSensorModel::new(crate::sensor::SensorConfig::default()).unwrap(),
        ))
    }

    fn feature_at(position: Vector3<f64>) -> RgbdFeature {
        RgbdFeature {
            u: 320,
            v: 240,
            position,
            descriptors: vec![],
        }
    }

    fn add_pose(map: &FeaturesMap, dt: SE3, timestamp: f64) -> u32 {
        let (image, depth) = blank_frames();
        map.add_new_pose(&dt, timestamp, image, depth)
    }

    #[test]
    fn test_single_feature_lands_in_world_frame() {
        let map = test_map();
        let pose_id = add_pose(&map, SE3::identity(), 0.0);
        map.add_features(&[feature_at(Vector3::new(0.0, 0.0, 1.0))], Some(pose_id))
            .unwrap();

        let features = map.get_all_features();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].id, FEATURE_START_ID);
        assert_relative_eq!(
            features[0].position,
            Vector3::new(0.0, 0.0, 1.0),
            epsilon = 1e-12
        );
        assert_eq!(features[0].poses_ids, vec![pose_id]);
    }

    #[test]
    fn test_features_transform_by_observing_pose() {
        let map = test_map();
        add_pose(&map, SE3::identity(), 0.0);
        add_pose(&map, SE3::from_translation(1.0, 0.0, 0.0), 0.1);
        map.add_features(&[feature_at(Vector3::new(0.0, 0.0, 1.0))], None)
            .unwrap();

        let position = map.get_feature_position(FEATURE_START_ID).unwrap();
        assert_relative_eq!(position, Vector3::new(1.0, 0.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_sensor_pose_composes_odometry() {
        let map = test_map();
        let step = SE3::from_translation(1.0, 0.0, 0.0);
        for i in 0..3 {
            add_pose(&map, step, i as f64);
        }
        let pose = map.get_sensor_pose(None);
        assert_relative_eq!(pose.translation, Vector3::new(3.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_sensor_pose_prefix_and_tail() {
        let map = test_map();
        let step = SE3::from_translation(1.0, 0.0, 0.0);
        for i in 0..4 {
            add_pose(&map, step, i as f64);
        }

        // Pretend an optimization pass moved poses 0 and 1.
        map.update_cam_trajectory(&[
            PoseVertex::new(0, SE3::from_translation(1.0, 0.5, 0.0), 0.0),
            PoseVertex::new(1, SE3::from_translation(2.0, 0.5, 0.0), 1.0),
        ]);

        // Optimized prefix is served as stored.
        assert_relative_eq!(
            map.get_sensor_pose(Some(1)).translation,
            Vector3::new(2.0, 0.5, 0.0),
            epsilon = 1e-12
        );
        // The tail composes odometry from the optimized prefix, one step per
        // pose, and only up to the requested pose.
        assert_relative_eq!(
            map.get_sensor_pose(Some(2)).translation,
            Vector3::new(3.0, 0.5, 0.0),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            map.get_sensor_pose(Some(3)).translation,
            Vector3::new(4.0, 0.5, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_feature_ids_unique_and_above_start() {
        let map = test_map();
        add_pose(&map, SE3::identity(), 0.0);
        let features: Vec<RgbdFeature> = (0..5)
            .map(|i| feature_at(Vector3::new(i as f64 * 0.1, 0.0, 1.0)))
            .collect();
        map.add_features(&features, None).unwrap();

        let stored = map.get_all_features();
        let mut ids: Vec<u32> = stored.iter().map(|f| f.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 5);
        assert!(ids.iter().all(|&id| id >= FEATURE_START_ID));
    }

    #[test]
    fn test_poses_ids_reference_existing_poses() {
        let map = test_map();
        add_pose(&map, SE3::identity(), 0.0);
        add_pose(&map, SE3::from_translation(0.1, 0.0, 0.0), 0.1);
        map.add_features(&[feature_at(Vector3::new(0.0, 0.0, 1.0))], Some(0))
            .unwrap();
        map.add_measurements(
            &[FeatureMeasurement {
                feature_id: FEATURE_START_ID,
                u: 320,
                v: 240,
                position: Vector3::new(-0.1, 0.0, 1.0),
            }],
            Some(1),
        )
        .unwrap();

        let len = map.trajectory_len() as u32;
        for feature in map.get_all_features() {
            assert!(feature.poses_ids.iter().all(|&p| p < len));
        }
    }

    #[test]
    fn test_repeated_measurements_accumulate() {
        let map = test_map();
        add_pose(&map, SE3::identity(), 0.0);
        map.add_features(&[feature_at(Vector3::new(0.0, 0.0, 1.0))], None)
            .unwrap();
        let edges_before = map.graph().num_edges_3d();

        let measurement = FeatureMeasurement {
            feature_id: FEATURE_START_ID,
            u: 320,
            v: 240,
            position: Vector3::new(0.0, 0.0, 1.0),
        };
        map.add_measurements(&[measurement.clone()], Some(0)).unwrap();
        map.add_measurements(&[measurement], Some(0)).unwrap();

        assert_eq!(map.graph().num_edges_3d(), edges_before + 2);
        let features = map.get_all_features();
        assert_eq!(features[0].poses_ids, vec![0, 0, 0]);
    }

    #[test]
    fn test_unknown_measurement_is_dropped_loudly() {
        let map = test_map();
        add_pose(&map, SE3::identity(), 0.0);
        let result = map.add_measurements(
            &[FeatureMeasurement {
                feature_id: FEATURE_START_ID + 99,
                u: 0,
                v: 0,
                position: Vector3::new(0.0, 0.0, 1.0),
            }],
            None,
        );
        assert!(matches!(
            result,
            Err(MapError::UnknownFeature(id)) if id == FEATURE_START_ID + 99
        ));
        assert_eq!(map.graph().num_edges_3d(), 0);
    }

    #[test]
    fn test_get_feature_position_matches_get_all_features() {
        let map = test_map();
        add_pose(&map, SE3::identity(), 0.0);
        map.add_features(
            &[
                feature_at(Vector3::new(0.2, 0.1, 1.5)),
                feature_at(Vector3::new(-0.4, 0.3, 2.5)),
            ],
            None,
        )
        .unwrap();

        for feature in map.get_all_features() {
            let position = map.get_feature_position(feature.id).unwrap();
            assert_eq!(position, feature.position);
        }
    }

    #[test]
    fn test_update_map_drains_modifier() {
        let map = test_map();
        add_pose(&map, SE3::identity(), 0.0);
        map.add_features(&[feature_at(Vector3::new(0.0, 0.0, 1.0))], None)
            .unwrap();
        // add_features already attempted a drain; stage an update to verify
        // the queues empty out again.
        map.modifier().stage_updates(vec![LandmarkVertex::new(
            FEATURE_START_ID,
            Vector3::new(0.0, 0.0, 2.0),
        )]);
        assert!(map.update_map());
        assert!(!map.modifier().has_pending());
        assert_relative_eq!(
            map.get_feature_position(FEATURE_START_ID).unwrap(),
            Vector3::new(0.0, 0.0, 2.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_visible_features_respect_frustum() {
        let map = test_map();
        add_pose(&map, SE3::identity(), 0.0);
        map.add_features(
            &[
                feature_at(Vector3::new(0.0, 0.0, 2.0)),
                feature_at(Vector3::new(0.0, 0.0, -2.0)),
            ],
            None,
        )
        .unwrap();
        map.update_map();

        let visible = map.get_visible_features(&SE3::identity());
        assert_eq!(visible.len(), 1);
        assert_relative_eq!(
            visible[0].position,
            Vector3::new(0.0, 0.0, 2.0),
            epsilon = 1e-12
        );

        // Turned around, the camera faces the other landmark.
        let about_face = SE3::from_parts(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, std::f64::consts::PI, 0.0)),
            Vector3::zeros(),
        );
        let visible = map.get_visible_features(&about_face);
        assert_eq!(visible.len(), 1);
        assert_relative_eq!(
            visible[0].position,
            Vector3::new(0.0, 0.0, -2.0),
            epsilon = 1e-12
        );

        // A quarter turn puts both landmarks beside the optical axis.
        let sideways = SE3::from_parts(
            UnitQuaternion::from_scaled_axis(Vector3::new(
                0.0,
                std::f64::consts::FRAC_PI_2,
                0.0,
            )),
            Vector3::zeros(),
        );
        assert!(map.get_visible_features(&sideways).is_empty());
    }

    #[test]
    fn test_find_nearest_frame_prefers_aligned_view() {
        let map = test_map();
        // Pose 0 looks straight down +z at the feature.
        add_pose(&map, SE3::identity(), 0.0);
        map.add_features(&[feature_at(Vector3::new(0.0, 0.0, 2.0))], None)
            .unwrap();
        map.update_map();

        // Pose 1 is rotated a quarter turn about y, pose 2 turns back.
        let quarter = SE3::from_parts(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, std::f64::consts::FRAC_PI_2, 0.0)),
            Vector3::zeros(),
        );
        add_pose(&map, quarter, 1.0);
        map.add_measurements(
            &[FeatureMeasurement {
                feature_id: FEATURE_START_ID,
                u: 320,
                v: 240,
                position: Vector3::new(-2.0, 0.0, 0.0),
            }],
            Some(1),
        )
        .unwrap();
        add_pose(&map, quarter.inverse(), 2.0);

        let features = map.get_all_features();
        let nearest = map.find_nearest_frame(&features);
        // The current pose looks down +z again, so pose 0 aligns best.
        assert_eq!(nearest, vec![Some(0)]);

        // A single observing pose is returned directly.
        let mut lone = features[0].clone();
        lone.poses_ids = vec![1];
        assert_eq!(map.find_nearest_frame(&[lone]), vec![Some(1)]);

        // No observing pose at all.
        let mut orphan = features[0].clone();
        orphan.poses_ids.clear();
        assert_eq!(map.find_nearest_frame(&[orphan]), vec![None]);
    }

    #[test]
    fn test_images_stored_per_pose() {
        let map = test_map();
        let image = RgbImage::from_pixel(2, 2, image::Rgb([7, 8, 9]));
        let depth = DepthImage::from_pixel(2, 2, image::Luma([1234]));
        map.add_new_pose(&SE3::identity(), 0.0, image.clone(), depth.clone());

        let (stored_image, stored_depth) = map.get_images(0).unwrap();
        assert_eq!(stored_image, image);
        assert_eq!(stored_depth, depth);
        assert!(map.get_images(1).is_none());
    }

    #[test]
    fn test_optimizer_idles_until_features_arrive() {
        let map = test_map();
        FeaturesMap::start_optimization_thread(&map, 5, None).unwrap();

        // No features yet: the driver sits in its poll loop.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(map.optimization_passes(), 0);

        add_pose(&map, SE3::identity(), 0.0);
        map.add_features(&[feature_at(Vector3::new(0.0, 0.0, 1.0))], None)
            .unwrap();

        // One poll interval is 200 ms; give it a little headroom.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while map.optimization_passes() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(map.optimization_passes() > 0);

        let dir = std::env::temp_dir();
        map.finish_optimization(
            dir.join("rgbd-map-idle-trajectory.txt"),
            dir.join("rgbd-map-idle-graph.g2o"),
        )
        .unwrap();
    }

    #[test]
    fn test_weak_features_dropped_from_final_graph() {
        let config = MapConfig {
            weak_feature_thr: 2,
            ..MapConfig::default()
        };
        let map = Arc::new(FeaturesMap::new(
            config,
            DepthSensorModel::new(crate::sensor::SensorConfig::default()).unwrap(),
        ));
        add_pose(&map, SE3::identity(), 0.0);
        let descriptor = crate::map::ExtendedDescriptor::new(
            0,
            nalgebra::DMatrix::from_element(2, 2, 0.5),
        );
        let mut weak = feature_at(Vector3::new(0.5, 0.0, 2.0));
        weak.descriptors = vec![descriptor.clone()];
        map.add_features(&[feature_at(Vector3::new(0.0, 0.0, 1.0)), weak], Some(0))
            .unwrap();
        add_pose(&map, SE3::from_translation(0.1, 0.0, 0.0), 0.1);
        // Only the first landmark gets a second observation.
        map.add_measurements(
            &[FeatureMeasurement {
                feature_id: FEATURE_START_ID,
                u: 320,
                v: 240,
                position: Vector3::new(-0.1, 0.0, 1.0),
            }],
            Some(1),
        )
        .unwrap();

        FeaturesMap::start_optimization_thread(&map, 5, None).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while map.optimization_passes() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let dir = std::env::temp_dir();
        let graph_path = dir.join("rgbd-map-weak-graph.g2o");
        map.finish_optimization(dir.join("rgbd-map-weak-trajectory.txt"), graph_path.clone())
            .unwrap();

        // The weak landmark is gone from the graph and its export; the
        // well-observed one remains.
        assert!(map.graph().measurements_of(FEATURE_START_ID).is_ok());
        assert!(map.graph().measurements_of(FEATURE_START_ID + 1).is_err());
        let graph_text = std::fs::read_to_string(&graph_path).unwrap();
        assert!(graph_text.contains(&format!("VERTEX_TRACKXYZ {} ", FEATURE_START_ID)));
        assert!(!graph_text.contains(&format!("VERTEX_TRACKXYZ {} ", FEATURE_START_ID + 1)));

        // The live map keeps both landmarks, descriptors untouched.
        let features = map.get_all_features();
        assert_eq!(features.len(), 2);
        let kept = features
            .iter()
            .find(|f| f.id == FEATURE_START_ID + 1)
            .unwrap();
        assert_eq!(kept.descriptors, vec![descriptor]);
    }

    #[test]
    fn test_optimizer_refines_reobserved_landmark() {
        let map = test_map();
        add_pose(&map, SE3::identity(), 0.0);
        map.add_features(&[feature_at(Vector3::new(0.0, 0.0, 1.0))], Some(0))
            .unwrap();
        add_pose(&map, SE3::from_translation(0.1, 0.0, 0.0), 0.1);
        map.add_measurements(
            &[FeatureMeasurement {
                feature_id: FEATURE_START_ID,
                u: 320,
                v: 240,
                position: Vector3::new(-0.1, 0.0, 1.0),
            }],
            Some(1),
        )
        .unwrap();

        FeaturesMap::start_optimization_thread(
            &map,
            10,
            Some(RobustKernel::new(RobustKernelKind::Huber, 1.0)),
        )
        .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while map.optimization_passes() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let dir = std::env::temp_dir();
        map.finish_optimization(
            dir.join("rgbd-map-refine-trajectory.txt"),
            dir.join("rgbd-map-refine-graph.g2o"),
        )
        .unwrap();

        let features = map.get_all_features();
        assert_eq!(features.len(), 1);
        assert_relative_eq!(
            features[0].position,
            Vector3::new(0.0, 0.0, 1.0),
            epsilon = 1e-3
        );
        assert_eq!(features[0].poses_ids, vec![0, 1]);
        assert!(map.optimization_passes() > 0);
    }
}
