use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nalgebra::{DMatrix, Vector3};
use tracing::info;

use rgbd_map::graph::{RobustKernel, RobustKernelKind};
use rgbd_map::map::ExtendedDescriptor;
use rgbd_map::sensor::INVALID_PROJECTION;
use rgbd_map::{
    DepthImage, DepthSensorModel, FeatureMeasurement, FeaturesMap, MapConfig, RgbdFeature,
    SensorConfig, FEATURE_START_ID, SE3,
};

const STEPS: usize = 25;
const STEP_X: f64 = 0.04;
const DRIFT_X: f64 = 0.002;

/// Replays a synthetic tracker against the map backend: a camera sweeping
/// along +x past a wall of landmarks, with slightly drifting odometry, a
/// loop-closure constraint at the end, and the optimizer thread running
/// throughout. Everything the backend persists lands in the output
/// directory (first CLI argument, `out` by default).
fn main() -> Result<()> {
    // Initialize tracing subscriber with environment filter
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let out_dir = PathBuf::from(std::env::args().nth(1).unwrap_or_else(|| "out".to_string()));
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating output directory {}", out_dir.display()))?;

    let sensor = DepthSensorModel::new(SensorConfig::default())?;
    let config = MapConfig {
        use_uncertainty: true,
        weak_feature_thr: 2,
        ..MapConfig::default()
    };
    let map = Arc::new(FeaturesMap::new(config, sensor));
    FeaturesMap::start_optimization_thread(
        &map,
        15,
        Some(RobustKernel::new(RobustKernelKind::Huber, 1.0)),
    )?;

    // A wall of landmarks two meters ahead of the sweep.
    let landmarks: Vec<Vector3<f64>> = (0..3)
        .flat_map(|row| {
            (0..4).map(move |col| {
                Vector3::new(0.4 * f64::from(col), 0.3 * f64::from(row) - 0.3, 2.0)
            })
        })
        .collect();

    let mut true_pose = SE3::identity();
    let mut mapped_ids: Vec<Option<u32>> = vec![None; landmarks.len()];
    let mut allocated = 0u32;

    for step in 0..STEPS {
        let timestamp = step as f64 / 30.0;
        let (true_dt, measured_dt) = if step == 0 {
            (SE3::identity(), SE3::identity())
        } else {
            // Odometry over-reports the forward motion a little.
            (
                SE3::from_translation(STEP_X, 0.0, 0.0),
                SE3::from_translation(STEP_X + DRIFT_X, 0.0, 0.0),
            )
        };
        true_pose = true_pose.compose(&true_dt);

        let pose_id = map.add_new_pose(
            &measured_dt,
            timestamp,
            image::RgbImage::new(1, 1),
            DepthImage::new(1, 1),
        );

        // The matcher boundary: project each landmark through the true pose
        // and split the visible ones into fresh detections and
        // re-observations of already-mapped ids.
        let mut detections = Vec::new();
        let mut measurements = Vec::new();
        let world_to_camera = true_pose.inverse();
        for (scene_idx, landmark) in landmarks.iter().enumerate() {
            let in_camera = world_to_camera.transform_point(landmark);
            let projected = map
                .sensor()
                .inverse_model(in_camera.x, in_camera.y, in_camera.z);
            if projected == INVALID_PROJECTION {
                continue;
            }
            let (u, v) = (projected.x.round() as u16, projected.y.round() as u16);
            match mapped_ids[scene_idx] {
                Some(feature_id) => measurements.push(FeatureMeasurement {
                    feature_id,
                    u,
                    v,
                    position: in_camera,
                }),
                None => {
                    detections.push(RgbdFeature {
                        u,
                        v,
                        position: in_camera,
                        descriptors: vec![ExtendedDescriptor::new(
                            pose_id,
                            DMatrix::from_element(4, 4, scene_idx as f64),
                        )],
                    });
                    // Landmark ids are handed out in staging order.
                    mapped_ids[scene_idx] = Some(FEATURE_START_ID + allocated);
                    allocated += 1;
                }
            }
        }

        if !detections.is_empty() {
            map.add_features(&detections, Some(pose_id))?;
        }
        if !measurements.is_empty() {
            map.add_measurements(&measurements, Some(pose_id))?;
        }
    }

    // The drift-free loop constraint an external loop detector would supply.
    let last_pose = map.trajectory_len() as u32 - 1;
    map.add_measurement(
        0,
        last_pose,
        &SE3::from_translation(STEP_X * (STEPS - 1) as f64, 0.0, 0.0),
    )?;

    // Give the optimizer a moment to digest the loop closure.
    std::thread::sleep(Duration::from_millis(500));

    let estimated = map.get_sensor_pose(None);
    info!(
        estimated_x = estimated.translation.x,
        odometry_only_x = (STEP_X + DRIFT_X) * (STEPS - 1) as f64,
        true_x = STEP_X * (STEPS - 1) as f64,
        "final pose estimate"
    );

    map.finish_optimization(out_dir.join("trajectory.txt"), out_dir.join("graph.g2o"))?;
    map.save_map(out_dir.join("map.txt"))?;
    map.export_plot_script(out_dir.join("map.m"))?;

    info!(
        poses = map.trajectory_len(),
        features = map.get_all_features().len(),
        passes = map.optimization_passes(),
        output = %out_dir.display(),
        "map backend demo finished"
    );
    Ok(())
}
