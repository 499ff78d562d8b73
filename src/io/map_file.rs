//! Human-readable text dump of the map, and its loader.
//!
//! One `Pose` line per trajectory entry (row-major 3×4 transform), then per
//! landmark a `Feature` line, a `FeaturePoseIds` line, and a
//! `FeatureExtendedDescriptors` block with one row-major descriptor per
//! line. Floats are written with Rust's shortest round-tripping formatting,
//! so positions and descriptor values reload bit-exactly. Timestamps are not
//! part of the dump.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::{DMatrix, Vector3};

use crate::error::{MapError, Result};
use crate::geometry::SE3;
use crate::graph::PoseVertex;
use crate::map::{ExtendedDescriptor, MapFeature};

/// Write the trajectory and landmark set as a text dump.
pub fn save_map<P: AsRef<Path>>(
    path: P,
    trajectory: &[PoseVertex],
    features: &[MapFeature],
) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    writeln!(file, "#Legend:")?;
    writeln!(file, "#Pose pose_id pose(0,0) pose(0,1) ... pose(2,3)")?;
    writeln!(
        file,
        "#Feature feature_id feature_x feature_y feature_z feature_u feature_v"
    )?;
    writeln!(file, "#FeaturePoseIds pose_id1 pose_id2 ...")?;
    writeln!(
        file,
        "#FeatureExtendedDescriptors count, then per descriptor: pose_id rows cols values row-major"
    )?;

    for vertex in trajectory {
        write!(file, "Pose {}", vertex.id)?;
        for value in vertex.pose.matrix3x4() {
            write!(file, " {value}")?;
        }
        writeln!(file)?;
    }

    for feature in features {
        let p = feature.position;
        writeln!(
            file,
            "Feature {} {} {} {} {} {}",
            feature.id, p.x, p.y, p.z, feature.u, feature.v
        )?;
        write!(file, "FeaturePoseIds")?;
        for pose_id in &feature.poses_ids {
            write!(file, " {pose_id}")?;
        }
        writeln!(file)?;
        writeln!(
            file,
            "FeatureExtendedDescriptors {}",
            feature.descriptors.len()
        )?;
        for descriptor in &feature.descriptors {
            let d = &descriptor.descriptor;
            write!(file, "{} {} {}", descriptor.pose_id, d.nrows(), d.ncols())?;
            for row in 0..d.nrows() {
                for col in 0..d.ncols() {
                    write!(file, " {}", d[(row, col)])?;
                }
            }
            writeln!(file)?;
        }
    }
    Ok(())
}

/// Parse a dump written by [`save_map`] back into trajectory and landmarks.
pub fn load_map<P: AsRef<Path>>(path: P) -> Result<(Vec<PoseVertex>, Vec<MapFeature>)> {
    let reader = BufReader::new(File::open(path)?);
    let lines = reader
        .lines()
        .collect::<std::io::Result<Vec<String>>>()?;

    let mut trajectory = Vec::new();
    let mut features: Vec<MapFeature> = Vec::new();
    let mut cursor = 0;

    while cursor < lines.len() {
        let line = lines[cursor].trim();
        cursor += 1;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let Some(keyword) = tokens.next() else { continue };

        match keyword {
            "Pose" => {
                let id = parse::<u32>(tokens.next(), "pose id")?;
                let mut matrix = [0.0; 12];
                for (i, slot) in matrix.iter_mut().enumerate() {
                    *slot = parse::<f64>(tokens.next(), &format!("pose element {i}"))?;
                }
                trajectory.push(PoseVertex::new(id, SE3::from_matrix3x4(&matrix), 0.0));
            }
            "Feature" => {
                let id = parse::<u32>(tokens.next(), "feature id")?;
                let x = parse::<f64>(tokens.next(), "feature x")?;
                let y = parse::<f64>(tokens.next(), "feature y")?;
                let z = parse::<f64>(tokens.next(), "feature z")?;
                let u = parse::<u16>(tokens.next(), "feature u")?;
                let v = parse::<u16>(tokens.next(), "feature v")?;
                features.push(MapFeature {
                    id,
                    u,
                    v,
                    position: Vector3::new(x, y, z),
                    poses_ids: Vec::new(),
                    descriptors: Vec::new(),
                });
            }
            "FeaturePoseIds" => {
                let feature = last_feature(&mut features)?;
                for token in tokens {
                    feature
                        .poses_ids
                        .push(token.parse().map_err(|_| {
                            MapError::Parse(format!("bad pose id '{token}'"))
                        })?);
                }
            }
            "FeatureExtendedDescriptors" => {
                let count = parse::<usize>(tokens.next(), "descriptor count")?;
                for _ in 0..count {
                    let Some(descriptor_line) = lines.get(cursor) else {
                        return Err(MapError::Parse("truncated descriptor block".into()));
                    };
                    cursor += 1;
                    let mut tokens = descriptor_line.split_whitespace();
                    let pose_id = parse::<u32>(tokens.next(), "descriptor pose id")?;
                    let rows = parse::<usize>(tokens.next(), "descriptor rows")?;
                    let cols = parse::<usize>(tokens.next(), "descriptor cols")?;
                    let mut values = Vec::with_capacity(rows * cols);
                    for i in 0..rows * cols {
                        values.push(parse::<f64>(
                            tokens.next(),
                            &format!("descriptor value {i}"),
                        )?);
                    }
                    last_feature(&mut features)?.descriptors.push(
                        ExtendedDescriptor::new(
                            pose_id,
                            DMatrix::from_row_slice(rows, cols, &values),
                        ),
                    );
                }
            }
            other => {
                return Err(MapError::Parse(format!("unknown record '{other}'")));
            }
        }
    }

    Ok((trajectory, features))
}

fn parse<T: std::str::FromStr>(token: Option<&str>, what: &str) -> Result<T> {
    let token = token.ok_or_else(|| MapError::Parse(format!("missing {what}")))?;
    token
        .parse()
        .map_err(|_| MapError::Parse(format!("bad {what} '{token}'")))
}

fn last_feature(features: &mut [MapFeature]) -> Result<&mut MapFeature> {
    features
        .last_mut()
        .ok_or_else(|| MapError::Parse("feature record fields before any Feature line".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector6;

    fn sample_map() -> (Vec<PoseVertex>, Vec<MapFeature>) {
        let trajectory = vec![
            PoseVertex::new(0, SE3::identity(), 0.0),
            PoseVertex::new(
                1,
                SE3::exp(&Vector6::new(0.3, -0.2, 1.1, 0.05, -0.1, 0.2)),
                0.0,
            ),
        ];
        let features = vec![
            MapFeature {
                id: crate::map::FEATURE_START_ID,
                u: 320,
                v: 240,
                position: Vector3::new(0.125, -0.75, 2.0625),
                poses_ids: vec![0, 1],
                descriptors: vec![
                    ExtendedDescriptor::new(
                        0,
                        DMatrix::from_row_slice(2, 3, &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]),
                    ),
                    ExtendedDescriptor::new(1, DMatrix::from_row_slice(1, 2, &[-7.25, 1e-17])),
                ],
            },
            MapFeature {
                id: crate::map::FEATURE_START_ID + 1,
                u: 17,
                v: 401,
                position: Vector3::new(-3.0, 0.0078125, 5.5),
                poses_ids: vec![1],
                descriptors: vec![],
            },
        ];
        (trajectory, features)
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (trajectory, features) = sample_map();
        let path = std::env::temp_dir().join("rgbd-map-dump-roundtrip.txt");
        save_map(&path, &trajectory, &features).unwrap();
        let (loaded_trajectory, loaded_features) = load_map(&path).unwrap();

        assert_eq!(loaded_trajectory.len(), trajectory.len());
        for (loaded, original) in loaded_trajectory.iter().zip(&trajectory) {
            assert_eq!(loaded.id, original.id);
            let loaded_m = loaded.pose.matrix3x4();
            let original_m = original.pose.matrix3x4();
            for (a, b) in loaded_m.iter().zip(original_m.iter()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-12);
            }
        }

        // Landmark payloads reload exactly: ids, image coordinates,
        // positions, observation lists, and descriptor values.
        assert_eq!(loaded_features, features);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let path = std::env::temp_dir().join("rgbd-map-dump-garbage.txt");
        std::fs::write(&path, "Pose 0 1 0 0\nnonsense\n").unwrap();
        assert!(load_map(&path).is_err());
    }
}
