//! Octave/MATLAB plot script export.
//!
//! Writes a script plotting every landmark estimate, the raw measurements
//! behind it, and their covariance ellipses (via the common `error_ellipse`
//! helper function).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;
use crate::graph::PoseGraph;

pub fn export_plot_script<P: AsRef<Path>>(path: P, graph: &PoseGraph) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    writeln!(file, "close all;")?;
    writeln!(file, "clear all;")?;
    writeln!(file, "hold on;")?;

    for landmark in graph.optimized_features() {
        let Ok((edges, estimate)) = graph.measurements_of(landmark.id) else {
            continue;
        };
        writeln!(file, "%feature no {}", landmark.id)?;
        writeln!(
            file,
            "plot3({},{},{},'ro');",
            estimate.x, estimate.y, estimate.z
        )?;
        for edge in &edges {
            let m = edge.measurement;
            writeln!(file, "plot3({},{},{},'bx');", m.x, m.y, m.z)?;
        }
        for edge in &edges {
            let Some(cov) = edge.information.try_inverse() else {
                continue;
            };
            let m = edge.measurement;
            writeln!(
                file,
                "C = [{}, {}, {}; {}, {}, {}; {}, {}, {}];",
                cov[(0, 0)],
                cov[(0, 1)],
                cov[(0, 2)],
                cov[(1, 0)],
                cov[(1, 1)],
                cov[(1, 2)],
                cov[(2, 0)],
                cov[(2, 1)],
                cov[(2, 2)]
            )?;
            writeln!(file, "M = [{},{},{}];", m.x, m.y, m.z)?;
            writeln!(file, "error_ellipse(C, M);")?;
        }
    }
    Ok(())
}
