//! Map backend configuration.

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MapError, Result};

/// Tunables of the map and its optimization driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    /// Weight observation edges with the depth-sensor uncertainty model
    /// instead of identity information.
    #[serde(default)]
    pub use_uncertainty: bool,

    /// Squared-Mahalanobis threshold for dropping observation edges after an
    /// optimization pass. 0 disables pruning.
    #[serde(default)]
    pub edges_3d_pruning_threshold: f64,

    /// Landmarks observed from fewer distinct poses than this are removed
    /// from the graph during the terminal pass. 0 disables the removal.
    #[serde(default)]
    pub weak_feature_thr: u32,

    /// Freeze all optimized vertices after each pass, so subsequent passes
    /// only touch newly added ones.
    #[serde(default)]
    pub fix_vertices: bool,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            use_uncertainty: false,
            edges_3d_pruning_threshold: 0.0,
            weak_feature_thr: 0,
            fix_vertices: false,
        }
    }
}

impl MapConfig {
    /// Load the configuration from a YAML file. Missing fields fall back to
    /// their defaults; an unreadable or malformed file is fatal.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            MapError::Configuration(format!("cannot open {}: {}", path.display(), e))
        })?;
        serde_yaml::from_reader(file).map_err(|e| {
            MapError::Configuration(format!("cannot parse {}: {}", path.display(), e))
        })
    }
}
