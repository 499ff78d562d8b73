//! Error types for the map backend.
//!
//! Only construction-time configuration faults are fatal. Per-measurement
//! faults (`UnknownPose`, `UnknownFeature`) drop the offending measurement
//! and leave the map and graph state intact; solver faults are reported to
//! the optimization driver, which logs and keeps looping.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MapError>;

/// Errors surfaced by the map, the pose graph, and persistence.
#[derive(Debug, Error)]
pub enum MapError {
    /// Missing or malformed sensor/map configuration. Fatal at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A measurement or query referenced a pose id that is not in the trajectory.
    #[error("unknown pose id {0}")]
    UnknownPose(u32),

    /// A measurement or query referenced a landmark id that is not in the map.
    #[error("unknown feature id {0}")]
    UnknownFeature(u32),

    /// A vertex was re-added with the same id but a conflicting estimate.
    #[error("vertex {0} already exists with a different estimate")]
    DuplicateVertex(u32),

    /// The nonlinear solver failed; estimates are left untouched.
    #[error("solver failure: {0}")]
    Solver(String),

    /// A persisted file could not be parsed back.
    #[error("malformed map file: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
