//! Persistence: the text map dump and the Octave plot export.

pub mod map_file;
pub mod octave;
