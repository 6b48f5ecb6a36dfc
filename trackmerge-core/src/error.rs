//! Error types for trackmerge-core.

use thiserror::Error;

/// Result type alias for trackmerge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types.
///
/// Per-track failures inside the refit never surface here; they are
/// encoded in-band as flags and return codes. These errors describe
/// malformed input or configuration for a whole run.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Sector index outside the detector.
    #[error("invalid sector {sector} (detector has {n_sectors})")]
    InvalidSector { sector: usize, n_sectors: usize },

    /// Pad row index outside the detector.
    #[error("invalid row {row} (detector has {n_rows})")]
    InvalidRow { row: usize, n_rows: usize },

    /// A segment references a cluster that does not exist.
    #[error("segment {segment} references missing cluster ({sector}, {row}, {index})")]
    InvalidHitReference {
        segment: usize,
        sector: usize,
        row: usize,
        index: u32,
    },

    /// A segment has no hits.
    #[error("segment {0} has no hits")]
    EmptySegment(usize),

    /// Track parameters are not finite or the covariance is not positive semi-definite.
    #[error("invalid track parameters for segment {0}")]
    InvalidParameters(usize),
}
