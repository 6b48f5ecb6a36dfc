//! I/O error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// Dump written by an incompatible format version.
    #[error("unsupported dump version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// Dump recorded with a different detector geometry.
    #[error("dump geometry tag {found} does not match {expected}")]
    GeometryMismatch { found: u32, expected: u32 },

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] trackmerge_core::Error),
}
