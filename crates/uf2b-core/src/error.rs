//! Error types for status and image handling

use thiserror::Error;

/// Errors raised while building a status snapshot
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The controller reported a different number of ports than configured
    #[error("status array has {actual} entries, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    /// A status entry does not fit in one byte
    #[error("status entry {index} out of range: {value}")]
    ValueOutOfRange { index: usize, value: i64 },
}

/// Errors raised while preparing a firmware image
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    /// Nothing to flash
    #[error("firmware image is empty")]
    Empty,
}
