//! Transient staging storage and throughput sampling for uploads.
//!
//! Every physical upload attempt gets its own staging file holding a copy of
//! the payload. The file is owned by a [`StagingFile`] handle and removed
//! exactly once when the handle is released (or dropped).

mod progress;
mod staging;

pub use progress::SpeedCalculator;
pub use staging::{STAGING_EXTENSION, StagingArea, StagingFile};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid staging directory: {0}")]
    InvalidDir(String),

    #[error("invalid staging key: {0}")]
    InvalidKey(String),
}
