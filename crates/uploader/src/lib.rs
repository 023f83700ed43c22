//! Background upload task manager.
//!
//! Accepts upload requests keyed by an item id, stages each payload to a
//! transient file, drives a pluggable [`TransferBackend`], retries transient
//! failures with exponential backoff and reports progress and terminal
//! outcomes as [`UploadEvent`]s.
//!
//! # Lifecycle
//!
//! 1. **Enqueue**: validate the destination, supersede any in-flight upload
//!    for the same item
//! 2. **Stage**: copy the payload to a fresh per-attempt staging file
//! 3. **Transfer**: submit to the backend, forward byte progress
//! 4. **Retry**: classify failures, back off and restage when retryable
//! 5. **Report**: emit exactly one `Completed` or `Failed` per item

pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod retry;
pub mod types;

#[cfg(test)]
mod testing;

pub use backend::{
    TransferBackend, TransferFailure, TransferOutcome, TransferReport, TransferReporter,
    TransferRequest,
};
pub use config::UploaderConfig;
pub use error::{BackendError, TransportErrorKind, UploadError, UploaderError};
pub use manager::UploadManager;
pub use retry::{RetryDecision, RetryPolicy};
pub use types::{ItemId, TaskId, UploadEvent, UploadRequest, UploadState};
