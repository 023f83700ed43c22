//! HTTP transfer backend for the recdrop upload manager.
//!
//! Streams each staged payload as the request body of a single `POST` (or
//! `PUT`) and reports byte progress while reqwest consumes the stream.

mod client;
mod config;

pub use client::HttpBackend;
pub use config::{HttpBackendConfig, HttpMethod};

/// Errors building an [`HttpBackend`].
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("invalid bearer token")]
    InvalidToken,
}
