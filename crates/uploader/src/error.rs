//! Upload error types.

use std::fmt;

/// Transport-layer failure categories reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connect or request timed out.
    Timeout,
    /// Host name could not be resolved.
    Dns,
    /// Connection was reset or aborted mid-transfer.
    ConnectionReset,
    /// No network route to the host (offline, refused, unreachable).
    NotConnected,
    /// Any other transport failure (TLS, protocol violations, ...).
    Other,
}

impl TransportErrorKind {
    /// Whether a fresh attempt can reasonably succeed.
    pub fn is_transient(self) -> bool {
        !matches!(self, Self::Other)
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timed out",
            Self::Dns => "DNS lookup failed",
            Self::ConnectionReset => "connection reset",
            Self::NotConnected => "not connected to network",
            Self::Other => "transport error",
        };
        f.write_str(s)
    }
}

/// Classified failure of an upload item.
///
/// Retryable kinds stay inside the manager; terminal kinds reach the event
/// channel exactly once per item.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UploadError {
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("transient transport failure: {0}")]
    TransportTransient(TransportErrorKind),

    #[error("transient server failure: HTTP {0}")]
    ServerTransient(u16),

    #[error("rejected by server: HTTP {0}")]
    ServerRejected(u16),

    #[error("staging write failed: {0}")]
    StagingWriteFailed(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<UploadError>,
    },
}

impl UploadError {
    /// Whether the retry policy may schedule another attempt for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportTransient(_) | Self::ServerTransient(_))
    }
}

/// Errors returned directly to callers of [`UploadManager`](crate::UploadManager).
#[derive(Debug, thiserror::Error)]
pub enum UploaderError {
    #[error("upload manager is closed")]
    Closed,

    #[error("staging error: {0}")]
    Staging(#[from] recdrop_transfer::StagingError),
}

/// Errors a backend may return from `submit`.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("backend unavailable")]
    Unavailable,
}
