//! Transfer backend trait and the reporter it calls back into.
//!
//! A backend moves the staged bytes over the wire. The manager only needs
//! `submit`/`cancel`; progress and completion flow back through the
//! [`TransferReporter`] handed to each submission. Backends must deliver
//! exactly one [`TransferReporter::complete`] per submitted task, preceded by
//! zero or more [`TransferReporter::progress`] calls.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use url::Url;

use crate::error::{BackendError, TransportErrorKind, UploadError};
use crate::types::{ItemId, TaskId};

/// One physical transfer to perform.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub item_id: ItemId,
    /// Staged copy of the payload. Owned by the manager; backends only read it.
    pub staging_path: PathBuf,
    pub destination: Url,
    pub content_type: String,
    pub content_length: u64,
}

/// Result of a physical transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Success { status: u16 },
    Failed(TransferFailure),
}

impl TransferOutcome {
    /// Maps an HTTP status code: 2xx is success, anything else a failure.
    pub fn from_status(status: u16) -> Self {
        if (200..300).contains(&status) {
            Self::Success { status }
        } else {
            Self::Failed(TransferFailure::Status(status))
        }
    }
}

/// Why a physical transfer failed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferFailure {
    /// The server answered with a non-success status.
    Status(u16),
    /// The request never produced a response.
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    /// A local, non-network problem (unreadable staging file, bad request).
    Local(String),
    /// The task was cancelled through [`TransferBackend::cancel`].
    Cancelled,
}

impl TransferFailure {
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Classifies the failure into the upload error taxonomy.
    pub fn classify(&self) -> UploadError {
        match self {
            Self::Status(status @ (408 | 429 | 500..=u16::MAX)) => {
                UploadError::ServerTransient(*status)
            }
            Self::Status(status) => UploadError::ServerRejected(*status),
            Self::Transport { kind, .. } if kind.is_transient() => {
                UploadError::TransportTransient(*kind)
            }
            Self::Transport { message, .. } => UploadError::RequestFailed(message.clone()),
            Self::Local(message) => UploadError::RequestFailed(message.clone()),
            Self::Cancelled => UploadError::RequestFailed("cancelled".into()),
        }
    }
}

impl From<BackendError> for TransferFailure {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable => {
                Self::transport(TransportErrorKind::NotConnected, err.to_string())
            }
            BackendError::Rejected(_) => Self::Local(err.to_string()),
        }
    }
}

/// Event delivered by a backend through a [`TransferReporter`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransferReport {
    Progress { task_id: TaskId, sent: u64, total: u64 },
    Complete { task_id: TaskId, outcome: TransferOutcome },
}

/// Callback handle a backend uses to report on its tasks.
///
/// Cheap to clone and safe to call from any thread or task.
#[derive(Clone)]
pub struct TransferReporter {
    sink: Arc<dyn Fn(TransferReport) + Send + Sync>,
}

impl fmt::Debug for TransferReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferReporter").finish_non_exhaustive()
    }
}

impl TransferReporter {
    /// Creates a reporter forwarding every report to `sink`.
    pub fn new(sink: impl Fn(TransferReport) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Reports cumulative bytes sent for a task.
    pub fn progress(&self, task_id: TaskId, sent: u64, total: u64) {
        (self.sink)(TransferReport::Progress {
            task_id,
            sent,
            total,
        });
    }

    /// Reports the terminal outcome of a task.
    pub fn complete(&self, task_id: TaskId, outcome: TransferOutcome) {
        (self.sink)(TransferReport::Complete { task_id, outcome });
    }
}

/// Performs physical transfers on behalf of the manager.
///
/// `submit` is called from the manager's coordinating task and must not
/// block on the network: implementations spawn their own work and return the
/// task id immediately.
pub trait TransferBackend: Send + Sync {
    /// Starts a transfer and returns its task id.
    fn submit(
        &self,
        request: TransferRequest,
        reporter: TransferReporter,
    ) -> Result<TaskId, BackendError>;

    /// Cancels a running transfer. Unknown or finished ids are ignored.
    fn cancel(&self, task_id: TaskId);
}
