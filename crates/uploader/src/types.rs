//! Public types for the upload manager.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::UploadError;

/// Caller-supplied identifier of one logical upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ItemId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Backend-assigned identifier of one physical transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Upload state of an item.
///
/// Attempt numbers are 1-based physical attempts: the first transfer is
/// attempt 1, the first retry is attempt 2.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadState {
    /// Accepted, not yet submitted.
    Idle,
    /// A transfer is in flight.
    Transferring { attempt: u32, task_id: TaskId },
    /// Waiting for the backoff timer before `attempt` starts.
    AwaitingRetry { attempt: u32 },
    /// Uploaded successfully.
    Succeeded,
    /// Failed terminally.
    GivingUp,
    /// Superseded or cancelled by the caller.
    Cancelled,
}

impl UploadState {
    /// Whether the item's lifecycle has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::GivingUp | Self::Cancelled)
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Transferring { .. } => "transferring",
            Self::AwaitingRetry { .. } => "awaiting_retry",
            Self::Succeeded => "succeeded",
            Self::GivingUp => "giving_up",
            Self::Cancelled => "cancelled",
        }
    }
}

/// An upload request as accepted by [`UploadManager::enqueue_request`](crate::UploadManager::enqueue_request).
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub item_id: ItemId,
    pub payload: Bytes,
    pub destination: String,
    /// Overrides the configured default content type.
    pub content_type: Option<String>,
}

impl UploadRequest {
    pub fn new(item_id: ItemId, payload: impl Into<Bytes>, destination: impl Into<String>) -> Self {
        Self {
            item_id,
            payload: payload.into(),
            destination: destination.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Events emitted by the upload manager.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Byte progress of the current attempt.
    Progress {
        item_id: ItemId,
        /// `sent / total`, clamped to `[0, 1]`.
        fraction: f64,
        sent: u64,
        total: u64,
        bytes_per_second: f64,
    },
    /// A retryable failure occurred; `attempt` starts after `delay`.
    Retrying {
        item_id: ItemId,
        attempt: u32,
        delay: Duration,
        error: UploadError,
    },
    /// The item was uploaded. Terminal.
    Completed { item_id: ItemId },
    /// The item failed for good. Terminal.
    Failed { item_id: ItemId, error: UploadError },
}

impl UploadEvent {
    pub fn item_id(&self) -> ItemId {
        match self {
            Self::Progress { item_id, .. }
            | Self::Retrying { item_id, .. }
            | Self::Completed { item_id }
            | Self::Failed { item_id, .. } => *item_id,
        }
    }

    /// Terminal outcome as `(item, success, error)`; `None` for non-terminal events.
    pub fn outcome(&self) -> Option<(ItemId, bool, Option<&UploadError>)> {
        match self {
            Self::Completed { item_id } => Some((*item_id, true, None)),
            Self::Failed { item_id, error } => Some((*item_id, false, Some(error))),
            Self::Progress { .. } | Self::Retrying { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }
}
