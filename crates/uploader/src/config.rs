//! Upload manager configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Upload manager configuration, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Directory holding per-attempt staging files.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Content type used when a request doesn't specify one.
    #[serde(default = "default_content_type")]
    pub default_content_type: String,

    /// Staging files older than this are removed at start-up. Must exceed the
    /// longest transfer of any process sharing `staging_dir`.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Capacity of the event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("recdrop").join("staging")
}

fn default_content_type() -> String {
    "application/octet-stream".into()
}

fn default_stale_after_secs() -> u64 {
    24 * 60 * 60
}

fn default_event_buffer() -> usize {
    256
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            default_content_type: default_content_type(),
            stale_after_secs: default_stale_after_secs(),
            event_buffer: default_event_buffer(),
            retry: RetryPolicy::default(),
        }
    }
}

impl UploaderConfig {
    /// Default configuration staging into `dir`.
    pub fn with_staging_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: dir.into(),
            ..Self::default()
        }
    }
}
