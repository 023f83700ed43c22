//! In-process fake backend and harness for manager tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::backend::{TransferBackend, TransferOutcome, TransferReporter, TransferRequest};
use crate::config::UploaderConfig;
use crate::error::BackendError;
use crate::manager::UploadManager;
use crate::types::{TaskId, UploadEvent};

const WAIT: Duration = Duration::from_secs(60);

/// A transfer handed to the fake backend, driven by the test.
pub struct Submission {
    pub task_id: TaskId,
    pub request: TransferRequest,
    reporter: TransferReporter,
}

impl Submission {
    pub fn progress(&self, sent: u64, total: u64) {
        self.reporter.progress(self.task_id, sent, total);
    }

    pub fn complete(&self, outcome: TransferOutcome) {
        self.reporter.complete(self.task_id, outcome);
    }
}

/// Backend that records submissions and lets tests script their outcome.
pub struct FakeBackend {
    next_id: AtomicU64,
    submissions: mpsc::UnboundedSender<Submission>,
    submitted: AtomicU64,
    cancelled: Mutex<Vec<TaskId>>,
    reject: Mutex<Option<String>>,
}

impl FakeBackend {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Submission>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Arc::new(Self {
            next_id: AtomicU64::new(1),
            submissions: tx,
            submitted: AtomicU64::new(0),
            cancelled: Mutex::new(Vec::new()),
            reject: Mutex::new(None),
        });
        (backend, rx)
    }

    /// Makes the next `submit` call fail with [`BackendError::Rejected`].
    pub fn reject_next(&self, reason: &str) {
        *self.reject.lock().unwrap() = Some(reason.to_string());
    }

    pub fn cancelled(&self) -> Vec<TaskId> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn submission_count(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }
}

impl TransferBackend for FakeBackend {
    fn submit(
        &self,
        request: TransferRequest,
        reporter: TransferReporter,
    ) -> Result<TaskId, BackendError> {
        if let Some(reason) = self.reject.lock().unwrap().take() {
            return Err(BackendError::Rejected(reason));
        }
        let task_id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let _ = self.submissions.send(Submission {
            task_id,
            request,
            reporter,
        });
        Ok(task_id)
    }

    fn cancel(&self, task_id: TaskId) {
        self.cancelled.lock().unwrap().push(task_id);
    }
}

/// A manager wired to a [`FakeBackend`] with a temporary staging directory.
pub struct Harness {
    pub manager: UploadManager,
    pub backend: Arc<FakeBackend>,
    pub events: mpsc::Receiver<UploadEvent>,
    submissions: mpsc::UnboundedReceiver<Submission>,
    staging_dir: PathBuf,
    _tmp: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let config = UploaderConfig::with_staging_dir(tmp.path().join("staging"));
        Self::with_config(tmp, config)
    }

    pub fn with_config(tmp: TempDir, config: UploaderConfig) -> Self {
        let (backend, submissions) = FakeBackend::new();
        let staging_dir = config.staging_dir.clone();
        let mut manager = UploadManager::new(backend.clone(), config).unwrap();
        let events = manager.take_events().unwrap();
        Self {
            manager,
            backend,
            events,
            submissions,
            staging_dir,
            _tmp: tmp,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Staging files currently on disk, including those in session directories.
    pub fn staged_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for path in list_dir(&self.staging_dir) {
            if path.is_dir() {
                files.extend(list_dir(&path).into_iter().filter(|p| p.is_file()));
            } else {
                files.push(path);
            }
        }
        files.sort();
        files
    }

    /// Replaces the staging directory with a regular file so that staging fails.
    pub fn block_staging(&self) {
        std::fs::remove_dir_all(&self.staging_dir).unwrap();
        std::fs::write(&self.staging_dir, b"blocked").unwrap();
    }

    pub async fn next_submission(&mut self) -> Submission {
        tokio::time::timeout(WAIT, self.submissions.recv())
            .await
            .expect("timed out waiting for submission")
            .expect("backend dropped")
    }

    pub fn try_next_submission(&mut self) -> Option<Submission> {
        self.submissions.try_recv().ok()
    }

    pub async fn next_event(&mut self) -> UploadEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    pub fn try_next_event(&mut self) -> Option<UploadEvent> {
        self.events.try_recv().ok()
    }
}

fn list_dir(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
        .unwrap_or_default()
}

/// Receives events until a terminal one; returns it with the events before it.
pub async fn next_terminal(
    events: &mut mpsc::Receiver<UploadEvent>,
) -> (UploadEvent, Vec<UploadEvent>) {
    let mut skipped = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for terminal event")
            .expect("event channel closed");
        if event.is_terminal() {
            return (event, skipped);
        }
        skipped.push(event);
    }
}
