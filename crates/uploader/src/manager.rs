//! Upload manager orchestrating staging, transfers and retries.
//!
//! All bookkeeping is owned by a single coordinating task. The public
//! [`UploadManager`] handle, backend reporters and retry timers only send
//! [`Command`]s to it, so state transitions for every item are serialized and
//! events for one item are handled in delivery order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use recdrop_transfer::{SpeedCalculator, StagingArea, StagingFile};

use crate::backend::{
    TransferBackend, TransferFailure, TransferOutcome, TransferReport, TransferReporter,
    TransferRequest,
};
use crate::config::UploaderConfig;
use crate::error::{UploadError, UploaderError};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::types::{ItemId, TaskId, UploadEvent, UploadRequest, UploadState};

/// Messages processed by the coordinating task.
pub(crate) enum Command {
    Enqueue {
        request: UploadRequest,
        reply: oneshot::Sender<()>,
    },
    Cancel {
        item_id: ItemId,
        reply: oneshot::Sender<bool>,
    },
    State {
        item_id: ItemId,
        reply: oneshot::Sender<Option<UploadState>>,
    },
    ActiveItems {
        reply: oneshot::Sender<Vec<ItemId>>,
    },
    Report(TransferReport),
    RetryDue {
        item_id: ItemId,
        generation: u64,
    },
}

/// Handle to a running upload manager.
///
/// Must be created inside a tokio runtime. Dropping the handle stops the
/// coordinating task, cancels live transfers and releases staging files.
pub struct UploadManager {
    commands: mpsc::UnboundedSender<Command>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
    shutdown: CancellationToken,
    /// Cancelled by the coordinating task once it has cleaned up.
    stopped: CancellationToken,
}

impl UploadManager {
    /// Creates a manager driving `backend`.
    ///
    /// Sweeps staging files older than `stale_after_secs` left behind by
    /// earlier processes, then stages into a session subdirectory of its own
    /// so managers sharing `staging_dir` never touch each other's files.
    ///
    /// Call [`take_events`](Self::take_events) and drain the receiver.
    /// Terminal events wait for channel capacity, so an undrained channel
    /// stalls the manager until [`shutdown`](Self::shutdown) or drop.
    pub fn new(
        backend: Arc<dyn TransferBackend>,
        config: UploaderConfig,
    ) -> Result<Self, UploaderError> {
        let root = StagingArea::open(&config.staging_dir)?;
        let swept = root.sweep_stale(Duration::from_secs(config.stale_after_secs))?;
        if swept > 0 {
            info!(
                dir = %root.dir().display(),
                removed = swept,
                "removed leftover staging files"
            );
        }
        let staging = root.session()?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let shutdown = CancellationToken::new();
        let stopped = CancellationToken::new();

        let coordinator = Coordinator {
            backend,
            staging,
            policy: config.retry,
            default_content_type: config.default_content_type,
            items: HashMap::new(),
            tasks: HashMap::new(),
            commands: commands.clone(),
            events_tx,
            shutdown: shutdown.clone(),
            next_generation: 0,
        };
        tokio::spawn(coordinator.run(commands_rx, stopped.clone()));

        Ok(Self {
            commands,
            events_rx: Some(events_rx),
            shutdown,
            stopped,
        })
    }

    /// Takes the event receiver. Can only be called once.
    ///
    /// The receiver must be drained: terminal events wait for channel
    /// capacity, progress events are dropped when the channel is full.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    /// Uploads `payload` to `destination` as item `item_id`.
    ///
    /// Supersedes any in-flight upload of the same item. Returns once the
    /// payload is staged and submitted; failures (including an invalid
    /// destination) are reported as [`UploadEvent::Failed`].
    pub async fn enqueue(
        &self,
        item_id: ItemId,
        payload: impl Into<Bytes>,
        destination: &str,
    ) -> Result<(), UploaderError> {
        self.enqueue_request(UploadRequest::new(item_id, payload, destination))
            .await
    }

    /// Like [`enqueue`](Self::enqueue) with full control over the request.
    pub async fn enqueue_request(&self, request: UploadRequest) -> Result<(), UploaderError> {
        self.call(|reply| Command::Enqueue { request, reply }).await
    }

    /// Cancels an item without reporting an outcome.
    ///
    /// Returns `false` if the item had no live upload.
    pub async fn cancel(&self, item_id: ItemId) -> Result<bool, UploaderError> {
        self.call(|reply| Command::Cancel { item_id, reply }).await
    }

    /// Returns the current state of a live item.
    pub async fn state(&self, item_id: ItemId) -> Result<Option<UploadState>, UploaderError> {
        self.call(|reply| Command::State { item_id, reply }).await
    }

    /// Returns the ids of all items with a live upload, sorted.
    pub async fn active_items(&self) -> Result<Vec<ItemId>, UploaderError> {
        self.call(|reply| Command::ActiveItems { reply }).await
    }

    /// Cancels every live item, releases staging files and stops the manager.
    ///
    /// Returns once cleanup is done. Later calls return [`UploaderError::Closed`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.stopped.cancelled().await;
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, UploaderError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| UploaderError::Closed)?;
        rx.await.map_err(|_| UploaderError::Closed)
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Bookkeeping for one item.
struct ItemEntry {
    destination: Url,
    payload: Bytes,
    content_type: String,
    /// Retries scheduled so far.
    retries: u32,
    state: UploadState,
    attempt: Option<LiveAttempt>,
    retry_timer: Option<RetryTimer>,
}

/// The physical transfer currently in flight for an item.
struct LiveAttempt {
    task_id: TaskId,
    staging: StagingFile,
    speed: SpeedCalculator,
}

struct RetryTimer {
    generation: u64,
    cancel: CancellationToken,
}

impl ItemEntry {
    fn transition(&mut self, item_id: ItemId, to: UploadState) {
        debug!(
            item = %item_id,
            from = self.state.name(),
            to = to.name(),
            "state transition"
        );
        self.state = to;
    }
}

struct Coordinator {
    backend: Arc<dyn TransferBackend>,
    staging: StagingArea,
    policy: RetryPolicy,
    default_content_type: String,
    items: HashMap<ItemId, ItemEntry>,
    /// Reverse index for backend reports; holds live tasks only.
    tasks: HashMap<TaskId, ItemId>,
    commands: mpsc::UnboundedSender<Command>,
    events_tx: mpsc::Sender<UploadEvent>,
    shutdown: CancellationToken,
    next_generation: u64,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands_rx: mpsc::UnboundedReceiver<Command>,
        stopped: CancellationToken,
    ) {
        loop {
            let command = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = commands_rx.recv() => command,
            };
            let Some(command) = command else { break };

            match command {
                Command::Enqueue { request, reply } => {
                    self.enqueue(request).await;
                    let _ = reply.send(());
                }
                Command::Cancel { item_id, reply } => {
                    let found = self.discard(item_id).await;
                    if found {
                        info!(item = %item_id, "upload cancelled");
                    }
                    let _ = reply.send(found);
                }
                Command::State { item_id, reply } => {
                    let state = self.items.get(&item_id).map(|e| e.state.clone());
                    let _ = reply.send(state);
                }
                Command::ActiveItems { reply } => {
                    let mut ids: Vec<ItemId> = self.items.keys().copied().collect();
                    ids.sort();
                    let _ = reply.send(ids);
                }
                Command::Report(TransferReport::Progress {
                    task_id,
                    sent,
                    total,
                }) => self.on_progress(task_id, sent, total),
                Command::Report(TransferReport::Complete { task_id, outcome }) => {
                    self.on_complete(task_id, outcome).await;
                }
                Command::RetryDue {
                    item_id,
                    generation,
                } => self.on_retry_due(item_id, generation).await,
            }
        }

        self.discard_all().await;
        if let Err(e) = self.staging.close().await {
            warn!(
                dir = %self.staging.dir().display(),
                error = %e,
                "failed to remove staging session"
            );
        }
        commands_rx.close();
        stopped.cancel();
        debug!("upload manager stopped");
    }

    async fn enqueue(&mut self, request: UploadRequest) {
        let item_id = request.item_id;

        // Last enqueue wins.
        if self.discard(item_id).await {
            info!(item = %item_id, "superseding in-flight upload");
        }

        let destination = match parse_destination(&request.destination) {
            Ok(url) => url,
            Err(reason) => {
                warn!(item = %item_id, destination = %request.destination, "{reason}");
                self.emit_terminal(UploadEvent::Failed {
                    item_id,
                    error: UploadError::InvalidDestination(reason),
                })
                .await;
                return;
            }
        };

        info!(
            item = %item_id,
            destination = %destination,
            bytes = request.payload.len(),
            "upload enqueued"
        );

        self.items.insert(
            item_id,
            ItemEntry {
                destination,
                payload: request.payload,
                content_type: request
                    .content_type
                    .unwrap_or_else(|| self.default_content_type.clone()),
                retries: 0,
                state: UploadState::Idle,
                attempt: None,
                retry_timer: None,
            },
        );

        self.start_attempt(item_id).await;
    }

    /// Stages the payload afresh and submits it to the backend.
    async fn start_attempt(&mut self, item_id: ItemId) {
        let Some(entry) = self.items.get(&item_id) else {
            return;
        };
        let attempt = entry.retries + 1;
        let payload = entry.payload.clone();
        let destination = entry.destination.clone();
        let content_type = entry.content_type.clone();

        let staging = match self
            .staging
            .stage(&item_id.to_string(), attempt, &payload)
            .await
        {
            Ok(staging) => staging,
            Err(e) => {
                warn!(item = %item_id, attempt, error = %e, "failed to stage payload");
                self.give_up(item_id, UploadError::StagingWriteFailed(e.to_string()))
                    .await;
                return;
            }
        };

        let request = TransferRequest {
            item_id,
            staging_path: staging.path().to_path_buf(),
            destination,
            content_type,
            content_length: staging.len(),
        };

        match self.backend.submit(request, self.reporter()) {
            Ok(task_id) => {
                debug!(item = %item_id, task = %task_id, attempt, "transfer submitted");
                self.tasks.insert(task_id, item_id);
                if let Some(entry) = self.items.get_mut(&item_id) {
                    entry.attempt = Some(LiveAttempt {
                        task_id,
                        staging,
                        speed: SpeedCalculator::default(),
                    });
                    entry.transition(item_id, UploadState::Transferring { attempt, task_id });
                }
            }
            Err(e) => {
                warn!(item = %item_id, attempt, error = %e, "backend refused transfer");
                release(staging).await;
                self.on_failure(item_id, TransferFailure::from(e)).await;
            }
        }
    }

    fn on_progress(&mut self, task_id: TaskId, sent: u64, total: u64) {
        let Some(item_id) = self.tasks.get(&task_id).copied() else {
            trace!(task = %task_id, "dropping progress for stale task");
            return;
        };
        let Some(live) = self
            .items
            .get_mut(&item_id)
            .and_then(|entry| entry.attempt.as_mut())
        else {
            return;
        };

        live.speed.record(sent);
        let bytes_per_second = live.speed.bytes_per_second();
        let fraction = if total == 0 {
            0.0
        } else {
            (sent as f64 / total as f64).clamp(0.0, 1.0)
        };
        trace!(item = %item_id, sent, total, "upload progress");

        self.emit(UploadEvent::Progress {
            item_id,
            fraction,
            sent,
            total,
            bytes_per_second,
        });
    }

    async fn on_complete(&mut self, task_id: TaskId, outcome: TransferOutcome) {
        let Some(item_id) = self.tasks.remove(&task_id) else {
            debug!(task = %task_id, "dropping completion for stale task");
            return;
        };
        let Some(live) = self
            .items
            .get_mut(&item_id)
            .and_then(|entry| entry.attempt.take())
        else {
            return;
        };
        release(live.staging).await;

        match outcome {
            TransferOutcome::Success { status } => {
                if let Some(mut entry) = self.items.remove(&item_id) {
                    entry.transition(item_id, UploadState::Succeeded);
                }
                info!(item = %item_id, status, "upload completed");
                self.emit_terminal(UploadEvent::Completed { item_id }).await;
            }
            TransferOutcome::Failed(failure) => self.on_failure(item_id, failure).await,
        }
    }

    /// Consults the retry policy after a failed attempt.
    async fn on_failure(&mut self, item_id: ItemId, failure: TransferFailure) {
        let Some(entry) = self.items.get_mut(&item_id) else {
            return;
        };

        match self.policy.decide(&failure, entry.retries) {
            RetryDecision::Retry { retry, delay } => {
                let error = failure.classify();
                let attempt = retry + 1;
                warn!(
                    item = %item_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "upload attempt failed, retrying"
                );

                self.next_generation += 1;
                let generation = self.next_generation;
                let cancel = self.shutdown.child_token();
                spawn_retry_timer(
                    self.commands.clone(),
                    cancel.clone(),
                    item_id,
                    generation,
                    delay,
                );

                entry.retries = retry;
                entry.retry_timer = Some(RetryTimer { generation, cancel });
                entry.transition(item_id, UploadState::AwaitingRetry { attempt });

                self.emit(UploadEvent::Retrying {
                    item_id,
                    attempt,
                    delay,
                    error,
                });
            }
            RetryDecision::GiveUp(error) => self.give_up(item_id, error).await,
        }
    }

    async fn on_retry_due(&mut self, item_id: ItemId, generation: u64) {
        let Some(entry) = self.items.get_mut(&item_id) else {
            debug!(item = %item_id, "dropping retry for finished item");
            return;
        };
        if entry.retry_timer.as_ref().map(|t| t.generation) != Some(generation) {
            debug!(item = %item_id, generation, "dropping stale retry timer");
            return;
        }
        entry.retry_timer = None;
        self.start_attempt(item_id).await;
    }

    /// Reports a terminal failure and removes the item.
    async fn give_up(&mut self, item_id: ItemId, error: UploadError) {
        if let Some(mut entry) = self.items.remove(&item_id) {
            entry.transition(item_id, UploadState::GivingUp);
            teardown(&*self.backend, &mut self.tasks, entry).await;
        }
        warn!(item = %item_id, error = %error, "upload failed");
        self.emit_terminal(UploadEvent::Failed { item_id, error })
            .await;
    }

    /// Removes an item without reporting. Returns whether it existed.
    async fn discard(&mut self, item_id: ItemId) -> bool {
        let Some(mut entry) = self.items.remove(&item_id) else {
            return false;
        };
        entry.transition(item_id, UploadState::Cancelled);
        teardown(&*self.backend, &mut self.tasks, entry).await;
        true
    }

    async fn discard_all(&mut self) {
        let ids: Vec<ItemId> = self.items.keys().copied().collect();
        for item_id in ids {
            self.discard(item_id).await;
        }
    }

    fn reporter(&self) -> TransferReporter {
        let commands = self.commands.clone();
        TransferReporter::new(move |report| {
            // The manager may already be gone; late reports are moot then.
            let _ = commands.send(Command::Report(report));
        })
    }

    /// Emits a non-terminal event, dropping it if the observer lags.
    fn emit(&self, event: UploadEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                trace!(item = %event.item_id(), "event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Emits a terminal event, waiting for capacity unless shutting down.
    async fn emit_terminal(&self, event: UploadEvent) {
        let item_id = event.item_id();
        tokio::select! {
            biased;
            _ = self.events_tx.send(event) => {}
            _ = self.shutdown.cancelled() => {
                debug!(item = %item_id, "shutting down, dropping terminal event");
            }
        }
    }
}

/// Cancels the item's timer and transfer and releases its staging file.
async fn teardown(
    backend: &dyn TransferBackend,
    tasks: &mut HashMap<TaskId, ItemId>,
    entry: ItemEntry,
) {
    if let Some(timer) = entry.retry_timer {
        timer.cancel.cancel();
    }
    if let Some(live) = entry.attempt {
        tasks.remove(&live.task_id);
        backend.cancel(live.task_id);
        release(live.staging).await;
    }
}

async fn release(staging: StagingFile) {
    let path = staging.path().to_path_buf();
    if let Err(e) = staging.release().await {
        warn!(path = %path.display(), error = %e, "failed to release staging file");
    }
}

fn spawn_retry_timer(
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    item_id: ItemId,
    generation: u64,
    delay: Duration,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {
                trace!(item = %item_id, generation, "retry timer cancelled");
            }
            _ = tokio::time::sleep(delay) => {
                let _ = commands.send(Command::RetryDue { item_id, generation });
            }
        }
    });
}

/// Parses a destination into an absolute URL with a host.
fn parse_destination(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid destination URL: {e}"))?;
    if url.cannot_be_a_base() || !url.has_host() {
        return Err(format!("destination URL has no host: {raw}"));
    }
    Ok(url)
}
