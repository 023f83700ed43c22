use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use recdrop_uploader::{
    BackendError, TaskId, TransferBackend, TransferFailure, TransferOutcome, TransferReporter,
    TransferRequest, TransportErrorKind,
};

use crate::HttpError;
use crate::config::HttpBackendConfig;

type TaskMap = Arc<Mutex<HashMap<TaskId, CancellationToken>>>;

/// [`TransferBackend`] that uploads staged files over HTTP(S).
pub struct HttpBackend {
    http: reqwest::Client,
    method: reqwest::Method,
    progress_step: u64,
    next_id: AtomicU64,
    tasks: TaskMap,
}

impl HttpBackend {
    pub fn new(config: &HttpBackendConfig) -> Result<Self, HttpError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.bearer_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| HttpError::InvalidToken)?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            method: config.method.into(),
            progress_step: config.progress_step.max(1),
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Number of transfers currently running.
    pub fn active_tasks(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl TransferBackend for HttpBackend {
    fn submit(
        &self,
        request: TransferRequest,
        reporter: TransferReporter,
    ) -> Result<TaskId, BackendError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BackendError::Unavailable)?;

        let task_id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id, cancel.clone());

        debug!(
            task = %task_id,
            item = %request.item_id,
            url = %request.destination,
            bytes = request.content_length,
            "starting HTTP upload"
        );

        let upload = Upload {
            http: self.http.clone(),
            method: self.method.clone(),
            progress_step: self.progress_step,
            task_id,
            request,
            reporter: reporter.clone(),
        };
        let tasks = Arc::clone(&self.tasks);

        runtime.spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => TransferOutcome::Failed(TransferFailure::Cancelled),
                outcome = upload.run() => outcome,
            };
            tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&task_id);
            debug!(task = %task_id, ?outcome, "HTTP upload finished");
            reporter.complete(task_id, outcome);
        });

        Ok(task_id)
    }

    fn cancel(&self, task_id: TaskId) {
        let token = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task_id);
        if let Some(token) = token {
            debug!(task = %task_id, "cancelling HTTP upload");
            token.cancel();
        }
    }
}

/// One HTTP request streaming a staged file.
struct Upload {
    http: reqwest::Client,
    method: reqwest::Method,
    progress_step: u64,
    task_id: TaskId,
    request: TransferRequest,
    reporter: TransferReporter,
}

impl Upload {
    async fn run(self) -> TransferOutcome {
        let file = match tokio::fs::File::open(&self.request.staging_path).await {
            Ok(file) => file,
            Err(e) => {
                warn!(
                    task = %self.task_id,
                    path = %self.request.staging_path.display(),
                    error = %e,
                    "cannot open staging file"
                );
                return TransferOutcome::Failed(TransferFailure::Local(format!(
                    "cannot open staging file: {e}"
                )));
            }
        };

        let total = self.request.content_length;
        let step = self.progress_step;
        let task_id = self.task_id;
        let reporter = self.reporter;
        let mut sent = 0u64;
        let mut reported = 0u64;

        let body = ReaderStream::new(file).inspect(move |chunk| {
            if let Ok(bytes) = chunk {
                sent += bytes.len() as u64;
                if sent - reported >= step || sent >= total {
                    reported = sent;
                    reporter.progress(task_id, sent, total);
                }
            }
        });

        let result = self
            .http
            .request(self.method, self.request.destination)
            .header(CONTENT_TYPE, self.request.content_type)
            .header(CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                if !response.status().is_success() {
                    let body = response.text().await.unwrap_or_default();
                    debug!(task = %task_id, status, body = %body, "server refused upload");
                }
                TransferOutcome::from_status(status)
            }
            Err(e) => {
                let kind = transport_kind(&e);
                debug!(task = %task_id, ?kind, error = %e, "HTTP request failed");
                TransferOutcome::Failed(TransferFailure::transport(kind, e.to_string()))
            }
        }
    }
}

/// Maps a reqwest error onto the transport taxonomy.
fn transport_kind(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        return TransportErrorKind::Timeout;
    }

    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if e.to_string().contains("dns error") {
            return TransportErrorKind::Dns;
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            match io.kind() {
                TimedOut => return TransportErrorKind::Timeout,
                ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof => {
                    return TransportErrorKind::ConnectionReset;
                }
                ConnectionRefused | NotConnected | AddrNotAvailable | NetworkUnreachable
                | HostUnreachable | NetworkDown => return TransportErrorKind::NotConnected,
                _ => {}
            }
        }
        source = e.source();
    }

    if err.is_connect() {
        TransportErrorKind::NotConnected
    } else {
        TransportErrorKind::Other
    }
}
