//! Wires the HTTP backend to the upload manager and reports outcomes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use recdrop_http::HttpBackend;
use recdrop_uploader::{ItemId, UploadEvent, UploadManager, UploadRequest};
use tracing::{debug, error, info, warn};

use crate::Args;
use crate::config::Config;

/// Uploads every file in `args` and waits until all of them have finished.
pub async fn run(config: Config, args: Args) -> anyhow::Result<()> {
    let backend = Arc::new(HttpBackend::new(&config.http)?);
    let mut manager = UploadManager::new(backend, config.uploader)?;
    let mut events = manager
        .take_events()
        .context("upload manager events already taken")?;

    let mut pending: HashMap<ItemId, PathBuf> = HashMap::new();
    for (item_id, path) in (args.first_id..).map(ItemId).zip(args.files) {
        let payload = tokio::fs::read(&path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;

        let mut request = UploadRequest::new(item_id, payload, args.url.clone());
        if let Some(content_type) = &args.content_type {
            request = request.with_content_type(content_type.clone());
        }
        manager.enqueue_request(request).await?;

        info!(item = %item_id, file = %path.display(), "queued");
        pending.insert(item_id, path);
    }

    let mut failed = 0usize;
    while !pending.is_empty() {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!(remaining = pending.len(), "interrupted, cancelling uploads");
                manager.shutdown().await;
                anyhow::bail!("interrupted with {} upload(s) unfinished", pending.len());
            }
            event = events.recv() => event,
        };
        let Some(event) = event else {
            anyhow::bail!("upload manager stopped unexpectedly");
        };

        match event {
            UploadEvent::Progress {
                item_id,
                fraction,
                bytes_per_second,
                ..
            } => {
                debug!(
                    item = %item_id,
                    percent = (fraction * 100.0).round() as u32,
                    kib_per_sec = bytes_per_second / 1024.0,
                    "uploading"
                );
            }
            UploadEvent::Retrying {
                item_id,
                attempt,
                delay,
                error,
            } => {
                warn!(
                    item = %item_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying: {error}"
                );
            }
            UploadEvent::Completed { item_id } => {
                if let Some(path) = pending.remove(&item_id) {
                    info!(item = %item_id, file = %path.display(), "uploaded");
                }
            }
            UploadEvent::Failed { item_id, error } => {
                if let Some(path) = pending.remove(&item_id) {
                    error!(item = %item_id, file = %path.display(), "upload failed: {error}");
                    failed += 1;
                }
            }
        }
    }

    manager.shutdown().await;

    if failed > 0 {
        anyhow::bail!("{failed} upload(s) failed");
    }
    info!("all uploads finished");
    Ok(())
}
