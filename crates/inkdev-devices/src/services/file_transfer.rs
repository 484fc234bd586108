/*!
 * File transfer service.
 *
 * Once started, a background loop pulls completed pages from the device,
 * hands each one to the caller's [`DocumentHandler`] and then either
 * downloads the same page again ([`TransferControl::Retry`]) or acknowledges
 * it and moves on ([`TransferControl::Continue`]). The handler is invoked
 * exactly once per download attempt, with the page or with the error that
 * prevented it.
 *
 * Pages are pulled every sync interval, and immediately when the device
 * announces that pages are waiting.
 */
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use inkdev_core::config::FileTransferConfig;
use inkdev_core::event::{EventHub, Subscription};
use inkdev_core::utils::with_cancel;

use super::{RunState, ServiceContext};
use crate::error::{DeviceError, Result};
use crate::ink::InkDocument;
use crate::link::Command;
use crate::transform::Matrix;

/// What to do after a page was handed to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferControl {
    /// Download the same page again
    Retry,
    /// Acknowledge the page and move on
    Continue,
}

/// Receives transferred pages
#[async_trait]
pub trait DocumentHandler: Send + Sync {
    /// Called once per download attempt
    async fn on_document(&self, result: Result<InkDocument>) -> TransferControl;
}

#[async_trait]
impl<F, Fut> DocumentHandler for F
where
    F: Fn(Result<InkDocument>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransferControl> + Send + 'static,
{
    async fn on_document(&self, result: Result<InkDocument>) -> TransferControl {
        (self)(result).await
    }
}

/// Wraps a handler so failed downloads are retried a bounded number of times
///
/// Pages that keep failing are passed to the inner handler as errors and
/// then skipped.
#[derive(Debug)]
pub struct BoundedRetry<H> {
    inner: H,
    max_retries: u32,
    failures: AtomicU32,
}

impl<H: DocumentHandler> BoundedRetry<H> {
    /// Retry each page up to `max_retries` times
    pub fn new(inner: H, max_retries: u32) -> Self {
        Self {
            inner,
            max_retries,
            failures: AtomicU32::new(0),
        }
    }

    /// Retry limit from the `[file_transfer]` configuration section
    pub fn from_config(inner: H, config: &FileTransferConfig) -> Self {
        Self::new(inner, config.max_retries)
    }
}

#[async_trait]
impl<H: DocumentHandler> DocumentHandler for BoundedRetry<H> {
    async fn on_document(&self, result: Result<InkDocument>) -> TransferControl {
        match result {
            Ok(document) => {
                self.failures.store(0, Ordering::SeqCst);
                self.inner.on_document(Ok(document)).await
            }
            Err(e @ DeviceError::FileTransfer(_)) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures <= self.max_retries {
                    debug!("Retrying page after failure {} of {}: {}", failures, self.max_retries, e);
                    return TransferControl::Retry;
                }
                self.failures.store(0, Ordering::SeqCst);
                warn!("Giving up on page after {} retries: {}", self.max_retries, e);
                self.inner.on_document(Err(e)).await;
                TransferControl::Continue
            }
            Err(e) => {
                self.failures.store(0, Ordering::SeqCst);
                self.inner.on_document(Err(e)).await;
                TransferControl::Continue
            }
        }
    }
}

/// Progress and failures of the transfer loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTransferEvent {
    /// A round of downloads is starting
    StartingFileDownload {
        /// Pages waiting on the device
        files: usize,
    },
    /// A round of downloads failed; the loop keeps running
    ServiceError {
        /// What went wrong
        message: String,
    },
}

#[derive(Debug)]
struct FileTransferInner {
    ctx: ServiceContext,
    state: RunState,
    sync_interval: RwLock<Duration>,
    transform: RwLock<Matrix>,
    events: EventHub<FileTransferEvent>,
    wake: Notify,
    stop_loop: Mutex<Option<CancellationToken>>,
}

/// Download completed pages
#[derive(Debug, Clone)]
pub struct FileTransferService {
    inner: Arc<FileTransferInner>,
}

impl FileTransferService {
    pub(crate) fn new(ctx: ServiceContext) -> Self {
        Self {
            inner: Arc::new(FileTransferInner {
                ctx,
                state: RunState::default(),
                sync_interval: RwLock::new(FileTransferConfig::default().sync_interval()),
                transform: RwLock::new(Matrix::IDENTITY),
                events: EventHub::new("file-transfer"),
                wake: Notify::new(),
                stop_loop: Mutex::new(None),
            }),
        }
    }

    /// Apply the `[file_transfer]` configuration section
    pub fn configure(&self, config: &FileTransferConfig) {
        self.set_sync_interval(config.sync_interval());
    }

    /// Whether the transfer loop is running
    pub fn is_started(&self) -> bool {
        self.inner.state.is_started()
    }

    /// How often the device is polled for pages
    pub fn sync_interval(&self) -> Duration {
        self.inner
            .sync_interval
            .read()
            .map(|d| *d)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    /// Change the poll interval; takes effect after the current wait
    pub fn set_sync_interval(&self, interval: Duration) {
        match self.inner.sync_interval.write() {
            Ok(mut d) => *d = interval,
            Err(poisoned) => *poisoned.into_inner() = interval,
        }
    }

    /// Transform applied to every transferred page
    pub fn transform(&self) -> Matrix {
        self.inner
            .transform
            .read()
            .map(|m| *m)
            .unwrap_or(Matrix::IDENTITY)
    }

    /// Replace the transform
    pub fn set_transform(&self, matrix: Matrix) {
        match self.inner.transform.write() {
            Ok(mut m) => *m = matrix,
            Err(poisoned) => *poisoned.into_inner() = matrix,
        }
    }

    /// Receive loop progress and failures
    pub fn subscribe_events(&self) -> Subscription<FileTransferEvent> {
        self.inner.events.subscribe()
    }

    /// Start the transfer loop
    ///
    /// With `allow_partial` false, a truncated page reaches the handler as a
    /// `FileTransfer` error instead of a document.
    pub async fn start<H>(&self, handler: H, allow_partial: bool, cancel: &CancellationToken) -> Result<()>
    where
        H: DocumentHandler + 'static,
    {
        let inner = &self.inner;
        let handler: Arc<dyn DocumentHandler> = Arc::new(handler);
        inner
            .state
            .start("File transfer", || async {
                inner.ctx.execute(Command::StartFileTransfer, cancel).await?;
                let stop = CancellationToken::new();
                self.replace_loop_token(Some(stop.clone()));
                tokio::spawn(pull_loop(Arc::clone(inner), handler, allow_partial, stop));
                Ok(())
            })
            .await?;
        info!("{}: file transfer started", inner.ctx.device_id);
        Ok(())
    }

    /// Stop the transfer loop
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        inner
            .state
            .stop("File transfer", || async {
                // the loop keeps pulling until the device agreed to stop
                inner.ctx.execute(Command::StopFileTransfer, cancel).await?;
                self.replace_loop_token(None);
                Ok(())
            })
            .await?;
        info!("{}: file transfer stopped", inner.ctx.device_id);
        Ok(())
    }

    /// Cancels the running loop, if any, and installs `token`
    fn replace_loop_token(&self, token: Option<CancellationToken>) {
        let mut slot = self
            .inner
            .stop_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(old) = std::mem::replace(&mut *slot, token) {
            old.cancel();
        }
    }

    /// The device announced waiting pages
    pub(crate) fn notify_files_available(&self, count: usize) {
        if self.is_started() {
            trace!("{} pages available, waking transfer loop", count);
            self.inner.wake.notify_one();
        }
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        self.replace_loop_token(None);
        if self.inner.state.force_stopped() {
            self.inner
                .ctx
                .execute_on_close(Command::StopFileTransfer)
                .await?;
        }
        self.inner.events.close();
        Ok(())
    }
}

async fn pull_loop(
    inner: Arc<FileTransferInner>,
    handler: Arc<dyn DocumentHandler>,
    allow_partial: bool,
    stop: CancellationToken,
) {
    loop {
        match pull_pending(&inner, handler.as_ref(), allow_partial, &stop).await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() || matches!(e, DeviceError::NotConnected) => break,
            Err(e) => {
                warn!("{}: file transfer round failed: {}", inner.ctx.device_id, e);
                inner.events.publish(FileTransferEvent::ServiceError {
                    message: e.to_string(),
                });
            }
        }

        let interval = inner
            .sync_interval
            .read()
            .map(|d| *d)
            .unwrap_or_else(|poisoned| *poisoned.into_inner());
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("{}: file transfer loop ended", inner.ctx.device_id);
}

/// Download, deliver and acknowledge every waiting page
async fn pull_pending(
    inner: &FileTransferInner,
    handler: &dyn DocumentHandler,
    allow_partial: bool,
    stop: &CancellationToken,
) -> Result<()> {
    let files = with_cancel(stop, inner.ctx.pending_files()).await?;
    if files == 0 {
        return Ok(());
    }
    inner
        .events
        .publish(FileTransferEvent::StartingFileDownload { files });

    for _ in 0..files {
        loop {
            let result = match with_cancel(stop, inner.ctx.download_file()).await {
                Ok(unit) if unit.complete || allow_partial => {
                    let matrix = inner
                        .transform
                        .read()
                        .map(|m| *m)
                        .unwrap_or(Matrix::IDENTITY);
                    Ok(unit.document.transformed(&matrix))
                }
                Ok(_) => Err(DeviceError::file_transfer("page transfer incomplete")),
                Err(e @ DeviceError::FileTransfer(_)) => Err(e),
                Err(e) => return Err(e),
            };
            if stop.is_cancelled() {
                return Err(DeviceError::Cancelled);
            }
            match handler.on_document(result).await {
                TransferControl::Retry => {
                    trace!("{}: downloading page again", inner.ctx.device_id);
                }
                TransferControl::Continue => {
                    inner.ctx.acknowledge_file().await?;
                    break;
                }
            }
        }
    }
    Ok(())
}
