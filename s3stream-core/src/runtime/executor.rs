//! Upload executor
//!
//! A dedicated multi-thread Tokio runtime running a fixed set of upload
//! workers. Submitted buffers go through one FIFO queue; each worker pulls
//! the next buffer, runs its upload callback, and drops it, which fires the
//! buffer's completion signal. Parts finish in any order.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, S3StreamError};
use crate::metrics::standard;
use crate::storage::FileBuffer;

/// Configuration for the upload executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of concurrent part uploads (and runtime worker threads)
    pub workers: usize,
    /// Thread name prefix
    pub thread_name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(4),
            thread_name: "s3stream-upload".into(),
        }
    }
}

type Queue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<FileBuffer>>>;

/// Worker pool that runs buffer upload callbacks concurrently
pub struct UploadExecutor {
    runtime: Option<Runtime>,
    handle: Handle,
    sender: Mutex<Option<mpsc::UnboundedSender<FileBuffer>>>,
    queued: Arc<AtomicUsize>,
    workers: usize,
}

impl UploadExecutor {
    /// Build the runtime and start the workers
    pub fn new(config: ExecutorConfig) -> Result<Arc<Self>> {
        if config.workers == 0 {
            return Err(S3StreamError::InvalidConfig {
                reason: "upload executor needs at least one worker".into(),
            });
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(config.workers)
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()
            .map_err(|e| S3StreamError::Internal {
                message: format!("Failed to create upload runtime: {}", e),
            })?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let queue: Queue = Arc::new(tokio::sync::Mutex::new(receiver));
        let queued = Arc::new(AtomicUsize::new(0));

        for worker_id in 0..config.workers {
            runtime.spawn(worker_loop(worker_id, queue.clone(), queued.clone()));
        }

        debug!("Upload executor started with {} workers", config.workers);

        Ok(Arc::new(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            sender: Mutex::new(Some(sender)),
            queued,
            workers: config.workers,
        }))
    }

    /// Queue a sealed buffer for upload.
    ///
    /// On rejection the buffer is dropped here, which still fires its
    /// completion signal.
    pub(crate) fn execute(&self, buffer: FileBuffer) -> Result<()> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(S3StreamError::ExecutorShutdown);
        };

        self.queued.fetch_add(1, Ordering::AcqRel);
        standard::INFLIGHT_PARTS.inc();
        if sender.send(buffer).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            standard::INFLIGHT_PARTS.dec();
            return Err(S3StreamError::ExecutorShutdown);
        }
        Ok(())
    }

    /// Spawn cleanup that must finish even if every other handle to the
    /// executor goes away meanwhile.
    ///
    /// The task holds the executor until it completes, so uploads it waits
    /// on keep running. It runs on the caller's runtime when there is one;
    /// the last handle must not be released on one of this runtime's own
    /// workers.
    pub fn spawn_cleanup<F>(self: &Arc<Self>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match Handle::try_current() {
            Ok(caller) => {
                let executor = Arc::clone(self);
                caller.spawn(async move {
                    future.await;
                    drop(executor);
                });
            }
            Err(_) => {
                debug!("No runtime in scope, running cleanup on the upload runtime");
                self.handle.spawn(future);
            }
        }
    }

    /// Buffers queued or being uploaded
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Number of workers
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runtime handle
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Stop accepting work. Queued buffers are still uploaded.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            debug!("Upload executor stopped accepting work");
        }
    }
}

impl Drop for UploadExecutor {
    fn drop(&mut self) {
        self.shutdown();
        // Never blocks, so the executor may be dropped from async code.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn worker_loop(worker_id: usize, queue: Queue, queued: Arc<AtomicUsize>) {
    debug!("Upload worker {} started", worker_id);
    loop {
        let next = queue.lock().await.recv().await;
        let Some(buffer) = next else {
            break;
        };

        buffer.run_upload().await;
        queued.fetch_sub(1, Ordering::AcqRel);
        standard::INFLIGHT_PARTS.dec();
    }
    debug!("Upload worker {} exiting", worker_id);
}
