//! Bounded pool running origin fetches off the request path

use crate::error::{DownloadError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Fixed-size pool of fetch workers
///
/// At most `size` jobs run at once; the rest queue on the semaphore. On
/// shutdown, queued jobs are dropped without running and running jobs see
/// their cancellation token fire.
pub struct WorkerPool {
    size: usize,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    running: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        info!("Starting worker pool with {} workers", size);
        WorkerPool {
            size,
            permits: Arc::new(Semaphore::new(size)),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs holding a worker right now
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Token cancelled when the pool shuts down
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Queue a job
    ///
    /// # Returns
    /// * `Err(DownloadError::Interrupted)` if the pool is shutting down
    pub fn spawn<F>(&self, name: String, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(DownloadError::Interrupted(name));
        }

        let permits = Arc::clone(&self.permits);
        let shutdown = self.shutdown.clone();
        let running = Arc::clone(&self.running);

        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!("Worker pool closed before job {} started", name);
                        return;
                    }
                },
                _ = shutdown.cancelled() => {
                    debug!("Dropping queued job {} on shutdown", name);
                    return;
                }
            };

            running.fetch_add(1, Ordering::SeqCst);
            job.await;
            running.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Stop accepting jobs and wait up to `grace` for running ones
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.permits.close();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "Worker pool shutdown timed out with {} jobs still running",
                self.running()
            );
        } else {
            info!("Worker pool stopped");
        }
    }
}
