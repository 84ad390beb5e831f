//! Bounded worker pools
//!
//! Tokio tasks gated by a semaphore: submission never blocks, at most
//! `size` submissions run concurrently, and shutdown waits for a grace
//! period before aborting stragglers.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A bounded pool of spawned tasks
pub struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(size.max(1))),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Submit work; it runs once a permit is available
    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            // A closed semaphore means the pool is shutting down.
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            work.await;
        });

        if let Ok(mut handles) = self.handles.lock() {
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }
    }

    /// Number of submissions currently tracked
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.handles
            .lock()
            .map(|h| h.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Graceful shutdown: stop admitting work, wait up to `grace` for
    /// in-flight tasks, then abort the rest.
    pub async fn shutdown(&self, grace: Duration) {
        self.permits.close();
        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .map(|mut h| h.drain(..).collect())
            .unwrap_or_default();

        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0usize;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }

        if aborted > 0 {
            warn!(pool = self.name, aborted, "worker pool force-cancelled tasks");
        } else {
            debug!(pool = self.name, "worker pool drained");
        }
    }
}
