//! Bounded fire-and-forget background work.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Runs detached tasks, at most `permits` at a time.
///
/// Failures are logged and never retried.
#[derive(Clone)]
pub struct BackgroundWorker {
    permits: Arc<Semaphore>,
}

impl BackgroundWorker {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Number of tasks that could start right now without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawn `fut` once a permit is free.  Returns immediately.
    pub fn spawn<F>(&self, label: &'static str, fut: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(task = label, "background worker closed, dropping task");
                return;
            };
            match fut.await {
                Ok(()) => debug!(task = label, "background task finished"),
                Err(e) => warn!(task = label, error = %e, "background task failed"),
            }
        })
    }
}
