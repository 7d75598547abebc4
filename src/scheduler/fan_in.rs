//! First-completion fan-in over running worker tasks
//!
//! [`FanIn::next`] returns exactly one finished task and leaves the others
//! running. Each task is keyed so a panic can still be attributed to the
//! steps it was running.

use std::future::Future;
use tokio::task::{JoinHandle, JoinSet};

/// Aborts the inner task when the waiting wrapper is dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct FanIn<K, T> {
    set: JoinSet<(K, Result<T, String>)>,
}

impl<K, T> FanIn<K, T>
where
    K: Send + 'static,
    T: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            set: JoinSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, key: K, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let mut inner = AbortOnDrop(tokio::spawn(task));
        self.set.spawn(async move {
            let result = (&mut inner.0)
                .await
                .map_err(|e| format!("Worker task failed: {}", e));
            (key, result)
        });
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Wait for the first task to finish; `None` when nothing is running
    pub async fn next(&mut self) -> Option<(K, Result<T, String>)> {
        loop {
            match self.set.join_next().await? {
                Ok(done) => return Some(done),
                // Only the wrapper can fail here, and only by being aborted
                Err(e) => log::debug!("[Scheduler] Fan-in wrapper ended: {}", e),
            }
        }
    }

    /// Abort every running task and wait for them to stop
    pub async fn shutdown(&mut self) {
        self.set.shutdown().await;
    }
}

impl<K, T> Default for FanIn<K, T>
where
    K: Send + 'static,
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
