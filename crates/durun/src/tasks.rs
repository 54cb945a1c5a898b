//! # Background Tasks
//!
//! Fire-and-forget work registered through `wait_until`. Tasks run on the
//! tokio runtime, outside the concurrency gate. A failure or panic is logged
//! and never reaches the caller that registered the task.
//!
//! `drain` waits for every outstanding task with settle-all semantics and is
//! called by the router right before an instance is evicted.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use tokio_util::task::TaskTracker;

/// Registry of background tasks for one instance.
#[derive(Debug)]
pub struct BackgroundTasks {
    owner: Arc<str>,
    tracker: TaskTracker,
    failures: Arc<AtomicU64>,
}

impl BackgroundTasks {
    pub fn new(owner: impl Into<Arc<str>>) -> Self {
        Self {
            owner: owner.into(),
            tracker: TaskTracker::new(),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Registers `task`; the instance is not evictable until it settles.
    pub fn wait_until<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let owner = self.owner.clone();
        let failures = self.failures.clone();

        self.tracker.spawn(async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(id = %owner, error = %e, "background task failed");
                }
                Err(panic) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        id = %owner,
                        panic = %panic_message(panic.as_ref()),
                        "background task panicked"
                    );
                }
            }
        });
    }

    /// Number of tasks that have not settled yet.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Number of tasks that failed or panicked so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Waits until every registered task has settled. Never fails.
    ///
    /// Tasks registered while draining are waited for as well.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
