//! Fire-and-forget task submission.
//!
//! Audit entries, webhooks, blob cleanup and task purges run detached from
//! the caller. Each task runs at most once; failures are logged and never
//! reach the submitter.

use std::future::Future;

use tokio_util::task::TaskTracker;

/// Tracks detached tasks so shutdown and tests can drain them.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a detached task. An `Err` outcome is logged with the task name.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tracker.spawn(async move {
            match task.await {
                Ok(()) => tracing::debug!(task = name, "background task finished"),
                Err(e) => tracing::warn!(task = name, error = %e, "background task failed"),
            }
        });
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait until every submitted task (including ones submitted while
    /// waiting) has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
