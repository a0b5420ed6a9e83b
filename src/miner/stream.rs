//! Live event streams tied to task lifetime.

use super::MailboxMiner;
use crate::error::Result;
use crate::types::{MiningTask, TaskEvent, TaskId};
use tokio::sync::broadcast;

/// A subscription to one task's events
pub struct TaskStream {
    /// Task state when the stream was attached
    pub snapshot: MiningTask,
    /// Events after the snapshot
    pub events: broadcast::Receiver<TaskEvent>,
    /// Deletes the task when dropped
    pub guard: StreamGuard,
}

/// Deletes its task when dropped.
///
/// Held by whoever consumes a [`TaskStream`] so that a client going away
/// cancels the mining it started.
pub struct StreamGuard {
    miner: Option<MailboxMiner>,
    id: TaskId,
}

impl StreamGuard {
    /// Keep the task alive after the guard is dropped
    pub fn disarm(mut self) {
        self.miner = None;
    }

    /// Guarded task
    pub fn task_id(&self) -> &TaskId {
        &self.id
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let Some(miner) = self.miner.take() else {
            return;
        };
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if miner.delete_task(&id).await {
                        tracing::info!(task_id = %id, "Stream closed, task deleted");
                    }
                });
            }
            Err(_) => tracing::warn!(task_id = %id, "Stream closed outside a runtime, task left running"),
        }
    }
}

impl MailboxMiner {
    /// Subscribe to a task's progress and close events
    ///
    /// Dropping the returned guard deletes the task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`](crate::Error::NotFound) for unknown tasks.
    pub async fn attach_stream(&self, id: &TaskId) -> Result<TaskStream> {
        let handle = self.handle(id).await?;
        // subscribe before the snapshot so no event falls in between
        let events = handle.events.subscribe();
        let snapshot = handle.snapshot().await;

        Ok(TaskStream {
            snapshot,
            events,
            guard: StreamGuard {
                miner: Some(self.clone()),
                id: id.clone(),
            },
        })
    }
}
