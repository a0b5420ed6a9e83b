//! Progress aggregation and completion.
//!
//! Each running task has one listener folding the `{progressType, count}`
//! events of its progress channel into the task counters. The fetch outcome
//! is delivered to the same listener, after every progress event already
//! published, so completion is judged on up-to-date counters.

use super::{MailboxMiner, TaskHandle};
use crate::fetcher::FetchOutcome;
use crate::types::{ProgressEvent, TaskEvent, TaskStatus};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};

impl MailboxMiner {
    /// Start the fetch of a validated task together with its listener
    pub(crate) fn spawn_progress_listener(
        &self,
        handle: Arc<TaskHandle>,
        progress: broadcast::Receiver<String>,
    ) {
        let (done_tx, done_rx) = oneshot::channel();

        let fetcher = handle.fetcher.clone();
        tokio::spawn(async move {
            let outcome = fetcher.start().await;
            done_tx.send(outcome).ok();
        });

        let miner = self.clone();
        tokio::spawn(async move { miner.follow(handle, progress, done_rx).await });
    }

    async fn follow(
        &self,
        handle: Arc<TaskHandle>,
        mut progress: broadcast::Receiver<String>,
        mut done: oneshot::Receiver<FetchOutcome>,
    ) {
        let mut fetch_pending = true;
        loop {
            tokio::select! {
                _ = handle.listener.cancelled() => break,
                outcome = &mut done, if fetch_pending => {
                    fetch_pending = false;
                    while let Ok(payload) = progress.try_recv() {
                        self.apply_progress(&handle, &payload).await;
                    }
                    match outcome {
                        Ok(outcome) => self.on_fetch_finished(&handle, outcome).await,
                        // fetch task went away without reporting
                        Err(_) => self.finish(&handle, TaskStatus::Failed, Some("fetch task aborted".into())).await,
                    }
                }
                message = progress.recv() => match message {
                    Ok(payload) => {
                        self.apply_progress(&handle, &payload).await;
                        self.complete_if_done(&handle).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Progress listener lagged, counters may be low");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn apply_progress(&self, handle: &TaskHandle, payload: &str) {
        let event: ProgressEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring malformed progress event");
                return;
            }
        };

        let forwarded = {
            let mut state = handle.state.lock().await;
            if event.mining_id != state.task.id {
                return;
            }
            state.task.progress.apply(event.progress_type, event.count);
            TaskEvent::Progress {
                id: event.mining_id,
                progress_type: event.progress_type,
                count: event.count,
                progress: state.task.progress,
            }
        };
        handle.events.send(forwarded).ok();
    }

    async fn on_fetch_finished(&self, handle: &Arc<TaskHandle>, outcome: FetchOutcome) {
        handle.state.lock().await.fetch_outcome = Some(outcome.clone());
        match outcome {
            FetchOutcome::Completed => {
                handle.fetcher.stop(false).await;
                self.complete_if_done(handle).await;
            }
            FetchOutcome::Failed(reason) => {
                handle.fetcher.stop(true).await;
                self.finish(handle, TaskStatus::Failed, Some(reason)).await;
            }
            // driven by delete_task
            FetchOutcome::Canceled => {}
        }
    }

    async fn complete_if_done(&self, handle: &Arc<TaskHandle>) {
        let done = {
            let state = handle.state.lock().await;
            state.fetch_outcome == Some(FetchOutcome::Completed)
                && (!self.config.mining.wait_for_extraction
                    || state.task.progress.extracted >= state.task.progress.fetched)
        };
        if done {
            self.finish(handle, TaskStatus::Completed, None).await;
        }
    }
}
