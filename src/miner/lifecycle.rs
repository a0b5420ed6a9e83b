//! Task creation, deletion and shutdown.

use super::{MailboxMiner, TaskHandle};
use crate::broker::ControlPublisher;
use crate::error::{Error, FieldError, Result};
use crate::fetcher::{ChunkedMailboxFetcher, FetcherParams};
use crate::imap::ConnectionPool;
use crate::types::{
    AuthMode, MailboxCredentials, MailboxIdentity, MiningOptions, MiningTask, ProgressCounters,
    Stage, TaskEvent, TaskId, TaskStatus, TaskTopics,
};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Channel on which rotated access tokens of `email` are announced
pub fn token_rotation_channel(email: &str) -> String {
    format!("token-rotation-{email}")
}

fn validate_options(user_id: &str, options: &MiningOptions) -> Result<()> {
    let mut errors = Vec::new();
    if user_id.trim().is_empty() {
        errors.push(FieldError {
            field: "user_id".into(),
            message: "must not be empty".into(),
        });
    }
    if !options.mailbox.email().contains('@') {
        errors.push(FieldError {
            field: "mailbox.email".into(),
            message: format!("'{}' is not an email address", options.mailbox.email()),
        });
    }
    if options.folders.is_empty() {
        errors.push(FieldError {
            field: "folders".into(),
            message: "at least one folder is required".into(),
        });
    } else if options.folders.iter().any(|f| f.trim().is_empty()) {
        errors.push(FieldError {
            field: "folders".into(),
            message: "folder names must not be empty".into(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::invalid_fields("invalid mining request", errors))
    }
}

impl MailboxMiner {
    /// Start mining a mailbox
    ///
    /// Validates the request and the credentials before returning: the pool
    /// opens a first session and counts the selected folders. Every stage's
    /// topic is registered with its workers, then the fetch runs in the
    /// background.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] once [`shutdown`](Self::shutdown) started
    /// - [`Error::Validation`] for malformed options or mailbox settings
    /// - [`Error::Authentication`] when the server rejects the credentials
    ///
    /// A failed creation leaves no topic registered.
    pub async fn create_task(&self, user_id: &str, options: MiningOptions) -> Result<MiningTask> {
        if !self.is_accepting() {
            return Err(Error::ShuttingDown);
        }
        validate_options(user_id, &options)?;

        let id = self.unused_task_id().await;
        let topics = TaskTopics::for_task(&id);
        let email = options.mailbox.email().to_string();

        let mut pool = ConnectionPool::new(self.connector.clone(), self.config.pool.clone(), email.clone());
        let auth_mode = match &options.mailbox {
            MailboxCredentials::Password {
                host,
                port,
                password,
                ..
            } => {
                pool.configure_with_password(host, password, port)?;
                AuthMode::Password
            }
            MailboxCredentials::OAuth {
                access_token,
                refresh_token,
                ..
            } => {
                pool.configure_with_oauth(
                    access_token,
                    refresh_token.as_deref(),
                    self.refresher.as_ref(),
                    self.broker.as_ref(),
                    &token_rotation_channel(&email),
                )
                .await?;
                AuthMode::OAuth
            }
        };
        let (host, port) = pool
            .endpoint()
            .map(|(host, port)| (host.to_string(), port))
            .unwrap_or_default();

        let fetcher = ChunkedMailboxFetcher::new(
            Arc::new(pool),
            self.broker.clone(),
            FetcherParams {
                task_id: id.clone(),
                user_id: user_id.to_string(),
                folders: options.folders.clone(),
                topics: topics.clone(),
                config: self.config.mining.clone(),
            },
        );

        let task = MiningTask {
            id: id.clone(),
            user_id: user_id.to_string(),
            mailbox: MailboxIdentity {
                email,
                host,
                port,
                auth_mode,
            },
            folders: options.folders,
            status: TaskStatus::Pending,
            progress: ProgressCounters::default(),
            topics: topics.clone(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        let handle = Arc::new(TaskHandle::new(task, fetcher.clone()));
        self.tasks.write().await.insert(id.clone(), handle.clone());

        if let Err(e) = self.register_stages(&id, &topics).await {
            self.abandon(&handle).await;
            return Err(e);
        }

        // subscribe before any fetch so no progress is missed
        let progress = match self.broker.subscribe(&topics.progress_channel).await {
            Ok(progress) => progress,
            Err(e) => {
                self.abandon(&handle).await;
                return Err(e);
            }
        };

        let total = match fetcher.get_total_messages().await {
            Ok(total) => total,
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "Mailbox validation failed");
                self.abandon(&handle).await;
                return Err(e);
            }
        };

        let snapshot = {
            let mut state = handle.state.lock().await;
            state.task.status = TaskStatus::Running;
            state.task.progress.total = total;
            state.task.clone()
        };

        self.spawn_progress_listener(handle.clone(), progress);
        tracing::info!(
            task_id = %id,
            user_id = %snapshot.user_id,
            email = %snapshot.mailbox.email,
            total,
            "Mining task started"
        );
        Ok(snapshot)
    }

    async fn unused_task_id(&self) -> TaskId {
        let tasks = self.tasks.read().await;
        loop {
            let id = TaskId::generate();
            if !tasks.contains_key(&id) {
                return id;
            }
        }
    }

    async fn register_stages(&self, id: &TaskId, topics: &TaskTopics) -> Result<()> {
        for stage in Stage::ALL {
            let (topic, group) = topics.stage(stage);
            let publisher = ControlPublisher::new(
                self.broker.clone(),
                self.config.broker.control_channel(stage),
            );
            let receivers = publisher.register(id, topic, group).await?;
            if receivers == 0 {
                tracing::warn!(task_id = %id, stage = stage.as_str(), "No worker listening for stage registrations");
            }
        }
        Ok(())
    }

    pub(crate) async fn unregister_stages(&self, id: &TaskId, topics: &TaskTopics, stages: &[Stage]) {
        for &stage in stages {
            let (topic, group) = topics.stage(stage);
            let publisher = ControlPublisher::new(
                self.broker.clone(),
                self.config.broker.control_channel(stage),
            );
            if let Err(e) = publisher.delete(id, topic, group).await {
                tracing::warn!(task_id = %id, stage = stage.as_str(), error = %e, "Could not unregister stage topic");
            }
        }
    }

    /// Undo a creation that failed before the fetch started
    async fn abandon(&self, handle: &Arc<TaskHandle>) {
        let (id, topics) = {
            let state = handle.state.lock().await;
            (state.task.id.clone(), state.task.topics.clone())
        };
        handle.terminal.store(true, Ordering::SeqCst);
        handle.fetcher.stop(true).await;
        handle.downstream_released.store(true, Ordering::SeqCst);
        self.unregister_stages(&id, &topics, &Stage::ALL).await;
        self.tasks.write().await.remove(&id);
    }

    /// Move a task into its terminal state, once.
    ///
    /// Emits `close`, unregisters the stage topics and schedules the task to
    /// be reaped. A completed task only unregisters the messages topic here;
    /// the signature and verification topics still hold unread bodies and
    /// the end marker, so they go when the task is deleted or reaped.
    /// Later calls for the same task do nothing.
    pub(crate) async fn finish(&self, handle: &Arc<TaskHandle>, status: TaskStatus, error: Option<String>) {
        if handle.terminal.swap(true, Ordering::SeqCst) {
            return;
        }

        let (id, topics, event) = {
            let mut state = handle.state.lock().await;
            let task = &mut state.task;
            task.status = status;
            task.finished_at = Some(Utc::now());
            task.error = error.clone();
            let event = TaskEvent::Close {
                id: task.id.clone(),
                status,
                progress: task.progress,
                error,
            };
            (task.id.clone(), task.topics.clone(), event)
        };

        handle.events.send(event).ok();
        handle.listener.cancel();
        if status == TaskStatus::Completed {
            self.unregister_stages(&id, &topics, &[Stage::Messages]).await;
        } else {
            handle.downstream_released.store(true, Ordering::SeqCst);
            self.unregister_stages(&id, &topics, &Stage::ALL).await;
        }
        tracing::info!(task_id = %id, status = ?status, "Mining task finished");

        let miner = self.clone();
        let handle = handle.clone();
        let reap_delay = self.config.mining.reap_delay;
        tokio::spawn(async move {
            tokio::time::sleep(reap_delay).await;
            let reaped = {
                let mut tasks = miner.tasks.write().await;
                let current = tasks.get(&id).is_some_and(|current| Arc::ptr_eq(current, &handle));
                if current {
                    tasks.remove(&id);
                }
                current
            };
            if reaped {
                miner.release_downstream(&handle).await;
                tracing::debug!(task_id = %id, "Reaped finished task");
            }
        });
    }

    /// Unregister the signature and verification topics, once
    async fn release_downstream(&self, handle: &Arc<TaskHandle>) {
        if handle.downstream_released.swap(true, Ordering::SeqCst) {
            return;
        }
        let (id, topics) = {
            let state = handle.state.lock().await;
            (state.task.id.clone(), state.task.topics.clone())
        };
        self.unregister_stages(&id, &topics, &[Stage::Signatures, Stage::EmailsVerification])
            .await;
    }

    /// Cancel a task and forget it
    ///
    /// Stops the fetch, closes its sessions and unregisters the stage topics.
    /// Deleting an unknown or already deleted task does nothing. Returns
    /// whether a task was removed.
    pub async fn delete_task(&self, id: &TaskId) -> bool {
        let Ok(handle) = self.handle(id).await else {
            return false;
        };

        if !handle.is_terminal() {
            tracing::info!(task_id = %id, "Deleting mining task");
        }
        handle.fetcher.stop(true).await;
        self.finish(&handle, TaskStatus::Canceled, None).await;
        self.release_downstream(&handle).await;

        let mut tasks = self.tasks.write().await;
        match tasks.get(id) {
            Some(current) if Arc::ptr_eq(current, &handle) => tasks.remove(id).is_some(),
            _ => false,
        }
    }

    /// Stop accepting tasks and delete every held one
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating shutdown");
        self.accepting_new.store(false, Ordering::SeqCst);

        let ids: Vec<TaskId> = self.tasks.read().await.keys().cloned().collect();
        tracing::info!(active_count = ids.len(), "Deleting active mining tasks");

        futures::future::join_all(ids.iter().map(|id| self.delete_task(id))).await;

        tracing::info!("Shutdown complete");
        Ok(())
    }
}
