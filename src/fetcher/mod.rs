//! Chunked mailbox fetcher
//!
//! A mining run splits every selected folder into bounded sequence ranges
//! ([`EmailJob`]s) and works them off a shared queue with a fixed number of
//! workers, each holding one pooled session at a time. Fetched messages are
//! parsed, deduplicated per folder and appended to the task's contact and
//! signature topics; progress is published on the task's progress channel.
//!
//! Stopping comes in two flavours: a graceful stop lets queued jobs drain,
//! a cancel clears the queue and drops in-flight jobs together with their
//! sessions.

mod jobs;
mod message;

pub use jobs::{EmailJob, partition};
pub use message::{
    ContactMessage, HeaderMap, ParsedMessage, SignatureMessage, parse_message,
    synthesize_message_id,
};

use crate::broker::{Broker, Topic};
use crate::config::MiningConfig;
use crate::error::{Error, Result};
use crate::imap::{ConnectionPool, FetchParts, MailSession, RawMessage};
use crate::types::{ProgressEvent, ProgressType, TaskId, TaskTopics};
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How a fetch run ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Every job ran; individual jobs may have been abandoned
    Completed,
    /// Stopped by [`ChunkedMailboxFetcher::stop`] with `cancel`
    Canceled,
    /// Credentials were rejected, or the folders could not be counted
    Failed(String),
}

/// What a fetcher mines and where it publishes
#[derive(Clone, Debug)]
pub struct FetcherParams {
    /// Owning task
    pub task_id: TaskId,
    /// Owning user
    pub user_id: String,
    /// Folders requested for mining
    pub folders: Vec<String>,
    /// Topic and channel names of the task
    pub topics: TaskTopics,
    /// Chunking, concurrency and publishing settings
    pub config: MiningConfig,
}

/// Fetches one mailbox in parallel chunks and publishes every message
pub struct ChunkedMailboxFetcher {
    pool: Arc<ConnectionPool>,
    broker: Arc<dyn Broker>,
    params: FetcherParams,
    queue: Mutex<VecDeque<EmailJob>>,
    /// Accepted message ids per folder
    seen: Mutex<HashMap<String, HashSet<String>>>,
    failure: Mutex<Option<String>>,
    started: AtomicBool,
    stopping: AtomicBool,
    canceled: AtomicBool,
    completed: AtomicBool,
    sentinel_sent: AtomicBool,
    hard_stop: CancellationToken,
    /// Tracks the body of [`start`](Self::start)
    run: TaskTracker,
    workers: TaskTracker,
}

impl ChunkedMailboxFetcher {
    /// Fetcher drawing sessions from a configured `pool`
    pub fn new(pool: Arc<ConnectionPool>, broker: Arc<dyn Broker>, params: FetcherParams) -> Arc<Self> {
        Arc::new(Self {
            pool,
            broker,
            params,
            queue: Mutex::new(VecDeque::new()),
            seen: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            sentinel_sent: AtomicBool::new(false),
            hard_stop: CancellationToken::new(),
            run: TaskTracker::new(),
            workers: TaskTracker::new(),
        })
    }

    /// Owning task
    pub fn task_id(&self) -> &TaskId {
        &self.params.task_id
    }

    /// Whether the run was canceled, by request or by rejected credentials
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Whether the run ended with every job worked off
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    fn is_excluded(&self, folder: &str) -> bool {
        self.params
            .config
            .excluded_folders
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(folder))
    }

    /// Sum of message counts over the non-excluded folders.
    ///
    /// Uses a single session. Since this is the first pool use of a run it
    /// doubles as credential validation.
    pub async fn get_total_messages(&self) -> Result<u64> {
        let counts = self.count_folders(false).await?;
        Ok(counts.iter().map(|(_, count)| u64::from(*count)).sum())
    }

    async fn count_folders(&self, skip_failures: bool) -> Result<Vec<(String, u32)>> {
        let mut conn = self.pool.acquire_connection().await?;
        let mut counts = Vec::new();

        for folder in self.params.folders.iter().filter(|f| !self.is_excluded(f)) {
            match conn.status(folder).await {
                Ok(status) => counts.push((folder.clone(), status.message_count)),
                Err(e) if skip_failures && !e.is_authentication() => {
                    tracing::warn!(
                        task_id = %self.params.task_id,
                        folder = %folder,
                        error = %e,
                        "Could not count folder, skipping it"
                    );
                }
                Err(e) => {
                    self.pool.discard_connection(conn).await;
                    return Err(e);
                }
            }
        }

        self.pool.release_connection(conn).await;
        Ok(counts)
    }

    /// Run the fetch to the end.
    ///
    /// Counts the folders, queues one job per chunk and runs up to
    /// `max_parallel_connections` workers over the queue.
    pub async fn start(self: &Arc<Self>) -> FetchOutcome {
        let _running = self.run.token();
        if self.stopping.load(Ordering::SeqCst) {
            return FetchOutcome::Canceled;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return FetchOutcome::Failed("fetch already started".into());
        }

        let task_id = &self.params.task_id;
        let started_at = Instant::now();

        let counts = tokio::select! {
            _ = self.hard_stop.cancelled() => return FetchOutcome::Canceled,
            counts = self.count_folders(true) => counts,
        };
        let counts = match counts {
            Ok(counts) => counts,
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Could not count mailbox folders");
                if e.is_authentication() {
                    self.canceled.store(true, Ordering::SeqCst);
                }
                return FetchOutcome::Failed(e.to_string());
            }
        };

        let jobs: VecDeque<EmailJob> = counts
            .iter()
            .flat_map(|(folder, count)| partition(folder, *count, self.params.config.chunk_size))
            .collect();
        let job_count = jobs.len();
        {
            let mut queue = self.queue.lock().await;
            *queue = jobs;
            if self.is_canceled() {
                queue.clear();
            }
        }

        let workers = self.params.config.max_parallel_connections.min(job_count);
        tracing::info!(
            task_id = %task_id,
            folders = counts.len(),
            jobs = job_count,
            workers,
            "Starting mailbox fetch"
        );

        for worker in 0..workers {
            let fetcher = self.clone();
            self.workers.spawn(async move { fetcher.work(worker).await });
        }
        self.workers.close();
        self.workers.wait().await;

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        if let Some(reason) = self.failure.lock().await.clone() {
            tracing::error!(task_id = %task_id, elapsed_ms, reason = %reason, "Mailbox fetch failed");
            return FetchOutcome::Failed(reason);
        }
        if self.is_canceled() {
            tracing::info!(task_id = %task_id, elapsed_ms, "Mailbox fetch canceled");
            return FetchOutcome::Canceled;
        }

        self.completed.store(true, Ordering::SeqCst);
        tracing::info!(task_id = %task_id, elapsed_ms, "Mailbox fetch completed");
        FetchOutcome::Completed
    }

    async fn work(&self, worker: usize) {
        loop {
            if self.is_canceled() {
                break;
            }
            let Some(job) = self.queue.lock().await.pop_front() else {
                break;
            };

            tokio::select! {
                _ = self.hard_stop.cancelled() => break,
                result = self.run_job(&job) => {
                    if let Err(e) = result {
                        if e.is_authentication() {
                            tracing::error!(
                                task_id = %self.params.task_id,
                                folder = %job.folder,
                                range = %job.range,
                                error = %e,
                                "Credentials rejected mid-run, canceling fetch"
                            );
                            self.fail(e.to_string()).await;
                        } else {
                            tracing::warn!(
                                task_id = %self.params.task_id,
                                worker,
                                folder = %job.folder,
                                range = %job.range,
                                error = %e,
                                "Fetch job abandoned"
                            );
                        }
                    }
                }
            }
        }
    }

    async fn fail(&self, reason: String) {
        self.failure.lock().await.get_or_insert(reason);
        self.canceled.store(true, Ordering::SeqCst);
        self.queue.lock().await.clear();
    }

    async fn run_job(&self, job: &EmailJob) -> Result<()> {
        let mut conn = self.pool.acquire_connection().await?;
        let result = self.fetch_job(&mut *conn, job).await;
        match &result {
            Ok(()) => self.pool.release_connection(conn).await,
            Err(_) => self.pool.discard_connection(conn).await,
        }
        result
    }

    async fn fetch_job(&self, session: &mut dyn MailSession, job: &EmailJob) -> Result<()> {
        session.open_mailbox(&job.folder, true).await?;

        let parts = if self.params.config.fetch_body {
            FetchParts::HeaderAndText
        } else {
            FetchParts::Header
        };
        let batch_size = self.params.config.progress_batch_size.max(1);
        let mut pending = 0u64;

        let fetched = async {
            let mut messages = session.fetch(&job.range, parts).await?;
            while let Some(raw) = messages.next().await {
                if self.is_canceled() {
                    break;
                }
                if self.publish(job, &raw?).await {
                    pending += 1;
                    if pending >= batch_size {
                        self.report_fetched(pending).await;
                        pending = 0;
                    }
                }
            }
            Ok::<_, Error>(())
        }
        .await;

        if pending > 0 {
            self.report_fetched(pending).await;
        }
        fetched?;

        session.close_mailbox().await?;
        tracing::debug!(
            task_id = %self.params.task_id,
            folder = %job.folder,
            range = %job.range,
            "Fetch job done"
        );
        Ok(())
    }

    /// Publish one message; `true` when it was accepted
    async fn publish(&self, job: &EmailJob, raw: &RawMessage) -> bool {
        let Some(parsed) = parse_message(raw, self.params.config.signature_max_length) else {
            tracing::debug!(folder = %job.folder, seq = raw.seq, "Skipping message without headers");
            return false;
        };

        let is_last = raw.seq == job.total_in_folder;
        let inserted = {
            let mut seen = self.seen.lock().await;
            seen.entry(job.folder.clone())
                .or_default()
                .insert(parsed.message_id.clone())
        };
        if !inserted && !is_last {
            return false;
        }

        match self.append(job, raw.seq, is_last, parsed.clone()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    task_id = %self.params.task_id,
                    folder = %job.folder,
                    seq = raw.seq,
                    error = %e,
                    "Publishing message failed"
                );
                if inserted {
                    if let Some(folder) = self.seen.lock().await.get_mut(&job.folder) {
                        folder.remove(&parsed.message_id);
                    }
                }
                false
            }
        }
    }

    async fn append(&self, job: &EmailJob, seq: u32, is_last: bool, parsed: ParsedMessage) -> Result<()> {
        let params = &self.params;
        let contact = ContactMessage {
            mining_id: params.task_id.clone(),
            user_id: params.user_id.clone(),
            user_email: self.pool.email().to_string(),
            folder: job.folder.clone(),
            seq,
            total_in_folder: job.total_in_folder,
            is_last,
            message_id: parsed.message_id.clone(),
            header: parsed.header,
        };

        let mut entries = vec![(
            params.topics.messages_topic.clone(),
            serde_json::to_value(&contact)?,
        )];
        if let Some(text) = parsed.text {
            let signature = SignatureMessage::Email {
                mining_id: params.task_id.clone(),
                user_id: params.user_id.clone(),
                user_email: self.pool.email().to_string(),
                message_id: parsed.message_id,
                from: parsed.from,
                date: parsed.date,
                text,
            };
            entries.push((
                params.topics.signatures_topic.clone(),
                serde_json::to_value(&signature)?,
            ));
        }

        self.broker.append(entries).await?;
        Ok(())
    }

    async fn report_fetched(&self, count: u64) {
        let event = ProgressEvent {
            mining_id: self.params.task_id.clone(),
            progress_type: ProgressType::Fetched,
            count,
        };
        let published = match serde_json::to_string(&event) {
            Ok(payload) => {
                self.broker
                    .publish(&self.params.topics.progress_channel, payload)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = published {
            tracing::warn!(task_id = %self.params.task_id, error = %e, "Publishing fetch progress failed");
        }
    }

    /// Stop the run and release its resources.
    ///
    /// With `cancel` queued jobs are dropped and running ones aborted along
    /// with their sessions; otherwise queued and running jobs are left to
    /// finish. Either way the signature topic gets its end marker and the
    /// pool is cleaned. Returns whether the run had completed on its own.
    pub async fn stop(&self, cancel: bool) -> bool {
        self.stopping.store(true, Ordering::SeqCst);
        if cancel {
            self.canceled.store(true, Ordering::SeqCst);
            let dropped = {
                let mut queue = self.queue.lock().await;
                let dropped = queue.len();
                queue.clear();
                dropped
            };
            self.hard_stop.cancel();
            tracing::info!(task_id = %self.params.task_id, dropped_jobs = dropped, "Canceling mailbox fetch");
        }

        self.run.close();
        self.run.wait().await;

        if !self.sentinel_sent.swap(true, Ordering::SeqCst) {
            let signatures = Topic::new(self.broker.clone(), self.params.topics.signatures_topic.clone());
            let end = SignatureMessage::End {
                mining_id: self.params.task_id.clone(),
            };
            if let Err(e) = signatures.produce(&[end]).await {
                tracing::warn!(task_id = %self.params.task_id, error = %e, "Could not publish end of signatures");
            }
        }

        self.pool.clean_pool().await;
        self.is_completed()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::{PoolConfig, RetryConfig};
    use crate::test_helpers::{FakeConnector, GOOD_PASSWORD, eventually, message, numbered};
    use std::time::Duration;

    struct Harness {
        fetcher: Arc<ChunkedMailboxFetcher>,
        pool: Arc<ConnectionPool>,
        broker: Arc<MemoryBroker>,
        topics: TaskTopics,
    }

    fn mining_config(chunk_size: u32, parallel: usize) -> MiningConfig {
        MiningConfig {
            chunk_size,
            max_parallel_connections: parallel,
            excluded_folders: vec!["[Excluded]".into()],
            ..MiningConfig::default()
        }
    }

    fn harness(connector: &FakeConnector, folders: &[&str], config: MiningConfig) -> Harness {
        let mut pool = ConnectionPool::new(
            Arc::new(connector.clone()),
            PoolConfig {
                max_size: config.max_parallel_connections,
                connect_timeout: Duration::from_secs(1),
                retry: RetryConfig {
                    max_attempts: 1,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    jitter: false,
                    ..RetryConfig::default()
                },
            },
            "me@example.com",
        );
        pool.configure_with_password("imap.example.com", GOOD_PASSWORD, "993")
            .unwrap();
        let pool = Arc::new(pool);

        let broker = Arc::new(MemoryBroker::new());
        let task_id = TaskId::from("task1");
        let topics = TaskTopics::for_task(&task_id);
        let fetcher = ChunkedMailboxFetcher::new(
            pool.clone(),
            broker.clone(),
            FetcherParams {
                task_id,
                user_id: "user-1".into(),
                folders: folders.iter().map(|f| f.to_string()).collect(),
                topics: topics.clone(),
                config,
            },
        );
        Harness {
            fetcher,
            pool,
            broker,
            topics,
        }
    }

    async fn contact_ids(h: &Harness) -> Vec<String> {
        h.broker
            .snapshot(&h.topics.messages_topic)
            .await
            .into_iter()
            .map(|v| v["messageId"].as_str().unwrap().to_string())
            .collect()
    }

    fn fetched_counts(rx: &mut tokio::sync::broadcast::Receiver<String>) -> Vec<u64> {
        let mut counts = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            let event: ProgressEvent = serde_json::from_str(&payload).unwrap();
            assert_eq!(event.progress_type, ProgressType::Fetched);
            counts.push(event.count);
        }
        counts
    }

    #[tokio::test]
    async fn fetches_publishes_and_reports_progress() {
        let connector = FakeConnector::new()
            .with_folder("INBOX", numbered("in", 5))
            .with_folder("[Excluded]", numbered("ex", 3));
        let h = harness(&connector, &["INBOX", "[Excluded]"], mining_config(100, 4));
        let mut progress = h.broker.subscribe(&h.topics.progress_channel).await.unwrap();

        assert_eq!(h.fetcher.get_total_messages().await.unwrap(), 5);
        assert_eq!(h.fetcher.start().await, FetchOutcome::Completed);

        assert_eq!(
            connector.fetched_ranges(),
            vec![("INBOX".to_string(), "1:*".to_string())]
        );
        assert_eq!(contact_ids(&h).await.len(), 5);
        assert_eq!(fetched_counts(&mut progress), vec![5]);

        let first = &h.broker.snapshot(&h.topics.messages_topic).await[0];
        assert_eq!(first["miningId"], "task1");
        assert_eq!(first["userEmail"], "me@example.com");
        assert_eq!(first["folder"], "INBOX");
        assert_eq!(first["header"]["subject"][0], "message 1");

        assert!(h.fetcher.stop(false).await);
        let signatures = h.broker.snapshot(&h.topics.signatures_topic).await;
        assert_eq!(signatures.len(), 6);
        assert_eq!(signatures[0]["type"], "email");
        assert_eq!(signatures[5], serde_json::json!({"type": "end", "miningId": "task1"}));
        assert!(!h.pool.is_initialized().await);
        assert_eq!(connector.open_sessions(), 0);
    }

    #[tokio::test]
    async fn progress_is_flushed_per_batch_and_at_job_end() {
        let connector = FakeConnector::new().with_folder("INBOX", numbered("in", 5));
        let config = MiningConfig {
            progress_batch_size: 2,
            ..mining_config(100, 1)
        };
        let h = harness(&connector, &["INBOX"], config);
        let mut progress = h.broker.subscribe(&h.topics.progress_channel).await.unwrap();

        h.fetcher.start().await;
        assert_eq!(fetched_counts(&mut progress), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn duplicates_are_suppressed_except_the_last_message() {
        let a = message("a@test", "x@example.com", "a", None);
        let b = message("b@test", "y@example.com", "b", None);
        let connector =
            FakeConnector::new().with_folder("INBOX", vec![a.clone(), a.clone(), b, a]);
        let h = harness(&connector, &["INBOX"], mining_config(100, 1));

        assert_eq!(h.fetcher.start().await, FetchOutcome::Completed);
        assert_eq!(contact_ids(&h).await, vec!["a@test", "b@test", "a@test"]);

        let contacts = h.broker.snapshot(&h.topics.messages_topic).await;
        assert_eq!(contacts[2]["isLast"], true);
        assert_eq!(contacts[2]["seq"], 4);
    }

    #[tokio::test]
    async fn large_folders_are_fetched_in_chunks() {
        let connector = FakeConnector::new().with_folder("INBOX", numbered("in", 7));
        let h = harness(&connector, &["INBOX"], mining_config(3, 2));

        assert_eq!(h.fetcher.start().await, FetchOutcome::Completed);

        let mut ranges: Vec<String> = connector.fetched_ranges().into_iter().map(|(_, r)| r).collect();
        ranges.sort();
        assert_eq!(ranges, vec!["1:3", "4:6", "7:7"]);

        let mut ids = contact_ids(&h).await;
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 7);
    }

    #[tokio::test]
    async fn failed_job_is_abandoned_and_run_continues() {
        let connector = FakeConnector::new().with_folder("INBOX", numbered("in", 4));
        connector.fail_range("INBOX", "1:2");
        let h = harness(&connector, &["INBOX"], mining_config(2, 1));

        assert_eq!(h.fetcher.start().await, FetchOutcome::Completed);
        assert_eq!(contact_ids(&h).await, vec!["in-3@test", "in-4@test"]);
        assert_eq!(h.pool.acquired_count(), 0);
    }

    #[tokio::test]
    async fn jobs_wait_out_a_connect_outage() {
        let connector = FakeConnector::new().with_folder("INBOX", numbered("in", 6));
        let h = harness(&connector, &["INBOX"], mining_config(2, 2));
        assert_eq!(h.fetcher.get_total_messages().await.unwrap(), 6);

        // validated pool with no idle sessions, so every job connects
        h.pool.clean_pool().await;
        let conn = h.pool.acquire_connection().await.unwrap();
        h.pool.discard_connection(conn).await;
        connector.fail_next_connects(8);

        assert_eq!(h.fetcher.start().await, FetchOutcome::Completed);
        assert_eq!(contact_ids(&h).await.len(), 6);
        assert_eq!(h.pool.acquired_count(), 0);
    }

    #[tokio::test]
    async fn rejected_credentials_cancel_the_run() {
        let connector = FakeConnector::new().with_folder("INBOX", numbered("in", 4));
        connector.reject_range_as_auth_failure("INBOX", "1:2");
        let h = harness(&connector, &["INBOX"], mining_config(2, 1));

        let outcome = h.fetcher.start().await;
        assert!(matches!(outcome, FetchOutcome::Failed(ref reason) if reason.contains("token expired")));
        assert!(h.fetcher.is_canceled());
        assert_eq!(connector.fetched_ranges().len(), 1, "remaining jobs must not run");
        assert!(!h.fetcher.stop(false).await);
    }

    #[tokio::test]
    async fn uncountable_folder_is_skipped_at_start_but_fails_the_total() {
        let connector = FakeConnector::new()
            .with_folder("INBOX", numbered("in", 2))
            .with_folder("Archive", numbered("ar", 2));
        connector.fail_status("Archive");
        let h = harness(&connector, &["INBOX", "Archive"], mining_config(100, 2));

        assert!(h.fetcher.get_total_messages().await.is_err());
        assert_eq!(h.fetcher.start().await, FetchOutcome::Completed);
        assert_eq!(contact_ids(&h).await.len(), 2);
    }

    #[tokio::test]
    async fn graceful_stop_drains_queued_jobs() {
        let connector = FakeConnector::new()
            .with_folder("INBOX", numbered("in", 10))
            .with_message_delay(Duration::from_millis(30));
        let h = harness(&connector, &["INBOX"], mining_config(2, 2));

        let run = {
            let fetcher = h.fetcher.clone();
            tokio::spawn(async move { fetcher.start().await })
        };
        eventually(|| async { connector.fetches_in_flight() == 2 }).await;

        assert!(h.fetcher.stop(false).await);
        assert_eq!(run.await.unwrap(), FetchOutcome::Completed);
        assert_eq!(connector.fetched_ranges().len(), 5);
        assert_eq!(contact_ids(&h).await.len(), 10);
        assert_eq!(h.pool.acquired_count(), 0);
    }

    #[tokio::test]
    async fn cancel_drops_queued_jobs_and_closes_sessions() {
        let connector = FakeConnector::new()
            .with_folder("INBOX", numbered("in", 10))
            .with_message_delay(Duration::from_millis(500));
        let h = harness(&connector, &["INBOX"], mining_config(2, 2));

        let run = {
            let fetcher = h.fetcher.clone();
            tokio::spawn(async move { fetcher.start().await })
        };
        eventually(|| async { connector.fetches_in_flight() == 2 }).await;

        assert!(!h.fetcher.stop(true).await);
        assert_eq!(run.await.unwrap(), FetchOutcome::Canceled);
        assert_eq!(connector.fetched_ranges().len(), 2, "queued jobs must not start");
        assert_eq!(h.pool.acquired_count(), 0);
        assert_eq!(connector.open_sessions(), 0);
        assert_eq!(connector.fetches_in_flight(), 0);

        let signatures = h.broker.snapshot(&h.topics.signatures_topic).await;
        assert_eq!(signatures.last().unwrap()["type"], "end");
    }

    #[tokio::test]
    async fn stop_before_start_prevents_the_run() {
        let connector = FakeConnector::new().with_folder("INBOX", numbered("in", 2));
        let h = harness(&connector, &["INBOX"], mining_config(100, 1));

        assert!(!h.fetcher.stop(true).await);
        assert_eq!(h.fetcher.start().await, FetchOutcome::Canceled);
        assert!(connector.fetched_ranges().is_empty());

        // the end marker is written once
        h.fetcher.stop(true).await;
        assert_eq!(h.broker.snapshot(&h.topics.signatures_topic).await.len(), 1);
    }
}
