//! Mining task lifecycle manager split into focused submodules.
//!
//! The `MailboxMiner` struct and its methods are organized by domain:
//! - [`lifecycle`] - Task creation, deletion and shutdown
//! - [`progress`] - Progress aggregation and completion
//! - [`stream`] - Live event streams tied to task lifetime

mod lifecycle;
mod progress;
mod stream;


pub use stream::{StreamGuard, TaskStream};

use crate::broker::{Broker, MemoryBroker};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetcher::{ChunkedMailboxFetcher, FetchOutcome};
use crate::imap::{HttpTokenRefresher, ImapConnector, MailConnector, TokenRefresher};
use crate::types::{MiningTask, TaskEvent, TaskId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_util::sync::CancellationToken;

/// Buffered events per task stream
const TASK_EVENT_CAPACITY: usize = 256;

/// Mutable state of one task
pub(crate) struct TaskState {
    pub(crate) task: MiningTask,
    pub(crate) fetch_outcome: Option<FetchOutcome>,
}

/// Everything the miner holds for one task
pub(crate) struct TaskHandle {
    pub(crate) state: Mutex<TaskState>,
    pub(crate) fetcher: Arc<ChunkedMailboxFetcher>,
    pub(crate) events: broadcast::Sender<TaskEvent>,
    /// Set by the single transition into a terminal state
    pub(crate) terminal: AtomicBool,
    /// Stops the progress listener
    pub(crate) listener: CancellationToken,
    /// Set once the signature and verification topics are unregistered
    pub(crate) downstream_released: AtomicBool,
}

impl TaskHandle {
    pub(crate) fn new(task: MiningTask, fetcher: Arc<ChunkedMailboxFetcher>) -> Self {
        let (events, _rx) = broadcast::channel(TASK_EVENT_CAPACITY);
        Self {
            state: Mutex::new(TaskState {
                task,
                fetch_outcome: None,
            }),
            fetcher,
            events,
            terminal: AtomicBool::new(false),
            listener: CancellationToken::new(),
            downstream_released: AtomicBool::new(false),
        }
    }

    pub(crate) async fn snapshot(&self) -> MiningTask {
        self.state.lock().await.task.clone()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }
}

/// Runs mining tasks: one mailbox fetch per task, feeding the pipeline stages
/// through the shared broker (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct MailboxMiner {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) connector: Arc<dyn MailConnector>,
    pub(crate) refresher: Arc<dyn TokenRefresher>,
    pub(crate) config: Arc<Config>,
    pub(crate) tasks: Arc<RwLock<HashMap<TaskId, Arc<TaskHandle>>>>,
    /// Cleared during shutdown
    pub(crate) accepting_new: Arc<AtomicBool>,
}

impl MailboxMiner {
    /// Create a miner over the given broker, mail connector and token refresher
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `config` does not validate.
    pub fn new(
        config: Config,
        broker: Arc<dyn Broker>,
        connector: Arc<dyn MailConnector>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            broker,
            connector,
            refresher,
            config: Arc::new(config),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            accepting_new: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Miner speaking IMAP over TLS with an in-process broker
    pub fn with_memory_broker(config: Config) -> Result<Self> {
        let refresher = HttpTokenRefresher::new(config.oauth.clone());
        Self::new(
            config,
            Arc::new(MemoryBroker::new()),
            Arc::new(ImapConnector::new()?),
            Arc::new(refresher),
        )
    }

    /// Shared broker handle, for running pipeline stages in-process
    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Snapshot of a task that has not been reaped yet
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown, deleted or reaped tasks.
    pub async fn get_active_task(&self, id: &TaskId) -> Result<MiningTask> {
        let handle = self.handle(id).await?;
        Ok(handle.snapshot().await)
    }

    /// Number of tasks currently held
    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Whether new tasks are accepted
    pub fn is_accepting(&self) -> bool {
        self.accepting_new.load(Ordering::SeqCst)
    }

    pub(crate) async fn handle(&self, id: &TaskId) -> Result<Arc<TaskHandle>> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Spawn the REST API server in a background task
    pub fn spawn_api_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let miner = Arc::new(self.clone());
        let config = self.get_config();
        tokio::spawn(async move { crate::api::start_api_server(miner, config).await })
    }
}
