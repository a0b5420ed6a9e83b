//! Pipeline control plane
//!
//! Long-running stage workers learn which topics to poll from REGISTER and
//! DELETE messages published on a per-stage control channel. The
//! [`PipelineRegistry`] owns the resulting active set; a [`StageWorker`]
//! polls whatever the registry currently holds.
//!
//! Control messages reach only connected subscribers: a registry started
//! after a REGISTER never learns about that topic.

use super::topic::{Consumer, Subscription, TopicMessage};
use super::Broker;
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::types::{ProgressEvent, TaskId, progress_channel};
use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Control plane command
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    /// Start polling the topic
    Register,
    /// Stop polling the topic and drop it
    Delete,
}

/// Message carried on a stage control channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    /// Task owning the topic
    pub task_id: TaskId,
    /// What to do
    pub command: ControlCommand,
    /// Topic name
    pub topic: String,
    /// Consumer group the stage reads the topic with
    pub consumer_group: String,
}

/// Publishes control messages for one stage
#[derive(Clone)]
pub struct ControlPublisher {
    broker: Arc<dyn Broker>,
    channel: String,
}

impl ControlPublisher {
    /// Publisher on `channel`
    pub fn new(broker: Arc<dyn Broker>, channel: impl Into<String>) -> Self {
        Self {
            broker,
            channel: channel.into(),
        }
    }

    /// Control channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Ask the stage to start polling `topic` with `group`
    pub async fn register(&self, task_id: &TaskId, topic: &str, group: &str) -> Result<usize> {
        self.send(task_id, ControlCommand::Register, topic, group)
            .await
    }

    /// Ask the stage to stop polling `topic` and drop it
    pub async fn delete(&self, task_id: &TaskId, topic: &str, group: &str) -> Result<usize> {
        self.send(task_id, ControlCommand::Delete, topic, group)
            .await
    }

    async fn send(
        &self,
        task_id: &TaskId,
        command: ControlCommand,
        topic: &str,
        group: &str,
    ) -> Result<usize> {
        let message = ControlMessage {
            task_id: task_id.clone(),
            command,
            topic: topic.to_string(),
            consumer_group: group.to_string(),
        };
        let payload = serde_json::to_string(&message)?;
        let receivers = self.broker.publish(&self.channel, payload).await?;

        tracing::debug!(
            task_id = %task_id,
            channel = %self.channel,
            ?command,
            topic,
            receivers,
            "Published control message"
        );
        Ok(receivers)
    }
}

/// An active topic as seen by a stage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveStream {
    /// Task owning the topic
    pub task_id: TaskId,
    /// Consumer group the stage reads with
    pub group: String,
}

/// Active topic set of one stage, maintained from its control channel.
///
/// Only the listener task spawned by [`PipelineRegistry::start`] mutates
/// the set.
pub struct PipelineRegistry {
    channel: String,
    active: Arc<RwLock<HashMap<String, ActiveStream>>>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineRegistry {
    /// Subscribe to `channel` and start applying control messages.
    ///
    /// Returns once the subscription is live, so any control message
    /// published afterwards is observed.
    pub async fn start(broker: Arc<dyn Broker>, channel: impl Into<String>) -> Result<Arc<Self>> {
        let channel = channel.into();
        let receiver = broker.subscribe(&channel).await?;

        let registry = Arc::new(Self {
            channel: channel.clone(),
            active: Arc::new(RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
            listener: Mutex::new(None),
        });

        let handle = tokio::spawn(listen(
            broker,
            channel,
            receiver,
            registry.active.clone(),
            registry.cancel.clone(),
        ));
        *registry.listener.lock().await = Some(handle);

        Ok(registry)
    }

    /// Control channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Topics currently registered, with the group to read them with
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.active
            .read()
            .await
            .iter()
            .map(|(topic, stream)| Subscription {
                topic: topic.clone(),
                group: stream.group.clone(),
            })
            .collect()
    }

    /// Task owning `topic`, if it is registered
    pub async fn task_for(&self, topic: &str) -> Option<TaskId> {
        self.active
            .read()
            .await
            .get(topic)
            .map(|stream| stream.task_id.clone())
    }

    /// Whether `topic` is registered
    pub async fn is_active(&self, topic: &str) -> bool {
        self.active.read().await.contains_key(topic)
    }

    /// Stop listening. The active set is kept as it was.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.listener.lock().await.take() {
            handle.await.ok();
        }
    }
}

async fn listen(
    broker: Arc<dyn Broker>,
    channel: String,
    mut receiver: broadcast::Receiver<String>,
    active: Arc<RwLock<HashMap<String, ActiveStream>>>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            received = receiver.recv() => match received {
                Ok(payload) => payload,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %channel, skipped, "Control listener lagged, messages lost");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let message: ControlMessage = match serde_json::from_str(&payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Ignoring malformed control message");
                continue;
            }
        };

        apply(broker.as_ref(), &active, message).await;
    }

    tracing::debug!(channel = %channel, "Control listener stopped");
}

async fn apply(
    broker: &dyn Broker,
    active: &RwLock<HashMap<String, ActiveStream>>,
    message: ControlMessage,
) {
    let ControlMessage {
        task_id,
        command,
        topic,
        consumer_group,
    } = message;

    match command {
        ControlCommand::Register => {
            if let Err(e) = broker.create_group(&topic, &consumer_group).await {
                tracing::warn!(task_id = %task_id, topic = %topic, error = %e, "Creating consumer group failed");
            }
            tracing::info!(task_id = %task_id, topic = %topic, "Topic registered");
            active.write().await.insert(
                topic,
                ActiveStream {
                    task_id,
                    group: consumer_group,
                },
            );
        }
        ControlCommand::Delete => {
            active.write().await.remove(&topic);
            if let Err(e) = broker.destroy_group(&topic, &consumer_group).await {
                tracing::warn!(task_id = %task_id, topic = %topic, error = %e, "Destroying consumer group failed");
            }
            if let Err(e) = broker.delete_topic(&topic).await {
                tracing::warn!(task_id = %task_id, topic = %topic, error = %e, "Deleting topic failed");
            }
            tracing::info!(task_id = %task_id, topic = %topic, "Topic deleted");
        }
    }
}

/// Stage-specific batch handler driven by a [`StageWorker`]
#[async_trait]
pub trait StageProcessor: Send + Sync + 'static {
    /// Payload type of the stage's topics
    type Item: DeserializeOwned + Send + 'static;

    /// Handle a batch read from one task's topic and report progress
    async fn process(
        &self,
        task_id: &TaskId,
        batch: Vec<TopicMessage<Self::Item>>,
    ) -> Result<Vec<ProgressEvent>>;
}

/// Poll loop of one downstream stage
pub struct StageWorker {
    name: String,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StageWorker {
    /// Start polling `registry`'s active set with `processor`.
    ///
    /// The loop keeps running while the active set is empty and ends only
    /// on [`StageWorker::stop`].
    pub fn spawn<P: StageProcessor>(
        name: impl Into<String>,
        broker: Arc<dyn Broker>,
        registry: Arc<PipelineRegistry>,
        processor: Arc<P>,
        config: &BrokerConfig,
    ) -> Self {
        let name = name.into();
        let cancel = CancellationToken::new();
        let consumer = Consumer::<P::Item>::new(broker.clone(), name.clone(), config.block);

        let handle = tokio::spawn(poll_loop(PollLoop {
            name: name.clone(),
            broker,
            registry,
            consumer,
            processor,
            read_count: config.read_count,
            idle_wait: config.block,
            cancel: cancel.clone(),
        }));

        Self {
            name,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the poll loop and wait for it to exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            handle.await.ok();
        }
    }
}

struct PollLoop<P: StageProcessor> {
    name: String,
    broker: Arc<dyn Broker>,
    registry: Arc<PipelineRegistry>,
    consumer: Consumer<P::Item>,
    processor: Arc<P>,
    read_count: usize,
    idle_wait: Duration,
    cancel: CancellationToken,
}

async fn poll_loop<P: StageProcessor>(state: PollLoop<P>) {
    let PollLoop {
        name,
        broker,
        registry,
        consumer,
        processor,
        read_count,
        idle_wait,
        cancel,
    } = state;

    tracing::debug!(worker = %name, "Stage worker started");

    while !cancel.is_cancelled() {
        let subscriptions = registry.subscriptions().await;
        if subscriptions.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(idle_wait) => continue,
            }
        }

        let messages = tokio::select! {
            _ = cancel.cancelled() => break,
            messages = consumer.consume(&subscriptions, read_count) => messages,
        };

        let mut per_task: HashMap<TaskId, Vec<TopicMessage<P::Item>>> = HashMap::new();
        for message in messages {
            // A DELETE may have landed while the read was in flight
            let Some(task_id) = registry.task_for(&message.topic).await else {
                continue;
            };
            per_task.entry(task_id).or_default().push(message);
        }

        for (task_id, batch) in per_task {
            let events = match processor.process(&task_id, batch).await {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(worker = %name, task_id = %task_id, error = %e, "Stage batch failed");
                    continue;
                }
            };

            for event in events {
                publish_progress(broker.as_ref(), &name, &event).await;
            }
        }
    }

    tracing::debug!(worker = %name, "Stage worker stopped");
}

async fn publish_progress(broker: &dyn Broker, worker: &str, event: &ProgressEvent) {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(worker, error = %e, "Serializing progress failed");
            return;
        }
    };
    if let Err(e) = broker
        .publish(&progress_channel(&event.mining_id), payload)
        .await
    {
        tracing::warn!(worker, task_id = %event.mining_id, error = %e, "Publishing progress failed");
    }
}
