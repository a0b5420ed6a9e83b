//! In-process broker backend

use super::{Broker, BrokerEntry, EntryId, TopicBatch};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::time::Instant;

/// Buffered messages per pub/sub channel before slow receivers lag
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct TopicLog {
    entries: VecDeque<BrokerEntry>,
    last_id: EntryId,
    /// group name -> last delivered id
    groups: HashMap<String, EntryId>,
}

/// [`Broker`] keeping topics and channels in process memory.
///
/// Topics are append-only deques with per-group cursors. Blocking reads
/// park on a [`Notify`] woken by every append. Pub/sub channels are
/// `broadcast` senders created on first subscription, so a publish before
/// any subscription reaches nobody.
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, TopicLog>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    appended: Notify,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            appended: Notify::new(),
        }
    }

    /// Number of entries currently stored in `topic` (0 for unknown topics)
    pub async fn topic_len(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|log| log.entries.len())
            .unwrap_or(0)
    }

    /// Whether `topic` exists
    pub async fn has_topic(&self, topic: &str) -> bool {
        self.topics.lock().await.contains_key(topic)
    }

    /// Every payload currently stored in `topic`, oldest first
    pub async fn snapshot(&self, topic: &str) -> Vec<serde_json::Value> {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|log| log.entries.iter().map(|e| e.payload.clone()).collect())
            .unwrap_or_default()
    }

    async fn try_read(
        &self,
        topics: &[String],
        group: &str,
        count: usize,
    ) -> Result<Vec<TopicBatch>> {
        let mut logs = self.topics.lock().await;

        for topic in topics {
            let has_group = logs
                .get(topic)
                .is_some_and(|log| log.groups.contains_key(group));
            if !has_group {
                return Err(Error::Broker(format!(
                    "NOGROUP no consumer group '{group}' on topic '{topic}'"
                )));
            }
        }

        let mut batches = Vec::new();
        for topic in topics {
            let Some(log) = logs.get_mut(topic) else {
                continue;
            };
            let cursor = log.groups.get(group).copied().unwrap_or(0);
            let entries: Vec<BrokerEntry> = log
                .entries
                .iter()
                .filter(|e| e.id > cursor)
                .take(count)
                .cloned()
                .collect();

            if let Some(last) = entries.last() {
                log.groups.insert(group.to_string(), last.id);
                batches.push(TopicBatch {
                    topic: topic.clone(),
                    entries,
                });
            }
        }
        Ok(batches)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn append(&self, entries: Vec<(String, serde_json::Value)>) -> Result<Vec<EntryId>> {
        let mut ids = Vec::with_capacity(entries.len());
        {
            let mut logs = self.topics.lock().await;
            for (topic, payload) in entries {
                let log = logs.entry(topic).or_default();
                log.last_id += 1;
                log.entries.push_back(BrokerEntry {
                    id: log.last_id,
                    payload,
                });
                ids.push(log.last_id);
            }
        }
        self.appended.notify_waiters();
        Ok(ids)
    }

    async fn create_group(&self, topic: &str, group: &str) -> Result<()> {
        let mut logs = self.topics.lock().await;
        let log = logs.entry(topic.to_string()).or_default();
        // New groups start before the oldest retained entry
        let start = log.entries.front().map(|e| e.id - 1).unwrap_or(log.last_id);
        log.groups.entry(group.to_string()).or_insert(start);
        Ok(())
    }

    async fn destroy_group(&self, topic: &str, group: &str) -> Result<()> {
        if let Some(log) = self.topics.lock().await.get_mut(topic) {
            log.groups.remove(group);
        }
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.topics.lock().await.remove(topic);
        // Wake blocked readers so they notice the missing group
        self.appended.notify_waiters();
        Ok(())
    }

    async fn read_group(
        &self,
        topics: &[String],
        group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<TopicBatch>> {
        let deadline = Instant::now() + block;

        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batches = self.try_read(topics, group, count).await?;
            if !batches.is_empty() || Instant::now() >= deadline {
                return Ok(batches);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn group_cursors(&self, topic: &str) -> Result<Vec<EntryId>> {
        Ok(self
            .topics
            .lock()
            .await
            .get(topic)
            .map(|log| log.groups.values().copied().collect())
            .unwrap_or_default())
    }

    async fn trim(&self, topic: &str, min_id: EntryId) -> Result<usize> {
        let mut logs = self.topics.lock().await;
        let Some(log) = logs.get_mut(topic) else {
            return Ok(0);
        };
        let before = log.entries.len();
        while log.entries.front().is_some_and(|e| e.id < min_id) {
            log.entries.pop_front();
        }
        Ok(before - log.entries.len())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        let channels = self.channels.lock().await;
        match channels.get(channel) {
            // No receivers is not an error: nobody is listening right now
            Some(sender) => Ok(sender.send(payload).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        let mut channels = self.channels.lock().await;
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(sender.subscribe())
    }
}
