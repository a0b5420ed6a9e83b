//! Typed producers and consumers over broker topics

use super::{Broker, EntryId, TopicBatch};
use crate::error::Result;
use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// An entry read from a topic
#[derive(Clone, Debug, PartialEq)]
pub struct TopicMessage<T> {
    /// Topic the entry was read from
    pub topic: String,
    /// Entry id within the topic
    pub id: EntryId,
    /// Decoded payload
    pub payload: T,
}

/// Producer side of a named topic
pub struct Topic<T> {
    broker: Arc<dyn Broker>,
    name: String,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> Topic<T> {
    /// Handle on topic `name`
    pub fn new(broker: Arc<dyn Broker>, name: impl Into<String>) -> Self {
        Self {
            broker,
            name: name.into(),
            _marker: PhantomData,
        }
    }

    /// Topic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append every item as its own entry, in one atomic batch.
    ///
    /// Never waits on consumers.
    pub async fn produce(&self, items: &[T]) -> Result<Vec<EntryId>> {
        let entries = items
            .iter()
            .map(|item| Ok((self.name.clone(), serde_json::to_value(item)?)))
            .collect::<Result<Vec<_>>>()?;
        self.broker.append(entries).await
    }
}

/// A topic subscription: the topic and the group reading it
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    /// Topic name
    pub topic: String,
    /// Consumer group reading the topic
    pub group: String,
}

/// Group-based reader that trims what every group has already seen
pub struct Consumer<T> {
    broker: Arc<dyn Broker>,
    name: String,
    block: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Consumer<T> {
    /// Consumer `name` waiting at most `block` per read
    pub fn new(broker: Arc<dyn Broker>, name: impl Into<String>, block: Duration) -> Self {
        Self {
            broker,
            name: name.into(),
            block,
            _marker: PhantomData,
        }
    }

    /// Read up to `count` undelivered entries from each subscription.
    ///
    /// Subscriptions are read concurrently, each waiting at most the
    /// consumer's block duration. After a read the topic is trimmed to the
    /// oldest entry some group still needs. Broker failures and undecodable
    /// payloads are logged and skipped; this never fails.
    pub async fn consume(&self, subscriptions: &[Subscription], count: usize) -> Vec<TopicMessage<T>> {
        let reads = subscriptions.iter().map(|sub| self.consume_one(sub, count));
        futures::future::join_all(reads)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn consume_one(&self, sub: &Subscription, count: usize) -> Vec<TopicMessage<T>> {
        let batches = match self
            .broker
            .read_group(
                std::slice::from_ref(&sub.topic),
                &sub.group,
                &self.name,
                count,
                self.block,
            )
            .await
        {
            Ok(batches) => batches,
            Err(e) => {
                tracing::warn!(topic = %sub.topic, group = %sub.group, error = %e, "Topic read failed");
                return Vec::new();
            }
        };

        if !batches.is_empty() {
            self.trim_consumed(&sub.topic).await;
        }

        batches.into_iter().flat_map(decode_batch).collect()
    }

    async fn trim_consumed(&self, topic: &str) {
        let cursors = match self.broker.group_cursors(topic).await {
            Ok(cursors) => cursors,
            Err(e) => {
                tracing::warn!(topic, error = %e, "Reading group cursors failed");
                return;
            }
        };

        let Some(min_cursor) = cursors.into_iter().min() else {
            return;
        };
        match self.broker.trim(topic, min_cursor + 1).await {
            Ok(0) => {}
            Ok(removed) => tracing::trace!(topic, removed, "Trimmed topic"),
            Err(e) => tracing::warn!(topic, error = %e, "Topic trim failed"),
        }
    }
}

fn decode_batch<T: DeserializeOwned>(batch: TopicBatch) -> Vec<TopicMessage<T>> {
    let TopicBatch { topic, entries } = batch;
    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value(entry.payload) {
            Ok(payload) => Some(TopicMessage {
                topic: topic.clone(),
                id: entry.id,
                payload,
            }),
            Err(e) => {
                tracing::warn!(topic = %topic, id = entry.id, error = %e, "Skipping undecodable entry");
                None
            }
        })
        .collect()
}
