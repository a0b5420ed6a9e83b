//! Message broker abstraction
//!
//! Every pipeline stage talks to the same broker through the [`Broker`]
//! trait: append-only topics consumed through named consumer groups, plus
//! fire-and-forget pub/sub channels for the control plane and progress
//! reporting. The backend is chosen once, when the [`MailboxMiner`] is
//! constructed, and shared as an `Arc<dyn Broker>`.
//!
//! [`MailboxMiner`]: crate::MailboxMiner

mod memory;
pub mod registry;
pub mod topic;

pub use memory::MemoryBroker;
pub use registry::{
    ControlCommand, ControlMessage, ControlPublisher, PipelineRegistry, StageProcessor,
    StageWorker,
};
pub use topic::{Consumer, Subscription, Topic, TopicMessage};

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

/// Position of an entry within its topic. Ids start at 1 and only grow.
pub type EntryId = u64;

/// One entry read from a topic
#[derive(Clone, Debug, PartialEq)]
pub struct BrokerEntry {
    /// Entry id within the topic
    pub id: EntryId,
    /// Entry payload
    pub payload: serde_json::Value,
}

/// Entries read from one topic
#[derive(Clone, Debug, PartialEq)]
pub struct TopicBatch {
    /// Topic the entries came from
    pub topic: String,
    /// Entries in append order
    pub entries: Vec<BrokerEntry>,
}

/// Storage and messaging backend shared by every pipeline component
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append `(topic, payload)` pairs as one atomic batch.
    ///
    /// Either every entry becomes visible to readers or none does. Returns
    /// the assigned ids in input order.
    async fn append(&self, entries: Vec<(String, serde_json::Value)>) -> Result<Vec<EntryId>>;

    /// Create consumer group `group` on `topic`, starting at the beginning
    /// of the topic. Creating an existing group is a no-op.
    async fn create_group(&self, topic: &str, group: &str) -> Result<()>;

    /// Destroy consumer group `group` on `topic`. Missing groups are ignored.
    async fn destroy_group(&self, topic: &str, group: &str) -> Result<()>;

    /// Drop `topic` with all of its entries and groups
    async fn delete_topic(&self, topic: &str) -> Result<()>;

    /// Read up to `count` entries per topic that `group` has not seen yet.
    ///
    /// Delivered entries advance the group cursor. When nothing is ready the
    /// call waits up to `block` for new entries. Fails when `group` does not
    /// exist on one of `topics`.
    async fn read_group(
        &self,
        topics: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<TopicBatch>>;

    /// Last delivered id of every group on `topic`
    async fn group_cursors(&self, topic: &str) -> Result<Vec<EntryId>>;

    /// Remove every entry of `topic` whose id is below `min_id`. Returns the
    /// number of removed entries.
    async fn trim(&self, topic: &str, min_id: EntryId) -> Result<usize>;

    /// Publish `payload` on `channel`. Only currently subscribed receivers
    /// get it. Returns the number of receivers.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize>;

    /// Subscribe to `channel`
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>>;
}
