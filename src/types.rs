//! Core types for mailbox-miner

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Length of generated task ids
const TASK_ID_LEN: usize = 10;

/// Unique identifier for a mining task
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a short random alphanumeric id
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TASK_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mining task lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, credentials not yet validated
    Pending,
    /// Fetching and/or waiting for downstream stages
    Running,
    /// Every message fetched and processed
    Completed,
    /// Stopped by the caller
    Canceled,
    /// Stopped by an error
    Failed,
}

impl TaskStatus {
    /// Terminal states are never left once entered
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Canceled | TaskStatus::Failed
        )
    }
}

/// Kind of progress reported by a pipeline stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum ProgressType {
    /// Messages published by the fetcher
    Fetched,
    /// Messages processed by contact extraction
    Extracted,
    /// Contacts confirmed by verification
    VerifiedContacts,
    /// Contacts persisted
    CreatedContacts,
    /// Signatures mined from message bodies
    ExtractedSignatures,
}

/// Cumulative progress of a mining task
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressCounters {
    /// Messages across all mined folders
    pub total: u64,
    /// Messages published by the fetcher
    pub fetched: u64,
    /// Messages processed by contact extraction
    pub extracted: u64,
    /// Contacts confirmed by verification
    pub verified_contacts: u64,
    /// Contacts persisted
    pub created_contacts: u64,
    /// Signatures mined from message bodies
    pub extracted_signatures: u64,
}

impl ProgressCounters {
    /// Fold one progress increment into the counters
    pub fn apply(&mut self, progress_type: ProgressType, count: u64) {
        let counter = match progress_type {
            ProgressType::Fetched => &mut self.fetched,
            ProgressType::Extracted => &mut self.extracted,
            ProgressType::VerifiedContacts => &mut self.verified_contacts,
            ProgressType::CreatedContacts => &mut self.created_contacts,
            ProgressType::ExtractedSignatures => &mut self.extracted_signatures,
        };
        *counter = counter.saturating_add(count);
    }
}

/// Progress increment published by the fetcher and downstream stages on a
/// task's progress channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Task the progress belongs to
    pub mining_id: TaskId,
    /// What was counted
    pub progress_type: ProgressType,
    /// Increment since the previous event of this type
    pub count: u64,
}

/// How a mailbox session authenticates
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// IMAP LOGIN with a password
    Password,
    /// SASL XOAUTH2 with an access token
    OAuth,
}

/// Public identity of the mined mailbox (never carries secrets)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MailboxIdentity {
    /// Account email address
    pub email: String,
    /// IMAP server host
    pub host: String,
    /// IMAP server port
    pub port: u16,
    /// Authentication mechanism
    pub auth_mode: AuthMode,
}

/// Mailbox credentials supplied with a mining request
#[derive(Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "auth", rename_all = "lowercase")]
pub enum MailboxCredentials {
    /// IMAP LOGIN
    Password {
        /// Account email address (also the IMAP user name)
        email: String,
        /// IMAP server host
        host: String,
        /// IMAP server port, as sent by the client
        port: String,
        /// Account password
        password: String,
    },
    /// SASL XOAUTH2; host and port are derived from the email domain
    OAuth {
        /// Account email address
        email: String,
        /// Current access token
        access_token: String,
        /// Refresh token used to rotate the access token before mining
        #[serde(default)]
        refresh_token: Option<String>,
    },
}

impl MailboxCredentials {
    /// Account email address
    pub fn email(&self) -> &str {
        match self {
            MailboxCredentials::Password { email, .. } | MailboxCredentials::OAuth { email, .. } => {
                email
            }
        }
    }
}

impl std::fmt::Debug for MailboxCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailboxCredentials::Password {
                email, host, port, ..
            } => f
                .debug_struct("Password")
                .field("email", email)
                .field("host", host)
                .field("port", port)
                .finish_non_exhaustive(),
            MailboxCredentials::OAuth { email, .. } => f
                .debug_struct("OAuth")
                .field("email", email)
                .finish_non_exhaustive(),
        }
    }
}

/// Options for creating a mining task
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct MiningOptions {
    /// Mailbox to mine
    pub mailbox: MailboxCredentials,
    /// Folders to fetch (excluded folders are skipped even when listed)
    pub folders: Vec<String>,
}

/// Pipeline stage fed by a mining task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Contact extraction from message headers
    Messages,
    /// Signature mining from message bodies
    Signatures,
    /// Email verification of extracted contacts
    EmailsVerification,
}

impl Stage {
    /// Every stage a mining task registers with
    pub const ALL: [Stage; 3] = [Stage::Messages, Stage::Signatures, Stage::EmailsVerification];

    /// Stem used to derive topic and group names
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Messages => "messages",
            Stage::Signatures => "signatures",
            Stage::EmailsVerification => "emails_verification",
        }
    }
}

/// Topic, consumer group and channel names derived from a task id
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TaskTopics {
    /// Topic carrying parsed message headers
    pub messages_topic: String,
    /// Consumer group of the contact extraction stage
    pub messages_group: String,
    /// Topic carrying message bodies for signature mining
    pub signatures_topic: String,
    /// Consumer group of the signature stage
    pub signatures_group: String,
    /// Topic carrying extracted contacts awaiting verification
    pub verification_topic: String,
    /// Consumer group of the verification stage
    pub verification_group: String,
    /// Pub/sub channel carrying [`ProgressEvent`]s
    pub progress_channel: String,
}

impl TaskTopics {
    /// Deterministic names for `id`
    pub fn for_task(id: &TaskId) -> Self {
        Self {
            messages_topic: stage_topic(Stage::Messages, id),
            messages_group: stage_group(Stage::Messages, id),
            signatures_topic: stage_topic(Stage::Signatures, id),
            signatures_group: stage_group(Stage::Signatures, id),
            verification_topic: stage_topic(Stage::EmailsVerification, id),
            verification_group: stage_group(Stage::EmailsVerification, id),
            progress_channel: progress_channel(id),
        }
    }

    /// `(topic, group)` registered for `stage`
    pub fn stage(&self, stage: Stage) -> (&str, &str) {
        match stage {
            Stage::Messages => (&self.messages_topic, &self.messages_group),
            Stage::Signatures => (&self.signatures_topic, &self.signatures_group),
            Stage::EmailsVerification => (&self.verification_topic, &self.verification_group),
        }
    }
}

fn stage_topic(stage: Stage, id: &TaskId) -> String {
    format!("{}_stream-{}", stage.as_str(), id)
}

fn stage_group(stage: Stage, id: &TaskId) -> String {
    format!("{}_consumer_group-{}", stage.as_str(), id)
}

/// Progress channel of task `id`
pub fn progress_channel(id: &TaskId) -> String {
    format!("progress-{id}")
}

/// Snapshot of a mining task
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct MiningTask {
    /// Unique task identifier
    pub id: TaskId,
    /// Owning user
    pub user_id: String,
    /// Mined mailbox
    pub mailbox: MailboxIdentity,
    /// Requested folders
    pub folders: Vec<String>,
    /// Lifecycle state
    pub status: TaskStatus,
    /// Cumulative progress counters
    pub progress: ProgressCounters,
    /// Derived topic names
    pub topics: TaskTopics,
    /// When the task was created
    pub started_at: DateTime<Utc>,
    /// When the task reached a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Reason for a failed run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Event delivered to stream subscribers of a task
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Counters changed
    Progress {
        /// Task ID
        id: TaskId,
        /// What changed
        progress_type: ProgressType,
        /// Increment carried by the originating event
        count: u64,
        /// Counters after applying the increment
        progress: ProgressCounters,
    },

    /// Task reached a terminal state; no further events follow
    Close {
        /// Task ID
        id: TaskId,
        /// Terminal state
        status: TaskStatus,
        /// Final counters
        progress: ProgressCounters,
        /// Failure reason
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl TaskEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Progress { .. } => "progress",
            TaskEvent::Close { .. } => "close",
        }
    }
}
