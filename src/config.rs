//! Configuration types for mailbox-miner

use crate::error::{Error, Result};
use crate::types::Stage;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};
use utoipa::ToSchema;

/// Main configuration for [`MailboxMiner`](crate::MailboxMiner)
///
/// Fields are organized into logical sub-configs:
/// - [`mining`](MiningConfig): chunking, parallelism, progress batching
/// - [`pool`](PoolConfig): IMAP connection pool sizing and retries
/// - [`broker`](BrokerConfig): topic reads and control channels
/// - [`oauth`](OAuthConfig): OAuth client credentials per mail provider
/// - [`api`](ApiConfig): REST API server
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct Config {
    /// Mailbox fetch behaviour
    #[serde(default)]
    pub mining: MiningConfig,

    /// IMAP connection pool settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Message broker settings
    #[serde(default)]
    pub broker: BrokerConfig,

    /// OAuth provider clients used to refresh access tokens
    #[serde(default)]
    pub oauth: OAuthConfig,

    /// REST API server settings
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Reject settings that would make a mining run impossible.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 4] = [
            ("mining.chunk_size", self.mining.chunk_size == 0),
            (
                "mining.max_parallel_connections",
                self.mining.max_parallel_connections == 0,
            ),
            ("mining.progress_batch_size", self.mining.progress_batch_size == 0),
            ("pool.max_size", self.pool.max_size == 0),
        ];

        for (key, is_zero) in checks {
            if is_zero {
                return Err(Error::Config {
                    message: format!("{key} must be greater than zero"),
                    key: Some(key.to_string()),
                });
            }
        }
        Ok(())
    }
}

/// Mailbox fetch behaviour
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct MiningConfig {
    /// Maximum sequence-number span per fetch job (default: 10000)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,

    /// Fetch jobs running at the same time per task (default: 10)
    #[serde(default = "default_max_parallel_connections")]
    pub max_parallel_connections: usize,

    /// Accepted messages between two progress flushes (default: 50)
    #[serde(default = "default_progress_batch_size")]
    pub progress_batch_size: u64,

    /// Fetch message bodies for signature mining (default: true)
    #[serde(default = "default_true")]
    pub fetch_body: bool,

    /// Folders never fetched (spam, trash, drafts, provider meta folders)
    #[serde(default = "default_excluded_folders")]
    pub excluded_folders: Vec<String>,

    /// Maximum characters of body text published to the signature topic (default: 2000)
    #[serde(default = "default_signature_max_length")]
    pub signature_max_length: usize,

    /// Only complete a task once extraction has caught up with fetching (default: true)
    #[serde(default = "default_true")]
    pub wait_for_extraction: bool,

    /// How long a finished task stays queryable before it is reaped (default: 30 seconds)
    #[serde(default = "default_reap_delay", with = "duration_serde")]
    #[schema(value_type = u64)]
    pub reap_delay: Duration,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_parallel_connections: default_max_parallel_connections(),
            progress_batch_size: default_progress_batch_size(),
            fetch_body: true,
            excluded_folders: default_excluded_folders(),
            signature_max_length: default_signature_max_length(),
            wait_for_extraction: true,
            reap_delay: default_reap_delay(),
        }
    }
}

/// IMAP connection pool settings
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct PoolConfig {
    /// Maximum sessions per account (default: 10)
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,

    /// TCP + TLS + authentication deadline (default: 10 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    #[schema(value_type = u64)]
    pub connect_timeout: Duration,

    /// Backoff applied when a post-validation connection attempt fails
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
            connect_timeout: default_connect_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 500 ms)
    #[serde(default = "default_initial_delay", with = "millis_serde")]
    #[schema(value_type = u64)]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 10 seconds)
    #[serde(default = "default_max_delay", with = "millis_serde")]
    #[schema(value_type = u64)]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Message broker settings
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct BrokerConfig {
    /// Entries read per topic per poll (default: 200)
    #[serde(default = "default_read_count")]
    pub read_count: usize,

    /// Longest a read waits for new entries (default: 2000 ms)
    #[serde(default = "default_block", with = "millis_serde")]
    #[schema(value_type = u64)]
    pub block: Duration,

    /// Control channel of the contact extraction stage
    #[serde(default = "default_contacts_control_channel")]
    pub contacts_control_channel: String,

    /// Control channel of the signature mining stage
    #[serde(default = "default_signatures_control_channel")]
    pub signatures_control_channel: String,

    /// Control channel of the email verification stage
    #[serde(default = "default_verification_control_channel")]
    pub verification_control_channel: String,
}

impl BrokerConfig {
    /// Control channel of the workers serving `stage`
    pub fn control_channel(&self, stage: Stage) -> &str {
        match stage {
            Stage::Messages => &self.contacts_control_channel,
            Stage::Signatures => &self.signatures_control_channel,
            Stage::EmailsVerification => &self.verification_control_channel,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            read_count: default_read_count(),
            block: default_block(),
            contacts_control_channel: default_contacts_control_channel(),
            signatures_control_channel: default_signatures_control_channel(),
            verification_control_channel: default_verification_control_channel(),
        }
    }
}

/// OAuth client credentials per mail provider
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct OAuthConfig {
    /// Google (Gmail) client
    #[serde(default)]
    pub google: Option<OAuthClientConfig>,

    /// Microsoft (Outlook / Office 365) client
    #[serde(default)]
    pub azure: Option<OAuthClientConfig>,
}

/// A registered OAuth application
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct OAuthClientConfig {
    /// OAuth client id
    pub client_id: String,

    /// OAuth client secret
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Override of the provider's token endpoint (tests, proxies)
    #[serde(default)]
    pub token_url: Option<String>,
}

/// REST API configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiConfig {
    /// Address to bind to (default: 127.0.0.1:8081)
    #[serde(default = "default_bind_address")]
    #[schema(value_type = String)]
    pub bind_address: SocketAddr,

    /// Optional API key for authentication
    #[serde(default)]
    pub api_key: Option<String>,

    /// Enable CORS for browser access (default: true)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins (default: ["*"])
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Enable Swagger UI at /swagger-ui (default: true)
    #[serde(default = "default_true")]
    pub swagger_ui: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            api_key: None,
            cors_enabled: true,
            cors_origins: default_cors_origins(),
            swagger_ui: true,
        }
    }
}

fn default_chunk_size() -> u32 {
    10_000
}

fn default_max_parallel_connections() -> usize {
    10
}

fn default_progress_batch_size() -> u64 {
    50
}

fn default_true() -> bool {
    true
}

fn default_excluded_folders() -> Vec<String> {
    [
        "[Gmail]",
        "[Gmail]/All Mail",
        "[Gmail]/Spam",
        "[Gmail]/Trash",
        "[Gmail]/Drafts",
        "[Gmail]/Bin",
        "Spam",
        "Junk",
        "Trash",
        "Drafts",
        "Deleted Items",
        "Junk Email",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_signature_max_length() -> usize {
    2000
}

fn default_reap_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_pool_max_size() -> usize {
    10
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_read_count() -> usize {
    200
}

fn default_block() -> Duration {
    Duration::from_millis(2000)
}

fn default_contacts_control_channel() -> String {
    "messages-stream-management".to_string()
}

fn default_signatures_control_channel() -> String {
    "signatures-stream-management".to_string()
}

fn default_verification_control_channel() -> String {
    "verification-stream-management".to_string()
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
