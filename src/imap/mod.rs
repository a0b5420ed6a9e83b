//! Mail protocol client
//!
//! This module is split into:
//! - `mod.rs` - Session traits and the types flowing through them
//! - `client.rs` - [`ImapConnector`], the TLS + `async-imap` implementation
//! - `pool.rs` - [`ConnectionPool`], bounded sessions for one account
//! - `oauth.rs` - Provider resolution and OAuth token rotation

mod client;
pub mod oauth;
pub mod pool;

pub use client::ImapConnector;
pub use oauth::{HttpTokenRefresher, MailProvider, TokenRefresher, TokenRotation};
pub use pool::{ConnectionPool, PooledConnection};

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// How a session authenticates
#[derive(Clone)]
pub enum SessionAuth {
    /// IMAP LOGIN
    Password(String),
    /// SASL XOAUTH2 bearer token
    XOAuth2 {
        /// OAuth access token
        access_token: String,
    },
}

/// Everything needed to open one authenticated session
#[derive(Clone)]
pub struct SessionConfig {
    /// IMAP server host
    pub host: String,
    /// IMAP server port
    pub port: u16,
    /// Login user, the account email address
    pub user: String,
    /// Credential
    pub auth: SessionAuth,
    /// TCP + TLS + authentication deadline
    pub connect_timeout: Duration,
}

impl SessionConfig {
    /// Initial XOAUTH2 client response for `user` and `access_token`
    pub fn xoauth2_response(user: &str, access_token: &str) -> String {
        format!("user={user}\x01auth=Bearer {access_token}\x01\x01")
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth = match self.auth {
            SessionAuth::Password(_) => "password",
            SessionAuth::XOAuth2 { .. } => "xoauth2",
        };
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("auth", &auth)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Message sections requested by [`MailSession::fetch`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchParts {
    /// Header block only
    Header,
    /// Header block and body text
    HeaderAndText,
}

impl FetchParts {
    /// IMAP fetch query. PEEK keeps `\Seen` flags untouched.
    pub fn query(&self) -> &'static str {
        match self {
            FetchParts::Header => "(BODY.PEEK[HEADER])",
            FetchParts::HeaderAndText => "(BODY.PEEK[HEADER] BODY.PEEK[TEXT])",
        }
    }
}

/// One fetched message
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawMessage {
    /// Sequence number within the open mailbox
    pub seq: u32,
    /// Raw RFC 5322 header block
    pub header: Vec<u8>,
    /// Raw body text, when requested
    pub text: Option<Vec<u8>>,
}

/// Result of opening a mailbox
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailboxInfo {
    /// Mailbox name
    pub name: String,
    /// Number of messages
    pub exists: u32,
    /// UIDVALIDITY, when reported
    pub uid_validity: Option<u32>,
}

/// Result of a count-only status query
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    /// Number of messages in the mailbox
    pub message_count: u32,
}

/// An authenticated mail session
#[async_trait]
pub trait MailSession: Send {
    /// Open `name`, read-only when `readonly` is set
    async fn open_mailbox(&mut self, name: &str, readonly: bool) -> Result<MailboxInfo>;

    /// Stream the messages of `range` (`"1:*"`, `"10001:20000"`) in the open mailbox
    async fn fetch<'a>(
        &'a mut self,
        range: &str,
        parts: FetchParts,
    ) -> Result<BoxStream<'a, Result<RawMessage>>>;

    /// Message count of `name` without opening it
    async fn status(&mut self, name: &str) -> Result<MailboxStatus>;

    /// Close the open mailbox
    async fn close_mailbox(&mut self) -> Result<()>;

    /// End the session
    async fn logout(&mut self) -> Result<()>;
}

/// Opens authenticated sessions
#[async_trait]
pub trait MailConnector: Send + Sync {
    /// Connect and authenticate. Rejected credentials are reported as
    /// [`Error::Authentication`](crate::Error::Authentication).
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn MailSession>>;
}
