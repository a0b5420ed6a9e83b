//! Shared test helpers: a scripted in-memory mail server.

use crate::config::{Config, RetryConfig};
use crate::error::{Error, Result};
use crate::imap::oauth::RefreshedToken;
use crate::imap::{
    FetchParts, MailConnector, MailProvider, MailSession, MailboxInfo, MailboxStatus, RawMessage,
    SessionAuth, SessionConfig, TokenRefresher,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Poll `check` until it holds, panicking after two seconds
pub(crate) async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

/// Refresher for tests that never rotate tokens
pub(crate) struct NoRefresh;

#[async_trait]
impl TokenRefresher for NoRefresh {
    async fn refresh(&self, _provider: MailProvider, _refresh_token: &str) -> Result<RefreshedToken> {
        Err(Error::Authentication("refresh not available".into()))
    }
}

/// Small, fast configuration for miner-level tests
pub(crate) fn miner_config(wait_for_extraction: bool) -> Config {
    let mut config = Config::default();
    config.mining.wait_for_extraction = wait_for_extraction;
    config.mining.max_parallel_connections = 2;
    config.mining.reap_delay = Duration::from_secs(60);
    config.pool.max_size = 2;
    config.pool.retry = RetryConfig {
        max_attempts: 1,
        max_delay: Duration::from_millis(5),
        jitter: false,
        ..RetryConfig::default()
    };
    config.broker.block = Duration::from_millis(10);
    config
}

/// Credential accepted by [`FakeConnector`] unless overridden
pub(crate) const GOOD_PASSWORD: &str = "correct horse";

/// A message stored on the fake server
#[derive(Clone, Debug)]
pub(crate) struct FakeMessage {
    pub header: String,
    pub text: Option<String>,
}

/// Build a message with a Message-ID header and optional body text
pub(crate) fn message(message_id: &str, from: &str, subject: &str, text: Option<&str>) -> FakeMessage {
    FakeMessage {
        header: format!(
            "Message-ID: <{message_id}>\r\nFrom: {from}\r\nTo: me@example.com\r\nSubject: {subject}\r\nDate: Mon, 7 Oct 2024 10:00:00 +0000\r\n\r\n"
        ),
        text: text.map(str::to_string),
    }
}

/// Build a message without a Message-ID header
pub(crate) fn message_without_id(from: &str, subject: &str) -> FakeMessage {
    FakeMessage {
        header: format!(
            "From: {from}\r\nTo: me@example.com\r\nSubject: {subject}\r\nDate: Mon, 7 Oct 2024 10:00:00 +0000\r\n\r\n"
        ),
        text: None,
    }
}

/// `count` distinct messages `<prefix-1@test>`..
pub(crate) fn numbered(prefix: &str, count: usize) -> Vec<FakeMessage> {
    (1..=count)
        .map(|i| {
            message(
                &format!("{prefix}-{i}@test"),
                &format!("sender{i}@example.com"),
                &format!("message {i}"),
                Some(&format!("Hello\r\n\r\n--\r\nSender {i}\r\nACME Corp")),
            )
        })
        .collect()
}

#[derive(Default)]
struct Shared {
    folders: Mutex<HashMap<String, Vec<FakeMessage>>>,
    credential: Mutex<String>,
    /// Live session objects
    open_sessions: AtomicUsize,
    /// Successful connects, validation session included
    connects: AtomicUsize,
    /// Upcoming connects failing with a transient error
    failing_connects: AtomicUsize,
    failing_status: Mutex<HashSet<String>>,
    failing_ranges: Mutex<HashSet<(String, String)>>,
    auth_failing_ranges: Mutex<HashSet<(String, String)>>,
    fetched_ranges: Mutex<Vec<(String, String)>>,
    message_delay: Mutex<Duration>,
    /// Fetches started but not finished
    fetches_in_flight: AtomicUsize,
    reject_all: AtomicBool,
}

/// In-memory [`MailConnector`] with failure injection
#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    shared: Arc<Shared>,
}

impl FakeConnector {
    pub fn new() -> Self {
        let connector = Self::default();
        *connector.shared.credential.lock().unwrap() = GOOD_PASSWORD.to_string();
        connector
    }

    pub fn with_folder(self, name: &str, messages: Vec<FakeMessage>) -> Self {
        self.shared
            .folders
            .lock()
            .unwrap()
            .insert(name.to_string(), messages);
        self
    }

    pub fn with_credential(self, credential: &str) -> Self {
        *self.shared.credential.lock().unwrap() = credential.to_string();
        self
    }

    /// Delay before each streamed message
    pub fn with_message_delay(self, delay: Duration) -> Self {
        *self.shared.message_delay.lock().unwrap() = delay;
        self
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.shared.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn reject_all_credentials(&self) {
        self.shared.reject_all.store(true, Ordering::SeqCst);
    }

    pub fn fail_status(&self, folder: &str) {
        self.shared
            .failing_status
            .lock()
            .unwrap()
            .insert(folder.to_string());
    }

    pub fn fail_range(&self, folder: &str, range: &str) {
        self.shared
            .failing_ranges
            .lock()
            .unwrap()
            .insert((folder.to_string(), range.to_string()));
    }

    pub fn reject_range_as_auth_failure(&self, folder: &str, range: &str) {
        self.shared
            .auth_failing_ranges
            .lock()
            .unwrap()
            .insert((folder.to_string(), range.to_string()));
    }

    pub fn open_sessions(&self) -> usize {
        self.shared.open_sessions.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn fetches_in_flight(&self) -> usize {
        self.shared.fetches_in_flight.load(Ordering::SeqCst)
    }

    pub fn fetched_ranges(&self) -> Vec<(String, String)> {
        self.shared.fetched_ranges.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailConnector for FakeConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn MailSession>> {
        if self
            .shared
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Protocol("connection reset by peer".into()));
        }

        let presented = match &config.auth {
            SessionAuth::Password(password) => password,
            SessionAuth::XOAuth2 { access_token } => access_token,
        };
        let expected = self.shared.credential.lock().unwrap().clone();
        if self.shared.reject_all.load(Ordering::SeqCst) || *presented != expected {
            return Err(Error::Authentication(
                "[AUTHENTICATIONFAILED] Invalid credentials".into(),
            ));
        }

        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        self.shared.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            shared: self.shared.clone(),
            selected: None,
        }))
    }
}

struct FakeSession {
    shared: Arc<Shared>,
    selected: Option<String>,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.shared.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

struct InFlight(Arc<Shared>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetches_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn parse_range(range: &str, total: usize) -> (usize, usize) {
    let (start, end) = range.split_once(':').unwrap_or((range, range));
    let start: usize = start.parse().unwrap();
    let end = if end == "*" { total } else { end.parse().unwrap() };
    (start, end.min(total))
}

#[async_trait]
impl MailSession for FakeSession {
    async fn open_mailbox(&mut self, name: &str, _readonly: bool) -> Result<MailboxInfo> {
        let folders = self.shared.folders.lock().unwrap();
        let messages = folders
            .get(name)
            .ok_or_else(|| Error::Protocol(format!("NO [NONEXISTENT] {name}")))?;
        self.selected = Some(name.to_string());
        Ok(MailboxInfo {
            name: name.to_string(),
            exists: messages.len() as u32,
            uid_validity: Some(1),
        })
    }

    async fn fetch<'a>(
        &'a mut self,
        range: &str,
        parts: FetchParts,
    ) -> Result<BoxStream<'a, Result<RawMessage>>> {
        let folder = self
            .selected
            .clone()
            .ok_or_else(|| Error::Protocol("BAD no mailbox selected".into()))?;
        let key = (folder.clone(), range.to_string());
        self.shared.fetched_ranges.lock().unwrap().push(key.clone());

        if self.shared.auth_failing_ranges.lock().unwrap().contains(&key) {
            return Err(Error::Authentication("token expired".into()));
        }
        if self.shared.failing_ranges.lock().unwrap().contains(&key) {
            return Err(Error::Protocol(format!("fetch {range} failed")));
        }

        let messages = self
            .shared
            .folders
            .lock()
            .unwrap()
            .get(&folder)
            .cloned()
            .unwrap_or_default();
        let (start, end) = parse_range(range, messages.len());
        let delay = *self.shared.message_delay.lock().unwrap();

        let selected: Vec<RawMessage> = (start..=end)
            .map(|seq| {
                let m = &messages[seq - 1];
                RawMessage {
                    seq: seq as u32,
                    header: m.header.clone().into_bytes(),
                    text: match parts {
                        FetchParts::HeaderAndText => {
                            Some(m.text.clone().unwrap_or_default().into_bytes())
                        }
                        FetchParts::Header => None,
                    },
                }
            })
            .collect();

        self.shared.fetches_in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = Arc::new(InFlight(self.shared.clone()));

        Ok(futures::stream::iter(selected)
            .then(move |raw| {
                let _guard = guard.clone();
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(raw)
                }
            })
            .boxed())
    }

    async fn status(&mut self, name: &str) -> Result<MailboxStatus> {
        if self.shared.failing_status.lock().unwrap().contains(name) {
            return Err(Error::Protocol(format!("STATUS {name} failed")));
        }
        let folders = self.shared.folders.lock().unwrap();
        let messages = folders
            .get(name)
            .ok_or_else(|| Error::Protocol(format!("NO [NONEXISTENT] {name}")))?;
        Ok(MailboxStatus {
            message_count: messages.len() as u32,
        })
    }

    async fn close_mailbox(&mut self) -> Result<()> {
        self.selected = None;
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        Ok(())
    }
}
