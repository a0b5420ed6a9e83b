//! Bounded pool of authenticated sessions for one mailbox account
//!
//! The pool is created unconfigured, configured once with password or OAuth
//! credentials, then shared by every fetch job of a mining run. The first
//! [`acquire_connection`](ConnectionPool::acquire_connection) validates the
//! credentials with a throwaway session before any slot exists, so bad
//! credentials fail the caller instead of every job.

use super::oauth::{MailProvider, TokenRefresher, TokenRotation};
use super::{MailConnector, MailSession, SessionAuth, SessionConfig};
use crate::broker::Broker;
use crate::config::PoolConfig;
use crate::error::{Error, FieldError, Result};
use crate::retry::{IsRetryable, with_retry};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct PoolState {
    initialized: bool,
    slots: Option<Arc<Semaphore>>,
    /// Cancelled by `clean_pool`; ends session creation retries
    closing: CancellationToken,
    idle: Vec<Box<dyn MailSession>>,
    /// Bumped by every clean; sessions from an older generation are not reused
    generation: u64,
}

/// Sessions for one account, at most `max_size` at a time
pub struct ConnectionPool {
    connector: Arc<dyn MailConnector>,
    config: PoolConfig,
    email: String,
    session: Option<SessionConfig>,
    state: Mutex<PoolState>,
    acquired: Arc<AtomicUsize>,
}

/// A session checked out of a [`ConnectionPool`].
///
/// Hand it back with [`ConnectionPool::release_connection`] or
/// [`ConnectionPool::discard_connection`]. Dropping it also frees its slot,
/// closing the session without a LOGOUT.
pub struct PooledConnection {
    session: Box<dyn MailSession>,
    generation: u64,
    _permit: OwnedSemaphorePermit,
    _checkout: Checkout,
}

struct Checkout(Arc<AtomicUsize>);

impl Drop for Checkout {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Deref for PooledConnection {
    type Target = dyn MailSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl ConnectionPool {
    /// Unconfigured pool for `email`
    pub fn new(connector: Arc<dyn MailConnector>, config: PoolConfig, email: impl Into<String>) -> Self {
        Self {
            connector,
            config,
            email: email.into(),
            session: None,
            state: Mutex::new(PoolState::default()),
            acquired: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Account email address
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Host and port sessions connect to, once configured
    pub fn endpoint(&self) -> Option<(&str, u16)> {
        self.session
            .as_ref()
            .map(|session| (session.host.as_str(), session.port))
    }

    /// Authenticate with IMAP LOGIN.
    ///
    /// `port` is taken as sent by the client and must be numeric.
    pub fn configure_with_password(&mut self, host: &str, password: &str, port: &str) -> Result<()> {
        let mut errors = Vec::new();
        if host.trim().is_empty() {
            errors.push(FieldError {
                field: "host".into(),
                message: "must not be empty".into(),
            });
        }
        if password.is_empty() {
            errors.push(FieldError {
                field: "password".into(),
                message: "must not be empty".into(),
            });
        }
        let parsed_port = port.trim().parse::<u16>();
        if parsed_port.is_err() {
            errors.push(FieldError {
                field: "port".into(),
                message: format!("'{port}' is not a valid port number"),
            });
        }

        let port = match parsed_port {
            Ok(port) if errors.is_empty() => port,
            _ => return Err(Error::invalid_fields("invalid mailbox settings", errors)),
        };

        self.session = Some(SessionConfig {
            host: host.trim().to_string(),
            port,
            user: self.email.clone(),
            auth: SessionAuth::Password(password.to_string()),
            connect_timeout: self.config.connect_timeout,
        });
        Ok(())
    }

    /// Authenticate with XOAUTH2.
    ///
    /// Host and port come from the provider of the account's domain. With a
    /// refresh token the access token is rotated first and the new one is
    /// published as a [`TokenRotation`] on `notify_channel`.
    pub async fn configure_with_oauth(
        &mut self,
        access_token: &str,
        refresh_token: Option<&str>,
        refresher: &dyn TokenRefresher,
        broker: &dyn Broker,
        notify_channel: &str,
    ) -> Result<()> {
        let provider = MailProvider::from_email(&self.email).ok_or_else(|| {
            Error::invalid_fields(
                "unsupported mail provider",
                vec![FieldError {
                    field: "email".into(),
                    message: format!("no OAuth mail provider known for '{}'", self.email),
                }],
            )
        })?;

        let access_token = match refresh_token.filter(|token| !token.is_empty()) {
            Some(refresh_token) => {
                let refreshed = refresher.refresh(provider, refresh_token).await?;
                let rotation = TokenRotation {
                    email: self.email.clone(),
                    access_token: refreshed.access_token.clone(),
                };
                if let Err(e) = broker
                    .publish(notify_channel, serde_json::to_string(&rotation)?)
                    .await
                {
                    tracing::warn!(email = %self.email, error = %e, "Publishing token rotation failed");
                }
                refreshed.access_token
            }
            None => access_token.to_string(),
        };

        if access_token.is_empty() {
            return Err(Error::invalid_fields(
                "missing OAuth credentials",
                vec![FieldError {
                    field: "access_token".into(),
                    message: "must not be empty".into(),
                }],
            ));
        }

        self.session = Some(SessionConfig {
            host: provider.imap_host().to_string(),
            port: provider.imap_port(),
            user: self.email.clone(),
            auth: SessionAuth::XOAuth2 { access_token },
            connect_timeout: self.config.connect_timeout,
        });
        Ok(())
    }

    fn session_config(&self) -> Result<&SessionConfig> {
        self.session.as_ref().ok_or_else(|| Error::Config {
            message: "connection pool used before being configured".into(),
            key: None,
        })
    }

    /// Check out a session, waiting when `max_size` are already out.
    ///
    /// The first call validates the credentials with a throwaway session;
    /// its error is returned as is and the pool stays uninitialized.
    pub async fn acquire_connection(&self) -> Result<PooledConnection> {
        let session_config = self.session_config()?;

        let (slots, generation, closing) = {
            let mut state = self.state.lock().await;
            if !state.initialized {
                let mut validation = self.connector.connect(session_config).await?;
                if let Err(e) = validation.logout().await {
                    tracing::debug!(email = %self.email, error = %e, "Logout of validation session failed");
                }
                state.initialized = true;
                state.slots = Some(Arc::new(Semaphore::new(self.config.max_size)));
                state.closing = CancellationToken::new();
                tracing::debug!(email = %self.email, max_size = self.config.max_size, "Connection pool initialized");
            }
            let slots = state
                .slots
                .clone()
                .ok_or_else(|| Error::Protocol("connection pool has no slots".into()))?;
            (slots, state.generation, state.closing.clone())
        };

        let permit = slots
            .acquire_owned()
            .await
            .map_err(|_| Error::Protocol("connection pool was closed".into()))?;

        let reusable = {
            let mut state = self.state.lock().await;
            if state.generation == generation {
                state.idle.pop()
            } else {
                None
            }
        };

        let session = match reusable {
            Some(session) => session,
            None => self.create_session(session_config, &closing).await?,
        };

        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection {
            session,
            generation,
            _permit: permit,
            _checkout: Checkout(self.acquired.clone()),
        })
    }

    /// Open a session for a validated pool.
    ///
    /// Transient failures are logged and retried with backoff until a
    /// session opens. Rejected credentials and other permanent errors end
    /// the attempt, as does [`clean_pool`](Self::clean_pool).
    async fn create_session(
        &self,
        session_config: &SessionConfig,
        closing: &CancellationToken,
    ) -> Result<Box<dyn MailSession>> {
        let mut rounds: u32 = 0;
        loop {
            let attempt = tokio::select! {
                _ = closing.cancelled() => None,
                result = with_retry(&self.config.retry, || self.connector.connect(session_config)) => Some(result),
            };
            let error = match attempt {
                None => return Err(Error::Protocol("connection pool was closed".into())),
                Some(Ok(session)) => return Ok(session),
                Some(Err(e)) if !e.is_retryable() => return Err(e),
                Some(Err(e)) => e,
            };

            rounds += 1;
            tracing::warn!(
                email = %self.email,
                rounds,
                error = %error,
                "Could not open pooled session, retrying"
            );
            tokio::select! {
                _ = closing.cancelled() => {
                    return Err(Error::Protocol("connection pool was closed".into()));
                }
                _ = tokio::time::sleep(self.config.retry.max_delay) => {}
            }
        }
    }

    /// Return a session for reuse.
    ///
    /// Sessions checked out before the last [`clean_pool`](Self::clean_pool)
    /// are logged out instead.
    pub async fn release_connection(&self, conn: PooledConnection) {
        let PooledConnection {
            mut session,
            generation,
            _permit,
            _checkout,
        } = conn;

        {
            let mut state = self.state.lock().await;
            if state.initialized && state.generation == generation {
                state.idle.push(session);
                return;
            }
        }

        self.logout_quietly(session.as_mut()).await;
    }

    /// Close a session that failed mid-job and free its slot
    pub async fn discard_connection(&self, conn: PooledConnection) {
        let PooledConnection {
            mut session,
            _permit,
            _checkout,
            ..
        } = conn;
        self.logout_quietly(session.as_mut()).await;
    }

    async fn logout_quietly(&self, session: &mut dyn MailSession) {
        match tokio::time::timeout(self.config.connect_timeout, session.logout()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(email = %self.email, error = %e, "Logout failed"),
            Err(_) => tracing::debug!(email = %self.email, "Logout timed out"),
        }
    }

    /// Close every idle session and reset the pool to uninitialized.
    ///
    /// Waiters blocked on a slot fail. Sessions still checked out are closed
    /// when they come back. Safe to call repeatedly or before first use.
    pub async fn clean_pool(&self) {
        let idle = {
            let mut state = self.state.lock().await;
            if !state.initialized {
                return;
            }
            state.initialized = false;
            state.generation += 1;
            if let Some(slots) = state.slots.take() {
                slots.close();
            }
            state.closing.cancel();
            std::mem::take(&mut state.idle)
        };

        let closed = idle.len();
        for mut session in idle {
            self.logout_quietly(session.as_mut()).await;
        }
        tracing::debug!(email = %self.email, closed, "Connection pool cleaned");
    }

    /// Sessions currently checked out
    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Whether the first acquire has validated the credentials
    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.initialized
    }

    /// Sessions waiting for reuse
    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.idle.len()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::RetryConfig;
    use crate::imap::oauth::RefreshedToken;
    use crate::test_helpers::{FakeConnector, GOOD_PASSWORD};
    use async_trait::async_trait;
    use std::time::Duration;

    fn pool_config(max_size: usize) -> PoolConfig {
        PoolConfig {
            max_size,
            connect_timeout: Duration::from_secs(1),
            retry: RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
                jitter: false,
            },
        }
    }

    fn password_pool(connector: &FakeConnector, password: &str, max_size: usize) -> ConnectionPool {
        let mut pool = ConnectionPool::new(
            Arc::new(connector.clone()),
            pool_config(max_size),
            "me@example.com",
        );
        pool.configure_with_password("imap.example.com", password, "993")
            .unwrap();
        pool
    }

    #[test]
    fn password_settings_are_validated() {
        let mut pool = ConnectionPool::new(
            Arc::new(FakeConnector::new()),
            PoolConfig::default(),
            "me@example.com",
        );

        let err = pool.configure_with_password("", "", "imap").unwrap_err();
        match err {
            Error::Validation { errors, .. } => {
                let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
                assert_eq!(fields, vec!["host", "password", "port"]);
            }
            other => panic!("expected validation error, got {other:?}"),
        }

        pool.configure_with_password("imap.example.com", "pw", " 143 ")
            .unwrap();
        assert_eq!(pool.endpoint(), Some(("imap.example.com", 143)));
    }

    #[tokio::test]
    async fn invalid_credentials_leave_pool_uninitialized() {
        let connector = FakeConnector::new();
        let pool = password_pool(&connector, "wrong", 4);

        let err = pool.acquire_connection().await.err().unwrap();
        assert!(err.is_authentication());
        assert!(!pool.is_initialized().await);
        assert_eq!(pool.idle_count().await, 0);
        assert_eq!(pool.acquired_count(), 0);
        assert_eq!(connector.open_sessions(), 0);
    }

    #[tokio::test]
    async fn release_and_clean_before_init_are_noops() {
        let connector = FakeConnector::new();
        let pool = password_pool(&connector, GOOD_PASSWORD, 4);

        pool.clean_pool().await;
        pool.clean_pool().await;
        assert!(!pool.is_initialized().await);
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn first_acquire_validates_then_reuses_released_sessions() {
        let connector = FakeConnector::new();
        let pool = password_pool(&connector, GOOD_PASSWORD, 4);

        let conn = pool.acquire_connection().await.unwrap();
        // validation + pooled session
        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.open_sessions(), 1);
        assert_eq!(pool.acquired_count(), 1);

        pool.release_connection(conn).await;
        assert_eq!(pool.acquired_count(), 0);
        assert_eq!(pool.idle_count().await, 1);

        let conn = pool.acquire_connection().await.unwrap();
        assert_eq!(connector.connects(), 2, "idle session should be reused");
        pool.release_connection(conn).await;
    }

    #[tokio::test]
    async fn acquire_waits_when_pool_is_exhausted() {
        let connector = FakeConnector::new();
        let pool = Arc::new(password_pool(&connector, GOOD_PASSWORD, 1));

        let first = pool.acquire_connection().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire_connection().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release_connection(first).await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn clean_pool_closes_idle_sessions_and_resets() {
        let connector = FakeConnector::new();
        let pool = password_pool(&connector, GOOD_PASSWORD, 4);

        let a = pool.acquire_connection().await.unwrap();
        let b = pool.acquire_connection().await.unwrap();
        pool.release_connection(a).await;

        pool.clean_pool().await;
        assert!(!pool.is_initialized().await);
        assert_eq!(pool.idle_count().await, 0);
        assert_eq!(connector.open_sessions(), 1, "checked-out session survives");

        // late return after clean is closed, not pooled
        pool.release_connection(b).await;
        assert_eq!(pool.idle_count().await, 0);
        assert_eq!(connector.open_sessions(), 0);
        assert_eq!(pool.acquired_count(), 0);
    }

    #[tokio::test]
    async fn transient_factory_failures_are_retried() {
        let connector = FakeConnector::new();
        let pool = password_pool(&connector, GOOD_PASSWORD, 4);
        let conn = pool.acquire_connection().await.unwrap();

        connector.fail_next_connects(2);
        let second = pool.acquire_connection().await.unwrap();
        assert_eq!(pool.acquired_count(), 2);

        pool.discard_connection(conn).await;
        pool.discard_connection(second).await;
        assert_eq!(pool.acquired_count(), 0);
        assert_eq!(connector.open_sessions(), 0);
    }

    #[tokio::test]
    async fn acquire_outlasts_a_long_connect_outage() {
        let connector = FakeConnector::new();
        let pool = password_pool(&connector, GOOD_PASSWORD, 4);
        let conn = pool.acquire_connection().await.unwrap();

        // several full retry budgets in a row
        connector.fail_next_connects(10);
        let second = tokio::time::timeout(Duration::from_secs(2), pool.acquire_connection())
            .await
            .expect("acquire gave up instead of waiting for the server")
            .unwrap();
        assert_eq!(pool.acquired_count(), 2);

        pool.release_connection(conn).await;
        pool.release_connection(second).await;
        assert_eq!(pool.idle_count().await, 2);
    }

    #[tokio::test]
    async fn clean_pool_ends_a_retrying_acquire() {
        let connector = FakeConnector::new();
        let pool = Arc::new(password_pool(&connector, GOOD_PASSWORD, 4));
        let conn = pool.acquire_connection().await.unwrap();

        connector.fail_next_connects(usize::MAX);
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire_connection().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        pool.clean_pool().await;
        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        pool.discard_connection(conn).await;
        assert_eq!(pool.acquired_count(), 0);
    }

    #[tokio::test]
    async fn rejected_credentials_end_session_retries() {
        let connector = FakeConnector::new();
        let pool = password_pool(&connector, GOOD_PASSWORD, 4);
        let conn = pool.acquire_connection().await.unwrap();

        connector.reject_all_credentials();
        let err = pool.acquire_connection().await.err().unwrap();
        assert!(err.is_authentication());
        assert_eq!(pool.acquired_count(), 1);

        pool.discard_connection(conn).await;
    }

    struct StaticRefresher;

    #[async_trait]
    impl TokenRefresher for StaticRefresher {
        async fn refresh(&self, provider: MailProvider, refresh_token: &str) -> Result<RefreshedToken> {
            assert_eq!(provider, MailProvider::Google);
            assert_eq!(refresh_token, "rt");
            Ok(RefreshedToken {
                access_token: "rotated".into(),
                expires_in: Some(3600),
            })
        }
    }

    #[tokio::test]
    async fn oauth_refresh_publishes_rotation_and_uses_new_token() {
        let connector = FakeConnector::new().with_credential("rotated");
        let broker = MemoryBroker::new();
        let mut rotations = broker.subscribe("tokens-me").await.unwrap();

        let mut pool = ConnectionPool::new(
            Arc::new(connector.clone()),
            pool_config(2),
            "me@gmail.com",
        );
        pool.configure_with_oauth("stale", Some("rt"), &StaticRefresher, &broker, "tokens-me")
            .await
            .unwrap();

        assert_eq!(pool.endpoint(), Some(("imap.gmail.com", 993)));
        let rotation: TokenRotation =
            serde_json::from_str(&rotations.recv().await.unwrap()).unwrap();
        assert_eq!(rotation.email, "me@gmail.com");
        assert_eq!(rotation.access_token, "rotated");

        let conn = pool.acquire_connection().await.unwrap();
        pool.release_connection(conn).await;
    }

    #[tokio::test]
    async fn oauth_with_unknown_domain_is_rejected() {
        let broker = MemoryBroker::new();
        let mut pool = ConnectionPool::new(
            Arc::new(FakeConnector::new()),
            PoolConfig::default(),
            "me@example.org",
        );

        let err = pool
            .configure_with_oauth("token", None, &StaticRefresher, &broker, "n")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(pool.endpoint().is_none());
    }

    #[tokio::test]
    async fn acquire_before_configure_fails() {
        let pool = ConnectionPool::new(
            Arc::new(FakeConnector::new()),
            PoolConfig::default(),
            "me@example.com",
        );
        assert!(matches!(
            pool.acquire_connection().await.err().unwrap(),
            Error::Config { .. }
        ));
    }
}
