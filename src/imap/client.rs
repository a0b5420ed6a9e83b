//! IMAP over TLS with `async-imap`

use super::{
    FetchParts, MailConnector, MailSession, MailboxInfo, MailboxStatus, RawMessage,
    SessionAuth, SessionConfig,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

type ImapSession = async_imap::Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

/// XOAUTH2 SASL exchange.
///
/// The first challenge gets the bearer token. Servers rejecting it send a
/// second challenge carrying error details, answered with an empty response
/// so the final NO arrives.
struct XOAuth2Authenticator {
    response: String,
    sent: bool,
}

impl async_imap::Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        if self.sent {
            String::new()
        } else {
            self.sent = true;
            self.response.clone()
        }
    }
}

/// [`MailConnector`] speaking IMAP over implicit TLS
#[derive(Clone)]
pub struct ImapConnector {
    tls: Arc<ClientConfig>,
}

impl ImapConnector {
    /// Connector trusting the Mozilla root store
    pub fn new() -> Result<Self> {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
        let tls = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Other(format!("TLS setup failed: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self { tls: Arc::new(tls) })
    }
}

async fn within<T, F>(limit: Duration, what: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| Error::Timeout(format!("{what} after {}s", limit.as_secs())))?
}

/// NO/BAD answers to LOGIN or AUTHENTICATE mean the credentials were rejected
fn auth_error(err: async_imap::error::Error) -> Error {
    use async_imap::error::Error as ImapError;
    match err {
        ImapError::No(msg) | ImapError::Bad(msg) => Error::Authentication(msg),
        other => Error::from(other),
    }
}

#[async_trait]
impl MailConnector for ImapConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn MailSession>> {
        let limit = config.connect_timeout;

        let tcp = within(limit, "TCP connect", async {
            Ok::<_, Error>(TcpStream::connect((config.host.as_str(), config.port)).await?)
        })
        .await?;

        let server_name = ServerName::try_from(config.host.clone())
            .map_err(|e| Error::validation(format!("invalid IMAP host '{}': {e}", config.host)))?;
        let connector = TlsConnector::from(self.tls.clone());
        let tls = within(limit, "TLS handshake", async {
            Ok::<_, Error>(connector.connect(server_name, tcp).await?)
        })
        .await?;

        let mut client = async_imap::Client::new(tls.compat());

        let session = within(limit, "IMAP authentication", async {
            // AUTHENTICATE would otherwise read the greeting as its continuation
            let _greeting = client
                .read_response()
                .await
                .map_err(|e| Error::Protocol(format!("reading server greeting: {e}")))?;

            let session = match &config.auth {
                SessionAuth::Password(password) => client
                    .login(&config.user, password)
                    .await
                    .map_err(|(e, _)| auth_error(e))?,
                SessionAuth::XOAuth2 { access_token } => {
                    let authenticator = XOAuth2Authenticator {
                        response: SessionConfig::xoauth2_response(&config.user, access_token),
                        sent: false,
                    };
                    client
                        .authenticate("XOAUTH2", authenticator)
                        .await
                        .map_err(|(e, _)| auth_error(e))?
                }
            };
            Ok::<_, Error>(session)
        })
        .await?;

        tracing::debug!(host = %config.host, port = config.port, user = %config.user, "IMAP session established");
        Ok(Box::new(ImapMailSession { session }))
    }
}

struct ImapMailSession {
    session: ImapSession,
}

#[async_trait]
impl MailSession for ImapMailSession {
    async fn open_mailbox(&mut self, name: &str, readonly: bool) -> Result<MailboxInfo> {
        let mailbox = if readonly {
            self.session.examine(name).await?
        } else {
            self.session.select(name).await?
        };
        Ok(MailboxInfo {
            name: name.to_string(),
            exists: mailbox.exists,
            uid_validity: mailbox.uid_validity,
        })
    }

    async fn fetch<'a>(
        &'a mut self,
        range: &str,
        parts: FetchParts,
    ) -> Result<BoxStream<'a, Result<RawMessage>>> {
        let stream = self
            .session
            .fetch(range.to_string(), parts.query())
            .await?;
        Ok(stream
            .map(|item| -> Result<RawMessage> {
                let fetch = item?;
                Ok(RawMessage {
                    seq: fetch.message,
                    header: fetch.header().map(<[u8]>::to_vec).unwrap_or_default(),
                    text: fetch.text().map(<[u8]>::to_vec),
                })
            })
            .boxed())
    }

    async fn status(&mut self, name: &str) -> Result<MailboxStatus> {
        let mailbox = self.session.status(name, "(MESSAGES)").await?;
        Ok(MailboxStatus {
            message_count: mailbox.exists,
        })
    }

    async fn close_mailbox(&mut self) -> Result<()> {
        self.session.close().await?;
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        self.session.logout().await?;
        Ok(())
    }
}
