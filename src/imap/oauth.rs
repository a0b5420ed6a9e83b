//! Mail provider resolution and OAuth token rotation

use crate::config::{OAuthClientConfig, OAuthConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const MICROSOFT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

const GOOGLE_DOMAINS: &[&str] = &["gmail.com", "googlemail.com"];
const MICROSOFT_DOMAINS: &[&str] = &[
    "outlook.com",
    "outlook.fr",
    "outlook.de",
    "hotmail.com",
    "hotmail.fr",
    "hotmail.co.uk",
    "live.com",
    "live.fr",
    "msn.com",
];

/// OAuth-capable mail provider
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailProvider {
    /// Gmail / Google Workspace
    Google,
    /// Outlook.com / Office 365
    Microsoft,
}

impl MailProvider {
    /// Provider hosting `email`, judged by its domain
    pub fn from_email(email: &str) -> Option<Self> {
        let (_, domain) = email.rsplit_once('@')?;
        let domain = domain.trim().to_ascii_lowercase();
        if GOOGLE_DOMAINS.contains(&domain.as_str()) {
            Some(MailProvider::Google)
        } else if MICROSOFT_DOMAINS.contains(&domain.as_str()) {
            Some(MailProvider::Microsoft)
        } else {
            None
        }
    }

    /// IMAP server host
    pub fn imap_host(&self) -> &'static str {
        match self {
            MailProvider::Google => "imap.gmail.com",
            MailProvider::Microsoft => "outlook.office365.com",
        }
    }

    /// IMAP server port (implicit TLS)
    pub fn imap_port(&self) -> u16 {
        993
    }

    /// Default OAuth token endpoint
    pub fn token_url(&self) -> &'static str {
        match self {
            MailProvider::Google => GOOGLE_TOKEN_URL,
            MailProvider::Microsoft => MICROSOFT_TOKEN_URL,
        }
    }

    fn client<'a>(&self, config: &'a OAuthConfig) -> Option<&'a OAuthClientConfig> {
        match self {
            MailProvider::Google => config.google.as_ref(),
            MailProvider::Microsoft => config.azure.as_ref(),
        }
    }
}

/// Token pair returned by a refresh
#[derive(Clone, Debug, Deserialize)]
pub struct RefreshedToken {
    /// New access token
    pub access_token: String,
    /// Lifetime in seconds, when the provider reports it
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Published on the account's notify channel after a refresh so other
/// holders of the account pick up the rotated token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRotation {
    /// Account email address
    pub email: String,
    /// Rotated access token
    pub access_token: String,
}

/// Exchanges refresh tokens for access tokens
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Obtain a fresh access token for `provider`
    async fn refresh(&self, provider: MailProvider, refresh_token: &str) -> Result<RefreshedToken>;
}

/// [`TokenRefresher`] posting a `refresh_token` grant to the provider
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    config: OAuthConfig,
}

impl HttpTokenRefresher {
    /// Refresher using the registered clients in `config`
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, provider: MailProvider, refresh_token: &str) -> Result<RefreshedToken> {
        let client = provider.client(&self.config).ok_or_else(|| Error::Config {
            message: format!("no OAuth client configured for {provider:?}"),
            key: Some(match provider {
                MailProvider::Google => "oauth.google".to_string(),
                MailProvider::Microsoft => "oauth.azure".to_string(),
            }),
        })?;
        let url = client
            .token_url
            .as_deref()
            .unwrap_or_else(|| provider.token_url());

        let mut params = vec![
            ("client_id", client.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        if let Some(secret) = &client.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        let response = self.client.post(url).form(&params).send().await?;
        let status = response.status();

        if !status.is_success() {
            let reason = match response.json::<TokenErrorResponse>().await {
                Ok(body) => match body.error_description {
                    Some(description) => format!("{}: {}", body.error, description),
                    None => body.error,
                },
                Err(_) => status.to_string(),
            };
            tracing::warn!(?provider, %status, reason = %reason, "OAuth token refresh rejected");
            return Err(Error::Authentication(format!(
                "token refresh rejected: {reason}"
            )));
        }

        let token: RefreshedToken = response.json().await?;
        tracing::debug!(?provider, expires_in = ?token.expires_in, "OAuth token refreshed");
        Ok(token)
    }
}
