use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::GmailConfig;
use crate::error::AuthError;

/// Gmail scope needed to send mail and nothing else
pub const GMAIL_SEND_SCOPE: &str = "https://www.googleapis.com/auth/gmail.send";

/// Access tokens this close to expiry are treated as expired
const EXPIRY_MARGIN_SECS: i64 = 60;

/// An authorized, reusable credential for the mail channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl Session {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - now > Duration::seconds(EXPIRY_MARGIN_SECS),
            None => true,
        }
    }
}

/// Expiry `secs` after `now`; out-of-range lifetimes are treated as no expiry
fn expiry_after(now: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(secs).and_then(|lifetime| now.checked_add_signed(lifetime))
}

/// Source of send-capable sessions
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A usable session, refreshing a stale one if possible; `None` when
    /// interactive consent is required.
    async fn valid_session(&self) -> Result<Option<Session>, AuthError>;

    /// URL the operator opens to grant access
    fn authorization_url(&self) -> Result<Url, AuthError>;

    /// Trade a one-time code for a session and persist it
    async fn exchange_code(&self, code: &str) -> Result<Session, AuthError>;
}

/// Present the authorization URL, read the code the operator pastes back,
/// and exchange it for a persisted session.
pub async fn run_interactive_consent<P, R, W>(
    provider: &P,
    input: &mut R,
    output: &mut W,
) -> Result<Session, AuthError>
where
    P: CredentialProvider + ?Sized,
    R: BufRead,
    W: Write,
{
    let url = provider.authorization_url()?;
    let io_error = |e: std::io::Error| AuthError::Store(e.to_string());

    writeln!(output, "Open this URL to authorize sending:\n\n  {}\n", url).map_err(io_error)?;
    write!(output, "Paste the authorization code (or the full redirect URL): ").map_err(io_error)?;
    output.flush().map_err(io_error)?;

    let mut line = String::new();
    input.read_line(&mut line).map_err(io_error)?;

    let code = extract_code(&line).ok_or(AuthError::ConsentPending)?;
    provider.exchange_code(&code).await
}

/// Accept either a bare code or a redirect URL carrying `code=`.
pub fn extract_code(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(url) = Url::parse(input) {
        if matches!(url.scheme(), "http" | "https") {
            return url
                .query_pairs()
                .find(|(key, _)| key == "code")
                .map(|(_, value)| value.into_owned())
                .filter(|code| !code.is_empty());
        }
    }

    Some(input.to_string())
}

/// Session persisted as JSON on disk
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<Option<Session>, AuthError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No stored session");
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|e| AuthError::Store(format!("{}: {}", self.path.display(), e)))?;
        let session = serde_json::from_str(&content)
            .map_err(|e| AuthError::Store(format!("{}: {}", self.path.display(), e)))?;

        Ok(Some(session))
    }

    pub fn save(&self, session: &Session) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| AuthError::Store(format!("{}: {}", parent.display(), e)))?;
        }

        let content = serde_json::to_string_pretty(session)
            .map_err(|e| AuthError::Store(e.to_string()))?;
        fs::write(&self.path, format!("{content}\n"))
            .map_err(|e| AuthError::Store(format!("{}: {}", self.path.display(), e)))?;

        info!(path = %self.path.display(), "Saved session");
        Ok(())
    }
}

/// OAuth client registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_uri: String,
    pub token_uri: String,
}

/// Google's downloadable client file
#[derive(Debug, Deserialize)]
struct CredentialsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

#[derive(Debug, Deserialize)]
struct ClientSecrets {
    client_id: String,
    client_secret: String,
    auth_uri: Option<String>,
    token_uri: Option<String>,
    #[serde(default)]
    redirect_uris: Vec<String>,
}

impl OAuthClient {
    /// Build from config, preferring an explicit secret override (from the
    /// environment) over both the config value and the credentials file.
    pub fn from_config(config: &GmailConfig, secret_override: Option<String>) -> Result<Self, AuthError> {
        let mut client = Self {
            client_id: config.client_id.clone().unwrap_or_default(),
            client_secret: config.client_secret.clone().unwrap_or_default(),
            redirect_uri: config.redirect_uri.clone(),
            auth_uri: config.auth_uri.clone(),
            token_uri: config.token_uri.clone(),
        };

        if let Some(path) = &config.credentials_file {
            let content = fs::read_to_string(path)
                .map_err(|e| AuthError::Credentials(format!("{}: {}", path.display(), e)))?;
            let file: CredentialsFile = serde_json::from_str(&content)
                .map_err(|e| AuthError::Credentials(format!("{}: {}", path.display(), e)))?;
            let secrets = file.installed.or(file.web).ok_or_else(|| {
                AuthError::Credentials(format!(
                    "{}: expected an 'installed' or 'web' client",
                    path.display()
                ))
            })?;

            if client.client_id.is_empty() {
                client.client_id = secrets.client_id;
            }
            if client.client_secret.is_empty() {
                client.client_secret = secrets.client_secret;
            }
            if let Some(auth_uri) = secrets.auth_uri {
                client.auth_uri = auth_uri;
            }
            if let Some(token_uri) = secrets.token_uri {
                client.token_uri = token_uri;
            }
            if let Some(redirect) = secrets.redirect_uris.into_iter().next() {
                client.redirect_uri = redirect;
            }
        }

        if let Some(secret) = secret_override.filter(|s| !s.is_empty()) {
            client.client_secret = secret;
        }

        if client.client_id.is_empty() {
            return Err(AuthError::Credentials(
                "gmail.client_id or gmail.credentials_file must be set".to_string(),
            ));
        }
        if client.client_secret.is_empty() {
            return Err(AuthError::Credentials(
                "no client secret configured (gmail.client_secret or BILLING_ALERTS_CLIENT_SECRET)"
                    .to_string(),
            ));
        }

        Ok(client)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Google OAuth 2.0 installed-app flow backed by a [`TokenStore`]
pub struct GoogleOAuth {
    http: Client,
    client: OAuthClient,
    store: TokenStore,
}

impl GoogleOAuth {
    pub fn new(client: OAuthClient, store: TokenStore) -> Self {
        Self {
            http: Client::new(),
            client,
            store,
        }
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let response = self
            .http
            .post(&self.client.token_uri)
            .form(params)
            .send()
            .await
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {}", err.error, description),
                    None => err.error,
                },
                Err(_) => body,
            };
            return Err(AuthError::Exchange(format!("{} ({})", detail, status)));
        }

        response
            .json()
            .await
            .map_err(|e| AuthError::Exchange(format!("invalid token response: {}", e)))
    }

    fn session_from(&self, token: TokenResponse, previous_refresh: Option<String>) -> Session {
        Session {
            access_token: token.access_token,
            refresh_token: token.refresh_token.or(previous_refresh),
            expires_at: token.expires_in.and_then(|secs| expiry_after(Utc::now(), secs)),
            scope: token.scope,
        }
    }

    #[instrument(skip_all)]
    async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthError> {
        info!("Refreshing expired session");
        let token = self
            .request_token(&[
                ("client_id", self.client.client_id.as_str()),
                ("client_secret", self.client.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .await?;

        let session = self.session_from(token, Some(refresh_token.to_string()));
        self.store.save(&session)?;
        Ok(session)
    }
}

#[async_trait]
impl CredentialProvider for GoogleOAuth {
    async fn valid_session(&self) -> Result<Option<Session>, AuthError> {
        let Some(session) = self.store.load()? else {
            return Ok(None);
        };

        if session.is_valid_at(Utc::now()) {
            return Ok(Some(session));
        }

        let Some(refresh_token) = session.refresh_token.as_deref() else {
            info!("Stored session expired and cannot be refreshed");
            return Ok(None);
        };

        match self.refresh(refresh_token).await {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(error = %e, "Session refresh failed; consent required");
                Ok(None)
            }
        }
    }

    fn authorization_url(&self) -> Result<Url, AuthError> {
        Url::parse_with_params(
            &self.client.auth_uri,
            &[
                ("client_id", self.client.client_id.as_str()),
                ("redirect_uri", self.client.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", GMAIL_SEND_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|e| AuthError::Credentials(format!("invalid auth_uri: {}", e)))
    }

    #[instrument(skip_all)]
    async fn exchange_code(&self, code: &str) -> Result<Session, AuthError> {
        let token = self
            .request_token(&[
                ("code", code),
                ("client_id", self.client.client_id.as_str()),
                ("client_secret", self.client.client_secret.as_str()),
                ("redirect_uri", self.client.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .await?;

        let session = self.session_from(token, None);
        self.store.save(&session)?;
        info!("Authorization complete");
        Ok(session)
    }
}
