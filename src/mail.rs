use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::auth::Session;
use crate::error::SendError;

/// File bundled with a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// A single outgoing email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub html_body: String,
    pub attachment: Option<Attachment>,
}

impl Notification {
    /// Render as an RFC 2822 message.
    ///
    /// Plain HTML bodies go out as a single `text/html` part; a notification
    /// with an attachment becomes `multipart/mixed`.
    pub fn to_mime(&self, boundary: &str) -> String {
        let mut msg = String::new();
        msg.push_str(&format!("From: {}\r\n", self.sender));
        msg.push_str(&format!("To: {}\r\n", self.recipient));
        msg.push_str(&format!("Subject: {}\r\n", encode_header(&self.subject)));
        msg.push_str("MIME-Version: 1.0\r\n");

        let html_part = format!(
            "Content-Type: text/html; charset=\"utf-8\"\r\n\
             Content-Transfer-Encoding: base64\r\n\r\n{}\r\n",
            wrap_base64(self.html_body.as_bytes())
        );

        match &self.attachment {
            None => msg.push_str(&html_part),
            Some(attachment) => {
                msg.push_str(&format!(
                    "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
                    boundary
                ));
                msg.push_str(&format!("--{}\r\n{}", boundary, html_part));
                msg.push_str(&format!(
                    "--{}\r\n\
                     Content-Type: {}; name=\"{}\"\r\n\
                     Content-Disposition: attachment; filename=\"{}\"\r\n\
                     Content-Transfer-Encoding: base64\r\n\r\n{}\r\n",
                    boundary,
                    attachment.content_type,
                    attachment.filename,
                    attachment.filename,
                    wrap_base64(&attachment.content)
                ));
                msg.push_str(&format!("--{}--\r\n", boundary));
            }
        }

        msg
    }
}

/// RFC 2047 encoded-word for non-ASCII header values. Line breaks are
/// flattened so a value can never start a new header.
fn encode_header(value: &str) -> String {
    let value = value.replace(['\r', '\n'], " ");
    if value.is_ascii() {
        value
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value.as_bytes()))
    }
}

/// Base64 body lines are limited to 76 characters
fn wrap_base64(bytes: &[u8]) -> String {
    let encoded = STANDARD.encode(bytes);
    encoded
        .as_bytes()
        .chunks(76)
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect::<Vec<_>>()
        .join("\r\n")
}

/// Anything that can deliver a notification and report its message id
#[async_trait]
pub trait MailChannel: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<String, SendError>;
}

/// Gmail API delivery on behalf of an authorized session
pub struct GmailChannel {
    client: Client,
    api_base: String,
    session: Session,
    timeout: Duration,
}

#[derive(Serialize)]
struct GmailSendRequest {
    raw: String,
}

#[derive(Deserialize)]
struct GmailSendResponse {
    id: String,
}

impl GmailChannel {
    pub fn new(session: Session, api_base: impl Into<String>, timeout: Duration) -> Result<Self, SendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SendError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            session,
            timeout,
        })
    }

    fn request_error(&self, e: reqwest::Error) -> SendError {
        if e.is_timeout() {
            SendError::Timeout(self.timeout)
        } else {
            SendError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl MailChannel for GmailChannel {
    #[instrument(skip(self, notification), fields(subject = %notification.subject))]
    async fn send(&self, notification: &Notification) -> Result<String, SendError> {
        let boundary = format!("billing-alerts-{}", uuid::Uuid::new_v4().simple());
        let raw = URL_SAFE.encode(notification.to_mime(&boundary));

        debug!("Sending Gmail message");

        let response = self
            .client
            .post(format!("{}/gmail/v1/users/me/messages/send", self.api_base))
            .bearer_auth(&self.session.access_token)
            .json(&GmailSendRequest { raw })
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        match status {
            s if s.is_success() => {
                let body: GmailSendResponse = response
                    .json()
                    .await
                    .map_err(|e| match self.request_error(e) {
                        SendError::Transport(reason) => SendError::InvalidResponse(reason),
                        other => other,
                    })?;
                info!(message_id = %body.id, "Gmail message sent");
                Ok(body.id)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(status = %status, "Gmail rejected the session");
                Err(SendError::Unauthorized(status.as_u16()))
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                warn!(status = %status, body = %body, "Gmail send failed");
                Err(SendError::Rejected {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}
