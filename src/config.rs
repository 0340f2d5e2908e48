use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::evaluator::LeadTimes;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub lead_times: LeadTimes,
    pub columns: ColumnConfig,
    pub mail: MailConfig,
    pub gmail: GmailConfig,
}

/// Header names of the required sheet columns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub domain: String,
    pub period_end: String,
    pub frequency: String,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            domain: "domain name".to_string(),
            period_end: "Zoho_end period".to_string(),
            frequency: "billing frequency".to_string(),
        }
    }
}

/// How due records are turned into notifications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One email per due record
    #[default]
    PerRecord,
    /// One summary email with the due records attached
    Batched,
}

/// Notification addressing and delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub mode: DispatchMode,
    pub send_timeout_secs: u64,
    pub subject_prefix: String,
    pub summary_subject: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            sender: None,
            recipient: None,
            mode: DispatchMode::PerRecord,
            send_timeout_secs: 30,
            subject_prefix: "Billing Alert".to_string(),
            summary_subject: "Zoho Billing Alerts Summary".to_string(),
        }
    }
}

impl MailConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

/// Gmail API and OAuth client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Google-issued `credentials.json` for an installed or web app
    pub credentials_file: Option<PathBuf>,
    pub token_path: PathBuf,
    pub redirect_uri: String,
    pub auth_uri: String,
    pub token_uri: String,
    pub api_base: String,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            credentials_file: None,
            token_path: PathBuf::from(".billing-alerts/token.json"),
            redirect_uri: "http://localhost".to_string(),
            auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
            api_base: "https://gmail.googleapis.com".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        info!(path = %path.display(), "Loaded configuration");

        Ok(config)
    }

    /// Sender and recipient, required before anything is sent
    pub fn addresses(&self) -> Result<(&str, &str)> {
        let sender = self
            .mail
            .sender
            .as_deref()
            .context("mail.sender is not configured")?;
        let recipient = self
            .mail
            .recipient
            .as_deref()
            .context("mail.recipient is not configured")?;
        Ok((sender, recipient))
    }
}
