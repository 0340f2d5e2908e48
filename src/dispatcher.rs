use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use handlebars::{Handlebars, TemplateError};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{Config, DispatchMode};
use crate::error::SendError;
use crate::mail::{Attachment, MailChannel, Notification};
use crate::models::BillingRecord;
use crate::sheet;

/// Addressing and shape of outgoing notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    pub sender: String,
    pub recipient: String,
    pub mode: DispatchMode,
    pub send_timeout: Duration,
    pub subject_prefix: String,
    pub summary_subject: String,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let (sender, recipient) = config.addresses()?;
        Ok(Self {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            mode: config.mail.mode,
            send_timeout: config.mail.send_timeout(),
            subject_prefix: config.mail.subject_prefix.clone(),
            summary_subject: config.mail.summary_subject.clone(),
        })
    }
}

/// Outcome of delivering one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub record: BillingRecord,
    pub outcome: Result<String, SendError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    /// Nothing was due, so nothing was sent
    NothingDue,
    PerRecord(Vec<Delivery>),
    /// One summary email covering every due record
    Batched {
        records: Vec<BillingRecord>,
        outcome: Result<String, SendError>,
    },
}

impl DispatchResult {
    /// Per-record view; batched records share the summary email's outcome
    pub fn deliveries(&self) -> Vec<Delivery> {
        match self {
            DispatchResult::NothingDue => Vec::new(),
            DispatchResult::PerRecord(deliveries) => deliveries.clone(),
            DispatchResult::Batched { records, outcome } => records
                .iter()
                .map(|record| Delivery {
                    record: record.clone(),
                    outcome: outcome.clone(),
                })
                .collect(),
        }
    }

    /// Number of emails accepted by the channel
    pub fn sent(&self) -> usize {
        match self {
            DispatchResult::NothingDue => 0,
            DispatchResult::PerRecord(deliveries) => {
                deliveries.iter().filter(|d| d.outcome.is_ok()).count()
            }
            DispatchResult::Batched { outcome, .. } => usize::from(outcome.is_ok()),
        }
    }
}

/// Turns due records into notifications and hands them to a channel
pub struct Dispatcher<C: MailChannel> {
    channel: C,
    settings: DispatchSettings,
    templates: EmailTemplates,
}

impl<C: MailChannel> Dispatcher<C> {
    pub fn new(channel: C, settings: DispatchSettings) -> Result<Self, TemplateError> {
        Ok(Self {
            channel,
            settings,
            templates: EmailTemplates::new()?,
        })
    }

    /// Send notifications for `due` in the configured mode.
    ///
    /// Per-record failures are recorded and never stop the remaining sends.
    pub async fn dispatch(&self, due: &[BillingRecord], today: NaiveDate) -> DispatchResult {
        if due.is_empty() {
            info!("No alerts due today");
            return DispatchResult::NothingDue;
        }

        match self.settings.mode {
            DispatchMode::PerRecord => {
                let mut deliveries = Vec::with_capacity(due.len());
                for record in due {
                    let outcome = match self.templates.record(record, &self.settings) {
                        Ok(notification) => self.send(&notification).await,
                        Err(e) => Err(e),
                    };
                    match &outcome {
                        Ok(id) => info!(domain = %record.domain, message_id = %id, "Alert sent"),
                        Err(e) => warn!(domain = %record.domain, error = %e, "Alert failed"),
                    }
                    deliveries.push(Delivery {
                        record: record.clone(),
                        outcome,
                    });
                }
                DispatchResult::PerRecord(deliveries)
            }
            DispatchMode::Batched => {
                let outcome = match self.templates.summary(due, today, &self.settings) {
                    Ok(notification) => self.send(&notification).await,
                    Err(e) => Err(e),
                };
                match &outcome {
                    Ok(id) => info!(count = due.len(), message_id = %id, "Summary sent"),
                    Err(e) => warn!(count = due.len(), error = %e, "Summary failed"),
                }
                DispatchResult::Batched {
                    records: due.to_vec(),
                    outcome,
                }
            }
        }
    }

    async fn send(&self, notification: &Notification) -> Result<String, SendError> {
        let timeout = self.settings.send_timeout;
        match tokio::time::timeout(timeout, self.channel.send(notification)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SendError::Timeout(timeout)),
        }
    }
}

const ALERT_TEMPLATE: &str = "alert_email";
const SUMMARY_TEMPLATE: &str = "summary_email";

/// HTML bodies for outgoing notifications; values are HTML-escaped on render
pub struct EmailTemplates {
    registry: Handlebars<'static>,
}

impl EmailTemplates {
    pub fn new() -> Result<Self, TemplateError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_template_string(ALERT_TEMPLATE, include_str!("../templates/alert_email.hbs"))?;
        registry.register_template_string(SUMMARY_TEMPLATE, include_str!("../templates/summary_email.hbs"))?;
        Ok(Self { registry })
    }

    /// Reminder for a single due record
    pub fn record(&self, record: &BillingRecord, settings: &DispatchSettings) -> Result<Notification, SendError> {
        let html_body = self
            .registry
            .render(ALERT_TEMPLATE, &record_context(record))
            .map_err(|e| SendError::Template(e.to_string()))?;

        Ok(Notification {
            sender: settings.sender.clone(),
            recipient: settings.recipient.clone(),
            subject: format!("{}: {}", settings.subject_prefix, record.domain),
            html_body,
            attachment: None,
        })
    }

    /// One email listing every due record, with the same rows attached as a workbook
    pub fn summary(
        &self,
        due: &[BillingRecord],
        today: NaiveDate,
        settings: &DispatchSettings,
    ) -> Result<Notification, SendError> {
        let content = sheet::write_xlsx(due).map_err(|e| SendError::Attachment(e.to_string()))?;
        let date = today.format("%Y-%m-%d").to_string();

        let context = json!({
            "count": due.len(),
            "single": due.len() == 1,
            "date": date,
            "records": due.iter().map(record_context).collect::<Vec<_>>(),
        });
        let html_body = self
            .registry
            .render(SUMMARY_TEMPLATE, &context)
            .map_err(|e| SendError::Template(e.to_string()))?;

        Ok(Notification {
            sender: settings.sender.clone(),
            recipient: settings.recipient.clone(),
            subject: settings.summary_subject.clone(),
            html_body,
            attachment: Some(Attachment {
                filename: format!("billing_alerts_{}.xlsx", date),
                content_type: XLSX_CONTENT_TYPE.to_string(),
                content,
            }),
        })
    }
}

const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

fn record_context(record: &BillingRecord) -> serde_json::Value {
    json!({
        "domain": record.domain,
        "end_date": record.period_end.format("%Y-%m-%d").to_string(),
        "frequency": record.frequency,
    })
}
