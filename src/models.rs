use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Billing cadence of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Monthly,
    Quarterly,
    HalfYearly,
    Annually,
}

impl Frequency {
    pub const ALL: [Frequency; 4] = [
        Frequency::Monthly,
        Frequency::Quarterly,
        Frequency::HalfYearly,
        Frequency::Annually,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Frequency::Monthly => "Monthly",
            Frequency::Quarterly => "Quarterly",
            Frequency::HalfYearly => "Half-yearly",
            Frequency::Annually => "Annually",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error for a frequency outside the closed set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFrequency(pub String);

impl fmt::Display for UnknownFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown billing frequency '{}'", self.0)
    }
}

impl std::error::Error for UnknownFrequency {}

/// Lowercase with spaces, hyphens and underscores removed
pub fn frequency_key(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, ' ' | '-' | '_'))
        .flat_map(char::to_lowercase)
        .collect()
}

impl FromStr for Frequency {
    type Err = UnknownFrequency;

    /// Only the four canonical names, compared by [`frequency_key`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match frequency_key(s).as_str() {
            "monthly" => Ok(Frequency::Monthly),
            "quarterly" => Ok(Frequency::Quarterly),
            "halfyearly" => Ok(Frequency::HalfYearly),
            "annually" => Ok(Frequency::Annually),
            _ => Err(UnknownFrequency(s.trim().to_string())),
        }
    }
}

/// One subscription row from the uploaded sheet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingRecord {
    /// 1-based spreadsheet row number
    pub row: usize,
    pub domain: String,
    pub period_end: NaiveDate,
    /// Raw frequency text; resolved against the lead-time table at evaluation
    pub frequency: String,
}

/// Where a record stands relative to today
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Alert date is today
    Due { alert_date: NaiveDate },
    /// Alert date is still ahead
    Upcoming { alert_date: NaiveDate },
    /// Alert date has passed but the period has not ended; no alert will fire
    Missed { alert_date: NaiveDate },
    /// Period end is already behind us
    Expired { alert_date: NaiveDate },
    UnknownFrequency,
}

impl Schedule {
    pub fn is_due(&self) -> bool {
        matches!(self, Schedule::Due { .. })
    }
}

/// A record paired with its evaluated schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub record: BillingRecord,
    pub schedule: Schedule,
}

impl Evaluation {
    pub fn is_due(&self) -> bool {
        self.schedule.is_due()
    }
}

/// Outcome shown for one row in the run log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertStatus {
    Sent,
    /// Due, but nothing was sent (check or dry run)
    Due,
    NotDue,
    Missed { alert_date: NaiveDate },
    Skipped { reason: String },
    Invalid { reason: String },
    Failed { reason: String },
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertStatus::Sent => f.write_str("sent"),
            AlertStatus::Due => f.write_str("due"),
            AlertStatus::NotDue => f.write_str("not due"),
            AlertStatus::Missed { alert_date } => {
                write!(f, "not due (alert date {} passed)", alert_date)
            }
            AlertStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
            AlertStatus::Invalid { reason } => write!(f, "invalid: {}", reason),
            AlertStatus::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// One line of the run log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertLogEntry {
    pub row: usize,
    pub domain: String,
    pub end_date: Option<NaiveDate>,
    pub frequency: String,
    pub status: AlertStatus,
    pub message_id: Option<String>,
}
