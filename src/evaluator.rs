use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{frequency_key, BillingRecord, Evaluation, Frequency, Schedule};

/// Days before the period end at which each frequency alerts.
///
/// Earlier revisions of the alert sheet used 4 days for monthly and 7 for
/// quarterly billing; the defaults follow the latest revision (3 and 6).
/// Both are plausible, so the table is configuration rather than code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadTimes {
    pub monthly: u32,
    pub quarterly: u32,
    pub half_yearly: u32,
    pub annually: u32,
    /// Extra spellings accepted for a frequency, e.g. `yearly: annually`.
    /// Empty by default, so only the four canonical names alert.
    pub aliases: BTreeMap<String, Frequency>,
}

impl Default for LeadTimes {
    fn default() -> Self {
        Self {
            monthly: 3,
            quarterly: 6,
            half_yearly: 15,
            annually: 30,
            aliases: BTreeMap::new(),
        }
    }
}

impl LeadTimes {
    pub fn days(&self, frequency: Frequency) -> u32 {
        match frequency {
            Frequency::Monthly => self.monthly,
            Frequency::Quarterly => self.quarterly,
            Frequency::HalfYearly => self.half_yearly,
            Frequency::Annually => self.annually,
        }
    }

    /// Resolve sheet text to a frequency, consulting configured aliases
    pub fn frequency(&self, raw: &str) -> Option<Frequency> {
        if let Ok(frequency) = raw.parse() {
            return Some(frequency);
        }
        let key = frequency_key(raw);
        let frequency = self
            .aliases
            .iter()
            .find(|(alias, _)| frequency_key(alias) == key)
            .map(|(_, frequency)| *frequency)?;
        debug!(raw = %raw.trim(), frequency = %frequency, "Frequency alias matched");
        Some(frequency)
    }

    /// Alert date for a period end, `None` for unrecognized frequencies
    pub fn alert_date(&self, period_end: NaiveDate, frequency: &str) -> Option<NaiveDate> {
        let frequency = self.frequency(frequency)?;
        let lead = Days::new(u64::from(self.days(frequency)));
        Some(period_end.checked_sub_days(lead).unwrap_or(NaiveDate::MIN))
    }

    /// One-line description, e.g. for the start of a report
    pub fn describe(&self) -> String {
        Frequency::ALL
            .iter()
            .map(|f| format!("{}={}d", f, self.days(*f)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Classify a single record against `today`.
pub fn schedule_for(record: &BillingRecord, today: NaiveDate, lead_times: &LeadTimes) -> Schedule {
    let Some(alert_date) = lead_times.alert_date(record.period_end, &record.frequency) else {
        return Schedule::UnknownFrequency;
    };

    if alert_date == today {
        Schedule::Due { alert_date }
    } else if alert_date > today {
        Schedule::Upcoming { alert_date }
    } else if record.period_end >= today {
        Schedule::Missed { alert_date }
    } else {
        Schedule::Expired { alert_date }
    }
}

/// Evaluate every record against `today`, preserving input order.
///
/// Pure: the same records and date always produce the same result.
pub fn evaluate(records: &[BillingRecord], today: NaiveDate, lead_times: &LeadTimes) -> Vec<Evaluation> {
    records
        .iter()
        .map(|record| {
            let schedule = schedule_for(record, today, lead_times);
            match schedule {
                Schedule::UnknownFrequency => {
                    debug!(row = record.row, domain = %record.domain, frequency = %record.frequency, "Skipping unknown frequency");
                }
                Schedule::Missed { alert_date } => {
                    warn!(
                        row = record.row,
                        domain = %record.domain,
                        alert_date = %alert_date,
                        "Alert date already passed; no alert will fire for this period"
                    );
                }
                _ => {}
            }
            Evaluation {
                record: record.clone(),
                schedule,
            }
        })
        .collect()
}

/// The due subset, in input order
pub fn due_records(evaluations: &[Evaluation]) -> Vec<BillingRecord> {
    evaluations
        .iter()
        .filter(|e| e.is_due())
        .map(|e| e.record.clone())
        .collect()
}
