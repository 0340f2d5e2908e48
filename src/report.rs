use std::collections::HashMap;
use std::fmt::Write as _;

use comfy_table::{Cell, Table};

use crate::dispatcher::DispatchResult;
use crate::error::{RowError, SendError};
use crate::models::{AlertLogEntry, AlertStatus, Evaluation, Schedule};

/// Everything that happened to each row during one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLog {
    pub entries: Vec<AlertLogEntry>,
    /// Dispatch ran and found nothing due
    pub nothing_due: bool,
}

/// Status counts for the closing summary line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub sent: usize,
    pub due: usize,
    pub not_due: usize,
    pub failed: usize,
    pub skipped: usize,
    pub invalid: usize,
}

impl RunLog {
    /// Combine row errors, evaluations and (when sending) the dispatch
    /// result, ordered by spreadsheet row.
    pub fn build(errors: &[RowError], evaluations: &[Evaluation], dispatch: Option<&DispatchResult>) -> Self {
        let outcomes: HashMap<usize, Result<String, SendError>> = dispatch
            .map(|d| {
                d.deliveries()
                    .into_iter()
                    .map(|delivery| (delivery.record.row, delivery.outcome))
                    .collect()
            })
            .unwrap_or_default();

        let mut entries: Vec<AlertLogEntry> = evaluations
            .iter()
            .map(|evaluation| {
                let record = &evaluation.record;
                let mut message_id = None;

                let status = match evaluation.schedule {
                    Schedule::Due { .. } => match outcomes.get(&record.row) {
                        Some(Ok(id)) => {
                            message_id = Some(id.clone());
                            AlertStatus::Sent
                        }
                        Some(Err(e)) => AlertStatus::Failed {
                            reason: e.to_string(),
                        },
                        None => AlertStatus::Due,
                    },
                    Schedule::Upcoming { .. } | Schedule::Expired { .. } => AlertStatus::NotDue,
                    Schedule::Missed { alert_date } => AlertStatus::Missed { alert_date },
                    Schedule::UnknownFrequency => AlertStatus::Skipped {
                        reason: "unknown frequency".to_string(),
                    },
                };

                AlertLogEntry {
                    row: record.row,
                    domain: record.domain.clone(),
                    end_date: Some(record.period_end),
                    frequency: record.frequency.clone(),
                    status,
                    message_id,
                }
            })
            .collect();

        entries.extend(errors.iter().map(|e| AlertLogEntry {
            row: e.row,
            domain: e.domain.clone().unwrap_or_default(),
            end_date: None,
            frequency: String::new(),
            status: AlertStatus::Invalid {
                reason: e.reason.clone(),
            },
            message_id: None,
        }));

        entries.sort_by_key(|entry| entry.row);

        Self {
            entries,
            nothing_due: matches!(dispatch, Some(DispatchResult::NothingDue)),
        }
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary {
            total: self.entries.len(),
            ..Default::default()
        };
        for entry in &self.entries {
            match entry.status {
                AlertStatus::Sent => summary.sent += 1,
                AlertStatus::Due => summary.due += 1,
                AlertStatus::NotDue | AlertStatus::Missed { .. } => summary.not_due += 1,
                AlertStatus::Failed { .. } => summary.failed += 1,
                AlertStatus::Skipped { .. } => summary.skipped += 1,
                AlertStatus::Invalid { .. } => summary.invalid += 1,
            }
        }
        summary
    }

    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table.set_header(vec!["Row", "Domain", "End Date", "Frequency", "Status", "Message ID"]);
        for entry in &self.entries {
            table.add_row(vec![
                Cell::new(entry.row),
                Cell::new(&entry.domain),
                Cell::new(entry.end_date.map(|d| d.to_string()).unwrap_or_default()),
                Cell::new(&entry.frequency),
                Cell::new(entry.status.to_string()),
                Cell::new(entry.message_id.as_deref().unwrap_or_default()),
            ]);
        }
        table
    }

    /// Table plus summary, ready to print
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.entries.is_empty() {
            let _ = writeln!(out, "{}", self.table());
        }
        if self.nothing_due {
            out.push_str("No alerts due today.\n");
        }
        out.push_str(&self.summary().to_string());
        out.push('\n');
        out
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} records: {} sent, {} due, {} not due, {} failed, {} skipped, {} invalid",
            self.total, self.sent, self.due, self.not_due, self.failed, self.skipped, self.invalid
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Delivery;
    use crate::evaluator::{evaluate, LeadTimes};
    use crate::models::BillingRecord;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(row: usize, domain: &str, period_end: NaiveDate, frequency: &str) -> BillingRecord {
        BillingRecord {
            row,
            domain: domain.to_string(),
            period_end,
            frequency: frequency.to_string(),
        }
    }

    fn fixture() -> (Vec<RowError>, Vec<Evaluation>) {
        let records = vec![
            record(2, "due.com", date(2024, 4, 15), "Monthly"),
            record(3, "later.com", date(2024, 9, 1), "Annually"),
            record(5, "weekly.com", date(2024, 4, 15), "Weekly"),
            record(6, "missed.com", date(2024, 4, 14), "Monthly"),
            record(7, "failed.com", date(2024, 4, 18), "Quarterly"),
        ];
        let errors = vec![RowError {
            row: 4,
            domain: Some("broken.com".to_string()),
            reason: "unparseable end date 'soon'".to_string(),
        }];
        (errors, evaluate(&records, date(2024, 4, 12), &LeadTimes::default()))
    }

    #[test]
    fn test_check_run_log() {
        let (errors, evaluations) = fixture();
        let log = RunLog::build(&errors, &evaluations, None);

        let rows: Vec<usize> = log.entries.iter().map(|e| e.row).collect();
        assert_eq!(rows, vec![2, 3, 4, 5, 6, 7]);

        assert_eq!(log.entries[0].status, AlertStatus::Due);
        assert_eq!(log.entries[1].status, AlertStatus::NotDue);
        assert!(matches!(log.entries[2].status, AlertStatus::Invalid { .. }));
        assert_eq!(log.entries[2].domain, "broken.com");
        assert_eq!(log.entries[3].status.to_string(), "skipped: unknown frequency");
        assert_eq!(
            log.entries[4].status,
            AlertStatus::Missed {
                alert_date: date(2024, 4, 11)
            }
        );
        assert!(!log.nothing_due);

        let summary = log.summary();
        assert_eq!(summary.total, 6);
        assert_eq!(summary.due, 2);
        assert_eq!(summary.not_due, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.invalid, 1);
    }

    #[test]
    fn test_send_run_log() {
        let (errors, evaluations) = fixture();
        let dispatch = DispatchResult::PerRecord(vec![
            Delivery {
                record: evaluations[0].record.clone(),
                outcome: Ok("18f2a".to_string()),
            },
            Delivery {
                record: evaluations[4].record.clone(),
                outcome: Err(SendError::Unauthorized(401)),
            },
        ]);

        let log = RunLog::build(&errors, &evaluations, Some(&dispatch));

        assert_eq!(log.entries[0].status, AlertStatus::Sent);
        assert_eq!(log.entries[0].message_id.as_deref(), Some("18f2a"));
        assert!(matches!(log.entries[5].status, AlertStatus::Failed { .. }));
        assert_eq!(log.entries[5].message_id, None);

        let summary = log.summary();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(
            summary.to_string(),
            "6 records: 1 sent, 0 due, 2 not due, 1 failed, 1 skipped, 1 invalid"
        );

        let rendered = log.render();
        assert!(rendered.contains("due.com"));
        assert!(rendered.contains("18f2a"));
        assert!(rendered.contains("Message ID"));
    }

    #[test]
    fn test_nothing_due() {
        let log = RunLog::build(&[], &[], Some(&DispatchResult::NothingDue));
        assert!(log.nothing_due);
        assert_eq!(
            log.render(),
            "No alerts due today.\n0 records: 0 sent, 0 due, 0 not due, 0 failed, 0 skipped, 0 invalid\n"
        );
    }
}
