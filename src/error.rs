use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Whole-file input failures; evaluation cannot start.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("Failed to open {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Unsupported file format: {0} (expected .xlsx, .xlsm, .xls, .ods or .csv)")]
    UnsupportedFormat(String),

    #[error("Sheet {path} has no header row")]
    Empty { path: PathBuf },

    #[error("Missing required column '{column}' (found: {found})")]
    MissingColumn { column: String, found: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// A single spreadsheet row that could not become a billing record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("row {row}: {reason}")]
pub struct RowError {
    /// 1-based row number as shown by a spreadsheet application.
    pub row: usize,
    pub domain: Option<String>,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Gmail is not authorized. Run `billing-alerts auth` to grant access")]
    NotAuthorized,

    #[error("Authorization pending: open the URL above and paste the code it returns")]
    ConsentPending,

    #[error("Token exchange failed: {0}")]
    Exchange(String),

    #[error("OAuth client credentials unavailable: {0}")]
    Credentials(String),

    #[error("Session store error: {0}")]
    Store(String),
}

/// Failure delivering one notification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("mail channel rejected the session credentials ({0})")]
    Unauthorized(u16),

    #[error("mail channel returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("invalid response from mail channel: {0}")]
    InvalidResponse(String),

    #[error("could not build attachment: {0}")]
    Attachment(String),

    #[error("could not render email body: {0}")]
    Template(String),
}
