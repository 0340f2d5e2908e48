pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod evaluator;
pub mod mail;
pub mod models;
pub mod report;
pub mod sheet;

pub use auth::{run_interactive_consent, CredentialProvider, GoogleOAuth, OAuthClient, Session, TokenStore};
pub use config::{Config, DispatchMode};
pub use dispatcher::{DispatchResult, DispatchSettings, Dispatcher, EmailTemplates};
pub use error::{AuthError, InputError, RowError, SendError};
pub use evaluator::{due_records, evaluate, LeadTimes};
pub use mail::{GmailChannel, MailChannel, Notification};
pub use models::*;
pub use report::RunLog;
pub use sheet::Sheet;
