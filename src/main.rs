use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use billing_alerts::{
    due_records, evaluate, run_interactive_consent, sheet, AuthError, Config, CredentialProvider,
    DispatchMode, DispatchSettings, Dispatcher, GmailChannel, GoogleOAuth, OAuthClient, RunLog,
    Sheet, TokenStore,
};

#[derive(Parser)]
#[command(name = "billing-alerts")]
#[command(about = "Email reminders for upcoming domain billing dates")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, default_value = ".billing-alerts/config.yml")]
    config: PathBuf,

    /// OAuth client secret, overriding the configured one
    #[arg(long, global = true, env = "BILLING_ALERTS_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize sending through Gmail
    Auth {
        /// One-time authorization code (prompted for if omitted)
        #[arg(long)]
        code: Option<String>,
    },

    /// Show which records are due without sending anything
    Check {
        /// Billing sheet (.xlsx, .xls, .ods or .csv)
        #[arg(long)]
        file: PathBuf,

        /// Evaluate as of this date (YYYY-MM-DD) instead of today
        #[arg(long)]
        today: Option<NaiveDate>,
    },

    /// Send alerts for records due today
    Send {
        /// Billing sheet (.xlsx, .xls, .ods or .csv)
        #[arg(long)]
        file: PathBuf,

        /// Evaluate as of this date (YYYY-MM-DD) instead of today
        #[arg(long)]
        today: Option<NaiveDate>,

        /// Override the configured dispatch mode
        #[arg(long, value_enum)]
        mode: Option<DispatchMode>,

        /// Evaluate and report without sending
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("billing_alerts=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Auth { code } => {
            authorize(&config, cli.client_secret, code).await?;
        }
        Commands::Check { file, today } => {
            check(&config, &file, resolve_today(today))?;
        }
        Commands::Send {
            file,
            today,
            mode,
            dry_run,
        } => {
            send(&config, cli.client_secret, &file, resolve_today(today), mode, dry_run).await?;
        }
    }

    Ok(())
}

fn resolve_today(today: Option<NaiveDate>) -> NaiveDate {
    today.unwrap_or_else(|| chrono::Local::now().date_naive())
}

fn credential_provider(config: &Config, client_secret: Option<String>) -> Result<GoogleOAuth> {
    let client = OAuthClient::from_config(&config.gmail, client_secret)?;
    Ok(GoogleOAuth::new(client, TokenStore::new(&config.gmail.token_path)))
}

async fn authorize(config: &Config, client_secret: Option<String>, code: Option<String>) -> Result<()> {
    let provider = credential_provider(config, client_secret)?;

    if provider.valid_session().await?.is_some() {
        println!("Already authorized; stored session is valid.");
        return Ok(());
    }

    match code {
        Some(code) => {
            let code = billing_alerts::auth::extract_code(&code).ok_or(AuthError::ConsentPending)?;
            provider.exchange_code(&code).await?;
        }
        None => {
            let stdin = std::io::stdin();
            let mut input = stdin.lock();
            let mut output = std::io::stdout();
            run_interactive_consent(&provider, &mut input, &mut output).await?;
        }
    }

    println!("Authorization successful. Run `billing-alerts send` to send alerts.");
    Ok(())
}

fn load_sheet(config: &Config, file: &Path) -> Result<Sheet> {
    sheet::load(file, &config.columns)
        .with_context(|| format!("Failed to read billing sheet: {}", file.display()))
}

fn check(config: &Config, file: &Path, today: NaiveDate) -> Result<()> {
    let sheet = load_sheet(config, file)?;

    println!("Lead times: {}", config.lead_times.describe());
    println!("Evaluating as of {}\n", today);

    let evaluations = evaluate(&sheet.records, today, &config.lead_times);
    let log = RunLog::build(&sheet.errors, &evaluations, None);
    print!("{}", log.render());

    Ok(())
}

async fn send(
    config: &Config,
    client_secret: Option<String>,
    file: &Path,
    today: NaiveDate,
    mode: Option<DispatchMode>,
    dry_run: bool,
) -> Result<()> {
    if dry_run {
        info!("Dry run: nothing will be sent");
        return check(config, file, today);
    }

    let mut settings = DispatchSettings::from_config(config)?;
    if let Some(mode) = mode {
        settings.mode = mode;
    }

    // Authorization comes first; evaluation waits until a session exists
    let provider = credential_provider(config, client_secret)?;
    let session = provider
        .valid_session()
        .await?
        .ok_or(AuthError::NotAuthorized)?;

    let sheet = load_sheet(config, file)?;

    println!("Lead times: {}", config.lead_times.describe());
    println!("Sending alerts due {} ({:?} mode)\n", today, settings.mode);

    let evaluations = evaluate(&sheet.records, today, &config.lead_times);
    let due = due_records(&evaluations);
    info!(records = evaluations.len(), due = due.len(), "Evaluated billing sheet");

    let channel = GmailChannel::new(session, config.gmail.api_base.clone(), settings.send_timeout)?;
    let dispatcher = Dispatcher::new(channel, settings)?;
    let result = dispatcher.dispatch(&due, today).await;

    let log = RunLog::build(&sheet.errors, &evaluations, Some(&result));
    print!("{}", log.render());

    Ok(())
}
