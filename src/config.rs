//! Process configuration read from environment variables.

use crate::google_auth::GoogleCredentials;
use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DAILY_LIMIT: u32 = 500;
pub const DEFAULT_SEND_INTERVAL_SECS: u64 = 3;
pub const DEFAULT_QUOTA_STATE_PATH: &str = ".coldmail-quota.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailerBackend {
    Gmail,
    Ses,
}

impl FromStr for MailerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gmail" => Ok(Self::Gmail),
            "ses" => Ok(Self::Ses),
            other => bail!("Unknown mailer backend: {} (expected gmail or ses)", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryBackend {
    Sheets,
    DynamoDb,
}

impl FromStr for HistoryBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sheets" => Ok(Self::Sheets),
            "dynamodb" => Ok(Self::DynamoDb),
            other => bail!("Unknown history backend: {} (expected sheets or dynamodb)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mailer_backend: MailerBackend,
    pub history_backend: HistoryBackend,
    pub google: Option<GoogleCredentials>,
    pub sender_email: String,
    pub sender_name: Option<String>,
    pub reply_to: Option<String>,
    pub spreadsheet_id: Option<String>,
    pub dynamodb_table: Option<String>,
    pub ses_configuration_set: Option<String>,
    pub daily_limit: u32,
    pub send_interval: Duration,
    pub quota_state_path: PathBuf,
    pub use_signature: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| {
            get(key).with_context(|| format!("{} environment variable must be set", key))
        };

        let mailer_backend: MailerBackend = get("MAILER_BACKEND")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(MailerBackend::Gmail);
        let history_backend: HistoryBackend = get("HISTORY_BACKEND")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(HistoryBackend::Sheets);

        let needs_google =
            mailer_backend == MailerBackend::Gmail || history_backend == HistoryBackend::Sheets;
        let google = if needs_google {
            Some(GoogleCredentials {
                client_id: require("GOOGLE_CLIENT_ID")?,
                client_secret: require("GOOGLE_CLIENT_SECRET")?,
                refresh_token: require("GOOGLE_REFRESH_TOKEN")?,
            })
        } else {
            None
        };

        let dynamodb_table = match history_backend {
            HistoryBackend::DynamoDb => Some(require("DYNAMODB_TABLE")?),
            HistoryBackend::Sheets => None,
        };

        let daily_limit = match get("DAILY_LIMIT") {
            Some(v) => v
                .trim()
                .parse()
                .context("DAILY_LIMIT must be a valid number")?,
            None => DEFAULT_DAILY_LIMIT,
        };
        let send_interval_secs = match get("SEND_INTERVAL_SECS") {
            Some(v) => v
                .trim()
                .parse()
                .context("SEND_INTERVAL_SECS must be a valid number")?,
            None => DEFAULT_SEND_INTERVAL_SECS,
        };
        let use_signature = match get("USE_SIGNATURE") {
            Some(v) => parse_bool(&v).context("USE_SIGNATURE must be true or false")?,
            None => true,
        };

        Ok(Self {
            mailer_backend,
            history_backend,
            google,
            sender_email: require("SENDER_EMAIL")?,
            sender_name: get("SENDER_NAME"),
            reply_to: get("REPLY_TO"),
            spreadsheet_id: get("SHEETS_SPREADSHEET_ID"),
            dynamodb_table,
            ses_configuration_set: get("SES_CONFIGURATION_SET"),
            daily_limit,
            send_interval: Duration::from_secs(send_interval_secs),
            quota_state_path: get("QUOTA_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_QUOTA_STATE_PATH)),
            use_signature,
        })
    }

    /// `Name <address>` when a sender name is configured.
    pub fn from_header(&self) -> String {
        match &self.sender_name {
            Some(name) => format!("{} <{}>", name, self.sender_email),
            None => self.sender_email.clone(),
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("not a boolean: {}", other),
    }
}
