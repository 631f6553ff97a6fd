//! Concrete collaborators selected at startup from [`Config`].

use crate::config::{Config, HistoryBackend, MailerBackend};
use crate::google_auth::GoogleTokenSource;
use crate::history::sheets::DEFAULT_SPREADSHEET_TITLE;
use crate::history::{DynamoHistoryStore, HistoryStore, SheetsHistoryStore};
use crate::mailer::gmail::GmailMailer;
use crate::mailer::ses::SesMailer;
use crate::mailer::{Attachment, Mailer};
use crate::types::SendStatus;
use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use chrono::{DateTime, Utc};
use email_address::EmailAddress;
use lettre::message::Mailbox;
use std::sync::Arc;
use tracing::info;

pub enum AnyHistory {
    Sheets(SheetsHistoryStore),
    Dynamo(DynamoHistoryStore),
}

pub enum AnyMailer {
    Gmail(GmailMailer),
    Ses(SesMailer),
}

/// Shared clients for building collaborators.
pub struct Clients {
    pub http: reqwest::Client,
    pub google: Option<Arc<GoogleTokenSource>>,
    aws: Option<aws_config::SdkConfig>,
}

impl Clients {
    pub async fn new(config: &Config) -> Self {
        let http = reqwest::Client::new();
        let google = config
            .google
            .clone()
            .map(|creds| Arc::new(GoogleTokenSource::new(creds, http.clone())));
        let needs_aws = config.mailer_backend == MailerBackend::Ses
            || config.history_backend == HistoryBackend::DynamoDb;
        let aws = if needs_aws {
            Some(aws_config::load_defaults(BehaviorVersion::latest()).await)
        } else {
            None
        };
        Self { http, google, aws }
    }

    fn google(&self) -> Result<Arc<GoogleTokenSource>> {
        self.google
            .clone()
            .context("Google credentials are not configured")
    }

    fn aws(&self) -> Result<&aws_config::SdkConfig> {
        self.aws.as_ref().context("AWS configuration was not loaded")
    }
}

pub async fn build_history(config: &Config, clients: &Clients) -> Result<AnyHistory> {
    match config.history_backend {
        HistoryBackend::Sheets => {
            let tokens = clients.google()?;
            let store = match &config.spreadsheet_id {
                Some(id) => SheetsHistoryStore::new(clients.http.clone(), tokens, id.clone()),
                None => SheetsHistoryStore::open_or_create(
                    clients.http.clone(),
                    tokens,
                    DEFAULT_SPREADSHEET_TITLE,
                )
                .await
                .context("Failed to open history spreadsheet")?,
            };
            info!(spreadsheet_id = store.spreadsheet_id(), "Using Sheets history");
            Ok(AnyHistory::Sheets(store))
        }
        HistoryBackend::DynamoDb => {
            let table = config
                .dynamodb_table
                .clone()
                .context("DYNAMODB_TABLE environment variable must be set")?;
            info!(table = %table, "Using DynamoDB history");
            let client = aws_sdk_dynamodb::Client::new(clients.aws()?);
            Ok(AnyHistory::Dynamo(DynamoHistoryStore::new(client, table)))
        }
    }
}

pub async fn build_mailer(config: &Config, clients: &Clients) -> Result<AnyMailer> {
    let from: Mailbox = config
        .from_header()
        .parse()
        .with_context(|| format!("Invalid sender address: {}", config.from_header()))?;
    let reply_to: Option<Mailbox> = config
        .reply_to
        .as_deref()
        .map(|r| r.parse().with_context(|| format!("Invalid REPLY_TO address: {}", r)))
        .transpose()?;

    match config.mailer_backend {
        MailerBackend::Gmail => {
            let mut mailer = GmailMailer::new(clients.http.clone(), clients.google()?, from)
                .with_reply_to(reply_to);
            if config.use_signature {
                mailer = mailer.with_fetched_signature().await;
            }
            Ok(AnyMailer::Gmail(mailer))
        }
        MailerBackend::Ses => {
            let client = aws_sdk_sesv2::Client::new(clients.aws()?);
            Ok(AnyMailer::Ses(
                SesMailer::new(client, from)
                    .with_reply_to(reply_to)
                    .with_configuration_set(config.ses_configuration_set.clone()),
            ))
        }
    }
}

impl HistoryStore for AnyHistory {
    async fn has_sent(&self, email: &str) -> Result<bool> {
        match self {
            Self::Sheets(store) => store.has_sent(email).await,
            Self::Dynamo(store) => store.has_sent(email).await,
        }
    }

    async fn record_sent(
        &self,
        email: &str,
        timestamp: DateTime<Utc>,
        status: SendStatus,
        detail: Option<&str>,
    ) -> Result<()> {
        match self {
            Self::Sheets(store) => store.record_sent(email, timestamp, status, detail).await,
            Self::Dynamo(store) => store.record_sent(email, timestamp, status, detail).await,
        }
    }

    async fn sent_count(&self) -> Result<usize> {
        match self {
            Self::Sheets(store) => store.sent_count().await,
            Self::Dynamo(store) => store.sent_count().await,
        }
    }

    async fn clear(&self) -> Result<()> {
        match self {
            Self::Sheets(store) => store.clear().await,
            Self::Dynamo(store) => store.clear().await,
        }
    }
}

impl Mailer for AnyMailer {
    async fn send_email(
        &self,
        recipient: &EmailAddress,
        subject: &str,
        html_content: &str,
        text_content: &str,
        attachments: &[Attachment],
    ) -> Result<()> {
        match self {
            Self::Gmail(mailer) => {
                mailer
                    .send_email(recipient, subject, html_content, text_content, attachments)
                    .await
            }
            Self::Ses(mailer) => {
                mailer
                    .send_email(recipient, subject, html_content, text_content, attachments)
                    .await
            }
        }
    }

    fn signature(&self) -> Option<&str> {
        match self {
            Self::Gmail(mailer) => mailer.signature(),
            Self::Ses(mailer) => mailer.signature(),
        }
    }
}
