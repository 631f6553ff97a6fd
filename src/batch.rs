//! Sequential batch sending.
//!
//! Each recipient is fully processed (history lookup, quota check, render,
//! dispatch, record) before the next one starts, and yields exactly one
//! outcome in input order. Outcomes are produced on demand so callers can show
//! progress while the run is in flight.

use crate::history::HistoryStore;
use crate::mailer::{Attachment, Mailer};
use crate::quota::{self, DailyQuota};
use crate::session::Session;
use crate::template::{self, RenderError};
use crate::types::{OutcomeStatus, RecipientRecord, SendOutcome, SendStatus};
use chrono::Utc;
use futures::Stream;
use std::iter::{Enumerate, Peekable};
use std::slice::Iter;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("template check failed for {email}: {source}")]
    Validation {
        email: String,
        #[source]
        source: RenderError,
    },
}

/// A provider-side send failure, scoped to one recipient.
#[derive(Debug, Error)]
#[error("delivery failed: {0:#}")]
pub struct DeliveryError(pub anyhow::Error);

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Minimum spacing between two dispatches.
    pub send_interval: Duration,
    /// Checked between recipients, never during a dispatch.
    pub cancel: CancellationToken,
    /// Sent with every message.
    pub attachments: Vec<Attachment>,
}

pub struct BatchRun<'a, H, M> {
    session: &'a Session,
    recipients: Peekable<Enumerate<Iter<'a, RecipientRecord>>>,
    total: usize,
    quota: &'a mut DailyQuota,
    history: &'a H,
    mailer: &'a M,
    options: RunOptions,
    quota_exhausted: bool,
    last_dispatch: Option<Instant>,
}

impl<'a, H, M> BatchRun<'a, H, M>
where
    H: HistoryStore,
    M: Mailer,
{
    /// Prepare a run. Every record is checked against the template and binding
    /// first, so a configuration error aborts before anything is sent.
    pub fn new(
        session: &'a Session,
        recipients: &'a [RecipientRecord],
        quota: &'a mut DailyQuota,
        history: &'a H,
        mailer: &'a M,
        options: RunOptions,
    ) -> Result<Self, BatchError> {
        for record in recipients {
            template::validate(
                &session.template,
                &session.binding,
                &session.empty_values,
                record.fields.keys().map(String::as_str),
            )
            .map_err(|source| BatchError::Validation {
                email: record.email.clone(),
                source,
            })?;
        }

        Ok(Self::start(session, recipients, quota, history, mailer, options))
    }

    fn start(
        session: &'a Session,
        recipients: &'a [RecipientRecord],
        quota: &'a mut DailyQuota,
        history: &'a H,
        mailer: &'a M,
        options: RunOptions,
    ) -> Self {
        Self {
            session,
            recipients: recipients.iter().enumerate().peekable(),
            total: recipients.len(),
            quota,
            history,
            mailer,
            options,
            quota_exhausted: false,
            last_dispatch: None,
        }
    }

    /// Process the next recipient. Returns `None` when every recipient has an
    /// outcome or the run was cancelled.
    pub async fn next(&mut self) -> Option<SendOutcome> {
        let index = self.recipients.peek().map(|(i, _)| *i)?;
        if self.options.cancel.is_cancelled() {
            return self.stop(index);
        }

        let (index, record) = self.recipients.next()?;
        let span = info_span!("recipient", index, email = %record.email);
        let Some(outcome) = self.process(record).instrument(span).await else {
            return self.stop(index);
        };

        info!(
            index,
            email = %outcome.email,
            status = %outcome.status,
            detail = outcome.detail.as_deref().unwrap_or(""),
            "Recipient processed"
        );
        Some(outcome)
    }

    /// Drive the run to completion.
    pub async fn collect(mut self) -> Vec<SendOutcome> {
        let mut outcomes = Vec::with_capacity(self.total);
        while let Some(outcome) = self.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    pub fn into_stream(self) -> impl Stream<Item = SendOutcome> {
        futures::stream::unfold(self, |mut run| async move {
            let outcome = run.next().await?;
            Some((outcome, run))
        })
    }

    pub fn remaining_quota(&self) -> u32 {
        self.quota.remaining()
    }

    /// End the run at `index`; that recipient and the rest stay pending.
    fn stop(&mut self, index: usize) -> Option<SendOutcome> {
        info!(
            processed = index,
            remaining = self.total - index,
            "Run cancelled — remaining recipients left pending"
        );
        self.recipients.by_ref().for_each(drop);
        None
    }

    /// Wait until `send_interval` has passed since the previous dispatch.
    /// Returns false when the run was cancelled meanwhile.
    async fn pace(&self) -> bool {
        if let Some(last) = self.last_dispatch
            && !self.options.send_interval.is_zero()
        {
            tokio::select! {
                _ = tokio::time::sleep_until(last + self.options.send_interval) => {}
                _ = self.options.cancel.cancelled() => {}
            }
        }
        !self.options.cancel.is_cancelled()
    }

    /// Finalise one recipient. `None` means the run was cancelled while
    /// waiting to dispatch.
    async fn process(&mut self, record: &RecipientRecord) -> Option<SendOutcome> {
        let email = record.email.as_str();

        match self.history.has_sent(email).await {
            Ok(true) => {
                return Some(SendOutcome::new(
                    email,
                    OutcomeStatus::Skipped,
                    Some("already sent".into()),
                ));
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "History lookup failed");
                return Some(SendOutcome::new(
                    email,
                    OutcomeStatus::Failed,
                    Some(format!("history lookup failed: {:#}", e)),
                ));
            }
        }

        self.quota.roll_over(quota::today());
        if self.quota_exhausted || self.quota.is_exhausted() {
            if !self.quota_exhausted {
                info!(limit = self.quota.limit, "Daily quota exhausted — stopping sends");
                self.quota_exhausted = true;
            }
            return Some(SendOutcome::new(
                email,
                OutcomeStatus::QuotaExceeded,
                Some(format!(
                    "daily limit of {} reached; resume on a later day",
                    self.quota.limit
                )),
            ));
        }

        let session = self.session;
        let rendered = match template::render(
            &session.template,
            &session.binding,
            record,
            &session.empty_values,
        ) {
            Ok(rendered) => rendered,
            // Only reachable for runs built without the up-front check in `new`.
            Err(e) => {
                let detail = format!("render failed: {}", e);
                self.record_failure(email, &detail).await;
                return Some(SendOutcome::new(email, OutcomeStatus::Failed, Some(detail)));
            }
        };

        if !self.pace().await {
            return None;
        }
        self.last_dispatch = Some(Instant::now());
        let result = self
            .mailer
            .send(
                email,
                &rendered.subject,
                &rendered.body,
                &self.options.attachments,
            )
            .await;

        // Every dispatch attempt counts against the provider's daily limit.
        self.quota.consume();
        if let Err(e) = self.quota.save() {
            warn!(error = %e, "Failed to persist daily quota");
        }

        let outcome = match result {
            Ok(()) => {
                let note = rendered.note();
                match self
                    .history
                    .record_sent(email, Utc::now(), SendStatus::Sent, note.as_deref())
                    .await
                {
                    Ok(()) => SendOutcome::new(email, OutcomeStatus::Sent, note),
                    Err(e) => {
                        warn!(error = %e, "Delivered but failed to record history");
                        SendOutcome::new(
                            email,
                            OutcomeStatus::Failed,
                            Some(format!("delivered but not recorded in history: {:#}", e)),
                        )
                    }
                }
            }
            Err(e) => {
                let detail = DeliveryError(e).to_string();
                self.record_failure(email, &detail).await;
                SendOutcome::new(email, OutcomeStatus::Failed, Some(detail))
            }
        };
        Some(outcome)
    }

    async fn record_failure(&self, email: &str, detail: &str) {
        if let Err(e) = self
            .history
            .record_sent(email, Utc::now(), SendStatus::Failed, Some(detail))
            .await
        {
            warn!(error = %e, "Failed to record failure in history");
        }
    }
}
