use crate::types::{SendRecord, SendStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};

pub mod dynamo;
pub mod sheets;
pub use dynamo::DynamoHistoryStore;
pub use sheets::SheetsHistoryStore;

// ============================================================================
// HistoryStore trait
// ============================================================================

/// Append-only send log, the source of truth for idempotence.
///
/// Only a `sent` entry makes `has_sent` true; failed recipients are retried by
/// later runs.
#[allow(async_fn_in_trait)]
pub trait HistoryStore: Send + Sync {
    async fn has_sent(&self, email: &str) -> Result<bool>;

    async fn record_sent(
        &self,
        email: &str,
        timestamp: DateTime<Utc>,
        status: SendStatus,
        detail: Option<&str>,
    ) -> Result<()>;

    /// Number of distinct recipients marked `sent`.
    async fn sent_count(&self) -> Result<usize>;

    /// Drop all history so every recipient becomes eligible again.
    async fn clear(&self) -> Result<()>;
}

// ============================================================================
// Shared helpers
// ============================================================================

pub(crate) fn record(
    email: &str,
    timestamp: DateTime<Utc>,
    status: SendStatus,
    detail: Option<&str>,
) -> SendRecord {
    SendRecord {
        email: crate::types::normalize_email(email),
        timestamp,
        status,
        detail: detail.map(str::to_string),
    }
}

// ============================================================================
// Test utilities — in-memory history for in-crate tests
// ============================================================================

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct InMemoryHistory {
        pub records: Mutex<Vec<SendRecord>>,
        pub has_sent_calls: Mutex<Vec<String>>,
        fail_lookups: HashSet<String>,
        fail_writes: HashSet<String>,
    }

    impl InMemoryHistory {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_sent(self, email: &str) -> Self {
            self.records
                .lock()
                .unwrap()
                .push(record(email, Utc::now(), SendStatus::Sent, None));
            self
        }

        pub(crate) fn with_failed(self, email: &str) -> Self {
            self.records.lock().unwrap().push(record(
                email,
                Utc::now(),
                SendStatus::Failed,
                Some("earlier failure"),
            ));
            self
        }

        /// Make `has_sent` error for this address.
        pub(crate) fn failing_lookup(mut self, email: &str) -> Self {
            self.fail_lookups.insert(email.to_lowercase());
            self
        }

        /// Make `record_sent` error for this address.
        pub(crate) fn failing_write(mut self, email: &str) -> Self {
            self.fail_writes.insert(email.to_lowercase());
            self
        }

        pub(crate) fn records_for(&self, email: &str) -> Vec<SendRecord> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.email == email.to_lowercase())
                .cloned()
                .collect()
        }

        pub(crate) fn record_count(&self) -> usize {
            self.records.lock().unwrap().len()
        }
    }

    impl HistoryStore for InMemoryHistory {
        async fn has_sent(&self, email: &str) -> Result<bool> {
            let email = email.to_lowercase();
            self.has_sent_calls.lock().unwrap().push(email.clone());
            if self.fail_lookups.contains(&email) {
                anyhow::bail!("history lookup failed for {}", email);
            }
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.email == email && r.status == SendStatus::Sent))
        }

        async fn record_sent(
            &self,
            email: &str,
            timestamp: DateTime<Utc>,
            status: SendStatus,
            detail: Option<&str>,
        ) -> Result<()> {
            if self.fail_writes.contains(&email.to_lowercase()) {
                anyhow::bail!("history write failed for {}", email);
            }
            self.records
                .lock()
                .unwrap()
                .push(record(email, timestamp, status, detail));
            Ok(())
        }

        async fn sent_count(&self) -> Result<usize> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.status == SendStatus::Sent)
                .map(|r| r.email.as_str())
                .collect::<HashSet<_>>()
                .len())
        }

        async fn clear(&self) -> Result<()> {
            self.records.lock().unwrap().clear();
            Ok(())
        }
    }
}
