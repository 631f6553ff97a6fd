use super::HistoryStore;
use crate::types::{SendRecord, SendStatus, normalize_email};
use anyhow::{Context, Result};
use aws_sdk_dynamodb::{Client, types::AttributeValue};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

const HISTORY_PARTITION_KEY_PREFIX: &str = "SEND_HISTORY";

// ============================================================================
// DynamoHistoryStore — DynamoDB-backed HistoryStore implementation
// ============================================================================

/// One item per attempt: PK="SEND_HISTORY#{email}", SK="{rfc3339 timestamp}".
pub struct DynamoHistoryStore {
    client: Client,
    table_name: String,
}

impl DynamoHistoryStore {
    pub fn new(client: Client, table_name: String) -> Self {
        Self { client, table_name }
    }

    /// Every history item, following pagination.
    async fn scan_all(&self) -> Result<Vec<SendRecord>> {
        let mut records = Vec::new();
        let mut exclusive_start_key = None;

        loop {
            let mut req = self
                .client
                .scan()
                .table_name(&self.table_name)
                .filter_expression("begins_with(PK, :prefix)")
                .expression_attribute_values(
                    ":prefix",
                    AttributeValue::S(format!("{}#", HISTORY_PARTITION_KEY_PREFIX)),
                );

            if let Some(start_key) = exclusive_start_key {
                req = req.set_exclusive_start_key(Some(start_key));
            }

            let output = req.send().await.context("Failed to scan send history")?;

            if let Some(items) = output.items {
                for item in items {
                    records.push(record_from_item(item)?);
                }
            }

            exclusive_start_key = output.last_evaluated_key;
            if exclusive_start_key.is_none() {
                break;
            }
        }

        Ok(records)
    }
}

impl HistoryStore for DynamoHistoryStore {
    async fn has_sent(&self, email: &str) -> Result<bool> {
        let output = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression("PK = :pk")
            .filter_expression("#status = :sent")
            .expression_attribute_names("#status", "status")
            .expression_attribute_values(":pk", AttributeValue::S(history_pk(email)))
            .expression_attribute_values(
                ":sent",
                AttributeValue::S(SendStatus::Sent.to_string()),
            )
            .send()
            .await
            .context("Failed to query send history")?;

        Ok(output.count > 0)
    }

    async fn record_sent(
        &self,
        email: &str,
        timestamp: DateTime<Utc>,
        status: SendStatus,
        detail: Option<&str>,
    ) -> Result<()> {
        let record = super::record(email, timestamp, status, detail);

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item_from_record(&record)))
            .send()
            .await
            .context("Failed to record send history")?;

        Ok(())
    }

    async fn sent_count(&self) -> Result<usize> {
        Ok(self
            .scan_all()
            .await?
            .into_iter()
            .filter(|r| r.status == SendStatus::Sent)
            .map(|r| r.email)
            .collect::<HashSet<_>>()
            .len())
    }

    async fn clear(&self) -> Result<()> {
        for record in self.scan_all().await? {
            self.client
                .delete_item()
                .table_name(&self.table_name)
                .key("PK", AttributeValue::S(history_pk(&record.email)))
                .key("SK", AttributeValue::S(record.timestamp.to_rfc3339()))
                .send()
                .await
                .context("Failed to delete send history item")?;
        }
        Ok(())
    }
}

// ============================================================================
// Serialization helpers
// ============================================================================

fn history_pk(email: &str) -> String {
    format!("{}#{}", HISTORY_PARTITION_KEY_PREFIX, normalize_email(email))
}

pub(crate) fn item_from_record(record: &SendRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::from([
        ("PK".to_string(), AttributeValue::S(history_pk(&record.email))),
        (
            "SK".to_string(),
            AttributeValue::S(record.timestamp.to_rfc3339()),
        ),
        ("email".to_string(), AttributeValue::S(record.email.clone())),
        (
            "status".to_string(),
            AttributeValue::S(record.status.to_string()),
        ),
    ]);
    if let Some(detail) = &record.detail {
        item.insert("detail".to_string(), AttributeValue::S(detail.clone()));
    }
    item
}

pub(crate) fn record_from_item(item: HashMap<String, AttributeValue>) -> Result<SendRecord> {
    let email = item
        .get("email")
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| anyhow::anyhow!("Missing email field"))?
        .to_string();

    let timestamp = item
        .get("SK")
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| anyhow::anyhow!("Missing SK field"))?
        .parse::<DateTime<Utc>>()
        .context("Invalid history timestamp")?;

    let status = item
        .get("status")
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| anyhow::anyhow!("Missing status field"))?
        .parse::<SendStatus>()
        .context("Invalid status value")?;

    let detail = item
        .get("detail")
        .and_then(|v| v.as_s().ok())
        .cloned();

    Ok(SendRecord {
        email,
        timestamp,
        status,
        detail,
    })
}

// ============================================================================
// Tests — DynamoDB serialization helpers (no network required)
// ============================================================================
