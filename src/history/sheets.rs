use super::HistoryStore;
use crate::google_auth::GoogleTokenSource;
use crate::types::{SendStatus, normalize_email};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DRIVE_FILES_API: &str = "https://www.googleapis.com/drive/v3/files";
const SPREADSHEET_MIME_TYPE: &str = "application/vnd.google-apps.spreadsheet";
pub const DEFAULT_SPREADSHEET_TITLE: &str = "coldmail send history";
const SHEET_NAME: &str = "history";
const HEADER: [&str; 4] = ["email", "timestamp", "status", "detail"];

// ============================================================================
// SheetsHistoryStore — Google Sheets-backed HistoryStore implementation
// ============================================================================

/// Rows are `email, timestamp, status, detail` under a header row.
///
/// The set of sent addresses is read once and then kept current by
/// `record_sent`, so lookups during a run do not hit the API.
pub struct SheetsHistoryStore {
    http_client: reqwest::Client,
    tokens: Arc<GoogleTokenSource>,
    spreadsheet_id: String,
    sent: Mutex<Option<HashSet<String>>>,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedSpreadsheet {
    spreadsheet_id: String,
}

#[derive(Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Deserialize)]
struct DriveFile {
    id: String,
}

impl SheetsHistoryStore {
    pub fn new(
        http_client: reqwest::Client,
        tokens: Arc<GoogleTokenSource>,
        spreadsheet_id: String,
    ) -> Self {
        Self {
            http_client,
            tokens,
            spreadsheet_id,
            sent: Mutex::new(None),
        }
    }

    /// Find the history spreadsheet by title in the user's Drive, creating it if absent.
    pub async fn open_or_create(
        http_client: reqwest::Client,
        tokens: Arc<GoogleTokenSource>,
        title: &str,
    ) -> Result<Self> {
        let spreadsheet_id = match find_spreadsheet(&http_client, &tokens, title).await? {
            Some(id) => id,
            None => create_spreadsheet(&http_client, &tokens, title).await?,
        };
        Ok(Self::new(http_client, tokens, spreadsheet_id))
    }

    pub fn spreadsheet_id(&self) -> &str {
        &self.spreadsheet_id
    }

    fn values_url(&self, range: &str) -> String {
        format!(
            "{}/{}/values/{}",
            SHEETS_API,
            self.spreadsheet_id,
            urlencoding::encode(range)
        )
    }

    async fn load_sent(&self) -> Result<HashSet<String>> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http_client
            .get(self.values_url(&format!("{}!A:C", SHEET_NAME)))
            .bearer_auth(token)
            .send()
            .await
            .context("Failed to read send history")?;
        let range: ValueRange = ok_or_bail(response, "read send history")
            .await?
            .json()
            .await
            .context("Invalid send history response")?;

        let sent = sent_addresses(&range.values);
        info!(sent = sent.len(), "Loaded send history");
        Ok(sent)
    }

    async fn append_row(&self, row: [String; 4]) -> Result<()> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}:append", self.values_url(&format!("{}!A:D", SHEET_NAME)));
        let response = self
            .http_client
            .post(url)
            .query(&[
                ("valueInputOption", "RAW"),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .bearer_auth(token)
            .json(&json!({ "values": [row] }))
            .send()
            .await
            .context("Failed to append send history")?;
        ok_or_bail(response, "append send history").await?;
        Ok(())
    }
}

impl HistoryStore for SheetsHistoryStore {
    async fn has_sent(&self, email: &str) -> Result<bool> {
        let mut sent = self.sent.lock().await;
        if sent.is_none() {
            *sent = Some(self.load_sent().await?);
        }
        Ok(sent
            .as_ref()
            .is_some_and(|set| set.contains(&normalize_email(email))))
    }

    async fn record_sent(
        &self,
        email: &str,
        timestamp: DateTime<Utc>,
        status: SendStatus,
        detail: Option<&str>,
    ) -> Result<()> {
        let email = normalize_email(email);
        self.append_row([
            email.clone(),
            timestamp.to_rfc3339(),
            status.to_string(),
            detail.unwrap_or_default().to_string(),
        ])
        .await?;

        if status == SendStatus::Sent {
            let mut sent = self.sent.lock().await;
            if let Some(set) = sent.as_mut() {
                set.insert(email);
            }
        }
        Ok(())
    }

    async fn sent_count(&self) -> Result<usize> {
        let mut sent = self.sent.lock().await;
        if sent.is_none() {
            *sent = Some(self.load_sent().await?);
        }
        Ok(sent.as_ref().map_or(0, HashSet::len))
    }

    async fn clear(&self) -> Result<()> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}:clear", self.values_url(&format!("{}!A2:D", SHEET_NAME)));
        let response = self
            .http_client
            .post(url)
            .bearer_auth(token)
            .json(&json!({}))
            .send()
            .await
            .context("Failed to clear send history")?;
        ok_or_bail(response, "clear send history").await?;

        *self.sent.lock().await = Some(HashSet::new());
        info!(spreadsheet_id = %self.spreadsheet_id, "Send history cleared");
        Ok(())
    }
}

// ============================================================================
// Spreadsheet discovery
// ============================================================================

async fn find_spreadsheet(
    http_client: &reqwest::Client,
    tokens: &GoogleTokenSource,
    title: &str,
) -> Result<Option<String>> {
    let token = tokens.access_token().await?;
    let query = format!(
        "name = '{}' and mimeType = '{}' and trashed = false",
        title.replace('\'', "\\'"),
        SPREADSHEET_MIME_TYPE
    );
    let response = http_client
        .get(DRIVE_FILES_API)
        .query(&[
            ("q", query.as_str()),
            ("spaces", "drive"),
            ("fields", "files(id, name)"),
            ("pageSize", "1"),
        ])
        .bearer_auth(token)
        .send()
        .await
        .context("Failed to search Drive for history spreadsheet")?;
    let list: DriveFileList = ok_or_bail(response, "search Drive")
        .await?
        .json()
        .await
        .context("Invalid Drive response")?;
    Ok(list.files.into_iter().next().map(|f| f.id))
}

async fn create_spreadsheet(
    http_client: &reqwest::Client,
    tokens: &GoogleTokenSource,
    title: &str,
) -> Result<String> {
    let token = tokens.access_token().await?;
    let response = http_client
        .post(SHEETS_API)
        .bearer_auth(&token)
        .json(&json!({
            "properties": { "title": title },
            "sheets": [{ "properties": { "title": SHEET_NAME } }],
        }))
        .send()
        .await
        .context("Failed to create history spreadsheet")?;
    let created: CreatedSpreadsheet = ok_or_bail(response, "create history spreadsheet")
        .await?
        .json()
        .await
        .context("Invalid create spreadsheet response")?;

    let header_range = format!("{}!A1:D1", SHEET_NAME);
    let response = http_client
        .put(format!(
            "{}/{}/values/{}",
            SHEETS_API,
            created.spreadsheet_id,
            urlencoding::encode(&header_range)
        ))
        .query(&[("valueInputOption", "RAW")])
        .bearer_auth(&token)
        .json(&json!({ "values": [HEADER] }))
        .send()
        .await
        .context("Failed to write history header")?;
    ok_or_bail(response, "write history header").await?;

    info!(spreadsheet_id = %created.spreadsheet_id, title, "Created history spreadsheet");
    Ok(created.spreadsheet_id)
}

// ============================================================================
// Helpers
// ============================================================================

async fn ok_or_bail(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::FORBIDDEN {
        bail!(
            "Failed to {}: access denied ({}). Check that the Sheets and Drive APIs are enabled. {}",
            action,
            status,
            body
        );
    }
    bail!("Failed to {}: {} {}", action, status, body)
}

/// Addresses with a `sent` row. Rows without a status column count as sent.
fn sent_addresses(rows: &[Vec<String>]) -> HashSet<String> {
    rows.iter()
        .skip(1)
        .filter_map(|row| {
            let email = row.first().map(|e| normalize_email(e))?;
            if email.is_empty() {
                return None;
            }
            match row.get(2).map(|s| s.trim()) {
                None | Some("") => Some(email),
                Some(status) => status
                    .parse::<SendStatus>()
                    .is_ok_and(|s| s == SendStatus::Sent)
                    .then_some(email),
            }
        })
        .collect()
}

// ============================================================================
// Tests — row parsing (no network required)
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn only_sent_rows_are_collected() {
        let rows = vec![
            row(&["email", "timestamp", "status"]),
            row(&["A@example.com", "2024-01-01T00:00:00+00:00", "sent"]),
            row(&["b@example.com", "2024-01-01T00:00:00+00:00", "failed"]),
            row(&["c@example.com", "2024-01-01T00:00:00+00:00", "garbage"]),
        ];
        let sent = sent_addresses(&rows);
        assert_eq!(sent, HashSet::from(["a@example.com".to_string()]));
    }

    #[test]
    fn rows_without_status_count_as_sent() {
        let rows = vec![
            row(&["email", "timestamp"]),
            row(&["legacy@example.com", "2024-01-01 09:00:00"]),
            row(&[]),
            row(&["  "]),
        ];
        let sent = sent_addresses(&rows);
        assert_eq!(sent, HashSet::from(["legacy@example.com".to_string()]));
    }

    #[test]
    fn header_only_sheet_is_empty() {
        assert!(sent_addresses(&[row(&HEADER)]).is_empty());
        assert!(sent_addresses(&[]).is_empty());
    }
}
