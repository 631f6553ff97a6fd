use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A raw spreadsheet cell.
///
/// Numeric cells keep the text they were read from, so zero-padded ids and
/// phone numbers reach the message unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number { value: f64, raw: String },
    Empty,
}

impl CellValue {
    /// Parse a raw CSV cell. Blank cells are `Empty`, numeric cells are `Number`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Self::Empty
        } else if let Ok(value) = trimmed.parse::<f64>()
            && value.is_finite()
        {
            Self::Number {
                value,
                raw: trimmed.to_string(),
            }
        } else {
            Self::Text(trimmed.to_string())
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.trim().is_empty(),
            Self::Number { .. } => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number { value, .. } => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{}", s.trim()),
            Self::Number { raw, .. } => f.write_str(raw),
            Self::Empty => Ok(()),
        }
    }
}

/// One row of the recipient table, keyed by column name.
///
/// `email` is the resolved, normalised address and is never empty.
#[derive(Debug, Clone)]
pub struct RecipientRecord {
    pub email: String,
    pub fields: HashMap<String, CellValue>,
}

impl RecipientRecord {
    /// Resolve the email column of a row. Returns `None` when the cell is empty.
    pub fn from_fields(fields: HashMap<String, CellValue>, email_column: &str) -> Option<Self> {
        let email = fields
            .get(email_column)
            .filter(|v| !v.is_empty())
            .map(|v| normalize_email(&v.to_string()))?;
        Some(Self { email, fields })
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.fields.get(column)
    }
}

/// Idempotence key for a recipient address.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Status of an entry in the send history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Sent,
    Failed,
    Skipped,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => anyhow::bail!("Invalid send status: {}", other),
        }
    }
}

/// An append-only history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRecord {
    pub email: String,
    pub timestamp: DateTime<Utc>,
    pub status: SendStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Terminal state of one recipient within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Sent,
    Skipped,
    Failed,
    QuotaExceeded,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
            Self::QuotaExceeded => write!(f, "quota_exceeded"),
        }
    }
}

/// One row of the result log. Serializes flat for CSV export.
#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub timestamp: DateTime<Utc>,
    pub email: String,
    pub status: OutcomeStatus,
    pub detail: Option<String>,
}

impl SendOutcome {
    pub fn new(email: impl Into<String>, status: OutcomeStatus, detail: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            email: email.into(),
            status,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cells() {
        assert_eq!(CellValue::parse("  "), CellValue::Empty);
        assert_eq!(CellValue::parse(" Acme "), CellValue::Text("Acme".to_string()));
        assert_eq!(CellValue::parse("42").as_f64(), Some(42.0));
        assert_eq!(CellValue::parse("NaN"), CellValue::Text("NaN".to_string()));
    }

    #[test]
    fn numbers_display_as_written() {
        assert_eq!(CellValue::parse("42").to_string(), "42");
        assert_eq!(CellValue::parse("010").to_string(), "010");
        assert_eq!(CellValue::parse(" 1.50 ").to_string(), "1.50");
        assert_eq!(CellValue::parse("1e3").to_string(), "1e3");
        assert_eq!(CellValue::Empty.to_string(), "");
    }

    #[test]
    fn record_requires_email() {
        let fields = HashMap::from([
            ("Email".to_string(), CellValue::Text(" Bob@Example.com ".to_string())),
            ("Name".to_string(), CellValue::Text("Bob".to_string())),
        ]);
        let record = RecipientRecord::from_fields(fields, "Email").unwrap();
        assert_eq!(record.email, "bob@example.com");

        let fields = HashMap::from([("Email".to_string(), CellValue::Empty)]);
        assert!(RecipientRecord::from_fields(fields, "Email").is_none());
    }

    #[test]
    fn send_status_roundtrip() {
        for status in [SendStatus::Sent, SendStatus::Failed, SendStatus::Skipped] {
            assert_eq!(status.to_string().parse::<SendStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<SendStatus>().is_err());
    }

    #[test]
    fn outcome_status_display() {
        assert_eq!(OutcomeStatus::QuotaExceeded.to_string(), "quota_exceeded");
        assert_eq!(OutcomeStatus::Sent.to_string(), "sent");
    }
}
