//! Result log export and run totals.

use crate::types::{OutcomeStatus, SendOutcome};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::path::Path;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Write outcomes as CSV, prefixed with a UTF-8 BOM so spreadsheet apps pick
/// the right encoding.
pub fn write_csv<W: Write>(outcomes: &[SendOutcome], mut writer: W) -> Result<()> {
    writer
        .write_all(UTF8_BOM)
        .context("Failed to write results")?;
    let mut csv = csv::Writer::from_writer(writer);
    for outcome in outcomes {
        csv.serialize(outcome)
            .with_context(|| format!("Failed to write result row for {}", outcome.email))?;
    }
    csv.flush().context("Failed to write results")?;
    Ok(())
}

pub fn write_csv_path(outcomes: &[SendOutcome], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    write_csv(outcomes, std::io::BufWriter::new(file))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    pub quota_exceeded: usize,
}

impl RunSummary {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a SendOutcome>) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            summary.add(outcome);
        }
        summary
    }

    pub fn add(&mut self, outcome: &SendOutcome) {
        match outcome.status {
            OutcomeStatus::Sent => self.sent += 1,
            OutcomeStatus::Failed => self.failed += 1,
            OutcomeStatus::Skipped => self.skipped += 1,
            OutcomeStatus::QuotaExceeded => self.quota_exceeded += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.sent + self.failed + self.skipped + self.quota_exceeded
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sent, {} failed, {} skipped, {} over quota",
            self.sent, self.failed, self.skipped, self.quota_exceeded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcomes() -> Vec<SendOutcome> {
        vec![
            SendOutcome::new("a@example.com", OutcomeStatus::Sent, None),
            SendOutcome::new(
                "b@example.com",
                OutcomeStatus::Failed,
                Some("delivery failed: 550, mailbox unavailable".into()),
            ),
            SendOutcome::new("c@example.com", OutcomeStatus::Skipped, Some("already sent".into())),
            SendOutcome::new("d@example.com", OutcomeStatus::QuotaExceeded, None),
        ]
    }

    #[test]
    fn csv_export_has_bom_header_and_rows() {
        let mut buf = Vec::new();
        write_csv(&outcomes(), &mut buf).unwrap();

        assert!(buf.starts_with(UTF8_BOM));
        let text = String::from_utf8(buf[UTF8_BOM.len()..].to_vec()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "timestamp,email,status,detail");
        assert_eq!(lines.len(), 5);
        assert!(lines[1].ends_with(",a@example.com,sent,"));
        assert!(lines[2].ends_with(",b@example.com,failed,\"delivery failed: 550, mailbox unavailable\""));
        assert!(lines[4].contains(",quota_exceeded,"));
    }

    #[test]
    fn csv_export_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        write_csv_path(&outcomes(), &path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        let first = headers.get(0).unwrap().trim_start_matches('\u{feff}');
        assert_eq!(first, "timestamp");
        assert_eq!(reader.records().count(), 4);
    }

    #[test]
    fn summary_counts_each_status() {
        let summary = RunSummary::from_outcomes(&outcomes());
        assert_eq!(
            summary,
            RunSummary {
                sent: 1,
                failed: 1,
                skipped: 1,
                quota_exceeded: 1
            }
        );
        assert_eq!(summary.total(), 4);
        assert_eq!(
            summary.to_string(),
            "1 sent, 1 failed, 1 skipped, 1 over quota"
        );
    }
}
