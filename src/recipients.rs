//! Recipient table loaded from an uploaded CSV export of the spreadsheet.

use crate::template::VariableBinding;
use crate::types::{CellValue, RecipientRecord};
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RecipientTable {
    pub columns: Vec<String>,
    pub email_column: String,
    pub records: Vec<RecipientRecord>,
    /// Spreadsheet row number (header is row 1) of each record.
    row_numbers: Vec<usize>,
    pub skipped_without_email: usize,
}

/// Empty-value breakdown of a table for the variables a template uses.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableAnalysis {
    pub total: usize,
    pub complete: usize,
    pub has_empty: usize,
    pub no_email: usize,
    pub empty_details: Vec<EmptyDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmptyDetail {
    pub row: usize,
    pub email: String,
    pub empty_variables: Vec<String>,
}

impl RecipientTable {
    pub fn from_csv_path(path: impl AsRef<Path>, email_column: &str) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open recipient file {}", path.display()))?;
        Self::from_reader(file, email_column)
            .with_context(|| format!("Failed to read recipients from {}", path.display()))
    }

    pub fn from_reader<R: Read>(reader: R, email_column: &str) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let columns: Vec<String> = csv
            .headers()
            .context("Failed to read CSV header")?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect();

        if !columns.iter().any(|c| c == email_column) {
            bail!(
                "Email column '{}' not found. Available columns: {:?}",
                email_column,
                columns
            );
        }

        let mut records = Vec::new();
        let mut row_numbers = Vec::new();
        let mut skipped_without_email = 0;

        for (idx, row) in csv.records().enumerate() {
            let row = row.with_context(|| format!("Malformed CSV row {}", idx + 2))?;
            let fields: HashMap<String, CellValue> = columns
                .iter()
                .enumerate()
                .map(|(i, column)| {
                    let value = row.get(i).map(CellValue::parse).unwrap_or(CellValue::Empty);
                    (column.clone(), value)
                })
                .collect();

            match RecipientRecord::from_fields(fields, email_column) {
                Some(record) => {
                    records.push(record);
                    row_numbers.push(idx + 2);
                }
                None => {
                    warn!(row = idx + 2, "Row has no email address — skipping");
                    skipped_without_email += 1;
                }
            }
        }

        info!(
            rows = records.len(),
            skipped_without_email, "Loaded recipient table"
        );

        Ok(Self {
            columns,
            email_column: email_column.to_string(),
            records,
            row_numbers,
            skipped_without_email,
        })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Count rows whose bound columns are empty for `variables`.
    pub fn analyze(&self, variables: &[String], binding: &VariableBinding) -> TableAnalysis {
        let mut analysis = TableAnalysis {
            total: self.records.len() + self.skipped_without_email,
            no_email: self.skipped_without_email,
            ..Default::default()
        };

        for (record, &row) in self.records.iter().zip(&self.row_numbers) {
            let empty_variables: Vec<String> = variables
                .iter()
                .filter(|name| {
                    binding
                        .column_for(name)
                        .and_then(|column| record.get(column))
                        .is_some_and(CellValue::is_empty)
                })
                .cloned()
                .collect();

            if empty_variables.is_empty() {
                analysis.complete += 1;
            } else {
                analysis.has_empty += 1;
                analysis.empty_details.push(EmptyDetail {
                    row,
                    email: record.email.clone(),
                    empty_variables,
                });
            }
        }

        analysis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{EmptyValuePolicy, Template, render};

    const CSV: &str = "\u{feff}Email, Name ,Company,Seats\n\
        a@example.com,Ann,Acme,3\n\
        ,Nobody,Void,\n\
        B@Example.com,Bo,,12\n";

    #[test]
    fn loads_rows_and_drops_rows_without_email() {
        let table = RecipientTable::from_reader(CSV.as_bytes(), "Email").unwrap();
        assert_eq!(table.columns, vec!["Email", "Name", "Company", "Seats"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.skipped_without_email, 1);
        assert_eq!(table.records[1].email, "b@example.com");
        assert_eq!(table.records[0].get("Seats").and_then(CellValue::as_f64), Some(3.0));
        assert_eq!(table.records[1].get("Company"), Some(&CellValue::Empty));
    }

    #[test]
    fn numeric_looking_cells_render_as_written() {
        let csv = "Email,Phone,Zip,Code\na@example.com,01012345678,02134,1.50\n";
        let table = RecipientTable::from_reader(csv.as_bytes(), "Email").unwrap();
        let template = Template::new("", "{Phone}|{Zip}|{Code}");
        let binding = VariableBinding::identity_for(template.variables());

        let rendered = render(
            &template,
            &binding,
            &table.records[0],
            &EmptyValuePolicy::default(),
        )
        .unwrap();
        assert_eq!(rendered.body, "01012345678|02134|1.50");
        assert_eq!(table.records[0].get("Code").and_then(CellValue::as_f64), Some(1.5));
    }

    #[test]
    fn unknown_email_column_is_rejected() {
        let err = RecipientTable::from_reader(CSV.as_bytes(), "mail").unwrap_err();
        assert!(err.to_string().contains("Email column 'mail' not found"));
    }

    #[test]
    fn short_rows_are_padded_with_empty_cells() {
        let csv = "Email,Name\nx@example.com\n";
        let table = RecipientTable::from_reader(csv.as_bytes(), "Email").unwrap();
        assert_eq!(table.records[0].get("Name"), Some(&CellValue::Empty));
    }

    #[test]
    fn analyze_reports_empty_bound_values() {
        let table = RecipientTable::from_reader(CSV.as_bytes(), "Email").unwrap();
        let variables = vec!["name".to_string(), "company".to_string()];
        let binding = VariableBinding::new()
            .with("name", "Name")
            .with("company", "Company");

        let analysis = table.analyze(&variables, &binding);
        assert_eq!(analysis.total, 3);
        assert_eq!(analysis.no_email, 1);
        assert_eq!(analysis.complete, 1);
        assert_eq!(analysis.has_empty, 1);
        assert_eq!(analysis.empty_details[0].row, 4);
        assert_eq!(analysis.empty_details[0].email, "b@example.com");
        assert_eq!(analysis.empty_details[0].empty_variables, vec!["company"]);
    }
}
