//! Per-session send settings, created once from user input and held for one batch.

use crate::mailer::Attachment;
use crate::template::{EmptyValuePolicy, Template, VariableBinding};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Gmail rejects messages whose attachments exceed this in total.
pub const MAX_ATTACHMENT_BYTES: u64 = 25 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    pub email_column: String,
    pub template: Template,
    #[serde(default)]
    pub binding: VariableBinding,
    #[serde(default)]
    pub empty_values: EmptyValuePolicy,
    /// When false, placeholders without a binding use the column of the same name.
    #[serde(default)]
    pub strict_binding: bool,
    /// Files attached to every message. Relative paths are resolved against
    /// the session file's directory.
    #[serde(default)]
    pub attachments: Vec<PathBuf>,
}

impl Session {
    pub fn new(
        email_column: impl Into<String>,
        template: Template,
        binding: VariableBinding,
        empty_values: EmptyValuePolicy,
    ) -> Self {
        Self {
            email_column: email_column.into(),
            template,
            binding,
            empty_values,
            strict_binding: false,
            attachments: Vec::new(),
        }
        .with_binding_mode()
    }

    /// Require every placeholder to have an explicit binding.
    pub fn strict(mut self, binding: VariableBinding) -> Self {
        self.strict_binding = true;
        self.binding = binding;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<PathBuf>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Read a JSON session file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read session file {}", path.display()))?;
        let mut session = Self::from_json(&contents)
            .with_context(|| format!("Invalid session file {}", path.display()))?;
        if let Some(dir) = path.parent() {
            for attachment in &mut session.attachments {
                if attachment.is_relative() {
                    *attachment = dir.join(&*attachment);
                }
            }
        }
        Ok(session)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let session: Session = serde_json::from_str(json)?;
        Ok(session.with_binding_mode())
    }

    fn with_binding_mode(mut self) -> Self {
        if !self.strict_binding {
            let variables = self.variables();
            self.binding = self
                .binding
                .or_identity(variables.iter().map(String::as_str));
        }
        self
    }

    /// Read the attachment files, refusing a total above [`MAX_ATTACHMENT_BYTES`].
    pub fn load_attachments(&self) -> Result<Vec<Attachment>> {
        let mut total = 0;
        for path in &self.attachments {
            total += std::fs::metadata(path)
                .with_context(|| format!("Failed to read attachment {}", path.display()))?
                .len();
        }
        if total > MAX_ATTACHMENT_BYTES {
            bail!(
                "Attachments total {:.1} MB, over the 25 MB Gmail limit",
                total as f64 / (1024.0 * 1024.0)
            );
        }

        let attachments = self
            .attachments
            .iter()
            .map(Attachment::from_path)
            .collect::<Result<Vec<_>>>()?;
        if !attachments.is_empty() {
            info!(count = attachments.len(), bytes = total, "Loaded attachments");
        }
        Ok(attachments)
    }

    /// Variables of the primary template followed by any only the alternate uses.
    pub fn variables(&self) -> Vec<String> {
        let mut variables = self.template.variables();
        if let EmptyValuePolicy::AlternateTemplate { template, .. } = &self.empty_values {
            for name in template.variables() {
                if !variables.contains(&name) {
                    variables.push(name);
                }
            }
        }
        variables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_binding_defaults_to_same_named_columns() {
        let session = Session::from_json(
            r#"{
                "email_column": "Email",
                "template": {"subject": "Hi {name}", "body": "{company} rocks"},
                "binding": {"name": "Full Name"}
            }"#,
        )
        .unwrap();
        assert_eq!(session.binding.column_for("name"), Some("Full Name"));
        assert_eq!(session.binding.column_for("company"), Some("company"));
        assert_eq!(session.empty_values, EmptyValuePolicy::default());
    }

    #[test]
    fn strict_binding_leaves_gaps() {
        let session = Session::from_json(
            r#"{
                "email_column": "Email",
                "template": {"subject": "Hi {name}", "body": ""},
                "strict_binding": true
            }"#,
        )
        .unwrap();
        assert_eq!(session.binding.column_for("name"), None);
    }

    #[test]
    fn variables_include_alternate_template() {
        let session = Session::from_json(
            r#"{
                "email_column": "Email",
                "template": {"subject": "{a}", "body": "{b}"},
                "empty_values": {
                    "mode": "alternate_template",
                    "template": {"subject": "{c}", "body": "{a}"},
                    "fallback": "there"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(session.variables(), vec!["a", "b", "c"]);
        assert_eq!(session.binding.column_for("c"), Some("c"));
    }

    #[test]
    fn built_and_loaded_sessions_bind_alike() {
        let built = Session::new(
            "Email",
            Template::new("Hi {name}", "{company} rocks"),
            VariableBinding::new().with("name", "Full Name"),
            EmptyValuePolicy::default(),
        );
        let loaded = Session::from_json(
            r#"{
                "email_column": "Email",
                "template": {"subject": "Hi {name}", "body": "{company} rocks"},
                "binding": {"name": "Full Name"}
            }"#,
        )
        .unwrap();
        assert_eq!(built.binding, loaded.binding);
        assert_eq!(built.strict_binding, loaded.strict_binding);
        assert_eq!(built.binding.column_for("company"), Some("company"));

        let strict = built.strict(VariableBinding::new().with("name", "Full Name"));
        assert_eq!(strict.binding.column_for("company"), None);
    }

    #[test]
    fn attachments_resolve_against_session_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deck.pdf"), b"%PDF-1.4").unwrap();
        let session_path = dir.path().join("session.json");
        std::fs::write(
            &session_path,
            r#"{
                "email_column": "Email",
                "template": {"subject": "s", "body": "b"},
                "attachments": ["deck.pdf"]
            }"#,
        )
        .unwrap();

        let session = Session::load(&session_path).unwrap();
        assert_eq!(session.attachments, vec![dir.path().join("deck.pdf")]);
        let attachments = session.load_attachments().unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename, "deck.pdf");
        assert_eq!(attachments[0].content_type, "application/pdf");
    }

    #[test]
    fn oversized_attachments_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("big.bin");
        std::fs::File::create(&big)
            .unwrap()
            .set_len(MAX_ATTACHMENT_BYTES + 1)
            .unwrap();

        let session = Session::new(
            "Email",
            Template::new("s", "b"),
            VariableBinding::new(),
            EmptyValuePolicy::default(),
        )
        .with_attachments(vec![big]);
        let err = session.load_attachments().unwrap_err();
        assert!(err.to_string().contains("25 MB"));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Session::load("/nonexistent/session.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read session file"));
    }
}
