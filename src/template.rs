//! `{variable}` substitution for subject/body templates.
//!
//! A placeholder is a `{name}` token whose name contains no braces; the name is
//! trimmed and matched case-sensitively. Unbalanced braces are literal text.
//! Rendering is pure: the same inputs always give the same message.

use crate::types::RecipientRecord;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("unbound variable `{name}`")]
    UnboundVariable { name: String },
    #[error("missing column `{column}` (bound to `{name}`)")]
    MissingColumn { name: String, column: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub subject: String,
    pub body: String,
}

impl Template {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Unique placeholder names in order of first appearance, subject first.
    pub fn variables(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        [self.subject.as_str(), self.body.as_str()]
            .into_iter()
            .flat_map(segments)
            .filter_map(|segment| match segment {
                Segment::Placeholder(name) => Some(name),
                Segment::Literal(_) | Segment::Blank => None,
            })
            .filter(|name| seen.insert(*name))
            .map(str::to_string)
            .collect()
    }
}

/// Placeholder name to recipient column, fixed for one send session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableBinding(HashMap<String, String>);

impl VariableBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind every variable to the column of the same name.
    pub fn identity_for<I, S>(variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            variables
                .into_iter()
                .map(|v| {
                    let v: String = v.into();
                    (v.clone(), v)
                })
                .collect(),
        )
    }

    pub fn with(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.0.insert(name.into(), column.into());
        self
    }

    /// Fill in identity bindings for variables that have no explicit column.
    pub fn or_identity<'a>(mut self, variables: impl IntoIterator<Item = &'a str>) -> Self {
        for name in variables {
            self.0
                .entry(name.to_string())
                .or_insert_with(|| name.to_string());
        }
        self
    }

    pub fn column_for(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// What to do when a bound column is empty for a recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EmptyValuePolicy {
    /// Substitute a per-variable default, falling back to `fallback`.
    Defaults {
        #[serde(default)]
        fallback: String,
        #[serde(default)]
        per_variable: HashMap<String, String>,
    },
    /// Render `template` instead; empties left in it become `fallback`.
    AlternateTemplate {
        template: Template,
        #[serde(default)]
        fallback: String,
    },
}

impl Default for EmptyValuePolicy {
    fn default() -> Self {
        Self::Defaults {
            fallback: String::new(),
            per_variable: HashMap::new(),
        }
    }
}

impl EmptyValuePolicy {
    pub fn default_value(value: impl Into<String>) -> Self {
        Self::Defaults {
            fallback: value.into(),
            per_variable: HashMap::new(),
        }
    }

    pub fn alternate(template: Template, fallback: impl Into<String>) -> Self {
        Self::AlternateTemplate {
            template,
            fallback: fallback.into(),
        }
    }

    fn alternate_template(&self) -> Option<&Template> {
        match self {
            Self::AlternateTemplate { template, .. } => Some(template),
            Self::Defaults { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
    pub used_alternate: bool,
    /// Placeholders filled from the empty-value policy.
    pub defaulted: Vec<String>,
}

impl RenderedMessage {
    /// Short annotation for the result log.
    pub fn note(&self) -> Option<String> {
        if self.used_alternate {
            Some("alternate template".to_string())
        } else if !self.defaulted.is_empty() {
            Some(format!("defaults applied: {}", self.defaulted.join(", ")))
        } else {
            None
        }
    }
}

/// Render one recipient's message.
pub fn render(
    template: &Template,
    binding: &VariableBinding,
    record: &RecipientRecord,
    policy: &EmptyValuePolicy,
) -> Result<RenderedMessage, RenderError> {
    let values = resolve(template, binding, record)?;
    let has_empty = values.values().any(Option::is_none);

    match policy {
        EmptyValuePolicy::AlternateTemplate {
            template: alternate,
            fallback,
        } if has_empty => {
            let alt_values = resolve(alternate, binding, record)?;
            let mut rendered = substitute(alternate, &alt_values, |_| fallback.as_str());
            rendered.used_alternate = true;
            Ok(rendered)
        }
        EmptyValuePolicy::AlternateTemplate { fallback, .. } => {
            Ok(substitute(template, &values, |_| fallback.as_str()))
        }
        EmptyValuePolicy::Defaults {
            fallback,
            per_variable,
        } => Ok(substitute(template, &values, |name| {
            per_variable
                .get(name)
                .map(String::as_str)
                .unwrap_or(fallback.as_str())
        })),
    }
}

/// Check every placeholder of the template (and of an alternate template) against
/// the binding and the available columns.
pub fn validate<'a>(
    template: &Template,
    binding: &VariableBinding,
    policy: &EmptyValuePolicy,
    columns: impl IntoIterator<Item = &'a str>,
) -> Result<(), RenderError> {
    let columns: HashSet<&str> = columns.into_iter().collect();
    for t in std::iter::once(template).chain(policy.alternate_template()) {
        for name in t.variables() {
            let column = binding
                .column_for(&name)
                .ok_or_else(|| RenderError::UnboundVariable { name: name.clone() })?;
            if !columns.contains(column) {
                return Err(RenderError::MissingColumn {
                    name,
                    column: column.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Placeholder name to cell value, `None` when the cell is empty.
fn resolve(
    template: &Template,
    binding: &VariableBinding,
    record: &RecipientRecord,
) -> Result<HashMap<String, Option<String>>, RenderError> {
    template
        .variables()
        .into_iter()
        .map(|name| -> Result<(String, Option<String>), RenderError> {
            let column = binding
                .column_for(&name)
                .ok_or_else(|| RenderError::UnboundVariable { name: name.clone() })?;
            let value = record.get(column).ok_or_else(|| RenderError::MissingColumn {
                name: name.clone(),
                column: column.to_string(),
            })?;
            let value = (!value.is_empty()).then(|| value.to_string());
            Ok((name, value))
        })
        .collect()
}

fn substitute<'p>(
    template: &Template,
    values: &HashMap<String, Option<String>>,
    default_for: impl Fn(&str) -> &'p str,
) -> RenderedMessage {
    let mut defaulted: Vec<String> = Vec::new();
    let mut fill = |text: &str| -> String {
        let mut out = String::with_capacity(text.len());
        for segment in segments(text) {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Blank => {}
                Segment::Placeholder(name) => match values.get(name) {
                    Some(Some(value)) => out.push_str(value),
                    _ => {
                        if !defaulted.iter().any(|d| d == name) {
                            defaulted.push(name.to_string());
                        }
                        out.push_str(default_for(name));
                    }
                },
            }
        }
        out
    };

    let subject = fill(&template.subject);
    let body = fill(&template.body);
    RenderedMessage {
        subject,
        body,
        used_alternate: false,
        defaulted,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
    /// `{ }`: braces around whitespace only, rendered as nothing.
    Blank,
}

fn segments(text: &str) -> Vec<Segment<'_>> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let Some(offset) = text[i + 1..].find(['{', '}']) else {
            break;
        };
        let close = i + 1 + offset;
        if bytes[close] == b'}' && close > i + 1 {
            if literal_start < i {
                out.push(Segment::Literal(&text[literal_start..i]));
            }
            let name = text[i + 1..close].trim();
            out.push(if name.is_empty() {
                Segment::Blank
            } else {
                Segment::Placeholder(name)
            });
            i = close + 1;
            literal_start = i;
            continue;
        }
        // Nested `{` restarts the scan there; `{}` stays literal.
        i = close;
    }

    if literal_start < text.len() {
        out.push(Segment::Literal(&text[literal_start..]));
    }
    out
}
