use anyhow::{Context, Result, anyhow};
use askama::Template;
use email_address::EmailAddress;
use lettre::Message;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

pub mod gmail;
pub mod ses;
pub use gmail::GmailMailer;
pub use ses::SesMailer;

// ============================================================================
// Email template (used by the default `send` implementation)
// ============================================================================

/// HTML alternative of a plain-text body: one `<br>` per line break, with the
/// sender's signature appended in a bordered block.
#[derive(Template)]
#[template(path = "message.html")]
struct HtmlBodyTemplate<'a> {
    lines: Vec<&'a str>,
    signature: Option<&'a str>,
}

pub fn render_html_body(text: &str, signature: Option<&str>) -> Result<String> {
    HtmlBodyTemplate {
        lines: text.lines().collect(),
        signature: signature.filter(|s| !s.trim().is_empty()),
    }
    .render()
    .context("Failed to render HTML body")
}

// ============================================================================
// Attachments and MIME assembly
// ============================================================================

/// A file sent with every message of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
        }
    }

    /// Read a file, guessing its content type from the extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read attachment {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("Attachment path has no file name: {}", path.display()))?;
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        debug!(filename = %filename, content_type = %content_type, bytes = data.len(), "Loaded attachment");
        Ok(Self::new(filename, content_type, data))
    }
}

/// RFC 5322 message: `multipart/alternative` text and HTML, wrapped in
/// `multipart/mixed` when there are attachments.
pub(crate) fn build_mime_message(
    from: &Mailbox,
    reply_to: Option<&Mailbox>,
    recipient: &EmailAddress,
    subject: &str,
    html_content: &str,
    text_content: &str,
    attachments: &[Attachment],
) -> Result<Message> {
    let to: Mailbox = recipient
        .as_str()
        .parse()
        .with_context(|| format!("Invalid recipient address: {}", recipient))?;

    let mut builder = Message::builder()
        .from(from.clone())
        .to(to)
        .subject(subject);
    if let Some(reply_to) = reply_to {
        builder = builder.reply_to(reply_to.clone());
    }

    let body = MultiPart::alternative_plain_html(text_content.to_string(), html_content.to_string());
    let message = if attachments.is_empty() {
        builder.multipart(body)
    } else {
        let mut mixed = MultiPart::mixed().multipart(body);
        for attachment in attachments {
            let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                anyhow!(
                    "Invalid content type {} for {}: {}",
                    attachment.content_type,
                    attachment.filename,
                    e
                )
            })?;
            mixed = mixed.singlepart(
                lettre::message::Attachment::new(attachment.filename.clone())
                    .body(attachment.data.clone(), content_type),
            );
        }
        builder.multipart(mixed)
    };

    message.context("Failed to build MIME message")
}

// ============================================================================
// Mailer trait
// ============================================================================

/// Core email-sending primitive. Implementations handle the transport:
/// request construction and credentials.
#[allow(async_fn_in_trait)]
pub trait Mailer: Send + Sync {
    async fn send_email(
        &self,
        recipient: &EmailAddress,
        subject: &str,
        html_content: &str,
        text_content: &str,
        attachments: &[Attachment],
    ) -> Result<()>;

    /// HTML signature appended to every message, if any.
    fn signature(&self) -> Option<&str> {
        None
    }

    /// Send a plain-text message. The HTML part is derived from the text.
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        attachments: &[Attachment],
    ) -> Result<()> {
        let recipient =
            EmailAddress::from_str(to).with_context(|| format!("Invalid recipient address: {}", to))?;
        let html = render_html_body(body, self.signature())?;
        self.send_email(&recipient, subject, &html, body, attachments)
            .await
    }
}

// ============================================================================
// Test utilities
// ============================================================================

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub(crate) struct SentEmail {
        pub to: String,
        pub subject: String,
        pub text: String,
        pub html: String,
        pub attachments: Vec<String>,
    }

    #[derive(Default)]
    pub(crate) struct FakeMailer {
        pub sent: Mutex<Vec<SentEmail>>,
        failing: HashSet<String>,
        signature: Option<String>,
    }

    impl FakeMailer {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Reject every send to this address.
        pub(crate) fn failing_for(mut self, email: &str) -> Self {
            self.failing.insert(email.to_lowercase());
            self
        }

        pub(crate) fn with_signature(mut self, signature: &str) -> Self {
            self.signature = Some(signature.to_string());
            self
        }

        pub(crate) fn call_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        pub(crate) fn recipients(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|m| m.to.clone())
                .collect()
        }
    }

    impl Mailer for FakeMailer {
        async fn send_email(
            &self,
            recipient: &EmailAddress,
            subject: &str,
            html_content: &str,
            text_content: &str,
            attachments: &[Attachment],
        ) -> Result<()> {
            let to = recipient.to_string().to_lowercase();
            self.sent.lock().unwrap().push(SentEmail {
                to: to.clone(),
                subject: subject.to_string(),
                text: text_content.to_string(),
                html: html_content.to_string(),
                attachments: attachments.iter().map(|a| a.filename.clone()).collect(),
            });
            if self.failing.contains(&to) {
                anyhow::bail!("550 mailbox unavailable: {}", to);
            }
            Ok(())
        }

        fn signature(&self) -> Option<&str> {
            self.signature.as_deref()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::FakeMailer;
    use super::*;

    #[test]
    fn html_body_breaks_lines_and_escapes() {
        let html = render_html_body("Hi <Ann>,\nsee you & soon", None).unwrap();
        assert!(html.contains(",<br>see you"));
        assert!(!html.contains("<Ann>"));
        assert!(!html.contains("border-top"));
    }

    #[test]
    fn html_body_appends_signature_unescaped() {
        let html = render_html_body("Hello", Some("<b>Kim</b>")).unwrap();
        assert!(html.starts_with("Hello"));
        assert!(html.contains("<br><br><div"));
        assert!(html.contains("<b>Kim</b></div>"));
    }

    #[test]
    fn blank_signature_is_ignored() {
        let html = render_html_body("Hello", Some("   ")).unwrap();
        assert!(!html.contains("<div"));
    }

    #[tokio::test]
    async fn send_derives_html_and_uses_signature() {
        let mailer = FakeMailer::new().with_signature("<i>sig</i>");
        mailer
            .send("Ann@Example.com", "Subject", "line one\nline two", &[])
            .await
            .unwrap();

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent[0].to, "ann@example.com");
        assert_eq!(sent[0].text, "line one\nline two");
        assert!(sent[0].html.contains("line one<br>line two"));
        assert!(sent[0].html.contains("<i>sig</i>"));
    }

    #[tokio::test]
    async fn send_passes_attachments_through() {
        let mailer = FakeMailer::new();
        let brochure = Attachment::new("brochure.pdf", "application/pdf", b"%PDF".to_vec());
        mailer
            .send("ann@example.com", "s", "b", &[brochure])
            .await
            .unwrap();
        assert_eq!(mailer.sent.lock().unwrap()[0].attachments, vec!["brochure.pdf"]);
    }

    #[test]
    fn attachment_type_is_guessed_from_extension() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("deck.pdf");
        std::fs::write(&pdf, b"%PDF-1.4").unwrap();
        let unknown = dir.path().join("blob.zzunknown");
        std::fs::write(&unknown, b"x").unwrap();

        let attachment = Attachment::from_path(&pdf).unwrap();
        assert_eq!(attachment.filename, "deck.pdf");
        assert_eq!(attachment.content_type, "application/pdf");
        assert_eq!(attachment.data, b"%PDF-1.4");
        assert_eq!(
            Attachment::from_path(&unknown).unwrap().content_type,
            "application/octet-stream"
        );
        assert!(Attachment::from_path(dir.path().join("missing.pdf")).is_err());
    }

    #[tokio::test]
    async fn send_rejects_invalid_address() {
        let mailer = FakeMailer::new();
        let err = mailer.send("not-an-email", "s", "b", &[]).await.unwrap_err();
        assert!(err.to_string().contains("Invalid recipient address"));
        assert_eq!(mailer.call_count(), 0);
    }
}
