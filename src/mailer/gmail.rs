use super::{Attachment, Mailer, build_mime_message};
use crate::google_auth::GoogleTokenSource;
use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use email_address::EmailAddress;
use lettre::message::Mailbox;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

const GMAIL_API: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

// ============================================================================
// GmailMailer — Gmail API implementation
// ============================================================================

pub struct GmailMailer {
    http_client: reqwest::Client,
    tokens: Arc<GoogleTokenSource>,
    from: Mailbox,
    reply_to: Option<Mailbox>,
    signature: Option<String>,
}

#[derive(Deserialize)]
struct SendResponse {
    id: Option<String>,
}

#[derive(Deserialize)]
struct SendAs {
    #[serde(default)]
    signature: String,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    code: u16,
    message: String,
}

impl GmailMailer {
    pub fn new(http_client: reqwest::Client, tokens: Arc<GoogleTokenSource>, from: Mailbox) -> Self {
        Self {
            http_client,
            tokens,
            from,
            reply_to: None,
            signature: None,
        }
    }

    pub fn with_reply_to(mut self, reply_to: Option<Mailbox>) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn with_signature(mut self, signature: Option<String>) -> Self {
        self.signature = signature.filter(|s| !s.trim().is_empty());
        self
    }

    /// The HTML signature configured for the sender's address in Gmail settings.
    pub async fn fetch_signature(&self) -> Result<Option<String>> {
        let token = self.tokens.access_token().await?;
        let url = format!(
            "{}/settings/sendAs/{}",
            GMAIL_API,
            urlencoding::encode(&self.from.email.to_string())
        );
        let response = self
            .http_client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .context("Failed to fetch Gmail signature")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Failed to fetch Gmail signature: {}", describe_api_error(status, &body));
        }
        let send_as: SendAs = response
            .json()
            .await
            .context("Invalid sendAs response")?;
        Ok(Some(send_as.signature).filter(|s| !s.trim().is_empty()))
    }

    /// Load the Gmail signature, logging and continuing without one on failure.
    pub async fn with_fetched_signature(self) -> Self {
        match self.fetch_signature().await {
            Ok(signature) => self.with_signature(signature),
            Err(e) => {
                warn!(error = %e, "Could not load Gmail signature — sending without one");
                self
            }
        }
    }
}

impl Mailer for GmailMailer {
    async fn send_email(
        &self,
        recipient: &EmailAddress,
        subject: &str,
        html_content: &str,
        text_content: &str,
        attachments: &[Attachment],
    ) -> Result<()> {
        let raw = build_raw_message(
            &self.from,
            self.reply_to.as_ref(),
            recipient,
            subject,
            html_content,
            text_content,
            attachments,
        )?;

        let token = self.tokens.access_token().await?;
        let response = self
            .http_client
            .post(format!("{}/messages/send", GMAIL_API))
            .bearer_auth(token)
            .json(&json!({ "raw": raw }))
            .send()
            .await
            .context(format!("Failed to send email to {}", recipient))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Gmail rejected message: {}", describe_api_error(status, &body));
        }

        let sent: SendResponse = response
            .json()
            .await
            .context("Invalid Gmail send response")?;

        info!(
            message_id = ?sent.id,
            recipient = %recipient,
            "Email sent"
        );

        Ok(())
    }

    fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// The MIME message base64url-encoded for the Gmail `raw` field.
pub(crate) fn build_raw_message(
    from: &Mailbox,
    reply_to: Option<&Mailbox>,
    recipient: &EmailAddress,
    subject: &str,
    html_content: &str,
    text_content: &str,
    attachments: &[Attachment],
) -> Result<String> {
    let message = build_mime_message(
        from,
        reply_to,
        recipient,
        subject,
        html_content,
        text_content,
        attachments,
    )?;
    Ok(URL_SAFE.encode(message.formatted()))
}

fn describe_api_error(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(resp) => format!("{} {}", resp.error.code, resp.error.message),
        Err(_) if body.is_empty() => status.to_string(),
        Err(_) => format!("{} {}", status, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn decode(raw: &str) -> String {
        String::from_utf8(URL_SAFE.decode(raw).unwrap()).unwrap()
    }

    #[test]
    fn raw_message_has_headers_and_both_parts() {
        let from: Mailbox = "Kim <kim@example.com>".parse().unwrap();
        let recipient = EmailAddress::from_str("ann@example.com").unwrap();
        let raw = build_raw_message(
            &from,
            None,
            &recipient,
            "Hello Ann",
            "<p>Hi</p>",
            "Hi",
            &[],
        )
        .unwrap();

        assert!(!raw.contains('+') && !raw.contains('/'));
        let message = decode(&raw);
        assert!(message.contains("To: ann@example.com"));
        assert!(message.contains("Subject: Hello Ann"));
        assert!(message.contains("multipart/alternative"));
        assert!(message.contains("text/plain"));
        assert!(message.contains("text/html"));
        assert!(!message.contains("multipart/mixed"));
        assert!(!message.contains("Reply-To"));
    }

    #[test]
    fn raw_message_carries_attachments_in_mixed_part() {
        let from: Mailbox = "kim@example.com".parse().unwrap();
        let recipient = EmailAddress::from_str("ann@example.com").unwrap();
        let attachments = [
            Attachment::new("notes.txt", "text/plain", b"hello attachment".to_vec()),
            Attachment::new("deck.pdf", "application/pdf", vec![0x25, 0x50, 0x44, 0x46, 0x00, 0xff]),
        ];
        let raw = build_raw_message(
            &from,
            None,
            &recipient,
            "Deck",
            "<p>See attached</p>",
            "See attached",
            &attachments,
        )
        .unwrap();

        let message = decode(&raw);
        assert!(message.contains("multipart/mixed"));
        assert!(message.contains("multipart/alternative"));
        assert!(message.contains("Content-Disposition: attachment"));
        assert!(message.contains("filename=\"notes.txt\""));
        assert!(message.contains("filename=\"deck.pdf\""));
        assert!(message.contains("application/pdf"));
        assert!(
            message.contains("hello attachment")
                || message.contains(&base64::engine::general_purpose::STANDARD.encode("hello attachment"))
        );
    }

    #[test]
    fn invalid_attachment_type_is_rejected() {
        let from: Mailbox = "kim@example.com".parse().unwrap();
        let recipient = EmailAddress::from_str("ann@example.com").unwrap();
        let bad = [Attachment::new("x.bin", "not a type", vec![1])];
        let err = build_raw_message(&from, None, &recipient, "s", "h", "t", &bad).unwrap_err();
        assert!(err.to_string().contains("Invalid content type"));
    }

    #[test]
    fn raw_message_includes_reply_to() {
        let from: Mailbox = "kim@example.com".parse().unwrap();
        let reply_to: Mailbox = "replies@example.com".parse().unwrap();
        let recipient = EmailAddress::from_str("ann@example.com").unwrap();
        let raw =
            build_raw_message(&from, Some(&reply_to), &recipient, "s", "h", "t", &[]).unwrap();
        assert!(decode(&raw).contains("Reply-To: replies@example.com"));
    }

    #[test]
    fn api_errors_are_summarised() {
        let body = r#"{"error": {"code": 429, "message": "User-rate limit exceeded", "status": "RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(
            describe_api_error(reqwest::StatusCode::TOO_MANY_REQUESTS, body),
            "429 User-rate limit exceeded"
        );
        assert_eq!(
            describe_api_error(reqwest::StatusCode::BAD_GATEWAY, ""),
            "502 Bad Gateway"
        );
    }
}
