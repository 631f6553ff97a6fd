use super::{Attachment, Mailer, build_mime_message};
use anyhow::{Context, Result};
use aws_sdk_sesv2::Client;
use aws_sdk_sesv2::primitives::Blob;
use aws_sdk_sesv2::types::{Destination, EmailContent, RawMessage};
use email_address::EmailAddress;
use lettre::message::Mailbox;
use tracing::info;

// ============================================================================
// SesMailer — SES v2 raw-message implementation
// ============================================================================

/// Sends the same MIME message the Gmail path builds, as SES raw content, so
/// attachments and Reply-To travel in the message itself.
pub struct SesMailer {
    ses_client: Client,
    from: Mailbox,
    reply_to: Option<Mailbox>,
    configuration_set: Option<String>,
}

impl SesMailer {
    pub fn new(ses_client: Client, from: Mailbox) -> Self {
        Self {
            ses_client,
            from,
            reply_to: None,
            configuration_set: None,
        }
    }

    pub fn with_reply_to(mut self, reply_to: Option<Mailbox>) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn with_configuration_set(mut self, configuration_set: Option<String>) -> Self {
        self.configuration_set = configuration_set;
        self
    }
}

impl Mailer for SesMailer {
    async fn send_email(
        &self,
        recipient: &EmailAddress,
        subject: &str,
        html_content: &str,
        text_content: &str,
        attachments: &[Attachment],
    ) -> Result<()> {
        let message = build_mime_message(
            &self.from,
            self.reply_to.as_ref(),
            recipient,
            subject,
            html_content,
            text_content,
            attachments,
        )?;
        let raw = RawMessage::builder()
            .data(Blob::new(message.formatted()))
            .build()
            .context("Failed to build SES raw message")?;

        let response = self
            .ses_client
            .send_email()
            .from_email_address(self.from.to_string())
            .destination(
                Destination::builder()
                    .to_addresses(recipient.to_string())
                    .build(),
            )
            .content(EmailContent::builder().raw(raw).build())
            .set_configuration_set_name(self.configuration_set.clone())
            .send()
            .await
            .with_context(|| format!("SES rejected message to {}", recipient))?;

        info!(
            message_id = ?response.message_id(),
            attachments = attachments.len(),
            "Email sent via SES"
        );
        Ok(())
    }
}
