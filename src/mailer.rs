use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;

use crate::config::SmtpConfig;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("invalid attachment: {0}")]
    Attachment(String),
    #[error("failed to render template: {0}")]
    Template(#[from] handlebars::RenderError),
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Email {
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
    pub attachment: Option<Attachment>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: Email) -> Result<(), MailError>;
}

/// Sends `email` in the background. The caller never waits for delivery and
/// failures are only logged.
pub fn dispatch(mailer: Arc<dyn Mailer>, email: Email) {
    actix_web::rt::spawn(async move {
        let subject = email.subject.clone();
        if let Err(e) = mailer.send(email).await {
            log::error!("Failed to send \"{}\": {}", subject, e);
        }
    });
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port);
        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
        Ok(SmtpMailer {
            transport: builder.build(),
            from: config.from.parse()?,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: Email) -> Result<(), MailError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(email.subject);
        for to in &email.to {
            builder = builder.to(to.parse()?);
        }

        let html = SinglePart::html(email.html);
        let message = match email.attachment {
            Some(attachment) => {
                let content_type = ContentType::parse(&attachment.content_type)
                    .map_err(|e| MailError::Attachment(e.to_string()))?;
                let part = MailAttachment::new(attachment.filename).body(attachment.content, content_type);
                builder.multipart(MultiPart::mixed().singlepart(html).singlepart(part))?
            }
            None => builder.singlepart(html)?,
        };

        self.transport.send(message).await?;
        Ok(())
    }
}

/// Writes mail to the log instead of delivering it; used when no SMTP
/// relay is configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: Email) -> Result<(), MailError> {
        log::info!(
            "Mail to {} - {}{}",
            email.to.join(", "),
            email.subject,
            email
                .attachment
                .as_ref()
                .map(|a| format!(" [{} bytes attached as {}]", a.content.len(), a.filename))
                .unwrap_or_default()
        );
        Ok(())
    }
}
