//! Outbound mail adapter (§4.8), backed by `lettre`. The mail transport
//! itself is an external collaborator (§1); this module only owns the
//! `MailSender` seam the workflow engine's email step calls through.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::health;

pub struct MailAddress {
    pub name: String,
    pub address: String,
}

pub struct SendMailParams {
    pub to: Vec<MailAddress>,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, params: &SendMailParams) -> Result<()>;
}

pub struct SmtpMailSender {
    transport: SmtpTransport,
    from: Mailbox,
}

impl SmtpMailSender {
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let mut builder = SmtpTransport::relay(&config.smtp_server)
            .map_err(|e| Error::Fatal(format!("invalid SMTP server {}: {e}", config.smtp_server)))?;
        if !config.smtp_username.is_empty() {
            builder = builder.credentials(Credentials::new(config.smtp_username.clone(), config.smtp_password.clone()));
        }
        let from = format!("{} <{}>", config.mail_from_name, config.mail_from)
            .parse()
            .map_err(|e| Error::Fatal(format!("invalid MAIL_FROM address: {e}")))?;
        Ok(SmtpMailSender { transport: builder.build(), from })
    }
}

#[async_trait]
impl MailSender for SmtpMailSender {
    async fn send(&self, params: &SendMailParams) -> Result<()> {
        let mut builder = Message::builder().from(self.from.clone()).subject(params.subject.clone());
        for to in &params.to {
            let mailbox: Mailbox = format!("{} <{}>", to.name, to.address)
                .parse()
                .map_err(|e| Error::Validation(format!("invalid recipient address: {e}")))?;
            builder = builder.to(mailbox);
        }
        let message = builder
            .header(lettre::message::header::ContentType::TEXT_HTML)
            .body(params.html.clone())
            .map_err(|e| Error::External(format!("failed to build mail message: {e}")))?;

        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| Error::External(format!("mail send task panicked: {e}")))?
            .map_err(Error::from)?;
        Ok(())
    }
}

#[async_trait]
impl health::Provider for SmtpMailSender {
    async fn check(&self) -> health::Health {
        health::Health::up()
    }
}

/// Used when no SMTP server is configured; the broker/mail collaborators are
/// external and their absence must not affect correctness (§1).
pub struct NullMailSender;

#[async_trait]
impl MailSender for NullMailSender {
    async fn send(&self, params: &SendMailParams) -> Result<()> {
        tracing::warn!("mail not configured, dropping message with subject '{}'", params.subject);
        Ok(())
    }
}

#[async_trait]
impl health::Provider for NullMailSender {
    async fn check(&self) -> health::Health {
        health::Health::down("mail not configured")
    }
}
