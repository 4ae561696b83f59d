//! SMTP submission via lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use super::{Encryption, MailSender, OutgoingEmail};
use crate::error::MailError;

/// SMTP connection settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub encryption: Encryption,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub timeout: Duration,
}

/// [`MailSender`] that submits through an authenticated SMTP relay.
pub struct SmtpSender {
    config: SmtpConfig,
}

impl SmtpSender {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn transport(&self) -> Result<SmtpTransport, MailError> {
        let relay_err = |e: lettre::transport::smtp::Error| MailError::Connect {
            server: format!("{}:{}", self.config.host, self.config.port),
            reason: format!("SMTP relay error: {e}"),
        };

        let builder = match self.config.encryption {
            Encryption::Tls => SmtpTransport::relay(&self.config.host).map_err(relay_err)?,
            Encryption::StartTls => {
                SmtpTransport::starttls_relay(&self.config.host).map_err(relay_err)?
            }
            Encryption::None => SmtpTransport::builder_dangerous(&self.config.host),
        };

        let mut builder = builder
            .port(self.config.port)
            .timeout(Some(self.config.timeout));
        if !self.config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.config.username.clone(),
                self.config.password.expose_secret().to_string(),
            ));
        }
        Ok(builder.build())
    }
}

/// Build the RFC 5322 message for an outgoing reply.
pub fn build_message(from: &str, email: &OutgoingEmail) -> Result<Message, MailError> {
    let from: Mailbox = from.parse().map_err(|e| MailError::InvalidAddress {
        address: from.to_string(),
        reason: format!("{e}"),
    })?;
    let to: Mailbox = email.to.parse().map_err(|e| MailError::InvalidAddress {
        address: email.to.clone(),
        reason: format!("{e}"),
    })?;

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(email.subject.clone());
    if let Some(parent) = email.in_reply_to.as_deref().filter(|id| !id.is_empty()) {
        let parent = angle_bracketed(parent);
        builder = builder.in_reply_to(parent.clone()).references(parent);
    }

    builder
        .body(email.body.clone())
        .map_err(|e| MailError::SendFailed {
            to: email.to.clone(),
            reason: format!("Failed to build email: {e}"),
        })
}

fn angle_bracketed(id: &str) -> String {
    let id = id.trim();
    if id.starts_with('<') && id.ends_with('>') {
        id.to_string()
    } else {
        format!("<{id}>")
    }
}

#[async_trait]
impl MailSender for SmtpSender {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        let message = build_message(&self.config.from_address, email)?;
        let transport = self.transport()?;
        let to = email.to.clone();

        let result = tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| MailError::SendFailed {
                to: to.clone(),
                reason: format!("send task failed: {e}"),
            })?;

        result.map_err(|e| MailError::SendFailed {
            to: to.clone(),
            reason: format!("SMTP send failed: {e}"),
        })?;

        info!(to = %to, subject = %email.subject, "Email sent");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), MailError> {
        super::probe_tcp("smtp", &self.config.host, self.config.port, self.config.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(in_reply_to: Option<&str>) -> OutgoingEmail {
        OutgoingEmail {
            to: "alice@example.com".into(),
            subject: "Re: Lunch".into(),
            body: "Tuesday works for me.".into(),
            in_reply_to: in_reply_to.map(String::from),
        }
    }

    fn render(message: &Message) -> String {
        String::from_utf8(message.formatted()).unwrap()
    }

    #[test]
    fn message_carries_threading_headers() {
        let message = build_message("me@example.com", &reply(Some("abc123@example.com"))).unwrap();
        let text = render(&message);
        assert!(text.contains("In-Reply-To: <abc123@example.com>"));
        assert!(text.contains("References: <abc123@example.com>"));
        assert!(text.contains("Subject: Re: Lunch"));
        assert!(text.contains("Tuesday works for me."));
    }

    #[test]
    fn message_without_parent_has_no_threading() {
        let message = build_message("me@example.com", &reply(None)).unwrap();
        let text = render(&message);
        assert!(!text.contains("In-Reply-To"));
    }

    #[test]
    fn invalid_recipient_is_rejected() {
        let mut email = reply(None);
        email.to = "not an address".into();
        let err = build_message("me@example.com", &email).unwrap_err();
        assert!(matches!(err, MailError::InvalidAddress { .. }));
    }

    #[test]
    fn bracketing_is_idempotent() {
        assert_eq!(angle_bracketed("x@y"), "<x@y>");
        assert_eq!(angle_bracketed("<x@y>"), "<x@y>");
    }

    #[tokio::test]
    async fn send_to_unreachable_relay_fails_without_panicking() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let sender = SmtpSender::new(SmtpConfig {
            host: "127.0.0.1".into(),
            port,
            encryption: Encryption::None,
            username: String::new(),
            password: SecretString::from(""),
            from_address: "me@example.com".into(),
            timeout: Duration::from_secs(2),
        });
        let err = sender.send(&reply(None)).await.unwrap_err();
        assert!(matches!(err, MailError::SendFailed { .. }));
    }
}
