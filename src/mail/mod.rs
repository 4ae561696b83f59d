//! Mail transport: IMAP retrieval of unread messages and SMTP submission of replies.
//!
//! The pipeline and review workflow only see the [`MailFetcher`] and
//! [`MailSender`] traits; `imap` and `smtp` provide the network-backed
//! implementations.

pub mod imap;
pub mod parse;
pub mod smtp;

pub use imap::ImapFetcher;
pub use smtp::SmtpSender;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MailError;

/// Transport security for a mail connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encryption {
    /// TLS from the first byte (IMAPS 993, SMTPS 465).
    Tls,
    /// Plaintext greeting upgraded with STARTTLS.
    StartTls,
    /// No encryption. Only for local relays and tests.
    None,
}

impl std::str::FromStr for Encryption {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tls" | "ssl" => Ok(Self::Tls),
            "starttls" => Ok(Self::StartTls),
            "none" | "plain" => Ok(Self::None),
            other => Err(format!("Unknown encryption mode: {}", other)),
        }
    }
}

impl std::fmt::Display for Encryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tls => write!(f, "tls"),
            Self::StartTls => write!(f, "starttls"),
            Self::None => write!(f, "none"),
        }
    }
}

/// An unread message pulled from the mailbox, parsed into plain text.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedEmail {
    /// IMAP UID within the selected mailbox.
    pub uid: u32,
    pub message_id: String,
    pub sender: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// One fetch attempt: parsed messages plus the UIDs that could not be parsed.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub emails: Vec<FetchedEmail>,
    pub failed_uids: Vec<u32>,
}

/// A reply ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// `Message-ID` of the message being answered, for threading headers.
    pub in_reply_to: Option<String>,
}

/// Source of unread mail.
#[async_trait]
pub trait MailFetcher: Send + Sync {
    /// Fetch up to `limit` unread messages without setting `\Seen`.
    async fn fetch_unread(&self, limit: usize) -> Result<FetchBatch, MailError>;

    /// Flag the given UIDs as seen.
    async fn mark_seen(&self, uids: &[u32]) -> Result<(), MailError>;

    /// Cheap reachability probe.
    async fn health_check(&self) -> Result<(), MailError>;
}

/// Outbound mail submission.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError>;

    async fn health_check(&self) -> Result<(), MailError>;
}

/// Open a TCP connection to `host:port` within `timeout`, for health probes.
pub(crate) async fn probe_tcp(
    name: &str,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<(), MailError> {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            tracing::debug!(server = %host, error = %e, "Mail probe failed");
            Err(MailError::HealthCheckFailed { name: name.into() })
        }
        Err(_) => Err(MailError::HealthCheckFailed { name: name.into() }),
    }
}
