//! Error types for Inbox Assist.

use std::time::Duration;

use uuid::Uuid;

use crate::review::model::EmailStatus;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mail transport errors (IMAP retrieval and SMTP submission).
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Failed to connect to {server}: {reason}")]
    Connect { server: String, reason: String },

    #[error("Authentication failed for {server}: {reason}")]
    AuthFailed { server: String, reason: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Failed to parse message {uid}: {reason}")]
    Parse { uid: u32, reason: String },

    #[error("Failed to send email to {to}: {reason}")]
    SendFailed { to: String, reason: String },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Mail health check failed: {name}")]
    HealthCheckFailed { name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Review workflow errors.
///
/// Everything except `Drafting`, `Transport` and `Store` is a validation
/// failure and leaves the record untouched.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Email {id} not found")]
    NotFound { id: Uuid },

    #[error("Email {id} is {from}, cannot move to {to}")]
    InvalidTransition {
        id: Uuid,
        from: EmailStatus,
        to: EmailStatus,
    },

    #[error("Email {id} has already been sent and can no longer change")]
    AlreadySent { id: Uuid },

    #[error("Email {id} is {status}; only approved emails can be sent")]
    NotApproved { id: Uuid, status: EmailStatus },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Draft generation failed: {0}")]
    Drafting(#[from] LlmError),

    #[error("Mail transport failed: {0}")]
    Transport(#[from] MailError),

    #[error("Storage failed: {0}")]
    Store(#[from] DatabaseError),
}

impl WorkflowError {
    /// True for errors caused by the request rather than a collaborator.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. }
                | Self::AlreadySent { .. }
                | Self::NotApproved { .. }
                | Self::Validation(_)
        )
    }
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Mail fetch failed: {0}")]
    Fetch(#[from] MailError),

    #[error("Persisting email failed: {0}")]
    Persist(#[from] DatabaseError),
}
