//! `Database` trait: the single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::review::model::{EmailRecord, EmailStatus, StatusCounts, Tone};

/// One LLM call to be recorded for spend tracking.
#[derive(Debug, Clone)]
pub struct LlmCallRecord<'a> {
    pub email_id: Option<Uuid>,
    pub provider: &'a str,
    pub model: &'a str,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: Decimal,
    pub purpose: &'a str,
}

/// Aggregated LLM spend.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct LlmCostSummary {
    pub total_cost: Decimal,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub call_count: u64,
}

/// Backend-agnostic database trait.
///
/// Status-changing writes carry their precondition in the `WHERE` clause and
/// report whether a row matched, so a write can never resurrect a sent record
/// even if the caller's view of it is stale.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Round-trip a trivial query.
    async fn ping(&self) -> Result<(), DatabaseError>;

    // ── Emails ──────────────────────────────────────────────────────

    /// Insert a new record. A duplicate `message_id` is `DatabaseError::Constraint`.
    async fn insert_email(&self, record: &EmailRecord) -> Result<(), DatabaseError>;

    async fn get_email(&self, id: Uuid) -> Result<Option<EmailRecord>, DatabaseError>;

    async fn get_email_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<EmailRecord>, DatabaseError>;

    /// Newest first, optionally filtered by status.
    async fn list_emails(
        &self,
        status: Option<EmailStatus>,
        limit: usize,
    ) -> Result<Vec<EmailRecord>, DatabaseError>;

    /// Overwrite draft, tone and status of an unsent record.
    ///
    /// Returns `false` if the record is missing or already sent.
    async fn update_review(
        &self,
        id: Uuid,
        draft_reply: &str,
        tone: &Tone,
        status: EmailStatus,
    ) -> Result<bool, DatabaseError>;

    /// Move an approved record to sent.
    ///
    /// Returns `false` if the record is missing or not approved.
    async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<bool, DatabaseError>;

    async fn count_by_status(&self) -> Result<StatusCounts, DatabaseError>;

    /// Records created at or after `since`.
    async fn count_created_since(&self, since: DateTime<Utc>) -> Result<u64, DatabaseError>;

    // ── LLM Call Tracking ───────────────────────────────────────────

    async fn record_llm_call(&self, record: &LlmCallRecord<'_>) -> Result<Uuid, DatabaseError>;

    async fn get_total_spend(&self) -> Result<LlmCostSummary, DatabaseError>;
}
