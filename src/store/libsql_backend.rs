//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::review::model::{EmailRecord, EmailStatus, Intent, StatusCounts, Tone};
use crate::store::migrations;
use crate::store::traits::{Database, LlmCallRecord, LlmCostSummary};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

/// Map a libsql Row to an EmailRecord.
///
/// Column order matches EMAIL_COLUMNS. An unknown status is an error so a
/// row we can't place in the state machine is never acted on.
fn row_to_email(row: &libsql::Row) -> Result<EmailRecord, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Serialization(format!("email row: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("email id {id_str}: {e}")))?;
    let status_str: String = row.get(11).map_err(get_err)?;
    let status: EmailStatus = status_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("email {id}: {e}")))?;

    let received_str: String = row.get(6).map_err(get_err)?;
    let sent_str: Option<String> = row.get(12).ok();
    let created_str: String = row.get(13).map_err(get_err)?;
    let updated_str: String = row.get(14).map_err(get_err)?;

    Ok(EmailRecord {
        id,
        message_id: row.get(1).map_err(get_err)?,
        sender: row.get(2).map_err(get_err)?,
        sender_name: row.get(3).ok(),
        subject: row.get(4).map_err(get_err)?,
        body: row.get(5).map_err(get_err)?,
        received_at: parse_datetime(&received_str),
        intent: Intent::from(row.get::<String>(7).map_err(get_err)?),
        summary: row.get(8).ok(),
        draft_reply: row.get(9).map_err(get_err)?,
        tone: Tone::from(row.get::<String>(10).map_err(get_err)?),
        status,
        sent_at: parse_optional_datetime(&sent_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

async fn collect_emails(rows: &mut libsql::Rows) -> Vec<EmailRecord> {
    let mut emails = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        match row_to_email(&row) {
            Ok(email) => emails.push(email),
            Err(e) => {
                tracing::warn!("Skipping email row: {e}");
            }
        }
    }
    emails
}

async fn parse_cost_summary_row(rows: &mut libsql::Rows) -> Result<LlmCostSummary, DatabaseError> {
    use rust_decimal::Decimal;
    use std::str::FromStr;

    match rows.next().await {
        Ok(Some(row)) => {
            // TOTAL() always returns f64 in SQLite/libsql
            let cost_f64: f64 = row.get(0).unwrap_or(0.0);
            let total_cost = Decimal::from_str(&format!("{cost_f64:.10}"))
                .map(|d| d.normalize())
                .unwrap_or(Decimal::ZERO);
            let input_tokens: f64 = row.get(1).unwrap_or(0.0);
            let output_tokens: f64 = row.get(2).unwrap_or(0.0);
            let call_count = row.get::<i64>(3).unwrap_or(0);

            Ok(LlmCostSummary {
                total_cost,
                total_input_tokens: input_tokens as u64,
                total_output_tokens: output_tokens as u64,
                call_count: call_count as u64,
            })
        }
        _ => Ok(LlmCostSummary::default()),
    }
}

// ── Trait implementation ────────────────────────────────────────────

const EMAIL_COLUMNS: &str = "id, message_id, sender, sender_name, subject, body, received_at, intent, summary, draft_reply, tone, status, sent_at, created_at, updated_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT 1", ())
            .await
            .map_err(query_err("ping"))?;
        rows.next().await.map_err(query_err("ping"))?;
        Ok(())
    }

    // ── Emails ──────────────────────────────────────────────────────

    async fn insert_email(&self, record: &EmailRecord) -> Result<(), DatabaseError> {
        let result = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO emails ({EMAIL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    record.id.to_string(),
                    record.message_id.as_str(),
                    record.sender.as_str(),
                    opt_text(record.sender_name.as_deref()),
                    record.subject.as_str(),
                    record.body.as_str(),
                    record.received_at.to_rfc3339(),
                    record.intent.label(),
                    opt_text(record.summary.as_deref()),
                    record.draft_reply.as_str(),
                    record.tone.label(),
                    record.status.as_str(),
                    opt_text(record.sent_at.map(|t| t.to_rfc3339()).as_deref()),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .await;

        match result {
            Ok(_) => {
                debug!(email_id = %record.id, message_id = %record.message_id, "Email inserted into DB");
                Ok(())
            }
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => Err(
                DatabaseError::Constraint(format!("duplicate message_id {}", record.message_id)),
            ),
            Err(e) => Err(DatabaseError::Query(format!("insert_email: {e}"))),
        }
    }

    async fn get_email(&self, id: Uuid) -> Result<Option<EmailRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_email"))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_email(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_email: {e}"))),
        }
    }

    async fn get_email_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<EmailRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(query_err("get_email_by_message_id"))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_email(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_email_by_message_id: {e}"))),
        }
    }

    async fn list_emails(
        &self,
        status: Option<EmailStatus>,
        limit: usize,
    ) -> Result<Vec<EmailRecord>, DatabaseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = match status {
            Some(status) => self
                .conn()
                .query(
                    &format!(
                        "SELECT {EMAIL_COLUMNS} FROM emails WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2"
                    ),
                    params![status.as_str(), limit],
                )
                .await
                .map_err(query_err("list_emails"))?,
            None => self
                .conn()
                .query(
                    &format!("SELECT {EMAIL_COLUMNS} FROM emails ORDER BY created_at DESC LIMIT ?1"),
                    params![limit],
                )
                .await
                .map_err(query_err("list_emails"))?,
        };

        Ok(collect_emails(&mut rows).await)
    }

    async fn update_review(
        &self,
        id: Uuid,
        draft_reply: &str,
        tone: &Tone,
        status: EmailStatus,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE emails SET draft_reply = ?1, tone = ?2, status = ?3, updated_at = ?4 WHERE id = ?5 AND status != 'sent'",
                params![draft_reply, tone.label(), status.as_str(), now, id.to_string()],
            )
            .await
            .map_err(query_err("update_review"))?;

        debug!(email_id = %id, status = %status, changed, "Email review updated in DB");
        Ok(changed > 0)
    }

    async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let ts = sent_at.to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE emails SET status = 'sent', sent_at = ?1, updated_at = ?1 WHERE id = ?2 AND status = 'approved'",
                params![ts, id.to_string()],
            )
            .await
            .map_err(query_err("mark_sent"))?;

        debug!(email_id = %id, changed, "Email marked sent in DB");
        Ok(changed > 0)
    }

    async fn count_by_status(&self) -> Result<StatusCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM emails GROUP BY status", ())
            .await
            .map_err(query_err("count_by_status"))?;

        let mut counts = StatusCounts::default();
        while let Ok(Some(row)) = rows.next().await {
            let status: String = row.get(0).map_err(query_err("count_by_status"))?;
            let count: i64 = row.get(1).map_err(query_err("count_by_status"))?;
            match status.parse::<EmailStatus>() {
                Ok(status) => counts.add(status, count as u64),
                Err(e) => tracing::warn!("Skipping status count: {e}"),
            }
        }
        Ok(counts)
    }

    async fn count_created_since(&self, since: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM emails WHERE created_at >= ?1",
                params![since.to_rfc3339()],
            )
            .await
            .map_err(query_err("count_created_since"))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).map_err(query_err("count_created_since"))?;
                Ok(count as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_created_since: {e}"))),
        }
    }

    // ── LLM Call Tracking ───────────────────────────────────────────

    async fn record_llm_call(&self, record: &LlmCallRecord<'_>) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let email_id = record.email_id.map(|id| id.to_string());
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO llm_calls (id, email_id, provider, model, input_tokens, output_tokens, cost, purpose, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.to_string(),
                    opt_text(email_id.as_deref()),
                    record.provider,
                    record.model,
                    i64::from(record.input_tokens),
                    i64::from(record.output_tokens),
                    record.cost.to_string(),
                    record.purpose,
                    now,
                ],
            )
            .await
            .map_err(query_err("record_llm_call"))?;

        Ok(id)
    }

    async fn get_total_spend(&self) -> Result<LlmCostSummary, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT TOTAL(CAST(cost AS REAL)), TOTAL(input_tokens), TOTAL(output_tokens), COUNT(*) FROM llm_calls",
                (),
            )
            .await
            .map_err(query_err("get_total_spend"))?;

        parse_cost_summary_row(&mut rows).await
    }
}
