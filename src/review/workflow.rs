//! Review workflow: the human-facing state machine over stored records.
//!
//! ```text
//! pending ──edit──► approved ──send──► sent
//!    ▲  │              │
//!    │  └──edit──► rejected
//!    └─────edit────────┘
//! ```
//!
//! Every operation holds the record's lock from read to write, so an edit
//! and a send on the same record never interleave.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::drafting::Drafter;
use crate::error::WorkflowError;
use crate::events::{Event, EventHub};
use crate::mail::parse::{is_synthetic_message_id, reply_subject};
use crate::mail::{MailSender, OutgoingEmail};
use crate::review::locks::RecordLocks;
use crate::review::model::{EmailRecord, EmailStatus, StatusCounts, Tone};
use crate::review::validation::validate_draft;
use crate::store::Database;

/// Fields a reviewer may change. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordUpdate {
    pub draft_reply: Option<String>,
    pub tone: Option<String>,
    pub status: Option<EmailStatus>,
}

impl RecordUpdate {
    fn is_empty(&self) -> bool {
        self.draft_reply.is_none() && self.tone.is_none() && self.status.is_none()
    }
}

/// Dashboard statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewStats {
    #[serde(flatten)]
    pub counts: StatusCounts,
    pub total: u64,
    pub processed_today: u64,
    pub processed_this_week: u64,
}

pub struct ReviewWorkflow {
    store: Arc<dyn Database>,
    sender: Arc<dyn MailSender>,
    drafter: Arc<Drafter>,
    locks: RecordLocks,
    events: EventHub,
}

impl ReviewWorkflow {
    pub fn new(
        store: Arc<dyn Database>,
        sender: Arc<dyn MailSender>,
        drafter: Arc<Drafter>,
        events: EventHub,
    ) -> Self {
        Self {
            store,
            sender,
            drafter,
            locks: RecordLocks::new(),
            events,
        }
    }

    pub async fn list(
        &self,
        status: Option<EmailStatus>,
        limit: usize,
    ) -> Result<Vec<EmailRecord>, WorkflowError> {
        Ok(self.store.list_emails(status, limit).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<EmailRecord, WorkflowError> {
        self.store
            .get_email(id)
            .await?
            .ok_or(WorkflowError::NotFound { id })
    }

    /// Apply a reviewer's changes to an unsent record.
    pub async fn edit(&self, id: Uuid, update: RecordUpdate) -> Result<EmailRecord, WorkflowError> {
        if update.is_empty() {
            return Err(WorkflowError::Validation("update contains no changes".into()));
        }
        let tone = update.tone.as_deref().map(parse_tone).transpose()?;
        let draft = update.draft_reply.as_deref().map(validate_draft).transpose()?;

        let _guard = self.locks.lock(id).await;
        let record = self.get(id).await?;
        if record.is_sent() {
            return Err(WorkflowError::AlreadySent { id });
        }

        let target = update.status.unwrap_or(record.status);
        if !record.status.can_edit_to(target) {
            return Err(WorkflowError::InvalidTransition {
                id,
                from: record.status,
                to: target,
            });
        }

        let tone = tone.unwrap_or(record.tone.clone());
        let draft = draft.unwrap_or(record.draft_reply.clone());
        if !self.store.update_review(id, &draft, &tone, target).await? {
            return Err(WorkflowError::AlreadySent { id });
        }

        let updated = self.get(id).await?;
        info!(
            email_id = %id,
            from = %record.status,
            to = %updated.status,
            tone = %updated.tone,
            "Email review updated"
        );
        self.events.publish(Event::EmailUpdated {
            email: updated.clone(),
        });
        Ok(updated)
    }

    /// Replace the draft with a fresh one in `tone`. Status is unchanged.
    ///
    /// If drafting fails the stored draft is left as it was.
    pub async fn regenerate(&self, id: Uuid, tone: &str) -> Result<EmailRecord, WorkflowError> {
        let tone = parse_tone(tone)?;

        let _guard = self.locks.lock(id).await;
        let record = self.get(id).await?;
        if record.is_sent() {
            return Err(WorkflowError::AlreadySent { id });
        }

        let draft = self.drafter.regenerate(&record, &tone).await.map_err(|e| {
            warn!(email_id = %id, error = %e, "Draft regeneration failed");
            WorkflowError::Drafting(e)
        })?;

        if !self
            .store
            .update_review(id, &draft, &tone, record.status)
            .await?
        {
            return Err(WorkflowError::AlreadySent { id });
        }

        let updated = self.get(id).await?;
        self.events.publish(Event::EmailUpdated {
            email: updated.clone(),
        });
        Ok(updated)
    }

    /// Send the approved draft as a reply.
    ///
    /// A transport failure leaves the record approved so it can be retried.
    pub async fn send(&self, id: Uuid) -> Result<EmailRecord, WorkflowError> {
        let _guard = self.locks.lock(id).await;
        let record = self.get(id).await?;
        match record.status {
            EmailStatus::Approved => {}
            EmailStatus::Sent => return Err(WorkflowError::AlreadySent { id }),
            status => return Err(WorkflowError::NotApproved { id, status }),
        }

        let outgoing = OutgoingEmail {
            to: record.sender.clone(),
            subject: reply_subject(&record.subject),
            body: record.draft_reply.clone(),
            in_reply_to: (!is_synthetic_message_id(&record.message_id))
                .then(|| record.message_id.clone()),
        };

        if let Err(e) = self.sender.send(&outgoing).await {
            warn!(email_id = %id, to = %outgoing.to, error = %e, "Reply send failed");
            return Err(WorkflowError::Transport(e));
        }

        let marked = self.store.mark_sent(id, Utc::now()).await.map_err(|e| {
            error!(
                email_id = %id,
                to = %outgoing.to,
                error = %e,
                "Reply sent but recording it failed; record is still approved, do not resend"
            );
            e
        })?;
        if !marked {
            // Only reachable if the row changed outside the workflow.
            let current = self.get(id).await?;
            error!(email_id = %id, status = %current.status, "Reply sent but record was no longer approved");
            return Err(WorkflowError::NotApproved {
                id,
                status: current.status,
            });
        }

        let updated = self.get(id).await?;
        info!(email_id = %id, to = %outgoing.to, "Reply sent");
        self.events.publish(Event::EmailUpdated {
            email: updated.clone(),
        });
        Ok(updated)
    }

    pub async fn stats(&self) -> Result<ReviewStats, WorkflowError> {
        let counts = self.store.count_by_status().await?;
        let now = Utc::now();
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or(now);
        let processed_today = self.store.count_created_since(midnight).await?;
        let processed_this_week = self
            .store
            .count_created_since(now - Duration::days(7))
            .await?;

        Ok(ReviewStats {
            total: counts.total(),
            counts,
            processed_today,
            processed_this_week,
        })
    }
}

fn parse_tone(raw: &str) -> Result<Tone, WorkflowError> {
    Tone::parse_known(raw).ok_or_else(|| WorkflowError::Validation(format!("unknown tone: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drafting::DrafterConfig;
    use crate::error::{DatabaseError, LlmError, MailError};
    use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
    use crate::mail::FetchedEmail;
    use crate::review::model::Intent;
    use crate::store::{LibSqlBackend, LlmCallRecord, LlmCostSummary};
    use async_trait::async_trait;
    use chrono::DateTime;
    use rust_decimal::Decimal;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FixedLlm {
        reply: Option<String>,
    }

    #[async_trait]
    impl LlmProvider for FixedLlm {
        fn model_name(&self) -> &str {
            "fixed"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            match &self.reply {
                Some(reply) => Ok(CompletionResponse {
                    content: reply.clone(),
                    input_tokens: 10,
                    output_tokens: 10,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                }),
                None => Err(LlmError::RequestFailed {
                    provider: "fixed".into(),
                    reason: "unavailable".into(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        fail: AtomicBool,
        sent: Mutex<Vec<OutgoingEmail>>,
    }

    #[async_trait]
    impl MailSender for RecordingSender {
        async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(MailError::SendFailed {
                    to: email.to.clone(),
                    reason: "connection refused".into(),
                });
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }

        async fn health_check(&self) -> Result<(), MailError> {
            Ok(())
        }
    }

    struct Harness {
        workflow: Arc<ReviewWorkflow>,
        store: Arc<LibSqlBackend>,
        sender: Arc<RecordingSender>,
    }

    async fn harness(llm_reply: Option<&str>) -> Harness {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sender = Arc::new(RecordingSender::default());
        let drafter = Arc::new(Drafter::new(
            Arc::new(FixedLlm {
                reply: llm_reply.map(str::to_string),
            }),
            DrafterConfig::default(),
        ));
        let workflow = Arc::new(ReviewWorkflow::new(
            store.clone(),
            sender.clone(),
            drafter,
            EventHub::new(),
        ));
        Harness {
            workflow,
            store,
            sender,
        }
    }

    async fn seed(store: &LibSqlBackend, status: EmailStatus) -> EmailRecord {
        let fetched = FetchedEmail {
            uid: 1,
            message_id: format!("{}@example.com", Uuid::new_v4()),
            sender: "erin@example.com".into(),
            sender_name: Some("Erin".into()),
            subject: "Project timeline".into(),
            body: "When will phase two ship?".into(),
            received_at: Utc::now(),
        };
        let record = EmailRecord::new(
            &fetched,
            Intent::FollowUp,
            None,
            "Phase two ships at the end of the month.",
            Tone::Formal,
        );
        store.insert_email(&record).await.unwrap();
        if status != EmailStatus::Pending {
            let via_approved = status == EmailStatus::Sent;
            let first = if via_approved {
                EmailStatus::Approved
            } else {
                status
            };
            store
                .update_review(record.id, &record.draft_reply, &record.tone, first)
                .await
                .unwrap();
            if via_approved {
                store.mark_sent(record.id, Utc::now()).await.unwrap();
            }
        }
        store.get_email(record.id).await.unwrap().unwrap()
    }

    fn update(draft: Option<&str>, tone: Option<&str>, status: Option<EmailStatus>) -> RecordUpdate {
        RecordUpdate {
            draft_reply: draft.map(str::to_string),
            tone: tone.map(str::to_string),
            status,
        }
    }

    #[tokio::test]
    async fn edit_updates_draft_tone_and_status() {
        let h = harness(None).await;
        let record = seed(&h.store, EmailStatus::Pending).await;

        let updated = h
            .workflow
            .edit(
                record.id,
                update(
                    Some("  Phase two ships on the 30th.  "),
                    Some("friendly"),
                    Some(EmailStatus::Approved),
                ),
            )
            .await
            .unwrap();
        assert_eq!(updated.draft_reply, "Phase two ships on the 30th.");
        assert_eq!(updated.tone, Tone::Friendly);
        assert_eq!(updated.status, EmailStatus::Approved);
    }

    #[tokio::test]
    async fn rejected_record_can_be_revived() {
        let h = harness(None).await;
        let record = seed(&h.store, EmailStatus::Rejected).await;
        let updated = h
            .workflow
            .edit(record.id, update(None, None, Some(EmailStatus::Pending)))
            .await
            .unwrap();
        assert_eq!(updated.status, EmailStatus::Pending);
    }

    #[tokio::test]
    async fn edit_cannot_target_sent() {
        let h = harness(None).await;
        let record = seed(&h.store, EmailStatus::Approved).await;
        let err = h
            .workflow
            .edit(record.id, update(None, None, Some(EmailStatus::Sent)))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
        assert!(h.sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sent_record_is_immutable() {
        let h = harness(Some("A brand new draft for you.")).await;
        let record = seed(&h.store, EmailStatus::Sent).await;

        let err = h
            .workflow
            .edit(record.id, update(Some("Trying to change history."), None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadySent { .. }));

        let err = h
            .workflow
            .regenerate(record.id, "Friendly")
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let stored = h.workflow.get(record.id).await.unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn edit_rejects_invalid_input() {
        let h = harness(None).await;
        let record = seed(&h.store, EmailStatus::Pending).await;

        let err = h
            .workflow
            .edit(record.id, update(Some("short"), None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        let err = h
            .workflow
            .edit(record.id, update(None, Some("sarcastic"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        let err = h
            .workflow
            .edit(record.id, RecordUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        assert_eq!(h.workflow.get(record.id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let h = harness(None).await;
        let err = h.workflow.send(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound { .. }));
    }

    #[tokio::test]
    async fn regenerate_overwrites_draft_and_tone() {
        let h = harness(Some("Hi Erin! Phase two lands at month end.")).await;
        let record = seed(&h.store, EmailStatus::Approved).await;

        let updated = h.workflow.regenerate(record.id, "friendly").await.unwrap();
        assert_eq!(updated.draft_reply, "Hi Erin! Phase two lands at month end.");
        assert_eq!(updated.tone, Tone::Friendly);
        assert_eq!(updated.status, EmailStatus::Approved);
    }

    #[tokio::test]
    async fn failed_regenerate_keeps_previous_draft() {
        let h = harness(None).await;
        let record = seed(&h.store, EmailStatus::Pending).await;

        let err = h.workflow.regenerate(record.id, "Assertive").await.unwrap_err();
        assert!(matches!(err, WorkflowError::Drafting(_)));
        assert_eq!(h.workflow.get(record.id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn send_approved_record() {
        let h = harness(None).await;
        let record = seed(&h.store, EmailStatus::Approved).await;

        let sent = h.workflow.send(record.id).await.unwrap();
        assert_eq!(sent.status, EmailStatus::Sent);
        assert!(sent.sent_at.is_some());

        let outbox = h.sender.sent.lock().unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].to, "erin@example.com");
        assert_eq!(outbox[0].subject, "Re: Project timeline");
        assert_eq!(outbox[0].in_reply_to.as_deref(), Some(record.message_id.as_str()));
    }

    #[tokio::test]
    async fn send_requires_approval() {
        let h = harness(None).await;
        for status in [EmailStatus::Pending, EmailStatus::Rejected] {
            let record = seed(&h.store, status).await;
            let err = h.workflow.send(record.id).await.unwrap_err();
            assert!(matches!(err, WorkflowError::NotApproved { .. }));
        }
        let sent = seed(&h.store, EmailStatus::Sent).await;
        let err = h.workflow.send(sent.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadySent { .. }));
        assert!(h.sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_leaves_record_approved() {
        let h = harness(None).await;
        h.sender.fail.store(true, Ordering::SeqCst);
        let record = seed(&h.store, EmailStatus::Approved).await;

        let err = h.workflow.send(record.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Transport(_)));

        let stored = h.workflow.get(record.id).await.unwrap();
        assert_eq!(stored.status, EmailStatus::Approved);
        assert!(stored.sent_at.is_none());
    }

    #[tokio::test]
    async fn concurrent_edits_leave_one_complete_draft() {
        let h = harness(None).await;
        let record = seed(&h.store, EmailStatus::Pending).await;
        let first = "First reviewer's complete draft.";
        let second = "Second reviewer's complete draft.";

        let a = {
            let wf = h.workflow.clone();
            tokio::spawn(async move { wf.edit(record.id, update(Some(first), None, None)).await })
        };
        let b = {
            let wf = h.workflow.clone();
            tokio::spawn(async move { wf.edit(record.id, update(Some(second), None, None)).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let stored = h.workflow.get(record.id).await.unwrap();
        assert!(stored.draft_reply == first || stored.draft_reply == second);
    }

    #[tokio::test]
    async fn stats_count_recent_records() {
        let h = harness(None).await;
        seed(&h.store, EmailStatus::Pending).await;
        seed(&h.store, EmailStatus::Approved).await;
        seed(&h.store, EmailStatus::Sent).await;

        let stats = h.workflow.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.counts.pending, 1);
        assert_eq!(stats.counts.sent, 1);
        assert_eq!(stats.processed_today, 3);
        assert_eq!(stats.processed_this_week, 3);
    }
    /// Delegates to libSQL but fails every `mark_sent`.
    struct MarkSentFails(LibSqlBackend);

    #[async_trait]
    impl Database for MarkSentFails {
        async fn init_schema(&self) -> Result<(), DatabaseError> {
            self.0.init_schema().await
        }
        async fn ping(&self) -> Result<(), DatabaseError> {
            self.0.ping().await
        }
        async fn insert_email(&self, record: &EmailRecord) -> Result<(), DatabaseError> {
            self.0.insert_email(record).await
        }
        async fn get_email(&self, id: Uuid) -> Result<Option<EmailRecord>, DatabaseError> {
            self.0.get_email(id).await
        }
        async fn get_email_by_message_id(
            &self,
            message_id: &str,
        ) -> Result<Option<EmailRecord>, DatabaseError> {
            self.0.get_email_by_message_id(message_id).await
        }
        async fn list_emails(
            &self,
            status: Option<EmailStatus>,
            limit: usize,
        ) -> Result<Vec<EmailRecord>, DatabaseError> {
            self.0.list_emails(status, limit).await
        }
        async fn update_review(
            &self,
            id: Uuid,
            draft_reply: &str,
            tone: &Tone,
            status: EmailStatus,
        ) -> Result<bool, DatabaseError> {
            self.0.update_review(id, draft_reply, tone, status).await
        }
        async fn mark_sent(&self, _id: Uuid, _sent_at: DateTime<Utc>) -> Result<bool, DatabaseError> {
            Err(DatabaseError::Query("mark_sent: disk I/O error".into()))
        }
        async fn count_by_status(&self) -> Result<StatusCounts, DatabaseError> {
            self.0.count_by_status().await
        }
        async fn count_created_since(&self, since: DateTime<Utc>) -> Result<u64, DatabaseError> {
            self.0.count_created_since(since).await
        }
        async fn record_llm_call(&self, record: &LlmCallRecord<'_>) -> Result<Uuid, DatabaseError> {
            self.0.record_llm_call(record).await
        }
        async fn get_total_spend(&self) -> Result<LlmCostSummary, DatabaseError> {
            self.0.get_total_spend().await
        }
    }

    #[tokio::test]
    async fn store_failure_after_send_is_reported_and_record_stays_approved() {
        let inner = LibSqlBackend::new_memory().await.unwrap();
        let record = seed(&inner, EmailStatus::Approved).await;
        let store = Arc::new(MarkSentFails(inner));
        let sender = Arc::new(RecordingSender::default());
        let drafter = Arc::new(Drafter::new(
            Arc::new(FixedLlm { reply: None }),
            DrafterConfig::default(),
        ));
        let workflow = ReviewWorkflow::new(store.clone(), sender.clone(), drafter, EventHub::new());

        let err = workflow.send(record.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Store(_)));
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
        assert_eq!(
            workflow.get(record.id).await.unwrap().status,
            EmailStatus::Approved
        );
    }

    #[tokio::test]
    async fn locally_generated_message_id_is_not_used_for_threading() {
        let h = harness(None).await;
        let raw = "From: erin@example.com\r\nSubject: No id\r\n\r\nCan we talk?\r\n";
        let fetched = crate::mail::parse::parse_message(3, raw.as_bytes()).unwrap();
        let record = EmailRecord::new(
            &fetched,
            Intent::Other,
            None,
            "Sure, how about tomorrow morning?",
            Tone::Formal,
        );
        h.store.insert_email(&record).await.unwrap();
        h.store
            .update_review(record.id, &record.draft_reply, &record.tone, EmailStatus::Approved)
            .await
            .unwrap();

        h.workflow.send(record.id).await.unwrap();
        let outbox = h.sender.sent.lock().unwrap();
        assert_eq!(outbox[0].in_reply_to, None);
        assert_eq!(outbox[0].subject, "Re: No id");
    }
}
