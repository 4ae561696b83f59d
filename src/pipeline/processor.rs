//! Email processor: one pipeline run of fetch → classify → store.
//!
//! **Core invariant: nothing is sent from here.** Every stored record starts
//! `pending` and only leaves through human review.
//!
//! A message is flagged seen on the server only once its record is stored
//! (or it turns out to be a duplicate of one). Anything that fails stays
//! unseen and is picked up again by the next run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::drafting::Drafter;
use crate::error::{DatabaseError, PipelineError};
use crate::events::{Event, EventHub};
use crate::mail::{FetchedEmail, MailFetcher};
use crate::review::model::EmailRecord;
use crate::store::Database;

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub fetched: usize,
    pub created: usize,
    pub duplicates: usize,
    /// Messages that could not be parsed or classified. They stay unseen.
    pub failed: usize,
    pub marked_seen: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    fn started() -> Self {
        let now = Utc::now();
        Self {
            fetched: 0,
            created: 0,
            duplicates: 0,
            failed: 0,
            marked_seen: 0,
            started_at: now,
            finished_at: now,
        }
    }
}

enum Outcome {
    Created,
    Duplicate,
    Failed,
}

pub struct EmailProcessor {
    fetcher: Arc<dyn MailFetcher>,
    drafter: Arc<Drafter>,
    store: Arc<dyn Database>,
    events: EventHub,
}

impl EmailProcessor {
    pub fn new(
        fetcher: Arc<dyn MailFetcher>,
        drafter: Arc<Drafter>,
        store: Arc<dyn Database>,
        events: EventHub,
    ) -> Self {
        Self {
            fetcher,
            drafter,
            store,
            events,
        }
    }

    /// Run the pipeline once over at most `max_emails` unread messages.
    ///
    /// A fetch failure or a store failure ends the run with an error.
    /// A classification failure only skips that message.
    pub async fn run_once(&self, max_emails: usize) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::started();

        let batch = self.fetcher.fetch_unread(max_emails).await?;
        report.fetched = batch.emails.len() + batch.failed_uids.len();
        report.failed = batch.failed_uids.len();
        if !batch.failed_uids.is_empty() {
            warn!(uids = ?batch.failed_uids, "Some messages could not be fetched");
        }
        info!(count = batch.emails.len(), "Processing fetched emails");

        let mut seen = Vec::with_capacity(batch.emails.len());
        let mut fatal = None;
        for email in &batch.emails {
            match self.process(email).await {
                Ok(Outcome::Created) => {
                    report.created += 1;
                    seen.push(email.uid);
                }
                Ok(Outcome::Duplicate) => {
                    report.duplicates += 1;
                    seen.push(email.uid);
                }
                Ok(Outcome::Failed) => report.failed += 1,
                Err(e) => {
                    error!(uid = email.uid, error = %e, "Failed to store email, aborting run");
                    fatal = Some(e);
                    break;
                }
            }
        }

        if !seen.is_empty() {
            match self.fetcher.mark_seen(&seen).await {
                Ok(()) => report.marked_seen = seen.len(),
                Err(e) => {
                    // Records are stored; the next run will see them as duplicates.
                    warn!(count = seen.len(), error = %e, "Failed to mark emails as seen");
                }
            }
        }

        if let Some(e) = fatal {
            return Err(PipelineError::Persist(e));
        }

        report.finished_at = Utc::now();
        info!(
            fetched = report.fetched,
            created = report.created,
            duplicates = report.duplicates,
            failed = report.failed,
            "Pipeline run complete"
        );
        self.events.publish(Event::PipelineFinished {
            report: report.clone(),
        });
        Ok(report)
    }

    async fn process(&self, email: &FetchedEmail) -> Result<Outcome, DatabaseError> {
        if self
            .store
            .get_email_by_message_id(&email.message_id)
            .await?
            .is_some()
        {
            debug!(uid = email.uid, message_id = %email.message_id, "Already stored, skipping");
            return Ok(Outcome::Duplicate);
        }

        let classification = match self.drafter.classify(email).await {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    uid = email.uid,
                    sender = %email.sender,
                    error = %e,
                    "Classification failed, leaving message unseen"
                );
                return Ok(Outcome::Failed);
            }
        };

        let record = EmailRecord::new(
            email,
            classification.intent,
            classification.summary,
            classification.draft,
            classification.tone,
        );
        match self.store.insert_email(&record).await {
            Ok(()) => {
                info!(
                    email_id = %record.id,
                    uid = email.uid,
                    intent = %record.intent,
                    "Created pending reply"
                );
                self.events.publish(Event::EmailCreated { email: record });
                Ok(Outcome::Created)
            }
            Err(DatabaseError::Constraint(_)) => Ok(Outcome::Duplicate),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::drafting::DrafterConfig;
    use crate::error::{LlmError, MailError};
    use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
    use crate::mail::FetchBatch;
    use crate::review::model::{EmailStatus, Intent};
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::Mutex;

    /// Mailbox stub: unread messages are removed once marked seen.
    #[derive(Default)]
    pub(crate) struct StubMailbox {
        pub unread: Mutex<Vec<FetchedEmail>>,
        pub seen: Mutex<Vec<u32>>,
        pub fail_fetch: bool,
    }

    impl StubMailbox {
        pub(crate) fn with(emails: Vec<FetchedEmail>) -> Arc<Self> {
            Arc::new(Self {
                unread: Mutex::new(emails),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl MailFetcher for StubMailbox {
        async fn fetch_unread(&self, limit: usize) -> Result<FetchBatch, MailError> {
            if self.fail_fetch {
                return Err(MailError::Connect {
                    server: "imap.test".into(),
                    reason: "refused".into(),
                });
            }
            let emails = self.unread.lock().unwrap().iter().take(limit).cloned().collect();
            Ok(FetchBatch {
                emails,
                failed_uids: vec![],
            })
        }

        async fn mark_seen(&self, uids: &[u32]) -> Result<(), MailError> {
            self.seen.lock().unwrap().extend_from_slice(uids);
            self.unread
                .lock()
                .unwrap()
                .retain(|e| !uids.contains(&e.uid));
            Ok(())
        }

        async fn health_check(&self) -> Result<(), MailError> {
            Ok(())
        }
    }

    /// Classifies everything as a meeting request, except bodies containing "FAIL".
    pub(crate) struct KeywordLlm;

    #[async_trait]
    impl LlmProvider for KeywordLlm {
        fn model_name(&self) -> &str {
            "keyword"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            let prompt = &request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            if prompt.contains("FAIL") {
                return Err(LlmError::InvalidResponse {
                    provider: "keyword".into(),
                    reason: "refused".into(),
                });
            }
            Ok(CompletionResponse {
                content: r#"{"intent": "meeting_request", "summary": "Wants to meet", "draft": "Happy to meet, how about Tuesday?"}"#.into(),
                input_tokens: 10,
                output_tokens: 10,
                finish_reason: FinishReason::Stop,
                response_id: None,
            })
        }
    }

    pub(crate) fn fetched(uid: u32, body: &str) -> FetchedEmail {
        FetchedEmail {
            uid,
            message_id: format!("msg-{uid}@example.com"),
            sender: format!("sender{uid}@example.com"),
            sender_name: None,
            subject: format!("Subject {uid}"),
            body: body.to_string(),
            received_at: Utc::now(),
        }
    }

    async fn processor(mailbox: Arc<StubMailbox>) -> (EmailProcessor, Arc<LibSqlBackend>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let drafter = Arc::new(Drafter::new(Arc::new(KeywordLlm), DrafterConfig::default()));
        let processor = EmailProcessor::new(mailbox, drafter, store.clone(), EventHub::new());
        (processor, store)
    }

    #[tokio::test]
    async fn classification_failure_skips_only_that_message() {
        let mailbox = StubMailbox::with(vec![
            fetched(1, "Lunch?"),
            fetched(2, "Coffee?"),
            fetched(3, "FAIL please"),
            fetched(4, "Dinner?"),
            fetched(5, "Drinks?"),
        ]);
        let (processor, store) = processor(mailbox.clone()).await;

        let report = processor.run_once(10).await.unwrap();
        assert_eq!(report.fetched, 5);
        assert_eq!(report.created, 4);
        assert_eq!(report.failed, 1);

        let pending = store.list_emails(Some(EmailStatus::Pending), 50).await.unwrap();
        assert_eq!(pending.len(), 4);
        assert!(pending.iter().all(|r| r.intent == Intent::MeetingRequest));

        let seen = mailbox.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![1, 2, 4, 5]);
        assert!(!seen.contains(&3));
    }

    #[tokio::test]
    async fn rerun_does_not_duplicate() {
        let mailbox = StubMailbox::with(vec![fetched(1, "Lunch?")]);
        let (processor, store) = processor(mailbox.clone()).await;
        processor.run_once(10).await.unwrap();

        // Server "forgets" the seen flag.
        mailbox.unread.lock().unwrap().push(fetched(1, "Lunch?"));
        let report = processor.run_once(10).await.unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.marked_seen, 1);
        assert_eq!(store.list_emails(None, 50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn respects_max_emails() {
        let mailbox = StubMailbox::with((1..=5).map(|uid| fetched(uid, "Hi")).collect());
        let (processor, _store) = processor(mailbox.clone()).await;
        let report = processor.run_once(2).await.unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(mailbox.unread.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn fetch_failure_fails_the_run() {
        let mailbox = Arc::new(StubMailbox {
            fail_fetch: true,
            ..Default::default()
        });
        let (processor, _store) = processor(mailbox).await;
        let err = processor.run_once(10).await.unwrap_err();
        assert!(matches!(err, PipelineError::Fetch(_)));
    }

    #[tokio::test]
    async fn run_publishes_events() {
        let mailbox = StubMailbox::with(vec![fetched(1, "Lunch?")]);
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let drafter = Arc::new(Drafter::new(Arc::new(KeywordLlm), DrafterConfig::default()));
        let events = EventHub::new();
        let mut rx = events.subscribe();
        let processor = EmailProcessor::new(mailbox, drafter, store, events);

        processor.run_once(10).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), Event::EmailCreated { .. }));
        assert!(matches!(rx.recv().await.unwrap(), Event::PipelineFinished { .. }));
    }
}
