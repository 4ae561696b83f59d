//! Email pipeline: fetch unread mail, classify and draft, store for review.
//!
//! 1. `MailFetcher::fetch_unread()` pulls up to `max_emails` unseen messages
//! 2. `Drafter::classify()` produces intent, summary and a draft per message
//! 3. New records are stored `pending` and the message is flagged seen
//!
//! **No auto-reply path exists.** Sending only happens through review.

pub mod processor;
pub mod scheduler;

pub use processor::{EmailProcessor, RunReport};
pub use scheduler::{PipelineScheduler, Schedule, SchedulerStatus, TriggerOutcome};
