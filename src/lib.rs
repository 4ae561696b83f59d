//! Inbox Assist: drafts replies to incoming mail and sends them only after
//! human approval.

pub mod config;
pub mod dashboard;
pub mod drafting;
pub mod error;
pub mod events;
pub mod health;
pub mod llm;
pub mod mail;
pub mod pipeline;
pub mod review;
pub mod store;
