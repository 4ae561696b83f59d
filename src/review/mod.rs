//! Human review of drafted replies: record model, validation and the
//! pending/approved/rejected/sent state machine.

pub mod locks;
pub mod model;
pub mod validation;
pub mod workflow;

pub use model::{EmailRecord, EmailStatus, Intent, StatusCounts, Tone};
pub use workflow::{RecordUpdate, ReviewStats, ReviewWorkflow};
