//! Persistence layer: libSQL-backed storage for email records and LLM spend.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, LlmCallRecord, LlmCostSummary};
