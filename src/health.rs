//! Readiness probe over every collaborator the service depends on.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::drafting::Drafter;
use crate::mail::{MailFetcher, MailSender};
use crate::pipeline::PipelineScheduler;
use crate::store::Database;

/// Outcome of one dependency check.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    fn from_result<E: Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                error: None,
            },
            Err(e) => Self {
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// "ok" when every check passed and the last run succeeded, else "degraded".
    pub status: &'static str,
    pub checks: BTreeMap<&'static str, CheckResult>,
    pub last_pipeline_error: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "ok"
    }
}

pub struct HealthProbe {
    store: Arc<dyn Database>,
    fetcher: Arc<dyn MailFetcher>,
    sender: Arc<dyn MailSender>,
    drafter: Arc<Drafter>,
    scheduler: Arc<PipelineScheduler>,
}

impl HealthProbe {
    pub fn new(
        store: Arc<dyn Database>,
        fetcher: Arc<dyn MailFetcher>,
        sender: Arc<dyn MailSender>,
        drafter: Arc<Drafter>,
        scheduler: Arc<PipelineScheduler>,
    ) -> Self {
        Self {
            store,
            fetcher,
            sender,
            drafter,
            scheduler,
        }
    }

    /// Check the store and both mail servers; `deep` also round-trips the LLM.
    pub async fn check(&self, deep: bool) -> HealthReport {
        let (store, imap, smtp) = tokio::join!(
            self.store.ping(),
            self.fetcher.health_check(),
            self.sender.health_check(),
        );

        let mut checks = BTreeMap::new();
        checks.insert("store", CheckResult::from_result(store));
        checks.insert("imap", CheckResult::from_result(imap));
        checks.insert("smtp", CheckResult::from_result(smtp));
        if deep {
            checks.insert(
                "llm",
                CheckResult::from_result(self.drafter.health_check().await),
            );
        }

        let last_pipeline_error = self.scheduler.last_error().await;
        let healthy = checks.values().all(|c| c.ok) && last_pipeline_error.is_none();
        debug!(healthy, deep, "Health check complete");

        HealthReport {
            status: if healthy { "ok" } else { "degraded" },
            checks,
            last_pipeline_error,
        }
    }
}
