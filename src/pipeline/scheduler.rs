//! Pipeline scheduler: timer and manual triggers over one non-overlapping run.
//!
//! Both triggers acquire the same "run in progress" flag. A timer tick that
//! finds a run in progress is skipped, not queued.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, PipelineError};
use crate::pipeline::processor::{EmailProcessor, RunReport};

/// When timer runs fire.
#[derive(Debug, Clone)]
pub enum Schedule {
    Interval(Duration),
    Cron {
        expr: String,
        schedule: Box<cron::Schedule>,
    },
}

impl Schedule {
    /// Parse a 6-field cron expression (sec min hour day month weekday).
    pub fn cron(expr: &str) -> Result<Self, ConfigError> {
        cron::Schedule::from_str(expr)
            .map(|s| Self::Cron {
                expr: expr.to_string(),
                schedule: Box::new(s),
            })
            .map_err(|e| ConfigError::InvalidValue {
                key: "SCHEDULER_CRON".into(),
                message: format!("invalid cron: {e}"),
            })
    }

    /// Next fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(every) => chrono::Duration::from_std(*every).ok().map(|d| now + d),
            Self::Cron { schedule, .. } => schedule.after(&now).next(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Interval(every) => format!("every {}s", every.as_secs()),
            Self::Cron { expr, .. } => format!("cron {expr}"),
        }
    }
}

/// Result of a manual trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    AlreadyRunning,
}

/// Clears the run-in-progress flag on drop, including on panic unwind.
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    last_run: Option<RunReport>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
}

/// Snapshot for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub paused: bool,
    pub running: bool,
    pub schedule: String,
    pub max_emails: usize,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<RunReport>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

pub struct PipelineScheduler {
    processor: Arc<EmailProcessor>,
    schedule: Schedule,
    max_emails: usize,
    running: Arc<AtomicBool>,
    paused: AtomicBool,
    state: RwLock<SchedulerState>,
}

impl PipelineScheduler {
    /// `start_paused` keeps the timer idle until `resume`; manual runs still work.
    pub fn new(
        processor: Arc<EmailProcessor>,
        schedule: Schedule,
        max_emails: usize,
        start_paused: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            processor,
            schedule,
            max_emails,
            running: Arc::new(AtomicBool::new(false)),
            paused: AtomicBool::new(start_paused),
            state: RwLock::new(SchedulerState::default()),
        })
    }

    /// Take the run-in-progress flag if it is free.
    pub fn try_begin(&self) -> Option<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard {
                flag: self.running.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        info!("Scheduler paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        info!("Scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Start a run in the background unless one is already in progress.
    pub fn trigger_manual(self: &Arc<Self>) -> TriggerOutcome {
        let Some(guard) = self.try_begin() else {
            info!("Manual trigger ignored, pipeline already running");
            return TriggerOutcome::AlreadyRunning;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = this.execute(guard, "manual").await;
        });
        TriggerOutcome::Started
    }

    /// Run now and wait for the result. `None` if a run is already in progress.
    pub async fn run_if_idle(&self, trigger: &str) -> Option<Result<RunReport, PipelineError>> {
        let guard = self.try_begin()?;
        Some(self.execute(guard, trigger).await)
    }

    /// Last recorded pipeline failure, cleared by the next successful run.
    pub async fn last_error(&self) -> Option<String> {
        self.state.read().await.last_error.clone()
    }

    pub async fn status(&self) -> SchedulerStatus {
        let state = self.state.read().await;
        SchedulerStatus {
            paused: self.is_paused(),
            running: self.is_running(),
            schedule: self.schedule.describe(),
            max_emails: self.max_emails,
            next_run: state.next_run,
            last_run: state.last_run.clone(),
            last_error: state.last_error.clone(),
            last_error_at: state.last_error_at,
        }
    }

    async fn execute(&self, _guard: RunGuard, trigger: &str) -> Result<RunReport, PipelineError> {
        info!(trigger, max_emails = self.max_emails, "Pipeline run starting");
        let result = self.processor.run_once(self.max_emails).await;

        let mut state = self.state.write().await;
        match &result {
            Ok(report) => {
                state.last_run = Some(report.clone());
                state.last_error = None;
                state.last_error_at = None;
            }
            Err(e) => {
                error!(trigger, error = %e, "Pipeline run failed");
                state.last_error = Some(e.to_string());
                state.last_error_at = Some(Utc::now());
            }
        }
        result
    }

    /// Spawn the timer loop.
    ///
    /// Each due tick starts a run in its own task so the cadence holds even
    /// when a run takes longer than the interval.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        info!(schedule = %self.schedule.describe(), "Scheduler started");
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = self.schedule.next_after(now) else {
                    warn!("Schedule has no upcoming fire time, scheduler stopping");
                    return;
                };
                self.state.write().await.next_run = Some(next);

                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;

                if self.is_paused() {
                    debug!("Scheduler paused, skipping tick");
                    continue;
                }
                let Some(guard) = self.try_begin() else {
                    info!("Previous run still in progress, skipping tick");
                    continue;
                };
                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    let _ = this.execute(guard, "timer").await;
                });
            }
        })
    }
}
