use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use inbox_assist::config::AppConfig;
use inbox_assist::dashboard::{AppState, dashboard_routes};
use inbox_assist::drafting::{Drafter, DrafterConfig};
use inbox_assist::events::EventHub;
use inbox_assist::health::HealthProbe;
use inbox_assist::llm::create_provider;
use inbox_assist::mail::{ImapFetcher, MailFetcher, MailSender, SmtpSender};
use inbox_assist::pipeline::{EmailProcessor, PipelineScheduler};
use inbox_assist::review::ReviewWorkflow;
use inbox_assist::store::{Database, LibSqlBackend};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console logging, plus a daily-rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-assist.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let config = AppConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📬 Inbox Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {} ({})", config.llm.model, config.llm.backend);
    eprintln!(
        "   IMAP: {}:{} ({})",
        config.imap.host, config.imap.port, config.imap.encryption
    );
    eprintln!(
        "   SMTP: {}:{} ({})",
        config.smtp.host, config.smtp.port, config.smtp.encryption
    );
    eprintln!("   Dashboard: http://0.0.0.0:{}/api/emails", config.server.port);
    eprintln!("   Events WS: ws://0.0.0.0:{}/ws", config.server.port);
    if config.server.app_secret.is_none() {
        eprintln!("   Warning: APP_SECRET not set, the API is unauthenticated");
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── LLM ─────────────────────────────────────────────────────────────
    let llm = create_provider(&config.llm)?;
    let drafter = Arc::new(
        Drafter::new(
            llm,
            DrafterConfig {
                provider: config.llm.backend.to_string(),
                timeout: config.llm_timeout,
            },
        )
        .with_cost_tracking(Arc::clone(&db)),
    );
    if let Ok(spend) = db.get_total_spend().await {
        eprintln!(
            "   LLM spend to date: ${} over {} calls",
            spend.total_cost, spend.call_count
        );
    }

    // ── Mail ────────────────────────────────────────────────────────────
    let fetcher: Arc<dyn MailFetcher> = Arc::new(ImapFetcher::new(config.imap.clone()));
    let sender: Arc<dyn MailSender> = Arc::new(SmtpSender::new(config.smtp.clone()));

    // ── Pipeline ────────────────────────────────────────────────────────
    let events = EventHub::new();
    let processor = Arc::new(EmailProcessor::new(
        Arc::clone(&fetcher),
        Arc::clone(&drafter),
        Arc::clone(&db),
        events.clone(),
    ));
    let schedule = config.scheduler.schedule()?;
    eprintln!(
        "   Scheduler: {} ({}, max {} emails per run)",
        if config.scheduler.enabled { "enabled" } else { "paused" },
        schedule.describe(),
        config.scheduler.max_emails
    );
    let scheduler = PipelineScheduler::new(
        processor,
        schedule,
        config.scheduler.max_emails,
        !config.scheduler.enabled,
    );
    let scheduler_handle = Arc::clone(&scheduler).spawn();

    // ── Dashboard ───────────────────────────────────────────────────────
    let workflow = Arc::new(ReviewWorkflow::new(
        Arc::clone(&db),
        Arc::clone(&sender),
        Arc::clone(&drafter),
        events.clone(),
    ));
    let health = Arc::new(HealthProbe::new(
        Arc::clone(&db),
        fetcher,
        sender,
        drafter,
        Arc::clone(&scheduler),
    ));
    let app = dashboard_routes(AppState {
        workflow,
        scheduler,
        health,
        events,
        app_secret: config.server.app_secret.clone(),
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.server.port))?;
    tracing::info!(port = config.server.port, "Dashboard server started");
    eprintln!();

    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::select! {
        result = server => {
            result.context("Dashboard server task failed")?.context("Dashboard server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
        }
    }
    scheduler_handle.abort();

    Ok(())
}
