//! Configuration types, loaded from environment variables.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::mail::Encryption;
use crate::mail::imap::ImapConfig;
use crate::mail::smtp::SmtpConfig;
use crate::pipeline::Schedule;

pub const DEFAULT_MAX_EMAILS: usize = 10;
pub const MAX_EMAILS_LIMIT: usize = 50;

/// Pipeline scheduling.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// When false the timer starts paused; manual runs still work.
    pub enabled: bool,
    pub interval: Duration,
    /// 6-field cron expression. Takes precedence over `interval`.
    pub cron: Option<String>,
    pub max_emails: usize,
}

impl SchedulerConfig {
    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        match self.cron {
            Some(ref expr) => Schedule::cron(expr),
            None => Ok(Schedule::Interval(self.interval)),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5 * 60),
            cron: None,
            max_emails: DEFAULT_MAX_EMAILS,
        }
    }
}

/// HTTP dashboard server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Bearer token required on `/api/*` and `/ws` when set.
    pub app_secret: Option<SecretString>,
}

/// Everything the service needs at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub imap: ImapConfig,
    pub smtp: SmtpConfig,
    pub llm: LlmConfig,
    pub llm_timeout: Duration,
    pub scheduler: SchedulerConfig,
    pub server: ServerConfig,
    pub db_path: PathBuf,
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env {
            lookup: |key: &str| lookup(key).filter(|v| !v.trim().is_empty()),
        };

        let timeout = Duration::from_secs(env.parse_or("EMAIL_TIMEOUT_SECS", 30u64)?);

        let imap_host = env.required("EMAIL_IMAP_HOST", "e.g. imap.gmail.com")?;
        let username = env.required("EMAIL_USERNAME", "the mailbox login")?;
        let password = env.required("EMAIL_PASSWORD", "an app password is recommended")?;

        let imap = ImapConfig {
            port: env.parse_or("EMAIL_IMAP_PORT", 993)?,
            encryption: env.parse_or("EMAIL_IMAP_ENCRYPTION", Encryption::Tls)?,
            username: username.clone(),
            password: SecretString::from(password.clone()),
            mailbox: env.get("EMAIL_IMAP_MAILBOX").unwrap_or_else(|| "INBOX".into()),
            timeout,
            host: imap_host.clone(),
        };

        let smtp_username = env.get("EMAIL_SMTP_USERNAME").unwrap_or(username);
        let smtp = SmtpConfig {
            host: env
                .get("EMAIL_SMTP_HOST")
                .unwrap_or_else(|| imap_host.replace("imap", "smtp")),
            port: env.parse_or("EMAIL_SMTP_PORT", 587)?,
            encryption: env.parse_or("EMAIL_SMTP_ENCRYPTION", Encryption::StartTls)?,
            password: SecretString::from(env.get("EMAIL_SMTP_PASSWORD").unwrap_or(password)),
            from_address: env
                .get("EMAIL_FROM_ADDRESS")
                .unwrap_or_else(|| smtp_username.clone()),
            username: smtp_username,
            timeout,
        };

        let backend: LlmBackend = env.parse_or("LLM_BACKEND", LlmBackend::Anthropic)?;
        let api_key = env.required(backend.api_key_var(), "API key for the selected LLM backend")?;
        let llm = LlmConfig {
            backend,
            api_key: SecretString::from(api_key),
            model: env
                .get("INBOX_ASSIST_MODEL")
                .unwrap_or_else(|| backend.default_model().to_string()),
        };
        let llm_timeout = Duration::from_secs(env.parse_or("LLM_TIMEOUT_SECS", 60u64)?);

        let interval_minutes: u64 = env.parse_or("SCHEDULER_INTERVAL_MINUTES", 5)?;
        if interval_minutes == 0 {
            return Err(invalid("SCHEDULER_INTERVAL_MINUTES", "must be at least 1"));
        }
        let max_emails: usize = env.parse_or("PIPELINE_MAX_EMAILS", DEFAULT_MAX_EMAILS)?;
        if !(1..=MAX_EMAILS_LIMIT).contains(&max_emails) {
            return Err(invalid(
                "PIPELINE_MAX_EMAILS",
                &format!("must be between 1 and {MAX_EMAILS_LIMIT}"),
            ));
        }
        let scheduler = SchedulerConfig {
            enabled: env.flag_or("SCHEDULER_ENABLED", true)?,
            interval: Duration::from_secs(interval_minutes * 60),
            cron: env.get("SCHEDULER_CRON"),
            max_emails,
        };
        // Surface a bad cron expression at startup, not on first tick.
        scheduler.schedule()?;

        let server = ServerConfig {
            port: env.parse_or("INBOX_ASSIST_PORT", 8080)?,
            app_secret: env.get("APP_SECRET").map(SecretString::from),
        };

        Ok(Self {
            imap,
            smtp,
            llm,
            llm_timeout,
            scheduler,
            server,
            db_path: env
                .get("INBOX_ASSIST_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/inbox-assist.db")),
            log_dir: env.get("INBOX_ASSIST_LOG_DIR").map(PathBuf::from),
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn required(&self, key: &str, hint: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingRequired {
            key: key.to_string(),
            hint: hint.to_string(),
        })
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e: T::Err| invalid(key, &e.to_string())),
            None => Ok(default),
        }
    }

    fn flag_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(invalid(key, "expected true or false")),
            },
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
