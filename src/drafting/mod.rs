//! Classifier/drafter: turns a fetched email into intent, summary and a
//! reply draft, and rewrites drafts in a requested tone.
//!
//! Every call is bounded by a timeout and any failure (timeout, rate limit,
//! auth, malformed output) surfaces as an `LlmError`. Nothing here writes a
//! record; callers only persist a `Classification` once it is complete.

mod prompts;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider};
use crate::mail::FetchedEmail;
use crate::review::model::{EmailRecord, Intent, Tone};
use crate::store::{Database, LlmCallRecord};

/// Temperature for classification (deterministic-ish).
const CLASSIFY_TEMPERATURE: f32 = 0.2;

/// Max tokens for the classify call: summary plus a full draft.
const CLASSIFY_MAX_TOKENS: u32 = 1024;

/// Drafts get a little more variety when a human asks for a rewrite.
const REGENERATE_TEMPERATURE: f32 = 0.7;

const REGENERATE_MAX_TOKENS: u32 = 1024;

/// Drafter tuning.
#[derive(Debug, Clone)]
pub struct DrafterConfig {
    /// Provider label recorded with each call (e.g. "anthropic").
    pub provider: String,
    pub timeout: Duration,
}

impl Default for DrafterConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Result of classifying one email.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub summary: Option<String>,
    pub draft: String,
    pub tone: Tone,
}

/// LLM-backed classifier and reply drafter.
pub struct Drafter {
    llm: Arc<dyn LlmProvider>,
    store: Option<Arc<dyn Database>>,
    config: DrafterConfig,
}

impl Drafter {
    pub fn new(llm: Arc<dyn LlmProvider>, config: DrafterConfig) -> Self {
        Self {
            llm,
            store: None,
            config,
        }
    }

    /// Record per-call token usage and cost in `store`.
    pub fn with_cost_tracking(mut self, store: Arc<dyn Database>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Classify an email and draft a Formal reply in one call.
    pub async fn classify(&self, email: &FetchedEmail) -> Result<Classification, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(prompts::classify_system_prompt()),
            ChatMessage::user(prompts::email_prompt(email)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = self.call(request, None, "classify").await?;

        parse_classification(&response.content).map_err(|reason| {
            warn!(
                uid = email.uid,
                raw_response = %response.content,
                error = %reason,
                "Failed to parse classification response"
            );
            LlmError::InvalidResponse {
                provider: self.config.provider.clone(),
                reason,
            }
        })
    }

    /// Produce a new draft for `record` in `tone`.
    pub async fn regenerate(&self, record: &EmailRecord, tone: &Tone) -> Result<String, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(prompts::regenerate_system_prompt(&record.intent, tone)),
            ChatMessage::user(prompts::regenerate_prompt(record)),
        ])
        .with_temperature(REGENERATE_TEMPERATURE)
        .with_max_tokens(REGENERATE_MAX_TOKENS);

        let response = self.call(request, Some(record.id), "regenerate").await?;
        let draft = clean_draft(&response.content);
        if draft.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.config.provider.clone(),
                reason: "regenerated draft is empty".into(),
            });
        }
        info!(email_id = %record.id, tone = %tone, "Draft regenerated");
        Ok(draft)
    }

    /// Minimal round-trip to confirm the model answers.
    pub async fn health_check(&self) -> Result<(), LlmError> {
        let request = CompletionRequest::new(vec![ChatMessage::user("Reply with the word OK.")])
            .with_max_tokens(5);
        self.call(request, None, "health_check").await.map(|_| ())
    }

    async fn call(
        &self,
        request: CompletionRequest,
        email_id: Option<Uuid>,
        purpose: &str,
    ) -> Result<CompletionResponse, LlmError> {
        let timeout = self.config.timeout;
        let response = tokio::time::timeout(timeout, self.llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.config.provider.clone(),
                timeout,
            })??;

        let cost = self
            .llm
            .estimate_cost(response.input_tokens, response.output_tokens);
        debug!(
            purpose,
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            cost = %cost,
            "LLM call complete"
        );

        if let Some(ref store) = self.store {
            let record = LlmCallRecord {
                email_id,
                provider: &self.config.provider,
                model: self.llm.model_name(),
                input_tokens: response.input_tokens,
                output_tokens: response.output_tokens,
                cost,
                purpose,
            };
            if let Err(e) = store.record_llm_call(&record).await {
                warn!(error = %e, "Failed to record LLM call");
            }
        }

        Ok(response)
    }
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct ClassifyResponse {
    #[serde(default)]
    intent: String,
    #[serde(default)]
    summary: String,
    #[serde(default, alias = "draft_reply", alias = "reply")]
    draft: String,
}

fn parse_classification(raw: &str) -> Result<Classification, String> {
    let json_str = extract_json_object(raw);
    let response: ClassifyResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let draft = response.draft.trim();
    if draft.is_empty() {
        return Err("response has no draft".into());
    }
    let summary = response.summary.trim();

    Ok(Classification {
        intent: Intent::from_model_label(&response.intent),
        summary: (!summary.is_empty()).then(|| summary.to_string()),
        draft: draft.to_string(),
        tone: Tone::Formal,
    })
}

/// Strip code fences and wrapping quotes from a plain-text draft.
fn clean_draft(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(inner) = text.strip_prefix("```") {
        let inner = inner.split_once('\n').map_or("", |(_, rest)| rest);
        text = inner.trim_end().strip_suffix("```").unwrap_or(inner).trim();
    }
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        text = text[1..text.len() - 1].trim();
    }
    text.to_string()
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
