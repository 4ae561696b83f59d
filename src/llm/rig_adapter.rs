//! Bridges rig-core's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::OneOrMany;
use rig::completion::{AssistantContent, CompletionError, CompletionModel, Message};
use rust_decimal::Decimal;

use super::costs;
use super::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};
use crate::error::LlmError;

/// Wraps any rig completion model.
pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }
}

/// Split our messages into (preamble, history, final prompt) as rig expects.
fn split_messages(messages: Vec<ChatMessage>) -> (Option<String>, Vec<Message>, Message) {
    let mut system = Vec::new();
    let mut turns = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system.push(msg.content),
            Role::User => turns.push(Message::user(msg.content)),
            Role::Assistant => turns.push(Message::assistant(msg.content)),
        }
    }
    let prompt = turns.pop().unwrap_or_else(|| Message::user(""));
    let preamble = (!system.is_empty()).then(|| system.join("\n\n"));
    (preamble, turns, prompt)
}

fn collect_text(choice: &OneOrMany<AssistantContent>) -> String {
    choice
        .iter()
        .filter_map(|c| match c {
            AssistantContent::Text(text) => Some(text.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

fn map_error(provider: &str, err: CompletionError) -> LlmError {
    let reason = err.to_string();
    let lower = reason.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("overloaded") {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else if lower.contains("401") || lower.contains("authentication") || lower.contains("api key")
    {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else {
        match err {
            CompletionError::JsonError(e) => LlmError::Json(e),
            CompletionError::ResponseError(_) => LlmError::InvalidResponse {
                provider: provider.to_string(),
                reason,
            },
            _ => LlmError::RequestFailed {
                provider: provider.to_string(),
                reason,
            },
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        costs::model_cost(&self.model_name)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (preamble, history, prompt) = split_messages(request.messages);

        let mut builder = self.model.completion_request(prompt).messages(history);
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_error(self.provider, e))?;

        let content = collect_text(&response.choice);
        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.provider.to_string(),
                reason: "response contained no text".into(),
            });
        }

        let input_tokens = u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX);
        let output_tokens = u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX);
        let finish_reason = match request.max_tokens {
            Some(max) if output_tokens >= max => FinishReason::Length,
            Some(_) | None if output_tokens > 0 => FinishReason::Stop,
            _ => FinishReason::Unknown,
        };

        Ok(CompletionResponse {
            content,
            input_tokens,
            output_tokens,
            finish_reason,
            response_id: None,
        })
    }
}
