//! Prompt construction for classification and drafting.

use crate::mail::FetchedEmail;
use crate::review::model::{EmailRecord, Intent, Tone};

/// Body characters handed to the model. Long threads are truncated.
const BODY_PREVIEW_CHARS: usize = 4000;

/// System prompt for the single classify-and-draft call.
pub(super) fn classify_system_prompt() -> String {
    let mut prompt = String::from(
        "You are an email assistant. Read the incoming email, classify its intent, \
         summarize it, and draft a reply for a human to review before anything is sent.\n\n\
         Intents:\n",
    );
    for intent in Intent::KNOWN {
        prompt.push_str(&format!("- \"{}\": {}\n", intent.label(), intent.description()));
    }
    prompt.push_str(
        "\nRespond with ONLY a JSON object:\n\
         {\"intent\": \"...\", \"summary\": \"...\", \"draft\": \"...\"}\n\n\
         Rules:\n\
         - \"intent\" must be one of the labels above\n\
         - \"summary\" is one or two sentences\n\
         - \"draft\" is the reply body only: no subject line, no placeholders in brackets\n\
         - Address the sender by name when it is known\n",
    );
    prompt.push_str(&format!("- {}\n", Tone::Formal.instruction()));
    prompt
}

/// User prompt carrying the email itself.
pub(super) fn email_prompt(email: &FetchedEmail) -> String {
    let mut prompt = String::with_capacity(512);
    prompt.push_str(&format!("From: {}", email.sender));
    if let Some(ref name) = email.sender_name {
        prompt.push_str(&format!(" ({})", name));
    }
    prompt.push('\n');
    prompt.push_str(&format!("Subject: {}\n", email.subject));

    let preview: String = email.body.chars().take(BODY_PREVIEW_CHARS).collect();
    prompt.push_str(&format!("\nMessage:\n{}", preview));
    prompt
}

/// System prompt for rewriting a draft in a new tone.
pub(super) fn regenerate_system_prompt(intent: &Intent, tone: &Tone) -> String {
    format!(
        "You are an email assistant drafting a reply for a human to review.\n\n\
         {}\n{}\n\n\
         Respond with ONLY the reply body: no subject line, no commentary, \
         no placeholders in brackets.",
        intent.drafting_context(),
        tone.instruction(),
    )
}

/// User prompt for regeneration: the original email plus the current draft.
pub(super) fn regenerate_prompt(record: &EmailRecord) -> String {
    let mut prompt = String::with_capacity(512);
    prompt.push_str(&format!("From: {}", record.sender));
    if let Some(ref name) = record.sender_name {
        prompt.push_str(&format!(" ({})", name));
    }
    prompt.push('\n');
    prompt.push_str(&format!("Subject: {}\n", record.subject));

    let preview: String = record.body.chars().take(BODY_PREVIEW_CHARS).collect();
    prompt.push_str(&format!("\nMessage:\n{}\n", preview));
    prompt.push_str(&format!("\nCurrent draft:\n{}", record.draft_reply));
    prompt
}
