//! Draft validation applied to human edits.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::WorkflowError;

pub const MIN_DRAFT_CHARS: usize = 10;
pub const MAX_DRAFT_CHARS: usize = 5000;

/// A markup pattern that must not appear in an outgoing draft.
struct BlockedPattern {
    regex: Regex,
    label: &'static str,
}

static BLOCKED_PATTERNS: LazyLock<Vec<BlockedPattern>> = LazyLock::new(|| {
    [
        (r"(?i)<script[^>]*>", "script tag"),
        (r"(?i)javascript:", "javascript: URL"),
        (r"(?i)onload\s*=", "onload handler"),
        (r"(?i)onerror\s*=", "onerror handler"),
        (r"(?i)<iframe[^>]*>", "iframe tag"),
        (r"(?i)<object[^>]*>", "object tag"),
        (r"(?i)<embed[^>]*>", "embed tag"),
    ]
    .into_iter()
    .map(|(pattern, label)| BlockedPattern {
        regex: Regex::new(pattern).expect("blocked draft pattern compiles"),
        label,
    })
    .collect()
});

/// Trim and check a human-submitted draft. Returns the trimmed text.
pub fn validate_draft(draft: &str) -> Result<String, WorkflowError> {
    let trimmed = draft.trim();
    let len = trimmed.chars().count();

    if len < MIN_DRAFT_CHARS {
        return Err(WorkflowError::Validation(format!(
            "draft must be at least {MIN_DRAFT_CHARS} characters"
        )));
    }
    if len > MAX_DRAFT_CHARS {
        return Err(WorkflowError::Validation(format!(
            "draft must be at most {MAX_DRAFT_CHARS} characters"
        )));
    }
    if let Some(blocked) = BLOCKED_PATTERNS.iter().find(|p| p.regex.is_match(trimmed)) {
        return Err(WorkflowError::Validation(format!(
            "draft contains disallowed content ({})",
            blocked.label
        )));
    }

    Ok(trimmed.to_string())
}
