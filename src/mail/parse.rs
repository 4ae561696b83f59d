//! Raw RFC 822 message parsing into [`FetchedEmail`] plus reply helpers.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use sha2::{Digest, Sha256};

use super::FetchedEmail;
use crate::error::MailError;

/// Parse a raw message fetched under `uid`.
pub fn parse_message(uid: u32, raw: &[u8]) -> Result<FetchedEmail, MailError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailError::Parse {
            uid,
            reason: "not an RFC 822 message".into(),
        })?;

    let from = parsed.from().and_then(|addr| addr.first());
    let sender = from
        .and_then(|a| a.address())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MailError::Parse {
            uid,
            reason: "missing From address".into(),
        })?;
    let sender_name = from
        .and_then(|a| a.name())
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty() && *s != sender);

    let subject = parsed
        .subject()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "(no subject)".to_string());

    let header_date = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0));
    let received_at = header_date.unwrap_or_else(Utc::now);

    let text = extract_text(&parsed);

    let message_id = parsed
        .message_id()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| synthetic_message_id(uid, &sender, &subject, &text, header_date));

    let stripped = strip_quoted_text(&text);
    let body = if stripped.trim().is_empty() {
        text
    } else {
        stripped
    };

    Ok(FetchedEmail {
        uid,
        message_id,
        sender,
        sender_name,
        subject,
        body,
        received_at,
    })
}

const SYNTHETIC_ID_PREFIX: &str = "synthetic.";

/// Stand-in for messages without a `Message-ID` header.
///
/// Built only from message content, so every fetch of the same message
/// yields the same id.
fn synthetic_message_id(
    uid: u32,
    sender: &str,
    subject: &str,
    body: &str,
    date: Option<DateTime<Utc>>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update([0]);
    hasher.update(subject.as_bytes());
    hasher.update([0]);
    hasher.update(body.as_bytes());
    if let Some(date) = date {
        hasher.update(date.timestamp().to_be_bytes());
    }
    let digest: String = hasher.finalize()[..12]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    let domain = sender.rsplit('@').next().unwrap_or("localhost");
    format!("{SYNTHETIC_ID_PREFIX}{uid}.{digest}@{domain}")
}

/// Whether `message_id` was made up locally rather than read from the message.
///
/// Such ids are only good for deduplication and must not be sent out as
/// threading headers.
pub fn is_synthetic_message_id(message_id: &str) -> bool {
    message_id.starts_with(SYNTHETIC_ID_PREFIX)
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            let name = MimeHeaders::attachment_name(part).unwrap_or("file");
            return format!("[Attachment: {name}]\n{text}");
        }
    }
    "(no readable content)".to_string()
}

/// Strip HTML tags, keeping paragraph breaks.
pub fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut tag = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let name = tag
                    .trim_start_matches('/')
                    .split(|c: char| c.is_whitespace() || c == '/')
                    .next()
                    .unwrap_or("")
                    .to_ascii_lowercase();
                if matches!(name.as_str(), "br" | "p" | "div" | "li" | "tr") {
                    result.push('\n');
                }
            }
            _ if in_tag => tag.push(ch),
            _ => result.push(ch),
        }
    }

    let decoded = result
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    let lines: Vec<String> = decoded
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect();
    lines.join("\n")
}

/// Drop quoted history from a reply body.
///
/// `>` lines are skipped; an "On ... wrote:" attribution or an
/// "Original Message" separator ends the body.
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }
        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }

        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}

/// Subject line for a reply: prefix with `Re: ` unless it already is one.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    let already_reply = trimmed
        .get(..3)
        .is_some_and(|p| p.eq_ignore_ascii_case("re:"));
    if already_reply {
        trimmed.to_string()
    } else if trimmed.is_empty() {
        "Re: (no subject)".to_string()
    } else {
        format!("Re: {trimmed}")
    }
}
