//! Email record model: statuses, intent and tone labels, and the record itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mail::FetchedEmail;

/// Review status of an email record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    /// Awaiting human review.
    Pending,
    /// Approved by a human, ready to send.
    Approved,
    /// Rejected by a human. Can be revived by editing.
    Rejected,
    /// Reply was submitted. Terminal and immutable.
    Sent,
}

impl EmailStatus {
    pub const ALL: [EmailStatus; 4] = [
        EmailStatus::Pending,
        EmailStatus::Approved,
        EmailStatus::Rejected,
        EmailStatus::Sent,
    ];

    /// Whether a human edit may move a record from `self` to `target`.
    ///
    /// `sent` is never an edit target; it is only reachable through a
    /// successful send of an approved record.
    pub fn can_edit_to(self, target: EmailStatus) -> bool {
        match (self, target) {
            (EmailStatus::Sent, _) | (_, EmailStatus::Sent) => false,
            _ => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Sent => "sent",
        }
    }
}

impl std::fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EmailStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "sent" => Ok(Self::Sent),
            _ => Err(format!("Unknown email status: {}", s)),
        }
    }
}

/// Classified purpose of an email.
///
/// Stored and serialized as its display label. Labels written by a newer
/// build load as `Unrecognized` instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Intent {
    MeetingRequest,
    JobInquiry,
    Complaint,
    Feedback,
    SupportRequest,
    FollowUp,
    Other,
    Unrecognized(String),
}

impl Intent {
    pub const KNOWN: [Intent; 7] = [
        Intent::MeetingRequest,
        Intent::JobInquiry,
        Intent::Complaint,
        Intent::Feedback,
        Intent::SupportRequest,
        Intent::FollowUp,
        Intent::Other,
    ];

    pub fn label(&self) -> &str {
        match self {
            Self::MeetingRequest => "Meeting Request",
            Self::JobInquiry => "Job Inquiry",
            Self::Complaint => "Complaint",
            Self::Feedback => "Feedback",
            Self::SupportRequest => "Support Request",
            Self::FollowUp => "Follow-up",
            Self::Other => "Other",
            Self::Unrecognized(label) => label,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::MeetingRequest => "Meeting or call scheduling",
            Self::JobInquiry => "Job opportunities or applications",
            Self::Complaint => "Dissatisfaction or problems",
            Self::Feedback => "Feedback or suggestions",
            Self::SupportRequest => "Help or technical support",
            Self::FollowUp => "Following up on previous conversation",
            Self::Other | Self::Unrecognized(_) => "General inquiries",
        }
    }

    /// Guidance handed to the drafting prompt.
    pub fn drafting_context(&self) -> &'static str {
        match self {
            Self::MeetingRequest => {
                "This is a meeting request. Consider availability, scheduling preferences, and meeting purpose."
            }
            Self::JobInquiry => {
                "This is a job inquiry. Consider the candidate's qualifications and the hiring process."
            }
            Self::Complaint => {
                "This is a complaint. Address concerns professionally and offer solutions."
            }
            Self::Feedback => {
                "This is feedback. Acknowledge the input and show appreciation for their time."
            }
            Self::SupportRequest => {
                "This is a support request. Provide helpful guidance or escalate appropriately."
            }
            Self::FollowUp => {
                "This is a follow-up. Reference the previous conversation and provide updates."
            }
            Self::Other | Self::Unrecognized(_) => {
                "This is a general inquiry. Provide a helpful and professional response."
            }
        }
    }

    /// Map a label produced by the language model onto the known set.
    ///
    /// Matching ignores case and separators, so "meeting_request" and
    /// "Meeting Request" agree. Anything else becomes `Other`.
    pub fn from_model_label(raw: &str) -> Self {
        let wanted = normalize_label(raw);
        Self::KNOWN
            .into_iter()
            .find(|known| normalize_label(known.label()) == wanted)
            .unwrap_or(Self::Other)
    }
}

impl From<String> for Intent {
    fn from(label: String) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|known| known.label() == label)
            .unwrap_or(Self::Unrecognized(label))
    }
}

impl From<Intent> for String {
    fn from(intent: Intent) -> Self {
        match intent {
            Intent::Unrecognized(label) => label,
            other => other.label().to_string(),
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Stylistic register of a reply draft.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Tone {
    #[default]
    Formal,
    Friendly,
    Apologetic,
    Assertive,
    Unrecognized(String),
}

impl Tone {
    pub const KNOWN: [Tone; 4] = [Tone::Formal, Tone::Friendly, Tone::Apologetic, Tone::Assertive];

    pub fn label(&self) -> &str {
        match self {
            Self::Formal => "Formal",
            Self::Friendly => "Friendly",
            Self::Apologetic => "Apologetic",
            Self::Assertive => "Assertive",
            Self::Unrecognized(label) => label,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Formal => "Professional and business-like",
            Self::Friendly => "Warm and approachable",
            Self::Apologetic => "Sincere and apologetic",
            Self::Assertive => "Confident and direct",
            Self::Unrecognized(_) => "Unknown tone",
        }
    }

    /// Instruction handed to the drafting prompt.
    pub fn instruction(&self) -> &'static str {
        match self {
            Self::Formal | Self::Unrecognized(_) => {
                "Write a formal, professional response using business language and proper etiquette."
            }
            Self::Friendly => {
                "Write a warm, friendly response that maintains professionalism while being approachable."
            }
            Self::Apologetic => {
                "Write a response that acknowledges any issues and expresses sincere apologies where appropriate."
            }
            Self::Assertive => {
                "Write a confident, direct response that clearly states your position or requirements."
            }
        }
    }

    /// Parse user input, accepting only the known tones (case-insensitive).
    pub fn parse_known(raw: &str) -> Option<Self> {
        let wanted = normalize_label(raw);
        Self::KNOWN
            .into_iter()
            .find(|known| normalize_label(known.label()) == wanted)
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }
}

impl From<String> for Tone {
    fn from(label: String) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|known| known.label() == label)
            .unwrap_or(Self::Unrecognized(label))
    }
}

impl From<Tone> for String {
    fn from(tone: Tone) -> Self {
        match tone {
            Tone::Unrecognized(label) => label,
            other => other.label().to_string(),
        }
    }
}

impl std::fmt::Display for Tone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

fn normalize_label(s: &str) -> String {
    s.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '.')
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// One processed email awaiting, or done with, human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: Uuid,
    /// `Message-ID` header of the source message, used for dedup and threading.
    pub message_id: String,
    pub sender: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub intent: Intent,
    pub summary: Option<String>,
    pub draft_reply: String,
    pub tone: Tone,
    pub status: EmailStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailRecord {
    /// Build a fresh pending record from a fetched message and its classification.
    pub fn new(
        email: &FetchedEmail,
        intent: Intent,
        summary: Option<String>,
        draft_reply: impl Into<String>,
        tone: Tone,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            message_id: email.message_id.clone(),
            sender: email.sender.clone(),
            sender_name: email.sender_name.clone(),
            subject: email.subject.clone(),
            body: email.body.clone(),
            received_at: email.received_at,
            intent,
            summary,
            draft_reply: draft_reply.into(),
            tone,
            status: EmailStatus::Pending,
            sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == EmailStatus::Sent
    }
}

/// Per-status record counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub approved: u64,
    pub rejected: u64,
    pub sent: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.approved + self.rejected + self.sent
    }

    pub fn add(&mut self, status: EmailStatus, count: u64) {
        match status {
            EmailStatus::Pending => self.pending += count,
            EmailStatus::Approved => self.approved += count,
            EmailStatus::Rejected => self.rejected += count,
            EmailStatus::Sent => self.sent += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in EmailStatus::ALL {
            assert_eq!(status.as_str().parse::<EmailStatus>().unwrap(), status);
        }
        assert!("archived".parse::<EmailStatus>().is_err());
    }

    #[test]
    fn sent_is_never_an_edit_target() {
        for from in EmailStatus::ALL {
            assert!(!from.can_edit_to(EmailStatus::Sent));
        }
    }

    #[test]
    fn sent_records_cannot_be_edited_anywhere() {
        for to in EmailStatus::ALL {
            assert!(!EmailStatus::Sent.can_edit_to(to));
        }
    }

    #[test]
    fn rejected_can_be_revived() {
        assert!(EmailStatus::Rejected.can_edit_to(EmailStatus::Pending));
        assert!(EmailStatus::Rejected.can_edit_to(EmailStatus::Approved));
        assert!(EmailStatus::Approved.can_edit_to(EmailStatus::Rejected));
    }

    #[test]
    fn intent_serializes_as_label() {
        let json = serde_json::to_string(&Intent::MeetingRequest).unwrap();
        assert_eq!(json, "\"Meeting Request\"");
        let back: Intent = serde_json::from_str("\"Follow-up\"").unwrap();
        assert_eq!(back, Intent::FollowUp);
    }

    #[test]
    fn unknown_stored_intent_is_preserved() {
        let intent: Intent = serde_json::from_str("\"Invoice\"").unwrap();
        assert_eq!(intent, Intent::Unrecognized("Invoice".into()));
        assert_eq!(serde_json::to_string(&intent).unwrap(), "\"Invoice\"");
    }

    #[test]
    fn model_labels_are_matched_loosely() {
        assert_eq!(Intent::from_model_label("meeting_request"), Intent::MeetingRequest);
        assert_eq!(Intent::from_model_label(" \"Support Request\". "), Intent::SupportRequest);
        assert_eq!(Intent::from_model_label("FOLLOW UP"), Intent::FollowUp);
        assert_eq!(Intent::from_model_label("Newsletter"), Intent::Other);
        assert_eq!(Intent::from_model_label(""), Intent::Other);
    }

    #[test]
    fn tone_parse_known_rejects_unknown() {
        assert_eq!(Tone::parse_known("friendly"), Some(Tone::Friendly));
        assert_eq!(Tone::parse_known("Assertive"), Some(Tone::Assertive));
        assert_eq!(Tone::parse_known("sarcastic"), None);
    }

    #[test]
    fn default_tone_is_formal() {
        assert_eq!(Tone::default(), Tone::Formal);
    }

    #[test]
    fn status_counts_total() {
        let mut counts = StatusCounts::default();
        counts.add(EmailStatus::Pending, 3);
        counts.add(EmailStatus::Sent, 2);
        assert_eq!(counts.total(), 5);
        assert_eq!(counts.pending, 3);
    }
}
