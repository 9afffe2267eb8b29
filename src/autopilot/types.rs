//! Persistent autopilot entities: policy, tracking, ledger entries.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Default model forwarded to the generator for auto-created policies.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Per-conversation automation configuration. One per conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutopilotPolicy {
    pub conversation_id: String,
    pub location_id: String,
    pub user_id: String,
    pub is_enabled: bool,
    /// Minimum quiet time after the newest human message.
    pub reply_delay_minutes: u32,
    /// Lifetime cap.
    pub max_replies_per_conversation: u32,
    /// Cap reset at the local-day boundary.
    pub max_replies_per_day: u32,
    pub operating_hours: Option<OperatingHours>,
    /// A human message after the last automated reply cancels stale continuations.
    pub cancel_on_user_reply: bool,
    pub require_human_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    // Forwarded to the generator, never interpreted here.
    pub agent_id: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutopilotPolicy {
    /// A policy with conservative defaults: enabled, no delay, 3 replies/day,
    /// 10 per conversation, no hours or keyword gates.
    pub fn new(conversation_id: &str, location_id: &str, user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.to_string(),
            location_id: location_id.to_string(),
            user_id: user_id.to_string(),
            is_enabled: true,
            reply_delay_minutes: 0,
            max_replies_per_conversation: 10,
            max_replies_per_day: 3,
            operating_hours: None,
            cancel_on_user_reply: false,
            require_human_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
            agent_id: None,
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            created_at: now,
            updated_at: now,
        }
    }

    /// Timezone that defines "today" for this policy, if it carries one.
    pub fn timezone(&self) -> Option<&str> {
        self.operating_hours.as_ref().map(|h| h.timezone.as_str())
    }
}

/// Allowed reply window in a named timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatingHours {
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// IANA name, e.g. `America/New_York`.
    pub timezone: String,
    /// Empty means every day.
    #[serde(default)]
    pub days_of_week: Vec<Weekday>,
}

/// Informational conversation state as last observed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// Newest message is from the contact.
    AwaitingReply,
    /// Newest message is from the business side.
    Replied,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingReply => "awaiting_reply",
            Self::Replied => "replied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "awaiting_reply" => Some(Self::AwaitingReply),
            "replied" => Some(Self::Replied),
            _ => None,
        }
    }
}

/// Engine-owned counters and timestamps for one conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationTracking {
    pub conversation_id: String,
    /// Watermark: newest message id seen, any direction.
    pub last_seen_message_id: Option<String>,
    pub last_human_message_at: Option<DateTime<Utc>>,
    pub last_ai_message_at: Option<DateTime<Utc>>,
    pub replies_total: u32,
    pub replies_today: u32,
    pub last_reply_date: Option<NaiveDate>,
    pub conversation_status: Option<ConversationStatus>,
    pub contact_id: Option<String>,
    pub contact_name: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ConversationTracking {
    pub fn new(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            ..Default::default()
        }
    }

    /// Replies counted against today's quota, honouring day rollover.
    pub fn replies_today_on(&self, today: NaiveDate) -> u32 {
        if self.last_reply_date == Some(today) {
            self.replies_today
        } else {
            0
        }
    }
}

/// Non-quota tracking fields derived from a fetched batch.
///
/// Persisting an observation never touches the reply counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub last_seen_message_id: Option<String>,
    pub last_human_message_at: Option<DateTime<Utc>>,
    pub conversation_status: Option<ConversationStatus>,
    pub contact_id: Option<String>,
    pub contact_name: Option<String>,
}

impl Observation {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Idempotency ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub processed_at: DateTime<Utc>,
}

/// Result of claiming a message in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns the message.
    Inserted,
    /// Another cycle claimed it first.
    AlreadyExists,
}
