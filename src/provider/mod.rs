//! Messaging provider client.
//!
//! The engine depends only on [`ProviderClient`]: fetch messages newer than a
//! watermark, send a reply, list tagged conversations. Credential handling
//! lives in [`auth`] as a decorator around the raw [`http::HttpProviderClient`].

pub mod auth;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

pub use auth::{AutoRefresh, ProviderTokens, RefreshableClient, with_auto_refresh};
pub use http::HttpProviderClient;

/// Who a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sent by the contact (human-originated).
    Inbound,
    /// Sent by the business side: an AI reply, a manual reply or a system message.
    Outbound,
}

/// Channel a message travels on. Replies go out on the inbound message's type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Sms,
    Email,
    Whatsapp,
    Live,
    Fb,
    Ig,
    #[serde(untagged)]
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Sms => "SMS",
            Self::Email => "EMAIL",
            Self::Whatsapp => "WHATSAPP",
            Self::Live => "LIVE",
            Self::Fb => "FB",
            Self::Ig => "IG",
            Self::Other(s) => s,
        }
    }
}

/// A message as returned by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub body: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub contact_name: Option<String>,
}

impl ProviderMessage {
    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }
}

/// A conversation found by tag search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedConversation {
    pub conversation_id: String,
    pub location_id: String,
    #[serde(default)]
    pub contact_id: Option<String>,
}

/// Plain fetch/send contract. Implementations own their retry and auth policy.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Messages strictly newer than `after_message_id`, oldest first.
    /// With no watermark, the most recent page of the conversation.
    async fn fetch_new_messages(
        &self,
        conversation_id: &str,
        after_message_id: Option<&str>,
    ) -> Result<Vec<ProviderMessage>, ProviderError>;

    /// Send a reply. Returns the provider's id for the new message.
    async fn send_message(
        &self,
        conversation_id: &str,
        body: &str,
        message_type: &MessageType,
    ) -> Result<String, ProviderError>;

    /// Conversations carrying `tag`.
    async fn list_tagged_conversations(
        &self,
        tag: &str,
    ) -> Result<Vec<TaggedConversation>, ProviderError>;
}
