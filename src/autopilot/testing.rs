//! In-process doubles for the provider and the generator.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Barrier;

use crate::error::{GeneratorError, ProviderError};
use crate::generator::{ConversationContext, ReplyGenerator};
use crate::provider::{Direction, MessageType, ProviderClient, ProviderMessage, TaggedConversation};

pub fn ts(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
}

pub fn inbound(conversation_id: &str, id: &str, body: &str, at: DateTime<Utc>) -> ProviderMessage {
    ProviderMessage {
        id: id.into(),
        conversation_id: conversation_id.into(),
        direction: Direction::Inbound,
        body: body.into(),
        message_type: MessageType::Sms,
        timestamp: at,
        contact_id: Some(format!("contact-{conversation_id}")),
        contact_name: Some("Dana".into()),
    }
}

pub fn outbound(conversation_id: &str, id: &str, body: &str, at: DateTime<Utc>) -> ProviderMessage {
    ProviderMessage {
        direction: Direction::Outbound,
        contact_id: None,
        contact_name: None,
        ..inbound(conversation_id, id, body, at)
    }
}

#[derive(Debug, Clone)]
pub struct SentReply {
    pub conversation_id: String,
    pub body: String,
    pub message_type: MessageType,
}

/// Provider holding conversations in memory, oldest message first.
#[derive(Default)]
pub struct StubProvider {
    conversations: Mutex<HashMap<String, Vec<ProviderMessage>>>,
    pub sent: Mutex<Vec<SentReply>>,
    pub tagged: Mutex<Vec<TaggedConversation>>,
    fail_fetch: Mutex<Vec<String>>,
    fail_send: Mutex<bool>,
    fetch_barrier: Option<Arc<Barrier>>,
    sends: AtomicU32,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch waits until `parties` fetches are in flight.
    pub fn with_fetch_barrier(parties: usize) -> Self {
        Self {
            fetch_barrier: Some(Arc::new(Barrier::new(parties))),
            ..Self::default()
        }
    }

    pub fn push(&self, message: ProviderMessage) {
        self.conversations
            .lock()
            .unwrap()
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }

    pub fn fail_fetch_for(&self, conversation_id: &str) {
        self.fail_fetch.lock().unwrap().push(conversation_id.to_string());
    }

    pub fn fail_sends(&self) {
        *self.fail_send.lock().unwrap() = true;
    }

    pub fn sent(&self) -> Vec<SentReply> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderClient for StubProvider {
    async fn fetch_new_messages(
        &self,
        conversation_id: &str,
        after_message_id: Option<&str>,
    ) -> Result<Vec<ProviderMessage>, ProviderError> {
        if let Some(barrier) = &self.fetch_barrier {
            barrier.wait().await;
        }
        if self
            .fail_fetch
            .lock()
            .unwrap()
            .iter()
            .any(|c| c == conversation_id)
        {
            return Err(ProviderError::Http {
                status: 503,
                body: "unavailable".into(),
            });
        }

        let all = self
            .conversations
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        let start = after_message_id
            .and_then(|w| all.iter().position(|m| m.id == w))
            .map_or(0, |i| i + 1);
        Ok(all[start..].to_vec())
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        body: &str,
        message_type: &MessageType,
    ) -> Result<String, ProviderError> {
        if *self.fail_send.lock().unwrap() {
            return Err(ProviderError::Http {
                status: 422,
                body: "rejected".into(),
            });
        }
        let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent.lock().unwrap().push(SentReply {
            conversation_id: conversation_id.into(),
            body: body.into(),
            message_type: message_type.clone(),
        });
        Ok(format!("reply-{n}"))
    }

    async fn list_tagged_conversations(
        &self,
        _tag: &str,
    ) -> Result<Vec<TaggedConversation>, ProviderError> {
        Ok(self.tagged.lock().unwrap().clone())
    }
}

/// Generator returning a fixed reply, or failing.
pub struct StubGenerator {
    reply: Option<String>,
    pub calls: AtomicU32,
    pub last_context: Mutex<Option<ConversationContext>>,
    panic_on: Option<String>,
}

impl StubGenerator {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            calls: AtomicU32::new(0),
            last_context: Mutex::new(None),
            panic_on: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            ..Self::replying("")
        }
    }

    /// Panics when asked to answer `conversation_id`.
    pub fn panicking_on(conversation_id: &str) -> Self {
        Self {
            panic_on: Some(conversation_id.to_string()),
            ..Self::replying("Happy to help!")
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplyGenerator for StubGenerator {
    async fn generate(
        &self,
        context: &ConversationContext,
        _agent_id: Option<&str>,
        _model: &str,
        _temperature: f32,
    ) -> Result<String, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on.as_deref() == Some(context.conversation_id.as_str()) {
            panic!("generator blew up");
        }
        *self.last_context.lock().unwrap() = Some(context.clone());
        self.reply.clone().ok_or_else(|| GeneratorError::RequestFailed {
            provider: "stub".into(),
            reason: "model overloaded".into(),
        })
    }
}
