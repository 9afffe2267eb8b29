//! AI reply generation.
//!
//! The pipeline asks a [`ReplyGenerator`] for reply text given the recent
//! conversation and the policy's agent parameters. [`RigGenerator`] is the
//! production implementation on top of rig-core.

mod rig_generator;

pub use rig_generator::RigGenerator;

use async_trait::async_trait;

use crate::error::GeneratorError;
use crate::provider::{Direction, MessageType, ProviderMessage};

/// What the generator sees of a conversation.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub contact_name: Option<String>,
    /// Channel the reply will be sent on.
    pub message_type: MessageType,
    /// Recent messages, oldest first. The last inbound one is being answered.
    pub messages: Vec<ProviderMessage>,
}

impl ConversationContext {
    /// Keep at most `limit` of the newest messages.
    pub fn new(
        conversation_id: &str,
        contact_name: Option<String>,
        message_type: MessageType,
        mut messages: Vec<ProviderMessage>,
        limit: usize,
    ) -> Self {
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Self {
            conversation_id: conversation_id.to_string(),
            contact_name,
            message_type,
            messages,
        }
    }
}

/// Produces reply text. Implementations must not send anything themselves.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(
        &self,
        context: &ConversationContext,
        agent_id: Option<&str>,
        model: &str,
        temperature: f32,
    ) -> Result<String, GeneratorError>;
}

// ── Prompt construction ─────────────────────────────────────────────

/// System prompt for an automated reply.
pub fn build_reply_preamble(agent_id: Option<&str>, message_type: &MessageType) -> String {
    let mut prompt = String::from(
        "You are replying on behalf of a business to a customer conversation.\n\n\
         Rules:\n\
         - Answer the customer's most recent message directly\n\
         - Keep it short and natural, as a person would write it\n\
         - Never invent prices, availability or commitments that are not in the conversation\n\
         - Reply with the message text only, no quotes or labels\n",
    );
    match message_type {
        MessageType::Sms | MessageType::Whatsapp => {
            prompt.push_str("- This is a text message: two or three sentences at most\n");
        }
        MessageType::Email => {
            prompt.push_str("- This is an email: a short greeting and sign-off are fine\n");
        }
        _ => {}
    }
    if let Some(agent) = agent_id {
        prompt.push_str(&format!("\nAgent profile: {agent}\n"));
    }
    prompt
}

/// User prompt: the transcript, labelled by speaker.
pub fn build_transcript_prompt(context: &ConversationContext) -> String {
    let customer = context.contact_name.as_deref().unwrap_or("Customer");
    let mut prompt = String::with_capacity(256 + context.messages.len() * 128);

    prompt.push_str(&format!("Channel: {}\n", context.message_type.as_str()));
    prompt.push_str("Conversation so far:\n\n");
    for message in &context.messages {
        let speaker = match message.direction {
            Direction::Inbound => customer,
            Direction::Outbound => "Business",
        };
        prompt.push_str(&format!(
            "[{}] {speaker}: {}\n",
            message.timestamp.format("%Y-%m-%d %H:%M"),
            message.body.trim()
        ));
    }
    prompt.push_str("\nWrite the business's next reply.");
    prompt
}
