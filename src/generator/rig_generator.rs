//! rig-core backed reply generator (Anthropic or OpenAI).

use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::client::CompletionClient;
use rig::completion::{CompletionModel, Prompt};
use rig::providers::{anthropic, openai};
use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::{GeneratorBackend, GeneratorConfig};
use crate::error::GeneratorError;
use crate::generator::{
    ConversationContext, ReplyGenerator, build_reply_preamble, build_transcript_prompt,
};

/// Replies are short; this also satisfies Anthropic's required `max_tokens`.
const MAX_REPLY_TOKENS: u64 = 512;

enum Backend {
    Anthropic(rig::client::Client<anthropic::client::AnthropicExt>),
    OpenAi(rig::client::Client<openai::client::OpenAIResponsesExt>),
}

/// [`ReplyGenerator`] that prompts a rig agent built per call from the
/// policy's model and temperature.
pub struct RigGenerator {
    backend: Backend,
}

impl RigGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self, GeneratorError> {
        let backend = match config.backend {
            GeneratorBackend::Anthropic => Backend::Anthropic(
                anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
                    GeneratorError::RequestFailed {
                        provider: "anthropic".to_string(),
                        reason: format!("Failed to create Anthropic client: {e}"),
                    }
                })?,
            ),
            GeneratorBackend::OpenAi => Backend::OpenAi(
                openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
                    GeneratorError::RequestFailed {
                        provider: "openai".to_string(),
                        reason: format!("Failed to create OpenAI client: {e}"),
                    }
                })?,
            ),
        };
        Ok(Self { backend })
    }

    fn provider_name(&self) -> &'static str {
        match self.backend {
            Backend::Anthropic(_) => "anthropic",
            Backend::OpenAi(_) => "openai",
        }
    }
}

async fn prompt_model<M: CompletionModel>(
    model: M,
    preamble: &str,
    prompt: String,
    temperature: f32,
) -> Result<String, String> {
    let agent = AgentBuilder::new(model)
        .preamble(preamble)
        .temperature(f64::from(temperature))
        .max_tokens(MAX_REPLY_TOKENS)
        .build();
    agent.prompt(prompt).await.map_err(|e| e.to_string())
}

#[async_trait]
impl ReplyGenerator for RigGenerator {
    async fn generate(
        &self,
        context: &ConversationContext,
        agent_id: Option<&str>,
        model: &str,
        temperature: f32,
    ) -> Result<String, GeneratorError> {
        let preamble = build_reply_preamble(agent_id, &context.message_type);
        let prompt = build_transcript_prompt(context);

        let result = match &self.backend {
            Backend::Anthropic(client) => {
                prompt_model(client.completion_model(model), &preamble, prompt, temperature).await
            }
            Backend::OpenAi(client) => {
                prompt_model(client.completion_model(model), &preamble, prompt, temperature).await
            }
        };

        let reply = result.map_err(|reason| GeneratorError::RequestFailed {
            provider: self.provider_name().to_string(),
            reason,
        })?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(GeneratorError::EmptyResponse);
        }

        debug!(
            conversation_id = %context.conversation_id,
            model,
            chars = reply.len(),
            "Reply generated"
        );
        Ok(reply.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn constructs_for_both_backends() {
        // rig-core clients accept any key at construction; auth fails on request.
        for backend in [GeneratorBackend::Anthropic, GeneratorBackend::OpenAi] {
            let config = GeneratorConfig {
                backend,
                api_key: SecretString::from("test-key"),
            };
            let generator = RigGenerator::new(&config).unwrap();
            let expected = match backend {
                GeneratorBackend::Anthropic => "anthropic",
                GeneratorBackend::OpenAi => "openai",
            };
            assert_eq!(generator.provider_name(), expected);
        }
    }
}
