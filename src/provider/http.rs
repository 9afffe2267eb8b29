//! REST client for the messaging provider.
//!
//! Raw calls only: a `401` surfaces as `ProviderError::Unauthorized` and is
//! handled by the [`AutoRefresh`](super::AutoRefresh) decorator, which calls
//! back into [`RefreshableClient::refresh_credentials`] here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::config::ProviderConfig;
use crate::error::{ConfigError, Error, ProviderError};
use crate::provider::auth::{ProviderTokens, RefreshableClient};
use crate::provider::{Direction, MessageType, ProviderClient, ProviderMessage, TaggedConversation};
use crate::store::Database;

/// API version header the provider requires on every call.
const API_VERSION: &str = "2021-07-28";

/// Messages requested per fetch. The watermark is expected within this page.
const PAGE_LIMIT: usize = 50;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A second refresh this soon after the last one reuses its result.
const REFRESH_DEBOUNCE: Duration = Duration::from_secs(5);

/// Longest error body kept in `ProviderError::Http`.
const MAX_ERROR_BODY: usize = 512;

/// HTTP implementation of [`ProviderClient`].
pub struct HttpProviderClient {
    config: ProviderConfig,
    http: reqwest::Client,
    tokens: RwLock<ProviderTokens>,
    /// Serializes refreshes; holds the time of the last successful one.
    refresh_gate: Mutex<Option<Instant>>,
    store: Option<Arc<dyn Database>>,
}

impl HttpProviderClient {
    pub fn new(
        config: ProviderConfig,
        tokens: ProviderTokens,
        store: Option<Arc<dyn Database>>,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            http,
            tokens: RwLock::new(tokens),
            refresh_gate: Mutex::new(None),
            store,
        })
    }

    /// Build a client from stored credentials, seeding them from config on first run.
    pub async fn from_store(
        config: ProviderConfig,
        store: Arc<dyn Database>,
    ) -> Result<Self, Error> {
        let tokens = match store.get_credentials(&config.location_id).await? {
            Some(tokens) => {
                debug!(location_id = %config.location_id, "Using stored provider credentials");
                tokens
            }
            None => {
                let refresh_token = config.refresh_token.clone().ok_or_else(|| {
                    ConfigError::MissingEnvVar("PROVIDER_REFRESH_TOKEN".to_string())
                })?;
                let tokens = ProviderTokens {
                    access_token: config
                        .access_token
                        .clone()
                        .unwrap_or_else(|| SecretString::from(String::new())),
                    refresh_token,
                    expires_at: None,
                };
                store.save_credentials(&config.location_id, &tokens).await?;
                info!(location_id = %config.location_id, "Seeded provider credentials from environment");
                tokens
            }
        };

        Ok(Self::new(config, tokens, Some(store))?)
    }

    async fn bearer(&self) -> SecretString {
        self.tokens.read().await.access_token.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessagesEnvelope {
    messages: MessagesPage,
}

#[derive(Debug, Deserialize)]
struct MessagesPage {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    id: String,
    conversation_id: String,
    direction: Direction,
    #[serde(default)]
    body: String,
    #[serde(default)]
    message_type: Option<String>,
    date_added: DateTime<Utc>,
    #[serde(default)]
    contact_id: Option<String>,
    #[serde(default)]
    contact_name: Option<String>,
}

impl From<WireMessage> for ProviderMessage {
    fn from(m: WireMessage) -> Self {
        Self {
            message_type: parse_message_type(m.message_type.as_deref()),
            id: m.id,
            conversation_id: m.conversation_id,
            direction: m.direction,
            body: m.body,
            timestamp: m.date_added,
            contact_id: m.contact_id,
            contact_name: m.contact_name,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    conversations: Vec<WireConversation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireConversation {
    id: String,
    location_id: String,
    #[serde(default)]
    contact_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Map the provider's `TYPE_SMS` style names onto [`MessageType`].
/// A missing type is treated as SMS.
fn parse_message_type(raw: Option<&str>) -> MessageType {
    let Some(raw) = raw else {
        return MessageType::Sms;
    };
    let name = raw.strip_prefix("TYPE_").unwrap_or(raw).to_ascii_uppercase();
    match name.as_str() {
        "SMS" => MessageType::Sms,
        "EMAIL" => MessageType::Email,
        "WHATSAPP" => MessageType::Whatsapp,
        "LIVE_CHAT" | "LIVE" => MessageType::Live,
        "FACEBOOK" | "FB" => MessageType::Fb,
        "INSTAGRAM" | "IG" => MessageType::Ig,
        _ => MessageType::Other(name),
    }
}

/// Reduce a newest-first page to the messages after `watermark`, oldest first.
///
/// A watermark missing from the page means everything on it is new.
fn messages_after(page: Vec<ProviderMessage>, watermark: Option<&str>) -> Vec<ProviderMessage> {
    let mut fresh: Vec<ProviderMessage> = match watermark {
        Some(w) => page.into_iter().take_while(|m| m.id != w).collect(),
        None => page,
    };
    fresh.sort_by_key(|m| m.timestamp);
    fresh
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Turn non-success statuses into the matching `ProviderError`.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(ProviderError::Unauthorized),
        StatusCode::TOO_MANY_REQUESTS => Err(ProviderError::RateLimited {
            retry_after: retry_after(resp.headers()),
        }),
        _ => {
            let mut body = resp.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn fetch_new_messages(
        &self,
        conversation_id: &str,
        after_message_id: Option<&str>,
    ) -> Result<Vec<ProviderMessage>, ProviderError> {
        let token = self.bearer().await;
        let resp = self
            .http
            .get(self.url(&format!("/conversations/{conversation_id}/messages")))
            .bearer_auth(token.expose_secret())
            .header("Version", API_VERSION)
            .query(&[("limit", PAGE_LIMIT.to_string())])
            .send()
            .await?;
        let envelope: MessagesEnvelope = check_status(resp).await?.json().await?;

        let page: Vec<ProviderMessage> = envelope
            .messages
            .messages
            .into_iter()
            .map(ProviderMessage::from)
            .collect();
        let fetched = page.len();
        let fresh = messages_after(page, after_message_id);
        debug!(conversation_id, fetched, new = fresh.len(), "Fetched messages");
        Ok(fresh)
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        body: &str,
        message_type: &MessageType,
    ) -> Result<String, ProviderError> {
        let token = self.bearer().await;
        let resp = self
            .http
            .post(self.url("/conversations/messages"))
            .bearer_auth(token.expose_secret())
            .header("Version", API_VERSION)
            .json(&json!({
                "type": message_type.as_str(),
                "conversationId": conversation_id,
                "message": body,
            }))
            .send()
            .await?;
        let sent: SendResponse = check_status(resp).await?.json().await?;
        debug!(conversation_id, message_id = %sent.message_id, "Message sent");
        Ok(sent.message_id)
    }

    async fn list_tagged_conversations(
        &self,
        tag: &str,
    ) -> Result<Vec<TaggedConversation>, ProviderError> {
        let token = self.bearer().await;
        let resp = self
            .http
            .get(self.url("/conversations/search"))
            .bearer_auth(token.expose_secret())
            .header("Version", API_VERSION)
            .query(&[("locationId", self.config.location_id.as_str()), ("tags", tag)])
            .send()
            .await?;
        let found: SearchResponse = check_status(resp).await?.json().await?;

        Ok(found
            .conversations
            .into_iter()
            .map(|c| TaggedConversation {
                conversation_id: c.id,
                location_id: c.location_id,
                contact_id: c.contact_id,
            })
            .collect())
    }
}

#[async_trait]
impl RefreshableClient for HttpProviderClient {
    async fn refresh_credentials(&self) -> Result<(), ProviderError> {
        let mut last_refresh = self.refresh_gate.lock().await;
        if let Some(at) = *last_refresh
            && at.elapsed() < REFRESH_DEBOUNCE
        {
            debug!("Credentials refreshed moments ago, reusing them");
            return Ok(());
        }

        let current_refresh = self.tokens.read().await.refresh_token.clone();
        let resp = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose_secret()),
                ("refresh_token", current_refresh.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::RefreshFailed(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ProviderError::RefreshFailed(e.to_string()))?;
        if !status.is_success() {
            return Err(ProviderError::RefreshFailed(format!("HTTP {status}: {body}")));
        }
        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::RefreshFailed(format!("bad token response: {e}")))?;

        let tokens = ProviderTokens {
            access_token: SecretString::from(token.access_token),
            refresh_token: token
                .refresh_token
                .map(SecretString::from)
                .unwrap_or(current_refresh),
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        };

        // The new pair is already live at the provider; losing it on disk is
        // logged but does not fail the call.
        if let Some(store) = &self.store
            && let Err(e) = store
                .save_credentials(&self.config.location_id, &tokens)
                .await
        {
            error!(location_id = %self.config.location_id, error = %e, "Failed to persist refreshed credentials");
        }

        *self.tokens.write().await = tokens;
        *last_refresh = Some(Instant::now());
        info!(location_id = %self.config.location_id, "Provider credentials refreshed");
        Ok(())
    }

    fn credentials_expired(&self) -> bool {
        self.tokens
            .try_read()
            .map(|t| t.is_expired(Utc::now()))
            .unwrap_or(false)
    }
}
