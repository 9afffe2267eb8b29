//! Credential refresh as a decorator around a raw provider client.
//!
//! `with_auto_refresh(client)` wraps anything implementing
//! [`RefreshableClient`]. On a `401` it refreshes the token pair and retries;
//! on rate limits and network errors it backs off and retries. Sends are only
//! repeated when the provider certainly never processed the first attempt.
//! Callers only ever see the plain [`ProviderClient`] contract.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use secrecy::SecretString;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::provider::{MessageType, ProviderClient, ProviderMessage, TaggedConversation};

/// Total attempts per call, including the first.
pub const MAX_ATTEMPTS: u32 = 3;

/// Base delay for retryable failures; doubles per attempt.
const BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound on any single wait, including provider `Retry-After` hints.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Refresh this long before the recorded expiry.
const EXPIRY_SKEW_SECS: i64 = 5 * 60;

/// OAuth access/refresh token pair.
#[derive(Debug, Clone)]
pub struct ProviderTokens {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    /// Unknown when seeded from configuration.
    pub expires_at: Option<DateTime<Utc>>,
}

impl ProviderTokens {
    /// Expired or about to expire. Unknown expiry counts as valid; the
    /// provider's `401` is the authority then.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|at| now >= at - chrono::Duration::seconds(EXPIRY_SKEW_SECS))
    }
}

/// A provider client that can renew its own credentials.
#[async_trait]
pub trait RefreshableClient: ProviderClient {
    /// Exchange the refresh token for a new token pair.
    async fn refresh_credentials(&self) -> Result<(), ProviderError>;

    /// Whether credentials should be refreshed before the next call.
    fn credentials_expired(&self) -> bool {
        false
    }
}

/// Wrap `client` with refresh-and-retry behaviour.
pub fn with_auto_refresh<C: RefreshableClient>(client: C) -> AutoRefresh<C> {
    AutoRefresh {
        inner: client,
        max_attempts: MAX_ATTEMPTS,
        base_backoff: BASE_BACKOFF,
    }
}

/// Decorator returned by [`with_auto_refresh`].
pub struct AutoRefresh<C> {
    inner: C,
    max_attempts: u32,
    base_backoff: Duration,
}

impl<C: RefreshableClient> AutoRefresh<C> {
    /// Override the backoff base (tests use zero).
    pub fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn call<'a, T, F, Fut>(
        &'a self,
        operation: &'static str,
        idempotent: bool,
        call: F,
    ) -> Result<T, ProviderError>
    where
        F: Fn(&'a C) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if self.inner.credentials_expired() {
            debug!(operation, "Access token near expiry, refreshing first");
            self.inner.refresh_credentials().await?;
        }

        let mut attempt = 1;
        loop {
            match call(&self.inner).await {
                Ok(value) => return Ok(value),
                Err(ProviderError::Unauthorized) if attempt < self.max_attempts => {
                    warn!(operation, attempt, "Provider returned 401, refreshing credentials");
                    self.inner.refresh_credentials().await?;
                }
                Err(e)
                    if attempt < self.max_attempts
                        && (e.is_safe_to_resend() || (idempotent && e.is_retryable())) =>
                {
                    let delay = self.backoff(attempt, &e);
                    warn!(operation, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Retrying provider call");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
            attempt += 1;
        }
    }

    fn backoff(&self, attempt: u32, error: &ProviderError) -> Duration {
        if let ProviderError::RateLimited {
            retry_after: Some(hint),
        } = error
        {
            return (*hint).min(MAX_BACKOFF);
        }
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let exp = self.base_backoff.saturating_mul(1 << (attempt - 1).min(4));
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
        (exp + jitter).min(MAX_BACKOFF)
    }
}

#[async_trait]
impl<C: RefreshableClient> ProviderClient for AutoRefresh<C> {
    async fn fetch_new_messages(
        &self,
        conversation_id: &str,
        after_message_id: Option<&str>,
    ) -> Result<Vec<ProviderMessage>, ProviderError> {
        self.call("fetch_new_messages", true, |c| {
            c.fetch_new_messages(conversation_id, after_message_id)
        })
        .await
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        body: &str,
        message_type: &MessageType,
    ) -> Result<String, ProviderError> {
        self.call("send_message", false, |c| {
            c.send_message(conversation_id, body, message_type)
        })
        .await
    }

    async fn list_tagged_conversations(
        &self,
        tag: &str,
    ) -> Result<Vec<TaggedConversation>, ProviderError> {
        self.call("list_tagged_conversations", true, |c| c.list_tagged_conversations(tag))
            .await
    }
}
