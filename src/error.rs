//! Error types for the autopilot engine.
//!
//! Gating outcomes (quota, hours, keywords, ledger conflicts) are not errors;
//! they are values on `Verdict`, `ClaimOutcome` and `Outcome`. Everything in
//! here is an actual failure of a collaborator.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Generator error: {0}")]
    Generator(#[from] GeneratorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Messaging provider errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider rejected the access token")]
    Unauthorized,

    #[error("Provider rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The request never reached the provider.
    #[error("Connection error: {0}")]
    Connect(String),

    /// The request may or may not have been processed (timeout, dropped response).
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response from provider: {0}")]
    InvalidResponse(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

impl ProviderError {
    /// Whether the same request may succeed if simply sent again later.
    ///
    /// `Unauthorized` is excluded: it needs a token refresh first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Connect(_) | Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500,
            Self::Unauthorized | Self::InvalidResponse(_) | Self::RefreshFailed(_) => false,
        }
    }

    /// Whether the provider certainly did not act on the request, so even a
    /// non-idempotent call (sending a message) may be repeated.
    pub fn is_safe_to_resend(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Connect(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// AI generator errors.
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("Generator {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Generator returned an empty reply")]
    EmptyResponse,
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
