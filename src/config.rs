//! Configuration types, built from environment variables.

use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default bound on conversations processed concurrently in one cycle.
const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default number of recent messages handed to the generator.
const DEFAULT_CONTEXT_LIMIT: usize = 20;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct AutopilotConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Port for the trigger endpoint.
    pub port: u16,
    /// Maximum conversations processed concurrently per cycle.
    pub max_concurrency: usize,
    /// IANA timezone used for day rollover when a policy has no operating hours.
    pub default_timezone: String,
    /// Bearer secret required by the trigger endpoint (open when unset).
    pub trigger_secret: Option<SecretString>,
    /// Conversations carrying this tag get a policy created by reconciliation.
    pub auto_enable_tag: Option<String>,
    /// Number of fetched messages passed to the generator as context.
    pub context_limit: usize,
    /// Optional directory for daily-rolling log files.
    pub log_dir: Option<PathBuf>,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/autopilot.db"),
            port: 8080,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            default_timezone: "UTC".to_string(),
            trigger_secret: None,
            auto_enable_tag: None,
            context_limit: DEFAULT_CONTEXT_LIMIT,
            log_dir: None,
        }
    }
}

impl AutopilotConfig {
    /// Build config from `AUTOPILOT_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let default_timezone = std::env::var("AUTOPILOT_DEFAULT_TIMEZONE")
            .unwrap_or(defaults.default_timezone);
        if default_timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::InvalidValue {
                key: "AUTOPILOT_DEFAULT_TIMEZONE".into(),
                message: format!("unknown timezone '{default_timezone}'"),
            });
        }

        let max_concurrency = parse_env("AUTOPILOT_MAX_CONCURRENCY")?
            .unwrap_or(defaults.max_concurrency)
            .max(1);

        Ok(Self {
            db_path: std::env::var("AUTOPILOT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            port: parse_env("AUTOPILOT_PORT")?.unwrap_or(defaults.port),
            max_concurrency,
            default_timezone,
            trigger_secret: non_empty_env("AUTOPILOT_TRIGGER_SECRET").map(SecretString::from),
            auto_enable_tag: non_empty_env("AUTOPILOT_AUTO_ENABLE_TAG"),
            context_limit: parse_env("AUTOPILOT_CONTEXT_LIMIT")?
                .unwrap_or(defaults.context_limit),
            log_dir: non_empty_env("AUTOPILOT_LOG_DIR").map(PathBuf::from),
        })
    }
}

/// Messaging provider connection settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    /// Location (sub-account) whose credentials this client uses.
    pub location_id: String,
    /// Seed tokens, used when no credentials are stored yet.
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
}

impl ProviderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: required_env("PROVIDER_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            token_url: required_env("PROVIDER_TOKEN_URL")?,
            client_id: required_env("PROVIDER_CLIENT_ID")?,
            client_secret: SecretString::from(required_env("PROVIDER_CLIENT_SECRET")?),
            location_id: required_env("PROVIDER_LOCATION_ID")?,
            access_token: non_empty_env("PROVIDER_ACCESS_TOKEN").map(SecretString::from),
            refresh_token: non_empty_env("PROVIDER_REFRESH_TOKEN").map(SecretString::from),
        })
    }
}

/// Supported generator backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorBackend {
    Anthropic,
    OpenAi,
}

/// AI generator settings.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub backend: GeneratorBackend,
    pub api_key: SecretString,
}

impl GeneratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("LLM_BACKEND")
            .unwrap_or_else(|_| "anthropic".to_string())
            .to_lowercase()
            .as_str()
        {
            "anthropic" => GeneratorBackend::Anthropic,
            "openai" => GeneratorBackend::OpenAi,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "LLM_BACKEND".into(),
                    message: format!("expected 'anthropic' or 'openai', got '{other}'"),
                });
            }
        };

        let key_var = match backend {
            GeneratorBackend::Anthropic => "ANTHROPIC_API_KEY",
            GeneratorBackend::OpenAi => "OPENAI_API_KEY",
        };

        Ok(Self {
            backend,
            api_key: SecretString::from(required_env(key_var)?),
        })
    }
}

fn required_env(key: &str) -> Result<String, ConfigError> {
    non_empty_env(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match non_empty_env(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}
