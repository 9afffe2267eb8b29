//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written
//! as RFC 3339 with fixed microsecond precision so that SQL string
//! comparison orders them correctly.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::autopilot::types::{
    AutopilotPolicy, ClaimOutcome, ConversationStatus, ConversationTracking, Observation,
    OperatingHours, ProcessedMessage,
};
use crate::error::DatabaseError;
use crate::provider::ProviderTokens;
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_datetime(dt)),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

/// Counts are stored as INTEGER; negative values never pass the CHECK constraints.
fn to_count(v: i64) -> u32 {
    u32::try_from(v).unwrap_or(0)
}

const POLICY_COLUMNS: &str = "conversation_id, location_id, user_id, is_enabled, \
    reply_delay_minutes, max_replies_per_conversation, max_replies_per_day, operating_hours, \
    cancel_on_user_reply, require_human_keywords, exclude_keywords, agent_id, model, \
    temperature, created_at, updated_at";

const TRACKING_COLUMNS: &str = "conversation_id, last_seen_message_id, last_human_message_at, \
    last_ai_message_at, replies_total, replies_today, last_reply_date, conversation_status, \
    contact_id, contact_name, updated_at";

fn row_to_policy(row: &libsql::Row) -> Result<AutopilotPolicy, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row_to_policy: {e}"));

    let hours_json: Option<String> = row.get(7).ok();
    let operating_hours = match hours_json.as_deref() {
        Some(json) => Some(serde_json::from_str::<OperatingHours>(json).map_err(|e| {
            DatabaseError::Serialization(format!("operating_hours: {e}"))
        })?),
        None => None,
    };
    let require: String = row.get(9).map_err(get_err)?;
    let exclude: String = row.get(10).map_err(get_err)?;
    let created: String = row.get(14).map_err(get_err)?;
    let updated: String = row.get(15).map_err(get_err)?;

    Ok(AutopilotPolicy {
        conversation_id: row.get(0).map_err(get_err)?,
        location_id: row.get(1).map_err(get_err)?,
        user_id: row.get(2).map_err(get_err)?,
        is_enabled: row.get::<i64>(3).map_err(get_err)? != 0,
        reply_delay_minutes: to_count(row.get(4).map_err(get_err)?),
        max_replies_per_conversation: to_count(row.get(5).map_err(get_err)?),
        max_replies_per_day: to_count(row.get(6).map_err(get_err)?),
        operating_hours,
        cancel_on_user_reply: row.get::<i64>(8).map_err(get_err)? != 0,
        require_human_keywords: serde_json::from_str(&require)
            .map_err(|e| DatabaseError::Serialization(format!("require_human_keywords: {e}")))?,
        exclude_keywords: serde_json::from_str(&exclude)
            .map_err(|e| DatabaseError::Serialization(format!("exclude_keywords: {e}")))?,
        agent_id: row.get(11).ok(),
        model: row.get(12).map_err(get_err)?,
        temperature: row.get::<f64>(13).map_err(get_err)? as f32,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_tracking(row: &libsql::Row) -> Result<ConversationTracking, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row_to_tracking: {e}"));

    let human: Option<String> = row.get(2).ok();
    let ai: Option<String> = row.get(3).ok();
    let reply_date: Option<String> = row.get(6).ok();
    let status: Option<String> = row.get(7).ok();
    let updated: String = row.get(10).map_err(get_err)?;

    Ok(ConversationTracking {
        conversation_id: row.get(0).map_err(get_err)?,
        last_seen_message_id: row.get(1).ok(),
        last_human_message_at: parse_optional_datetime(&human),
        last_ai_message_at: parse_optional_datetime(&ai),
        replies_total: to_count(row.get(4).map_err(get_err)?),
        replies_today: to_count(row.get(5).map_err(get_err)?),
        last_reply_date: reply_date.and_then(|d| d.parse::<NaiveDate>().ok()),
        conversation_status: status.as_deref().and_then(ConversationStatus::parse),
        contact_id: row.get(8).ok(),
        contact_name: row.get(9).ok(),
        updated_at: Some(parse_datetime(&updated)),
    })
}

fn row_to_processed(row: &libsql::Row) -> Result<ProcessedMessage, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row_to_processed: {e}"));
    let processed: String = row.get(2).map_err(get_err)?;
    Ok(ProcessedMessage {
        message_id: row.get(0).map_err(get_err)?,
        conversation_id: row.get(1).map_err(get_err)?,
        processed_at: parse_datetime(&processed),
    })
}

/// Positional parameters shared by the two policy insert statements.
fn policy_params(policy: &AutopilotPolicy) -> Result<Vec<libsql::Value>, DatabaseError> {
    let hours = match &policy.operating_hours {
        Some(h) => libsql::Value::Text(to_json(h, "operating_hours")?),
        None => libsql::Value::Null,
    };
    Ok(vec![
        policy.conversation_id.clone().into(),
        policy.location_id.clone().into(),
        policy.user_id.clone().into(),
        (policy.is_enabled as i64).into(),
        i64::from(policy.reply_delay_minutes).into(),
        i64::from(policy.max_replies_per_conversation).into(),
        i64::from(policy.max_replies_per_day).into(),
        hours,
        (policy.cancel_on_user_reply as i64).into(),
        to_json(&policy.require_human_keywords, "require_human_keywords")?.into(),
        to_json(&policy.exclude_keywords, "exclude_keywords")?.into(),
        opt_text(policy.agent_id.as_deref()),
        policy.model.clone().into(),
        f64::from(policy.temperature).into(),
        fmt_datetime(&policy.created_at).into(),
        fmt_datetime(&policy.updated_at).into(),
    ])
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Policies ────────────────────────────────────────────────────

    async fn upsert_policy(&self, policy: &AutopilotPolicy) -> Result<(), DatabaseError> {
        let sql = format!(
            "INSERT INTO autopilot_policies ({POLICY_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(conversation_id) DO UPDATE SET
                location_id = excluded.location_id,
                user_id = excluded.user_id,
                is_enabled = excluded.is_enabled,
                reply_delay_minutes = excluded.reply_delay_minutes,
                max_replies_per_conversation = excluded.max_replies_per_conversation,
                max_replies_per_day = excluded.max_replies_per_day,
                operating_hours = excluded.operating_hours,
                cancel_on_user_reply = excluded.cancel_on_user_reply,
                require_human_keywords = excluded.require_human_keywords,
                exclude_keywords = excluded.exclude_keywords,
                agent_id = excluded.agent_id,
                model = excluded.model,
                temperature = excluded.temperature,
                updated_at = excluded.updated_at"
        );
        self.conn()
            .execute(&sql, policy_params(policy)?)
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_policy: {e}")))?;
        debug!(conversation_id = %policy.conversation_id, enabled = policy.is_enabled, "Policy saved");
        Ok(())
    }

    async fn insert_policy_if_absent(
        &self,
        policy: &AutopilotPolicy,
    ) -> Result<bool, DatabaseError> {
        let sql = format!(
            "INSERT INTO autopilot_policies ({POLICY_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(conversation_id) DO NOTHING"
        );
        let count = self
            .conn()
            .execute(&sql, policy_params(policy)?)
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_policy_if_absent: {e}")))?;
        Ok(count > 0)
    }

    async fn get_policy(
        &self,
        conversation_id: &str,
    ) -> Result<Option<AutopilotPolicy>, DatabaseError> {
        let sql =
            format!("SELECT {POLICY_COLUMNS} FROM autopilot_policies WHERE conversation_id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![conversation_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_policy: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_policy: {e}")))?
        {
            Some(row) => Ok(Some(row_to_policy(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_enabled_policies(&self) -> Result<Vec<AutopilotPolicy>, DatabaseError> {
        let sql = format!(
            "SELECT {POLICY_COLUMNS} FROM autopilot_policies
             WHERE is_enabled = 1 ORDER BY conversation_id"
        );
        let mut rows = self
            .conn()
            .query(&sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_enabled_policies: {e}")))?;

        let mut policies = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_enabled_policies: {e}")))?
        {
            policies.push(row_to_policy(&row)?);
        }
        Ok(policies)
    }

    // ── Tracking ────────────────────────────────────────────────────

    async fn get_tracking(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationTracking>, DatabaseError> {
        let sql = format!(
            "SELECT {TRACKING_COLUMNS} FROM conversation_tracking WHERE conversation_id = ?1"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![conversation_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_tracking: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_tracking: {e}")))?
        {
            Some(row) => Ok(Some(row_to_tracking(&row)?)),
            None => Ok(None),
        }
    }

    async fn record_observation(
        &self,
        conversation_id: &str,
        observation: &Observation,
    ) -> Result<(), DatabaseError> {
        let now = fmt_datetime(&Utc::now());
        self.conn()
            .execute(
                "INSERT INTO conversation_tracking
                    (conversation_id, last_seen_message_id, last_human_message_at,
                     conversation_status, contact_id, contact_name, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    last_seen_message_id = COALESCE(excluded.last_seen_message_id, last_seen_message_id),
                    last_human_message_at = CASE
                        WHEN excluded.last_human_message_at IS NULL THEN last_human_message_at
                        WHEN last_human_message_at IS NULL THEN excluded.last_human_message_at
                        ELSE max(last_human_message_at, excluded.last_human_message_at)
                    END,
                    conversation_status = COALESCE(excluded.conversation_status, conversation_status),
                    contact_id = COALESCE(excluded.contact_id, contact_id),
                    contact_name = COALESCE(excluded.contact_name, contact_name),
                    updated_at = excluded.updated_at",
                params![
                    conversation_id,
                    opt_text(observation.last_seen_message_id.as_deref()),
                    opt_datetime(observation.last_human_message_at.as_ref()),
                    opt_text(observation.conversation_status.map(|s| s.as_str())),
                    opt_text(observation.contact_id.as_deref()),
                    opt_text(observation.contact_name.as_deref()),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_observation: {e}")))?;

        debug!(
            conversation_id,
            watermark = ?observation.last_seen_message_id,
            "Observation recorded"
        );
        Ok(())
    }

    async fn record_reply_sent(
        &self,
        conversation_id: &str,
        sent_at: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<ConversationTracking, DatabaseError> {
        let sent = fmt_datetime(&sent_at);
        self.conn()
            .execute(
                "INSERT INTO conversation_tracking
                    (conversation_id, replies_total, replies_today, last_reply_date,
                     last_ai_message_at, updated_at)
                 VALUES (?1, 1, 1, ?2, ?3, ?3)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    replies_today = CASE
                        WHEN last_reply_date = excluded.last_reply_date THEN replies_today + 1
                        ELSE 1
                    END,
                    replies_total = replies_total + 1,
                    last_reply_date = excluded.last_reply_date,
                    last_ai_message_at = excluded.last_ai_message_at,
                    updated_at = excluded.updated_at",
                params![conversation_id, today.to_string(), sent],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_reply_sent: {e}")))?;

        let tracking = self.get_tracking(conversation_id).await?.ok_or_else(|| {
            DatabaseError::NotFound {
                entity: "conversation_tracking".into(),
                id: conversation_id.to_string(),
            }
        })?;
        debug!(
            conversation_id,
            replies_today = tracking.replies_today,
            replies_total = tracking.replies_total,
            "Reply counted"
        );
        Ok(tracking)
    }

    // ── Idempotency ledger ──────────────────────────────────────────

    async fn claim_message(
        &self,
        message_id: &str,
        conversation_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "INSERT INTO processed_messages (message_id, conversation_id, processed_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(message_id) DO NOTHING",
                params![message_id, conversation_id, fmt_datetime(&processed_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_message: {e}")))?;

        if count > 0 {
            debug!(message_id, conversation_id, "Message claimed");
            Ok(ClaimOutcome::Inserted)
        } else {
            debug!(message_id, conversation_id, "Message already claimed");
            Ok(ClaimOutcome::AlreadyExists)
        }
    }

    async fn get_processed_message(
        &self,
        message_id: &str,
    ) -> Result<Option<ProcessedMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, conversation_id, processed_at
                 FROM processed_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_processed_message: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_processed_message: {e}")))?
        {
            Some(row) => Ok(Some(row_to_processed(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_processed_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ProcessedMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, conversation_id, processed_at
                 FROM processed_messages WHERE conversation_id = ?1
                 ORDER BY processed_at ASC, message_id ASC",
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_processed_messages: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_processed_messages: {e}")))?
        {
            entries.push(row_to_processed(&row)?);
        }
        Ok(entries)
    }

    // ── Provider credentials ────────────────────────────────────────

    async fn get_credentials(
        &self,
        location_id: &str,
    ) -> Result<Option<ProviderTokens>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT access_token, refresh_token, expires_at
                 FROM provider_credentials WHERE location_id = ?1",
                params![location_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_credentials: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_credentials: {e}")))?
        else {
            return Ok(None);
        };

        let access: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("get_credentials: {e}")))?;
        let refresh: String = row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("get_credentials: {e}")))?;
        let expires: Option<String> = row.get(2).ok();

        Ok(Some(ProviderTokens {
            access_token: SecretString::from(access),
            refresh_token: SecretString::from(refresh),
            expires_at: parse_optional_datetime(&expires),
        }))
    }

    async fn save_credentials(
        &self,
        location_id: &str,
        tokens: &ProviderTokens,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO provider_credentials
                    (location_id, access_token, refresh_token, expires_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(location_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at",
                params![
                    location_id,
                    tokens.access_token.expose_secret(),
                    tokens.refresh_token.expose_secret(),
                    opt_datetime(tokens.expires_at.as_ref()),
                    fmt_datetime(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_credentials: {e}")))?;
        debug!(location_id, "Provider credentials saved");
        Ok(())
    }
}
