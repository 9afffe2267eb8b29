//! Unified `Database` trait: single async interface for all persistence.
//!
//! Policies are read by the engine and written by configuration; tracking
//! rows, ledger entries and refreshed credentials are written only by the
//! engine.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::autopilot::types::{
    AutopilotPolicy, ClaimOutcome, ConversationTracking, Observation, ProcessedMessage,
};
use crate::error::DatabaseError;
use crate::provider::ProviderTokens;

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Policies ────────────────────────────────────────────────────

    /// Insert or replace the policy for its conversation.
    async fn upsert_policy(&self, policy: &AutopilotPolicy) -> Result<(), DatabaseError>;

    /// Insert the policy only when its conversation has none.
    /// Returns `true` when a row was created.
    async fn insert_policy_if_absent(&self, policy: &AutopilotPolicy)
    -> Result<bool, DatabaseError>;

    async fn get_policy(
        &self,
        conversation_id: &str,
    ) -> Result<Option<AutopilotPolicy>, DatabaseError>;

    /// All policies with `is_enabled = true`.
    async fn list_enabled_policies(&self) -> Result<Vec<AutopilotPolicy>, DatabaseError>;

    // ── Tracking ────────────────────────────────────────────────────

    async fn get_tracking(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationTracking>, DatabaseError>;

    /// Persist the non-quota fields of a fetched batch. Creates the row if needed.
    /// `last_human_message_at` only ever moves forward.
    async fn record_observation(
        &self,
        conversation_id: &str,
        observation: &Observation,
    ) -> Result<(), DatabaseError>;

    /// Count one physically sent reply, in a single statement: reset
    /// `replies_today` when `today` differs from `last_reply_date`, then
    /// increment both counters and stamp `last_ai_message_at` / `last_reply_date`.
    async fn record_reply_sent(
        &self,
        conversation_id: &str,
        sent_at: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<ConversationTracking, DatabaseError>;

    // ── Idempotency ledger ──────────────────────────────────────────

    /// Claim an inbound message. The uniqueness constraint on `message_id`
    /// decides the winner between overlapping cycles.
    async fn claim_message(
        &self,
        message_id: &str,
        conversation_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, DatabaseError>;

    async fn get_processed_message(
        &self,
        message_id: &str,
    ) -> Result<Option<ProcessedMessage>, DatabaseError>;

    /// Ledger entries for a conversation, oldest first.
    async fn list_processed_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ProcessedMessage>, DatabaseError>;

    // ── Provider credentials ────────────────────────────────────────

    async fn get_credentials(
        &self,
        location_id: &str,
    ) -> Result<Option<ProviderTokens>, DatabaseError>;

    async fn save_credentials(
        &self,
        location_id: &str,
        tokens: &ProviderTokens,
    ) -> Result<(), DatabaseError>;
}
