//! Reply pipeline: one conversation, one pass.
//!
//! load → fetch → evaluate → claim → generate → send → commit.
//!
//! The ledger claim is the only synchronization point. Two overlapping runs
//! over the same inbound message both get as far as the claim; exactly one
//! wins and the other returns `Skipped(AlreadyClaimed)` without side effects.
//! Counters move only after the provider accepted the reply.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::autopilot::eligibility::{SkipReason, Verdict, evaluate_in, local_date};
use crate::autopilot::types::{
    ClaimOutcome, ConversationStatus, ConversationTracking, Observation,
};
use crate::generator::{ConversationContext, ReplyGenerator};
use crate::provider::{Direction, ProviderClient, ProviderMessage};
use crate::store::Database;

/// Default number of fetched messages handed to the generator.
const DEFAULT_CONTEXT_LIMIT: usize = 20;

/// Where a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Load,
    Fetch,
    Claim,
    Generate,
    Send,
    Commit,
    /// The run's task panicked or was cancelled.
    Task,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Fetch => "fetch",
            Self::Claim => "claim",
            Self::Generate => "generate",
            Self::Send => "send",
            Self::Commit => "commit",
            Self::Task => "task",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    /// `message_id` is the inbound message answered, `reply_id` the provider's
    /// id for the reply.
    Sent { message_id: String, reply_id: String },
    Skipped(SkipReason),
    Failed(Stage),
    /// Dry run: the conversation is eligible and would be answered.
    WouldSend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Live,
    /// Evaluate only: nothing is claimed, generated, sent or persisted.
    DryRun,
}

impl RunMode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, Self::DryRun)
    }
}

pub struct ReplyPipeline {
    store: Arc<dyn Database>,
    provider: Arc<dyn ProviderClient>,
    generator: Arc<dyn ReplyGenerator>,
    default_tz: Tz,
    context_limit: usize,
}

impl ReplyPipeline {
    pub fn new(
        store: Arc<dyn Database>,
        provider: Arc<dyn ProviderClient>,
        generator: Arc<dyn ReplyGenerator>,
    ) -> Self {
        Self {
            store,
            provider,
            generator,
            default_tz: Tz::UTC,
            context_limit: DEFAULT_CONTEXT_LIMIT,
        }
    }

    /// Timezone for day rollover when a policy has no operating hours.
    pub fn with_default_timezone(mut self, tz: Tz) -> Self {
        self.default_tz = tz;
        self
    }

    pub fn with_context_limit(mut self, limit: usize) -> Self {
        self.context_limit = limit.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    pub async fn run(&self, conversation_id: &str) -> Outcome {
        self.run_with(conversation_id, RunMode::Live).await
    }

    pub async fn run_with(&self, conversation_id: &str, mode: RunMode) -> Outcome {
        self.run_at(conversation_id, mode, Utc::now()).await
    }

    /// Run against an explicit clock.
    pub async fn run_at(&self, conversation_id: &str, mode: RunMode, now: DateTime<Utc>) -> Outcome {
        // 1. Load
        let policy = match self.store.get_policy(conversation_id).await {
            Ok(Some(policy)) if policy.is_enabled => policy,
            Ok(_) => {
                debug!(conversation_id, "No enabled policy");
                return Outcome::Skipped(SkipReason::NoPolicy);
            }
            Err(e) => {
                error!(conversation_id, stage = %Stage::Load, error = %e, "Failed to load policy");
                return Outcome::Failed(Stage::Load);
            }
        };
        let tracking = match self.store.get_tracking(conversation_id).await {
            Ok(tracking) => tracking.unwrap_or_else(|| ConversationTracking::new(conversation_id)),
            Err(e) => {
                error!(conversation_id, stage = %Stage::Load, error = %e, "Failed to load tracking");
                return Outcome::Failed(Stage::Load);
            }
        };

        // 2. Fetch
        let messages = match self
            .provider
            .fetch_new_messages(conversation_id, tracking.last_seen_message_id.as_deref())
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!(conversation_id, stage = %Stage::Fetch, error = %e, "Failed to fetch messages");
                return Outcome::Failed(Stage::Fetch);
            }
        };

        // 3. Observe
        let newest_inbound = newest_inbound(&messages).cloned();
        let observation = observe(&messages);
        let answered = newest_inbound
            .as_ref()
            .is_some_and(|m| answered_after(&messages, m));

        // 4. Evaluate
        let verdict = evaluate_in(&policy, &tracking, newest_inbound.as_ref(), now, self.default_tz);
        let message = match verdict {
            Verdict::Eligible | Verdict::Skip(SkipReason::DelayNotElapsed) if answered => {
                debug!(conversation_id, "Business side already replied to the newest message");
                return self
                    .finish_skip(conversation_id, mode, &observation, SkipReason::AlreadyAnswered)
                    .await;
            }
            Verdict::Skip(reason) if reason.is_deferral() => {
                debug!(conversation_id, %reason, "Deferred");
                return Outcome::Skipped(reason);
            }
            Verdict::Skip(reason) => {
                debug!(conversation_id, %reason, "Skipped");
                return self
                    .finish_skip(conversation_id, mode, &observation, reason)
                    .await;
            }
            Verdict::Cancel => {
                info!(conversation_id, "Human replied since the last automated message, cancelling");
                return self
                    .finish_skip(conversation_id, mode, &observation, SkipReason::Cancelled)
                    .await;
            }
            Verdict::Eligible if mode.is_dry_run() => return Outcome::WouldSend,
            Verdict::Eligible => match newest_inbound {
                Some(message) => message,
                None => return Outcome::Skipped(SkipReason::NoNewMessage),
            },
        };

        // 5. Claim
        match self
            .store
            .claim_message(&message.id, conversation_id, now)
            .await
        {
            Ok(ClaimOutcome::Inserted) => {}
            Ok(ClaimOutcome::AlreadyExists) => {
                debug!(conversation_id, message_id = %message.id, "Message already claimed by another run");
                return self
                    .finish_skip(conversation_id, mode, &observation, SkipReason::AlreadyClaimed)
                    .await;
            }
            Err(e) => {
                error!(conversation_id, stage = %Stage::Claim, error = %e, "Failed to claim message");
                return Outcome::Failed(Stage::Claim);
            }
        }
        // The claim already prevents a second reply; a lost observation only
        // costs a redundant fetch next cycle.
        if let Err(e) = self
            .store
            .record_observation(conversation_id, &observation)
            .await
        {
            warn!(conversation_id, error = %e, "Failed to record observation after claim");
        }

        // 6. Generate
        let contact_name = observation
            .contact_name
            .clone()
            .or_else(|| tracking.contact_name.clone());
        let context = ConversationContext::new(
            conversation_id,
            contact_name,
            message.message_type.clone(),
            messages,
            self.context_limit,
        );
        let reply = match self
            .generator
            .generate(
                &context,
                policy.agent_id.as_deref(),
                &policy.model,
                policy.temperature,
            )
            .await
        {
            Ok(reply) if !reply.trim().is_empty() => reply,
            Ok(_) => {
                warn!(conversation_id, stage = %Stage::Generate, "Generator returned an empty reply");
                return Outcome::Failed(Stage::Generate);
            }
            Err(e) => {
                warn!(conversation_id, stage = %Stage::Generate, error = %e, "Failed to generate reply");
                return Outcome::Failed(Stage::Generate);
            }
        };

        // 7. Send
        let reply_id = match self
            .provider
            .send_message(conversation_id, reply.trim(), &message.message_type)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(conversation_id, stage = %Stage::Send, error = %e, "Failed to send reply");
                return Outcome::Failed(Stage::Send);
            }
        };

        // 8. Commit
        let today = local_date(&policy, now, self.default_tz);
        match self
            .store
            .record_reply_sent(conversation_id, now, today)
            .await
        {
            Ok(tracking) => {
                info!(
                    conversation_id,
                    message_id = %message.id,
                    reply_id = %reply_id,
                    replies_today = tracking.replies_today,
                    replies_total = tracking.replies_total,
                    "Autopilot reply sent"
                );
                Outcome::Sent {
                    message_id: message.id,
                    reply_id,
                }
            }
            Err(e) => {
                error!(
                    conversation_id,
                    stage = %Stage::Commit,
                    reply_id = %reply_id,
                    error = %e,
                    "Reply sent but counters were not updated"
                );
                Outcome::Failed(Stage::Commit)
            }
        }
    }

    async fn finish_skip(
        &self,
        conversation_id: &str,
        mode: RunMode,
        observation: &Observation,
        reason: SkipReason,
    ) -> Outcome {
        if mode.is_dry_run() || observation.is_empty() {
            return Outcome::Skipped(reason);
        }
        match self
            .store
            .record_observation(conversation_id, observation)
            .await
        {
            Ok(()) => Outcome::Skipped(reason),
            Err(e) => {
                error!(conversation_id, stage = %Stage::Commit, %reason, error = %e, "Failed to record observation");
                Outcome::Failed(Stage::Commit)
            }
        }
    }
}

/// The inbound message a reply would answer: latest by timestamp, later
/// position winning ties.
fn newest_inbound(messages: &[ProviderMessage]) -> Option<&ProviderMessage> {
    messages
        .iter()
        .filter(|m| m.is_inbound())
        .max_by_key(|m| m.timestamp)
}

/// An outbound message newer than `candidate` exists in the batch.
fn answered_after(messages: &[ProviderMessage], candidate: &ProviderMessage) -> bool {
    messages
        .iter()
        .any(|m| !m.is_inbound() && m.timestamp > candidate.timestamp)
}

/// Non-quota tracking fields derived from a fetched batch.
fn observe(messages: &[ProviderMessage]) -> Observation {
    let newest = messages.iter().max_by_key(|m| m.timestamp);
    let inbound = newest_inbound(messages);
    let contact = messages
        .iter()
        .rev()
        .filter(|m| m.is_inbound())
        .find(|m| m.contact_id.is_some() || m.contact_name.is_some());

    Observation {
        last_seen_message_id: newest.map(|m| m.id.clone()),
        last_human_message_at: inbound.map(|m| m.timestamp),
        conversation_status: newest.map(|m| match m.direction {
            Direction::Inbound => ConversationStatus::AwaitingReply,
            Direction::Outbound => ConversationStatus::Replied,
        }),
        contact_id: contact.and_then(|m| m.contact_id.clone()),
        contact_name: contact.and_then(|m| m.contact_name.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autopilot::testing::{StubGenerator, StubProvider, inbound, outbound, ts};
    use crate::autopilot::types::AutopilotPolicy;
    use crate::provider::MessageType;
    use crate::store::LibSqlBackend;

    struct Harness {
        store: Arc<LibSqlBackend>,
        provider: Arc<StubProvider>,
        generator: Arc<StubGenerator>,
        pipeline: ReplyPipeline,
    }

    async fn harness_with(provider: StubProvider, generator: StubGenerator) -> Harness {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let provider = Arc::new(provider);
        let generator = Arc::new(generator);
        let pipeline = ReplyPipeline::new(store.clone(), provider.clone(), generator.clone());
        Harness {
            store,
            provider,
            generator,
            pipeline,
        }
    }

    async fn harness() -> Harness {
        harness_with(StubProvider::new(), StubGenerator::replying("Happy to help!")).await
    }

    async fn enable(h: &Harness, conversation_id: &str) -> AutopilotPolicy {
        let policy = AutopilotPolicy::new(conversation_id, "loc-1", "user-1");
        h.store.upsert_policy(&policy).await.unwrap();
        policy
    }

    async fn save(h: &Harness, policy: &AutopilotPolicy) {
        h.store.upsert_policy(policy).await.unwrap();
    }

    #[tokio::test]
    async fn first_send_after_rollover() {
        let h = harness().await;
        let mut policy = enable(&h, "c1").await;
        policy.max_replies_per_day = 1;
        save(&h, &policy).await;

        // One reply yesterday; today's allowance is fresh.
        let yesterday = ts(10, 0) - chrono::Duration::days(1);
        h.store
            .record_reply_sent("c1", yesterday, yesterday.date_naive())
            .await
            .unwrap();
        h.provider.push(inbound("c1", "m1", "Are you open today?", ts(9, 0)));

        let outcome = h.pipeline.run_at("c1", RunMode::Live, ts(10, 0)).await;
        assert_eq!(
            outcome,
            Outcome::Sent {
                message_id: "m1".into(),
                reply_id: "reply-1".into()
            }
        );

        let tracking = h.store.get_tracking("c1").await.unwrap().unwrap();
        assert_eq!(tracking.replies_today, 1);
        assert_eq!(tracking.replies_total, 2);
        assert_eq!(tracking.last_reply_date, Some(ts(10, 0).date_naive()));
        assert_eq!(tracking.last_ai_message_at, Some(ts(10, 0)));
        assert_eq!(tracking.last_seen_message_id.as_deref(), Some("m1"));
        assert!(h.store.get_processed_message("m1").await.unwrap().is_some());

        let sent = h.provider.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, "Happy to help!");
    }

    #[tokio::test]
    async fn overlapping_runs_send_once() {
        let h = harness_with(
            StubProvider::with_fetch_barrier(2),
            StubGenerator::replying("On it!"),
        )
        .await;
        enable(&h, "c1").await;
        h.provider.push(inbound("c1", "m1", "hello?", ts(9, 0)));

        let (a, b) = tokio::join!(
            h.pipeline.run_at("c1", RunMode::Live, ts(10, 0)),
            h.pipeline.run_at("c1", RunMode::Live, ts(10, 0)),
        );

        let outcomes = [a, b];
        let sent = outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Sent { .. }))
            .count();
        let claimed = outcomes
            .iter()
            .filter(|o| **o == Outcome::Skipped(SkipReason::AlreadyClaimed))
            .count();
        assert_eq!((sent, claimed), (1, 1));
        assert_eq!(h.provider.sent().len(), 1);
        assert_eq!(h.generator.calls(), 1);

        let tracking = h.store.get_tracking("c1").await.unwrap().unwrap();
        assert_eq!(tracking.replies_total, 1);
    }

    #[tokio::test]
    async fn excluded_keyword_advances_watermark_only() {
        let h = harness().await;
        let mut policy = enable(&h, "c1").await;
        policy.exclude_keywords = vec!["stop".into()];
        save(&h, &policy).await;
        h.provider.push(inbound("c1", "m1", "Please STOP texting me", ts(9, 0)));

        let outcome = h.pipeline.run_at("c1", RunMode::Live, ts(10, 0)).await;
        assert_eq!(outcome, Outcome::Skipped(SkipReason::ExcludedKeyword));

        let tracking = h.store.get_tracking("c1").await.unwrap().unwrap();
        assert_eq!(tracking.last_seen_message_id.as_deref(), Some("m1"));
        assert_eq!(tracking.replies_total, 0);
        assert_eq!(tracking.replies_today, 0);
        assert!(h.store.get_processed_message("m1").await.unwrap().is_none());
        assert!(h.provider.sent().is_empty());
        assert_eq!(h.generator.calls(), 0);

        // Seen messages are not re-evaluated.
        let again = h.pipeline.run_at("c1", RunMode::Live, ts(10, 5)).await;
        assert_eq!(again, Outcome::Skipped(SkipReason::NoNewMessage));
    }

    #[tokio::test]
    async fn delay_defers_without_persisting() {
        let h = harness().await;
        let mut policy = enable(&h, "c1").await;
        policy.reply_delay_minutes = 5;
        save(&h, &policy).await;
        h.provider.push(inbound("c1", "m1", "hi", ts(10, 0)));

        let early = h.pipeline.run_at("c1", RunMode::Live, ts(10, 4)).await;
        assert_eq!(early, Outcome::Skipped(SkipReason::DelayNotElapsed));
        assert!(h.store.get_tracking("c1").await.unwrap().is_none());

        let due = h.pipeline.run_at("c1", RunMode::Live, ts(10, 5)).await;
        assert!(matches!(due, Outcome::Sent { .. }));
    }

    #[tokio::test]
    async fn disabled_policy_never_sends() {
        let h = harness().await;
        let mut policy = enable(&h, "c1").await;
        policy.is_enabled = false;
        save(&h, &policy).await;
        h.provider.push(inbound("c1", "m1", "hi", ts(9, 0)));

        let outcome = h.pipeline.run_at("c1", RunMode::Live, ts(10, 0)).await;
        assert_eq!(outcome, Outcome::Skipped(SkipReason::NoPolicy));
        assert!(h.provider.sent().is_empty());
        assert!(h.store.get_tracking("c1").await.unwrap().is_none());

        let missing = h.pipeline.run_at("nope", RunMode::Live, ts(10, 0)).await;
        assert_eq!(missing, Outcome::Skipped(SkipReason::NoPolicy));
    }

    #[tokio::test]
    async fn generate_failure_keeps_claim_and_counters() {
        let h = harness_with(StubProvider::new(), StubGenerator::failing()).await;
        enable(&h, "c1").await;
        h.provider.push(inbound("c1", "m1", "hi", ts(9, 0)));

        let outcome = h.pipeline.run_at("c1", RunMode::Live, ts(10, 0)).await;
        assert_eq!(outcome, Outcome::Failed(Stage::Generate));
        assert!(h.store.get_processed_message("m1").await.unwrap().is_some());

        let tracking = h.store.get_tracking("c1").await.unwrap().unwrap();
        assert_eq!(tracking.replies_total, 0);

        // The message is not retried.
        let again = h.pipeline.run_at("c1", RunMode::Live, ts(10, 5)).await;
        assert_eq!(again, Outcome::Skipped(SkipReason::NoNewMessage));
        assert_eq!(h.generator.calls(), 1);
    }

    #[tokio::test]
    async fn blank_reply_is_a_generate_failure() {
        let h = harness_with(StubProvider::new(), StubGenerator::replying("   \n")).await;
        enable(&h, "c1").await;
        h.provider.push(inbound("c1", "m1", "hi", ts(9, 0)));

        let outcome = h.pipeline.run_at("c1", RunMode::Live, ts(10, 0)).await;
        assert_eq!(outcome, Outcome::Failed(Stage::Generate));
        assert!(h.provider.sent().is_empty());
    }

    #[tokio::test]
    async fn send_failure_leaves_counters_untouched() {
        let h = harness().await;
        enable(&h, "c1").await;
        h.provider.push(inbound("c1", "m1", "hi", ts(9, 0)));
        h.provider.fail_sends();

        let outcome = h.pipeline.run_at("c1", RunMode::Live, ts(10, 0)).await;
        assert_eq!(outcome, Outcome::Failed(Stage::Send));

        let tracking = h.store.get_tracking("c1").await.unwrap().unwrap();
        assert_eq!(tracking.replies_total, 0);
        assert!(tracking.last_ai_message_at.is_none());
        assert!(h.store.get_processed_message("m1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fetch_failure_persists_nothing() {
        let h = harness().await;
        enable(&h, "c1").await;
        h.provider.fail_fetch_for("c1");

        let outcome = h.pipeline.run_at("c1", RunMode::Live, ts(10, 0)).await;
        assert_eq!(outcome, Outcome::Failed(Stage::Fetch));
        assert!(h.store.get_tracking("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn daily_quota_holds_across_runs() {
        let h = harness().await;
        let mut policy = enable(&h, "c1").await;
        policy.max_replies_per_day = 1;
        save(&h, &policy).await;

        h.provider.push(inbound("c1", "m1", "first", ts(9, 0)));
        let first = h.pipeline.run_at("c1", RunMode::Live, ts(9, 30)).await;
        assert!(matches!(first, Outcome::Sent { .. }));

        h.provider.push(inbound("c1", "m2", "second", ts(11, 0)));
        let second = h.pipeline.run_at("c1", RunMode::Live, ts(11, 30)).await;
        assert_eq!(second, Outcome::Skipped(SkipReason::QuotaExceeded));
        assert_eq!(h.provider.sent().len(), 1);

        let tracking = h.store.get_tracking("c1").await.unwrap().unwrap();
        assert_eq!(tracking.replies_today, 1);
        assert_eq!(tracking.last_seen_message_id.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn dry_run_is_read_only() {
        let h = harness().await;
        enable(&h, "c1").await;
        h.provider.push(inbound("c1", "m1", "hi", ts(9, 0)));

        let outcome = h.pipeline.run_at("c1", RunMode::DryRun, ts(10, 0)).await;
        assert_eq!(outcome, Outcome::WouldSend);
        assert!(h.store.get_tracking("c1").await.unwrap().is_none());
        assert!(h.store.get_processed_message("m1").await.unwrap().is_none());
        assert!(h.provider.sent().is_empty());
        assert_eq!(h.generator.calls(), 0);
    }

    #[tokio::test]
    async fn reply_uses_inbound_channel_and_context() {
        let h = harness().await;
        enable(&h, "c1").await;
        h.provider
            .push(outbound("c1", "m0", "Thanks for booking!", ts(8, 0)));
        h.provider.push(ProviderMessage {
            message_type: MessageType::Whatsapp,
            ..inbound("c1", "m1", "Can I move it to 3pm?", ts(9, 0))
        });

        let outcome = h.pipeline.run_at("c1", RunMode::Live, ts(10, 0)).await;
        assert!(matches!(outcome, Outcome::Sent { .. }));
        assert_eq!(h.provider.sent()[0].message_type, MessageType::Whatsapp);

        let context = h.generator.last_context.lock().unwrap().clone().unwrap();
        assert_eq!(context.messages.len(), 2);
        assert_eq!(context.contact_name.as_deref(), Some("Dana"));

        let tracking = h.store.get_tracking("c1").await.unwrap().unwrap();
        assert_eq!(tracking.contact_id.as_deref(), Some("contact-c1"));
        assert_eq!(tracking.conversation_status, Some(ConversationStatus::AwaitingReply));
    }

    #[tokio::test]
    async fn agent_reply_during_delay_suppresses_autopilot() {
        let h = harness().await;
        let mut policy = enable(&h, "c1").await;
        policy.reply_delay_minutes = 5;
        save(&h, &policy).await;
        h.provider.push(inbound("c1", "m1", "Do you deliver?", ts(10, 0)));
        h.provider.push(outbound("c1", "o1", "Yes, every weekday.", ts(10, 3)));

        let outcome = h.pipeline.run_at("c1", RunMode::Live, ts(10, 5)).await;
        assert_eq!(outcome, Outcome::Skipped(SkipReason::AlreadyAnswered));
        assert!(h.provider.sent().is_empty());
        assert_eq!(h.generator.calls(), 0);
        assert!(h.store.get_processed_message("m1").await.unwrap().is_none());

        let tracking = h.store.get_tracking("c1").await.unwrap().unwrap();
        assert_eq!(tracking.last_seen_message_id.as_deref(), Some("o1"));
        assert_eq!(tracking.replies_total, 0);
        assert_eq!(tracking.conversation_status, Some(ConversationStatus::Replied));
    }

    #[tokio::test]
    async fn already_claimed_message_still_advances_watermark() {
        let h = harness().await;
        enable(&h, "c1").await;
        // Claimed by an earlier run whose send failed before anything was observed.
        h.store.claim_message("m1", "c1", ts(9, 30)).await.unwrap();
        h.provider.push(inbound("c1", "m1", "hello?", ts(9, 0)));

        let outcome = h.pipeline.run_at("c1", RunMode::Live, ts(10, 0)).await;
        assert_eq!(outcome, Outcome::Skipped(SkipReason::AlreadyClaimed));
        assert!(h.provider.sent().is_empty());

        let tracking = h.store.get_tracking("c1").await.unwrap().unwrap();
        assert_eq!(tracking.last_seen_message_id.as_deref(), Some("m1"));
        assert_eq!(tracking.replies_total, 0);

        let outcome = h.pipeline.run_at("c1", RunMode::Live, ts(10, 5)).await;
        assert_eq!(outcome, Outcome::Skipped(SkipReason::NoNewMessage));
    }

    #[tokio::test]
    async fn stale_continuation_is_cancelled() {
        let h = harness().await;
        let mut policy = enable(&h, "c1").await;
        policy.cancel_on_user_reply = true;
        save(&h, &policy).await;

        // Last automated reply at 10:00, a human wrote at 10:30.
        h.store
            .record_reply_sent("c1", ts(10, 0), ts(10, 0).date_naive())
            .await
            .unwrap();
        h.store
            .record_observation(
                "c1",
                &Observation {
                    last_human_message_at: Some(ts(10, 30)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // A message from before that human reply surfaces late.
        h.provider.push(inbound("c1", "m1", "earlier question", ts(10, 20)));

        let outcome = h.pipeline.run_at("c1", RunMode::Live, ts(11, 0)).await;
        assert_eq!(outcome, Outcome::Skipped(SkipReason::Cancelled));
        assert!(h.provider.sent().is_empty());

        let tracking = h.store.get_tracking("c1").await.unwrap().unwrap();
        assert_eq!(tracking.replies_total, 1);
        assert_eq!(tracking.last_seen_message_id.as_deref(), Some("m1"));
        assert_eq!(tracking.last_human_message_at, Some(ts(10, 30)));
    }

    #[test]
    fn observation_tracks_newest_message_any_direction() {
        let messages = vec![
            inbound("c1", "m1", "hi", ts(9, 0)),
            outbound("c1", "m2", "hello!", ts(9, 5)),
        ];
        let obs = observe(&messages);
        assert_eq!(obs.last_seen_message_id.as_deref(), Some("m2"));
        assert_eq!(obs.last_human_message_at, Some(ts(9, 0)));
        assert_eq!(obs.conversation_status, Some(ConversationStatus::Replied));
        assert!(observe(&[]).is_empty());
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(Outcome::Skipped(SkipReason::QuotaExceeded)).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["detail"], "quota-exceeded");

        let json = serde_json::to_value(Outcome::Failed(Stage::Send)).unwrap();
        assert_eq!(json["detail"], "send");
    }
}
