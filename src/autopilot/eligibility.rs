//! Eligibility evaluator: decides whether a conversation gets a reply now.
//!
//! Pure: no I/O, no clock reads. Rules run in a fixed order and the first
//! failing rule is the reported reason:
//!
//! 1. policy disabled
//! 2. no new inbound message
//! 3. outside operating hours
//! 4. excluded / missing required keyword
//! 5. day rollover (today's count treated as 0)
//! 6. daily or lifetime quota reached
//! 7. reply delay not yet elapsed
//! 8. stale continuation after a human reply → cancel

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use regex::RegexSet;
use serde::Serialize;
use tracing::warn;

use crate::autopilot::types::{AutopilotPolicy, ConversationTracking, OperatingHours};
use crate::provider::ProviderMessage;

/// Why a conversation was not replied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    Disabled,
    NoNewMessage,
    OutsideHours,
    ExcludedKeyword,
    MissingRequiredKeyword,
    QuotaExceeded,
    DelayNotElapsed,
    // Pipeline-level reasons.
    NoPolicy,
    AlreadyClaimed,
    Cancelled,
    /// Someone on the business side replied after the candidate message.
    AlreadyAnswered,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::NoNewMessage => "no-new-message",
            Self::OutsideHours => "outside-hours",
            Self::ExcludedKeyword => "excluded-keyword",
            Self::MissingRequiredKeyword => "missing-required-keyword",
            Self::QuotaExceeded => "quota-exceeded",
            Self::DelayNotElapsed => "delay-not-elapsed",
            Self::NoPolicy => "no-policy",
            Self::AlreadyClaimed => "already-claimed",
            Self::Cancelled => "cancelled",
            Self::AlreadyAnswered => "already-answered",
        }
    }

    /// The message is still due later; the watermark must not move past it.
    pub fn is_deferral(&self) -> bool {
        matches!(self, Self::DelayNotElapsed)
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluator output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Eligible,
    Skip(SkipReason),
    /// Abort any in-flight generation for this message.
    Cancel,
}

/// Evaluate with UTC as the fallback day boundary.
pub fn evaluate(
    policy: &AutopilotPolicy,
    tracking: &ConversationTracking,
    newest_inbound: Option<&ProviderMessage>,
    now: DateTime<Utc>,
) -> Verdict {
    evaluate_in(policy, tracking, newest_inbound, now, Tz::UTC)
}

/// Evaluate, using `default_tz` for day rollover when the policy has no timezone.
pub fn evaluate_in(
    policy: &AutopilotPolicy,
    tracking: &ConversationTracking,
    newest_inbound: Option<&ProviderMessage>,
    now: DateTime<Utc>,
    default_tz: Tz,
) -> Verdict {
    if !policy.is_enabled {
        return Verdict::Skip(SkipReason::Disabled);
    }

    let message = match newest_inbound {
        Some(m) if tracking.last_seen_message_id.as_deref() != Some(m.id.as_str()) => m,
        _ => return Verdict::Skip(SkipReason::NoNewMessage),
    };

    if let Some(hours) = &policy.operating_hours
        && !within_operating_hours(hours, now)
    {
        return Verdict::Skip(SkipReason::OutsideHours);
    }

    if let Some(reason) = keyword_gate(policy, &message.body) {
        return Verdict::Skip(reason);
    }

    let today = local_date(policy, now, default_tz);
    if tracking.replies_today_on(today) >= policy.max_replies_per_day
        || tracking.replies_total >= policy.max_replies_per_conversation
    {
        return Verdict::Skip(SkipReason::QuotaExceeded);
    }

    let delay = chrono::Duration::minutes(i64::from(policy.reply_delay_minutes));
    if now.signed_duration_since(message.timestamp) < delay {
        return Verdict::Skip(SkipReason::DelayNotElapsed);
    }

    if policy.cancel_on_user_reply && is_stale_continuation(tracking, message) {
        return Verdict::Cancel;
    }

    Verdict::Eligible
}

/// A human replied after our last automated message, and the candidate
/// predates that reply.
fn is_stale_continuation(tracking: &ConversationTracking, message: &ProviderMessage) -> bool {
    match (tracking.last_human_message_at, tracking.last_ai_message_at) {
        (Some(human_at), Some(ai_at)) => human_at > ai_at && message.timestamp < human_at,
        _ => false,
    }
}

fn keyword_gate(policy: &AutopilotPolicy, body: &str) -> Option<SkipReason> {
    if KeywordSet::new(&policy.exclude_keywords).matches(body) {
        return Some(SkipReason::ExcludedKeyword);
    }
    let required = KeywordSet::new(&policy.require_human_keywords);
    if !required.is_empty() && !required.matches(body) {
        return Some(SkipReason::MissingRequiredKeyword);
    }
    None
}

/// Case-insensitive literal substring matcher over a keyword list.
struct KeywordSet {
    keywords: Vec<String>,
    set: Option<RegexSet>,
}

impl KeywordSet {
    fn new(keywords: &[String]) -> Self {
        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();

        let set = match RegexSet::new(keywords.iter().map(|k| format!("(?i){}", regex::escape(k))))
        {
            Ok(set) => Some(set),
            Err(e) => {
                warn!(error = %e, "Keyword set too large for regex, using plain matching");
                None
            }
        };

        Self { keywords, set }
    }

    fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    fn matches(&self, body: &str) -> bool {
        if self.keywords.is_empty() {
            return false;
        }
        match &self.set {
            Some(set) => set.is_match(body),
            None => {
                let body = body.to_lowercase();
                self.keywords
                    .iter()
                    .any(|k| body.contains(&k.to_lowercase()))
            }
        }
    }
}

/// Whether `now` falls inside the configured window. Disabled hours always pass.
pub fn within_operating_hours(hours: &OperatingHours, now: DateTime<Utc>) -> bool {
    if !hours.enabled {
        return true;
    }

    let local = now.with_timezone(&resolve_timezone(&hours.timezone));

    if !hours.days_of_week.is_empty() && !hours.days_of_week.contains(&local.weekday()) {
        return false;
    }

    let time = local.time();
    if hours.start == hours.end {
        return true;
    }
    if hours.start < hours.end {
        time >= hours.start && time < hours.end
    } else {
        time >= hours.start || time < hours.end
    }
}

/// Calendar date of `now` for quota purposes.
pub fn local_date(policy: &AutopilotPolicy, now: DateTime<Utc>, default_tz: Tz) -> NaiveDate {
    let tz = policy.timezone().map_or(default_tz, resolve_timezone);
    now.with_timezone(&tz).date_naive()
}

/// Parse an IANA timezone name, falling back to UTC.
pub fn resolve_timezone(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(error) => {
            warn!(timezone = %name, %error, "Invalid timezone, falling back to UTC");
            Tz::UTC
        }
    }
}
