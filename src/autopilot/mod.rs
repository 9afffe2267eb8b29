//! Autopilot engine: policies, eligibility, the reply pipeline and the cycle driver.
//!
//! A cycle loads every enabled policy and runs the [`ReplyPipeline`] for each
//! conversation. The pipeline fetches messages newer than the tracking
//! watermark, asks the [`eligibility`] evaluator whether to reply, claims the
//! inbound message in the idempotency ledger, then generates, sends and
//! commits counters.

pub mod driver;
pub mod eligibility;
pub mod pipeline;
pub mod reconcile;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use driver::{ConversationReport, CycleReport, PollCycleDriver};
pub use eligibility::{SkipReason, Verdict, evaluate};
pub use pipeline::{Outcome, ReplyPipeline, RunMode, Stage};
pub use reconcile::{ReconcileReport, auto_enable_tagged};
pub use types::{
    AutopilotPolicy, ClaimOutcome, ConversationStatus, ConversationTracking, Observation,
    OperatingHours, ProcessedMessage,
};
