//! Poll cycle driver: runs the pipeline over every enabled policy.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::autopilot::pipeline::{Outcome, ReplyPipeline, RunMode, Stage};
use crate::store::Database;

/// Per-conversation line of a cycle report.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationReport {
    pub conversation_id: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub processed: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub would_send: usize,
    pub entries: Vec<ConversationReport>,
}

impl CycleReport {
    fn new(cycle_id: Uuid, started_at: DateTime<Utc>, mode: RunMode) -> Self {
        Self {
            cycle_id,
            started_at,
            finished_at: started_at,
            dry_run: mode.is_dry_run(),
            processed: 0,
            sent: 0,
            skipped: 0,
            failed: 0,
            would_send: 0,
            entries: Vec::new(),
        }
    }

    fn record(&mut self, entry: ConversationReport) {
        self.processed += 1;
        match entry.outcome {
            Outcome::Sent { .. } => self.sent += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Failed(_) => self.failed += 1,
            Outcome::WouldSend => self.would_send += 1,
        }
        self.entries.push(entry);
    }
}

/// Drives one cycle at a time; overlapping calls are allowed.
pub struct PollCycleDriver {
    store: Arc<dyn Database>,
    pipeline: Arc<ReplyPipeline>,
    max_concurrency: usize,
}

impl PollCycleDriver {
    pub fn new(pipeline: Arc<ReplyPipeline>, max_concurrency: usize) -> Self {
        Self {
            store: Arc::clone(pipeline.store()),
            pipeline,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Run the pipeline for every enabled policy. Never fails: every problem
    /// ends up as a `Failed` entry or an empty report.
    pub async fn run_cycle(&self, mode: RunMode) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        let mut report = CycleReport::new(cycle_id, Utc::now(), mode);

        let policies = match self.store.list_enabled_policies().await {
            Ok(policies) => policies,
            Err(e) => {
                error!(%cycle_id, error = %e, "Failed to load enabled policies");
                report.finished_at = Utc::now();
                return report;
            }
        };
        info!(
            %cycle_id,
            conversations = policies.len(),
            dry_run = mode.is_dry_run(),
            "Autopilot cycle started"
        );

        let entries: Vec<ConversationReport> = stream::iter(policies)
            .map(|policy| {
                let pipeline = Arc::clone(&self.pipeline);
                let conversation_id = policy.conversation_id;
                async move {
                    let id = conversation_id.clone();
                    let handle =
                        tokio::spawn(async move { pipeline.run_with(&id, mode).await });
                    let outcome = match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(%cycle_id, conversation_id, stage = %Stage::Task, error = %e, "Pipeline task aborted");
                            Outcome::Failed(Stage::Task)
                        }
                    };
                    ConversationReport {
                        conversation_id,
                        outcome,
                    }
                }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for entry in entries {
            report.record(entry);
        }
        report.finished_at = Utc::now();

        info!(
            %cycle_id,
            processed = report.processed,
            sent = report.sent,
            skipped = report.skipped,
            failed = report.failed,
            would_send = report.would_send,
            "Autopilot cycle finished"
        );
        report
    }
}
