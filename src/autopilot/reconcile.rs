//! Tag reconciliation: conversations tagged for autopilot get a default policy.

use serde::Serialize;
use tracing::{debug, info};

use crate::autopilot::types::AutopilotPolicy;
use crate::error::Error;
use crate::provider::ProviderClient;
use crate::store::Database;

/// Owner recorded on policies created by reconciliation.
pub const RECONCILE_USER: &str = "autopilot-reconcile";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub created: usize,
    pub existing: usize,
}

/// Create a default, enabled policy for every conversation carrying `tag`
/// that has none. Existing policies, enabled or not, are left alone.
pub async fn auto_enable_tagged(
    store: &dyn Database,
    provider: &dyn ProviderClient,
    tag: &str,
) -> Result<ReconcileReport, Error> {
    let conversations = provider.list_tagged_conversations(tag).await?;
    let mut report = ReconcileReport {
        scanned: conversations.len(),
        ..Default::default()
    };

    for conversation in conversations {
        let policy = AutopilotPolicy::new(
            &conversation.conversation_id,
            &conversation.location_id,
            RECONCILE_USER,
        );
        if store.insert_policy_if_absent(&policy).await? {
            debug!(conversation_id = %conversation.conversation_id, tag, "Autopilot enabled from tag");
            report.created += 1;
        } else {
            report.existing += 1;
        }
    }

    info!(
        tag,
        scanned = report.scanned,
        created = report.created,
        existing = report.existing,
        "Tag reconciliation finished"
    );
    Ok(report)
}
