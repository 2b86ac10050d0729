//! Timeout auto-transfer
//!
//! Conversations whose customer has been waiting on a reply past the
//! configured threshold get handed to a fresh candidate. Without a
//! candidate the conversation stays with its current agent, who may still
//! answer; only the failure counter moves.

use std::collections::HashSet;

use time::OffsetDateTime;
use tracing::{info, warn};

use livedesk_shared::TransferKind;

use crate::lifecycle::Lifecycle;

/// Run one sweep. Returns (transferred, failed).
pub async fn sweep(lifecycle: &Lifecycle, threshold_mins: i64) -> (u64, u64) {
    let cutoff = OffsetDateTime::now_utc() - time::Duration::minutes(threshold_mins);
    let candidates = match lifecycle.store().timeout_candidates(cutoff).await {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!(error = %e, "Timeout candidate query failed");
            return (0, 0);
        }
    };
    if candidates.is_empty() {
        return (0, 0);
    }

    let mut transferred = 0u64;
    let mut failed = 0u64;
    let reason = format!("customer unanswered {threshold_mins} minutes");

    for conversation in candidates {
        let Some(current_agent) = conversation.agent_id else {
            continue;
        };

        let target = lifecycle
            .pick_candidate(&HashSet::from([current_agent]))
            .await;
        match target {
            Some(target) => {
                match lifecycle
                    .transfer(
                        conversation.id,
                        target,
                        TransferKind::AutoTimeout,
                        None,
                        &reason,
                    )
                    .await
                {
                    Ok(()) => transferred += 1,
                    Err(e) => {
                        failed += 1;
                        warn!(
                            conversation_id = %conversation.id,
                            target = %target,
                            error = %e,
                            "Timeout transfer failed"
                        );
                    }
                }
            }
            None => failed += 1,
        }
    }

    info!(
        transferred = transferred,
        failed = failed,
        threshold_mins = threshold_mins,
        "Timeout sweep finished"
    );
    (transferred, failed)
}
