//! Waiting-queue drain
//!
//! Belt-and-suspenders sweep behind the primary assignment paths (the
//! customer-inbound path and the agent-online path): walks online agents
//! load-ascending and offers each the head of the waiting queue until the
//! queue empties or no agent can take more.

use tracing::{info, warn};

use crate::lifecycle::Lifecycle;

/// Run one sweep. Returns how many conversations were assigned.
pub async fn sweep(lifecycle: &Lifecycle) -> u64 {
    let queue_head = match lifecycle.store().waiting_queue(1).await {
        Ok(queue) => queue,
        Err(e) => {
            warn!(error = %e, "Waiting-queue read failed");
            return 0;
        }
    };
    if queue_head.is_empty() {
        return 0;
    }

    let mut assigned_total = 0u64;
    for (agent_id, _) in lifecycle.registry().agents_by_load().await {
        match lifecycle.try_drain_waiting_for(agent_id).await {
            Ok(assigned) => assigned_total += assigned,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Queue drain failed for agent");
            }
        }

        match lifecycle.store().waiting_queue(1).await {
            Ok(queue) if queue.is_empty() => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Waiting-queue re-read failed");
                break;
            }
        }
    }

    if assigned_total > 0 {
        info!(assigned = assigned_total, "Waiting-queue sweep assigned conversations");
    }
    assigned_total
}
