//! Heartbeat sweep
//!
//! Finds agents still marked ONLINE whose liveness marker lapsed (a lost
//! disconnect, a hung client), forces them offline and hands their active
//! conversations to fresh candidates or back to the waiting queue.

use tracing::{error, info};

use crate::lifecycle::Lifecycle;

/// Run one sweep. Returns (forced offline, transferred, reverted).
pub async fn sweep(lifecycle: &Lifecycle) -> (u64, u64, u64) {
    let mut forced = 0u64;
    let mut transferred = 0u64;
    let mut reverted = 0u64;

    for agent_id in lifecycle.registry().online_agents().await {
        if lifecycle.registry().is_alive(agent_id).await {
            continue;
        }

        lifecycle.registry().force_offline(agent_id).await;
        forced += 1;

        match lifecycle.handle_agent_offline(agent_id).await {
            Ok((moved, queued)) => {
                transferred += moved;
                reverted += queued;
            }
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "Offline handoff sweep failed for agent");
            }
        }
    }

    if forced > 0 {
        info!(
            forced_offline = forced,
            transferred = transferred,
            reverted = reverted,
            "Heartbeat sweep reaped stale agents"
        );
    }
    (forced, transferred, reverted)
}
