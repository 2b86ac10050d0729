//! Agent assignment engine
//!
//! Walks the registry's load ordering ascending and returns the first
//! agent that can actually take another conversation. The cached load
//! score only orders candidates; the capacity decision is always a live
//! store read, so a stale score can cost an extra query but never an
//! over-assignment.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use livedesk_shared::AgentStatus;

use crate::registry::Registry;
use crate::store::{ConversationStore, StoreResult};

const ACTIVE_WEIGHT: f64 = 1.0;
// A queued customer is actively suffering; weight waiting conversations higher
const WAITING_WEIGHT: f64 = 1.5;

/// Ordering hint for the registry's load ranking
pub async fn load_score(store: &dyn ConversationStore, agent_id: Uuid) -> StoreResult<f64> {
    let (active, waiting) = store.counts_for_agent(agent_id).await?;
    Ok(active as f64 * ACTIVE_WEIGHT + waiting as f64 * WAITING_WEIGHT)
}

pub struct AssignmentEngine {
    registry: Arc<Registry>,
    store: Arc<dyn ConversationStore>,
}

impl AssignmentEngine {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn ConversationStore>) -> Self {
        Self { registry, store }
    }

    /// Best candidate for a new or transferred conversation, or None when
    /// every online agent is excluded, unavailable or full.
    pub async fn pick(&self, exclude: &HashSet<Uuid>) -> Option<Uuid> {
        for (agent_id, score) in self.registry.agents_by_load().await {
            if exclude.contains(&agent_id) {
                continue;
            }
            if self.registry.agent_status(agent_id).await != AgentStatus::Online {
                continue;
            }
            if !self.registry.is_alive(agent_id).await {
                continue;
            }

            let agent = match self.store.agent(agent_id).await {
                Ok(Some(agent)) => agent,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, error = %e, "Skipping candidate on store error");
                    continue;
                }
            };
            if !agent.enabled || agent.is_admin {
                continue;
            }

            // Live capacity read; the cached score is only the ordering hint
            let active = match self.store.counts_for_agent(agent_id).await {
                Ok((active, _)) => active,
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, error = %e, "Skipping candidate on count error");
                    continue;
                }
            };
            if active >= agent.capacity as i64 {
                continue;
            }

            tracing::debug!(agent_id = %agent_id, score = score, active = active, "Picked assignment candidate");
            return Some(agent_id);
        }
        None
    }
}
