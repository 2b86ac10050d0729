//! Connection registry
//!
//! Authoritative in-process map of who is online over which session, plus
//! the per-agent liveness TTL and load ordering the assignment engine
//! consumes. All volatile session state lives behind one lock; the redis
//! mirror (when configured) trails every mutation best-effort and is never
//! consulted for correctness.

pub mod mirror;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

use livedesk_shared::AgentStatus;

use crate::websocket::connection::SessionHandle;
use crate::websocket::events::ServerFrame;
use mirror::RegistryMirror;

/// Who a session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    Agent(Uuid),
    Customer(Uuid),
}

#[derive(Default)]
struct RegistryInner {
    /// agent id -> session (one-to-one; second login evicts the first)
    agent_sessions: HashMap<Uuid, SessionHandle>,
    /// customer id -> session (second connection replaces the first)
    customer_sessions: HashMap<Uuid, SessionHandle>,
    /// session id -> principal
    principals: HashMap<Uuid, Principal>,
    /// informational presence cache; liveness below is authoritative
    statuses: HashMap<Uuid, AgentStatus>,
    /// liveness deadlines, refreshed by heartbeat
    liveness: HashMap<Uuid, Instant>,
    /// load scores for ONLINE non-admin agents only
    loads: HashMap<Uuid, f64>,
}

/// Registry of live sessions and agent presence
pub struct Registry {
    inner: RwLock<RegistryInner>,
    heartbeat_ttl: Duration,
    mirror: Option<RegistryMirror>,
}

impl Registry {
    pub fn new(heartbeat_ttl: Duration, mirror: Option<RegistryMirror>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            heartbeat_ttl,
            mirror,
        }
    }

    /// Bind an agent to a session, evicting any prior session.
    ///
    /// If the prior transport is still established it receives a `kicked`
    /// frame before the mapping is overwritten; a dead prior transport is
    /// simply overwritten. Sets status ONLINE, refreshes the liveness TTL
    /// and inserts the supplied load score.
    pub async fn bind_agent(&self, agent_id: Uuid, session: SessionHandle, load: f64) {
        let session_id = session.session_id;
        {
            let mut inner = self.inner.write().await;

            if let Some(old) = inner.agent_sessions.get(&agent_id).cloned() {
                if old.session_id != session.session_id {
                    if old.is_open() {
                        old.send(ServerFrame::Kicked {
                            message: "signed in from another session".to_string(),
                        });
                        tracing::info!(
                            agent_id = %agent_id,
                            old_session = %old.session_id,
                            new_session = %session.session_id,
                            "Evicted prior agent session"
                        );
                    } else {
                        tracing::debug!(
                            agent_id = %agent_id,
                            old_session = %old.session_id,
                            "Prior agent session already dead, overwriting"
                        );
                    }
                    inner.principals.remove(&old.session_id);
                }
            }

            inner
                .principals
                .insert(session.session_id, Principal::Agent(agent_id));
            inner.agent_sessions.insert(agent_id, session);
            inner.statuses.insert(agent_id, AgentStatus::Online);
            inner
                .liveness
                .insert(agent_id, Instant::now() + self.heartbeat_ttl);
            inner.loads.insert(agent_id, load);

            tracing::info!(
                agent_id = %agent_id,
                session_id = %session_id,
                "Agent bound"
            );
        }

        if let Some(m) = &self.mirror {
            m.agent_bound(agent_id, session_id, self.heartbeat_ttl).await;
        }
    }

    /// Bind a customer to a session, replacing any prior one
    pub async fn bind_customer(&self, customer_id: Uuid, session: SessionHandle) {
        let session_id = session.session_id;
        {
            let mut inner = self.inner.write().await;

            if let Some(old) = inner.customer_sessions.get(&customer_id).cloned() {
                if old.session_id != session.session_id {
                    inner.principals.remove(&old.session_id);
                    tracing::debug!(
                        customer_id = %customer_id,
                        old_session = %old.session_id,
                        "Replaced prior customer session"
                    );
                }
            }

            inner
                .principals
                .insert(session.session_id, Principal::Customer(customer_id));
            inner.customer_sessions.insert(customer_id, session);
        }

        if let Some(m) = &self.mirror {
            m.customer_bound(customer_id, session_id).await;
        }
    }

    /// Remove a session's mappings. Agents additionally go OFFLINE with
    /// liveness and load cleared. Returns the principal that was bound.
    ///
    /// A stale session (already superseded by a newer bind for the same
    /// principal) only removes its own reverse entry.
    pub async fn unbind_by_session(&self, session_id: Uuid) -> Option<Principal> {
        let principal = {
            let mut inner = self.inner.write().await;
            let principal = inner.principals.remove(&session_id)?;

            match principal {
                Principal::Agent(agent_id) => {
                    let current = inner
                        .agent_sessions
                        .get(&agent_id)
                        .map(|s| s.session_id == session_id)
                        .unwrap_or(false);
                    if current {
                        inner.agent_sessions.remove(&agent_id);
                        inner.statuses.insert(agent_id, AgentStatus::Offline);
                        inner.liveness.remove(&agent_id);
                        inner.loads.remove(&agent_id);
                        tracing::info!(agent_id = %agent_id, session_id = %session_id, "Agent unbound");
                    }
                }
                Principal::Customer(customer_id) => {
                    let current = inner
                        .customer_sessions
                        .get(&customer_id)
                        .map(|s| s.session_id == session_id)
                        .unwrap_or(false);
                    if current {
                        inner.customer_sessions.remove(&customer_id);
                    }
                }
            }
            Some(principal)
        }?;

        if let Some(m) = &self.mirror {
            match principal {
                Principal::Agent(id) => m.agent_unbound(id, Some(session_id)).await,
                Principal::Customer(id) => m.customer_unbound(id, Some(session_id)).await,
            }
        }
        Some(principal)
    }

    /// Refresh the liveness TTL. No-op when the agent has no bound session.
    pub async fn heartbeat(&self, agent_id: Uuid) {
        let bound = {
            let mut inner = self.inner.write().await;
            if inner.agent_sessions.contains_key(&agent_id) {
                inner
                    .liveness
                    .insert(agent_id, Instant::now() + self.heartbeat_ttl);
                true
            } else {
                false
            }
        };

        if bound {
            if let Some(m) = &self.mirror {
                m.agent_alive(agent_id, self.heartbeat_ttl).await;
            }
        }
    }

    pub async fn lookup_agent_session(&self, agent_id: Uuid) -> Option<SessionHandle> {
        self.inner.read().await.agent_sessions.get(&agent_id).cloned()
    }

    pub async fn lookup_customer_session(&self, customer_id: Uuid) -> Option<SessionHandle> {
        self.inner
            .read()
            .await
            .customer_sessions
            .get(&customer_id)
            .cloned()
    }

    pub async fn lookup_by_session(&self, session_id: Uuid) -> Option<Principal> {
        self.inner.read().await.principals.get(&session_id).copied()
    }

    /// Unknown agents report OFFLINE
    pub async fn agent_status(&self, agent_id: Uuid) -> AgentStatus {
        self.inner
            .read()
            .await
            .statuses
            .get(&agent_id)
            .copied()
            .unwrap_or_default()
    }

    /// Change an agent's presence. Leaving ONLINE drops the load entry and
    /// stops TTL refresh; entering ONLINE re-inserts with the given load.
    pub async fn set_status(&self, agent_id: Uuid, status: AgentStatus, load: f64) {
        {
            let mut inner = self.inner.write().await;
            let previous = inner.statuses.insert(agent_id, status).unwrap_or_default();

            match (previous, status) {
                (AgentStatus::Online, AgentStatus::Online) => {}
                (AgentStatus::Online, _) => {
                    inner.loads.remove(&agent_id);
                }
                (_, AgentStatus::Online) => {
                    inner.loads.insert(agent_id, load);
                    inner
                        .liveness
                        .insert(agent_id, Instant::now() + self.heartbeat_ttl);
                }
                _ => {}
            }
        }

        if let Some(m) = &self.mirror {
            m.agent_status(agent_id, status).await;
        }
    }

    /// True iff the liveness marker exists and has not expired
    pub async fn is_alive(&self, agent_id: Uuid) -> bool {
        self.inner
            .read()
            .await
            .liveness
            .get(&agent_id)
            .map(|deadline| *deadline > Instant::now())
            .unwrap_or(false)
    }

    /// Snapshot of (agent id, load score) ascending. Equal scores order by
    /// agent id so the ranking is stable. May miss very recent mutations.
    pub async fn agents_by_load(&self) -> Vec<(Uuid, f64)> {
        let mut scores: Vec<(Uuid, f64)> = self
            .inner
            .read()
            .await
            .loads
            .iter()
            .map(|(id, score)| (*id, *score))
            .collect();
        scores.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scores
    }

    /// Upsert a load score if the agent is present in the ordering; no-op
    /// otherwise (the agent is offline or was never inserted)
    pub async fn update_load(&self, agent_id: Uuid, score: f64) {
        let mut inner = self.inner.write().await;
        if inner.loads.contains_key(&agent_id) {
            inner.loads.insert(agent_id, score);
        }
    }

    /// Agents currently marked ONLINE (the heartbeat sweep's working set)
    pub async fn online_agents(&self) -> Vec<Uuid> {
        self.inner
            .read()
            .await
            .statuses
            .iter()
            .filter(|(_, s)| **s == AgentStatus::Online)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Force an agent fully offline: drop its session mapping, status,
    /// liveness and load. Used by the heartbeat sweep when the TTL lapsed
    /// without a clean disconnect.
    pub async fn force_offline(&self, agent_id: Uuid) {
        let removed_session = {
            let mut inner = self.inner.write().await;
            let removed = match inner.agent_sessions.remove(&agent_id) {
                Some(session) => {
                    inner.principals.remove(&session.session_id);
                    Some(session.session_id)
                }
                None => None,
            };
            inner.statuses.insert(agent_id, AgentStatus::Offline);
            inner.liveness.remove(&agent_id);
            inner.loads.remove(&agent_id);
            removed
        };

        if let Some(m) = &self.mirror {
            m.agent_unbound(agent_id, removed_session).await;
        }
        tracing::info!(agent_id = %agent_id, "Agent forced offline");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn registry() -> Registry {
        Registry::new(Duration::from_secs(60), None)
    }

    fn session() -> (SessionHandle, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionHandle::new(tx), rx)
    }

    #[tokio::test]
    async fn test_bind_agent_sets_presence() {
        let reg = registry();
        let agent = Uuid::new_v4();
        let (s, _rx) = session();

        reg.bind_agent(agent, s.clone(), 0.0).await;

        assert_eq!(reg.agent_status(agent).await, AgentStatus::Online);
        assert!(reg.is_alive(agent).await);
        assert_eq!(
            reg.lookup_agent_session(agent).await.unwrap().session_id,
            s.session_id
        );
        assert_eq!(
            reg.lookup_by_session(s.session_id).await,
            Some(Principal::Agent(agent))
        );
        assert_eq!(reg.agents_by_load().await, vec![(agent, 0.0)]);
    }

    #[tokio::test]
    async fn test_second_login_kicks_first() {
        let reg = registry();
        let agent = Uuid::new_v4();
        let (s1, mut rx1) = session();
        let (s2, _rx2) = session();

        reg.bind_agent(agent, s1.clone(), 0.0).await;
        reg.bind_agent(agent, s2.clone(), 0.0).await;

        // Old session got the kicked frame before the overwrite
        assert!(matches!(
            rx1.recv().await,
            Some(ServerFrame::Kicked { .. })
        ));
        // Mapping now points at the second session
        assert_eq!(
            reg.lookup_agent_session(agent).await.unwrap().session_id,
            s2.session_id
        );
        // The first session's reverse entry is gone
        assert_eq!(reg.lookup_by_session(s1.session_id).await, None);
    }

    #[tokio::test]
    async fn test_stale_unbind_does_not_clobber_new_session() {
        let reg = registry();
        let agent = Uuid::new_v4();
        let (s1, _rx1) = session();
        let (s2, _rx2) = session();

        reg.bind_agent(agent, s1.clone(), 0.0).await;
        reg.bind_agent(agent, s2.clone(), 0.0).await;

        // The evicted session's transport close arrives afterwards
        reg.unbind_by_session(s1.session_id).await;

        assert_eq!(reg.agent_status(agent).await, AgentStatus::Online);
        assert_eq!(
            reg.lookup_agent_session(agent).await.unwrap().session_id,
            s2.session_id
        );
    }

    #[tokio::test]
    async fn test_unbind_clears_agent_state() {
        let reg = registry();
        let agent = Uuid::new_v4();
        let (s, _rx) = session();

        reg.bind_agent(agent, s.clone(), 1.5).await;
        let principal = reg.unbind_by_session(s.session_id).await;

        assert_eq!(principal, Some(Principal::Agent(agent)));
        assert_eq!(reg.agent_status(agent).await, AgentStatus::Offline);
        assert!(!reg.is_alive(agent).await);
        assert!(reg.agents_by_load().await.is_empty());
        assert!(reg.lookup_agent_session(agent).await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_requires_binding() {
        let reg = Registry::new(Duration::from_millis(20), None);
        let agent = Uuid::new_v4();

        // No binding: heartbeat is a no-op
        reg.heartbeat(agent).await;
        assert!(!reg.is_alive(agent).await);

        let (s, _rx) = session();
        reg.bind_agent(agent, s, 0.0).await;
        assert!(reg.is_alive(agent).await);

        // Marker expires without refresh
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!reg.is_alive(agent).await);

        reg.heartbeat(agent).await;
        assert!(reg.is_alive(agent).await);
    }

    #[tokio::test]
    async fn test_load_ordering_ascending_with_stable_ties() {
        let reg = registry();
        let mut ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        ids.sort();

        let (s0, _r0) = session();
        let (s1, _r1) = session();
        let (s2, _r2) = session();
        reg.bind_agent(ids[0], s0, 2.0).await;
        reg.bind_agent(ids[1], s1, 0.5).await;
        reg.bind_agent(ids[2], s2, 0.5).await;

        let order: Vec<Uuid> = reg.agents_by_load().await.into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
    }

    #[tokio::test]
    async fn test_set_status_away_from_online_drops_load() {
        let reg = registry();
        let agent = Uuid::new_v4();
        let (s, _rx) = session();
        reg.bind_agent(agent, s, 1.0).await;

        reg.set_status(agent, AgentStatus::Busy, 0.0).await;
        assert!(reg.agents_by_load().await.is_empty());

        // update_load on an absent agent is a no-op
        reg.update_load(agent, 3.0).await;
        assert!(reg.agents_by_load().await.is_empty());

        reg.set_status(agent, AgentStatus::Online, 2.0).await;
        assert_eq!(reg.agents_by_load().await, vec![(agent, 2.0)]);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_offline() {
        let reg = registry();
        assert_eq!(reg.agent_status(Uuid::new_v4()).await, AgentStatus::Offline);
    }
}
