//! Redis mirror of registry state
//!
//! The in-process registry is authoritative; these keys exist so operators
//! (and a restarted instance) can see who was connected. Every write is
//! best-effort: failures are logged and never surface to the caller.
//!
//! Key namespace: `im:agent:*` (agent → session), `im:agent:alive:*`
//! (liveness, TTL'd), `im:agent:status:*`, `im:customer:*` and `im:fd:*`
//! (session → principal).

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use livedesk_shared::AgentStatus;

/// Best-effort KV mirror for registry state
#[derive(Clone)]
pub struct RegistryMirror {
    conn: ConnectionManager,
}

impl RegistryMirror {
    /// Connect to redis; the connection manager reconnects on its own
    pub async fn connect(redis_url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    pub async fn agent_bound(&self, agent_id: Uuid, session_id: Uuid, ttl: Duration) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = async {
            let _: () = conn
                .set(format!("im:agent:{agent_id}"), session_id.to_string())
                .await?;
            let _: () = conn
                .set(
                    format!("im:agent:status:{agent_id}"),
                    AgentStatus::Online.as_str(),
                )
                .await?;
            let _: () = conn
                .set_ex(format!("im:agent:alive:{agent_id}"), "1", ttl.as_secs())
                .await?;
            let _: () = conn
                .set(format!("im:fd:{session_id}"), format!("agent:{agent_id}"))
                .await?;
            Ok(())
        }
        .await;
        log_failure("agent_bound", result);
    }

    pub async fn agent_unbound(&self, agent_id: Uuid, session_id: Option<Uuid>) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = async {
            let _: () = conn.del(format!("im:agent:{agent_id}")).await?;
            let _: () = conn.del(format!("im:agent:alive:{agent_id}")).await?;
            let _: () = conn
                .set(
                    format!("im:agent:status:{agent_id}"),
                    AgentStatus::Offline.as_str(),
                )
                .await?;
            if let Some(session_id) = session_id {
                let _: () = conn.del(format!("im:fd:{session_id}")).await?;
            }
            Ok(())
        }
        .await;
        log_failure("agent_unbound", result);
    }

    pub async fn agent_alive(&self, agent_id: Uuid, ttl: Duration) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn
            .set_ex(format!("im:agent:alive:{agent_id}"), "1", ttl.as_secs())
            .await;
        log_failure("agent_alive", result);
    }

    pub async fn agent_status(&self, agent_id: Uuid, status: AgentStatus) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn
            .set(format!("im:agent:status:{agent_id}"), status.as_str())
            .await;
        log_failure("agent_status", result);
    }

    pub async fn customer_bound(&self, customer_id: Uuid, session_id: Uuid) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = async {
            let _: () = conn
                .set(format!("im:customer:{customer_id}"), session_id.to_string())
                .await?;
            let _: () = conn
                .set(
                    format!("im:fd:{session_id}"),
                    format!("customer:{customer_id}"),
                )
                .await?;
            Ok(())
        }
        .await;
        log_failure("customer_bound", result);
    }

    pub async fn customer_unbound(&self, customer_id: Uuid, session_id: Option<Uuid>) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = async {
            let _: () = conn.del(format!("im:customer:{customer_id}")).await?;
            if let Some(session_id) = session_id {
                let _: () = conn.del(format!("im:fd:{session_id}")).await?;
            }
            Ok(())
        }
        .await;
        log_failure("customer_unbound", result);
    }
}

fn log_failure(op: &str, result: redis::RedisResult<()>) {
    if let Err(e) = result {
        tracing::warn!(op = op, error = %e, "Registry mirror write failed");
    }
}
