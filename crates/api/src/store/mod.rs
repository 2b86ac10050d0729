//! Conversation store
//!
//! Owns every persistent record: agents, customers, conversations,
//! messages and the transfer log. The lifecycle manager, assignment
//! engine and reconcilers are written against the trait; `PgStore` is the
//! production adapter and `MemoryStore` backs the scenario tests.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use livedesk_shared::{
    Agent, ContentKind, Conversation, Customer, CustomerProfile, Message, SenderKind,
    TransferKind, TransferRecord,
};

/// Store error type
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conversation is closed")]
    Closed,
    #[error("conversation is not active")]
    NotActive,
    #[error("conversation is assigned to another agent")]
    AlreadyAssigned,
    #[error("agent is at capacity")]
    AgentFull,
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Database(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Input for a transfer-log entry
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub conversation_id: Uuid,
    pub from_agent_id: Uuid,
    pub to_agent_id: Uuid,
    pub kind: TransferKind,
    pub operator_id: Option<Uuid>,
    pub reason: String,
}

/// Durable records behind the dispatch core.
///
/// Multi-step transitions (`assign`, `reassign`, `close`) are conditional
/// updates: two racers onto one WAITING conversation are settled here, not
/// by callers.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    // -- agents ---------------------------------------------------------

    async fn agent(&self, id: Uuid) -> StoreResult<Option<Agent>>;

    // -- customers ------------------------------------------------------

    /// Look up by the client-supplied stable id, creating the record on
    /// first sight and refreshing `last_seen_at` on every call.
    async fn get_or_create_customer(
        &self,
        external_id: &str,
        profile: CustomerProfile,
    ) -> StoreResult<Customer>;

    async fn customer(&self, id: Uuid) -> StoreResult<Option<Customer>>;

    // -- conversations --------------------------------------------------

    /// The customer's current non-closed conversation, or a fresh WAITING
    /// one. Race-free for concurrent calls on the same customer; the bool
    /// reports whether this call created it.
    async fn get_or_open_for(&self, customer_id: Uuid) -> StoreResult<(Conversation, bool)>;

    /// The customer's current non-closed conversation without opening one
    /// (connect-time unread replay must not create conversations)
    async fn open_conversation_for(&self, customer_id: Uuid)
        -> StoreResult<Option<Conversation>>;

    async fn conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>>;

    /// WAITING → ACTIVE with the agent set. Idempotent when already ACTIVE
    /// for the same agent; fails on CLOSED, on a different assignee, and
    /// when the agent has no remaining capacity.
    async fn assign(&self, conversation_id: Uuid, agent_id: Uuid) -> StoreResult<()>;

    /// ACTIVE → ACTIVE with the agent overwritten. Lifecycle checks the
    /// transfer preconditions; the status/capacity conditions here are the
    /// backstop against races.
    async fn reassign(&self, conversation_id: Uuid, agent_id: Uuid) -> StoreResult<()>;

    /// ACTIVE → WAITING with the agent cleared (no candidate was found
    /// when the holding agent went offline)
    async fn revert_to_waiting(&self, conversation_id: Uuid) -> StoreResult<()>;

    /// → CLOSED with `closed_at` stamped; idempotent
    async fn close(&self, conversation_id: Uuid) -> StoreResult<()>;

    /// (active, waiting) non-closed conversation counts for an agent.
    /// This is the live capacity read the assignment engine relies on.
    async fn counts_for_agent(&self, agent_id: Uuid) -> StoreResult<(i64, i64)>;

    async fn active_for_agent(&self, agent_id: Uuid) -> StoreResult<Vec<Conversation>>;

    /// WAITING conversations with no agent, oldest first
    async fn waiting_queue(&self, limit: i64) -> StoreResult<Vec<Conversation>>;

    async fn recent_conversations(&self, limit: i64) -> StoreResult<Vec<Conversation>>;

    /// ACTIVE conversations whose customer has been waiting on a reply
    /// since before `cutoff`
    async fn timeout_candidates(&self, cutoff: OffsetDateTime) -> StoreResult<Vec<Conversation>>;

    // -- messages -------------------------------------------------------

    /// Append a message and advance the conversation's last-message
    /// timestamp (and the per-sender-kind timestamp for customer/agent
    /// senders; those only ever move forward).
    #[allow(clippy::too_many_arguments)]
    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_kind: SenderKind,
        sender_id: Option<Uuid>,
        content_kind: ContentKind,
        body: &str,
        visible_to_customer: bool,
    ) -> StoreResult<Message>;

    async fn messages(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>>;

    /// Unread messages authored by `from`, oldest first
    async fn unread_messages(
        &self,
        conversation_id: Uuid,
        from: SenderKind,
    ) -> StoreResult<Vec<Message>>;

    async fn unread_count(&self, conversation_id: Uuid, from: SenderKind) -> StoreResult<i64>;

    /// Flip read=true on the counterpart's messages; returns how many
    async fn mark_read(&self, conversation_id: Uuid, reader: SenderKind) -> StoreResult<u64>;

    /// Reset every message to unread (transfer hand-off)
    async fn mark_all_unread(&self, conversation_id: Uuid) -> StoreResult<u64>;

    // -- transfer log ---------------------------------------------------

    async fn append_transfer(&self, transfer: NewTransfer) -> StoreResult<TransferRecord>;

    async fn transfers(&self, conversation_id: Uuid) -> StoreResult<Vec<TransferRecord>>;
}
