//! Common types used across LiveDesk
//!
//! Status, sender and transfer kinds are stored as small integers in the
//! database and as snake_case strings on the WebSocket wire; each enum
//! carries the integer boundary explicitly so the mapping lives in exactly
//! one place.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Status and kind enums
// =============================================================================

/// Lifecycle status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// Opened, no agent assigned yet
    Waiting,
    /// Assigned to an agent
    Active,
    /// Terminal; the next customer message opens a fresh conversation
    Closed,
}

impl ConversationStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::Waiting => 0,
            Self::Active => 1,
            Self::Closed => 2,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(Self::Waiting),
            1 => Some(Self::Active),
            2 => Some(Self::Closed),
            _ => None,
        }
    }

    /// Closed conversations never leave that state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    /// Server-generated notices (transfer markers); never attributed to a user
    System,
    Customer,
    Agent,
}

impl SenderKind {
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::System => 0,
            Self::Customer => 1,
            Self::Agent => 2,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(Self::System),
            1 => Some(Self::Customer),
            2 => Some(Self::Agent),
            _ => None,
        }
    }

    /// The kind whose messages a reader of this kind marks as read.
    pub fn counterpart(&self) -> Option<SenderKind> {
        match self {
            Self::Agent => Some(Self::Customer),
            Self::Customer => Some(Self::Agent),
            Self::System => None,
        }
    }
}

/// Payload type of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    #[default]
    Text,
    /// Body is a URL produced by the external upload surface
    Image,
}

impl ContentKind {
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::Text => 0,
            Self::Image => 1,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(Self::Text),
            1 => Some(Self::Image),
            _ => None,
        }
    }
}

/// Why a conversation moved between agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Operator-initiated via the admin surface
    Manual,
    /// Customer went unanswered past the configured threshold
    AutoTimeout,
    /// Holding agent dropped offline past the heartbeat TTL
    AutoAgentOffline,
}

impl TransferKind {
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::Manual => 1,
            Self::AutoTimeout => 2,
            Self::AutoAgentOffline => 3,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            1 => Some(Self::Manual),
            2 => Some(Self::AutoTimeout),
            3 => Some(Self::AutoAgentOffline),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::AutoTimeout => "auto_timeout",
            Self::AutoAgentOffline => "auto_agent_offline",
        }
    }
}

/// Registry-volatile presence of an agent. Never persisted; the liveness
/// TTL, not this value, is authoritative wherever capacity matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    #[default]
    Offline,
    Busy,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Busy => "busy",
        }
    }
}

// =============================================================================
// Persistent records
// =============================================================================

/// A support operator. Created and mutated only by the external admin
/// surface; the dispatch core reads these records.
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub id: Uuid,
    pub display_name: String,
    /// Opaque credential hash owned by the external login surface
    #[serde(skip_serializing)]
    pub credential_hash: String,
    /// Max concurrent non-closed conversations
    pub capacity: i32,
    pub enabled: bool,
    /// Admins observe and force transfers but are never assignment candidates
    pub is_admin: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// An unauthenticated visitor, keyed by a stable client-supplied id.
/// Created lazily on first connection and never deleted by the core.
#[derive(Debug, Clone, Serialize)]
pub struct Customer {
    pub id: Uuid,
    pub external_id: String,
    pub address: Option<String>,
    pub user_agent: Option<String>,
    pub locale: Option<String>,
    pub source_page: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen_at: OffsetDateTime,
}

/// Descriptive fields captured at first sight of a customer.
#[derive(Debug, Clone, Default)]
pub struct CustomerProfile {
    pub address: Option<String>,
    pub user_agent: Option<String>,
    pub locale: Option<String>,
    pub source_page: Option<String>,
}

/// One customer↔agent engagement.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub status: ConversationStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_agent_reply_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_customer_message_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub closed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A single message. Immutable after creation except for the read flag.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: Uuid,
    pub sender_kind: SenderKind,
    /// None for system messages
    pub sender_id: Option<Uuid>,
    pub content_kind: ContentKind,
    pub body: String,
    pub read: bool,
    /// System notices the customer-facing history should elide set this false
    pub visible_to_customer: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Append-only record of a conversation changing hands.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub id: i64,
    pub conversation_id: Uuid,
    pub from_agent_id: Uuid,
    pub to_agent_id: Uuid,
    pub kind: TransferKind,
    /// Set only for manual transfers
    pub operator_id: Option<Uuid>,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_integer_boundary() {
        for status in [
            ConversationStatus::Waiting,
            ConversationStatus::Active,
            ConversationStatus::Closed,
        ] {
            assert_eq!(ConversationStatus::from_i16(status.as_i16()), Some(status));
        }
        assert_eq!(ConversationStatus::from_i16(7), None);
        assert!(ConversationStatus::Closed.is_terminal());
        assert!(!ConversationStatus::Active.is_terminal());
    }

    #[test]
    fn test_transfer_kind_codes() {
        // Wire/DB codes are part of the external contract
        assert_eq!(TransferKind::Manual.as_i16(), 1);
        assert_eq!(TransferKind::AutoTimeout.as_i16(), 2);
        assert_eq!(TransferKind::AutoAgentOffline.as_i16(), 3);
        assert_eq!(TransferKind::from_i16(0), None);
    }

    #[test]
    fn test_sender_counterpart() {
        assert_eq!(SenderKind::Agent.counterpart(), Some(SenderKind::Customer));
        assert_eq!(SenderKind::Customer.counterpart(), Some(SenderKind::Agent));
        assert_eq!(SenderKind::System.counterpart(), None);
    }

    #[test]
    fn test_wire_serialization_is_snake_case() {
        let json = serde_json::to_string(&AgentStatus::Online).unwrap();
        assert_eq!(json, r#""online""#);
        let kind: ContentKind = serde_json::from_str(r#""image""#).unwrap();
        assert_eq!(kind, ContentKind::Image);
    }
}
