//! WebSocket frame types and serialization
//!
//! Inbound frames arrive as `{"type": ..., "data": {...}}`; outbound frames
//! are flat tagged objects. Unrecognized inbound types fail to parse and
//! are dropped by the handler.

use livedesk_shared::{AgentStatus, ContentKind, ConversationStatus, Message, SenderKind};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Client-to-Server Frames
// =============================================================================

/// Frames sent from client to server
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Heartbeat; refreshes the agent liveness marker
    Ping,

    /// Chat message. Customers omit `conversation_id` (the server resolves
    /// their open conversation); agents must name the conversation.
    Message {
        conversation_id: Option<Uuid>,
        content: String,
        #[serde(default)]
        content_kind: ContentKind,
    },

    /// Typing indicator, forwarded to the counterpart without persistence
    Typing {
        conversation_id: Uuid,
        typing: bool,
    },

    /// Mark the counterpart's messages in a conversation as read
    Read { conversation_id: Uuid },

    /// Close a conversation (assigned agent only)
    CloseConversation { conversation_id: Uuid },

    /// Agent presence change
    Status { status: AgentStatus },
}

// =============================================================================
// Server-to-Client Frames
// =============================================================================

/// Frames sent from server to client
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Connection acknowledged
    Connected {
        session_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        customer_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<AgentStatus>,
    },

    /// Heartbeat response
    Pong,

    /// A message arrived in one of the recipient's conversations
    NewMessage {
        conversation_id: Uuid,
        message: MessagePayload,
    },

    /// Delivery acknowledgement echoed to the sender
    MessageSent {
        conversation_id: Uuid,
        message_id: i64,
    },

    /// A conversation landed on this agent (fresh assignment or transfer)
    ConversationAssigned {
        conversation: ConversationSummary,
        customer: CustomerSummary,
        /// Full history; populated on transfer, empty on fresh assignment
        messages: Vec<MessagePayload>,
        unread_count: i64,
        is_transfer: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_agent_id: Option<Uuid>,
    },

    /// Told to the customer once an agent picks up their conversation
    AgentAssigned {
        conversation_id: Uuid,
        agent_id: Uuid,
        agent_name: String,
    },

    /// No agent free; the conversation stays queued
    QueueNotice { conversation_id: Uuid },

    ConversationClosed { conversation_id: Uuid },

    /// Told to the losing agent on transfer
    ConversationTransferredOut {
        conversation_id: Uuid,
        to_agent_id: Uuid,
        to_agent_name: String,
        kind: livedesk_shared::TransferKind,
        reason: String,
    },

    /// Told to the customer when their conversation changes hands
    AgentChanged {
        conversation_id: Uuid,
        agent_name: String,
        message: String,
    },

    Typing {
        conversation_id: Uuid,
        typing: bool,
    },

    MessagesRead {
        conversation_id: Uuid,
        reader: SenderKind,
    },

    /// Unread agent messages replayed to a reconnecting customer
    OfflineMessages {
        conversation_id: Uuid,
        messages: Vec<MessagePayload>,
    },

    /// Session evicted because the agent logged in elsewhere
    Kicked { message: String },

    /// Echo of a status frame
    StatusChanged { status: AgentStatus },

    Error { message: String },
}

// =============================================================================
// Frame Data Structures
// =============================================================================

/// Message data on the wire
#[derive(Debug, Serialize, Clone)]
pub struct MessagePayload {
    pub id: i64,
    pub conversation_id: Uuid,
    pub sender_kind: SenderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Uuid>,
    pub content_kind: ContentKind,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&Message> for MessagePayload {
    fn from(m: &Message) -> Self {
        MessagePayload {
            id: m.id,
            conversation_id: m.conversation_id,
            sender_kind: m.sender_kind,
            sender_id: m.sender_id,
            content_kind: m.content_kind,
            content: m.body.clone(),
            created_at: m.created_at,
        }
    }
}

/// Conversation data embedded in assignment frames
#[derive(Debug, Serialize, Clone)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub status: ConversationStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
}

impl From<&livedesk_shared::Conversation> for ConversationSummary {
    fn from(c: &livedesk_shared::Conversation) -> Self {
        ConversationSummary {
            id: c.id,
            customer_id: c.customer_id,
            status: c.status,
            created_at: c.created_at,
            last_message_at: c.last_message_at,
        }
    }
}

/// Customer data embedded in assignment frames
#[derive(Debug, Serialize, Clone)]
pub struct CustomerSummary {
    pub id: Uuid,
    pub external_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_page: Option<String>,
}

impl From<&livedesk_shared::Customer> for CustomerSummary {
    fn from(c: &livedesk_shared::Customer) -> Self {
        CustomerSummary {
            id: c.id,
            external_id: c.external_id.clone(),
            locale: c.locale.clone(),
            source_page: c.source_page.clone(),
        }
    }
}
