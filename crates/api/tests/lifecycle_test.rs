//! End-to-end dispatch scenarios over the in-memory store
//!
//! Real registry, real lifecycle manager, channel receivers standing in
//! for WebSocket transports.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use livedesk_api::lifecycle::{CloseActor, Lifecycle, TransferError};
use livedesk_api::reconciler::{heartbeat, timeout};
use livedesk_api::registry::Registry;
use livedesk_api::store::{ConversationStore, MemoryStore};
use livedesk_api::websocket::connection::SessionHandle;
use livedesk_api::websocket::events::ServerFrame;
use livedesk_shared::{ContentKind, ConversationStatus, Customer, SenderKind, TransferKind};

struct Harness {
    store: Arc<MemoryStore>,
    registry: Arc<Registry>,
    lifecycle: Lifecycle,
}

impl Harness {
    fn new() -> Self {
        Self::with_ttl(Duration::from_secs(60))
    }

    fn with_ttl(ttl: Duration) -> Self {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(Registry::new(ttl, None));
        let lifecycle = Lifecycle::new(
            store.clone() as Arc<dyn ConversationStore>,
            registry.clone(),
        );
        Self {
            store,
            registry,
            lifecycle,
        }
    }

    async fn connect_agent(&self, agent_id: Uuid) -> mpsc::UnboundedReceiver<ServerFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let load = self.lifecycle.current_load(agent_id).await;
        self.registry
            .bind_agent(agent_id, SessionHandle::new(tx), load)
            .await;
        rx
    }

    async fn connect_customer(
        &self,
        external_id: &str,
    ) -> (Customer, mpsc::UnboundedReceiver<ServerFrame>) {
        let customer = self
            .store
            .get_or_create_customer(external_id, Default::default())
            .await
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry
            .bind_customer(customer.id, SessionHandle::new(tx))
            .await;
        (customer, rx)
    }
}

/// Drain everything currently queued on a session
fn frames(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        out.push(frame);
    }
    out
}

// =============================================================================
// S1: first message assigns the free agent
// =============================================================================

#[tokio::test]
async fn s1_first_customer_message_assigns_free_agent() {
    let h = Harness::new();
    let a = h.store.add_agent("Ann", 2, true, false).await;
    let mut agent_rx = h.connect_agent(a).await;
    let (c1, mut customer_rx) = h.connect_customer("visitor-1").await;

    h.lifecycle
        .customer_message(c1.id, "hi", ContentKind::Text)
        .await
        .unwrap();

    // Agent: assignment first, then the triggering message
    let agent_frames = frames(&mut agent_rx);
    assert!(matches!(
        &agent_frames[0],
        ServerFrame::ConversationAssigned {
            is_transfer: false,
            messages,
            ..
        } if messages.is_empty()
    ));
    assert!(matches!(
        &agent_frames[1],
        ServerFrame::NewMessage { message, .. } if message.content == "hi"
    ));

    // Customer: assignment ack, then delivery echo
    let customer_frames = frames(&mut customer_rx);
    assert!(matches!(
        &customer_frames[0],
        ServerFrame::AgentAssigned { agent_id, agent_name, .. }
            if *agent_id == a && agent_name.as_str() == "Ann"
    ));
    assert!(matches!(&customer_frames[1], ServerFrame::MessageSent { .. }));

    let (active, _) = h.store.counts_for_agent(a).await.unwrap();
    assert_eq!(active, 1);

    let conv = h.store.open_conversation_for(c1.id).await.unwrap().unwrap();
    assert_eq!(conv.status, ConversationStatus::Active);
    assert_eq!(conv.agent_id, Some(a));
}

// =============================================================================
// S2: everyone full, the customer queues
// =============================================================================

#[tokio::test]
async fn s2_full_agent_leaves_second_customer_waiting() {
    let h = Harness::new();
    let a = h.store.add_agent("Ann", 1, true, false).await;
    let mut agent_rx = h.connect_agent(a).await;

    let (c1, _c1_rx) = h.connect_customer("visitor-1").await;
    h.lifecycle
        .customer_message(c1.id, "hi", ContentKind::Text)
        .await
        .unwrap();
    frames(&mut agent_rx); // drop the first assignment's frames

    let (c2, mut c2_rx) = h.connect_customer("visitor-2").await;
    h.lifecycle
        .customer_message(c2.id, "hi", ContentKind::Text)
        .await
        .unwrap();

    let c2_frames = frames(&mut c2_rx);
    assert!(matches!(&c2_frames[0], ServerFrame::QueueNotice { .. }));
    assert!(matches!(&c2_frames[1], ServerFrame::MessageSent { .. }));

    // The full agent hears nothing about the queued conversation
    assert!(frames(&mut agent_rx).is_empty());

    let conv2 = h.store.open_conversation_for(c2.id).await.unwrap().unwrap();
    assert_eq!(conv2.status, ConversationStatus::Waiting);
    assert_eq!(conv2.agent_id, None);
}

// =============================================================================
// S3: closing drains the queue onto the freed agent
// =============================================================================

#[tokio::test]
async fn s3_close_immediately_drains_waiting_queue() {
    let h = Harness::new();
    let a = h.store.add_agent("Ann", 1, true, false).await;
    let mut agent_rx = h.connect_agent(a).await;

    let (c1, mut c1_rx) = h.connect_customer("visitor-1").await;
    h.lifecycle
        .customer_message(c1.id, "hi", ContentKind::Text)
        .await
        .unwrap();
    let conv1 = h.store.open_conversation_for(c1.id).await.unwrap().unwrap();

    let (c2, mut c2_rx) = h.connect_customer("visitor-2").await;
    h.lifecycle
        .customer_message(c2.id, "hi", ContentKind::Text)
        .await
        .unwrap();
    let conv2 = h.store.open_conversation_for(c2.id).await.unwrap().unwrap();

    frames(&mut agent_rx);
    frames(&mut c1_rx);
    frames(&mut c2_rx);

    assert!(h
        .lifecycle
        .close_conversation(conv1.id, CloseActor::Agent(a))
        .await
        .unwrap());

    // Close fans out to both sides of conv1
    let c1_frames = frames(&mut c1_rx);
    assert!(matches!(
        &c1_frames[0],
        ServerFrame::ConversationClosed { conversation_id } if *conversation_id == conv1.id
    ));
    let agent_frames = frames(&mut agent_rx);
    assert!(matches!(
        &agent_frames[0],
        ServerFrame::ConversationClosed { conversation_id } if *conversation_id == conv1.id
    ));
    // ... and the freed slot picks up conv2 right away
    assert!(matches!(
        &agent_frames[1],
        ServerFrame::ConversationAssigned { conversation, .. } if conversation.id == conv2.id
    ));
    let c2_frames = frames(&mut c2_rx);
    assert!(matches!(
        &c2_frames[0],
        ServerFrame::AgentAssigned { conversation_id, .. } if *conversation_id == conv2.id
    ));

    let conv2 = h.store.conversation(conv2.id).await.unwrap().unwrap();
    assert_eq!(conv2.status, ConversationStatus::Active);
    assert_eq!(conv2.agent_id, Some(a));
}

// =============================================================================
// S4: unanswered customer triggers a timeout transfer
// =============================================================================

#[tokio::test]
async fn s4_timeout_transfer_carries_history_and_system_message() {
    let h = Harness::new();
    let a = h.store.add_agent("Ann", 2, true, false).await;
    let b = h.store.add_agent("Bob", 2, true, false).await;
    let mut a_rx = h.connect_agent(a).await;

    // Ann is the only agent online, so the conversation lands on her
    let (c1, mut c1_rx) = h.connect_customer("visitor-1").await;
    h.lifecycle
        .customer_message(c1.id, "anyone there?", ContentKind::Text)
        .await
        .unwrap();
    let conv = h.store.open_conversation_for(c1.id).await.unwrap().unwrap();
    assert_eq!(conv.agent_id, Some(a));

    // Bob comes online before the sweep; Ann never answers
    let mut b_rx = h.connect_agent(b).await;
    frames(&mut a_rx);
    frames(&mut c1_rx);

    let (transferred, failed) = timeout::sweep(&h.lifecycle, 0).await;
    assert_eq!((transferred, failed), (1, 0));

    let a_frames = frames(&mut a_rx);
    assert!(matches!(
        &a_frames[0],
        ServerFrame::ConversationTransferredOut {
            to_agent_id,
            kind: TransferKind::AutoTimeout,
            ..
        } if *to_agent_id == b
    ));

    let b_frames = frames(&mut b_rx);
    match &b_frames[0] {
        ServerFrame::ConversationAssigned {
            is_transfer,
            from_agent_id,
            messages,
            unread_count,
            ..
        } => {
            assert!(*is_transfer);
            assert_eq!(*from_agent_id, Some(a));
            // History includes the customer message and the system notice
            assert!(messages.iter().any(|m| m.content == "anyone there?"));
            assert!(messages
                .iter()
                .any(|m| m.sender_kind == SenderKind::System
                    && m.content.contains("transferred from Ann to Bob")));
            assert!(*unread_count >= 1);
        }
        other => panic!("Expected ConversationAssigned, got {other:?}"),
    }

    let c1_frames = frames(&mut c1_rx);
    assert!(c1_frames.iter().any(
        |f| matches!(f, ServerFrame::AgentChanged { agent_name, .. } if agent_name.as_str() == "Bob")
    ));

    let log = h.store.transfers(conv.id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, TransferKind::AutoTimeout);
}

// =============================================================================
// S5: expired liveness hands conversations over or queues them
// =============================================================================

#[tokio::test]
async fn s5_heartbeat_sweep_transfers_to_live_agent() {
    let h = Harness::with_ttl(Duration::from_millis(50));
    let a = h.store.add_agent("Ann", 2, true, false).await;
    let b = h.store.add_agent("Bob", 2, true, false).await;
    let _a_rx = h.connect_agent(a).await;
    let mut b_rx = h.connect_agent(b).await;

    let (c1, _c1_rx) = h.connect_customer("visitor-1").await;
    let (conv, _) = h.store.get_or_open_for(c1.id).await.unwrap();
    h.store.assign(conv.id, a).await.unwrap();

    // Ann's marker lapses; Bob keeps heartbeating
    tokio::time::sleep(Duration::from_millis(80)).await;
    h.registry.heartbeat(b).await;
    frames(&mut b_rx);

    let (forced, transferred, reverted) = heartbeat::sweep(&h.lifecycle).await;
    assert_eq!((forced, transferred, reverted), (1, 1, 0));

    let conv = h.store.conversation(conv.id).await.unwrap().unwrap();
    assert_eq!(conv.agent_id, Some(b));

    let log = h.store.transfers(conv.id).await.unwrap();
    assert_eq!(log[0].kind, TransferKind::AutoAgentOffline);

    assert!(frames(&mut b_rx)
        .iter()
        .any(|f| matches!(f, ServerFrame::ConversationAssigned { is_transfer: true, .. })));
}

#[tokio::test]
async fn s5_heartbeat_sweep_reverts_to_waiting_when_alone() {
    let h = Harness::with_ttl(Duration::from_millis(50));
    let a = h.store.add_agent("Ann", 2, true, false).await;
    let _a_rx = h.connect_agent(a).await;

    let (c1, _c1_rx) = h.connect_customer("visitor-1").await;
    let (conv, _) = h.store.get_or_open_for(c1.id).await.unwrap();
    h.store.assign(conv.id, a).await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    let (forced, transferred, reverted) = heartbeat::sweep(&h.lifecycle).await;
    assert_eq!((forced, transferred, reverted), (1, 0, 1));

    let conv = h.store.conversation(conv.id).await.unwrap().unwrap();
    assert_eq!(conv.status, ConversationStatus::Waiting);
    assert_eq!(conv.agent_id, None);
}

// =============================================================================
// S6: second login evicts the first session
// =============================================================================

#[tokio::test]
async fn s6_second_login_kicks_first_and_reroutes_pushes() {
    let h = Harness::new();
    let a = h.store.add_agent("Ann", 2, true, false).await;

    let mut rx1 = h.connect_agent(a).await;
    let mut rx2 = h.connect_agent(a).await;

    // s1 got the kicked frame before s2 was acknowledged
    let s1_frames = frames(&mut rx1);
    assert!(matches!(&s1_frames[0], ServerFrame::Kicked { .. }));

    // Subsequent traffic for Ann lands on s2 only
    let (c1, _c1_rx) = h.connect_customer("visitor-1").await;
    h.lifecycle
        .customer_message(c1.id, "hi again", ContentKind::Text)
        .await
        .unwrap();

    assert!(frames(&mut rx1).is_empty());
    assert!(frames(&mut rx2)
        .iter()
        .any(|f| matches!(f, ServerFrame::ConversationAssigned { .. })));
}

// =============================================================================
// Boundary behaviors and invariants
// =============================================================================

#[tokio::test]
async fn transfer_to_full_target_fails_with_target_full() {
    let h = Harness::new();
    let a = h.store.add_agent("Ann", 2, true, false).await;
    let b = h.store.add_agent("Bob", 1, true, false).await;
    let _a_rx = h.connect_agent(a).await;
    let _b_rx = h.connect_agent(b).await;

    // Fill Bob
    let (c1, _) = h.connect_customer("visitor-1").await;
    let (conv_b, _) = h.store.get_or_open_for(c1.id).await.unwrap();
    h.store.assign(conv_b.id, b).await.unwrap();

    let (c2, _) = h.connect_customer("visitor-2").await;
    let (conv_a, _) = h.store.get_or_open_for(c2.id).await.unwrap();
    h.store.assign(conv_a.id, a).await.unwrap();

    let err = h
        .lifecycle
        .transfer(conv_a.id, b, TransferKind::Manual, None, "")
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::TargetFull));
    assert_eq!(err.to_string(), "target full");
}

#[tokio::test]
async fn transfer_to_self_fails_with_same_agent() {
    let h = Harness::new();
    let a = h.store.add_agent("Ann", 2, true, false).await;
    let _a_rx = h.connect_agent(a).await;

    let (c1, _) = h.connect_customer("visitor-1").await;
    let (conv, _) = h.store.get_or_open_for(c1.id).await.unwrap();
    h.store.assign(conv.id, a).await.unwrap();

    let err = h
        .lifecycle
        .transfer(conv.id, a, TransferKind::Manual, None, "")
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::SameAgent));
    assert_eq!(err.to_string(), "same agent");
}

#[tokio::test]
async fn closed_is_terminal_and_next_message_opens_fresh_conversation() {
    let h = Harness::new();
    let a = h.store.add_agent("Ann", 5, true, false).await;
    let _a_rx = h.connect_agent(a).await;

    let (c1, _c1_rx) = h.connect_customer("visitor-1").await;
    h.lifecycle
        .customer_message(c1.id, "first", ContentKind::Text)
        .await
        .unwrap();
    let conv1 = h.store.open_conversation_for(c1.id).await.unwrap().unwrap();

    h.lifecycle
        .close_conversation(conv1.id, CloseActor::Admin)
        .await
        .unwrap();

    h.lifecycle
        .customer_message(c1.id, "second", ContentKind::Text)
        .await
        .unwrap();
    let conv2 = h.store.open_conversation_for(c1.id).await.unwrap().unwrap();

    assert_ne!(conv1.id, conv2.id);
    assert_eq!(
        h.store.conversation(conv1.id).await.unwrap().unwrap().status,
        ConversationStatus::Closed
    );
    // At most one open conversation per customer throughout
    assert_eq!(conv2.status, ConversationStatus::Active);
}

#[tokio::test]
async fn mark_read_clears_counterpart_unread_until_next_message() {
    let h = Harness::new();
    let a = h.store.add_agent("Ann", 5, true, false).await;
    let _a_rx = h.connect_agent(a).await;

    let (c1, mut c1_rx) = h.connect_customer("visitor-1").await;
    h.lifecycle
        .customer_message(c1.id, "one", ContentKind::Text)
        .await
        .unwrap();
    h.lifecycle
        .customer_message(c1.id, "two", ContentKind::Text)
        .await
        .unwrap();
    let conv = h.store.open_conversation_for(c1.id).await.unwrap().unwrap();
    frames(&mut c1_rx);

    h.lifecycle.mark_read_by_agent(a, conv.id).await.unwrap();
    assert_eq!(
        h.store.unread_count(conv.id, SenderKind::Customer).await.unwrap(),
        0
    );
    assert!(frames(&mut c1_rx).iter().any(|f| matches!(
        f,
        ServerFrame::MessagesRead {
            reader: SenderKind::Agent,
            ..
        }
    )));

    h.lifecycle
        .customer_message(c1.id, "three", ContentKind::Text)
        .await
        .unwrap();
    assert_eq!(
        h.store.unread_count(conv.id, SenderKind::Customer).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn agent_capacity_is_never_exceeded() {
    let h = Harness::new();
    let a = h.store.add_agent("Ann", 2, true, false).await;
    let _a_rx = h.connect_agent(a).await;

    for i in 0..5 {
        let (customer, _) = h.connect_customer(&format!("visitor-{i}")).await;
        h.lifecycle
            .customer_message(customer.id, "hello", ContentKind::Text)
            .await
            .unwrap();
    }

    let (active, _) = h.store.counts_for_agent(a).await.unwrap();
    assert_eq!(active, 2);
    assert_eq!(h.store.waiting_queue(10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn admins_are_never_assignment_candidates() {
    let h = Harness::new();
    let admin = h.store.add_agent("Root", 10, true, true).await;
    let _admin_rx = h.connect_agent(admin).await;

    let (c1, mut c1_rx) = h.connect_customer("visitor-1").await;
    h.lifecycle
        .customer_message(c1.id, "hello", ContentKind::Text)
        .await
        .unwrap();

    assert!(frames(&mut c1_rx)
        .iter()
        .any(|f| matches!(f, ServerFrame::QueueNotice { .. })));
    let conv = h.store.open_conversation_for(c1.id).await.unwrap().unwrap();
    assert_eq!(conv.agent_id, None);
}
