//! Conversation lifecycle manager
//!
//! Stateless façade over the store and registry: opens, routes, closes and
//! transfers conversations, inserts system messages, and fans the results
//! out to every interested session. Holds no state of its own; every push
//! is best-effort and a failed send never rolls back a committed change.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use livedesk_shared::{
    Agent, AgentStatus, ContentKind, Conversation, ConversationStatus, SenderKind, TransferKind,
};

use crate::assignment::{load_score, AssignmentEngine};
use crate::registry::Registry;
use crate::store::{ConversationStore, NewTransfer, StoreError, StoreResult};
use crate::websocket::events::{ConversationSummary, CustomerSummary, MessagePayload, ServerFrame};

/// Typed failures of the transfer precondition chain, checked in order
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("conversation not found")]
    NotFound,
    #[error("conversation is closed")]
    Closed,
    #[error("conversation has no assigned agent")]
    NoCurrentAgent,
    #[error("same agent")]
    SameAgent,
    #[error("target agent not found")]
    TargetMissing,
    #[error("target agent disabled")]
    TargetDisabled,
    #[error("target offline")]
    TargetOffline,
    #[error("target full")]
    TargetFull,
    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => TransferError::NotFound,
            StoreError::Closed => TransferError::Closed,
            StoreError::AgentFull => TransferError::TargetFull,
            StoreError::NotActive => TransferError::NoCurrentAgent,
            StoreError::AlreadyAssigned => TransferError::SameAgent,
            StoreError::Database(msg) => TransferError::Store(msg),
        }
    }
}

/// Who is closing a conversation
#[derive(Debug, Clone, Copy)]
pub enum CloseActor {
    /// The assigned agent, over its own session
    Agent(Uuid),
    /// The external admin surface
    Admin,
}

pub struct Lifecycle {
    store: Arc<dyn ConversationStore>,
    registry: Arc<Registry>,
    engine: AssignmentEngine,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn ConversationStore>, registry: Arc<Registry>) -> Self {
        let engine = AssignmentEngine::new(Arc::clone(&registry), Arc::clone(&store));
        Self {
            store,
            registry,
            engine,
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // =========================================================================
    // Inbound messages
    // =========================================================================

    /// Customer sent a message: persist it, route it to the assigned agent
    /// or try to find one, and echo delivery back to the customer.
    pub async fn customer_message(
        &self,
        customer_id: Uuid,
        content: &str,
        content_kind: ContentKind,
    ) -> StoreResult<()> {
        let customer = self
            .store
            .customer(customer_id)
            .await?
            .ok_or(StoreError::NotFound)?;

        let (conversation, _created) = self.store.get_or_open_for(customer_id).await?;
        let message = self
            .store
            .append_message(
                conversation.id,
                SenderKind::Customer,
                Some(customer_id),
                content_kind,
                content,
                true,
            )
            .await?;

        if let Some(agent_id) = conversation.agent_id {
            self.push_to_agent(
                agent_id,
                ServerFrame::NewMessage {
                    conversation_id: conversation.id,
                    message: MessagePayload::from(&message),
                },
            )
            .await;
        } else {
            match self.engine.pick(&HashSet::new()).await {
                Some(candidate) => match self.store.assign(conversation.id, candidate).await {
                    Ok(()) => {
                        self.recompute_load(candidate).await;
                        self.announce_assignment(conversation.id, candidate, false, None)
                            .await;
                        // The agent sees the triggering message right after
                        // the assignment frame
                        self.push_to_agent(
                            candidate,
                            ServerFrame::NewMessage {
                                conversation_id: conversation.id,
                                message: MessagePayload::from(&message),
                            },
                        )
                        .await;
                    }
                    Err(e) => {
                        // Lost the capacity race; the customer queues
                        tracing::warn!(
                            conversation_id = %conversation.id,
                            candidate = %candidate,
                            error = %e,
                            "Assignment lost the race, conversation stays queued"
                        );
                        self.push_to_customer(
                            customer_id,
                            ServerFrame::QueueNotice {
                                conversation_id: conversation.id,
                            },
                        )
                        .await;
                    }
                },
                None => {
                    self.push_to_customer(
                        customer_id,
                        ServerFrame::QueueNotice {
                            conversation_id: conversation.id,
                        },
                    )
                    .await;
                }
            }
        }

        self.push_to_customer(
            customer.id,
            ServerFrame::MessageSent {
                conversation_id: conversation.id,
                message_id: message.id,
            },
        )
        .await;

        Ok(())
    }

    /// Agent replied in one of its conversations. Frames referencing a
    /// missing, closed or foreign conversation come from a malformed
    /// client and are dropped.
    pub async fn agent_message(
        &self,
        agent_id: Uuid,
        conversation_id: Uuid,
        content: &str,
        content_kind: ContentKind,
    ) -> StoreResult<()> {
        let Some(conversation) = self.store.conversation(conversation_id).await? else {
            tracing::debug!(conversation_id = %conversation_id, "Agent message for unknown conversation dropped");
            return Ok(());
        };
        if conversation.status == ConversationStatus::Closed
            || conversation.agent_id != Some(agent_id)
        {
            tracing::debug!(
                conversation_id = %conversation_id,
                agent_id = %agent_id,
                "Agent message for closed or foreign conversation dropped"
            );
            return Ok(());
        }

        let message = self
            .store
            .append_message(
                conversation_id,
                SenderKind::Agent,
                Some(agent_id),
                content_kind,
                content,
                true,
            )
            .await?;

        self.push_to_customer(
            conversation.customer_id,
            ServerFrame::NewMessage {
                conversation_id,
                message: MessagePayload::from(&message),
            },
        )
        .await;
        self.push_to_agent(
            agent_id,
            ServerFrame::MessageSent {
                conversation_id,
                message_id: message.id,
            },
        )
        .await;

        Ok(())
    }

    // =========================================================================
    // Typing and read receipts
    // =========================================================================

    /// Forward a typing indicator to the counterpart. No persistence.
    pub async fn typing_from_agent(
        &self,
        agent_id: Uuid,
        conversation_id: Uuid,
        typing: bool,
    ) -> StoreResult<()> {
        let Some(conversation) = self.store.conversation(conversation_id).await? else {
            return Ok(());
        };
        if conversation.agent_id != Some(agent_id) {
            return Ok(());
        }
        self.push_to_customer(
            conversation.customer_id,
            ServerFrame::Typing {
                conversation_id,
                typing,
            },
        )
        .await;
        Ok(())
    }

    pub async fn typing_from_customer(
        &self,
        customer_id: Uuid,
        conversation_id: Uuid,
        typing: bool,
    ) -> StoreResult<()> {
        let Some(conversation) = self.store.conversation(conversation_id).await? else {
            return Ok(());
        };
        if conversation.customer_id != customer_id {
            return Ok(());
        }
        if let Some(agent_id) = conversation.agent_id {
            self.push_to_agent(
                agent_id,
                ServerFrame::Typing {
                    conversation_id,
                    typing,
                },
            )
            .await;
        }
        Ok(())
    }

    /// Agent read the customer's messages; notify the customer.
    pub async fn mark_read_by_agent(
        &self,
        agent_id: Uuid,
        conversation_id: Uuid,
    ) -> StoreResult<()> {
        let Some(conversation) = self.store.conversation(conversation_id).await? else {
            return Ok(());
        };
        if conversation.agent_id != Some(agent_id) {
            return Ok(());
        }
        self.store.mark_read(conversation_id, SenderKind::Agent).await?;
        self.push_to_customer(
            conversation.customer_id,
            ServerFrame::MessagesRead {
                conversation_id,
                reader: SenderKind::Agent,
            },
        )
        .await;
        Ok(())
    }

    pub async fn mark_read_by_customer(
        &self,
        customer_id: Uuid,
        conversation_id: Uuid,
    ) -> StoreResult<()> {
        let Some(conversation) = self.store.conversation(conversation_id).await? else {
            return Ok(());
        };
        if conversation.customer_id != customer_id {
            return Ok(());
        }
        self.store
            .mark_read(conversation_id, SenderKind::Customer)
            .await?;
        if let Some(agent_id) = conversation.agent_id {
            self.push_to_agent(
                agent_id,
                ServerFrame::MessagesRead {
                    conversation_id,
                    reader: SenderKind::Customer,
                },
            )
            .await;
        }
        Ok(())
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Close a conversation. Only the assigned agent (or the admin
    /// surface) may close; a second close is a no-op. Freed capacity is
    /// immediately offered to the waiting queue.
    pub async fn close_conversation(
        &self,
        conversation_id: Uuid,
        actor: CloseActor,
    ) -> StoreResult<bool> {
        let Some(conversation) = self.store.conversation(conversation_id).await? else {
            return Err(StoreError::NotFound);
        };

        if let CloseActor::Agent(agent_id) = actor {
            if conversation.agent_id != Some(agent_id) {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    agent_id = %agent_id,
                    "Close of foreign conversation dropped"
                );
                return Ok(false);
            }
        }

        if conversation.status == ConversationStatus::Closed {
            return Ok(false);
        }

        self.store.close(conversation_id).await?;

        let closed = ServerFrame::ConversationClosed { conversation_id };
        self.push_to_customer(conversation.customer_id, closed.clone())
            .await;
        if let Some(agent_id) = conversation.agent_id {
            self.push_to_agent(agent_id, closed).await;
            self.recompute_load(agent_id).await;
            // Capacity just opened
            if let Err(e) = self.try_drain_waiting_for(agent_id).await {
                tracing::warn!(agent_id = %agent_id, error = %e, "Post-close drain failed");
            }
        }

        tracing::info!(conversation_id = %conversation_id, actor = ?actor, "Conversation closed");
        Ok(true)
    }

    // =========================================================================
    // Transfer
    // =========================================================================

    /// Move an ACTIVE conversation to another agent.
    ///
    /// Preconditions are checked in order and the first failure is
    /// returned as the typed error; after the store commits, every
    /// notification is best-effort and never rolls the transfer back.
    pub async fn transfer(
        &self,
        conversation_id: Uuid,
        target_agent_id: Uuid,
        kind: TransferKind,
        operator_id: Option<Uuid>,
        reason: &str,
    ) -> Result<(), TransferError> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .await
            .map_err(TransferError::from)?
            .ok_or(TransferError::NotFound)?;

        if conversation.status == ConversationStatus::Closed {
            return Err(TransferError::Closed);
        }
        let from_agent_id = conversation.agent_id.ok_or(TransferError::NoCurrentAgent)?;
        if from_agent_id == target_agent_id {
            return Err(TransferError::SameAgent);
        }

        let target = self
            .store
            .agent(target_agent_id)
            .await
            .map_err(TransferError::from)?
            .ok_or(TransferError::TargetMissing)?;
        if !target.enabled {
            return Err(TransferError::TargetDisabled);
        }
        if self.registry.agent_status(target_agent_id).await != AgentStatus::Online {
            return Err(TransferError::TargetOffline);
        }

        // Live capacity read; the reassign CAS below is the backstop
        let (active, _) = self
            .store
            .counts_for_agent(target_agent_id)
            .await
            .map_err(TransferError::from)?;
        if active >= target.capacity as i64 {
            return Err(TransferError::TargetFull);
        }

        self.store
            .reassign(conversation_id, target_agent_id)
            .await?;

        let from_name = match self.store.agent(from_agent_id).await {
            Ok(Some(agent)) => agent.display_name,
            _ => "unknown".to_string(),
        };

        self.store
            .append_transfer(NewTransfer {
                conversation_id,
                from_agent_id,
                to_agent_id: target_agent_id,
                kind,
                operator_id,
                reason: reason.to_string(),
            })
            .await?;

        // Fresh unread badge for the receiving agent
        self.store.mark_all_unread(conversation_id).await?;

        self.store
            .append_message(
                conversation_id,
                SenderKind::System,
                None,
                ContentKind::Text,
                &format!(
                    "conversation transferred from {} to {} ({})",
                    from_name,
                    target.display_name,
                    kind.as_str()
                ),
                false,
            )
            .await?;

        self.recompute_load(from_agent_id).await;
        self.recompute_load(target_agent_id).await;

        // Fan-out: losing agent, receiving agent, customer
        self.push_to_agent(
            from_agent_id,
            ServerFrame::ConversationTransferredOut {
                conversation_id,
                to_agent_id: target_agent_id,
                to_agent_name: target.display_name.clone(),
                kind,
                reason: reason.to_string(),
            },
        )
        .await;
        self.announce_assignment(conversation_id, target_agent_id, true, Some(from_agent_id))
            .await;
        self.push_to_customer(
            conversation.customer_id,
            ServerFrame::AgentChanged {
                conversation_id,
                agent_name: target.display_name.clone(),
                message: format!(
                    "your conversation has been handed over to {}",
                    target.display_name
                ),
            },
        )
        .await;

        tracing::info!(
            conversation_id = %conversation_id,
            from_agent = %from_agent_id,
            to_agent = %target_agent_id,
            kind = kind.as_str(),
            "Conversation transferred"
        );
        Ok(())
    }

    // =========================================================================
    // Queue drainage and offline handoff
    // =========================================================================

    /// Assign waiting conversations to one agent up to its free capacity.
    /// Returns how many were assigned.
    pub async fn try_drain_waiting_for(&self, agent_id: Uuid) -> StoreResult<u64> {
        if self.registry.agent_status(agent_id).await != AgentStatus::Online
            || !self.registry.is_alive(agent_id).await
        {
            return Ok(0);
        }
        let Some(agent) = self.store.agent(agent_id).await? else {
            return Ok(0);
        };
        if !agent.enabled || agent.is_admin {
            return Ok(0);
        }

        let (active, _) = self.store.counts_for_agent(agent_id).await?;
        let free_slots = agent.capacity as i64 - active;
        if free_slots <= 0 {
            return Ok(0);
        }

        let mut assigned = 0;
        for conversation in self.store.waiting_queue(free_slots).await? {
            // Monotone re-check guards against intra-loop saturation
            let (active, _) = self.store.counts_for_agent(agent_id).await?;
            if active >= agent.capacity as i64 {
                break;
            }
            match self.store.assign(conversation.id, agent_id).await {
                Ok(()) => {
                    assigned += 1;
                    self.announce_assignment(conversation.id, agent_id, false, None)
                        .await;
                }
                Err(StoreError::AgentFull) => break,
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %conversation.id,
                        agent_id = %agent_id,
                        error = %e,
                        "Queue drain skipped a conversation"
                    );
                }
            }
        }

        if assigned > 0 {
            self.recompute_load(agent_id).await;
            tracing::info!(agent_id = %agent_id, assigned = assigned, "Drained waiting queue");
        }
        Ok(assigned)
    }

    /// An agent dropped offline while holding ACTIVE conversations: hand
    /// each to a fresh candidate, or put it back in the queue when nobody
    /// can take it. Returns (transferred, reverted).
    pub async fn handle_agent_offline(&self, agent_id: Uuid) -> StoreResult<(u64, u64)> {
        let mut transferred = 0;
        let mut reverted = 0;

        for conversation in self.store.active_for_agent(agent_id).await? {
            let candidate = self.engine.pick(&HashSet::new()).await;
            let handed_over = match candidate {
                Some(target) => {
                    match self
                        .transfer(
                            conversation.id,
                            target,
                            TransferKind::AutoAgentOffline,
                            None,
                            "agent went offline",
                        )
                        .await
                    {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!(
                                conversation_id = %conversation.id,
                                target = %target,
                                error = %e,
                                "Offline handoff failed, reverting to queue"
                            );
                            false
                        }
                    }
                }
                None => false,
            };

            if handed_over {
                transferred += 1;
            } else {
                match self.store.revert_to_waiting(conversation.id).await {
                    Ok(()) => reverted += 1,
                    Err(e) => {
                        tracing::warn!(
                            conversation_id = %conversation.id,
                            error = %e,
                            "Failed to revert conversation to waiting"
                        );
                    }
                }
            }
        }

        Ok((transferred, reverted))
    }

    // =========================================================================
    // Presence
    // =========================================================================

    /// Agent asked for a presence change over its session
    pub async fn agent_status_change(&self, agent_id: Uuid, status: AgentStatus) {
        let load = match load_score(self.store.as_ref(), agent_id).await {
            Ok(score) => score,
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, error = %e, "Load recompute failed, using zero");
                0.0
            }
        };
        self.registry.set_status(agent_id, status, load).await;
    }

    /// Current load score for an agent (bind-time seed)
    pub async fn current_load(&self, agent_id: Uuid) -> f64 {
        load_score(self.store.as_ref(), agent_id).await.unwrap_or(0.0)
    }

    /// Assignment candidate outside the exclusion set, if any
    pub async fn pick_candidate(&self, exclude: &HashSet<Uuid>) -> Option<Uuid> {
        self.engine.pick(exclude).await
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    async fn recompute_load(&self, agent_id: Uuid) {
        match load_score(self.store.as_ref(), agent_id).await {
            Ok(score) => self.registry.update_load(agent_id, score).await,
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, error = %e, "Load recompute failed");
            }
        }
    }

    /// Push `conversation_assigned` to the agent and `agent_assigned` to
    /// the customer. Transfers carry the full history (system message
    /// included) and the unread badge.
    async fn announce_assignment(
        &self,
        conversation_id: Uuid,
        agent_id: Uuid,
        is_transfer: bool,
        from_agent_id: Option<Uuid>,
    ) {
        let (conversation, customer, agent) =
            match self.assignment_context(conversation_id, agent_id).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        error = %e,
                        "Could not build assignment notification"
                    );
                    return;
                }
            };

        let messages = if is_transfer {
            match self.store.messages(conversation_id).await {
                Ok(messages) => messages.iter().map(MessagePayload::from).collect(),
                Err(e) => {
                    tracing::warn!(conversation_id = %conversation_id, error = %e, "History fetch failed");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        let unread_count = self
            .store
            .unread_count(conversation_id, SenderKind::Customer)
            .await
            .unwrap_or(0);

        self.push_to_agent(
            agent_id,
            ServerFrame::ConversationAssigned {
                conversation: ConversationSummary::from(&conversation),
                customer: CustomerSummary::from(&customer),
                messages,
                unread_count,
                is_transfer,
                from_agent_id,
            },
        )
        .await;
        self.push_to_customer(
            customer.id,
            ServerFrame::AgentAssigned {
                conversation_id,
                agent_id,
                agent_name: agent.display_name,
            },
        )
        .await;
    }

    async fn assignment_context(
        &self,
        conversation_id: Uuid,
        agent_id: Uuid,
    ) -> StoreResult<(Conversation, livedesk_shared::Customer, Agent)> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .await?
            .ok_or(StoreError::NotFound)?;
        let customer = self
            .store
            .customer(conversation.customer_id)
            .await?
            .ok_or(StoreError::NotFound)?;
        let agent = self
            .store
            .agent(agent_id)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok((conversation, customer, agent))
    }

    async fn push_to_agent(&self, agent_id: Uuid, frame: ServerFrame) {
        if let Some(session) = self.registry.lookup_agent_session(agent_id).await {
            if !session.send(frame) {
                tracing::debug!(agent_id = %agent_id, "Push to agent session failed (closed)");
            }
        }
    }

    async fn push_to_customer(&self, customer_id: Uuid, frame: ServerFrame) {
        if let Some(session) = self.registry.lookup_customer_session(customer_id).await {
            if !session.send(frame) {
                tracing::debug!(customer_id = %customer_id, "Push to customer session failed (closed)");
            }
        }
    }
}
