//! In-memory implementation of the conversation store
//!
//! Mirrors the PostgreSQL adapter's semantics (CAS transitions, capacity
//! guard, idempotent close, unique open conversation per customer) behind
//! one mutex. Backs the dispatch scenario tests.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use livedesk_shared::{
    Agent, ContentKind, Conversation, ConversationStatus, Customer, CustomerProfile, Message,
    SenderKind, TransferRecord,
};

use super::{ConversationStore, NewTransfer, StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    agents: HashMap<Uuid, Agent>,
    customers: Vec<Customer>,
    /// Insertion order doubles as creation order for queue draining
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    transfers: Vec<TransferRecord>,
    next_message_id: i64,
    next_transfer_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an agent record (the admin surface's job in production)
    pub async fn add_agent(
        &self,
        display_name: &str,
        capacity: i32,
        enabled: bool,
        is_admin: bool,
    ) -> Uuid {
        let agent = Agent {
            id: Uuid::new_v4(),
            display_name: display_name.to_string(),
            credential_hash: String::new(),
            capacity,
            enabled,
            is_admin,
            created_at: OffsetDateTime::now_utc(),
        };
        let id = agent.id;
        self.inner.lock().await.agents.insert(id, agent);
        id
    }
}

impl Inner {
    fn conversation_mut(&mut self, id: Uuid) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    fn non_closed_count(&self, agent_id: Uuid, excluding: Option<Uuid>) -> i64 {
        self.conversations
            .iter()
            .filter(|c| {
                c.agent_id == Some(agent_id)
                    && c.status != ConversationStatus::Closed
                    && Some(c.id) != excluding
            })
            .count() as i64
    }

    fn has_capacity(&self, agent_id: Uuid, excluding: Option<Uuid>) -> bool {
        match self.agents.get(&agent_id) {
            Some(agent) => self.non_closed_count(agent_id, excluding) < agent.capacity as i64,
            None => false,
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn agent(&self, id: Uuid) -> StoreResult<Option<Agent>> {
        Ok(self.inner.lock().await.agents.get(&id).cloned())
    }

    async fn get_or_create_customer(
        &self,
        external_id: &str,
        profile: CustomerProfile,
    ) -> StoreResult<Customer> {
        let mut inner = self.inner.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(existing) = inner
            .customers
            .iter_mut()
            .find(|c| c.external_id == external_id)
        {
            existing.last_seen_at = now;
            return Ok(existing.clone());
        }

        let customer = Customer {
            id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            address: profile.address,
            user_agent: profile.user_agent,
            locale: profile.locale,
            source_page: profile.source_page,
            created_at: now,
            last_seen_at: now,
        };
        inner.customers.push(customer.clone());
        Ok(customer)
    }

    async fn customer(&self, id: Uuid) -> StoreResult<Option<Customer>> {
        Ok(self
            .inner
            .lock()
            .await
            .customers
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn get_or_open_for(&self, customer_id: Uuid) -> StoreResult<(Conversation, bool)> {
        let mut inner = self.inner.lock().await;

        if let Some(open) = inner
            .conversations
            .iter()
            .find(|c| c.customer_id == customer_id && c.status != ConversationStatus::Closed)
        {
            return Ok((open.clone(), false));
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            customer_id,
            agent_id: None,
            status: ConversationStatus::Waiting,
            last_message_at: None,
            last_agent_reply_at: None,
            last_customer_message_at: None,
            closed_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        inner.conversations.push(conversation.clone());
        Ok((conversation, true))
    }

    async fn open_conversation_for(
        &self,
        customer_id: Uuid,
    ) -> StoreResult<Option<Conversation>> {
        Ok(self
            .inner
            .lock()
            .await
            .conversations
            .iter()
            .find(|c| c.customer_id == customer_id && c.status != ConversationStatus::Closed)
            .cloned())
    }

    async fn conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        Ok(self
            .inner
            .lock()
            .await
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn assign(&self, conversation_id: Uuid, agent_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;

        let conv = inner
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned()
            .ok_or(StoreError::NotFound)?;

        match conv.status {
            ConversationStatus::Closed => return Err(StoreError::Closed),
            ConversationStatus::Active if conv.agent_id == Some(agent_id) => return Ok(()),
            ConversationStatus::Active => return Err(StoreError::AlreadyAssigned),
            ConversationStatus::Waiting => {}
        }

        if !inner.has_capacity(agent_id, Some(conversation_id)) {
            return Err(StoreError::AgentFull);
        }

        let conv = inner.conversation_mut(conversation_id).unwrap();
        conv.status = ConversationStatus::Active;
        conv.agent_id = Some(agent_id);
        Ok(())
    }

    async fn reassign(&self, conversation_id: Uuid, agent_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;

        let conv = inner
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned()
            .ok_or(StoreError::NotFound)?;

        match conv.status {
            ConversationStatus::Closed => return Err(StoreError::Closed),
            ConversationStatus::Waiting => return Err(StoreError::NotActive),
            ConversationStatus::Active if conv.agent_id == Some(agent_id) => {
                return Err(StoreError::AlreadyAssigned)
            }
            ConversationStatus::Active => {}
        }

        if !inner.has_capacity(agent_id, Some(conversation_id)) {
            return Err(StoreError::AgentFull);
        }

        let conv = inner.conversation_mut(conversation_id).unwrap();
        conv.agent_id = Some(agent_id);
        Ok(())
    }

    async fn revert_to_waiting(&self, conversation_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let conv = inner
            .conversation_mut(conversation_id)
            .ok_or(StoreError::NotFound)?;
        if conv.status != ConversationStatus::Active {
            return Err(StoreError::NotActive);
        }
        conv.status = ConversationStatus::Waiting;
        conv.agent_id = None;
        Ok(())
    }

    async fn close(&self, conversation_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let conv = inner
            .conversation_mut(conversation_id)
            .ok_or(StoreError::NotFound)?;
        if conv.status != ConversationStatus::Closed {
            conv.status = ConversationStatus::Closed;
            conv.closed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn counts_for_agent(&self, agent_id: Uuid) -> StoreResult<(i64, i64)> {
        let inner = self.inner.lock().await;
        let active = inner
            .conversations
            .iter()
            .filter(|c| c.agent_id == Some(agent_id) && c.status == ConversationStatus::Active)
            .count() as i64;
        let waiting = inner
            .conversations
            .iter()
            .filter(|c| c.agent_id == Some(agent_id) && c.status == ConversationStatus::Waiting)
            .count() as i64;
        Ok((active, waiting))
    }

    async fn active_for_agent(&self, agent_id: Uuid) -> StoreResult<Vec<Conversation>> {
        Ok(self
            .inner
            .lock()
            .await
            .conversations
            .iter()
            .filter(|c| c.agent_id == Some(agent_id) && c.status == ConversationStatus::Active)
            .cloned()
            .collect())
    }

    async fn waiting_queue(&self, limit: i64) -> StoreResult<Vec<Conversation>> {
        Ok(self
            .inner
            .lock()
            .await
            .conversations
            .iter()
            .filter(|c| c.status == ConversationStatus::Waiting && c.agent_id.is_none())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn recent_conversations(&self, limit: i64) -> StoreResult<Vec<Conversation>> {
        Ok(self
            .inner
            .lock()
            .await
            .conversations
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn timeout_candidates(&self, cutoff: OffsetDateTime) -> StoreResult<Vec<Conversation>> {
        Ok(self
            .inner
            .lock()
            .await
            .conversations
            .iter()
            .filter(|c| {
                c.status == ConversationStatus::Active
                    && c.agent_id.is_some()
                    && c.last_customer_message_at
                        .map(|t| t <= cutoff)
                        .unwrap_or(false)
                    && match (c.last_agent_reply_at, c.last_customer_message_at) {
                        (None, _) => true,
                        (Some(reply), Some(msg)) => reply < msg,
                        (Some(_), None) => false,
                    }
            })
            .cloned()
            .collect())
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_kind: SenderKind,
        sender_id: Option<Uuid>,
        content_kind: ContentKind,
        body: &str,
        visible_to_customer: bool,
    ) -> StoreResult<Message> {
        let mut inner = self.inner.lock().await;
        let now = OffsetDateTime::now_utc();

        inner.next_message_id += 1;
        let message = Message {
            id: inner.next_message_id,
            conversation_id,
            sender_kind,
            sender_id,
            content_kind,
            body: body.to_string(),
            read: false,
            visible_to_customer,
            created_at: now,
        };

        let conv = inner
            .conversation_mut(conversation_id)
            .ok_or(StoreError::NotFound)?;
        conv.last_message_at = Some(conv.last_message_at.map_or(now, |t| t.max(now)));
        match sender_kind {
            SenderKind::Customer => {
                conv.last_customer_message_at =
                    Some(conv.last_customer_message_at.map_or(now, |t| t.max(now)));
            }
            SenderKind::Agent => {
                conv.last_agent_reply_at =
                    Some(conv.last_agent_reply_at.map_or(now, |t| t.max(now)));
            }
            SenderKind::System => {}
        }

        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn messages(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>> {
        Ok(self
            .inner
            .lock()
            .await
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn unread_messages(
        &self,
        conversation_id: Uuid,
        from: SenderKind,
    ) -> StoreResult<Vec<Message>> {
        Ok(self
            .inner
            .lock()
            .await
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id && m.sender_kind == from && !m.read)
            .cloned()
            .collect())
    }

    async fn unread_count(&self, conversation_id: Uuid, from: SenderKind) -> StoreResult<i64> {
        Ok(self.unread_messages(conversation_id, from).await?.len() as i64)
    }

    async fn mark_read(&self, conversation_id: Uuid, reader: SenderKind) -> StoreResult<u64> {
        let Some(counterpart) = reader.counterpart() else {
            return Ok(0);
        };
        let mut inner = self.inner.lock().await;
        let mut flipped = 0;
        for m in inner
            .messages
            .iter_mut()
            .filter(|m| m.conversation_id == conversation_id && m.sender_kind == counterpart)
        {
            if !m.read {
                m.read = true;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn mark_all_unread(&self, conversation_id: Uuid) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let mut flipped = 0;
        for m in inner
            .messages
            .iter_mut()
            .filter(|m| m.conversation_id == conversation_id)
        {
            if m.read {
                m.read = false;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn append_transfer(&self, transfer: NewTransfer) -> StoreResult<TransferRecord> {
        let mut inner = self.inner.lock().await;
        inner.next_transfer_id += 1;
        let record = TransferRecord {
            id: inner.next_transfer_id,
            conversation_id: transfer.conversation_id,
            from_agent_id: transfer.from_agent_id,
            to_agent_id: transfer.to_agent_id,
            kind: transfer.kind,
            operator_id: transfer.operator_id,
            reason: transfer.reason,
            created_at: OffsetDateTime::now_utc(),
        };
        inner.transfers.push(record.clone());
        Ok(record)
    }

    async fn transfers(&self, conversation_id: Uuid) -> StoreResult<Vec<TransferRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .transfers
            .iter()
            .filter(|t| t.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livedesk_shared::TransferKind;

    #[tokio::test]
    async fn test_one_open_conversation_per_customer() {
        let store = MemoryStore::new();
        let customer = store
            .get_or_create_customer("visitor-1", Default::default())
            .await
            .unwrap();

        let (first, created) = store.get_or_open_for(customer.id).await.unwrap();
        assert!(created);
        let (second, created) = store.get_or_open_for(customer.id).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        store.close(first.id).await.unwrap();
        // Idempotent second close
        store.close(first.id).await.unwrap();

        let (third, created) = store.get_or_open_for(customer.id).await.unwrap();
        assert!(created);
        assert_ne!(third.id, first.id);
    }

    #[tokio::test]
    async fn test_assign_capacity_and_idempotence() {
        let store = MemoryStore::new();
        let agent = store.add_agent("Ann", 1, true, false).await;

        let c1 = store
            .get_or_create_customer("v1", Default::default())
            .await
            .unwrap();
        let c2 = store
            .get_or_create_customer("v2", Default::default())
            .await
            .unwrap();
        let (conv1, _) = store.get_or_open_for(c1.id).await.unwrap();
        let (conv2, _) = store.get_or_open_for(c2.id).await.unwrap();

        store.assign(conv1.id, agent).await.unwrap();
        store.assign(conv1.id, agent).await.unwrap(); // idempotent
        assert!(matches!(
            store.assign(conv2.id, agent).await,
            Err(StoreError::AgentFull)
        ));

        let other = store.add_agent("Bob", 1, true, false).await;
        assert!(matches!(
            store.assign(conv1.id, other).await,
            Err(StoreError::AlreadyAssigned)
        ));
    }

    #[tokio::test]
    async fn test_message_timestamps_advance() {
        let store = MemoryStore::new();
        let agent = store.add_agent("Ann", 5, true, false).await;
        let customer = store
            .get_or_create_customer("v1", Default::default())
            .await
            .unwrap();
        let (conv, _) = store.get_or_open_for(customer.id).await.unwrap();
        store.assign(conv.id, agent).await.unwrap();

        let m1 = store
            .append_message(conv.id, SenderKind::Customer, Some(customer.id), ContentKind::Text, "hi", true)
            .await
            .unwrap();
        let m2 = store
            .append_message(conv.id, SenderKind::Agent, Some(agent), ContentKind::Text, "hello", true)
            .await
            .unwrap();
        assert!(m2.id > m1.id);

        let conv = store.conversation(conv.id).await.unwrap().unwrap();
        let last_customer = conv.last_customer_message_at.unwrap();
        let last_agent = conv.last_agent_reply_at.unwrap();
        assert!(conv.last_message_at.unwrap() >= last_customer);
        assert!(last_agent >= last_customer);
        // Every message predates or matches the conversation's last-message stamp
        assert!(m2.created_at <= conv.last_message_at.unwrap());
    }

    #[tokio::test]
    async fn test_mark_read_and_reset() {
        let store = MemoryStore::new();
        let customer = store
            .get_or_create_customer("v1", Default::default())
            .await
            .unwrap();
        let (conv, _) = store.get_or_open_for(customer.id).await.unwrap();

        store
            .append_message(conv.id, SenderKind::Customer, Some(customer.id), ContentKind::Text, "a", true)
            .await
            .unwrap();
        store
            .append_message(conv.id, SenderKind::Customer, Some(customer.id), ContentKind::Text, "b", true)
            .await
            .unwrap();

        assert_eq!(store.unread_count(conv.id, SenderKind::Customer).await.unwrap(), 2);
        assert_eq!(store.mark_read(conv.id, SenderKind::Agent).await.unwrap(), 2);
        assert_eq!(store.unread_count(conv.id, SenderKind::Customer).await.unwrap(), 0);

        assert_eq!(store.mark_all_unread(conv.id).await.unwrap(), 2);
        assert_eq!(store.unread_count(conv.id, SenderKind::Customer).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_transfer_log_is_append_only() {
        let store = MemoryStore::new();
        let a = store.add_agent("Ann", 5, true, false).await;
        let b = store.add_agent("Bob", 5, true, false).await;
        let customer = store
            .get_or_create_customer("v1", Default::default())
            .await
            .unwrap();
        let (conv, _) = store.get_or_open_for(customer.id).await.unwrap();

        store
            .append_transfer(NewTransfer {
                conversation_id: conv.id,
                from_agent_id: a,
                to_agent_id: b,
                kind: TransferKind::AutoTimeout,
                operator_id: None,
                reason: "customer unanswered 2 minutes".to_string(),
            })
            .await
            .unwrap();

        let log = store.transfers(conv.id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, TransferKind::AutoTimeout);
        assert_eq!(log[0].operator_id, None);
    }
}
