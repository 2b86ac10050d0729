//! PostgreSQL implementation of the conversation store

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use livedesk_shared::{
    Agent, ContentKind, Conversation, ConversationStatus, Customer, CustomerProfile, Message,
    SenderKind, TransferKind, TransferRecord,
};

use super::{ConversationStore, NewTransfer, StoreError, StoreResult};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const CONVERSATION_COLUMNS: &str = "id, customer_id, agent_id, status, last_message_at, \
     last_agent_reply_at, last_customer_message_at, closed_at, created_at";

#[async_trait]
impl ConversationStore for PgStore {
    async fn agent(&self, id: Uuid) -> StoreResult<Option<Agent>> {
        let row: Option<AgentRow> = sqlx::query_as(
            "SELECT id, display_name, credential_hash, capacity, enabled, is_admin, created_at
             FROM agents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Agent::from))
    }

    async fn get_or_create_customer(
        &self,
        external_id: &str,
        profile: CustomerProfile,
    ) -> StoreResult<Customer> {
        // Descriptive fields are captured at first sight only; reconnects
        // just refresh the activity stamp.
        let row: CustomerRow = sqlx::query_as(
            r#"
            INSERT INTO customers (external_id, address, user_agent, locale, source_page)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (external_id) DO UPDATE SET last_seen_at = NOW()
            RETURNING id, external_id, address, user_agent, locale, source_page,
                      created_at, last_seen_at
            "#,
        )
        .bind(external_id)
        .bind(&profile.address)
        .bind(&profile.user_agent)
        .bind(&profile.locale)
        .bind(&profile.source_page)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn customer(&self, id: Uuid) -> StoreResult<Option<Customer>> {
        let row: Option<CustomerRow> = sqlx::query_as(
            "SELECT id, external_id, address, user_agent, locale, source_page,
                    created_at, last_seen_at
             FROM customers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Customer::from))
    }

    async fn get_or_open_for(&self, customer_id: Uuid) -> StoreResult<(Conversation, bool)> {
        let query = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE customer_id = $1 AND status <> 2"
        );
        if let Some(row) = sqlx::query_as::<_, ConversationRow>(&query)
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok((row.try_into()?, false));
        }

        // The partial unique index settles concurrent opens; the loser's
        // insert returns no row and re-reads the winner's.
        let insert = format!(
            "INSERT INTO conversations (customer_id, status) VALUES ($1, 0)
             ON CONFLICT (customer_id) WHERE status <> 2 DO NOTHING
             RETURNING {CONVERSATION_COLUMNS}"
        );
        if let Some(row) = sqlx::query_as::<_, ConversationRow>(&insert)
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok((row.try_into()?, true));
        }

        let row = sqlx::query_as::<_, ConversationRow>(&query)
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                StoreError::Database("open conversation vanished during race".to_string())
            })?;
        Ok((row.try_into()?, false))
    }

    async fn open_conversation_for(
        &self,
        customer_id: Uuid,
    ) -> StoreResult<Option<Conversation>> {
        let query = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE customer_id = $1 AND status <> 2"
        );
        let row: Option<ConversationRow> = sqlx::query_as(&query)
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Conversation::try_from).transpose()
    }

    async fn conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        let query =
            format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1");
        let row: Option<ConversationRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Conversation::try_from).transpose()
    }

    async fn assign(&self, conversation_id: Uuid, agent_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET status = 1, agent_id = $2
            WHERE id = $1
              AND (status = 0 OR (status = 1 AND agent_id = $2))
              AND (SELECT COUNT(*) FROM conversations c
                     WHERE c.agent_id = $2 AND c.status <> 2 AND c.id <> $1)
                  < (SELECT capacity FROM agents WHERE id = $2)
            "#,
        )
        .bind(conversation_id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        Err(self.diagnose_assign(conversation_id, agent_id).await?)
    }

    async fn reassign(&self, conversation_id: Uuid, agent_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET agent_id = $2
            WHERE id = $1 AND status = 1 AND agent_id IS NOT NULL AND agent_id <> $2
              AND (SELECT COUNT(*) FROM conversations c
                     WHERE c.agent_id = $2 AND c.status <> 2)
                  < (SELECT capacity FROM agents WHERE id = $2)
            "#,
        )
        .bind(conversation_id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        Err(self.diagnose_assign(conversation_id, agent_id).await?)
    }

    async fn revert_to_waiting(&self, conversation_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE conversations SET status = 0, agent_id = NULL
             WHERE id = $1 AND status = 1",
        )
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.conversation(conversation_id).await? {
            None => Err(StoreError::NotFound),
            Some(_) => Err(StoreError::NotActive),
        }
    }

    async fn close(&self, conversation_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE conversations SET status = 2, closed_at = NOW()
             WHERE id = $1 AND status <> 2",
        )
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        // Second close of the same conversation is a no-op
        match self.conversation(conversation_id).await? {
            None => Err(StoreError::NotFound),
            Some(_) => Ok(()),
        }
    }

    async fn counts_for_agent(&self, agent_id: Uuid) -> StoreResult<(i64, i64)> {
        let (active, waiting): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*) FILTER (WHERE status = 1),
                    COUNT(*) FILTER (WHERE status = 0)
             FROM conversations WHERE agent_id = $1",
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((active, waiting))
    }

    async fn active_for_agent(&self, agent_id: Uuid) -> StoreResult<Vec<Conversation>> {
        let query = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE agent_id = $1 AND status = 1 ORDER BY created_at"
        );
        let rows: Vec<ConversationRow> = sqlx::query_as(&query)
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Conversation::try_from).collect()
    }

    async fn waiting_queue(&self, limit: i64) -> StoreResult<Vec<Conversation>> {
        let query = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE status = 0 AND agent_id IS NULL
             ORDER BY created_at ASC LIMIT $1"
        );
        let rows: Vec<ConversationRow> = sqlx::query_as(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Conversation::try_from).collect()
    }

    async fn recent_conversations(&self, limit: i64) -> StoreResult<Vec<Conversation>> {
        let query = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             ORDER BY created_at DESC LIMIT $1"
        );
        let rows: Vec<ConversationRow> = sqlx::query_as(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Conversation::try_from).collect()
    }

    async fn timeout_candidates(&self, cutoff: OffsetDateTime) -> StoreResult<Vec<Conversation>> {
        let query = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE status = 1
               AND agent_id IS NOT NULL
               AND last_customer_message_at IS NOT NULL
               AND last_customer_message_at <= $1
               AND (last_agent_reply_at IS NULL
                    OR last_agent_reply_at < last_customer_message_at)
             ORDER BY last_customer_message_at ASC"
        );
        let rows: Vec<ConversationRow> = sqlx::query_as(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Conversation::try_from).collect()
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
        let row: MessageRow = sqlx::query_as(
            r#"
            INSERT INTO messages (conversation_id, sender_kind, sender_id, content_kind,
                                  body, visible_to_customer)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, conversation_id, sender_kind, sender_id, content_kind, body,
                      read, visible_to_customer, created_at
            "#,
        )
        .bind(conversation_id)
        .bind(sender_kind.as_i16())
        .bind(sender_id)
        .bind(content_kind.as_i16())
        .bind(body)
        .bind(visible_to_customer)
        .fetch_one(&self.pool)
        .await?;

        // Per-kind timestamps only ever advance
        let stamp_column = match sender_kind {
            SenderKind::Customer => Some("last_customer_message_at"),
            SenderKind::Agent => Some("last_agent_reply_at"),
            SenderKind::System => None,
        };
        let update = match stamp_column {
            Some(col) => format!(
                "UPDATE conversations
                 SET last_message_at = GREATEST(COALESCE(last_message_at, $2), $2),
                     {col} = GREATEST(COALESCE({col}, $2), $2)
                 WHERE id = $1"
            ),
            None => "UPDATE conversations
                     SET last_message_at = GREATEST(COALESCE(last_message_at, $2), $2)
                     WHERE id = $1"
                .to_string(),
        };
        sqlx::query(&update)
            .bind(conversation_id)
            .bind(row.created_at)
            .execute(&self.pool)
            .await?;

        row.try_into()
    }

    async fn messages(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, conversation_id, sender_kind, sender_id, content_kind, body,
                    read, visible_to_customer, created_at
             FROM messages WHERE conversation_id = $1 ORDER BY id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Message::try_from).collect()
    }

    async fn unread_messages(
        &self,
        conversation_id: Uuid,
        from: SenderKind,
    ) -> StoreResult<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, conversation_id, sender_kind, sender_id, content_kind, body,
                    read, visible_to_customer, created_at
             FROM messages
             WHERE conversation_id = $1 AND sender_kind = $2 AND read = FALSE
             ORDER BY id ASC",
        )
        .bind(conversation_id)
        .bind(from.as_i16())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Message::try_from).collect()
    }

    async fn unread_count(&self, conversation_id: Uuid, from: SenderKind) -> StoreResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = $1 AND sender_kind = $2 AND read = FALSE",
        )
        .bind(conversation_id)
        .bind(from.as_i16())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn mark_read(&self, conversation_id: Uuid, reader: SenderKind) -> StoreResult<u64> {
        let Some(counterpart) = reader.counterpart() else {
            return Ok(0);
        };

        let result = sqlx::query(
            "UPDATE messages SET read = TRUE
             WHERE conversation_id = $1 AND sender_kind = $2 AND read = FALSE",
        )
        .bind(conversation_id)
        .bind(counterpart.as_i16())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_all_unread(&self, conversation_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE messages SET read = FALSE WHERE conversation_id = $1 AND read = TRUE",
        )
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn append_transfer(&self, transfer: NewTransfer) -> StoreResult<TransferRecord> {
        let row: TransferRow = sqlx::query_as(
            r#"
            INSERT INTO conversation_transfers
                (conversation_id, from_agent_id, to_agent_id, kind, operator_id, reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, conversation_id, from_agent_id, to_agent_id, kind,
                      operator_id, reason, created_at
            "#,
        )
        .bind(transfer.conversation_id)
        .bind(transfer.from_agent_id)
        .bind(transfer.to_agent_id)
        .bind(transfer.kind.as_i16())
        .bind(transfer.operator_id)
        .bind(&transfer.reason)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn transfers(&self, conversation_id: Uuid) -> StoreResult<Vec<TransferRecord>> {
        let rows: Vec<TransferRow> = sqlx::query_as(
            "SELECT id, conversation_id, from_agent_id, to_agent_id, kind,
                    operator_id, reason, created_at
             FROM conversation_transfers WHERE conversation_id = $1 ORDER BY id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransferRecord::try_from).collect()
    }
}

impl PgStore {
    /// Work out why a conditional assign/reassign matched no row
    async fn diagnose_assign(
        &self,
        conversation_id: Uuid,
        agent_id: Uuid,
    ) -> Result<StoreError, StoreError> {
        let conv = match self.conversation(conversation_id).await? {
            Some(c) => c,
            None => return Ok(StoreError::NotFound),
        };
        Ok(match conv.status {
            ConversationStatus::Closed => StoreError::Closed,
            ConversationStatus::Active if conv.agent_id != Some(agent_id) => {
                StoreError::AlreadyAssigned
            }
            ConversationStatus::Waiting | ConversationStatus::Active => StoreError::AgentFull,
        })
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(Debug, FromRow)]
struct AgentRow {
    id: Uuid,
    display_name: String,
    credential_hash: String,
    capacity: i32,
    enabled: bool,
    is_admin: bool,
    created_at: OffsetDateTime,
}

impl From<AgentRow> for Agent {
    fn from(row: AgentRow) -> Self {
        Agent {
            id: row.id,
            display_name: row.display_name,
            credential_hash: row.credential_hash,
            capacity: row.capacity,
            enabled: row.enabled,
            is_admin: row.is_admin,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct CustomerRow {
    id: Uuid,
    external_id: String,
    address: Option<String>,
    user_agent: Option<String>,
    locale: Option<String>,
    source_page: Option<String>,
    created_at: OffsetDateTime,
    last_seen_at: OffsetDateTime,
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        Customer {
            id: row.id,
            external_id: row.external_id,
            address: row.address,
            user_agent: row.user_agent,
            locale: row.locale,
            source_page: row.source_page,
            created_at: row.created_at,
            last_seen_at: row.last_seen_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: Uuid,
    customer_id: Uuid,
    agent_id: Option<Uuid>,
    status: i16,
    last_message_at: Option<OffsetDateTime>,
    last_agent_reply_at: Option<OffsetDateTime>,
    last_customer_message_at: Option<OffsetDateTime>,
    closed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = StoreError;

    fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
        let status = ConversationStatus::from_i16(row.status).ok_or_else(|| {
            StoreError::Database(format!("invalid conversation status: {}", row.status))
        })?;
        Ok(Conversation {
            id: row.id,
            customer_id: row.customer_id,
            agent_id: row.agent_id,
            status,
            last_message_at: row.last_message_at,
            last_agent_reply_at: row.last_agent_reply_at,
            last_customer_message_at: row.last_customer_message_at,
            closed_at: row.closed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    conversation_id: Uuid,
    sender_kind: i16,
    sender_id: Option<Uuid>,
    content_kind: i16,
    body: String,
    read: bool,
    visible_to_customer: bool,
    created_at: OffsetDateTime,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let sender_kind = SenderKind::from_i16(row.sender_kind).ok_or_else(|| {
            StoreError::Database(format!("invalid sender kind: {}", row.sender_kind))
        })?;
        let content_kind = ContentKind::from_i16(row.content_kind).ok_or_else(|| {
            StoreError::Database(format!("invalid content kind: {}", row.content_kind))
        })?;
        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_kind,
            sender_id: row.sender_id,
            content_kind,
            body: row.body,
            read: row.read,
            visible_to_customer: row.visible_to_customer,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TransferRow {
    id: i64,
    conversation_id: Uuid,
    from_agent_id: Uuid,
    to_agent_id: Uuid,
    kind: i16,
    operator_id: Option<Uuid>,
    reason: String,
    created_at: OffsetDateTime,
}

impl TryFrom<TransferRow> for TransferRecord {
    type Error = StoreError;

    fn try_from(row: TransferRow) -> Result<Self, Self::Error> {
        let kind = TransferKind::from_i16(row.kind)
            .ok_or_else(|| StoreError::Database(format!("invalid transfer kind: {}", row.kind)))?;
        Ok(TransferRecord {
            id: row.id,
            conversation_id: row.conversation_id,
            from_agent_id: row.from_agent_id,
            to_agent_id: row.to_agent_id,
            kind,
            operator_id: row.operator_id,
            reason: row.reason,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livedesk_shared::db::create_pool;

    async fn setup() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url).await.expect("Failed to create pool");
        livedesk_shared::db::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        PgStore::new(pool)
    }

    async fn insert_agent(store: &PgStore, name: &str, capacity: i32) -> Uuid {
        let (id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO agents (display_name, capacity) VALUES ($1, $2) RETURNING id",
        )
        .bind(name)
        .bind(capacity)
        .fetch_one(&store.pool)
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_open_is_unique_per_customer() {
        let store = setup().await;
        let customer = store
            .get_or_create_customer(&Uuid::new_v4().to_string(), Default::default())
            .await
            .unwrap();

        let (first, created) = store.get_or_open_for(customer.id).await.unwrap();
        assert!(created);
        let (second, created) = store.get_or_open_for(customer.id).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        // Closing frees the slot; the next open is a fresh conversation
        store.close(first.id).await.unwrap();
        let (third, created) = store.get_or_open_for(customer.id).await.unwrap();
        assert!(created);
        assert_ne!(third.id, first.id);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_assign_respects_capacity() {
        let store = setup().await;
        let agent = insert_agent(&store, "cap-one", 1).await;

        let c1 = store
            .get_or_create_customer(&Uuid::new_v4().to_string(), Default::default())
            .await
            .unwrap();
        let c2 = store
            .get_or_create_customer(&Uuid::new_v4().to_string(), Default::default())
            .await
            .unwrap();

        let (conv1, _) = store.get_or_open_for(c1.id).await.unwrap();
        let (conv2, _) = store.get_or_open_for(c2.id).await.unwrap();

        store.assign(conv1.id, agent).await.unwrap();
        // Idempotent re-assign to the same agent
        store.assign(conv1.id, agent).await.unwrap();
        // Second conversation bounces off the capacity guard
        assert!(matches!(
            store.assign(conv2.id, agent).await,
            Err(StoreError::AgentFull)
        ));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_timeout_candidates_need_unanswered_customer() {
        let store = setup().await;
        let agent = insert_agent(&store, "slow", 10).await;
        let customer = store
            .get_or_create_customer(&Uuid::new_v4().to_string(), Default::default())
            .await
            .unwrap();

        let (conv, _) = store.get_or_open_for(customer.id).await.unwrap();
        store.assign(conv.id, agent).await.unwrap();
        store
            .append_message(conv.id, SenderKind::Customer, Some(customer.id), ContentKind::Text, "hello?", true)
            .await
            .unwrap();

        let future = OffsetDateTime::now_utc() + time::Duration::minutes(5);
        let candidates = store.timeout_candidates(future).await.unwrap();
        assert!(candidates.iter().any(|c| c.id == conv.id));

        // An agent reply after the customer message clears the candidate
        store
            .append_message(conv.id, SenderKind::Agent, Some(agent), ContentKind::Text, "here", true)
            .await
            .unwrap();
        let candidates = store.timeout_candidates(future).await.unwrap();
        assert!(!candidates.iter().any(|c| c.id == conv.id));
    }
}
