//! Postgres implementation of [`ChatStore`]

use async_trait::async_trait;
use sqlx::{FromRow, PgConnection, PgPool};
use supportdesk_shared::{
    ConversationId, ConversationStatus, MessageId, StoreError, StoreResult, UserId,
};
use time::OffsetDateTime;

use super::models::{
    page_from_newest_first, AdminAvailability, AdminConversationState, Conversation, Message,
    MessagePage, NewAssignment, SavedMessage, UserProfile, Visibility,
};
use super::store::ChatStore;

const CONVERSATION_COLUMNS: &str =
    "id, customer_id, admin_id, status::TEXT AS status, last_message_at, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, message_text, created_at, deleted_at, purge_at";
const STATE_COLUMNS: &str = "admin_id, conversation_id, unread_count, last_message_id, updated_at";

// =============================================================================
// Row Types
// =============================================================================

#[derive(Debug, FromRow)]
struct UserRow {
    id: i64,
    username: String,
    email: String,
    role: String,
}

impl TryFrom<UserRow> for UserProfile {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: UserId(row.id),
            username: row.username,
            email: row.email,
            role: row.role.parse()?,
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: i64,
    customer_id: i64,
    admin_id: Option<i64>,
    status: String,
    last_message_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = StoreError;

    fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: ConversationId(row.id),
            customer_id: UserId(row.customer_id),
            admin_id: row.admin_id.map(UserId),
            status: row.status.parse()?,
            last_message_at: row.last_message_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    conversation_id: i64,
    sender_id: i64,
    message_text: String,
    created_at: OffsetDateTime,
    deleted_at: Option<OffsetDateTime>,
    purge_at: Option<OffsetDateTime>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: MessageId(row.id),
            conversation_id: ConversationId(row.conversation_id),
            sender_id: UserId(row.sender_id),
            text: row.message_text,
            created_at: row.created_at,
            deleted_at: row.deleted_at,
            purge_at: row.purge_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct AvailabilityRow {
    admin_id: i64,
    current_conversations: i32,
    updated_at: OffsetDateTime,
}

impl From<AvailabilityRow> for AdminAvailability {
    fn from(row: AvailabilityRow) -> Self {
        Self {
            admin_id: UserId(row.admin_id),
            current_conversations: row.current_conversations,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct StateRow {
    admin_id: i64,
    conversation_id: i64,
    unread_count: i32,
    last_message_id: Option<i64>,
    updated_at: OffsetDateTime,
}

impl From<StateRow> for AdminConversationState {
    fn from(row: StateRow) -> Self {
        Self {
            admin_id: UserId(row.admin_id),
            conversation_id: ConversationId(row.conversation_id),
            unread_count: row.unread_count,
            last_message_id: row.last_message_id.map(MessageId),
            updated_at: row.updated_at,
        }
    }
}

fn conversations(rows: Vec<ConversationRow>) -> StoreResult<Vec<Conversation>> {
    rows.into_iter().map(Conversation::try_from).collect()
}

/// Clear purge deadlines and move closed -> open inside the caller's
/// transaction. Returns the reopened row, `None` if it was not closed.
async fn reopen_in(conn: &mut PgConnection, id: ConversationId) -> StoreResult<Option<ConversationRow>> {
    // Row locks taken here make the purge sweep re-check `purge_at` after
    // the transaction commits, so a cleared row is never deleted.
    let cleared = sqlx::query(
        r#"
        UPDATE messages
        SET purge_at = NULL
        WHERE conversation_id = $1 AND purge_at IS NOT NULL
        "#,
    )
    .bind(id.0)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    let row: Option<ConversationRow> = sqlx::query_as(&format!(
        r#"
        UPDATE conversations
        SET status = 'open', updated_at = NOW()
        WHERE id = $1 AND status = 'closed'
        RETURNING {CONVERSATION_COLUMNS}
        "#
    ))
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(admin_id) = row.as_ref().and_then(|r| r.admin_id) {
        sqlx::query(
            r#"
            INSERT INTO admin_availability (admin_id, current_conversations)
            VALUES ($1, 1)
            ON CONFLICT (admin_id) DO UPDATE
            SET current_conversations = admin_availability.current_conversations + 1,
                updated_at = NOW()
            "#,
        )
        .bind(admin_id)
        .execute(&mut *conn)
        .await?;
    }

    tracing::debug!(conversation_id = %id, cleared, "Cleared purge deadlines");
    Ok(row)
}

// =============================================================================
// Store
// =============================================================================

/// [`ChatStore`] backed by a sqlx Postgres pool
#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> StoreResult<Option<UserProfile>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, username, email, role::TEXT AS role FROM users WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UserProfile::try_from).transpose()
    }

    async fn get_conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Conversation::try_from).transpose()
    }

    async fn create_assigned_conversation(
        &self,
        customer_id: UserId,
        admin_id: UserId,
    ) -> StoreResult<NewAssignment> {
        let mut tx = self.pool.begin().await?;

        let conversation: ConversationRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO conversations (customer_id, admin_id, status)
            VALUES ($1, $2, 'open')
            RETURNING {CONVERSATION_COLUMNS}
            "#
        ))
        .bind(customer_id.0)
        .bind(admin_id.0)
        .fetch_one(&mut *tx)
        .await?;

        let load: AvailabilityRow = sqlx::query_as(
            r#"
            INSERT INTO admin_availability (admin_id, current_conversations)
            VALUES ($1, 1)
            ON CONFLICT (admin_id) DO UPDATE
            SET current_conversations = admin_availability.current_conversations + 1,
                updated_at = NOW()
            RETURNING admin_id, current_conversations, updated_at
            "#,
        )
        .bind(admin_id.0)
        .fetch_one(&mut *tx)
        .await?;

        let state: StateRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO admin_conversation_states (admin_id, conversation_id, unread_count)
            VALUES ($1, $2, 0)
            ON CONFLICT (admin_id, conversation_id) DO UPDATE SET updated_at = NOW()
            RETURNING {STATE_COLUMNS}
            "#
        ))
        .bind(admin_id.0)
        .bind(conversation.id)
        .fetch_one(&mut *tx)
        .await?;

        // Dropping `tx` on any error above rolls every insert back
        tx.commit().await?;

        Ok(NewAssignment {
            conversation: conversation.try_into()?,
            admin_load: load.into(),
            admin_state: state.into(),
        })
    }

    async fn find_open_conversation(
        &self,
        customer_id: UserId,
    ) -> StoreResult<Option<Conversation>> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS} FROM conversations
            WHERE customer_id = $1 AND status = 'open'
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(customer_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Conversation::try_from).transpose()
    }

    async fn list_customer_conversations(
        &self,
        customer_id: UserId,
    ) -> StoreResult<Vec<Conversation>> {
        let rows: Vec<ConversationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS} FROM conversations
            WHERE customer_id = $1
            ORDER BY COALESCE(last_message_at, created_at) DESC, id DESC
            "#
        ))
        .bind(customer_id.0)
        .fetch_all(&self.pool)
        .await?;

        conversations(rows)
    }

    async fn list_admin_conversations(
        &self,
        admin_id: UserId,
        open_only: bool,
    ) -> StoreResult<Vec<Conversation>> {
        let rows: Vec<ConversationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS} FROM conversations
            WHERE admin_id = $1 AND (NOT $2 OR status = 'open')
            ORDER BY COALESCE(last_message_at, created_at) DESC, id DESC
            "#
        ))
        .bind(admin_id.0)
        .bind(open_only)
        .fetch_all(&self.pool)
        .await?;

        conversations(rows)
    }

    async fn close_conversation(
        &self,
        id: ConversationId,
        purge_at: OffsetDateTime,
    ) -> StoreResult<Option<Conversation>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            r#"
            UPDATE conversations
            SET status = 'closed', updated_at = NOW()
            WHERE id = $1 AND status = 'open'
            RETURNING {CONVERSATION_COLUMNS}
            "#
        ))
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        // purge_at is only ever written together with deleted_at
        sqlx::query(
            r#"
            UPDATE messages
            SET deleted_at = COALESCE(deleted_at, NOW()), purge_at = $2
            WHERE conversation_id = $1
            "#,
        )
        .bind(id.0)
        .bind(purge_at)
        .execute(&mut *tx)
        .await?;

        if let Some(admin_id) = row.admin_id {
            sqlx::query(
                r#"
                UPDATE admin_availability
                SET current_conversations = current_conversations - 1, updated_at = NOW()
                WHERE admin_id = $1 AND current_conversations > 0
                "#,
            )
            .bind(admin_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        row.try_into().map(Some)
    }

    async fn reopen_conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        let mut tx = self.pool.begin().await?;
        let row = reopen_in(&mut *tx, id).await?;
        tx.commit().await?;

        row.map(Conversation::try_from).transpose()
    }

    async fn least_busy_admin(&self) -> StoreResult<Option<AdminAvailability>> {
        let row: Option<AvailabilityRow> = sqlx::query_as(
            r#"
            SELECT u.id AS admin_id,
                   COALESCE(a.current_conversations, 0) AS current_conversations,
                   COALESCE(a.updated_at, u.created_at) AS updated_at
            FROM users u
            LEFT JOIN admin_availability a ON a.admin_id = u.id
            WHERE u.role = 'admin'
            ORDER BY COALESCE(a.current_conversations, 0) ASC, u.id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn admin_availability(&self, admin_id: UserId) -> StoreResult<Option<AdminAvailability>> {
        let row: Option<AvailabilityRow> = sqlx::query_as(
            "SELECT admin_id, current_conversations, updated_at FROM admin_availability WHERE admin_id = $1",
        )
        .bind(admin_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn get_admin_state(
        &self,
        admin_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<Option<AdminConversationState>> {
        let row: Option<StateRow> = sqlx::query_as(&format!(
            "SELECT {STATE_COLUMNS} FROM admin_conversation_states WHERE admin_id = $1 AND conversation_id = $2"
        ))
        .bind(admin_id.0)
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn increment_unread(
        &self,
        admin_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<AdminConversationState> {
        let row: StateRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO admin_conversation_states (admin_id, conversation_id, unread_count)
            VALUES ($1, $2, 1)
            ON CONFLICT (admin_id, conversation_id) DO UPDATE
            SET unread_count = admin_conversation_states.unread_count + 1,
                updated_at = NOW()
            RETURNING {STATE_COLUMNS}
            "#
        ))
        .bind(admin_id.0)
        .bind(conversation_id.0)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn reset_unread(
        &self,
        admin_id: UserId,
        conversation_id: ConversationId,
        last_message_id: Option<MessageId>,
    ) -> StoreResult<Option<AdminConversationState>> {
        let row: Option<StateRow> = sqlx::query_as(&format!(
            r#"
            UPDATE admin_conversation_states
            SET unread_count = 0,
                last_message_id = COALESCE($3, last_message_id),
                updated_at = NOW()
            WHERE admin_id = $1 AND conversation_id = $2
            RETURNING {STATE_COLUMNS}
            "#
        ))
        .bind(admin_id.0)
        .bind(conversation_id.0)
        .bind(last_message_id.map(|id| id.0))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list_admin_states(&self, admin_id: UserId) -> StoreResult<Vec<AdminConversationState>> {
        let rows: Vec<StateRow> = sqlx::query_as(&format!(
            r#"
            SELECT {STATE_COLUMNS} FROM admin_conversation_states
            WHERE admin_id = $1
            ORDER BY updated_at DESC
            "#
        ))
        .bind(admin_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        text: &str,
    ) -> StoreResult<SavedMessage> {
        let mut tx = self.pool.begin().await?;

        // Holding the row lock orders this against a concurrent close
        let status: Option<String> = sqlx::query_scalar(
            "SELECT status::TEXT FROM conversations WHERE id = $1 FOR UPDATE",
        )
        .bind(conversation_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(status) = status else {
            tx.rollback().await?;
            return Err(StoreError::NotFound);
        };

        let reopened = if status.parse::<ConversationStatus>()? == ConversationStatus::Closed {
            reopen_in(&mut *tx, conversation_id).await?
        } else {
            None
        };

        let row: MessageRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO messages (conversation_id, sender_id, message_text)
            VALUES ($1, $2, $3)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(conversation_id.0)
        .bind(sender_id.0)
        .bind(text)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE conversations SET last_message_at = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(conversation_id.0)
        .bind(row.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(SavedMessage {
            message: row.into(),
            reopened: reopened.map(Conversation::try_from).transpose()?,
        })
    }

    async fn message_history(
        &self,
        conversation_id: ConversationId,
        limit: i64,
        cursor: Option<MessageId>,
        visibility: Visibility,
    ) -> StoreResult<MessagePage> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE conversation_id = $1
              AND ($2::BIGINT IS NULL OR id < $2)
              AND ($3 OR deleted_at IS NULL)
            ORDER BY id DESC
            LIMIT $4
            "#
        ))
        .bind(conversation_id.0)
        .bind(cursor.map(|id| id.0))
        .bind(visibility == Visibility::All)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        Ok(page_from_newest_first(
            rows.into_iter().map(Into::into).collect(),
            limit,
        ))
    }

    async fn latest_message_id(
        &self,
        conversation_id: ConversationId,
    ) -> StoreResult<Option<MessageId>> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT MAX(id) FROM messages WHERE conversation_id = $1")
                .bind(conversation_id.0)
                .fetch_one(&self.pool)
                .await?;

        Ok(id.map(MessageId))
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE purge_at IS NOT NULL AND purge_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use supportdesk_shared::{create_pool, run_migrations};

    async fn store() -> PgChatStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url, 2).await.expect("Failed to create pool");
        run_migrations(&pool).await.expect("Failed to run migrations");
        PgChatStore::new(pool)
    }

    async fn insert_user(store: &PgChatStore, name: &str, role: &str) -> UserId {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (username, email, role) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(format!("{name}-{}", uuid::Uuid::new_v4()))
        .bind(format!("{name}-{}@example.com", uuid::Uuid::new_v4()))
        .bind(role)
        .fetch_one(store.pool())
        .await
        .unwrap();
        UserId(id)
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_reopen_protects_messages_from_purge() {
        let store = store().await;
        let customer = insert_user(&store, "customer", "customer").await;
        let admin = insert_user(&store, "admin", "admin").await;

        let conversation = store
            .create_assigned_conversation(customer, admin)
            .await
            .unwrap()
            .conversation;
        let message = store
            .save_message(conversation.id, customer, "hello")
            .await
            .unwrap()
            .message;

        let past = OffsetDateTime::now_utc() - time::Duration::days(1);
        store.close_conversation(conversation.id, past).await.unwrap().unwrap();
        store.reopen_conversation(conversation.id).await.unwrap().unwrap();

        store.purge_expired(OffsetDateTime::now_utc()).await.unwrap();

        let page = store
            .message_history(conversation.id, 50, None, Visibility::All)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].id, message.id);
        assert!(page.messages[0].is_deleted());
        assert!(page.messages[0].purge_at.is_none());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_unread_counter_is_atomic() {
        let store = store().await;
        let customer = insert_user(&store, "customer", "customer").await;
        let admin = insert_user(&store, "admin", "admin").await;
        let conversation = store
            .create_assigned_conversation(customer, admin)
            .await
            .unwrap()
            .conversation;

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment_unread(admin, conversation.id).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let state = store.get_admin_state(admin, conversation.id).await.unwrap().unwrap();
        assert_eq!(state.unread_count, 10);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_send_racing_close_never_lands_in_closed_conversation() {
        let store = store().await;
        let customer = insert_user(&store, "customer", "customer").await;
        let admin = insert_user(&store, "admin", "admin").await;
        let conversation = store
            .create_assigned_conversation(customer, admin)
            .await
            .unwrap()
            .conversation;

        for round in 0..20 {
            let purge_at = OffsetDateTime::now_utc() + time::Duration::days(30);
            let closer = {
                let store = store.clone();
                tokio::spawn(async move { store.close_conversation(conversation.id, purge_at).await })
            };
            let saved = store
                .save_message(conversation.id, customer, &format!("m{round}"))
                .await
                .unwrap();
            closer.await.unwrap().unwrap();

            let current = store.get_conversation(conversation.id).await.unwrap().unwrap();
            let page = store
                .message_history(conversation.id, 100, None, Visibility::All)
                .await
                .unwrap();
            let stored = page
                .messages
                .iter()
                .find(|m| m.id == saved.message.id)
                .unwrap();
            // Closed after the insert, or reopened by it: never closed with a live message
            assert_eq!(current.is_closed(), stored.is_deleted());

            store.reopen_conversation(conversation.id).await.unwrap();
        }

        let load = store.admin_availability(admin).await.unwrap().unwrap();
        assert_eq!(load.current_conversations, 1);
    }
}
