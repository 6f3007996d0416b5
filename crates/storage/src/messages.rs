use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use parley_core::{AttachmentDescriptor, Message, MessageStatus};

use crate::StoragePool;

#[derive(Clone)]
pub struct MessageRepository {
    pool: StoragePool,
}

#[derive(Debug, Clone, FromRow)]
struct MessageRow {
    message_id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    receiver_id: Uuid,
    content: String,
    attachments: serde_json::Value,
    status: String,
    cache_entry_id: Option<String>,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        let status = MessageStatus::from_str(&row.status).map_err(|err| anyhow!(err))?;
        let attachments: Vec<AttachmentDescriptor> = serde_json::from_value(row.attachments)?;
        Ok(Message {
            message_id: row.message_id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            content: row.content,
            attachments,
            status,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
            read_at: row.read_at,
            cache_entry_id: row.cache_entry_id,
        })
    }
}

const MESSAGE_COLUMNS: &str = "message_id, conversation_id, sender_id, receiver_id, content, \
     attachments, status, cache_entry_id, created_at, delivered_at, read_at";

impl MessageRepository {
    pub fn new(pool: StoragePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    /// Persist a new message with status SENT. The creation timestamp is the
    /// database clock so insertion order and timestamp order agree.
    pub async fn insert(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
        attachments: &[AttachmentDescriptor],
    ) -> Result<Message> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            INSERT INTO messages (message_id, conversation_id, sender_id, receiver_id, content, attachments)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {MESSAGE_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(sender_id)
        .bind(receiver_id)
        .bind(content)
        .bind(serde_json::to_value(attachments)?)
        .fetch_one(self.pool.pool())
        .await?;
        row.try_into()
    }

    /// Record the coordination-store cache entry the message landed in.
    pub async fn set_cache_entry(&self, message_id: Uuid, entry_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE messages SET cache_entry_id = $2 WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .bind(entry_id)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    pub async fn fetch(&self, message_id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = $1
            "#,
        ))
        .bind(message_id)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Advance SENT -> DELIVERED, restricted to the message's receiver. The
    /// status predicate makes the update conditional: a message already
    /// DELIVERED or READ is left untouched and `None` is returned, so
    /// out-of-order acknowledgements cannot regress status or overwrite the
    /// delivery timestamp.
    pub async fn mark_delivered(
        &self,
        message_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        let delivered_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            UPDATE messages
            SET status = 'DELIVERED', delivered_at = now()
            WHERE message_id = $1 AND receiver_id = $2 AND status = 'SENT'
            RETURNING delivered_at
            "#,
        )
        .bind(message_id)
        .bind(receiver_id)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(delivered_at)
    }

    /// Bulk advance to READ for messages addressed to `receiver_id`. Already
    /// read rows are skipped so the read timestamp is written at most once.
    /// Returns the ids that actually transitioned.
    pub async fn mark_read(&self, message_ids: &[Uuid], receiver_id: Uuid) -> Result<Vec<Uuid>> {
        let updated = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE messages
            SET status = 'READ', read_at = now()
            WHERE message_id = ANY($1) AND receiver_id = $2 AND status <> 'READ'
            RETURNING message_id
            "#,
        )
        .bind(message_ids)
        .bind(receiver_id)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(updated)
    }

    /// One page of a conversation's history, newest first.
    pub async fn history_page(
        &self,
        conversation_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        ))
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool.pool())
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Case-insensitive substring search within a conversation, newest first.
    pub async fn search(
        &self,
        conversation_id: Uuid,
        query: &str,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let pattern = format!("%{query}%");
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE conversation_id = $1 AND content ILIKE $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        ))
        .bind(conversation_id)
        .bind(pattern)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Messages addressed to `receiver_id` that have not been read yet.
    pub async fn unread_count(&self, receiver_id: Uuid) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE receiver_id = $1 AND status IN ('SENT', 'DELIVERED')
            "#,
        )
        .bind(receiver_id)
        .fetch_one(self.pool.pool())
        .await?;
        Ok(count)
    }
}
