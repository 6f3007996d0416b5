use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use parley_core::{Conversation, ParticipantPair};

use crate::StoragePool;

#[derive(Clone)]
pub struct ConversationRepository {
    pool: StoragePool,
}

#[derive(Debug, Clone, FromRow)]
struct ConversationRow {
    conversation_id: Uuid,
    participant_low: Uuid,
    participant_high: Uuid,
    last_message_id: Option<Uuid>,
    last_message_text: Option<String>,
    last_message_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            conversation_id: row.conversation_id,
            participants: ParticipantPair::new(row.participant_low, row.participant_high),
            last_message_id: row.last_message_id,
            last_message_text: row.last_message_text,
            last_message_at: row.last_message_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const CONVERSATION_COLUMNS: &str = "conversation_id, participant_low, participant_high, \
     last_message_id, last_message_text, last_message_at, created_at, updated_at";

impl ConversationRepository {
    pub fn new(pool: StoragePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    /// Find the conversation for a canonical pair, creating it on first
    /// contact. Concurrent first contact from both directions races on the
    /// unique pair index; the loser's insert comes back empty and the row the
    /// winner created is re-fetched instead of surfacing the conflict.
    pub async fn get_or_create(&self, pair: ParticipantPair) -> Result<Conversation> {
        if let Some(existing) = self.find_by_pair(pair).await? {
            return Ok(existing);
        }

        let inserted = sqlx::query_as::<_, ConversationRow>(&format!(
            r#"
            INSERT INTO conversations (participant_low, participant_high)
            VALUES ($1, $2)
            ON CONFLICT (participant_low, participant_high) DO NOTHING
            RETURNING {CONVERSATION_COLUMNS}
            "#,
        ))
        .bind(pair.low())
        .bind(pair.high())
        .fetch_optional(self.pool.pool())
        .await?;

        if let Some(row) = inserted {
            return Ok(row.into());
        }

        self.find_by_pair(pair)
            .await?
            .ok_or_else(|| anyhow!("conversation vanished after insert conflict"))
    }

    pub async fn find_by_pair(&self, pair: ParticipantPair) -> Result<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS}
            FROM conversations
            WHERE participant_low = $1 AND participant_high = $2
            "#,
        ))
        .bind(pair.low())
        .bind(pair.high())
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn fetch(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS}
            FROM conversations
            WHERE conversation_id = $1
            "#,
        ))
        .bind(conversation_id)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(row.map(Into::into))
    }

    /// Conversations involving `user_id`, newest activity first.
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, ConversationRow>(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS}
            FROM conversations
            WHERE participant_low = $1 OR participant_high = $1
            ORDER BY updated_at DESC
            LIMIT $2 OFFSET $3
            "#,
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM conversations
                WHERE conversation_id = $1
                  AND (participant_low = $2 OR participant_high = $2)
            )
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(self.pool.pool())
        .await?;
        Ok(exists)
    }

    /// Refresh the denormalized last-message summary used by list rendering.
    pub async fn record_last_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        snippet: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_message_id = $2,
                last_message_text = $3,
                last_message_at = $4,
                updated_at = $4
            WHERE conversation_id = $1
            "#,
        )
        .bind(conversation_id)
        .bind(message_id)
        .bind(snippet)
        .bind(at)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }
}
