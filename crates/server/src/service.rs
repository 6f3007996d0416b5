use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use parley_coord::CoordinationStore;
use parley_core::{
    snippet, AttachmentDescriptor, Conversation, FanoutFrame, Message, MessageStatus,
    NotificationEvent, ParticipantPair, StatusUpdate,
};
use parley_storage::{ConversationRepository, FollowRepository, MessageRepository, StoragePool};

use crate::config::MessagingConfig;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("operation not permitted")]
    Forbidden,
    #[error("resource not found")]
    NotFound,
    #[error("send rate limit exceeded")]
    RateLimited,
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("message content exceeds the permitted length")]
    ContentTooLarge,
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_or_create(&self, pair: ParticipantPair) -> Result<Conversation>;
    async fn fetch(&self, conversation_id: Uuid) -> Result<Option<Conversation>>;
    async fn list_for_user(&self, user_id: Uuid, limit: i64, offset: i64)
        -> Result<Vec<Conversation>>;
    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool>;
    async fn record_last_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        snippet: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
        attachments: &[AttachmentDescriptor],
    ) -> Result<Message>;
    async fn set_cache_entry(&self, message_id: Uuid, entry_id: &str) -> Result<()>;
    async fn fetch(&self, message_id: Uuid) -> Result<Option<Message>>;
    async fn mark_delivered(
        &self,
        message_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>>;
    async fn mark_read(&self, message_ids: &[Uuid], receiver_id: Uuid) -> Result<Vec<Uuid>>;
    async fn history_page(
        &self,
        conversation_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>>;
    async fn search(&self, conversation_id: Uuid, query: &str, limit: i64) -> Result<Vec<Message>>;
    async fn unread_count(&self, receiver_id: Uuid) -> Result<i64>;
}

#[async_trait]
pub trait FollowStore: Send + Sync {
    async fn is_mutual(&self, user_a: Uuid, user_b: Uuid) -> Result<bool>;
    async fn contacts_of(&self, user_id: Uuid) -> Result<Vec<Uuid>>;
}

#[async_trait]
impl ConversationStore for ConversationRepository {
    async fn get_or_create(&self, pair: ParticipantPair) -> Result<Conversation> {
        ConversationRepository::get_or_create(self, pair).await
    }

    async fn fetch(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        ConversationRepository::fetch(self, conversation_id).await
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>> {
        ConversationRepository::list_for_user(self, user_id, limit, offset).await
    }

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        ConversationRepository::is_participant(self, conversation_id, user_id).await
    }

    async fn record_last_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        snippet: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        ConversationRepository::record_last_message(self, conversation_id, message_id, snippet, at)
            .await
    }
}

#[async_trait]
impl MessageStore for MessageRepository {
    async fn insert(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
        attachments: &[AttachmentDescriptor],
    ) -> Result<Message> {
        MessageRepository::insert(self, conversation_id, sender_id, receiver_id, content, attachments)
            .await
    }

    async fn set_cache_entry(&self, message_id: Uuid, entry_id: &str) -> Result<()> {
        MessageRepository::set_cache_entry(self, message_id, entry_id).await
    }

    async fn fetch(&self, message_id: Uuid) -> Result<Option<Message>> {
        MessageRepository::fetch(self, message_id).await
    }

    async fn mark_delivered(
        &self,
        message_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        MessageRepository::mark_delivered(self, message_id, receiver_id).await
    }

    async fn mark_read(&self, message_ids: &[Uuid], receiver_id: Uuid) -> Result<Vec<Uuid>> {
        MessageRepository::mark_read(self, message_ids, receiver_id).await
    }

    async fn history_page(
        &self,
        conversation_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        MessageRepository::history_page(self, conversation_id, limit, offset).await
    }

    async fn search(&self, conversation_id: Uuid, query: &str, limit: i64) -> Result<Vec<Message>> {
        MessageRepository::search(self, conversation_id, query, limit).await
    }

    async fn unread_count(&self, receiver_id: Uuid) -> Result<i64> {
        MessageRepository::unread_count(self, receiver_id).await
    }
}

#[async_trait]
impl FollowStore for FollowRepository {
    async fn is_mutual(&self, user_a: Uuid, user_b: Uuid) -> Result<bool> {
        FollowRepository::is_mutual(self, user_a, user_b).await
    }

    async fn contacts_of(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        FollowRepository::contacts_of(self, user_id).await
    }
}

#[derive(Default)]
struct ConversationsInner {
    by_id: HashMap<Uuid, Conversation>,
    by_pair: HashMap<ParticipantPair, Uuid>,
}

/// In-memory conversation store. Backs the test suite and database-less
/// operation.
#[derive(Default)]
pub struct InMemoryConversations {
    inner: RwLock<ConversationsInner>,
}

#[async_trait]
impl ConversationStore for InMemoryConversations {
    async fn get_or_create(&self, pair: ParticipantPair) -> Result<Conversation> {
        let mut inner = self.inner.write().await;
        if let Some(id) = inner.by_pair.get(&pair) {
            return Ok(inner.by_id[id].clone());
        }
        let now = Utc::now();
        let conversation = Conversation {
            conversation_id: Uuid::new_v4(),
            participants: pair,
            last_message_id: None,
            last_message_text: None,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.by_pair.insert(pair, conversation.conversation_id);
        inner
            .by_id
            .insert(conversation.conversation_id, conversation.clone());
        Ok(conversation)
    }

    async fn fetch(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.inner.read().await.by_id.get(&conversation_id).cloned())
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>> {
        let inner = self.inner.read().await;
        let mut conversations: Vec<_> = inner
            .by_id
            .values()
            .filter(|conversation| conversation.involves(user_id))
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_id
            .get(&conversation_id)
            .is_some_and(|conversation| conversation.involves(user_id)))
    }

    async fn record_last_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        snippet: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(conversation) = inner.by_id.get_mut(&conversation_id) {
            conversation.last_message_id = Some(message_id);
            conversation.last_message_text = Some(snippet.to_string());
            conversation.last_message_at = Some(at);
            conversation.updated_at = at;
        }
        Ok(())
    }
}

#[derive(Default)]
struct MessagesInner {
    by_id: HashMap<Uuid, Message>,
    by_conversation: HashMap<Uuid, Vec<Uuid>>,
}

#[derive(Default)]
pub struct InMemoryMessages {
    inner: RwLock<MessagesInner>,
}

#[async_trait]
impl MessageStore for InMemoryMessages {
    async fn insert(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
        attachments: &[AttachmentDescriptor],
    ) -> Result<Message> {
        let message = Message {
            message_id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            receiver_id,
            content: content.to_string(),
            attachments: attachments.to_vec(),
            status: MessageStatus::Sent,
            created_at: Utc::now(),
            delivered_at: None,
            read_at: None,
            cache_entry_id: None,
        };
        let mut inner = self.inner.write().await;
        inner
            .by_conversation
            .entry(conversation_id)
            .or_default()
            .push(message.message_id);
        inner.by_id.insert(message.message_id, message.clone());
        Ok(message)
    }

    async fn set_cache_entry(&self, message_id: Uuid, entry_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(message) = inner.by_id.get_mut(&message_id) {
            message.cache_entry_id = Some(entry_id.to_string());
        }
        Ok(())
    }

    async fn fetch(&self, message_id: Uuid) -> Result<Option<Message>> {
        Ok(self.inner.read().await.by_id.get(&message_id).cloned())
    }

    async fn mark_delivered(
        &self,
        message_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut inner = self.inner.write().await;
        let Some(message) = inner.by_id.get_mut(&message_id) else {
            return Ok(None);
        };
        if message.receiver_id != receiver_id {
            return Ok(None);
        }
        // The guarded transition clamps repeat or out-of-order acks.
        match message.status.try_advance(MessageStatus::Delivered) {
            Ok(Some(next)) => {
                let now = Utc::now();
                message.status = next;
                message.delivered_at = Some(now);
                Ok(Some(now))
            }
            _ => Ok(None),
        }
    }

    async fn mark_read(&self, message_ids: &[Uuid], receiver_id: Uuid) -> Result<Vec<Uuid>> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut updated = Vec::new();
        for message_id in message_ids {
            let Some(message) = inner.by_id.get_mut(message_id) else {
                continue;
            };
            if message.receiver_id != receiver_id {
                continue;
            }
            if let Ok(Some(next)) = message.status.try_advance(MessageStatus::Read) {
                message.status = next;
                message.read_at = Some(now);
                updated.push(*message_id);
            }
        }
        Ok(updated)
    }

    async fn history_page(
        &self,
        conversation_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        let inner = self.inner.read().await;
        let ids = inner
            .by_conversation
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default();
        Ok(ids
            .iter()
            .rev()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect())
    }

    async fn search(&self, conversation_id: Uuid, query: &str, limit: i64) -> Result<Vec<Message>> {
        let needle = query.to_lowercase();
        let inner = self.inner.read().await;
        let ids = inner
            .by_conversation
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default();
        Ok(ids
            .iter()
            .rev()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|message| message.content.to_lowercase().contains(&needle))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn unread_count(&self, receiver_id: Uuid) -> Result<i64> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_id
            .values()
            .filter(|message| {
                message.receiver_id == receiver_id && message.status != MessageStatus::Read
            })
            .count() as i64)
    }
}

/// In-memory follow graph. Seeded by tests; empty in database-less operation,
/// which means nobody can message anybody until a database is configured.
#[derive(Default)]
pub struct InMemoryFollows {
    edges: RwLock<HashSet<(Uuid, Uuid)>>,
}

impl InMemoryFollows {
    pub async fn seed(&self, follower_id: Uuid, following_id: Uuid) {
        self.edges.write().await.insert((follower_id, following_id));
    }

    pub async fn seed_mutual(&self, user_a: Uuid, user_b: Uuid) {
        let mut edges = self.edges.write().await;
        edges.insert((user_a, user_b));
        edges.insert((user_b, user_a));
    }
}

#[async_trait]
impl FollowStore for InMemoryFollows {
    async fn is_mutual(&self, user_a: Uuid, user_b: Uuid) -> Result<bool> {
        let edges = self.edges.read().await;
        Ok(edges.contains(&(user_a, user_b)) && edges.contains(&(user_b, user_a)))
    }

    async fn contacts_of(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let edges = self.edges.read().await;
        let mut contacts: Vec<Uuid> = edges
            .iter()
            .filter(|(follower, following)| {
                *follower == user_id && edges.contains(&(*following, user_id))
            })
            .map(|(_, following)| *following)
            .collect();
        contacts.sort();
        Ok(contacts)
    }
}

/// Which backend actually served a history page. Diagnostic only; callers
/// must not vary behavior on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    Cache,
    Database,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub source: HistorySource,
}

/// Conversation list entry decorated with live state for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub other_user_id: Uuid,
    pub unread_count: i64,
    pub online: bool,
}

/// Business logic for the messaging core. The single write path for
/// messages; everything the gateway and the HTTP surface do goes through
/// here.
#[derive(Clone)]
pub struct MessagingService {
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    follows: Arc<dyn FollowStore>,
    coord: Arc<dyn CoordinationStore>,
    limits: MessagingConfig,
    notifications: Option<mpsc::UnboundedSender<NotificationEvent>>,
}

impl MessagingService {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
        follows: Arc<dyn FollowStore>,
        coord: Arc<dyn CoordinationStore>,
        limits: MessagingConfig,
    ) -> Self {
        Self {
            conversations,
            messages,
            follows,
            coord,
            limits,
            notifications: None,
        }
    }

    pub fn new_with_pool(
        pool: StoragePool,
        coord: Arc<dyn CoordinationStore>,
        limits: MessagingConfig,
    ) -> Self {
        Self::new(
            ConversationRepository::new(pool.clone()),
            MessageRepository::new(pool.clone()),
            FollowRepository::new(pool),
            coord,
            limits,
        )
    }

    /// Database-less construction: in-memory stores behind the same traits.
    /// Returns the follow store handle so callers (tests, demos) can seed
    /// relationships.
    pub fn new_in_memory(
        coord: Arc<dyn CoordinationStore>,
        limits: MessagingConfig,
    ) -> (Self, Arc<InMemoryFollows>) {
        let follows = Arc::new(InMemoryFollows::default());
        let service = Self::new(
            Arc::new(InMemoryConversations::default()),
            Arc::new(InMemoryMessages::default()),
            follows.clone(),
            coord,
            limits,
        );
        (service, follows)
    }

    pub fn with_notifications(mut self, sender: mpsc::UnboundedSender<NotificationEvent>) -> Self {
        self.notifications = Some(sender);
        self
    }

    pub async fn can_message(&self, user_a: Uuid, user_b: Uuid) -> Result<bool, MessagingError> {
        Ok(self.follows.is_mutual(user_a, user_b).await?)
    }

    /// Resolve (or lazily create) the conversation between the caller and
    /// another user, gated on the mutual-follow predicate.
    pub async fn get_or_create_conversation(
        &self,
        caller_id: Uuid,
        other_id: Uuid,
    ) -> Result<Conversation, MessagingError> {
        if caller_id == other_id || !self.follows.is_mutual(caller_id, other_id).await? {
            return Err(MessagingError::Forbidden);
        }
        Ok(self
            .conversations
            .get_or_create(ParticipantPair::new(caller_id, other_id))
            .await?)
    }

    /// Fixed-window admission check, shared by the socket path and the HTTP
    /// fallback. Counting happens in the coordination store so the quota
    /// holds across gateway instances.
    pub async fn check_send_allowed(&self, sender_id: Uuid) -> Result<(), MessagingError> {
        let count = self.coord.count_send(sender_id).await?;
        if count > self.limits.max_sends_per_window {
            return Err(MessagingError::RateLimited);
        }
        Ok(())
    }

    /// The single message write path: authorization, persistence, cache
    /// overlay, conversation summary, fan-out, notification record.
    pub async fn send_message(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
        attachments: &[AttachmentDescriptor],
    ) -> Result<Message, MessagingError> {
        let content = content.trim();
        if content.is_empty() && attachments.is_empty() {
            return Err(MessagingError::EmptyContent);
        }
        if content.chars().count() > self.limits.max_content_chars {
            return Err(MessagingError::ContentTooLarge);
        }

        // Re-checked on every send: the relationship may have changed since
        // the client last asked.
        if sender_id == receiver_id || !self.follows.is_mutual(sender_id, receiver_id).await? {
            return Err(MessagingError::Forbidden);
        }

        let conversation = self
            .conversations
            .get_or_create(ParticipantPair::new(sender_id, receiver_id))
            .await?;

        let mut message = self
            .messages
            .insert(
                conversation.conversation_id,
                sender_id,
                receiver_id,
                content,
                attachments,
            )
            .await?;

        // Cache write is best-effort: the durable row is authoritative, a
        // miss only costs the fast path until the next database read.
        match serde_json::to_string(&message) {
            Ok(payload) => match self
                .coord
                .cache_message(conversation.conversation_id, &payload)
                .await
            {
                Ok(entry_id) => {
                    if let Err(err) = self.messages.set_cache_entry(message.message_id, &entry_id).await
                    {
                        tracing::warn!(?err, message_id = %message.message_id, "failed to record cache entry id");
                    }
                    message.cache_entry_id = Some(entry_id);
                }
                Err(err) => {
                    tracing::warn!(?err, conversation_id = %conversation.conversation_id, "recency cache write failed");
                }
            },
            Err(err) => {
                tracing::warn!(?err, "failed to serialize message for cache");
            }
        }

        self.conversations
            .record_last_message(
                conversation.conversation_id,
                message.message_id,
                &snippet(content),
                message.created_at,
            )
            .await?;

        if let Err(err) = self
            .coord
            .publish(&FanoutFrame::NewMessage {
                message: message.clone(),
            })
            .await
        {
            tracing::warn!(?err, message_id = %message.message_id, "fan-out publish failed");
        }

        if let Some(notifications) = &self.notifications {
            let _ = notifications.send(NotificationEvent::MessageSent {
                message_id: message.message_id,
                conversation_id: message.conversation_id,
                sender_id,
                receiver_id,
                preview: snippet(content),
            });
        }

        Ok(message)
    }

    /// Advance a message to DELIVERED on behalf of its receiver. Returns the
    /// status update when a transition actually happened; `None` means the
    /// acknowledgement was redundant (already delivered or read).
    pub async fn mark_delivered(
        &self,
        message_id: Uuid,
        caller_id: Uuid,
    ) -> Result<Option<StatusUpdate>, MessagingError> {
        let message = self
            .messages
            .fetch(message_id)
            .await?
            .ok_or(MessagingError::NotFound)?;
        if message.receiver_id != caller_id {
            return Err(MessagingError::Forbidden);
        }

        let Some(delivered_at) = self.messages.mark_delivered(message_id, caller_id).await? else {
            return Ok(None);
        };

        let update = StatusUpdate {
            message_ids: vec![message_id],
            status: MessageStatus::Delivered,
            timestamp: delivered_at,
            read_by: None,
        };
        if let Err(err) = self
            .coord
            .publish(&FanoutFrame::StatusChanged {
                recipient: message.sender_id,
                update: update.clone(),
            })
            .await
        {
            tracing::warn!(?err, message_id = %message_id, "status fan-out publish failed");
        }
        Ok(Some(update))
    }

    /// Bulk advance to READ for messages addressed to the caller. Idempotent;
    /// only the ids that actually transitioned are echoed to the sender.
    pub async fn mark_read(
        &self,
        message_ids: &[Uuid],
        conversation_id: Uuid,
        caller_id: Uuid,
    ) -> Result<Option<StatusUpdate>, MessagingError> {
        let updated = self.messages.mark_read(message_ids, caller_id).await?;

        if let Err(err) = self.coord.reset_unread(caller_id, conversation_id).await {
            tracing::warn!(?err, user_id = %caller_id, "failed to reset unread badge");
        }

        if updated.is_empty() {
            return Ok(None);
        }

        let update = StatusUpdate {
            message_ids: updated,
            status: MessageStatus::Read,
            timestamp: Utc::now(),
            read_by: Some(caller_id),
        };

        let recipient = self
            .conversations
            .fetch(conversation_id)
            .await?
            .and_then(|conversation| conversation.other_participant(caller_id));
        if let Some(recipient) = recipient {
            if let Err(err) = self
                .coord
                .publish(&FanoutFrame::StatusChanged {
                    recipient,
                    update: update.clone(),
                })
                .await
            {
                tracing::warn!(?err, conversation_id = %conversation_id, "read fan-out publish failed");
            }
        }

        Ok(Some(update))
    }

    /// One page of conversation history, cache first. Only the newest page
    /// can be served from the recency cache; deeper pages and cache misses
    /// fall back to the durable store. The source flag is diagnostic.
    pub async fn chat_history(
        &self,
        conversation_id: Uuid,
        caller_id: Uuid,
        page: i64,
        page_size: i64,
    ) -> Result<HistoryPage, MessagingError> {
        if !self
            .conversations
            .is_participant(conversation_id, caller_id)
            .await?
        {
            return Err(MessagingError::Forbidden);
        }

        let page = page.max(1);
        let page_size = page_size.clamp(1, self.limits.history_page_size);

        if page == 1 {
            match self
                .coord
                .recent_messages(conversation_id, page_size as usize)
                .await
            {
                Ok(payloads) if !payloads.is_empty() => {
                    let decoded: Result<Vec<Message>, _> = payloads
                        .iter()
                        .map(|payload| serde_json::from_str::<Message>(payload))
                        .collect();
                    match decoded {
                        Ok(messages) => {
                            return Ok(HistoryPage {
                                messages,
                                source: HistorySource::Cache,
                            });
                        }
                        Err(err) => {
                            tracing::warn!(?err, conversation_id = %conversation_id, "undecodable cache entry; using database");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(?err, conversation_id = %conversation_id, "recency cache unavailable; using database");
                }
            }
        }

        let offset = (page - 1) * page_size;
        let messages = self
            .messages
            .history_page(conversation_id, page_size, offset)
            .await?;
        Ok(HistoryPage {
            messages,
            source: HistorySource::Database,
        })
    }

    /// Conversation list for a user, newest activity first, decorated with
    /// the unread badge and the other participant's presence. Coordination
    /// failures degrade to zero/offline rather than failing the listing.
    pub async fn conversations(
        &self,
        user_id: Uuid,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<ConversationSummary>, MessagingError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, self.limits.conversations_page_size);
        let offset = (page - 1) * page_size;

        let conversations = self
            .conversations
            .list_for_user(user_id, page_size, offset)
            .await?;

        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let Some(other_user_id) = conversation.other_participant(user_id) else {
                continue;
            };
            let unread_count = self
                .coord
                .unread_badge(user_id, conversation.conversation_id)
                .await
                .unwrap_or(0);
            let online = self.coord.is_online(other_user_id).await.unwrap_or(false);
            summaries.push(ConversationSummary {
                conversation,
                other_user_id,
                unread_count,
                online,
            });
        }
        Ok(summaries)
    }

    pub async fn unread_count(&self, user_id: Uuid) -> Result<i64, MessagingError> {
        Ok(self.messages.unread_count(user_id).await?)
    }

    pub async fn contacts(&self, user_id: Uuid) -> Result<Vec<Uuid>, MessagingError> {
        Ok(self.follows.contacts_of(user_id).await?)
    }

    pub async fn search_messages(
        &self,
        conversation_id: Uuid,
        caller_id: Uuid,
        query: &str,
    ) -> Result<Vec<Message>, MessagingError> {
        if !self
            .conversations
            .is_participant(conversation_id, caller_id)
            .await?
        {
            return Err(MessagingError::Forbidden);
        }
        Ok(self
            .messages
            .search(conversation_id, query, self.limits.history_page_size)
            .await?)
    }

    pub async fn is_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, MessagingError> {
        Ok(self
            .conversations
            .is_participant(conversation_id, user_id)
            .await?)
    }

    pub async fn fetch_message(&self, message_id: Uuid) -> Result<Option<Message>, MessagingError> {
        Ok(self.messages.fetch(message_id).await?)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use parley_coord::{CoordSettings, InMemoryCoordStore};

    pub struct ServiceHarness {
        pub service: MessagingService,
        pub follows: Arc<InMemoryFollows>,
        pub coord: Arc<InMemoryCoordStore>,
    }

    pub fn harness() -> ServiceHarness {
        harness_with_limits(MessagingConfig::default())
    }

    pub fn harness_with_limits(limits: MessagingConfig) -> ServiceHarness {
        let coord = Arc::new(InMemoryCoordStore::new(CoordSettings::default()));
        let (service, follows) = MessagingService::new_in_memory(coord.clone(), limits);
        ServiceHarness {
            service,
            follows,
            coord,
        }
    }

    pub async fn mutual_pair(harness: &ServiceHarness) -> (Uuid, Uuid) {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        harness.follows.seed_mutual(a, b).await;
        (a, b)
    }

    #[tokio::test]
    async fn conversation_is_canonical_across_directions() {
        let harness = harness();
        let (a, b) = mutual_pair(&harness).await;

        let first = harness.service.get_or_create_conversation(a, b).await.unwrap();
        let second = harness.service.get_or_create_conversation(b, a).await.unwrap();
        assert_eq!(first.conversation_id, second.conversation_id);
    }

    #[tokio::test]
    async fn one_directional_follow_is_not_enough() {
        let harness = harness();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        harness.follows.seed(a, b).await;

        assert!(!harness.service.can_message(a, b).await.unwrap());
        assert!(matches!(
            harness.service.get_or_create_conversation(a, b).await,
            Err(MessagingError::Forbidden)
        ));
        assert!(matches!(
            harness.service.send_message(a, b, "hello", &[]).await,
            Err(MessagingError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn send_persists_sent_and_updates_the_summary() {
        let harness = harness();
        let (a, b) = mutual_pair(&harness).await;

        let message = harness
            .service
            .send_message(a, b, "hello there", &[])
            .await
            .unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert!(message.cache_entry_id.is_some());

        let conversations = harness.service.conversations(a, 1, 20).await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(
            conversations[0].conversation.last_message_text.as_deref(),
            Some("hello there")
        );
        assert_eq!(conversations[0].other_user_id, b);
    }

    #[tokio::test]
    async fn oversized_and_empty_content_are_rejected() {
        let harness = harness();
        let (a, b) = mutual_pair(&harness).await;

        let oversized = "x".repeat(parley_core::MAX_CONTENT_CHARS + 1);
        assert!(matches!(
            harness.service.send_message(a, b, &oversized, &[]).await,
            Err(MessagingError::ContentTooLarge)
        ));
        assert!(matches!(
            harness.service.send_message(a, b, "   ", &[]).await,
            Err(MessagingError::EmptyContent)
        ));
    }

    #[tokio::test]
    async fn rate_limit_rejects_without_persisting() {
        let limits = MessagingConfig {
            max_sends_per_window: 2,
            ..MessagingConfig::default()
        };
        let harness = harness_with_limits(limits);
        let (a, b) = mutual_pair(&harness).await;

        for _ in 0..2 {
            harness.service.check_send_allowed(a).await.unwrap();
            harness.service.send_message(a, b, "ok", &[]).await.unwrap();
        }

        // Third send in the window: rejected before anything is written.
        assert!(matches!(
            harness.service.check_send_allowed(a).await,
            Err(MessagingError::RateLimited)
        ));

        let conversation = harness.service.get_or_create_conversation(a, b).await.unwrap();
        let history = harness
            .service
            .chat_history(conversation.conversation_id, a, 2, 50)
            .await
            .unwrap();
        let page_one = harness
            .service
            .chat_history(conversation.conversation_id, a, 1, 50)
            .await
            .unwrap();
        assert_eq!(history.messages.len() + page_one.messages.len(), 2);
    }

    #[tokio::test]
    async fn only_the_receiver_may_acknowledge() {
        let harness = harness();
        let (a, b) = mutual_pair(&harness).await;
        let message = harness.service.send_message(a, b, "hi", &[]).await.unwrap();

        assert!(matches!(
            harness.service.mark_delivered(message.message_id, a).await,
            Err(MessagingError::Forbidden)
        ));
        assert!(matches!(
            harness
                .service
                .mark_delivered(Uuid::new_v4(), b)
                .await,
            Err(MessagingError::NotFound)
        ));
    }

    #[tokio::test]
    async fn status_never_regresses_and_acks_are_idempotent() {
        let harness = harness();
        let (a, b) = mutual_pair(&harness).await;
        let message = harness.service.send_message(a, b, "hi", &[]).await.unwrap();
        let conversation_id = message.conversation_id;

        let delivered = harness
            .service
            .mark_delivered(message.message_id, b)
            .await
            .unwrap()
            .expect("first ack transitions");
        assert_eq!(delivered.status, MessageStatus::Delivered);

        // Second delivery ack: idempotent no-op.
        assert!(harness
            .service
            .mark_delivered(message.message_id, b)
            .await
            .unwrap()
            .is_none());

        let read = harness
            .service
            .mark_read(&[message.message_id], conversation_id, b)
            .await
            .unwrap()
            .expect("read transitions");
        assert_eq!(read.status, MessageStatus::Read);
        assert_eq!(read.read_by, Some(b));

        // A delivery ack arriving after the read ack must not regress READ.
        assert!(harness
            .service
            .mark_delivered(message.message_id, b)
            .await
            .unwrap()
            .is_none());
        let stored = harness
            .service
            .fetch_message(message.message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
        let first_read_at = stored.read_at.expect("read timestamp");

        // Re-reading changes nothing and keeps the original timestamp.
        assert!(harness
            .service
            .mark_read(&[message.message_id], conversation_id, b)
            .await
            .unwrap()
            .is_none());
        let stored_again = harness
            .service
            .fetch_message(message.message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_again.read_at, Some(first_read_at));
    }

    #[tokio::test]
    async fn history_serves_cache_then_database() {
        let harness = harness();
        let (a, b) = mutual_pair(&harness).await;
        for n in 0..3 {
            harness
                .service
                .send_message(a, b, &format!("message {n}"), &[])
                .await
                .unwrap();
        }
        let conversation = harness.service.get_or_create_conversation(a, b).await.unwrap();

        let page_one = harness
            .service
            .chat_history(conversation.conversation_id, a, 1, 50)
            .await
            .unwrap();
        assert_eq!(page_one.source, HistorySource::Cache);
        assert_eq!(page_one.messages.len(), 3);
        assert_eq!(page_one.messages[0].content, "message 2");

        // Deep pages never touch the cache.
        let page_two = harness
            .service
            .chat_history(conversation.conversation_id, a, 2, 2)
            .await
            .unwrap();
        assert_eq!(page_two.source, HistorySource::Database);
        assert_eq!(page_two.messages.len(), 1);
        assert_eq!(page_two.messages[0].content, "message 0");
    }

    #[tokio::test]
    async fn history_requires_participation() {
        let harness = harness();
        let (a, b) = mutual_pair(&harness).await;
        harness.service.send_message(a, b, "private", &[]).await.unwrap();
        let conversation = harness.service.get_or_create_conversation(a, b).await.unwrap();

        assert!(matches!(
            harness
                .service
                .chat_history(conversation.conversation_id, Uuid::new_v4(), 1, 50)
                .await,
            Err(MessagingError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn unread_count_tracks_lifecycle() {
        let harness = harness();
        let (a, b) = mutual_pair(&harness).await;
        let first = harness.service.send_message(a, b, "one", &[]).await.unwrap();
        let second = harness.service.send_message(a, b, "two", &[]).await.unwrap();

        assert_eq!(harness.service.unread_count(b).await.unwrap(), 2);

        harness
            .service
            .mark_delivered(first.message_id, b)
            .await
            .unwrap();
        assert_eq!(harness.service.unread_count(b).await.unwrap(), 2);

        harness
            .service
            .mark_read(
                &[first.message_id, second.message_id],
                first.conversation_id,
                b,
            )
            .await
            .unwrap();
        assert_eq!(harness.service.unread_count(b).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn contacts_are_the_mutual_intersection() {
        let harness = harness();
        let me = Uuid::new_v4();
        let mutual = Uuid::new_v4();
        let follows_me_only = Uuid::new_v4();
        let i_follow_only = Uuid::new_v4();

        harness.follows.seed_mutual(me, mutual).await;
        harness.follows.seed(follows_me_only, me).await;
        harness.follows.seed(me, i_follow_only).await;

        assert_eq!(harness.service.contacts(me).await.unwrap(), vec![mutual]);
    }

    #[tokio::test]
    async fn search_is_scoped_and_case_insensitive() {
        let harness = harness();
        let (a, b) = mutual_pair(&harness).await;
        harness
            .service
            .send_message(a, b, "Weekend plans?", &[])
            .await
            .unwrap();
        harness.service.send_message(a, b, "nothing", &[]).await.unwrap();
        let conversation = harness.service.get_or_create_conversation(a, b).await.unwrap();

        let hits = harness
            .service
            .search_messages(conversation.conversation_id, b, "weekend")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "Weekend plans?");

        assert!(matches!(
            harness
                .service
                .search_messages(conversation.conversation_id, Uuid::new_v4(), "weekend")
                .await,
            Err(MessagingError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn conversation_list_reports_badges_and_presence() {
        let harness = harness();
        let (a, b) = mutual_pair(&harness).await;
        let message = harness.service.send_message(a, b, "ping", &[]).await.unwrap();

        harness
            .coord
            .increment_unread(b, message.conversation_id)
            .await
            .unwrap();
        harness.coord.register_presence(a, "inst/conn").await.unwrap();

        let listed = harness.service.conversations(b, 1, 20).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].unread_count, 1);
        assert!(listed[0].online);
    }

    #[tokio::test]
    async fn messaging_yourself_is_forbidden() {
        let harness = harness();
        let a = Uuid::new_v4();
        harness.follows.seed_mutual(a, a).await;
        assert!(matches!(
            harness.service.send_message(a, a, "hi me", &[]).await,
            Err(MessagingError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn send_emits_a_notification_record() {
        let harness = harness();
        let (a, b) = mutual_pair(&harness).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = harness.service.clone().with_notifications(tx);

        let message = service.send_message(a, b, "notify", &[]).await.unwrap();
        match rx.recv().await.expect("notification emitted") {
            NotificationEvent::MessageSent {
                message_id,
                sender_id,
                receiver_id,
                ..
            } => {
                assert_eq!(message_id, message.message_id);
                assert_eq!(sender_id, a);
                assert_eq!(receiver_id, b);
            }
        }
    }
}
