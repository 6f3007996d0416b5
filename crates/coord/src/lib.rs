//! Shared coordination store: presence, typing, unread badges, rate-limit
//! counters, offline queues, the recent-message cache, and the pub/sub
//! fan-out channel that lets multiple gateway instances serve one user base.
//!
//! Every gateway instance talks to the same store; nothing held in process
//! memory is authoritative beyond the lifetime of a single connection. All
//! mutations use the store's native atomic primitives so concurrent writers
//! on different instances cannot lose updates.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use parley_core::FanoutFrame;

mod memory;
mod redis_store;

pub use memory::InMemoryCoordStore;
pub use redis_store::RedisCoordStore;

/// Capacity of the local broadcast channel the fan-out pump feeds.
pub(crate) const FANOUT_CAPACITY: usize = 256;

/// Expiry policy for the ephemeral records this store holds.
#[derive(Debug, Clone)]
pub struct CoordSettings {
    pub presence_ttl: Duration,
    pub typing_ttl: Duration,
    pub offline_retention: Duration,
    pub cache_retention: Duration,
    pub cache_max_entries: usize,
    pub rate_window: Duration,
}

impl Default for CoordSettings {
    fn default() -> Self {
        Self {
            presence_ttl: Duration::from_secs(3600),
            typing_ttl: Duration::from_secs(5),
            offline_retention: Duration::from_secs(7 * 24 * 3600),
            cache_retention: Duration::from_secs(7 * 24 * 3600),
            cache_max_entries: 500,
            rate_window: Duration::from_secs(60),
        }
    }
}

/// Operations every coordination backend must provide. The Redis
/// implementation is the production path; the in-memory implementation
/// serves single-instance deployments without Redis and the test suite.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Record that `user_id` holds an open connection identified by `handle`.
    /// The record expires after the presence TTL unless refreshed.
    async fn register_presence(&self, user_id: Uuid, handle: &str) -> Result<()>;

    /// Push the presence expiry out again. Called on every inbound event so
    /// ungraceful disconnects age out on their own.
    async fn refresh_presence(&self, user_id: Uuid) -> Result<()>;

    async fn clear_presence(&self, user_id: Uuid) -> Result<()>;

    /// Connection handle for `user_id`, if a live presence record exists on
    /// any instance.
    async fn presence_handle(&self, user_id: Uuid) -> Result<Option<String>>;

    async fn is_online(&self, user_id: Uuid) -> Result<bool> {
        Ok(self.presence_handle(user_id).await?.is_some())
    }

    async fn set_typing(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()>;

    async fn clear_typing(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()>;

    async fn is_typing(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool>;

    async fn increment_unread(&self, user_id: Uuid, conversation_id: Uuid) -> Result<i64>;

    async fn reset_unread(&self, user_id: Uuid, conversation_id: Uuid) -> Result<()>;

    async fn unread_badge(&self, user_id: Uuid, conversation_id: Uuid) -> Result<i64>;

    /// Count one send attempt in the sender's fixed window and return the
    /// running total, expiry set atomically with the first increment.
    async fn count_send(&self, user_id: Uuid) -> Result<u64>;

    /// Append a fully-formed message payload to the recipient's offline
    /// queue. FIFO; the whole queue expires after the offline retention.
    async fn queue_offline(&self, user_id: Uuid, payload: &str) -> Result<()>;

    /// Atomically take and delete everything in the recipient's offline
    /// queue, oldest first. A second drain returns nothing.
    async fn drain_offline(&self, user_id: Uuid) -> Result<Vec<String>>;

    /// Append a message payload to the conversation's bounded recency cache
    /// and return the cache entry id.
    async fn cache_message(&self, conversation_id: Uuid, payload: &str) -> Result<String>;

    /// Most recent cached payloads for a conversation, newest first.
    async fn recent_messages(&self, conversation_id: Uuid, count: usize) -> Result<Vec<String>>;

    /// Publish a frame on the shared fan-out channel. Every subscribed
    /// instance (including this one) observes it.
    async fn publish(&self, frame: &FanoutFrame) -> Result<()>;

    /// Subscribe to the fan-out stream as seen by this instance.
    fn subscribe(&self) -> broadcast::Receiver<FanoutFrame>;
}

pub(crate) mod keys {
    use uuid::Uuid;

    pub const FANOUT_CHANNEL: &str = "parley:fanout";

    pub fn presence(user_id: Uuid) -> String {
        format!("presence:{user_id}")
    }

    pub fn typing(conversation_id: Uuid, user_id: Uuid) -> String {
        format!("typing:{conversation_id}:{user_id}")
    }

    pub fn unread(user_id: Uuid, conversation_id: Uuid) -> String {
        format!("unread:{user_id}:{conversation_id}")
    }

    pub fn rate_send(user_id: Uuid) -> String {
        format!("rate:send:{user_id}")
    }

    pub fn offline_queue(user_id: Uuid) -> String {
        format!("offline:{user_id}")
    }

    pub fn conversation_cache(conversation_id: Uuid) -> String {
        format!("convcache:{conversation_id}")
    }
}
