use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use parley_core::FanoutFrame;

use crate::{CoordSettings, CoordinationStore, FANOUT_CAPACITY};

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

struct WindowCounter {
    count: u64,
    window_ends: Instant,
}

struct CacheStream {
    next_seq: u64,
    entries: VecDeque<(String, String)>,
    expires_at: Instant,
}

/// Single-process coordination store. Used when no Redis is configured (one
/// gateway instance, nothing to share) and throughout the test suite. TTL
/// semantics match the Redis backend: expiry is checked lazily on access.
pub struct InMemoryCoordStore {
    settings: CoordSettings,
    presence: RwLock<HashMap<Uuid, Expiring<String>>>,
    typing: RwLock<HashMap<(Uuid, Uuid), Instant>>,
    unread: RwLock<HashMap<(Uuid, Uuid), i64>>,
    rate: RwLock<HashMap<Uuid, WindowCounter>>,
    offline: RwLock<HashMap<Uuid, Expiring<VecDeque<String>>>>,
    cache: RwLock<HashMap<Uuid, CacheStream>>,
    events: broadcast::Sender<FanoutFrame>,
}

impl InMemoryCoordStore {
    pub fn new(settings: CoordSettings) -> Self {
        let (events, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            settings,
            presence: RwLock::new(HashMap::new()),
            typing: RwLock::new(HashMap::new()),
            unread: RwLock::new(HashMap::new()),
            rate: RwLock::new(HashMap::new()),
            offline: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl Default for InMemoryCoordStore {
    fn default() -> Self {
        Self::new(CoordSettings::default())
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordStore {
    async fn register_presence(&self, user_id: Uuid, handle: &str) -> Result<()> {
        self.presence.write().await.insert(
            user_id,
            Expiring {
                value: handle.to_string(),
                expires_at: Instant::now() + self.settings.presence_ttl,
            },
        );
        Ok(())
    }

    async fn refresh_presence(&self, user_id: Uuid) -> Result<()> {
        if let Some(record) = self.presence.write().await.get_mut(&user_id) {
            if record.live() {
                record.expires_at = Instant::now() + self.settings.presence_ttl;
            }
        }
        Ok(())
    }

    async fn clear_presence(&self, user_id: Uuid) -> Result<()> {
        self.presence.write().await.remove(&user_id);
        Ok(())
    }

    async fn presence_handle(&self, user_id: Uuid) -> Result<Option<String>> {
        let presence = self.presence.read().await;
        Ok(presence
            .get(&user_id)
            .filter(|record| record.live())
            .map(|record| record.value.clone()))
    }

    async fn set_typing(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        self.typing.write().await.insert(
            (conversation_id, user_id),
            Instant::now() + self.settings.typing_ttl,
        );
        Ok(())
    }

    async fn clear_typing(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        self.typing.write().await.remove(&(conversation_id, user_id));
        Ok(())
    }

    async fn is_typing(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        let typing = self.typing.read().await;
        Ok(typing
            .get(&(conversation_id, user_id))
            .is_some_and(|expires_at| Instant::now() < *expires_at))
    }

    async fn increment_unread(&self, user_id: Uuid, conversation_id: Uuid) -> Result<i64> {
        let mut unread = self.unread.write().await;
        let count = unread.entry((user_id, conversation_id)).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn reset_unread(&self, user_id: Uuid, conversation_id: Uuid) -> Result<()> {
        self.unread.write().await.remove(&(user_id, conversation_id));
        Ok(())
    }

    async fn unread_badge(&self, user_id: Uuid, conversation_id: Uuid) -> Result<i64> {
        let unread = self.unread.read().await;
        Ok(unread.get(&(user_id, conversation_id)).copied().unwrap_or(0))
    }

    async fn count_send(&self, user_id: Uuid) -> Result<u64> {
        let mut rate = self.rate.write().await;
        let now = Instant::now();
        let counter = rate.entry(user_id).or_insert(WindowCounter {
            count: 0,
            window_ends: now + self.settings.rate_window,
        });
        if now >= counter.window_ends {
            counter.count = 0;
            counter.window_ends = now + self.settings.rate_window;
        }
        counter.count += 1;
        Ok(counter.count)
    }

    async fn queue_offline(&self, user_id: Uuid, payload: &str) -> Result<()> {
        let mut offline = self.offline.write().await;
        let queue = offline.entry(user_id).or_insert_with(|| Expiring {
            value: VecDeque::new(),
            expires_at: Instant::now() + self.settings.offline_retention,
        });
        if !queue.live() {
            queue.value.clear();
        }
        queue.value.push_back(payload.to_string());
        queue.expires_at = Instant::now() + self.settings.offline_retention;
        Ok(())
    }

    async fn drain_offline(&self, user_id: Uuid) -> Result<Vec<String>> {
        let mut offline = self.offline.write().await;
        let Some(queue) = offline.remove(&user_id) else {
            return Ok(Vec::new());
        };
        if !queue.live() {
            return Ok(Vec::new());
        }
        Ok(queue.value.into_iter().collect())
    }

    async fn cache_message(&self, conversation_id: Uuid, payload: &str) -> Result<String> {
        let mut cache = self.cache.write().await;
        let now = Instant::now();
        let stream = cache.entry(conversation_id).or_insert_with(|| CacheStream {
            next_seq: 0,
            entries: VecDeque::new(),
            expires_at: now + self.settings.cache_retention,
        });
        if now >= stream.expires_at {
            stream.entries.clear();
        }
        let entry_id = format!("{}-0", stream.next_seq);
        stream.next_seq += 1;
        stream.entries.push_back((entry_id.clone(), payload.to_string()));
        while stream.entries.len() > self.settings.cache_max_entries {
            stream.entries.pop_front();
        }
        stream.expires_at = now + self.settings.cache_retention;
        Ok(entry_id)
    }

    async fn recent_messages(&self, conversation_id: Uuid, count: usize) -> Result<Vec<String>> {
        let cache = self.cache.read().await;
        let Some(stream) = cache.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        if Instant::now() >= stream.expires_at {
            return Ok(Vec::new());
        }
        Ok(stream
            .entries
            .iter()
            .rev()
            .take(count)
            .map(|(_, payload)| payload.clone())
            .collect())
    }

    async fn publish(&self, frame: &FanoutFrame) -> Result<()> {
        // No subscribers is fine; frames are fire-and-forget.
        let _ = self.events.send(frame.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<FanoutFrame> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_core::PresenceStatus;
    use std::time::Duration;
    use tokio::time::sleep;

    fn fast_settings() -> CoordSettings {
        CoordSettings {
            presence_ttl: Duration::from_millis(40),
            typing_ttl: Duration::from_millis(40),
            rate_window: Duration::from_millis(60),
            cache_max_entries: 3,
            ..CoordSettings::default()
        }
    }

    #[tokio::test]
    async fn presence_expires_without_refresh() {
        let store = InMemoryCoordStore::new(fast_settings());
        let user = Uuid::new_v4();
        store.register_presence(user, "inst/conn").await.unwrap();
        assert!(store.is_online(user).await.unwrap());

        sleep(Duration::from_millis(60)).await;
        assert!(!store.is_online(user).await.unwrap());
    }

    #[tokio::test]
    async fn refresh_extends_presence() {
        let store = InMemoryCoordStore::new(fast_settings());
        let user = Uuid::new_v4();
        store.register_presence(user, "inst/conn").await.unwrap();

        sleep(Duration::from_millis(25)).await;
        store.refresh_presence(user).await.unwrap();
        sleep(Duration::from_millis(25)).await;
        assert!(store.is_online(user).await.unwrap());
    }

    #[tokio::test]
    async fn typing_marker_self_heals() {
        let store = InMemoryCoordStore::new(fast_settings());
        let conversation = Uuid::new_v4();
        let user = Uuid::new_v4();
        store.set_typing(conversation, user).await.unwrap();
        assert!(store.is_typing(conversation, user).await.unwrap());

        sleep(Duration::from_millis(60)).await;
        assert!(!store.is_typing(conversation, user).await.unwrap());
    }

    #[tokio::test]
    async fn drain_returns_fifo_and_empties_the_queue() {
        let store = InMemoryCoordStore::default();
        let user = Uuid::new_v4();
        store.queue_offline(user, "first").await.unwrap();
        store.queue_offline(user, "second").await.unwrap();

        let drained = store.drain_offline(user).await.unwrap();
        assert_eq!(drained, vec!["first".to_string(), "second".to_string()]);

        // A second drain must not replay anything.
        assert!(store.drain_offline(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rate_counter_rolls_over_with_the_window() {
        let store = InMemoryCoordStore::new(fast_settings());
        let user = Uuid::new_v4();
        assert_eq!(store.count_send(user).await.unwrap(), 1);
        assert_eq!(store.count_send(user).await.unwrap(), 2);

        sleep(Duration::from_millis(80)).await;
        assert_eq!(store.count_send(user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cache_is_bounded_and_newest_first() {
        let store = InMemoryCoordStore::new(fast_settings());
        let conversation = Uuid::new_v4();
        for n in 0..5 {
            store
                .cache_message(conversation, &format!("m{n}"))
                .await
                .unwrap();
        }

        let recent = store.recent_messages(conversation, 10).await.unwrap();
        assert_eq!(recent, vec!["m4", "m3", "m2"]);
    }

    #[tokio::test]
    async fn published_frames_reach_subscribers() {
        let store = InMemoryCoordStore::default();
        let mut rx = store.subscribe();
        let user = Uuid::new_v4();
        store
            .publish(&FanoutFrame::PresenceChanged {
                user_id: user,
                status: PresenceStatus::Online,
                timestamp: Utc::now(),
                recipients: vec![],
            })
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            FanoutFrame::PresenceChanged { user_id, status, .. } => {
                assert_eq!(user_id, user);
                assert_eq!(status, PresenceStatus::Online);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
