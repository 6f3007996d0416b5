use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::streams::{StreamMaxlen, StreamRangeReply};
use redis::AsyncCommands;
use tokio::sync::broadcast;
use uuid::Uuid;

use parley_core::FanoutFrame;

use crate::{keys, CoordSettings, CoordinationStore, FANOUT_CAPACITY};

const SUBSCRIBER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Coordination store backed by Redis. One multiplexed connection serves the
/// key/value and counter traffic; a dedicated pub/sub connection pumps the
/// fan-out channel into a local broadcast stream.
pub struct RedisCoordStore {
    conn: redis::aio::MultiplexedConnection,
    settings: CoordSettings,
    events: broadcast::Sender<FanoutFrame>,
}

impl RedisCoordStore {
    pub async fn connect(url: &str, settings: CoordSettings) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to redis")?;

        let (events, _) = broadcast::channel(FANOUT_CAPACITY);
        tokio::spawn(run_subscriber(client, events.clone()));

        Ok(Self {
            conn,
            settings,
            events,
        })
    }

    fn conn(&self) -> redis::aio::MultiplexedConnection {
        self.conn.clone()
    }
}

/// Keep the fan-out subscription alive across broken connections. Frames
/// published while the subscription is down are lost; clients recover state
/// on reconnect, so this degrades rather than fails.
async fn run_subscriber(client: redis::Client, events: broadcast::Sender<FanoutFrame>) {
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                if let Err(err) = pubsub.subscribe(keys::FANOUT_CHANNEL).await {
                    tracing::warn!(?err, "failed to subscribe to fan-out channel");
                } else {
                    let mut stream = pubsub.on_message();
                    while let Some(msg) = stream.next().await {
                        let payload: String = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(err) => {
                                tracing::warn!(?err, "non-text frame on fan-out channel");
                                continue;
                            }
                        };
                        match serde_json::from_str::<FanoutFrame>(&payload) {
                            Ok(frame) => {
                                let _ = events.send(frame);
                            }
                            Err(err) => {
                                tracing::warn!(?err, "undecodable fan-out frame");
                            }
                        }
                    }
                    tracing::warn!("fan-out subscription ended; reconnecting");
                }
            }
            Err(err) => {
                tracing::warn!(?err, "fan-out subscriber cannot reach redis");
            }
        }
        tokio::time::sleep(SUBSCRIBER_RETRY_DELAY).await;
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CoordinationStore for RedisCoordStore {
    async fn register_presence(&self, user_id: Uuid, handle: &str) -> Result<()> {
        let mut conn = self.conn();
        let () = conn
            .set_ex(
                keys::presence(user_id),
                handle,
                ttl_secs(self.settings.presence_ttl),
            )
            .await?;
        Ok(())
    }

    async fn refresh_presence(&self, user_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let _: bool = conn
            .expire(
                keys::presence(user_id),
                ttl_secs(self.settings.presence_ttl) as i64,
            )
            .await?;
        Ok(())
    }

    async fn clear_presence(&self, user_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let () = conn.del(keys::presence(user_id)).await?;
        Ok(())
    }

    async fn presence_handle(&self, user_id: Uuid) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.get(keys::presence(user_id)).await?)
    }

    async fn set_typing(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let () = conn
            .set_ex(
                keys::typing(conversation_id, user_id),
                1,
                ttl_secs(self.settings.typing_ttl),
            )
            .await?;
        Ok(())
    }

    async fn clear_typing(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let () = conn.del(keys::typing(conversation_id, user_id)).await?;
        Ok(())
    }

    async fn is_typing(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        let mut conn = self.conn();
        Ok(conn.exists(keys::typing(conversation_id, user_id)).await?)
    }

    async fn increment_unread(&self, user_id: Uuid, conversation_id: Uuid) -> Result<i64> {
        let mut conn = self.conn();
        Ok(conn.incr(keys::unread(user_id, conversation_id), 1).await?)
    }

    async fn reset_unread(&self, user_id: Uuid, conversation_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let () = conn.del(keys::unread(user_id, conversation_id)).await?;
        Ok(())
    }

    async fn unread_badge(&self, user_id: Uuid, conversation_id: Uuid) -> Result<i64> {
        let mut conn = self.conn();
        let count: Option<i64> = conn.get(keys::unread(user_id, conversation_id)).await?;
        Ok(count.unwrap_or(0))
    }

    async fn count_send(&self, user_id: Uuid) -> Result<u64> {
        // INCR and first-increment EXPIRE must be one atomic step, otherwise
        // a crash between the two leaves a counter that never expires.
        let script = redis::Script::new(
            r"
            local count = redis.call('INCR', KEYS[1])
            if count == 1 then
                redis.call('EXPIRE', KEYS[1], ARGV[1])
            end
            return count
            ",
        );
        let mut conn = self.conn();
        let count: u64 = script
            .key(keys::rate_send(user_id))
            .arg(ttl_secs(self.settings.rate_window))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn queue_offline(&self, user_id: Uuid, payload: &str) -> Result<()> {
        let key = keys::offline_queue(user_id);
        let mut conn = self.conn();
        let () = redis::pipe()
            .atomic()
            .rpush(&key, payload)
            .ignore()
            .expire(&key, ttl_secs(self.settings.offline_retention) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn drain_offline(&self, user_id: Uuid) -> Result<Vec<String>> {
        // Read-and-delete in one script so a reconnect racing a replay can
        // never deliver the same queue twice.
        let script = redis::Script::new(
            r"
            local items = redis.call('LRANGE', KEYS[1], 0, -1)
            redis.call('DEL', KEYS[1])
            return items
            ",
        );
        let mut conn = self.conn();
        let items: Vec<String> = script
            .key(keys::offline_queue(user_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn cache_message(&self, conversation_id: Uuid, payload: &str) -> Result<String> {
        let key = keys::conversation_cache(conversation_id);
        let mut conn = self.conn();
        let entry_id: String = conn
            .xadd_maxlen(
                &key,
                StreamMaxlen::Approx(self.settings.cache_max_entries),
                "*",
                &[("payload", payload)],
            )
            .await?;
        let _: bool = conn
            .expire(&key, ttl_secs(self.settings.cache_retention) as i64)
            .await?;
        Ok(entry_id)
    }

    async fn recent_messages(&self, conversation_id: Uuid, count: usize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let reply: StreamRangeReply = conn
            .xrevrange_count(keys::conversation_cache(conversation_id), "+", "-", count)
            .await?;
        let payloads = reply
            .ids
            .iter()
            .filter_map(|entry| entry.get::<String>("payload"))
            .collect();
        Ok(payloads)
    }

    async fn publish(&self, frame: &FanoutFrame) -> Result<()> {
        let payload = serde_json::to_string(frame)?;
        let mut conn = self.conn();
        let _: i64 = conn.publish(keys::FANOUT_CHANNEL, payload).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<FanoutFrame> {
        self.events.subscribe()
    }
}
