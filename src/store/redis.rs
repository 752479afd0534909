//! Redis store.
//!
//! Uses `redis::aio::ConnectionManager` for an auto-reconnecting multiplexed
//! connection, cloned per call. Each multi-structure operation is a Lua
//! script so no client ever observes a half-applied step; produce is a
//! `MULTI`/`EXEC` pipeline.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

use super::{millis, score, QueueStats, QueueStore, Take};
use crate::config::RedisSettings;
use crate::error::{QueueError, Result};
use crate::keys::QueueKeys;
use crate::message::Message;

// KEYS: ready, retry, data
// ARGV: now_ms, retry_interval_ms, max_deliveries
static TAKE_ONE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local id = redis.call('LPOP', KEYS[1])
if not id then
  return {'empty'}
end
local row = redis.call('HGET', KEYS[3], id)
if not row then
  redis.call('ZREM', KEYS[2], id)
  return {'empty'}
end
local now = tonumber(ARGV[1])
local ok, msg = pcall(cjson.decode, row)
if ok and type(msg) == 'table' then
  local cnt = tonumber(msg['deliver_cnt']) or 0
  if cnt >= tonumber(ARGV[3]) then
    redis.call('HDEL', KEYS[3], id)
    redis.call('ZREM', KEYS[2], id)
    return {'exhausted', id, tostring(cnt)}
  end
  msg['deliver_cnt'] = cnt + 1
  msg['re_deliver_at'] = now
  row = cjson.encode(msg)
  redis.call('HSET', KEYS[3], id, row)
end
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[2]), id)
return {'taken', row}
"#,
    )
});

// KEYS: retry, data
// ARGV: id
static COMMIT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
redis.call('ZREM', KEYS[1], ARGV[1])
return redis.call('HDEL', KEYS[2], ARGV[1])
"#,
    )
});

// KEYS: retry, data, ready
// ARGV: id, at_ms
static RESCHEDULE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local row = redis.call('HGET', KEYS[2], ARGV[1])
if not row then
  return 0
end
local at = tonumber(ARGV[2])
local ok, msg = pcall(cjson.decode, row)
if ok and type(msg) == 'table' then
  msg['deliver_at'] = at
  redis.call('HSET', KEYS[2], ARGV[1], cjson.encode(msg))
end
redis.call('LREM', KEYS[3], 0, ARGV[1])
redis.call('ZADD', KEYS[1], at, ARGV[1])
return 1
"#,
    )
});

// KEYS: retry, ready
// ARGV: now_ms, limit (at most MAX_PROMOTE_BATCH_SIZE, unpack is argument-bounded)
static PROMOTE_DUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
if #ids == 0 then
  return 0
end
redis.call('ZREM', KEYS[1], unpack(ids))
redis.call('RPUSH', KEYS[2], unpack(ids))
return #ids
"#,
    )
});

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisQueueStore {
    connection_manager: ConnectionManager,
}

impl std::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueStore")
            .field("connection_manager", &"ConnectionManager")
            .finish()
    }
}

impl RedisQueueStore {
    pub async fn connect(settings: &RedisSettings) -> Result<Self> {
        let client = redis::Client::open(settings.url.as_str())
            .map_err(|e| QueueError::Store(format!("Failed to create Redis client: {e}")))?;

        let connection_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Store(format!("Failed to connect to Redis: {e}")))?;

        debug!(url = %settings.redacted_url(), "Redis queue store connected");

        Ok(Self { connection_manager })
    }

    pub fn from_connection_manager(connection_manager: ConnectionManager) -> Self {
        Self { connection_manager }
    }

    pub async fn health_check(&self) -> Result<bool> {
        let mut conn = self.connection_manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Store(format!("Redis PING failed: {e}")))?;
        Ok(pong == "PONG")
    }
}

impl QueueStore for RedisQueueStore {
    async fn produce(&self, keys: &QueueKeys, message: &Message, now: DateTime<Utc>) -> Result<()> {
        let row = message.encode()?;
        let mut conn = self.connection_manager.clone();

        let mut pipe = redis::pipe();
        pipe.atomic().hset(&keys.data, &message.id, row).ignore();
        match message.deliver_at {
            Some(at) if !message.is_immediate(now) => {
                pipe.zadd(&keys.retry, &message.id, score(at)).ignore();
            }
            _ => {
                pipe.rpush(&keys.ready, &message.id).ignore();
            }
        }

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::ProduceFailed(e.to_string()))?;
        Ok(())
    }

    async fn take_one(
        &self,
        keys: &QueueKeys,
        retry_interval: Duration,
        max_deliveries: u64,
        now: DateTime<Utc>,
    ) -> Result<Take> {
        let mut conn = self.connection_manager.clone();
        let reply: Vec<Vec<u8>> = TAKE_ONE
            .key(&keys.ready)
            .key(&keys.retry)
            .key(&keys.data)
            .arg(score(now))
            .arg(millis(retry_interval))
            .arg(max_deliveries)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::TakeFailed(e.to_string()))?;

        parse_take_reply(reply)
    }

    async fn commit(&self, keys: &QueueKeys, id: &str) -> Result<bool> {
        let mut conn = self.connection_manager.clone();
        let removed: i64 = COMMIT
            .key(&keys.retry)
            .key(&keys.data)
            .arg(id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::CommitFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(removed > 0)
    }

    async fn reschedule(&self, keys: &QueueKeys, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.connection_manager.clone();
        let applied: i64 = RESCHEDULE
            .key(&keys.retry)
            .key(&keys.data)
            .key(&keys.ready)
            .arg(id)
            .arg(score(at))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::RescheduleFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(applied == 1)
    }

    async fn promote_due(&self, keys: &QueueKeys, now: DateTime<Utc>, limit: usize) -> Result<usize> {
        let mut conn = self.connection_manager.clone();
        let moved: usize = PROMOTE_DUE
            .key(&keys.retry)
            .key(&keys.ready)
            .arg(score(now))
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::PromoteFailed(e.to_string()))?;
        Ok(moved)
    }

    async fn stats(&self, keys: &QueueKeys) -> Result<QueueStats> {
        let mut conn = self.connection_manager.clone();
        let (ready, pending, stored): (u64, u64, u64) = redis::pipe()
            .llen(&keys.ready)
            .zcard(&keys.retry)
            .hlen(&keys.data)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Store(format!("Redis stats failed: {e}")))?;
        Ok(QueueStats {
            ready,
            pending,
            stored,
        })
    }

    async fn purge(&self, keys: &QueueKeys) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        let _: () = redis::cmd("DEL")
            .arg(&keys.all()[..])
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Store(format!("Redis DEL failed: {e}")))?;
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }
}

fn parse_take_reply(reply: Vec<Vec<u8>>) -> Result<Take> {
    let mut parts = reply.into_iter();
    let tag = parts.next().unwrap_or_default();
    match tag.as_slice() {
        b"empty" => Ok(Take::Empty),
        b"taken" => parts
            .next()
            .map(Take::Taken)
            .ok_or_else(|| QueueError::TakeFailed("take reply missing row".into())),
        b"exhausted" => {
            let id = parts
                .next()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .ok_or_else(|| QueueError::TakeFailed("take reply missing id".into()))?;
            let deliver_cnt = parts
                .next()
                .and_then(|b| String::from_utf8_lossy(&b).parse::<u64>().ok())
                .unwrap_or_default();
            Ok(Take::Exhausted { id, deliver_cnt })
        }
        other => Err(QueueError::TakeFailed(format!(
            "unexpected take reply tag: {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_take_replies() {
        assert_eq!(parse_take_reply(vec![b"empty".to_vec()]).unwrap(), Take::Empty);
        assert_eq!(
            parse_take_reply(vec![b"taken".to_vec(), b"{}".to_vec()]).unwrap(),
            Take::Taken(b"{}".to_vec())
        );
        assert_eq!(
            parse_take_reply(vec![b"exhausted".to_vec(), b"m1".to_vec(), b"4".to_vec()]).unwrap(),
            Take::Exhausted {
                id: "m1".into(),
                deliver_cnt: 4
            }
        );
    }

    #[test]
    fn malformed_take_reply_is_a_take_failure() {
        assert!(matches!(
            parse_take_reply(vec![b"taken".to_vec()]),
            Err(QueueError::TakeFailed(_))
        ));
        assert!(matches!(
            parse_take_reply(vec![b"weird".to_vec()]),
            Err(QueueError::TakeFailed(_))
        ));
        assert!(matches!(parse_take_reply(vec![]), Err(QueueError::TakeFailed(_))));
    }

    // Integration tests require a running Redis instance (behind test-services feature)
    #[cfg(feature = "test-services")]
    mod integration {
        use super::*;
        use crate::message::ProducerMessage;
        use tracing::warn;

        async fn store() -> Option<RedisQueueStore> {
            match RedisQueueStore::connect(&RedisSettings::from_env()).await {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Skipping Redis test (not available): {}", e);
                    None
                }
            }
        }

        #[tokio::test]
        async fn test_take_commit_cycle() {
            let Some(store) = store().await else { return };
            let keys = QueueKeys::new(&format!("test-{}", uuid::Uuid::new_v4()));
            let now = Utc::now();

            let msg = Message::from_producer(ProducerMessage::new(Vec::<u8>::new()), now);
            store.produce(&keys, &msg, now).await.unwrap();

            let taken = store
                .take_one(&keys, Duration::from_secs(5), 4, now)
                .await
                .unwrap();
            let Take::Taken(row) = taken else {
                panic!("expected message, got {taken:?}");
            };
            let decoded = Message::decode(&row).unwrap();
            assert_eq!(decoded.id, msg.id);
            assert_eq!(decoded.deliver_cnt, 1);
            assert!(decoded.payload.is_empty());

            let stats = store.stats(&keys).await.unwrap();
            assert_eq!(stats, QueueStats { ready: 0, pending: 1, stored: 1 });

            assert!(store.commit(&keys, &msg.id).await.unwrap());
            assert!(!store.commit(&keys, &msg.id).await.unwrap());
            assert_eq!(store.stats(&keys).await.unwrap(), QueueStats::default());

            store.purge(&keys).await.unwrap();
        }

        #[tokio::test]
        async fn test_promote_and_reschedule() {
            let Some(store) = store().await else { return };
            let keys = QueueKeys::new(&format!("test-{}", uuid::Uuid::new_v4()));
            let now = Utc::now();

            let msg = Message::from_producer(
                ProducerMessage::new("later").deliver_at(now + chrono::Duration::seconds(60)),
                now,
            );
            store.produce(&keys, &msg, now).await.unwrap();
            assert_eq!(store.promote_due(&keys, now, 10).await.unwrap(), 0);

            assert!(store.reschedule(&keys, &msg.id, now).await.unwrap());
            assert_eq!(store.promote_due(&keys, now, 10).await.unwrap(), 1);
            assert_eq!(store.stats(&keys).await.unwrap().ready, 1);

            store.commit(&keys, &msg.id).await.unwrap();
            assert!(!store.reschedule(&keys, &msg.id, now).await.unwrap());
            store.purge(&keys).await.unwrap();
        }
    }
}
