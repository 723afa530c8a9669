use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

/// How often an empty long-poll re-checks the pending list.
const POLL_STEP: Duration = Duration::from_millis(250);

/// A message handed to a consumer. Until it is deleted or dead-lettered it is
/// hidden from other consumers for the visibility timeout, after which it is
/// redelivered.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: String,
    pub handle: DeliveryHandle,
}

/// Queue metadata of a single delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHandle {
    /// Receipt for this delivery only; a redelivery gets a new token.
    pub token: String,
    /// Stable identity of the underlying message.
    pub message_id: String,
    /// How many times the message has been delivered, this one included.
    pub receive_count: u32,
}

/// At-least-once job queue with visibility-timeout redelivery.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a message body. Returns the message id.
    async fn send(&self, body: &str) -> Result<String, QueueError>;

    /// Wait up to `wait` for one message.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge a delivery so it is never redelivered.
    async fn delete(&self, handle: &DeliveryHandle) -> Result<(), QueueError>;

    /// Move a delivery out of the main queue into the dead-letter list.
    async fn dead_letter(&self, handle: &DeliveryHandle, reason: &str) -> Result<(), QueueError>;

    /// Number of messages waiting to be delivered.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// What is stored in Redis for each message.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    id: Uuid,
    body: String,
}

// KEYS: pending, deliveries, inflight, receives. ARGV: token, visible-until millis.
const CLAIM_SCRIPT: &str = r#"
local raw = redis.call('RPOP', KEYS[1])
if not raw then return false end
local id = raw
local ok, envelope = pcall(cjson.decode, raw)
if ok and type(envelope) == 'table' and type(envelope['id']) == 'string' then id = envelope['id'] end
local count = redis.call('HINCRBY', KEYS[4], id, 1)
redis.call('HSET', KEYS[2], ARGV[1], raw)
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[1])
return {raw, count}
"#;

// KEYS: inflight, deliveries, pending. ARGV: now millis.
const RECLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, token in ipairs(expired) do
  local raw = redis.call('HGET', KEYS[2], token)
  redis.call('ZREM', KEYS[1], token)
  redis.call('HDEL', KEYS[2], token)
  if raw then redis.call('RPUSH', KEYS[3], raw) end
end
return #expired
"#;

// KEYS: inflight, deliveries, receives. ARGV: token, message id.
const DELETE_SCRIPT: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
if removed == 1 then redis.call('HDEL', KEYS[3], ARGV[2]) end
return removed
"#;

// KEYS: inflight, deliveries, receives, dead. ARGV: token, message id, reason, now.
const DEAD_LETTER_SCRIPT: &str = r#"
local raw = redis.call('HGET', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
if not raw then return 0 end
redis.call('HDEL', KEYS[3], ARGV[2])
redis.call('LPUSH', KEYS[4], cjson.encode({message = raw, reason = ARGV[3], at = ARGV[4]}))
return 1
"#;

/// Redis-backed job queue.
///
/// Layout under `<namespace>`: `:pending` list (LPUSH in, RPOP out),
/// `:inflight` sorted set of delivery tokens scored by visible-until millis,
/// `:deliveries` hash token → envelope, `:receives` hash message id → count,
/// `:dead` dead-letter list.
pub struct RedisJobQueue {
    client: redis::Client,
    keys: QueueKeys,
    visibility_timeout: Duration,
    claim: redis::Script,
    reclaim: redis::Script,
    delete: redis::Script,
    dead_letter: redis::Script,
}

struct QueueKeys {
    pending: String,
    inflight: String,
    deliveries: String,
    receives: String,
    dead: String,
}

impl QueueKeys {
    fn new(namespace: &str) -> Self {
        Self {
            pending: format!("{namespace}:pending"),
            inflight: format!("{namespace}:inflight"),
            deliveries: format!("{namespace}:deliveries"),
            receives: format!("{namespace}:receives"),
            dead: format!("{namespace}:dead"),
        }
    }
}

impl RedisJobQueue {
    pub fn new(
        redis_url: &str,
        namespace: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            keys: QueueKeys::new(namespace),
            visibility_timeout,
            claim: redis::Script::new(CLAIM_SCRIPT),
            reclaim: redis::Script::new(RECLAIM_SCRIPT),
            delete: redis::Script::new(DELETE_SCRIPT),
            dead_letter: redis::Script::new(DEAD_LETTER_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Return deliveries whose visibility timeout has lapsed to the pending list.
    async fn reclaim_expired(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<u32, QueueError> {
        let now = Utc::now().timestamp_millis();
        let reclaimed: u32 = self
            .reclaim
            .key(&self.keys.inflight)
            .key(&self.keys.deliveries)
            .key(&self.keys.pending)
            .arg(now)
            .invoke_async(conn)
            .await?;

        if reclaimed > 0 {
            tracing::info!(count = reclaimed, "Visibility timeout lapsed, messages returned to queue");
        }
        Ok(reclaimed)
    }

    async fn try_claim(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<Option<Delivery>, QueueError> {
        let token = Uuid::new_v4().to_string();
        let visible_until =
            Utc::now().timestamp_millis() + self.visibility_timeout.as_millis() as i64;

        let claimed: Option<(String, u32)> = self
            .claim
            .key(&self.keys.pending)
            .key(&self.keys.deliveries)
            .key(&self.keys.inflight)
            .key(&self.keys.receives)
            .arg(&token)
            .arg(visible_until)
            .invoke_async(conn)
            .await?;

        Ok(claimed.map(|(raw, receive_count)| {
            let (message_id, body) = match serde_json::from_str::<Envelope>(&raw) {
                Ok(envelope) => (envelope.id.to_string(), envelope.body),
                // Not written by `send`; hand the raw payload to the consumer
                // so it is classified there rather than lost here.
                Err(_) => (raw.clone(), raw),
            };
            Delivery {
                body,
                handle: DeliveryHandle {
                    token,
                    message_id,
                    receive_count,
                },
            }
        }))
    }

    /// Number of dead-lettered messages.
    pub async fn dead_letter_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(&self.keys.dead).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn send(&self, body: &str) -> Result<String, QueueError> {
        let mut conn = self.connection().await?;
        let envelope = Envelope {
            id: Uuid::new_v4(),
            body: body.to_string(),
        };
        let payload = serde_json::to_string(&envelope).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(&self.keys.pending, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(envelope.id.to_string())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        let mut conn = self.connection().await?;

        loop {
            self.reclaim_expired(&mut conn).await?;
            if let Some(delivery) = self.try_claim(&mut conn).await? {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn delete(&self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let removed: u32 = self
            .delete
            .key(&self.keys.inflight)
            .key(&self.keys.deliveries)
            .key(&self.keys.receives)
            .arg(&handle.token)
            .arg(&handle.message_id)
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            // The message has already been returned to the queue and will be
            // delivered again; processing is idempotent so this only costs time.
            tracing::warn!(
                message_id = %handle.message_id,
                "Delete after visibility timeout lapsed, message will be redelivered"
            );
        }
        Ok(())
    }

    async fn dead_letter(&self, handle: &DeliveryHandle, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let moved: u32 = self
            .dead_letter
            .key(&self.keys.inflight)
            .key(&self.keys.deliveries)
            .key(&self.keys.receives)
            .key(&self.keys.dead)
            .arg(&handle.token)
            .arg(&handle.message_id)
            .arg(reason)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        if moved == 0 {
            tracing::warn!(
                message_id = %handle.message_id,
                "Dead-letter after visibility timeout lapsed, message will be redelivered"
            );
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(&self.keys.pending).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
