use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::models::job::JobId;

/// Stream field holding the JSON-encoded [`WorkMessage`].
const PAYLOAD_FIELD: &str = "job";

/// Work message serialized into Redis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkMessage {
    pub job_id: JobId,
    pub image_url: String,
    pub transformations: Vec<String>,
}

/// A message handed to one consumer. Holds the raw payload so it can be acked
/// even when it fails to decode.
#[derive(Debug, Clone)]
pub struct Delivery {
    id: String,
    payload: String,
}

impl Delivery {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }

    /// Broker-assigned message id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn decode(&self) -> Result<WorkMessage, QueueError> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Publishing side of the work queue.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, message: &WorkMessage) -> Result<(), QueueError>;
}

/// Consuming side of the work queue.
///
/// A delivered message stays pending until it is acked or requeued. Pending messages
/// whose consumer went quiet for longer than the visibility timeout can be taken over
/// by any consumer through [`WorkQueue::reclaim`].
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Take the next undelivered message, if any.
    async fn consume(&self) -> Result<Option<Delivery>, QueueError>;

    /// Take over up to `count` pending messages idle for at least `min_idle`.
    async fn reclaim(&self, min_idle: Duration, count: usize) -> Result<Vec<Delivery>, QueueError>;

    /// Remove a delivered message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Hand a delivered message back to the queue for another attempt.
    async fn requeue(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

/// Redis Streams work queue with a consumer group.
///
/// `XREADGROUP` delivers each message to one consumer and records it in the group's
/// pending list until `XACK`. Entries left pending by a crashed or stalled worker are
/// claimed by whichever consumer next runs [`WorkQueue::reclaim`].
pub struct JobQueue {
    client: redis::Client,
    stream: String,
    group: String,
    consumer: String,
}

impl JobQueue {
    pub fn new(redis_url: &str, queue_name: &str, consumer_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            stream: queue_name.to_string(),
            group: format!("{queue_name}:workers"),
            consumer: consumer_name.to_string(),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Create the consumer group if it does not exist yet.
    ///
    /// The group starts at the beginning of the stream so messages published before
    /// the first worker came up are still delivered.
    pub async fn init(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => tracing::info!(group = %self.group, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(group = %self.group, "Consumer group already exists");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    /// Messages in the stream that have not been acked yet (delivered or not).
    pub async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.xlen(&self.stream).await?;
        Ok(depth)
    }
}

fn to_delivery(entry: &StreamId) -> Delivery {
    // Entries without a payload field still need an id so they can be acked
    let payload: String = entry.get(PAYLOAD_FIELD).unwrap_or_default();
    Delivery::new(entry.id.clone(), payload)
}

#[async_trait]
impl JobPublisher for JobQueue {
    async fn publish(&self, message: &WorkMessage) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(message)?;
        redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&payload)
            .query_async::<String>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for JobQueue {
    async fn consume(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next()
            .map(|entry| to_delivery(&entry)))
    }

    async fn reclaim(&self, min_idle: Duration, count: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        // XCLAIM re-checks the idle time, so two consumers racing here cannot both win
        let mut claim = redis::cmd("XCLAIM");
        claim
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle_ms);
        for entry in &pending.ids {
            claim.arg(&entry.id);
        }
        let claimed: StreamClaimReply = claim.query_async(&mut conn).await?;

        Ok(claimed.ids.iter().map(to_delivery).collect())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(delivery.id())
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream)
            .arg(delivery.id())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(delivery.payload())
            .ignore()
            .cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(delivery.id())
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream)
            .arg(delivery.id())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
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
