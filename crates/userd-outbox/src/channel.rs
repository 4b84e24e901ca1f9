//! Event channel seam and the Redis Streams implementation.

use crate::ChannelError;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::Serialize;
use tracing::{debug, info};
use userd_database::{OutboxEntry, OutboxOperation};

/// Notification payload delivered to the channel.
///
/// `operation` and `email` are the legacy two-field contract; `seq`
/// rides along so consumers can deduplicate redeliveries (the channel
/// is at-least-once).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserEvent {
    pub operation: OutboxOperation,
    pub email: String,
    pub seq: i64,
}

impl UserEvent {
    /// Build the event for an outbox entry.
    pub fn from_entry(entry: &OutboxEntry) -> Self {
        Self {
            operation: entry.operation,
            email: entry.email.clone(),
            seq: entry.seq,
        }
    }
}

/// Publish seam between the dispatcher and the external channel.
///
/// Implementations must surface every failure (timeout, broker
/// unavailable, serialization) as an error; the dispatcher owns the
/// retry policy.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn publish(&self, event: &UserEvent) -> Result<(), ChannelError>;
}

/// Redis Streams event channel.
///
/// Appends each event to a stream with `XADD`. The stream is an
/// append-only log; consumer groups on the other side give downstream
/// consumers at-least-once delivery.
pub struct RedisEventChannel {
    conn: MultiplexedConnection,
    stream_key: String,
}

impl RedisEventChannel {
    /// Connect to Redis and bind to the given stream key.
    pub async fn connect(url: &str, stream_key: impl Into<String>) -> Result<Self, ChannelError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let stream_key = stream_key.into();

        info!(stream = %stream_key, "Connected to event channel");

        Ok(Self { conn, stream_key })
    }

    /// Get the stream key events are appended to.
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }
}

#[async_trait]
impl EventChannel for RedisEventChannel {
    async fn publish(&self, event: &UserEvent) -> Result<(), ChannelError> {
        let mut conn = self.conn.clone();

        let id: String = conn
            .xadd(
                &self.stream_key,
                "*",
                &[
                    ("operation", event.operation.as_str().to_string()),
                    ("email", event.email.clone()),
                    ("seq", event.seq.to_string()),
                ],
            )
            .await?;

        debug!(
            stream = %self.stream_key,
            id = %id,
            seq = event.seq,
            operation = event.operation.as_str(),
            "Published event"
        );

        Ok(())
    }
}
