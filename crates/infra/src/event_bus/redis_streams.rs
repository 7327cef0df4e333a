//! Redis Streams-backed change event publisher.
//!
//! Each [`ChangeEvent`] is appended with `XADD` to a single stream. A
//! successful `XADD` reply means Redis has accepted the entry into the stream,
//! which is the publisher's notion of "accepted by the channel".
//!
//! ## Entry layout
//!
//! - **Stream Key**: `companies:events` by default
//! - **Fields**: `event_id`, `kind`, `subject_id`, `sequence` (for consumer-side
//!   filtering and dedup) and `payload` (the full event as JSON)
//!
//! Consumers read with `XREADGROUP` and deduplicate on `(subject_id, sequence)`;
//! delivery is at-least-once.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::instrument;

use companies_events::{ChangeEvent, EventPublisher, PublishError};

/// Default stream key for company change events.
pub const DEFAULT_STREAM_KEY: &str = "companies:events";

#[derive(Clone)]
pub struct RedisStreamsPublisher {
    conn: ConnectionManager,
    stream_key: String,
    max_len: Option<usize>,
}

impl std::fmt::Debug for RedisStreamsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsPublisher")
            .field("stream_key", &self.stream_key)
            .field("max_len", &self.max_len)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),
}

impl RedisStreamsPublisher {
    /// Connect to Redis and build a publisher.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `stream_key` - Redis stream key (default: "companies:events")
    pub async fn connect(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            conn,
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            max_len: None,
        })
    }

    /// Cap the stream at roughly `max_len` entries (`XADD MAXLEN ~`).
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Round-trip a `PING`, used by the health check at startup.
    pub async fn ping(&self) -> Result<(), RedisStreamsError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("PING failed: {}", e)))?;
        Ok(())
    }
}

/// Field/value pairs written for one event.
fn stream_fields(event: &ChangeEvent) -> Result<Vec<(&'static str, String)>, PublishError> {
    let payload =
        serde_json::to_string(event).map_err(|e| PublishError::Encode(e.to_string()))?;

    Ok(vec![
        ("event_id", event.event_id().to_string()),
        ("kind", event.kind().as_str().to_string()),
        ("subject_id", event.subject_id().to_string()),
        ("sequence", event.sequence().to_string()),
        ("payload", payload),
    ])
}

#[async_trait]
impl EventPublisher for RedisStreamsPublisher {
    #[instrument(
        skip(self, event),
        fields(
            stream_key = %self.stream_key,
            company_id = %event.subject_id(),
            sequence = event.sequence(),
            kind = event.kind().as_str()
        ),
        err
    )]
    async fn publish(&self, event: &ChangeEvent) -> Result<(), PublishError> {
        let fields = stream_fields(event)?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key);
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*"); // Auto-generate entry ID
        for (field, value) in &fields {
            cmd.arg(*field).arg(value);
        }

        let mut conn = self.conn.clone();
        let _: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| PublishError::Unavailable(format!("XADD failed: {}", e)))?;

        Ok(())
    }
}
