//! # Redis Stream Sink
//!
//! Publishes each snapshot as one entry on a Redis stream with the fields
//! `key` (session id) and `value` (JSON payload). Uses a
//! `ConnectionManager`, which reconnects on its own after broker restarts.

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};
use tracing::{debug, info};

use super::sink::{PublishSink, SinkError};

pub struct RedisSink {
    conn: ConnectionManager,
    stream_key: String,
    max_len: Option<usize>,
}

impl RedisSink {
    /// Opens the managed connection.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    /// * `stream_key` - Stream the entries are appended to.
    pub async fn connect(url: &str, stream_key: impl Into<String>) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let stream_key = stream_key.into();
        info!(stream = %stream_key, "connected to redis");
        Ok(Self {
            conn,
            stream_key,
            max_len: None,
        })
    }

    /// Caps the stream at roughly `max_len` entries.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }
}

#[async_trait]
impl PublishSink for RedisSink {
    async fn produce(&self, key: &str, payload: Bytes) -> Result<(), SinkError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key);
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*").arg("key").arg(key).arg("value").arg(payload.as_ref());

        let id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| SinkError::Backend(e.to_string()))?;
        debug!(session_id = key, entry = %id, "snapshot appended to stream");
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        info!(stream = %self.stream_key, "redis sink closed");
        Ok(())
    }
}
