//! # Publish Sink
//!
//! Where poll results go. The key is always the session id so downstream
//! consumers can partition and order per machine.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink is closed")]
    Closed,
    #[error("sink backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn produce(&self, key: &str, payload: Bytes) -> Result<(), SinkError>;

    async fn close(&self) -> Result<(), SinkError>;
}

/// Forwards every message into a tokio channel.
pub struct ChannelSink {
    tx: mpsc::Sender<(String, Bytes)>,
    closed: AtomicBool,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<(String, Bytes)>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }
}

#[async_trait]
impl PublishSink for ChannelSink {
    async fn produce(&self, key: &str, payload: Bytes) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        self.tx
            .send((key.to_string(), payload))
            .await
            .map_err(|_| SinkError::Closed)
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Drops every message after logging it. Used when no broker is configured.
#[derive(Default)]
pub struct LogSink;

#[async_trait]
impl PublishSink for LogSink {
    async fn produce(&self, key: &str, payload: Bytes) -> Result<(), SinkError> {
        debug!(session_id = key, bytes = payload.len(), "snapshot produced");
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        info!("log sink closed");
        Ok(())
    }
}
