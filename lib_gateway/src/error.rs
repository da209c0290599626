//! # Gateway Errors
//!
//! The error taxonomy surfaced by the session API. Transport failures on an
//! in-use session never reach this type through the executor; they appear here
//! only from probes and fresh poll connections.

use thiserror::Error;

use crate::connections::{RepositoryError, SinkError};
use crate::driver::DriverError;

/// Convenience alias used across the engine.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The session id is unknown to the pool and to the store.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Connectivity or handle failure outside the executor's retry loop.
    #[error("transport failure: {0}")]
    Transport(#[source] DriverError),

    /// The transport succeeded but the payload was not usable.
    #[error("invalid device data: {0}")]
    Data(String),

    /// The endpoint already has a pooled session.
    #[error("endpoint {endpoint} is already registered as session {session_id}")]
    Duplicate { endpoint: String, session_id: String },

    /// The short connectivity probe during registration failed.
    #[error("connectivity probe to {endpoint} failed: {source}")]
    ProbeFailed {
        endpoint: String,
        #[source]
        source: DriverError,
    },

    /// An on-demand read did not complete within the request deadline.
    #[error("device for session {0} did not answer in time")]
    Timeout(String),

    /// A poller for this session is already running.
    #[error("session {0} is already polling")]
    AlreadyPolling(String),

    /// Process-wide driver initialisation failed.
    #[error("driver startup failed: {0}")]
    FatalStartup(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<DriverError> for GatewayError {
    fn from(err: DriverError) -> Self {
        if err.is_transport() {
            GatewayError::Transport(err)
        } else {
            GatewayError::Data(err.to_string())
        }
    }
}
