//! # Machine Repository Contract
//!
//! Durable session and poll state. One record per registered endpoint.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persisted poll state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Connected,
    Polled,
}

impl PollStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Connected => "connected",
            PollStatus::Polled => "polled",
        }
    }
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PollStatus {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(PollStatus::Connected),
            "polled" => Ok(PollStatus::Polled),
            other => Err(RepositoryError::Backend(format!("unknown poll status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub session_id: String,
    /// Unique across records.
    pub endpoint_url: String,
    pub status: PollStatus,
    pub interval_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MachineRecord {
    /// A fresh record in the `connected` state.
    pub fn connected(session_id: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            endpoint_url: endpoint_url.into(),
            status: PollStatus::Connected,
            interval_ms: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("endpoint already stored: {0}")]
    Conflict(String),
    #[error("repository backend error: {0}")]
    Backend(String),
}

/// The persistence gateway used by the session pool and the scheduler.
#[async_trait]
pub trait MachineRepository: Send + Sync {
    /// Stores a new record. Fails with `Conflict` if the endpoint is taken.
    async fn create(&self, record: &MachineRecord) -> Result<(), RepositoryError>;

    async fn get_by_endpoint(&self, endpoint_url: &str) -> Result<Option<MachineRecord>, RepositoryError>;

    async fn get_by_session_id(&self, session_id: &str) -> Result<Option<MachineRecord>, RepositoryError>;

    /// Fails with `NotFound` if no record has this id.
    async fn update_polling_state(
        &self,
        session_id: &str,
        status: PollStatus,
        interval_ms: u64,
    ) -> Result<(), RepositoryError>;

    /// Fails with `NotFound` if no record has this id.
    async fn delete(&self, session_id: &str) -> Result<(), RepositoryError>;

    async fn get_all(&self) -> Result<Vec<MachineRecord>, RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_status_text_matches_the_stored_column() {
        for status in [PollStatus::Connected, PollStatus::Polled] {
            assert_eq!(status.as_str().parse::<PollStatus>().unwrap(), status);
            assert_eq!(serde_json::to_string(&status).unwrap(), format!("\"{status}\""));
        }
        assert!("POLLED".parse::<PollStatus>().is_err());
    }
}
