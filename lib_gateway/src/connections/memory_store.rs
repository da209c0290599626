//! # In-Memory Repository
//!
//! A `MachineRepository` over a `HashMap`. Nothing survives a restart, which
//! makes it the default when no database URL is configured.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::repository::{MachineRecord, MachineRepository, PollStatus, RepositoryError};

#[derive(Default)]
pub struct InMemoryRepository {
    records: RwLock<HashMap<String, MachineRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store, e.g. with records left behind by a previous run.
    pub fn with_records(records: impl IntoIterator<Item = MachineRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.session_id.clone(), r))
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }
}

#[async_trait]
impl MachineRepository for InMemoryRepository {
    async fn create(&self, record: &MachineRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        if records.values().any(|r| r.endpoint_url == record.endpoint_url) {
            return Err(RepositoryError::Conflict(record.endpoint_url.clone()));
        }
        records.insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn get_by_endpoint(&self, endpoint_url: &str) -> Result<Option<MachineRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.values().find(|r| r.endpoint_url == endpoint_url).cloned())
    }

    async fn get_by_session_id(&self, session_id: &str) -> Result<Option<MachineRecord>, RepositoryError> {
        Ok(self.records.read().await.get(session_id).cloned())
    }

    async fn update_polling_state(
        &self,
        session_id: &str,
        status: PollStatus,
        interval_ms: u64,
    ) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(session_id)
            .ok_or_else(|| RepositoryError::NotFound(session_id.to_string()))?;
        record.status = status;
        record.interval_ms = interval_ms;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), RepositoryError> {
        self.records
            .write()
            .await
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(session_id.to_string()))
    }

    async fn get_all(&self) -> Result<Vec<MachineRecord>, RepositoryError> {
        let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn endpoint_is_unique() {
        let repo = InMemoryRepository::new();
        repo.create(&MachineRecord::connected("a", "10.0.0.1:8193")).await.unwrap();
        let err = repo
            .create(&MachineRecord::connected("b", "10.0.0.1:8193"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_records() {
        let repo = InMemoryRepository::new();
        assert!(matches!(
            repo.update_polling_state("nope", PollStatus::Polled, 1000).await,
            Err(RepositoryError::NotFound(_))
        ));
        assert!(matches!(repo.delete("nope").await, Err(RepositoryError::NotFound(_))));

        repo.create(&MachineRecord::connected("a", "10.0.0.1:8193")).await.unwrap();
        repo.update_polling_state("a", PollStatus::Polled, 2000).await.unwrap();
        let stored = repo.get_by_endpoint("10.0.0.1:8193").await.unwrap().unwrap();
        assert_eq!(stored.status, PollStatus::Polled);
        assert_eq!(stored.interval_ms, 2000);

        repo.delete("a").await.unwrap();
        assert!(repo.get_all().await.unwrap().is_empty());
    }
}
