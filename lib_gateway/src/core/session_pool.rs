//! # Session Pool
//!
//! Concurrent-safe registry of logical sessions. A session outlives any single
//! connection: it is keyed by a generated id and keeps its endpoint, health
//! and usage counters. Device access for on-demand reads goes through a
//! per-session `ResilientExecutor` created on first use.
//!
//! One reader-writer lock guards the map. Probes and device reads never run
//! while it is held.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::{LinkSettings, ResilientExecutor};
use crate::connections::{MachineRecord, MachineRepository, PollStatus, RepositoryError};
use crate::driver::{DeviceDriver, DriverError, Endpoint, SystemInfo};
use crate::error::{GatewayError, GatewayResult};
use crate::models::{resolve, ModelStrategy};

/// What the pool needs from the polling scheduler.
#[async_trait]
pub trait PollControl: Send + Sync {
    /// Stops the poller for `session_id` without touching the store.
    async fn stop_polling_for_machine(&self, session_id: &str);
}

/// Public view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub endpoint: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub use_count: u64,
    pub is_healthy: bool,
    pub poll_status: PollStatus,
    pub poll_interval_ms: u64,
}

/// Result of `check_connection`: the info is always present.
#[derive(Debug)]
pub struct ConnectionCheck {
    pub info: SessionInfo,
    pub probe_error: Option<GatewayError>,
}

/// The device side of a session: its executor and the model strategy
/// resolved from the first system-info read.
pub struct SessionLink {
    executor: ResilientExecutor,
    model: OnceCell<(ModelStrategy, SystemInfo)>,
}

impl SessionLink {
    pub fn executor(&self) -> &ResilientExecutor {
        &self.executor
    }

    /// Strategy and system info, read once per session. A failed read falls
    /// back to the default strategy and is retried on the next call.
    pub async fn model(&self) -> (ModelStrategy, SystemInfo) {
        if let Some(model) = self.model.get() {
            return model.clone();
        }
        match self
            .executor
            .execute(|d, h| async move { d.read_system_info(h).await })
            .await
        {
            Ok(system) => {
                let strategy = resolve(&system.series);
                info!(endpoint = %self.executor.endpoint(), series = %system.series, family = %strategy.family, "model resolved");
                let _ = self.model.set((strategy, system.clone()));
                (strategy, system)
            }
            Err(e) => {
                warn!(endpoint = %self.executor.endpoint(), error = %e, "system info unavailable, using default model");
                Default::default()
            }
        }
    }
}

struct SessionEntry {
    endpoint: Endpoint,
    created_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
    use_count: u64,
    is_healthy: bool,
    poll_status: PollStatus,
    poll_interval_ms: u64,
    link: Option<Arc<SessionLink>>,
}

impl SessionEntry {
    fn info(&self, session_id: &str) -> SessionInfo {
        let link_healthy = self.link.as_ref().map_or(true, |l| l.executor.is_healthy());
        SessionInfo {
            session_id: session_id.to_string(),
            endpoint: self.endpoint.to_string(),
            created_at: self.created_at,
            last_used: self.last_used,
            use_count: self.use_count,
            is_healthy: self.is_healthy && link_healthy,
            poll_status: self.poll_status,
            poll_interval_ms: self.poll_interval_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolSettings {
    /// Bound on the connectivity probe used by create/restore/check.
    pub probe_timeout: Duration,
    pub link: LinkSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(2000),
            link: LinkSettings::default(),
        }
    }
}

pub struct SessionPool {
    driver: Arc<dyn DeviceDriver>,
    repo: Arc<dyn MachineRepository>,
    settings: PoolSettings,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    /// Serialises registrations so two requests cannot race for one endpoint.
    create_lock: Mutex<()>,
    poll_control: OnceLock<Weak<dyn PollControl>>,
}

impl SessionPool {
    pub fn new(driver: Arc<dyn DeviceDriver>, repo: Arc<dyn MachineRepository>, settings: PoolSettings) -> Self {
        Self {
            driver,
            repo,
            settings,
            sessions: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            poll_control: OnceLock::new(),
        }
    }

    /// Wires the scheduler in. Only the first call has an effect.
    pub fn attach_poll_control(&self, control: Weak<dyn PollControl>) {
        let _ = self.poll_control.set(control);
    }

    /// Connects with the probe timeout and disconnects right away.
    async fn probe(&self, endpoint: &Endpoint) -> Result<(), DriverError> {
        let handle = self.driver.connect(endpoint, self.settings.probe_timeout).await?;
        if let Err(e) = self.driver.disconnect(handle).await {
            debug!(endpoint = %endpoint, error = %e, "probe disconnect failed");
        }
        Ok(())
    }

    pub async fn create_connection(&self, endpoint: &str) -> GatewayResult<SessionInfo> {
        let endpoint: Endpoint = endpoint
            .parse()
            .map_err(|e: crate::driver::EndpointError| GatewayError::Validation(e.to_string()))?;
        let endpoint_url = endpoint.to_string();
        let _creating = self.create_lock.lock().await;

        {
            let sessions = self.sessions.read().await;
            if let Some((id, _)) = sessions.iter().find(|(_, e)| e.endpoint == endpoint) {
                return Err(GatewayError::Duplicate {
                    endpoint: endpoint_url,
                    session_id: id.clone(),
                });
            }
        }

        if let Some(stale) = self.repo.get_by_endpoint(&endpoint_url).await? {
            if self.sessions.read().await.contains_key(&stale.session_id) {
                return Err(GatewayError::Duplicate {
                    endpoint: endpoint_url,
                    session_id: stale.session_id,
                });
            }
            warn!(endpoint = %endpoint_url, session_id = %stale.session_id, "removing stale record without a pooled session");
            match self.repo.delete(&stale.session_id).await {
                Ok(()) | Err(RepositoryError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.probe(&endpoint)
            .await
            .map_err(|source| GatewayError::ProbeFailed {
                endpoint: endpoint_url.clone(),
                source,
            })?;

        let session_id = Uuid::new_v4().to_string();
        let record = MachineRecord::connected(session_id.clone(), endpoint_url.clone());
        self.repo.create(&record).await?;

        let entry = SessionEntry {
            endpoint,
            created_at: record.created_at,
            last_used: record.created_at,
            use_count: 1,
            is_healthy: true,
            poll_status: PollStatus::Connected,
            poll_interval_ms: 0,
            link: None,
        };
        let info = entry.info(&session_id);
        self.sessions.write().await.insert(session_id.clone(), entry);

        info!(session_id = %session_id, endpoint = %endpoint_url, "session created");
        Ok(info)
    }

    /// Rebuilds a session from its persisted record under the same id. An
    /// unreachable device gives an unhealthy session, not an error; only a
    /// corrupt endpoint is rejected.
    pub async fn restore_connection(&self, record: &MachineRecord) -> GatewayResult<SessionInfo> {
        let endpoint: Endpoint = record
            .endpoint_url
            .parse()
            .map_err(|e| GatewayError::Validation(format!("stored endpoint for {}: {e}", record.session_id)))?;

        let healthy = match self.probe(&endpoint).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %record.session_id, endpoint = %endpoint, error = %e, "restored session is unreachable");
                false
            }
        };

        let entry = SessionEntry {
            endpoint,
            created_at: record.created_at,
            last_used: Utc::now(),
            use_count: 0,
            is_healthy: healthy,
            poll_status: record.status,
            poll_interval_ms: record.interval_ms,
            link: None,
        };
        let info = entry.info(&record.session_id);
        if let Some(old) = self.sessions.write().await.insert(record.session_id.clone(), entry) {
            if let Some(link) = old.link {
                link.executor.cancel();
            }
        }
        info!(session_id = %record.session_id, healthy, "session restored");
        Ok(info)
    }

    pub async fn get_connection(&self, session_id: &str) -> GatewayResult<SessionInfo> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.info(session_id))
            .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))
    }

    pub async fn get_all_connections(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<_> = sessions.iter().map(|(id, e)| e.info(id)).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn endpoint_of(&self, session_id: &str) -> Option<Endpoint> {
        self.sessions.read().await.get(session_id).map(|e| e.endpoint.clone())
    }

    /// Stops any poller, then drops the session from the pool and the store.
    pub async fn delete_connection(&self, session_id: &str) -> GatewayResult<()> {
        // The poller must be gone before the entry disappears.
        if let Some(control) = self.poll_control.get().and_then(Weak::upgrade) {
            control.stop_polling_for_machine(session_id).await;
        }

        let removed = self.sessions.write().await.remove(session_id);
        match removed {
            None => match self.repo.delete(session_id).await {
                Ok(()) => {
                    info!(session_id, "stored record deleted for unpooled session");
                    Ok(())
                }
                Err(RepositoryError::NotFound(_)) => Err(GatewayError::NotFound(session_id.to_string())),
                Err(e) => Err(e.into()),
            },
            Some(entry) => {
                if let Some(link) = entry.link {
                    link.executor.cancel();
                    link.executor.close().await;
                }
                match self.repo.delete(session_id).await {
                    Ok(()) | Err(RepositoryError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                info!(session_id, endpoint = %entry.endpoint, "session deleted");
                Ok(())
            }
        }
    }

    /// Fresh probe. Health, use count and last use are updated either way.
    pub async fn check_connection(&self, session_id: &str) -> GatewayResult<ConnectionCheck> {
        let endpoint = self
            .endpoint_of(session_id)
            .await
            .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))?;

        let probe = self.probe(&endpoint).await;
        let healthy = probe.is_ok();

        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))?;
        if entry.is_healthy != healthy {
            info!(session_id, was = entry.is_healthy, now = healthy, "session health changed");
        }
        entry.is_healthy = healthy;
        entry.last_used = Utc::now();
        entry.use_count += 1;

        Ok(ConnectionCheck {
            info: entry.info(session_id),
            probe_error: probe.err().map(|source| GatewayError::ProbeFailed {
                endpoint: endpoint.to_string(),
                source,
            }),
        })
    }

    /// Records one use of the session, optionally with its observed health.
    /// Unknown ids are ignored.
    pub async fn touch(&self, session_id: &str, healthy: Option<bool>) {
        if let Some(entry) = self.sessions.write().await.get_mut(session_id) {
            entry.last_used = Utc::now();
            entry.use_count += 1;
            if let Some(h) = healthy {
                entry.is_healthy = h;
            }
        }
    }

    /// Mirrors the scheduler's view of the session. Unknown ids are ignored.
    pub async fn set_poll_state(&self, session_id: &str, status: PollStatus, interval_ms: u64) {
        if let Some(entry) = self.sessions.write().await.get_mut(session_id) {
            entry.poll_status = status;
            entry.poll_interval_ms = interval_ms;
        }
    }

    /// The session's device link, created on first use. The first connect
    /// runs outside the lock; if it fails the link starts without a handle
    /// and reconnects on its first call.
    pub async fn link(&self, session_id: &str) -> GatewayResult<Arc<SessionLink>> {
        let endpoint = {
            let sessions = self.sessions.read().await;
            let entry = sessions
                .get(session_id)
                .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))?;
            if let Some(link) = &entry.link {
                return Ok(Arc::clone(link));
            }
            entry.endpoint.clone()
        };

        let link_settings = self.settings.link;
        let executor = match ResilientExecutor::connect(
            Arc::clone(&self.driver),
            endpoint.clone(),
            link_settings,
            link_settings.connect_timeout,
        )
        .await
        {
            Ok(executor) => executor,
            Err(e) => {
                debug!(session_id, endpoint = %endpoint, error = %e, "initial link connect failed");
                ResilientExecutor::new(Arc::clone(&self.driver), endpoint, link_settings)
            }
        };

        let mut sessions = self.sessions.write().await;
        let existing = match sessions.get_mut(session_id) {
            None => Err(GatewayError::NotFound(session_id.to_string())),
            Some(entry) => match entry.link.clone() {
                Some(link) => Ok(link),
                None => {
                    let link = Arc::new(SessionLink {
                        executor,
                        model: OnceCell::new(),
                    });
                    entry.link = Some(Arc::clone(&link));
                    return Ok(link);
                }
            },
        };
        drop(sessions);

        // Lost the race, or the session went away meanwhile.
        executor.close().await;
        existing
    }

    /// Closes every device link. Sessions stay registered.
    pub async fn close_all(&self) {
        let links: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .filter_map(|e| e.link.clone())
            .collect();
        for link in links {
            link.executor.cancel();
            link.executor.close().await;
        }
    }
}
