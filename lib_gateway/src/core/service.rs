//! # Gateway Service
//!
//! The transport-agnostic session API. Owns the driver runtime, the session
//! pool and the polling scheduler, and wires them together.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{info, warn};

use super::aggregator::{Aggregator, PollProfile, Snapshot, StatusView};
use super::executor::LinkSettings;
use super::recovery::{recover, RecoveryReport};
use super::scheduler::{PollSettings, PollingScheduler};
use super::session_pool::{ConnectionCheck, PollControl, PoolSettings, SessionInfo, SessionPool};
use crate::connections::{MachineRepository, PublishSink};
use crate::driver::DriverRuntime;
use crate::error::{GatewayError, GatewayResult};
use crate::models::ControlProgram;

/// Tunables for the whole engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatewaySettings {
    pub probe_timeout: Duration,
    pub poll_connect_timeout: Duration,
    pub link: LinkSettings,
    pub poll_profile: PollProfile,
    /// Deadline for on-demand reads, which would otherwise wait out a
    /// reconnect indefinitely.
    pub request_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(2000),
            poll_connect_timeout: Duration::from_millis(5000),
            link: LinkSettings::default(),
            poll_profile: PollProfile::Full,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct GatewayService {
    runtime: Arc<DriverRuntime>,
    pool: Arc<SessionPool>,
    scheduler: Arc<PollingScheduler>,
    repo: Arc<dyn MachineRepository>,
    sink: Arc<dyn PublishSink>,
    settings: GatewaySettings,
}

impl GatewayService {
    pub fn new(
        runtime: Arc<DriverRuntime>,
        repo: Arc<dyn MachineRepository>,
        sink: Arc<dyn PublishSink>,
        settings: GatewaySettings,
    ) -> Self {
        let driver = runtime.driver();
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&driver),
            Arc::clone(&repo),
            PoolSettings {
                probe_timeout: settings.probe_timeout,
                link: settings.link,
            },
        ));
        let scheduler = Arc::new(PollingScheduler::new(
            driver,
            Arc::clone(&pool),
            Arc::clone(&repo),
            Arc::clone(&sink),
            PollSettings {
                connect_timeout: settings.poll_connect_timeout,
                link: settings.link,
                profile: settings.poll_profile,
            },
        ));
        let control: Weak<dyn PollControl> = Arc::downgrade(&scheduler) as Weak<dyn PollControl>;
        pool.attach_poll_control(control);

        Self {
            runtime,
            pool,
            scheduler,
            repo,
            sink,
            settings,
        }
    }

    /// Initialises the driver (fatal on failure) and recovers stored sessions.
    pub async fn start(&self) -> GatewayResult<RecoveryReport> {
        self.runtime.ensure_started().await?;
        Ok(recover(&self.pool, &self.scheduler, self.repo.as_ref()).await)
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<PollingScheduler> {
        &self.scheduler
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub async fn create_connection(&self, endpoint: &str) -> GatewayResult<SessionInfo> {
        self.pool.create_connection(endpoint).await
    }

    pub async fn get_all_connections(&self) -> Vec<SessionInfo> {
        self.pool.get_all_connections().await
    }

    pub async fn get_connection(&self, session_id: &str) -> GatewayResult<SessionInfo> {
        self.pool.get_connection(session_id).await
    }

    pub async fn delete_connection(&self, session_id: &str) -> GatewayResult<()> {
        self.pool.delete_connection(session_id).await
    }

    pub async fn check_connection(&self, session_id: &str) -> GatewayResult<ConnectionCheck> {
        self.pool.check_connection(session_id).await
    }

    pub async fn start_polling(&self, session_id: &str, interval_ms: u64) -> GatewayResult<()> {
        self.scheduler.start_polling(session_id, interval_ms).await
    }

    pub async fn stop_polling(&self, session_id: &str) -> GatewayResult<()> {
        if !self.pool.contains(session_id).await {
            return Err(GatewayError::NotFound(session_id.to_string()));
        }
        self.scheduler.stop_polling(session_id).await
    }

    pub async fn is_polling_active(&self, session_id: &str) -> bool {
        self.scheduler.is_polling_active(session_id).await
    }

    /// Full snapshot through the session's own link.
    pub async fn read_snapshot(&self, session_id: &str) -> GatewayResult<Snapshot> {
        self.with_deadline(session_id, async {
            let link = self.pool.link(session_id).await?;
            let (strategy, system) = link.model().await;
            Aggregator::new(session_id, link.executor(), strategy, &system)
                .aggregate()
                .await
        })
        .await
    }

    pub async fn read_status(&self, session_id: &str) -> GatewayResult<StatusView> {
        self.with_deadline(session_id, async {
            let link = self.pool.link(session_id).await?;
            let (strategy, system) = link.model().await;
            Aggregator::new(session_id, link.executor(), strategy, &system)
                .status_view()
                .await
        })
        .await
    }

    /// Uploads the active control program.
    pub async fn read_control_program(&self, session_id: &str) -> GatewayResult<ControlProgram> {
        self.with_deadline(session_id, async {
            let link = self.pool.link(session_id).await?;
            let (strategy, _) = link.model().await;
            strategy.program_reader.get_control_program(link.executor()).await
        })
        .await
    }

    /// Bounds an on-demand read and counts it as a use of the session.
    async fn with_deadline<T>(&self, session_id: &str, read: impl Future<Output = GatewayResult<T>>) -> GatewayResult<T> {
        let result = tokio::time::timeout(self.settings.request_timeout, read)
            .await
            .map_err(|_| GatewayError::Timeout(session_id.to_string()))?;
        self.pool.touch(session_id, None).await;
        result
    }

    /// Stops all pollers (stored state is kept for the next start), closes
    /// device links and the sink.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.pool.close_all().await;
        if let Err(e) = self.sink.close().await {
            warn!(error = %e, "sink close failed");
        }
        info!("gateway service stopped");
    }
}
