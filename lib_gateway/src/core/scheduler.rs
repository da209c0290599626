//! # Polling Scheduler
//!
//! One task per actively polled session, each ticking at its own interval.
//! A tick opens a fresh connection with a bounded timeout, reads either the
//! full snapshot or the status view, always disconnects, then serialises and
//! publishes the result keyed by session id. The tick connection never
//! reconnects: a transport failure marks the session unhealthy and the tick
//! is logged and skipped. The next tick runs as usual.
//!
//! The active-poll map holds at most one `PollHandle` per session id. A stop
//! signal is observed at the next tick boundary; a tick already running is
//! allowed to finish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::aggregator::{Aggregator, PollProfile};
use super::executor::{LinkSettings, ResilientExecutor};
use super::session_pool::{PollControl, SessionPool};
use crate::connections::{MachineRepository, PollStatus, PublishSink, RepositoryError};
use crate::driver::{DeviceDriver, Endpoint, SystemInfo};
use crate::error::{GatewayError, GatewayResult};
use crate::models::{resolve, ModelStrategy};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    /// Bound on the per-tick connect.
    pub connect_timeout: Duration,
    pub link: LinkSettings,
    pub profile: PollProfile,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            link: LinkSettings::default(),
            profile: PollProfile::Full,
        }
    }
}

/// Registration of one running poller.
struct PollHandle {
    interval: Duration,
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct PollingScheduler {
    driver: Arc<dyn DeviceDriver>,
    pool: Arc<SessionPool>,
    repo: Arc<dyn MachineRepository>,
    sink: Arc<dyn PublishSink>,
    settings: PollSettings,
    active: Mutex<HashMap<String, PollHandle>>,
    /// Finished or stopped tasks waiting to be joined at shutdown.
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingScheduler {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        pool: Arc<SessionPool>,
        repo: Arc<dyn MachineRepository>,
        sink: Arc<dyn PublishSink>,
        settings: PollSettings,
    ) -> Self {
        Self {
            driver,
            pool,
            repo,
            sink,
            settings,
            active: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Persists `polled` with the interval and spawns the poller.
    pub async fn start_polling(&self, session_id: &str, interval_ms: u64) -> GatewayResult<()> {
        if interval_ms == 0 {
            return Err(GatewayError::Validation("polling interval must be greater than zero".to_string()));
        }
        let endpoint = self
            .pool
            .endpoint_of(session_id)
            .await
            .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))?;

        let mut active = self.active.lock().await;
        if active.contains_key(session_id) {
            return Err(GatewayError::AlreadyPolling(session_id.to_string()));
        }

        self.repo
            .update_polling_state(session_id, PollStatus::Polled, interval_ms)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound(_) => GatewayError::NotFound(session_id.to_string()),
                other => other.into(),
            })?;
        self.pool.set_poll_state(session_id, PollStatus::Polled, interval_ms).await;

        let interval = Duration::from_millis(interval_ms);
        let token = CancellationToken::new();
        let poller = Poller {
            session_id: session_id.to_string(),
            endpoint,
            driver: Arc::clone(&self.driver),
            pool: Arc::clone(&self.pool),
            sink: Arc::clone(&self.sink),
            settings: self.settings,
            model: None,
        };
        let task = tokio::spawn(poller.run(interval, token.clone()));
        active.insert(session_id.to_string(), PollHandle { interval, token, task });

        info!(session_id, interval_ms, profile = %self.settings.profile, "polling started");
        Ok(())
    }

    /// Persists `connected` and stops the poller. Stopping a session that is
    /// not polling is not an error.
    pub async fn stop_polling(&self, session_id: &str) -> GatewayResult<()> {
        if let Err(e) = self
            .repo
            .update_polling_state(session_id, PollStatus::Connected, 0)
            .await
        {
            error!(session_id, error = %e, "failed to persist stopped polling state");
        }
        self.stop_polling_for_machine(session_id).await;
        // A restored session may carry a polled state with no poller behind it.
        self.pool.set_poll_state(session_id, PollStatus::Connected, 0).await;
        Ok(())
    }

    pub async fn is_polling_active(&self, session_id: &str) -> bool {
        self.active.lock().await.contains_key(session_id)
    }

    /// Interval of the running poller, if any.
    pub async fn poll_interval(&self, session_id: &str) -> Option<Duration> {
        self.active.lock().await.get(session_id).map(|p| p.interval)
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Stops every poller without touching the store, so a restart resumes
    /// them, and waits for the tasks to end.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.active.lock().await.drain().collect();
        let mut tasks = std::mem::take(&mut *self.retired.lock().await);
        for (session_id, handle) in handles {
            handle.token.cancel();
            debug!(session_id = %session_id, "poller signalled for shutdown");
            tasks.push(handle.task);
        }
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "poll task ended abnormally");
            }
        }
        info!("polling scheduler stopped");
    }
}

#[async_trait]
impl PollControl for PollingScheduler {
    async fn stop_polling_for_machine(&self, session_id: &str) {
        let removed = self.active.lock().await.remove(session_id);
        if let Some(handle) = removed {
            handle.token.cancel();
            let mut retired = self.retired.lock().await;
            retired.retain(|t| !t.is_finished());
            retired.push(handle.task);
            drop(retired);
            self.pool.set_poll_state(session_id, PollStatus::Connected, 0).await;
            info!(session_id, "polling stopped");
        }
    }
}

/// State owned by one poll task.
struct Poller {
    session_id: String,
    endpoint: Endpoint,
    driver: Arc<dyn DeviceDriver>,
    pool: Arc<SessionPool>,
    sink: Arc<dyn PublishSink>,
    settings: PollSettings,
    /// Resolved on the first tick that reads system info.
    model: Option<(ModelStrategy, SystemInfo)>,
}

impl Poller {
    async fn run(mut self, period: Duration, token: CancellationToken) {
        info!(session_id = %self.session_id, endpoint = %self.endpoint, ?period, "poll task started");
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                warn!(session_id = %self.session_id, error = %e, "poll tick skipped");
            }
        }
        info!(session_id = %self.session_id, "poll task stopped");
    }

    async fn tick(&mut self) -> GatewayResult<()> {
        let executor = match ResilientExecutor::connect(
            Arc::clone(&self.driver),
            self.endpoint.clone(),
            self.settings.link,
            self.settings.connect_timeout,
        )
        .await
        {
            Ok(executor) => executor.without_reconnect(),
            Err(e) => {
                self.pool.touch(&self.session_id, Some(false)).await;
                return Err(GatewayError::Transport(e));
            }
        };
        debug!(session_id = %self.session_id, "connected for poll tick");

        let payload = self.collect(&executor).await;
        let link_error = executor.link_error().await;
        executor.close().await;
        self.pool.touch(&self.session_id, Some(link_error.is_none())).await;

        // A dropped link means a partial payload, which is never published.
        if let Some(e) = link_error {
            return Err(GatewayError::Transport(e));
        }
        let payload = Bytes::from(payload?);
        self.sink.produce(&self.session_id, payload).await?;
        Ok(())
    }

    /// Reads and serialises one payload on an open executor.
    async fn collect(&mut self, executor: &ResilientExecutor) -> GatewayResult<Vec<u8>> {
        if self.model.is_none() {
            match executor.execute(|d, h| async move { d.read_system_info(h).await }).await {
                Ok(system) => {
                    let strategy = resolve(&system.series);
                    info!(session_id = %self.session_id, series = %system.series, family = %strategy.family, "model resolved");
                    self.model = Some((strategy, system));
                }
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "system info unavailable, using default model");
                }
            }
        }
        let (strategy, system) = self.model.clone().unwrap_or_default();

        let aggregator = Aggregator::new(&self.session_id, executor, strategy, &system);
        let bytes = match self.settings.profile {
            PollProfile::Full => serde_json::to_vec(&aggregator.aggregate().await?)?,
            PollProfile::Status => serde_json::to_vec(&aggregator.status_view().await?)?,
        };
        Ok(bytes)
    }
}
