//! # Resilient Call Executor
//!
//! Wraps every driver call for one session. A transport-class failure puts the
//! link into `Reconnecting`: the stale handle is disconnected, the executor
//! waits a short stabilisation delay and reconnects with backoff for as long
//! as it takes, then re-runs the same operation on the new handle. Any other
//! error goes straight back to the caller.
//!
//! A one-shot executor (`without_reconnect`) never enters that loop: the
//! first transport failure drops the handle, marks the link unhealthy and
//! every later call fails fast with the same error.
//!
//! The handle mutex is held only to copy the handle before a call and across
//! the disconnect/reconnect transition, never while a read is in flight.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use crate::driver::codes::EW_HANDLE;
use crate::driver::{DeviceDriver, DriverError, Endpoint, Handle};

/// Connection parameters shared by every executor of a gateway.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkSettings {
    /// Bound on each individual connect attempt.
    pub connect_timeout: Duration,
    /// Pause between dropping a stale handle and the first reconnect.
    pub stabilization_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            stabilization_delay: Duration::from_millis(200),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Where the link currently is in its recovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Reconnecting { attempt: u32 },
}

pub struct ResilientExecutor {
    driver: Arc<dyn DeviceDriver>,
    endpoint: Endpoint,
    settings: LinkSettings,
    handle: Mutex<Handle>,
    healthy: AtomicBool,
    /// 0 while connected, otherwise the current reconnect attempt.
    attempt: AtomicU32,
    reconnects: AtomicU64,
    cancel: CancellationToken,
    reconnect: bool,
    /// Transport error that ended a one-shot link.
    failure: Mutex<Option<DriverError>>,
}

impl ResilientExecutor {
    /// An executor with no live handle yet. The first call fails on the empty
    /// handle and goes through the reconnect path.
    pub fn new(driver: Arc<dyn DeviceDriver>, endpoint: Endpoint, settings: LinkSettings) -> Self {
        Self {
            driver,
            endpoint,
            settings,
            handle: Mutex::new(Handle::NONE),
            healthy: AtomicBool::new(true),
            attempt: AtomicU32::new(0),
            reconnects: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            reconnect: true,
            failure: Mutex::new(None),
        }
    }

    /// Opens the first connection with a single bounded attempt.
    pub async fn connect(
        driver: Arc<dyn DeviceDriver>,
        endpoint: Endpoint,
        settings: LinkSettings,
        timeout: Duration,
    ) -> Result<Self, DriverError> {
        let handle = driver.connect(&endpoint, timeout).await?;
        let executor = Self::new(driver, endpoint, settings);
        *executor.handle.lock().await = handle;
        Ok(executor)
    }

    /// Turns off recovery. A transport failure is returned as is and the
    /// link stays down until the executor is dropped.
    pub fn without_reconnect(mut self) -> Self {
        self.reconnect = false;
        self
    }

    /// The transport error that took a one-shot link down, if any.
    pub async fn link_error(&self) -> Option<DriverError> {
        self.failure.lock().await.clone()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// False during the reconnect window.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn state(&self) -> LinkState {
        match self.attempt.load(Ordering::Acquire) {
            0 => LinkState::Connected,
            attempt => LinkState::Reconnecting { attempt },
        }
    }

    /// Successful reconnects since creation.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Acquire)
    }

    pub async fn current_handle(&self) -> Handle {
        *self.handle.lock().await
    }

    /// Runs `op` against the current handle. `op` must perform exactly one
    /// logical driver operation; it is re-run after each recovery.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, DriverError>
    where
        F: FnMut(Arc<dyn DeviceDriver>, Handle) -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        loop {
            let handle = *self.handle.lock().await;
            if !self.reconnect && handle.is_none() {
                let failure = self.failure.lock().await.clone();
                return Err(failure.unwrap_or_else(|| DriverError::new("execute", EW_HANDLE)));
            }
            match op(Arc::clone(&self.driver), handle).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transport() && !self.reconnect => {
                    warn!(endpoint = %self.endpoint, handle = handle.0, error = %e, "transport failure, link dropped");
                    self.drop_link(handle, e.clone()).await;
                    return Err(e);
                }
                Err(e) if e.is_transport() => {
                    warn!(endpoint = %self.endpoint, handle = handle.0, error = %e, "transport failure, reconnecting");
                    self.recover(handle, e).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn drop_link(&self, failed: Handle, cause: DriverError) {
        self.healthy.store(false, Ordering::Release);
        let mut guard = self.handle.lock().await;
        if *guard == failed && !guard.is_none() {
            if let Err(e) = self.driver.disconnect(*guard).await {
                debug!(endpoint = %self.endpoint, error = %e, "disconnect of stale handle failed");
            }
            *guard = Handle::NONE;
        }
        let mut failure = self.failure.lock().await;
        if failure.is_none() {
            *failure = Some(cause);
        }
    }

    /// Replaces `failed` with a fresh handle. Returns only once connected,
    /// or with `cause` if the executor is cancelled first.
    async fn recover(&self, failed: Handle, cause: DriverError) -> Result<(), DriverError> {
        let mut guard = self.handle.lock().await;

        // Someone else already swapped the handle while we waited.
        if *guard != failed && !guard.is_none() {
            debug!(endpoint = %self.endpoint, "handle already replaced by a concurrent caller");
            return Ok(());
        }

        self.healthy.store(false, Ordering::Release);
        if !guard.is_none() {
            if let Err(e) = self.driver.disconnect(*guard).await {
                debug!(endpoint = %self.endpoint, error = %e, "disconnect of stale handle failed");
            }
            *guard = Handle::NONE;
        }

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(cause),
            _ = tokio::time::sleep(self.settings.stabilization_delay) => {}
        }

        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                self.attempt.store(0, Ordering::Release);
                return Err(cause);
            }
            self.attempt.store(attempt.saturating_add(1), Ordering::Release);

            match self.driver.connect(&self.endpoint, self.settings.connect_timeout).await {
                Ok(handle) => {
                    *guard = handle;
                    self.attempt.store(0, Ordering::Release);
                    self.healthy.store(true, Ordering::Release);
                    self.reconnects.fetch_add(1, Ordering::AcqRel);
                    info!(endpoint = %self.endpoint, handle = handle.0, attempts = attempt + 1, "reconnected");
                    return Ok(());
                }
                Err(e) => {
                    let delay = self.settings.backoff.delay_for(attempt);
                    warn!(
                        endpoint = %self.endpoint,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "reconnect failed"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.attempt.store(0, Ordering::Release);
                            return Err(cause);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Disconnects the live handle, if any.
    pub async fn close(&self) {
        let mut guard = self.handle.lock().await;
        if !guard.is_none() {
            if let Err(e) = self.driver.disconnect(*guard).await {
                debug!(endpoint = %self.endpoint, error = %e, "disconnect failed");
            }
            *guard = Handle::NONE;
        }
    }

    /// Aborts any reconnect loop and refuses to start new ones. The pending
    /// call returns the transport error that started the loop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::codes::{EW_DATA, EW_SOCKET};
    use crate::driver::{SimMachine, SimulatedDriver};

    const EP: &str = "10.0.0.5:8193";

    fn settings() -> LinkSettings {
        LinkSettings {
            connect_timeout: Duration::from_secs(2),
            stabilization_delay: Duration::from_millis(200),
            backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
        }
    }

    async fn setup() -> (Arc<SimulatedDriver>, ResilientExecutor) {
        let sim = Arc::new(SimulatedDriver::new());
        sim.add_machine(EP, SimMachine::new("0i-F"));
        let exec = ResilientExecutor::connect(sim.clone(), EP.parse().unwrap(), settings(), Duration::from_secs(2))
            .await
            .unwrap();
        (sim, exec)
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_retried_until_success() {
        let (sim, exec) = setup().await;
        sim.inject(EP, "read_status", EW_SOCKET, 3);

        let status = exec
            .execute(|d, h| async move { d.read_status(h).await })
            .await
            .unwrap();

        assert_eq!(status.run, 3);
        // three failed calls plus the one that completed
        assert_eq!(sim.calls("read_status"), 4);
        assert_eq!(exec.reconnect_count(), 3);
        assert_eq!(sim.live_handles(EP), 1);
        assert!(exec.is_healthy());
        assert_eq!(exec.state(), LinkState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transport_errors_are_returned_without_reconnect() {
        let (sim, exec) = setup().await;
        sim.inject(EP, "read_jog_override", EW_DATA, 1);

        let err = exec
            .execute(|d, h| async move { d.read_jog_override(h).await })
            .await
            .unwrap_err();

        assert_eq!(err.code, EW_DATA);
        assert_eq!(sim.calls("read_jog_override"), 1);
        assert_eq!(sim.connect_attempts(), 1);
        assert_eq!(exec.reconnect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_reconnecting_while_the_device_is_down() {
        let (sim, exec) = setup().await;
        let exec = Arc::new(exec);
        sim.set_reachable(EP, false);

        let task = {
            let exec = exec.clone();
            tokio::spawn(async move { exec.execute(|d, h| async move { d.read_status(h).await }).await })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!task.is_finished());
        assert!(!exec.is_healthy());
        assert!(matches!(exec.state(), LinkState::Reconnecting { .. }));
        assert!(sim.connect_attempts() > 5);

        sim.set_reachable(EP, true);
        let result = task.await.unwrap();
        assert!(result.is_ok());
        assert!(exec.is_healthy());
        assert_eq!(sim.live_handles(EP), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_reconnect_loop() {
        let sim = Arc::new(SimulatedDriver::new());
        sim.add_machine(EP, SimMachine::default());
        sim.set_reachable(EP, false);
        let exec = Arc::new(ResilientExecutor::new(sim.clone(), EP.parse().unwrap(), settings()));

        let task = {
            let exec = exec.clone();
            tokio::spawn(async move { exec.execute(|d, h| async move { d.read_status(h).await }).await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        exec.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_link_fails_fast_after_a_transport_error() {
        let (sim, exec) = setup().await;
        let exec = exec.without_reconnect();
        sim.inject(EP, "read_status", EW_SOCKET, 1);
        let started = tokio::time::Instant::now();

        let err = exec
            .execute(|d, h| async move { d.read_status(h).await })
            .await
            .unwrap_err();
        assert_eq!(err.code, EW_SOCKET);
        assert!(!exec.is_healthy());
        assert_eq!(exec.current_handle().await, Handle::NONE);
        assert_eq!(sim.live_handles(EP), 0);

        // later calls never reach the driver
        let again = exec
            .execute(|d, h| async move { d.read_jog_override(h).await })
            .await
            .unwrap_err();
        assert_eq!(again, err);
        assert_eq!(exec.link_error().await, Some(err));
        assert_eq!(sim.calls("read_jog_override"), 0);
        assert_eq!(sim.connect_attempts(), 1);
        assert_eq!(exec.reconnect_count(), 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
