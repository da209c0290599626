//! # Driver Runtime
//!
//! The vendor library must be initialised exactly once per process before any
//! connection is opened. `DriverRuntime` owns that one-shot step and the
//! shared driver instance; the application root creates it and passes it down.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{error, info};

use super::DeviceDriver;
use crate::error::{GatewayError, GatewayResult};

/// Startup mode passed to the vendor library (3 = log to file).
pub const DEFAULT_STARTUP_MODE: u16 = 3;

pub struct DriverRuntime {
    driver: Arc<dyn DeviceDriver>,
    mode: u16,
    log_path: String,
    started: OnceCell<()>,
}

impl DriverRuntime {
    pub fn new(driver: Arc<dyn DeviceDriver>, log_path: impl Into<String>) -> Self {
        Self {
            driver,
            mode: DEFAULT_STARTUP_MODE,
            log_path: log_path.into(),
            started: OnceCell::new(),
        }
    }

    pub fn with_mode(mut self, mode: u16) -> Self {
        self.mode = mode;
        self
    }

    /// Runs the process-wide startup if it has not succeeded yet. Concurrent
    /// callers wait for the same attempt. A failure leaves the runtime
    /// uninitialised and is reported as `FatalStartup`.
    pub async fn ensure_started(&self) -> GatewayResult<()> {
        self.started
            .get_or_try_init(|| async {
                match self.driver.startup(self.mode, &self.log_path).await {
                    Ok(()) => {
                        info!(mode = self.mode, log_path = %self.log_path, "FOCAS library initialised");
                        Ok(())
                    }
                    Err(e) => {
                        error!(error = %e, "FOCAS library initialisation failed");
                        Err(GatewayError::FatalStartup(e.to_string()))
                    }
                }
            })
            .await
            .map(|_| ())
    }

    pub fn is_started(&self) -> bool {
        self.started.initialized()
    }

    pub fn driver(&self) -> Arc<dyn DeviceDriver> {
        Arc::clone(&self.driver)
    }
}
