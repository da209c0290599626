#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lib_gateway::connections::{ChannelSink, InMemoryRepository, MachineRecord, PollStatus};
use lib_gateway::core::{BackoffPolicy, GatewaySettings, LinkSettings, PollProfile};
use lib_gateway::driver::{SimMachine, SimulatedDriver};
use lib_gateway::{DriverRuntime, GatewayService};
use tokio::sync::mpsc;

pub const MILL: &str = "10.0.0.5:8193";
pub const LATHE: &str = "10.0.0.6:8193";

/// One gateway wired to a simulated controller farm and a channel sink.
pub struct Plant {
    pub driver: Arc<SimulatedDriver>,
    pub repo: Arc<InMemoryRepository>,
    pub service: Arc<GatewayService>,
    pub published: mpsc::Receiver<(String, Bytes)>,
}

pub fn fast_settings(profile: PollProfile) -> GatewaySettings {
    GatewaySettings {
        probe_timeout: Duration::from_millis(500),
        poll_connect_timeout: Duration::from_millis(500),
        link: LinkSettings {
            connect_timeout: Duration::from_millis(500),
            stabilization_delay: Duration::from_millis(50),
            backoff: BackoffPolicy::fixed(Duration::from_millis(250)),
        },
        poll_profile: profile,
        request_timeout: Duration::from_secs(10),
    }
}

impl Plant {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryRepository::new()), PollProfile::Full)
    }

    pub fn with_store(repo: Arc<InMemoryRepository>, profile: PollProfile) -> Self {
        let driver = Arc::new(SimulatedDriver::new());
        driver.add_machine(MILL, SimMachine::new("0i-F"));
        driver.add_machine(LATHE, SimMachine::new("31i-B"));
        Self::on(driver, repo, profile)
    }

    /// A gateway over an existing farm and store, as after a restart.
    pub fn on(driver: Arc<SimulatedDriver>, repo: Arc<InMemoryRepository>, profile: PollProfile) -> Self {
        let (sink, published) = ChannelSink::new(64);
        let runtime = Arc::new(DriverRuntime::new(driver.clone(), "./focas2.log"));
        let service = Arc::new(GatewayService::new(
            runtime,
            repo.clone(),
            Arc::new(sink),
            fast_settings(profile),
        ));
        Self {
            driver,
            repo,
            service,
            published,
        }
    }
}

pub fn stored(session_id: &str, endpoint: &str, status: PollStatus, interval_ms: u64) -> MachineRecord {
    let mut record = MachineRecord::connected(session_id, endpoint);
    record.status = status;
    record.interval_ms = interval_ms;
    record
}
