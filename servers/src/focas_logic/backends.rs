use std::sync::Arc;

use anyhow::Context;
use lib_gateway::connections::{
    InMemoryRepository, LogSink, MachineRepository, PostgresRepository, PublishSink, RedisSink,
};
use lib_gateway::driver::{DeviceDriver, SimMachine, SimulatedDriver};
use lib_gateway::Endpoint;

use super::config::Config;

const DB_POOL_SIZE: usize = 8;
/// Approximate cap on the snapshot stream length.
const STREAM_MAX_LEN: usize = 100_000;

/// PostgreSQL when `database_url` is set, otherwise a process-local store.
pub async fn build_repository(config: &Config) -> anyhow::Result<Arc<dyn MachineRepository>> {
    match &config.database_url {
        Some(url) => {
            let repo = PostgresRepository::new(url, DB_POOL_SIZE).context("creating database pool")?;
            repo.ensure_schema().await.context("preparing fanuc_machines table")?;
            tracing::info!("Session store: PostgreSQL");
            Ok(Arc::new(repo))
        }
        None => {
            tracing::warn!("DATABASE_URL not set. Sessions are kept in memory and lost on restart.");
            Ok(Arc::new(InMemoryRepository::new()))
        }
    }
}

/// Redis stream when `redis_url` is set, otherwise snapshots are only logged.
pub async fn build_sink(config: &Config) -> anyhow::Result<Arc<dyn PublishSink>> {
    match &config.redis_url {
        Some(url) => {
            let stream_key = config.stream_key.clone().unwrap_or_else(|| "fanuc_data".to_string());
            let sink = RedisSink::connect(url, stream_key.clone())
                .await
                .context("connecting to Redis")?
                .with_max_len(STREAM_MAX_LEN);
            tracing::info!("Publishing snapshots to Redis stream {stream_key}");
            Ok(Arc::new(sink))
        }
        None => {
            tracing::warn!("REDIS_URL not set. Snapshots are written to the log only.");
            Ok(Arc::new(LogSink))
        }
    }
}

/// The device driver. Controllers listed in `simulated_machines` are served
/// by the in-process simulator.
pub fn build_driver(config: &Config) -> anyhow::Result<Arc<dyn DeviceDriver>> {
    let driver = SimulatedDriver::new();
    for raw in config.simulated_machines.iter().flatten() {
        let endpoint: Endpoint = raw
            .parse()
            .with_context(|| format!("invalid simulated endpoint {raw:?}"))?;
        driver.add_machine(&endpoint.to_string(), SimMachine::default());
        tracing::info!("Simulating controller at {endpoint}");
    }
    Ok(Arc::new(driver))
}
