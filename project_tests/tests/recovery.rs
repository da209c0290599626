//! Restart behaviour: restoring stored sessions and resuming pollers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{stored, Plant, LATHE, MILL};
use lib_gateway::connections::{InMemoryRepository, MachineRepository, PollStatus};
use lib_gateway::core::PollProfile;
use lib_gateway::driver::codes::EW_NODLL;
use lib_gateway::GatewayError;

const SPARE: &str = "10.0.0.7:8193";

#[tokio::test(start_paused = true)]
async fn restart_restores_sessions_and_resumes_reachable_pollers() {
    let repo = Arc::new(InMemoryRepository::with_records([
        stored("mill", MILL, PollStatus::Polled, 1000),
        stored("lathe", LATHE, PollStatus::Polled, 1000),
        stored("spare", SPARE, PollStatus::Connected, 0),
        stored("broken", "no-port-here", PollStatus::Polled, 1000),
    ]));
    let mut plant = Plant::with_store(repo, PollProfile::Full);
    plant.driver.add_machine(SPARE, Default::default());
    plant.driver.set_reachable(LATHE, false);

    let report = plant.service.start().await.unwrap();
    assert_eq!(report.restored, 3);
    assert_eq!(report.healthy, 2);
    assert_eq!(report.polling_resumed, 1);
    assert!(report.skipped.contains(&"lathe".to_string()));
    assert!(report.skipped.contains(&"broken".to_string()));

    // Same ids as before the restart.
    assert!(plant.service.is_polling_active("mill").await);
    assert!(!plant.service.is_polling_active("lathe").await);
    assert!(!plant.service.is_polling_active("spare").await);
    assert!(!plant.service.get_connection("lathe").await.unwrap().is_healthy);
    assert!(plant.service.get_connection("spare").await.unwrap().is_healthy);

    // The unreachable machine keeps its stored intent for the next restart.
    let lathe = plant.repo.get_by_session_id("lathe").await.unwrap().unwrap();
    assert_eq!(lathe.status, PollStatus::Polled);
    let pooled = plant.service.get_connection("lathe").await.unwrap();
    assert_eq!(pooled.poll_status, PollStatus::Polled);
    assert_eq!(pooled.poll_interval_ms, 1000);
    let spare = plant.service.get_connection("spare").await.unwrap();
    assert_eq!(spare.poll_status, PollStatus::Connected);
    assert_eq!(spare.poll_interval_ms, 0);

    let (key, _) = plant.published.recv().await.unwrap();
    assert_eq!(key, "mill");
}

#[tokio::test(start_paused = true)]
async fn stopping_a_skipped_poller_clears_its_restored_state() {
    let repo = Arc::new(InMemoryRepository::with_records([stored("lathe", LATHE, PollStatus::Polled, 1000)]));
    let plant = Plant::with_store(repo, PollProfile::Full);
    plant.driver.set_reachable(LATHE, false);
    plant.service.start().await.unwrap();

    plant.service.stop_polling("lathe").await.unwrap();
    let pooled = plant.service.get_connection("lathe").await.unwrap();
    assert_eq!(pooled.poll_status, PollStatus::Connected);
    assert_eq!(pooled.poll_interval_ms, 0);
    let record = plant.repo.get_by_session_id("lathe").await.unwrap().unwrap();
    assert_eq!(record.status, PollStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn shutdown_keeps_polling_intent_for_the_next_start() {
    let plant = Plant::new();
    let info = plant.service.create_connection(MILL).await.unwrap();
    plant.service.start_polling(&info.session_id, 2000).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    plant.service.shutdown().await;
    assert_eq!(plant.service.scheduler().active_count().await, 0);
    let record = plant.repo.get_by_session_id(&info.session_id).await.unwrap().unwrap();
    assert_eq!(record.status, PollStatus::Polled);
    assert_eq!(record.interval_ms, 2000);

    let mut restarted = Plant::on(plant.driver.clone(), plant.repo.clone(), PollProfile::Full);
    let report = restarted.service.start().await.unwrap();
    assert_eq!(report.polling_resumed, 1);
    assert_eq!(
        restarted.service.scheduler().poll_interval(&info.session_id).await,
        Some(Duration::from_millis(2000))
    );
    let (key, _) = restarted.published.recv().await.unwrap();
    assert_eq!(key, info.session_id);
}

#[tokio::test(start_paused = true)]
async fn driver_startup_failure_is_fatal() {
    let plant = Plant::new();
    plant.driver.fail_startup(EW_NODLL);

    let err = plant.service.start().await.unwrap_err();
    assert!(matches!(err, GatewayError::FatalStartup(_)), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn driver_starts_once_per_process() {
    let plant = Plant::new();
    plant.service.start().await.unwrap();
    plant.service.start().await.unwrap();
    assert_eq!(plant.driver.startups(), 1);
}
