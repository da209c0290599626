//! Periodic polling: publishing, duplicate starts, stopping and outages.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Plant, LATHE, MILL};
use lib_gateway::connections::{InMemoryRepository, MachineRepository, PollStatus};
use lib_gateway::core::{PollProfile, Snapshot, StatusView};
use lib_gateway::driver::codes::EW_SOCKET;
use lib_gateway::GatewayError;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn poller_publishes_snapshots_keyed_by_session() {
    let mut plant = Plant::new();
    let info = plant.service.create_connection(MILL).await.unwrap();
    plant.service.start_polling(&info.session_id, 1000).await.unwrap();

    let record = plant.repo.get_by_session_id(&info.session_id).await.unwrap().unwrap();
    assert_eq!(record.status, PollStatus::Polled);
    assert_eq!(record.interval_ms, 1000);
    let pooled = plant.service.get_connection(&info.session_id).await.unwrap();
    assert_eq!(pooled.poll_status, PollStatus::Polled);
    assert_eq!(pooled.poll_interval_ms, 1000);

    for _ in 0..2 {
        let (key, payload) = plant.published.recv().await.unwrap();
        assert_eq!(key, info.session_id);
        let snapshot: Snapshot = serde_json::from_slice(&payload).unwrap();
        assert_eq!(snapshot.session_id, info.session_id);
        assert_eq!(snapshot.machine_id, MILL);
        assert_eq!(snapshot.axes.len(), 3);
        assert!(snapshot.warnings.is_empty(), "{:?}", snapshot.warnings);
    }

    // Every tick closes its own connection.
    assert_eq!(plant.driver.live_handles(MILL), 0);
}

#[tokio::test(start_paused = true)]
async fn status_profile_publishes_status_views() {
    let repo = Arc::new(InMemoryRepository::new());
    let mut plant = Plant::with_store(repo, PollProfile::Status);
    let info = plant.service.create_connection(LATHE).await.unwrap();
    plant.service.start_polling(&info.session_id, 500).await.unwrap();

    let (_, payload) = plant.published.recv().await.unwrap();
    let view: StatusView = serde_json::from_slice(&payload).unwrap();
    assert_eq!(view.endpoint, LATHE);
    assert_eq!(view.system_info.series, "31i-B");
    assert_eq!(view.program_info.unwrap().number, 1234);
    assert_eq!(view.warning_status, "NORMAL");
}

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected() {
    let plant = Plant::new();
    let info = plant.service.create_connection(MILL).await.unwrap();
    plant.service.start_polling(&info.session_id, 1000).await.unwrap();

    let err = plant.service.start_polling(&info.session_id, 2000).await.unwrap_err();
    assert!(matches!(err, GatewayError::AlreadyPolling(_)), "{err:?}");
    assert_eq!(plant.service.scheduler().active_count().await, 1);
    assert_eq!(
        plant.service.scheduler().poll_interval(&info.session_id).await,
        Some(Duration::from_millis(1000))
    );
}

#[tokio::test(start_paused = true)]
async fn start_polling_validates_its_input() {
    let plant = Plant::new();
    let info = plant.service.create_connection(MILL).await.unwrap();

    let err = plant.service.start_polling(&info.session_id, 0).await.unwrap_err();
    assert!(matches!(err, GatewayError::Validation(_)), "{err:?}");

    let err = plant.service.start_polling("nope", 1000).await.unwrap_err();
    assert!(matches!(err, GatewayError::NotFound(_)), "{err:?}");
    assert_eq!(plant.service.scheduler().active_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn stop_polling_persists_and_silences_the_session() {
    let mut plant = Plant::new();
    let info = plant.service.create_connection(MILL).await.unwrap();
    plant.service.start_polling(&info.session_id, 1000).await.unwrap();
    plant.published.recv().await.unwrap();

    plant.service.stop_polling(&info.session_id).await.unwrap();
    assert!(!plant.service.is_polling_active(&info.session_id).await);

    let record = plant.repo.get_by_session_id(&info.session_id).await.unwrap().unwrap();
    assert_eq!(record.status, PollStatus::Connected);
    assert_eq!(record.interval_ms, 0);

    // A tick already running may still land; nothing after that.
    sleep(Duration::from_millis(1000)).await;
    while plant.published.try_recv().is_ok() {}
    sleep(Duration::from_millis(5000)).await;
    assert!(plant.published.try_recv().is_err());

    // Stopping again is harmless, and polling can restart.
    plant.service.stop_polling(&info.session_id).await.unwrap();
    plant.service.start_polling(&info.session_id, 1000).await.unwrap();
    assert!(plant.service.is_polling_active(&info.session_id).await);
}

#[tokio::test(start_paused = true)]
async fn outage_skips_ticks_and_marks_the_session_unhealthy() {
    let mut plant = Plant::new();
    let info = plant.service.create_connection(MILL).await.unwrap();
    plant.service.start_polling(&info.session_id, 1000).await.unwrap();
    plant.published.recv().await.unwrap();

    plant.driver.set_reachable(MILL, false);
    sleep(Duration::from_millis(3500)).await;
    while plant.published.try_recv().is_ok() {}
    sleep(Duration::from_millis(2000)).await;
    assert!(plant.published.try_recv().is_err());
    assert!(!plant.service.get_connection(&info.session_id).await.unwrap().is_healthy);
    // The poller survives the outage.
    assert!(plant.service.is_polling_active(&info.session_id).await);

    plant.driver.set_reachable(MILL, true);
    let (key, _) = plant.published.recv().await.unwrap();
    assert_eq!(key, info.session_id);
    assert!(plant.service.get_connection(&info.session_id).await.unwrap().is_healthy);
}

#[tokio::test(start_paused = true)]
async fn link_lost_mid_tick_fails_the_tick() {
    let mut plant = Plant::new();
    let info = plant.service.create_connection(MILL).await.unwrap();
    plant.driver.inject(MILL, "read_status", EW_SOCKET, 1);
    plant.service.start_polling(&info.session_id, 1000).await.unwrap();

    sleep(Duration::from_millis(1500)).await;
    assert!(plant.published.try_recv().is_err());
    assert!(!plant.service.get_connection(&info.session_id).await.unwrap().is_healthy);
    assert_eq!(plant.driver.live_handles(MILL), 0);
    // the creation check plus the tick's own connect, no reconnects
    assert_eq!(plant.driver.connect_attempts(), 2);

    let (key, payload) = plant.published.recv().await.unwrap();
    assert_eq!(key, info.session_id);
    let snapshot: Snapshot = serde_json::from_slice(&payload).unwrap();
    assert!(snapshot.warnings.is_empty(), "{:?}", snapshot.warnings);
    assert!(plant.service.get_connection(&info.session_id).await.unwrap().is_healthy);
}

#[tokio::test(start_paused = true)]
async fn repeated_mid_tick_failures_cost_one_connect_per_tick() {
    let mut plant = Plant::new();
    let info = plant.service.create_connection(MILL).await.unwrap();
    plant.driver.inject(MILL, "read_status", EW_SOCKET, 100);
    plant.service.start_polling(&info.session_id, 1000).await.unwrap();

    sleep(Duration::from_millis(5500)).await;
    assert!(plant.published.try_recv().is_err());
    assert_eq!(plant.driver.connect_attempts(), 1 + 5);
    assert_eq!(plant.driver.live_handles(MILL), 0);
    assert!(!plant.service.get_connection(&info.session_id).await.unwrap().is_healthy);
    assert!(plant.service.is_polling_active(&info.session_id).await);
}

#[tokio::test(start_paused = true)]
async fn sessions_poll_independently() {
    let mut plant = Plant::new();
    let mill = plant.service.create_connection(MILL).await.unwrap();
    let lathe = plant.service.create_connection(LATHE).await.unwrap();
    plant.service.start_polling(&mill.session_id, 1000).await.unwrap();
    plant.service.start_polling(&lathe.session_id, 1000).await.unwrap();

    plant.driver.set_reachable(LATHE, false);
    sleep(Duration::from_millis(3500)).await;

    let mut mill_payloads = 0;
    while let Ok((key, _)) = plant.published.try_recv() {
        assert_eq!(key, mill.session_id);
        mill_payloads += 1;
    }
    assert!(mill_payloads >= 3, "got {mill_payloads}");
}
