//! Registration, duplicate handling, probing and deletion of sessions.

mod common;

use std::sync::Arc;

use common::{stored, Plant, LATHE, MILL};
use lib_gateway::connections::{InMemoryRepository, MachineRepository, PollStatus};
use lib_gateway::core::PollProfile;
use lib_gateway::GatewayError;

#[tokio::test(start_paused = true)]
async fn create_connection_registers_and_persists() {
    let plant = Plant::new();

    let info = plant.service.create_connection(MILL).await.unwrap();
    assert!(info.is_healthy);
    assert_eq!(info.endpoint, MILL);
    assert_eq!(info.poll_status, PollStatus::Connected);

    let record = plant.repo.get_by_session_id(&info.session_id).await.unwrap().unwrap();
    assert_eq!(record.endpoint_url, MILL);
    assert_eq!(record.status, PollStatus::Connected);
    assert_eq!(record.interval_ms, 0);

    // The probe leaves nothing open.
    assert_eq!(plant.driver.live_handles(MILL), 0);
}

#[tokio::test(start_paused = true)]
async fn second_registration_of_an_endpoint_is_a_duplicate() {
    let plant = Plant::new();
    let first = plant.service.create_connection(MILL).await.unwrap();

    match plant.service.create_connection(MILL).await {
        Err(GatewayError::Duplicate { session_id, .. }) => assert_eq!(session_id, first.session_id),
        other => panic!("expected Duplicate, got {other:?}"),
    }
    assert_eq!(plant.service.get_all_connections().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_store_record_is_replaced() {
    let repo = Arc::new(InMemoryRepository::with_records([stored(
        "left-over",
        MILL,
        PollStatus::Polled,
        1000,
    )]));
    let plant = Plant::with_store(repo, PollProfile::Full);

    let info = plant.service.create_connection(MILL).await.unwrap();
    assert_ne!(info.session_id, "left-over");
    assert!(plant.repo.get_by_session_id("left-over").await.unwrap().is_none());
    assert_eq!(plant.repo.get_all().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_device_is_not_registered() {
    let plant = Plant::new();
    plant.driver.set_reachable(MILL, false);

    let err = plant.service.create_connection(MILL).await.unwrap_err();
    assert!(matches!(err, GatewayError::ProbeFailed { .. }), "{err:?}");
    assert!(plant.repo.get_all().await.unwrap().is_empty());
    assert!(plant.service.get_all_connections().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn malformed_endpoint_is_a_validation_error() {
    let plant = Plant::new();
    for bad in ["", "10.0.0.5", "10.0.0.5:notaport", ":8193"] {
        let err = plant.service.create_connection(bad).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)), "{bad:?} gave {err:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn check_connection_reports_failure_with_info() {
    let plant = Plant::new();
    let info = plant.service.create_connection(LATHE).await.unwrap();

    plant.driver.set_reachable(LATHE, false);
    let check = plant.service.check_connection(&info.session_id).await.unwrap();
    assert!(!check.info.is_healthy);
    assert!(matches!(check.probe_error, Some(GatewayError::ProbeFailed { .. })));
    assert_eq!(check.info.use_count, info.use_count + 1);

    plant.driver.set_reachable(LATHE, true);
    let check = plant.service.check_connection(&info.session_id).await.unwrap();
    assert!(check.info.is_healthy);
    assert!(check.probe_error.is_none());
    assert!(check.info.last_used >= info.last_used);
}

#[tokio::test(start_paused = true)]
async fn unknown_sessions_are_not_found() {
    let plant = Plant::new();
    assert!(matches!(
        plant.service.get_connection("nope").await,
        Err(GatewayError::NotFound(_))
    ));
    assert!(matches!(
        plant.service.check_connection("nope").await,
        Err(GatewayError::NotFound(_))
    ));
    assert!(matches!(
        plant.service.delete_connection("nope").await,
        Err(GatewayError::NotFound(_))
    ));
    assert!(matches!(
        plant.service.stop_polling("nope").await,
        Err(GatewayError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn delete_stops_polling_and_removes_the_record() {
    let plant = Plant::new();
    let info = plant.service.create_connection(MILL).await.unwrap();
    plant.service.start_polling(&info.session_id, 1000).await.unwrap();
    assert!(plant.service.is_polling_active(&info.session_id).await);

    plant.service.delete_connection(&info.session_id).await.unwrap();

    assert!(!plant.service.is_polling_active(&info.session_id).await);
    assert_eq!(plant.service.scheduler().active_count().await, 0);
    assert!(plant.repo.get_by_session_id(&info.session_id).await.unwrap().is_none());
    assert!(matches!(
        plant.service.get_connection(&info.session_id).await,
        Err(GatewayError::NotFound(_))
    ));

    // The endpoint can be registered again.
    plant.service.create_connection(MILL).await.unwrap();
}
