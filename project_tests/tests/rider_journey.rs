//! End-to-end rider scenarios driven through a `DispatchContext` whose push
//! channel and HTTP backend are played by in-memory mocks.

use std::time::Duration;

use serde_json::json;

use lib_dispatch::core::{ConnectionStatus, RideUpdate};
use lib_dispatch::testing::new_ride;
use lib_dispatch::{DriverInfo, RideState, RideStatus, UserRole};
use project_tests::{settle, Harness};

#[tokio::test(start_paused = true)]
async fn rider_follows_a_ride_from_request_to_completion() {
    let mut h = Harness::new(UserRole::Rider, "r1");
    h.ctx.start().await.unwrap();
    assert!(h.ctx.connection().is_connected());

    let ride = h.ctx.rides().request_ride(new_ride("r1")).await.unwrap();
    assert_eq!(ride.state, RideState::Searching);

    tokio::time::sleep(Duration::from_secs(6)).await;
    h.push(
        "ride_accepted",
        json!({"rideId": ride.id, "driver": {"id": "D1", "name": "Dana"}, "estimatedArrival": 3}),
    );
    settle().await;
    assert_eq!(h.ctx.rides().ride_state(), RideState::Accepted);

    // About 1.1 km out, then about 55 m out.
    h.push(
        "driver_location_update",
        json!({"rideId": ride.id, "location": {"lat": 40.7680, "lng": -73.9855}}),
    );
    settle().await;
    assert_eq!(h.ctx.rides().ride_state(), RideState::DriverEnRoute);

    h.push(
        "driver_location_update",
        json!({"rideId": ride.id, "location": {"lat": 40.7585, "lng": -73.9855}}),
    );
    settle().await;
    assert_eq!(h.ctx.rides().ride_state(), RideState::DriverArrived);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(h.ctx.rides().ride_state(), RideState::InProgress);

    h.push("ride_completed", json!({"rideId": ride.id, "fare": 47.3}));
    settle().await;
    assert_eq!(h.ctx.rides().ride_state(), RideState::Completed);
    assert!(h.ctx.rides().active_timers().is_empty());
    assert_eq!(h.ctx.rides().relay().tracking(), None);

    let states: Vec<RideState> = h
        .drain()
        .into_iter()
        .filter_map(|u| match u {
            RideUpdate::StateChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            RideState::Requesting,
            RideState::Searching,
            RideState::Accepted,
            RideState::DriverEnRoute,
            RideState::DriverArrived,
            RideState::InProgress,
            RideState::Completed,
        ]
    );

    // The map saw both driver positions and was cleared at the end.
    assert_eq!(h.map.shown().len(), 2);
    assert_eq!(h.map.cleared(), vec![ride.id.clone()]);
}

#[tokio::test(start_paused = true)]
async fn late_acceptance_never_revives_a_timed_out_search() {
    let mut h = Harness::new(UserRole::Rider, "r1");
    h.ctx.start().await.unwrap();
    let ride = h.ctx.rides().request_ride(new_ride("r1")).await.unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.ctx.rides().ride_state(), RideState::SearchTimedOut);

    h.push(
        "ride_accepted",
        json!({"rideId": ride.id, "driver": {"id": "D1"}}),
    );
    settle().await;
    assert_eq!(h.ctx.rides().ride_state(), RideState::SearchTimedOut);

    let updates = h.drain();
    assert_eq!(
        updates
            .iter()
            .filter(|u| matches!(u, RideUpdate::NoDriversAvailable { .. }))
            .count(),
        1
    );
    assert!(!updates
        .iter()
        .any(|u| matches!(u, RideUpdate::DriverAssigned { .. })));

    // A new request archives the finished one.
    h.ctx.rides().request_ride(new_ride("r1")).await.unwrap();
    let history = h.ctx.rides().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, RideState::SearchTimedOut);
}

#[tokio::test(start_paused = true)]
async fn ride_survives_a_dropped_push_channel() {
    let h = Harness::new(UserRole::Rider, "r1");
    h.ctx.start().await.unwrap();
    let ride = h.ctx.rides().request_ride(new_ride("r1")).await.unwrap();

    // The backend assigns a driver, but the push channel dies before the
    // event is delivered and the first two reconnection attempts fail.
    h.api.set_status(&ride.id, RideStatus::Accepted);
    h.api.set_driver(&ride.id, DriverInfo::with_id("D7"));
    h.connector.fail_next(2);
    h.connector.latest().unwrap().drop_connection();
    settle().await;
    assert!(matches!(
        h.ctx.connection().status(),
        ConnectionStatus::Reconnecting { .. }
    ));

    // The status poll picks the assignment up.
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert_eq!(h.ctx.rides().ride_state(), RideState::Accepted);
    assert_eq!(
        h.ctx.rides().current_ride().unwrap().driver.unwrap().id,
        "D7"
    );

    // Third attempt succeeds; pushes reach the controller exactly once.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.ctx.connection().status(), ConnectionStatus::Connected);
    assert_eq!(h.connector.sessions().len(), 2);

    let mut updates = h.ctx.rides().subscribe();
    h.push("ride_cancelled", json!({"rideId": ride.id, "cancelledBy": "driver"}));
    settle().await;
    assert_eq!(h.ctx.rides().ride_state(), RideState::Cancelled);
    let mut cancellations = 0;
    while let Ok(update) = updates.try_recv() {
        if matches!(update, RideUpdate::Cancelled { .. }) {
            cancellations += 1;
        }
    }
    assert_eq!(cancellations, 1);
}

#[tokio::test(start_paused = true)]
async fn rider_cancels_while_searching() {
    let h = Harness::new(UserRole::Rider, "r1");
    h.ctx.start().await.unwrap();
    let ride = h.ctx.rides().request_ride(new_ride("r1")).await.unwrap();

    h.ctx
        .rides()
        .cancel_ride(Some("found another ride".into()))
        .await
        .unwrap();
    assert_eq!(h.ctx.rides().ride_state(), RideState::Cancelled);
    assert_eq!(
        h.api.ride(&ride.id).unwrap().status,
        RideStatus::Cancelled
    );

    // Nothing keeps ticking after cancellation.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(h.ctx.rides().search_ticks(), 0);
}
