//! Subscriptions made through the context's router across connects,
//! reconnects and duplicate registrations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use lib_dispatch::core::{callback, ConnectionStatus, EventCallback};
use lib_dispatch::utils::geo::haversine_m;
use lib_dispatch::{EventKind, LatLng, UserRole};
use project_tests::{settle, Harness};

fn counter() -> (Arc<AtomicUsize>, EventCallback) {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    let cb = callback(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    (hits, cb)
}

#[tokio::test(start_paused = true)]
async fn registrations_made_before_connect_fire_once_per_event_across_reconnects() {
    let h = Harness::new(UserRole::Rider, "r1");
    let baseline = h.ctx.router().subscriber_count(EventKind::RideRejected);
    let (hits, cb) = counter();
    let _first = h.ctx.router().on(EventKind::RideRejected, cb.clone());
    let _again = h.ctx.router().on(EventKind::RideRejected, cb);
    assert_eq!(h.ctx.router().subscriber_count(EventKind::RideRejected), baseline + 1);

    h.ctx.start().await.unwrap();
    h.push("ride_rejected", json!({"rideId": "R1", "reason": "busy"}));
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    for round in 0..3 {
        h.connector.latest().unwrap().drop_connection();
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(h.ctx.connection().status(), ConnectionStatus::Connected, "round {round}");

        h.push("ride_rejected", json!({"rideId": "R1"}));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2 + round);
    }
    assert_eq!(h.ctx.router().attached_count(EventKind::RideRejected), baseline + 1);
}

#[tokio::test(start_paused = true)]
async fn local_trigger_reaches_subscribers_without_a_connection() {
    let h = Harness::new(UserRole::Rider, "r1");
    let (hits, cb) = counter();
    let baseline = h.ctx.router().subscriber_count(EventKind::RideStarted);
    let sub = h.ctx.router().on(EventKind::RideStarted, cb);
    assert_eq!(h.ctx.router().subscriber_count(EventKind::RideStarted), baseline + 1);

    h.ctx.router().trigger("ride_started", json!({"rideId": "R1"}));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    drop(sub);
    h.ctx.router().trigger("ride_started", json!({"rideId": "R1"}));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(h.ctx.router().subscriber_count(EventKind::RideStarted), baseline);
}

#[tokio::test(start_paused = true)]
async fn junk_frames_are_counted_not_fatal() {
    let h = Harness::new(UserRole::Rider, "r1");
    h.ctx.start().await.unwrap();
    let session = h.connector.latest().unwrap();

    session.push_raw("not json at all");
    session.push("surge_pricing", json!({"multiplier": 2.0}));
    settle().await;

    let diagnostics = h.ctx.router().diagnostics();
    assert_eq!(diagnostics.malformed, 1);
    assert_eq!(diagnostics.unknown_events, vec!["surge_pricing".to_string()]);
    assert!(h.ctx.connection().is_connected());
}

#[test]
fn haversine_is_zero_for_identical_points_and_symmetric() {
    let a = LatLng::new(40.7580, -73.9855);
    let b = LatLng::new(40.6413, -73.7781);
    assert_eq!(haversine_m(a, a), 0.0);
    assert!((haversine_m(a, b) - haversine_m(b, a)).abs() < 1e-9);
}
