//! Ride requests made without a reachable backend: queued on disk, retried
//! with backoff, resumed by the next process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use lib_dispatch::core::RideUpdate;
use lib_dispatch::outbox::PendingStore;
use lib_dispatch::testing::{new_ride, ApiCall, MockRideApi};
use lib_dispatch::{
    JsonFilePendingStore, MemoryPendingStore, PendingRide, RideError, RideState, RideStatus,
    StoreError, UserRole,
};
use project_tests::Harness;

/// An outbox whose removals take a while, like a slow disk, and can be made
/// to fail once.
#[derive(Default)]
struct SlowRemoveStore {
    inner: MemoryPendingStore,
    delay: Duration,
    fail_next_remove: AtomicBool,
}

#[async_trait]
impl PendingStore for SlowRemoveStore {
    async fn put(&self, entry: &PendingRide) -> Result<(), StoreError> {
        self.inner.put(entry).await
    }

    async fn remove(&self, local_id: &str) -> Result<bool, StoreError> {
        tokio::time::sleep(self.delay).await;
        if self.fail_next_remove.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.remove(local_id).await
    }

    async fn list(&self) -> Result<Vec<PendingRide>, StoreError> {
        self.inner.list().await
    }
}

fn slow_store() -> Arc<dyn PendingStore> {
    Arc::new(SlowRemoveStore {
        delay: Duration::from_secs(1),
        ..Default::default()
    })
}

#[tokio::test(start_paused = true)]
async fn offline_request_resyncs_with_the_server_id() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn PendingStore> = Arc::new(JsonFilePendingStore::new(dir.path().join("outbox.json")));
    let api = Arc::new(MockRideApi::new());
    let mut h = Harness::with(UserRole::Rider, "r1", api.clone(), Some(store.clone()));
    h.ctx.start().await.unwrap();

    api.set_offline(true);
    let ride = h.ctx.rides().request_ride(new_ride("r1")).await.unwrap();
    assert!(ride.is_local_fallback);
    assert_eq!(store.list().await.unwrap()[0].local_id, ride.id);

    // Retries at 5 s and 15 s fail; the one at 35 s goes through.
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(api.request_count(), 3);
    assert_eq!(store.list().await.unwrap()[0].attempts, 2);
    api.set_offline(false);
    tokio::time::sleep(Duration::from_secs(20)).await;

    let current = h.ctx.rides().current_ride().unwrap();
    assert!(!current.is_local_fallback);
    assert_eq!(current.id, "ride-1");
    assert_eq!(current.state, RideState::Searching);
    assert!(store.list().await.unwrap().is_empty());
    assert!(h.drain().contains(&RideUpdate::Resynced {
        local_id: ride.id.clone(),
        ride_id: "ride-1".into(),
    }));
}

#[tokio::test(start_paused = true)]
async fn queued_request_is_resumed_by_the_next_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbox.json");

    let local_id = {
        let store: Arc<dyn PendingStore> = Arc::new(JsonFilePendingStore::new(&path));
        let api = Arc::new(MockRideApi::new());
        api.set_offline(true);
        let h = Harness::with(UserRole::Rider, "r1", api, Some(store));
        h.ctx.start().await.unwrap();
        let ride = h.ctx.rides().request_ride(new_ride("r1")).await.unwrap();
        h.ctx.shutdown();
        ride.id
    };

    // A fresh process with the backend back online.
    let store: Arc<dyn PendingStore> = Arc::new(JsonFilePendingStore::new(&path));
    let api = Arc::new(MockRideApi::new());
    let h = Harness::with(UserRole::Rider, "r1", api.clone(), Some(store.clone()));
    h.ctx.start().await.unwrap();

    let resumed = h.ctx.rides().current_ride().unwrap();
    assert_eq!(resumed.id, local_id);
    assert!(resumed.is_local_fallback);
    assert_eq!(resumed.state, RideState::Requesting);

    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert_eq!(api.request_count(), 1);
    assert_eq!(h.ctx.rides().ride_state(), RideState::Searching);
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn backend_refusal_drops_the_queued_request() {
    let api = Arc::new(MockRideApi::new());
    let h = Harness::with(UserRole::Rider, "r1", api.clone(), None);
    h.ctx.start().await.unwrap();

    api.set_offline(true);
    h.ctx.rides().request_ride(new_ride("r1")).await.unwrap();
    api.set_offline(false);
    api.reject_next(422, "pickup outside service area");

    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert_eq!(h.ctx.rides().ride_state(), RideState::Cancelled);
    assert!(h.ctx.store().list().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(api.request_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_queued_ride_stops_the_pending_resubmission() {
    let api = Arc::new(MockRideApi::new());
    let mut h = Harness::with(UserRole::Rider, "r1", api.clone(), Some(slow_store()));
    h.ctx.start().await.unwrap();

    api.set_offline(true);
    let ride = h.ctx.rides().request_ride(new_ride("r1")).await.unwrap();

    // The backend is back just before the first retry is due, and the cancel
    // is still clearing the outbox when that retry would fire.
    tokio::time::sleep(Duration::from_millis(4_500)).await;
    api.set_offline(false);
    h.ctx.rides().cancel_ride(None).await.unwrap();

    let current = h.ctx.rides().current_ride().unwrap();
    assert_eq!(current.id, ride.id);
    assert_eq!(current.state, RideState::Cancelled);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(api.request_count(), 1);
    assert_eq!(h.ctx.rides().ride_state(), RideState::Cancelled);
    assert!(h.ctx.store().list().await.unwrap().is_empty());
    assert!(!h
        .drain()
        .iter()
        .any(|u| matches!(u, RideUpdate::Resynced { .. })));
}

#[tokio::test(start_paused = true)]
async fn ride_created_by_an_in_flight_resubmission_is_cancelled_on_the_backend() {
    let api = Arc::new(MockRideApi::new());
    let mut h = Harness::with(UserRole::Rider, "r1", api.clone(), Some(slow_store()));
    h.ctx.start().await.unwrap();

    api.set_offline(true);
    let ride = h.ctx.rides().request_ride(new_ride("r1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(4_900)).await;
    api.set_offline(false);

    // At 5 s the retry creates ride-1 and is still clearing its outbox entry
    // when the rider cancels.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(api.request_count(), 2);
    h.ctx.rides().cancel_ride(None).await.unwrap();

    let current = h.ctx.rides().current_ride().unwrap();
    assert_eq!(current.id, ride.id);
    assert_eq!(current.state, RideState::Cancelled);
    assert_eq!(api.ride("ride-1").unwrap().status, RideStatus::Cancelled);
    assert!(api.calls().contains(&ApiCall::Cancel {
        ride_id: "ride-1".into(),
        cancelled_by: UserRole::Rider,
    }));

    let updates = h.drain();
    assert!(!updates
        .iter()
        .any(|u| matches!(u, RideUpdate::StateChanged { to: RideState::Searching, .. })));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(api.request_count(), 2);
    assert_eq!(h.ctx.rides().ride_state(), RideState::Cancelled);
    assert!(h.ctx.store().list().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_outbox_cleanup_keeps_the_queued_ride_alive() {
    let store = Arc::new(SlowRemoveStore::default());
    let api = Arc::new(MockRideApi::new());
    let h = Harness::with(UserRole::Rider, "r1", api.clone(), Some(store.clone()));
    h.ctx.start().await.unwrap();

    api.set_offline(true);
    let ride = h.ctx.rides().request_ride(new_ride("r1")).await.unwrap();

    store.fail_next_remove.store(true, Ordering::SeqCst);
    let err = h.ctx.rides().cancel_ride(None).await.unwrap_err();
    assert!(matches!(err, RideError::Store(_)));

    let current = h.ctx.rides().current_ride().unwrap();
    assert_eq!(current.id, ride.id);
    assert_eq!(current.state, RideState::Requesting);
    assert!(current.is_local_fallback);
    assert_eq!(h.ctx.rides().active_timers(), vec!["outbox-resync"]);

    api.set_offline(false);
    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert_eq!(h.ctx.rides().ride_state(), RideState::Searching);
    assert_eq!(h.ctx.rides().current_ride().unwrap().id, "ride-1");
}
