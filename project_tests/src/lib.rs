//! Shared fixtures for the scenario tests under `tests/`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use lib_dispatch::core::RideUpdate;
use lib_dispatch::outbox::PendingStore;
use lib_dispatch::testing::{FixedPosition, MockConnector, MockRideApi, RecordingMap};
use lib_dispatch::{DispatchConfig, DispatchContext, Identity, LatLng, UserRole};

/// Where the test device stands.
pub const HERE: LatLng = LatLng::new(40.7580, -73.9855);

/// A context wired to in-memory collaborators, plus handles on them.
pub struct Harness {
    pub ctx: DispatchContext,
    pub connector: Arc<MockConnector>,
    pub api: Arc<MockRideApi>,
    pub map: Arc<RecordingMap>,
    pub position: Arc<FixedPosition>,
    pub updates: broadcast::Receiver<RideUpdate>,
}

impl Harness {
    pub fn new(role: UserRole, user_id: &str) -> Self {
        Self::with(role, user_id, Arc::new(MockRideApi::new()), None)
    }

    pub fn with(
        role: UserRole,
        user_id: &str,
        api: Arc<MockRideApi>,
        store: Option<Arc<dyn PendingStore>>,
    ) -> Self {
        let connector = Arc::new(MockConnector::new().auto_confirm());
        let map = Arc::new(RecordingMap::default());
        let position = Arc::new(FixedPosition::new(HERE));

        let mut builder =
            DispatchContext::builder(DispatchConfig::default(), Identity::new(role, user_id))
                .connector(connector.clone())
                .api(api.clone())
                .map(map.clone())
                .position(position.clone());
        if let Some(store) = store {
            builder = builder.store(store);
        }
        let ctx = builder.build().unwrap();
        let updates = ctx.rides().subscribe();

        Self {
            ctx,
            connector,
            api,
            map,
            position,
            updates,
        }
    }

    /// Plays the server: sends one push event on the live session.
    pub fn push(&self, event: &str, data: serde_json::Value) {
        let session = self.connector.latest().unwrap();
        assert!(session.push(event, data), "session is closed");
    }

    pub fn drain(&mut self) -> Vec<RideUpdate> {
        let mut out = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            out.push(update);
        }
        out
    }
}

/// Lets spawned tasks run without moving the clock meaningfully.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
