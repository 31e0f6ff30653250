use std::sync::Mutex;

use async_trait::async_trait;

use lib_dispatch::core::{MapSink, PositionSource};
use lib_dispatch::{LatLng, LocationSample};

/// Position given on the command line, movable through the console.
#[derive(Debug, Default)]
pub struct ManualPosition {
    position: Mutex<Option<LatLng>>,
}

impl ManualPosition {
    pub fn new(position: Option<LatLng>) -> Self {
        Self {
            position: Mutex::new(position),
        }
    }

    pub fn set(&self, position: LatLng) {
        *self.position.lock().unwrap_or_else(|p| p.into_inner()) = Some(position);
    }
}

#[async_trait]
impl PositionSource for ManualPosition {
    async fn current_position(&self) -> Option<LatLng> {
        *self.position.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Stand-in for a map view: writes the counterparty marker to the log.
pub struct LogMap;

impl MapSink for LogMap {
    fn show_counterparty(&self, ride_id: &str, sample: &LocationSample, distance_m: Option<f64>) {
        tracing::info!(
            ride_id,
            lat = sample.location.lat,
            lng = sample.location.lng,
            owner = %sample.owner,
            distance_m,
            "counterparty position"
        );
    }

    fn clear(&self, ride_id: &str) {
        tracing::debug!(ride_id, "counterparty marker cleared");
    }
}
