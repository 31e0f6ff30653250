use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::identity::UserRole;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// A named point used for pickup and destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    #[serde(flatten)]
    pub location: LatLng,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Place {
    pub fn new(location: LatLng, address: Option<String>) -> Self {
        Self { location, address }
    }
}

/// One position report. Superseded by the next sample; no history is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    #[serde(flatten)]
    pub location: LatLng,
    pub captured_at: DateTime<Utc>,
    pub owner: UserRole,
}

impl LocationSample {
    pub fn now(location: LatLng, owner: UserRole) -> Self {
        Self {
            location,
            captured_at: Utc::now(),
            owner,
        }
    }
}
