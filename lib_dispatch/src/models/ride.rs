use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::location::{LatLng, Place};

/// Client-side lifecycle state of a ride request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideState {
    Idle,
    Requesting,
    Searching,
    Accepted,
    DriverEnRoute,
    DriverArrived,
    InProgress,
    Completed,
    Cancelled,
    SearchTimedOut,
}

impl RideState {
    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RideState::Completed | RideState::Cancelled | RideState::SearchTimedOut
        )
    }

    /// States in which a driver is assigned and the parties exchange positions.
    pub fn is_tracking(self) -> bool {
        matches!(
            self,
            RideState::Accepted
                | RideState::DriverEnRoute
                | RideState::DriverArrived
                | RideState::InProgress
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RideState::Idle => "idle",
            RideState::Requesting => "requesting",
            RideState::Searching => "searching",
            RideState::Accepted => "accepted",
            RideState::DriverEnRoute => "driver_en_route",
            RideState::DriverArrived => "driver_arrived",
            RideState::InProgress => "in_progress",
            RideState::Completed => "completed",
            RideState::Cancelled => "cancelled",
            RideState::SearchTimedOut => "search_timed_out",
        }
    }
}

impl fmt::Display for RideState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ride status as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Pending,
    Accepted,
    Rejected,
    InProgress,
    Completed,
    Cancelled,
    NoDrivers,
    #[serde(other)]
    Unknown,
}

impl RideStatus {
    /// Statuses that end the fallback status poll.
    pub fn ends_polling(self) -> bool {
        matches!(
            self,
            RideStatus::Accepted
                | RideStatus::InProgress
                | RideStatus::Completed
                | RideStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Economy,
    Comfort,
    Premium,
    Xl,
}

impl std::str::FromStr for VehicleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "economy" => Ok(VehicleType::Economy),
            "comfort" => Ok(VehicleType::Comfort),
            "premium" => Ok(VehicleType::Premium),
            "xl" => Ok(VehicleType::Xl),
            other => Err(format!("unknown vehicle type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VehicleInfo {
    pub make: Option<String>,
    pub model: Option<String>,
    pub color: Option<String>,
    pub plate: Option<String>,
}

/// The driver assigned to a ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub vehicle_info: Option<VehicleInfo>,
}

impl DriverInfo {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            phone: None,
            vehicle_info: None,
        }
    }
}

/// Body of `POST /rides/request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRide {
    pub rider_id: String,
    pub pickup: Place,
    pub destination: Place,
    pub fare_estimate: f64,
    pub vehicle_type: VehicleType,
}

/// A ride as the backend returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRecord {
    pub id: String,
    pub rider_id: String,
    pub pickup: Place,
    pub destination: Place,
    #[serde(default)]
    pub fare_estimate: f64,
    pub vehicle_type: VehicleType,
    pub status: RideStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub driver: Option<DriverInfo>,
    #[serde(default)]
    pub driver_location: Option<LatLng>,
    #[serde(default)]
    pub rider_location: Option<LatLng>,
    #[serde(default)]
    pub fare: Option<f64>,
}

/// The client's view of one ride request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRequest {
    pub id: String,
    pub rider_id: String,
    pub pickup: Place,
    pub destination: Place,
    pub fare_estimate: f64,
    pub vehicle_type: VehicleType,
    pub state: RideState,
    pub created_at: DateTime<Utc>,
    pub driver: Option<DriverInfo>,
    pub is_local_fallback: bool,
}

impl RideRequest {
    /// A request the backend has accepted for processing.
    pub fn from_record(record: &RideRecord, state: RideState) -> Self {
        Self {
            id: record.id.clone(),
            rider_id: record.rider_id.clone(),
            pickup: record.pickup.clone(),
            destination: record.destination.clone(),
            fare_estimate: record.fare_estimate,
            vehicle_type: record.vehicle_type,
            state,
            created_at: record.created_at,
            driver: record.driver.clone(),
            is_local_fallback: false,
        }
    }

    /// A request synthesized locally because submission failed.
    pub fn local_fallback(local_id: String, ride: &NewRide) -> Self {
        Self {
            id: local_id,
            rider_id: ride.rider_id.clone(),
            pickup: ride.pickup.clone(),
            destination: ride.destination.clone(),
            fare_estimate: ride.fare_estimate,
            vehicle_type: ride.vehicle_type,
            state: RideState::Requesting,
            created_at: Utc::now(),
            driver: None,
            is_local_fallback: true,
        }
    }

    /// Reconstructs the submission body, used when resubmitting from the outbox.
    pub fn to_new_ride(&self) -> NewRide {
        NewRide {
            rider_id: self.rider_id.clone(),
            pickup: self.pickup.clone(),
            destination: self.destination.clone(),
            fare_estimate: self.fare_estimate,
            vehicle_type: self.vehicle_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(RideState::Completed.is_terminal());
        assert!(RideState::Cancelled.is_terminal());
        assert!(RideState::SearchTimedOut.is_terminal());
        assert!(!RideState::Searching.is_terminal());
        assert!(!RideState::DriverArrived.is_terminal());
    }

    #[test]
    fn record_parses_backend_shape() {
        let json = serde_json::json!({
            "id": "R1",
            "riderId": "U1",
            "pickup": {"lat": 1.0, "lng": 2.0, "address": "Main St"},
            "destination": {"lat": 1.5, "lng": 2.5},
            "fareEstimate": 12.5,
            "vehicleType": "economy",
            "status": "accepted",
            "createdAt": "2024-01-01T00:00:00Z",
            "driver": {"id": "D1", "name": "Sam"}
        });
        let record: RideRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.status, RideStatus::Accepted);
        assert_eq!(record.pickup.address.as_deref(), Some("Main St"));
        assert_eq!(record.driver.unwrap().id, "D1");
        assert!(record.status.ends_polling());
    }

    #[test]
    fn unknown_status_is_tolerated() {
        let status: RideStatus = serde_json::from_value(serde_json::json!("en_route")).unwrap();
        assert_eq!(status, RideStatus::Unknown);
        assert!(!status.ends_polling());
    }
}
