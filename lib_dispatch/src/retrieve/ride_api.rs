//! The HTTP actions the dispatch core issues against the backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ActionError;
use crate::models::events::LocationUpdate;
use crate::models::identity::UserRole;
use crate::models::ride::{DriverInfo, NewRide, RideRecord};

/// Body of `PUT /rides/{id}/accept`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptBody {
    pub driver_id: String,
    pub driver: DriverInfo,
}

/// Body of `PUT /rides/{id}/reject`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectBody {
    pub driver_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Body of `PUT /rides/{id}/cancel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBody {
    pub cancelled_by: UserRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[async_trait]
pub trait RideApi: Send + Sync + 'static {
    /// `POST /rides/request`
    async fn request_ride(&self, ride: &NewRide) -> Result<RideRecord, ActionError>;
    /// `PUT /rides/{id}/accept`
    async fn accept_ride(&self, ride_id: &str, body: &AcceptBody) -> Result<RideRecord, ActionError>;
    /// `PUT /rides/{id}/reject`
    async fn reject_ride(&self, ride_id: &str, body: &RejectBody) -> Result<(), ActionError>;
    /// `PUT /rides/{id}/start`
    async fn start_ride(&self, ride_id: &str) -> Result<RideRecord, ActionError>;
    /// `PUT /rides/{id}/complete`
    async fn complete_ride(&self, ride_id: &str) -> Result<RideRecord, ActionError>;
    /// `PUT /rides/{id}/cancel`
    async fn cancel_ride(&self, ride_id: &str, body: &CancelBody) -> Result<(), ActionError>;
    /// `PUT /rides/{id}/location`
    async fn update_location(&self, update: &LocationUpdate) -> Result<(), ActionError>;
    /// `GET /rides/{id}`
    async fn get_ride(&self, ride_id: &str) -> Result<RideRecord, ActionError>;
    /// `GET /rides/pending`
    async fn pending_rides(&self) -> Result<Vec<RideRecord>, ActionError>;
}
