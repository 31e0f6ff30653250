//! Push events and outbound frames.
//!
//! Every frame on the wire is a JSON text message of the form
//! `{"event": "<name>", "data": { ... }}`. Inbound names are resolved against
//! the closed [`EventKind`] set first; the payload is then decoded into the
//! typed body for that kind. Anything that fails either step is reported as a
//! [`FrameError`] so the router can account for it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::identity::UserRole;
use crate::models::location::LatLng;
use crate::models::ride::DriverInfo;

/// Every server-pushed event this client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    RegistrationConfirmed,
    RideAccepted,
    RideRejected,
    RideStarted,
    RideCompleted,
    RideCancelled,
    NoDriversAvailable,
    DriverLocationUpdate,
    Pong,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::RegistrationConfirmed,
        EventKind::RideAccepted,
        EventKind::RideRejected,
        EventKind::RideStarted,
        EventKind::RideCompleted,
        EventKind::RideCancelled,
        EventKind::NoDriversAvailable,
        EventKind::DriverLocationUpdate,
        EventKind::Pong,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventKind::RegistrationConfirmed => "registration_confirmed",
            EventKind::RideAccepted => "ride_accepted",
            EventKind::RideRejected => "ride_rejected",
            EventKind::RideStarted => "ride_started",
            EventKind::RideCompleted => "ride_completed",
            EventKind::RideCancelled => "ride_cancelled",
            EventKind::NoDriversAvailable => "no_drivers_available",
            EventKind::DriverLocationUpdate => "driver_location_update",
            EventKind::Pong => "pong",
        }
    }

    pub fn from_name(name: &str) -> Option<EventKind> {
        EventKind::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideAccepted {
    pub ride_id: String,
    pub driver: DriverInfo,
    /// Minutes until the driver reaches the pickup point.
    #[serde(default)]
    pub estimated_arrival: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRejected {
    pub ride_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRef {
    pub ride_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideCompleted {
    pub ride_id: String,
    #[serde(default)]
    pub fare: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideCancelled {
    pub ride_id: String,
    #[serde(default)]
    pub cancelled_by: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverLocationUpdate {
    pub ride_id: String,
    pub location: LatLng,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Milliseconds since the Unix epoch, echoed from the ping.
    pub timestamp: i64,
}

/// A decoded server push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    RegistrationConfirmed,
    RideAccepted(RideAccepted),
    RideRejected(RideRejected),
    RideStarted(RideRef),
    RideCompleted(RideCompleted),
    RideCancelled(RideCancelled),
    NoDriversAvailable(RideRef),
    DriverLocationUpdate(DriverLocationUpdate),
    Pong(Pong),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    NotJson(String),
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("malformed '{event}' payload: {reason}")]
    Malformed { event: EventKind, reason: String },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

fn payload<T: DeserializeOwned>(kind: EventKind, data: Value) -> Result<T, FrameError> {
    serde_json::from_value(data).map_err(|e| FrameError::Malformed {
        event: kind,
        reason: e.to_string(),
    })
}

impl PushEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PushEvent::RegistrationConfirmed => EventKind::RegistrationConfirmed,
            PushEvent::RideAccepted(_) => EventKind::RideAccepted,
            PushEvent::RideRejected(_) => EventKind::RideRejected,
            PushEvent::RideStarted(_) => EventKind::RideStarted,
            PushEvent::RideCompleted(_) => EventKind::RideCompleted,
            PushEvent::RideCancelled(_) => EventKind::RideCancelled,
            PushEvent::NoDriversAvailable(_) => EventKind::NoDriversAvailable,
            PushEvent::DriverLocationUpdate(_) => EventKind::DriverLocationUpdate,
            PushEvent::Pong(_) => EventKind::Pong,
        }
    }

    /// The ride the event refers to, when it carries one.
    pub fn ride_id(&self) -> Option<&str> {
        match self {
            PushEvent::RideAccepted(e) => Some(&e.ride_id),
            PushEvent::RideRejected(e) => Some(&e.ride_id),
            PushEvent::RideStarted(e) | PushEvent::NoDriversAvailable(e) => Some(&e.ride_id),
            PushEvent::RideCompleted(e) => Some(&e.ride_id),
            PushEvent::RideCancelled(e) => Some(&e.ride_id),
            PushEvent::DriverLocationUpdate(e) => Some(&e.ride_id),
            PushEvent::RegistrationConfirmed | PushEvent::Pong(_) => None,
        }
    }

    /// Decodes a named event with a JSON payload.
    pub fn decode(name: &str, data: Value) -> Result<PushEvent, FrameError> {
        let kind =
            EventKind::from_name(name).ok_or_else(|| FrameError::UnknownEvent(name.to_string()))?;
        let event = match kind {
            EventKind::RegistrationConfirmed => PushEvent::RegistrationConfirmed,
            EventKind::RideAccepted => PushEvent::RideAccepted(payload(kind, data)?),
            EventKind::RideRejected => PushEvent::RideRejected(payload(kind, data)?),
            EventKind::RideStarted => PushEvent::RideStarted(payload(kind, data)?),
            EventKind::RideCompleted => PushEvent::RideCompleted(payload(kind, data)?),
            EventKind::RideCancelled => PushEvent::RideCancelled(payload(kind, data)?),
            EventKind::NoDriversAvailable => PushEvent::NoDriversAvailable(payload(kind, data)?),
            EventKind::DriverLocationUpdate => {
                PushEvent::DriverLocationUpdate(payload(kind, data)?)
            }
            EventKind::Pong => PushEvent::Pong(payload(kind, data)?),
        };
        Ok(event)
    }

    /// Decodes a complete text frame.
    pub fn from_frame(text: &str) -> Result<PushEvent, FrameError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| FrameError::NotJson(e.to_string()))?;
        PushEvent::decode(&raw.event, raw.data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub ride_id: String,
    pub role: UserRole,
    pub location: LatLng,
    pub captured_at: DateTime<Utc>,
}

/// Frames the client pushes to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    #[serde(rename_all = "camelCase")]
    Register { role: UserRole, user_id: String },
    Ping { timestamp: i64 },
    LocationUpdate(LocationUpdate),
}

impl OutboundMessage {
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
