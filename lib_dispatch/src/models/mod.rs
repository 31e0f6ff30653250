//! # Data Model
//!
//! Wire and domain types shared by every component: user identity, positions,
//! ride requests and the push-event taxonomy.

pub mod events;
pub mod identity;
pub mod location;
pub mod ride;

pub use events::{EventKind, FrameError, OutboundMessage, PushEvent};
pub use identity::{Identity, UserRole};
pub use location::{LatLng, LocationSample, Place};
pub use ride::{
    DriverInfo, NewRide, RideRecord, RideRequest, RideState, RideStatus, VehicleInfo, VehicleType,
};
