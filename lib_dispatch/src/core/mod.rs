//! # Core Engine Module
//!
//! The moving parts of the dispatch client. Everything here is asynchronous,
//! cheap to clone and safe to share between tasks; mutable state lives behind
//! short-lived locks that are never held across an `.await` or while a
//! callback runs.
//!
//! ## Core Components:
//!
//! - **`event_router`**: The subscription registry for server-pushed events.
//!   Subscriptions outlive transports; each live transport gets exactly one
//!   listener per registered callback, so reconnecting never doubles delivery.
//!
//! - **`connection_manager`**: Owns the single push-channel connection:
//!   registration handshake, heartbeat, health checks and bounded
//!   reconnection with a fixed delay.
//!
//! - **`ride_lifecycle`**: The ride state machine. Applies push events, HTTP
//!   results and its own timers, and queues requests offline when the backend
//!   is unreachable.
//!
//! - **`location_relay`**: Publishes this device's position during a ride and
//!   feeds the counterparty's position back to the map and the state machine.
//!
//! - **`timer`**: Cancel-on-drop handles for every background loop above.
//!
//! - **`transport`**: The `Connector` seam and its WebSocket implementation.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Push-channel lifecycle: connect, register, keep alive, reconnect.
pub mod connection_manager;
/// Fan-out of decoded push events to registered callbacks.
pub mod event_router;
/// Position publishing and counterparty tracking during a ride.
pub mod location_relay;
/// The ride state machine.
pub mod ride_lifecycle;
/// Cancel-on-drop background loops.
pub mod timer;
/// Transport abstraction and the WebSocket connector.
pub mod transport;

// --- Public API Re-exports ---
pub use connection_manager::{ConnectionHandle, ConnectionManager, ConnectionStatus};
pub use event_router::{callback, EventCallback, EventRouter, RouterDiagnostics, Subscription};
pub use location_relay::{
    ArrivalDetector, CounterpartySample, LocationRelay, MapSink, NoMap, NoPosition, PositionSource,
};
pub use ride_lifecycle::{ControllerDeps, RideLifecycleController, RideUpdate, SearchMilestone};
pub use timer::TimerHandle;
pub use transport::{Connector, TransportHandle};
#[cfg(feature = "ws")]
pub use transport::WsConnector;
