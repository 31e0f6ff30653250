//! Client core for a real-time ride-dispatch system.
//!
//! A rider or driver device keeps one push connection to the dispatch
//! backend, routes the events it receives to subscribers, drives each ride
//! request through its lifecycle and exchanges positions with the other party
//! while the ride is under way. Everything is reached through a
//! [`DispatchContext`] owned by the application.

// Declare the modules to re-export
pub mod configs;
pub mod context;
pub mod core;
pub mod error;
pub mod models;
pub mod outbox;
pub mod retrieve;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export the pieces an application needs to get started
pub use configs::{ConnectionConfig, DispatchConfig, RelayConfig, RideConfig};
pub use context::{DispatchContext, DispatchContextBuilder};
pub use error::{ActionError, ContextError, RideError, StoreError, TransportError};
pub use models::*;
pub use outbox::{JsonFilePendingStore, MemoryPendingStore, PendingRide, PendingStore};
