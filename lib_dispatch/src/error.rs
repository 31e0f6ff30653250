//! # Error Types
//!
//! Failures are split by who has to deal with them. Transport problems are
//! recovered inside the connection manager and only escape once reconnection
//! gives up. Action failures come from HTTP calls and are handed to the caller
//! as-is so the user can decide what to do. Ride errors wrap action failures
//! together with state-machine violations.

use std::time::Duration;

use thiserror::Error;

use crate::models::identity::UserRole;
use crate::models::ride::RideState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to open transport: {0}")]
    Connect(String),
    #[error("transport did not open within {0:?}")]
    Timeout(Duration),
    #[error("a connection attempt is already in progress")]
    ConnectInProgress,
    #[error("not connected")]
    NotConnected,
    #[error("transport closed")]
    Closed,
    #[error("failed to encode outbound frame: {0}")]
    Encode(String),
}

/// A failed HTTP action against the dispatch backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(String),
    /// The backend answered with a non-success status.
    #[error("server rejected request ({status}): {message}")]
    ServerRejected { status: u16, message: String },
    /// The response body could not be understood.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl ActionError {
    /// Network failures are the only ones worth retrying blindly.
    pub fn is_network(&self) -> bool {
        matches!(self, ActionError::Network(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),
    #[error("pending store is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RideError {
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error("rider {0} already has an active ride")]
    AlreadyActive(String),
    #[error("no active ride")]
    NoActiveRide,
    #[error("cannot {action} while ride is {state}")]
    InvalidTransition { action: &'static str, state: RideState },
    #[error("cannot {action} as a {role}")]
    WrongRole { action: &'static str, role: UserRole },
    #[error("ride {0} has not been confirmed by the server yet")]
    NotSubmitted(String),
    #[error("pending store failure: {0}")]
    Store(#[from] StoreError),
}

/// Failures while assembling or starting a [`DispatchContext`](crate::context::DispatchContext).
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("no {0} configured and the default implementation is not compiled in")]
    Missing(&'static str),
    #[error("invalid API configuration: {0}")]
    Api(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Ride(#[from] RideError),
}
