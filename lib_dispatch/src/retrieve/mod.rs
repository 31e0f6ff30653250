//! # Data Retrieval Module
//!
//! HTTP side of the dispatch client.
//!
//! ## Contained Modules:
//!
//! - **`ride_api`**: The [`RideApi`](ride_api::RideApi) trait listing every
//!   client-issued action. The lifecycle controller and the location relay
//!   only ever talk to this trait.
//!
//! - **`ky_http`**: A generic HTTP `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, with automatic retries and exponential backoff for
//!   transient failures.
//!
//! - **`http_ride_api`**: `RideApi` implemented over `ApiClient`, mapping
//!   transport failures to `ActionError::Network` and non-2xx answers to
//!   `ActionError::ServerRejected`.

#![forbid(unsafe_code)]

pub mod ride_api;

#[cfg(feature = "http")]
pub mod ky_http;

#[cfg(feature = "http")]
pub mod http_ride_api;

pub use ride_api::{AcceptBody, CancelBody, RejectBody, RideApi};

#[cfg(feature = "http")]
pub use http_ride_api::HttpRideApi;
