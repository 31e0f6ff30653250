//! # Utilities Module
//!
//! Small, dependency-free helpers used across the crate.
//!
//! ## Contained Modules:
//!
//! - **`geo`**: great-circle distance between two coordinates.
//! - **`time`**: wall-clock helpers for wire timestamps.

#![forbid(unsafe_code)]

/// Great-circle distance calculations.
pub mod geo;
/// Wall-clock helpers.
pub mod time;
