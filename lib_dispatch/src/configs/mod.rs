//! # Configuration Modules
//!
//! Tunables for every component. All durations are carried as millisecond
//! integers so the structs stay trivially (de)serializable from JSON config
//! files; accessor methods hand out `Duration`s.

/// Per-component configuration sections and their defaults.
pub mod dispatch_config;

pub use dispatch_config::{ConnectionConfig, DispatchConfig, RelayConfig, RideConfig};
