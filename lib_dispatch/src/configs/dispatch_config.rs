use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection lifecycle tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// How long to wait for `registration_confirmed` before re-registering.
    pub registration_grace_ms: u64,
    /// Upper bound on how long opening a transport may take.
    pub connect_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Fixed pause before each reconnection attempt.
    pub reconnect_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Pings closer together than this are suppressed.
    pub ping_debounce_ms: u64,
    /// Round trips slower than this are logged as a degraded connection.
    pub latency_warn_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            registration_grace_ms: 1_000,
            connect_timeout_ms: 10_000,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 2_000,
            heartbeat_interval_ms: 25_000,
            ping_debounce_ms: 20_000,
            latency_warn_ms: 5_000,
            health_check_interval_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    pub fn registration_grace(&self) -> Duration {
        Duration::from_millis(self.registration_grace_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
    pub fn ping_debounce(&self) -> Duration {
        Duration::from_millis(self.ping_debounce_ms)
    }
    pub fn latency_warn(&self) -> Duration {
        Duration::from_millis(self.latency_warn_ms)
    }
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Ride lifecycle timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RideConfig {
    pub search_tick_ms: u64,
    pub search_max_ticks: u32,
    /// Ticks at which progress feedback is surfaced.
    pub search_milestones: Vec<u32>,
    /// Delay after arrival before the ride starts on its own.
    pub arrival_grace_ms: u64,
    /// First wait before resubmitting a locally held request.
    pub resync_initial_delay_ms: u64,
    pub resync_max_delay_ms: u64,
    pub status_poll_interval_ms: u64,
    pub status_poll_max_ms: u64,
    /// Terminal rides kept for inspection.
    pub history_limit: usize,
}

impl Default for RideConfig {
    fn default() -> Self {
        Self {
            search_tick_ms: 1_000,
            search_max_ticks: 30,
            search_milestones: vec![2, 5, 8],
            arrival_grace_ms: 10_000,
            resync_initial_delay_ms: 5_000,
            resync_max_delay_ms: 30_000,
            status_poll_interval_ms: 2_000,
            status_poll_max_ms: 60_000,
            history_limit: 20,
        }
    }
}

impl RideConfig {
    pub fn search_tick(&self) -> Duration {
        Duration::from_millis(self.search_tick_ms)
    }
    pub fn arrival_grace(&self) -> Duration {
        Duration::from_millis(self.arrival_grace_ms)
    }
    pub fn resync_initial_delay(&self) -> Duration {
        Duration::from_millis(self.resync_initial_delay_ms)
    }
    pub fn resync_max_delay(&self) -> Duration {
        Duration::from_millis(self.resync_max_delay_ms)
    }
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
    pub fn status_poll_max(&self) -> Duration {
        Duration::from_millis(self.status_poll_max_ms)
    }
}

/// Location exchange tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelayConfig {
    pub publish_interval_ms: u64,
    /// How often the local position is sampled for movement checks.
    pub sample_interval_ms: u64,
    /// Movement that triggers an out-of-cycle publish.
    pub movement_threshold_m: f64,
    pub arrival_threshold_m: f64,
    /// Distance the counterparty must move away before arrival can fire again.
    pub arrival_release_m: f64,
    /// Silence on the push channel after which the counterparty is polled.
    pub stale_after_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: 5_000,
            sample_interval_ms: 1_000,
            movement_threshold_m: 25.0,
            arrival_threshold_m: 100.0,
            arrival_release_m: 150.0,
            stale_after_ms: 10_000,
        }
    }
}

impl RelayConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Everything the core needs, grouped per component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatchConfig {
    pub ws_url: String,
    pub api_base_url: String,
    pub connection: ConnectionConfig,
    pub ride: RideConfig,
    pub relay: RelayConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:3000/ws".to_string(),
            api_base_url: "http://localhost:3000/api/".to_string(),
            connection: ConnectionConfig::default(),
            ride: RideConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}
