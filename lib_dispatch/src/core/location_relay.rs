//! # Location Relay
//!
//! Exchanges positions between the two parties of an active ride.
//!
//! While tracking, the relay samples the local position every second and
//! publishes it on the push channel every publish interval, or sooner when
//! the device moved far enough. If the push channel is down the publish goes
//! over HTTP instead. Counterparty samples arrive as `driver_location_update`
//! pushes (rider side) or, when those go quiet past the stale window, from
//! polling the ride record. Each sample is annotated with the haversine
//! distance to the local party and handed to the map and to the ride
//! controller.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::configs::RelayConfig;
use crate::core::connection_manager::ConnectionManager;
use crate::core::event_router::{callback, Subscription};
use crate::core::timer::TimerHandle;
use crate::models::events::{EventKind, LocationUpdate, OutboundMessage, PushEvent};
use crate::models::identity::UserRole;
use crate::models::location::{LatLng, LocationSample};
use crate::retrieve::RideApi;
use crate::utils::geo::haversine_m;

/// Where the device currently is.
#[async_trait]
pub trait PositionSource: Send + Sync + 'static {
    async fn current_position(&self) -> Option<LatLng>;
}

/// Map rendering collaborator.
pub trait MapSink: Send + Sync + 'static {
    fn show_counterparty(&self, ride_id: &str, sample: &LocationSample, distance_m: Option<f64>);
    fn clear(&self, ride_id: &str);
}

/// Used when the host application has no map.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMap;

impl MapSink for NoMap {
    fn show_counterparty(&self, _ride_id: &str, _sample: &LocationSample, _distance_m: Option<f64>) {}
    fn clear(&self, _ride_id: &str) {}
}

/// Used when no positioning is available; nothing is ever published.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPosition;

#[async_trait]
impl PositionSource for NoPosition {
    async fn current_position(&self) -> Option<LatLng> {
        None
    }
}

/// A counterparty position together with its distance to the local party.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterpartySample {
    pub ride_id: String,
    pub sample: LocationSample,
    /// Unknown until the first local position has been sampled.
    pub distance_m: Option<f64>,
}

pub type SampleHandler = Arc<dyn Fn(&CounterpartySample) + Send + Sync>;

/// Arrival check with hysteresis.
///
/// Fires once when the distance drops below `arm_m`, then stays quiet until
/// the distance has grown past `release_m` again.
#[derive(Debug, Clone)]
pub struct ArrivalDetector {
    arm_m: f64,
    release_m: f64,
    armed: bool,
}

impl ArrivalDetector {
    pub fn new(arm_m: f64, release_m: f64) -> Self {
        Self {
            arm_m,
            release_m: release_m.max(arm_m),
            armed: true,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.arrival_threshold_m, config.arrival_release_m)
    }

    /// Returns true exactly when this sample counts as an arrival.
    pub fn observe(&mut self, distance_m: f64) -> bool {
        if self.armed && distance_m < self.arm_m {
            self.armed = false;
            return true;
        }
        if !self.armed && distance_m > self.release_m {
            self.armed = true;
        }
        false
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn arm_m(&self) -> f64 {
        self.arm_m
    }
}

struct TrackingSession {
    ride_id: String,
    counterparty_id: String,
    last_local: Option<LatLng>,
    last_counterparty: Option<LocationSample>,
    last_counterparty_at: Instant,
    _subscription: Option<Subscription>,
    _publisher: TimerHandle,
    _stale_watch: TimerHandle,
}

struct RelayInner {
    role: UserRole,
    config: RelayConfig,
    connection: ConnectionManager,
    api: Arc<dyn RideApi>,
    position: Arc<dyn PositionSource>,
    map: Arc<dyn MapSink>,
    on_sample: SampleHandler,
    session: Mutex<Option<TrackingSession>>,
}

#[derive(Clone)]
pub struct LocationRelay {
    inner: Arc<RelayInner>,
}

impl LocationRelay {
    pub fn new(
        role: UserRole,
        config: RelayConfig,
        connection: ConnectionManager,
        api: Arc<dyn RideApi>,
        position: Arc<dyn PositionSource>,
        map: Arc<dyn MapSink>,
        on_sample: SampleHandler,
    ) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                role,
                config,
                connection,
                api,
                position,
                map,
                on_sample,
                session: Mutex::new(None),
            }),
        }
    }

    fn upgrade(weak: &Weak<RelayInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn session(&self) -> MutexGuard<'_, Option<TrackingSession>> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn role(&self) -> UserRole {
        self.inner.role
    }

    /// Ride currently tracked, if any.
    pub fn tracking(&self) -> Option<String> {
        self.session().as_ref().map(|s| s.ride_id.clone())
    }

    pub fn counterparty_id(&self) -> Option<String> {
        self.session().as_ref().map(|s| s.counterparty_id.clone())
    }

    pub fn last_counterparty(&self) -> Option<LocationSample> {
        self.session().as_ref().and_then(|s| s.last_counterparty.clone())
    }

    /// Starts exchanging positions for `ride_id`. Replaces any earlier
    /// session; calling it again for the ride already tracked is a no-op.
    pub fn start_tracking(&self, ride_id: &str, counterparty_id: &str) {
        let mut session = self.session();
        if session.as_ref().is_some_and(|s| s.ride_id == ride_id) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let subscription = match self.inner.role {
            UserRole::Rider => {
                let weak = weak.clone();
                Some(self.inner.connection.router().on(
                    EventKind::DriverLocationUpdate,
                    callback(move |event| {
                        if let (PushEvent::DriverLocationUpdate(update), Some(relay)) =
                            (event, LocationRelay::upgrade(&weak))
                        {
                            relay.accept_counterparty(&update.ride_id, update.location);
                        }
                        Ok(())
                    }),
                ))
            }
            // Rider positions only reach the driver through the ride record.
            UserRole::Driver => None,
        };

        let publisher = TimerHandle::spawn(
            "relay-publish",
            publish_loop(weak.clone(), ride_id.to_string(), self.inner.config.clone()),
        );
        let stale_watch = TimerHandle::spawn(
            "relay-stale-watch",
            stale_loop(weak, ride_id.to_string(), self.inner.config.stale_after()),
        );

        let previous = session.replace(TrackingSession {
            ride_id: ride_id.to_string(),
            counterparty_id: counterparty_id.to_string(),
            last_local: None,
            last_counterparty: None,
            last_counterparty_at: Instant::now(),
            _subscription: subscription,
            _publisher: publisher,
            _stale_watch: stale_watch,
        });
        drop(session);

        if let Some(previous) = previous {
            self.inner.map.clear(&previous.ride_id);
        }
        tracing::info!(ride_id, counterparty_id, role = %self.inner.role, "location tracking started");
    }

    /// Stops tracking and releases the subscription and both loops.
    pub fn stop(&self) {
        let previous = self.session().take();
        if let Some(session) = previous {
            self.inner.map.clear(&session.ride_id);
            tracing::info!(ride_id = %session.ride_id, "location tracking stopped");
        }
    }

    /// Stops tracking only if `ride_id` is the ride being tracked.
    pub fn stop_ride(&self, ride_id: &str) {
        let previous = {
            let mut session = self.session();
            if session.as_ref().is_some_and(|s| s.ride_id == ride_id) {
                session.take()
            } else {
                None
            }
        };
        if let Some(session) = previous {
            self.inner.map.clear(&session.ride_id);
            tracing::info!(ride_id, "location tracking stopped");
        }
    }

    /// Feeds one counterparty position into the relay.
    pub fn accept_counterparty(&self, ride_id: &str, location: LatLng) {
        let sample = LocationSample {
            location,
            captured_at: Utc::now(),
            owner: self.inner.role.counterparty(),
        };
        let distance_m = {
            let mut guard = self.session();
            let Some(session) = guard.as_mut().filter(|s| s.ride_id == ride_id) else {
                tracing::debug!(ride_id, "ignoring position for a ride that is not tracked");
                return;
            };
            session.last_counterparty_at = Instant::now();
            session.last_counterparty = Some(sample.clone());
            session.last_local.map(|local| haversine_m(local, location))
        };

        self.inner.map.show_counterparty(ride_id, &sample, distance_m);
        (self.inner.on_sample)(&CounterpartySample {
            ride_id: ride_id.to_string(),
            sample,
            distance_m,
        });
    }

    fn record_local(&self, ride_id: &str, location: LatLng) {
        if let Some(session) = self.session().as_mut().filter(|s| s.ride_id == ride_id) {
            session.last_local = Some(location);
        }
    }

    async fn publish(&self, ride_id: &str, location: LatLng) {
        let update = LocationUpdate {
            ride_id: ride_id.to_string(),
            role: self.inner.role,
            location,
            captured_at: Utc::now(),
        };
        match self
            .inner
            .connection
            .emit(&OutboundMessage::LocationUpdate(update.clone()))
        {
            Ok(()) => tracing::trace!(ride_id, "position published"),
            Err(err) => {
                tracing::debug!(ride_id, error = %err, "push channel unavailable; publishing over http");
                if let Err(err) = self.inner.api.update_location(&update).await {
                    tracing::warn!(ride_id, error = %err, "position publish failed");
                }
            }
        }
    }

    async fn poll_counterparty(&self, ride_id: &str) {
        match self.inner.api.get_ride(ride_id).await {
            Ok(record) => {
                let location = match self.inner.role {
                    UserRole::Rider => record.driver_location,
                    UserRole::Driver => record.rider_location,
                };
                match location {
                    Some(location) => self.accept_counterparty(ride_id, location),
                    None => tracing::debug!(ride_id, "ride record carries no counterparty position"),
                }
            }
            Err(err) => tracing::warn!(ride_id, error = %err, "counterparty position poll failed"),
        }
    }

    fn counterparty_silence(&self, ride_id: &str) -> Option<Duration> {
        self.session()
            .as_ref()
            .filter(|s| s.ride_id == ride_id)
            .map(|s| s.last_counterparty_at.elapsed())
    }
}

async fn publish_loop(weak: Weak<RelayInner>, ride_id: String, config: RelayConfig) {
    let mut sampler = interval(config.sample_interval());
    sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_published: Option<(LatLng, Instant)> = None;

    loop {
        sampler.tick().await;
        let Some(relay) = LocationRelay::upgrade(&weak) else {
            return;
        };
        let Some(position) = relay.inner.position.current_position().await else {
            continue;
        };
        relay.record_local(&ride_id, position);

        let due = match last_published {
            None => true,
            Some((at, sent)) => {
                sent.elapsed() >= config.publish_interval()
                    || haversine_m(at, position) >= config.movement_threshold_m
            }
        };
        if due {
            relay.publish(&ride_id, position).await;
            last_published = Some((position, Instant::now()));
        }
    }
}

async fn stale_loop(weak: Weak<RelayInner>, ride_id: String, stale_after: Duration) {
    let mut next_check = Instant::now() + stale_after;
    loop {
        tokio::time::sleep_until(next_check).await;
        let Some(relay) = LocationRelay::upgrade(&weak) else {
            return;
        };
        let Some(silence) = relay.counterparty_silence(&ride_id) else {
            return;
        };
        if silence >= stale_after {
            tracing::debug!(ride_id, silence_ms = silence.as_millis() as u64, "counterparty stale; polling");
            relay.poll_counterparty(&ride_id).await;
            next_check = Instant::now() + stale_after;
        } else {
            next_check = Instant::now() + (stale_after - silence);
        }
    }
}
