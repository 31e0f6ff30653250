//! # Ride Lifecycle Controller
//!
//! Drives one ride at a time through its states:
//!
//! ```text
//! idle → requesting → searching → accepted → driver_en_route → driver_arrived → in_progress → completed
//!                              └→ search_timed_out
//! any non-terminal state → cancelled
//! ```
//!
//! Inputs are push events from the [`EventRouter`](crate::core::EventRouter),
//! HTTP actions issued by the caller, counterparty samples from the
//! [`LocationRelay`] and the controller's own timers. Every timer is owned by
//! the ride that started it and [`RideTimers::retain_for`] drops the ones that
//! do not belong to the next state on every transition, so a state can never
//! be left with a stale countdown running.
//!
//! When the backend cannot be reached at request time, the ride is written to
//! the outbox and kept locally as a fallback until a background worker gets
//! it accepted. Updates for the UI are published on a broadcast channel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::configs::{RelayConfig, RideConfig};
use crate::core::connection_manager::{ConnectionManager, ConnectionStatus};
use crate::core::event_router::{callback, Subscription};
use crate::core::location_relay::{
    ArrivalDetector, CounterpartySample, LocationRelay, MapSink, PositionSource,
};
use crate::core::timer::TimerHandle;
use crate::error::{ActionError, RideError};
use crate::models::events::{EventKind, PushEvent};
use crate::models::identity::{Identity, UserRole};
use crate::models::location::LatLng;
use crate::models::ride::{DriverInfo, NewRide, RideRecord, RideRequest, RideState, RideStatus};
use crate::outbox::{PendingRide, PendingStore, ResyncBackoff};
use crate::retrieve::{AcceptBody, CancelBody, RejectBody, RideApi};

const UPDATE_CAPACITY: usize = 64;

/// Search progress feedback. Purely informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMilestone {
    ScanningArea,
    LocatingDrivers,
    ContactingDrivers,
}

impl SearchMilestone {
    fn from_index(index: usize) -> Self {
        match index {
            0 => SearchMilestone::ScanningArea,
            1 => SearchMilestone::LocatingDrivers,
            _ => SearchMilestone::ContactingDrivers,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            SearchMilestone::ScanningArea => "Scanning area",
            SearchMilestone::LocatingDrivers => "Locating drivers",
            SearchMilestone::ContactingDrivers => "Contacting drivers",
        }
    }
}

/// Everything the controller reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum RideUpdate {
    StateChanged {
        ride_id: String,
        from: RideState,
        to: RideState,
    },
    SearchProgress {
        ride_id: String,
        tick: u32,
        milestone: SearchMilestone,
    },
    /// The search ended without a driver. Sent once per ride.
    NoDriversAvailable { ride_id: String },
    DriverAssigned {
        ride_id: String,
        driver: DriverInfo,
        estimated_arrival: Option<u32>,
    },
    /// A driver turned the request down; the search continues.
    Rejected {
        ride_id: String,
        reason: Option<String>,
    },
    CounterpartyLocation {
        ride_id: String,
        location: LatLng,
        distance_m: Option<f64>,
    },
    /// The backend could not be reached; the request sits in the outbox.
    QueuedOffline { local_id: String },
    /// A queued request was accepted by the backend under `ride_id`.
    Resynced { local_id: String, ride_id: String },
    Completed {
        ride_id: String,
        fare: Option<f64>,
    },
    Cancelled {
        ride_id: String,
        cancelled_by: Option<String>,
        reason: Option<String>,
    },
}

/// Timers a ride may own. Each one is only valid in a single state.
#[derive(Debug, Default)]
struct RideTimers {
    search: Option<TimerHandle>,
    status_poll: Option<TimerHandle>,
    arrival_grace: Option<TimerHandle>,
    resync: Option<TimerHandle>,
}

impl RideTimers {
    /// Drops every timer that does not belong to `state`.
    fn retain_for(&mut self, state: RideState) {
        if state != RideState::Searching {
            self.search = None;
            self.status_poll = None;
        }
        if state != RideState::DriverArrived {
            self.arrival_grace = None;
        }
        if state != RideState::Requesting {
            self.resync = None;
        }
    }

    fn names(&self) -> Vec<&'static str> {
        [
            self.search.as_ref(),
            self.status_poll.as_ref(),
            self.arrival_grace.as_ref(),
            self.resync.as_ref(),
        ]
        .into_iter()
        .flatten()
        .map(TimerHandle::name)
        .collect()
    }
}

struct ActiveRide {
    request: RideRequest,
    counterparty_id: Option<String>,
    arrival: ArrivalDetector,
    search_ticks: u32,
    timers: RideTimers,
}

#[derive(Default)]
struct ControllerState {
    active: Option<ActiveRide>,
    history: VecDeque<RideRequest>,
    /// Outbox workers for entries that are not the active ride.
    orphan_resyncs: HashMap<String, TimerHandle>,
    /// Local ids with a resubmission on the wire.
    resubmitting: HashSet<String>,
    /// Local ids cancelled while their resubmission was on the wire. The
    /// attempt that comes back cancels whatever the backend created.
    withdrawn: HashSet<String>,
}

fn active_mut<'a>(state: &'a mut ControllerState, ride_id: &str) -> Option<&'a mut ActiveRide> {
    state.active.as_mut().filter(|r| r.request.id == ride_id)
}

/// Collaborators handed to [`RideLifecycleController::new`].
pub struct ControllerDeps {
    pub identity: Identity,
    pub ride_config: RideConfig,
    pub relay_config: RelayConfig,
    pub connection: ConnectionManager,
    pub api: Arc<dyn RideApi>,
    pub store: Arc<dyn PendingStore>,
    pub position: Arc<dyn PositionSource>,
    pub map: Arc<dyn MapSink>,
}

struct ControllerInner {
    identity: Identity,
    config: RideConfig,
    relay_config: RelayConfig,
    connection: ConnectionManager,
    api: Arc<dyn RideApi>,
    store: Arc<dyn PendingStore>,
    relay: LocationRelay,
    driver_profile: Mutex<DriverInfo>,
    updates: broadcast::Sender<RideUpdate>,
    state: Mutex<ControllerState>,
    _subscriptions: Vec<Subscription>,
}

#[derive(Clone)]
pub struct RideLifecycleController {
    inner: Arc<ControllerInner>,
}

impl RideLifecycleController {
    pub fn new(deps: ControllerDeps) -> Self {
        let ControllerDeps {
            identity,
            ride_config,
            relay_config,
            connection,
            api,
            store,
            position,
            map,
        } = deps;
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);

        let inner = Arc::new_cyclic(|weak: &Weak<ControllerInner>| {
            let sample_weak = weak.clone();
            let relay = LocationRelay::new(
                identity.role,
                relay_config.clone(),
                connection.clone(),
                api.clone(),
                position,
                map,
                Arc::new(move |sample: &CounterpartySample| {
                    if let Some(controller) = RideLifecycleController::upgrade(&sample_weak) {
                        controller.on_counterparty_sample(sample);
                    }
                }),
            );

            let subscriptions = [
                EventKind::RideAccepted,
                EventKind::RideRejected,
                EventKind::RideStarted,
                EventKind::RideCompleted,
                EventKind::RideCancelled,
                EventKind::NoDriversAvailable,
            ]
            .into_iter()
            .map(|kind| {
                let weak = weak.clone();
                connection.router().on(
                    kind,
                    callback(move |event| {
                        if let Some(controller) = RideLifecycleController::upgrade(&weak) {
                            controller.on_push(event);
                        }
                        Ok(())
                    }),
                )
            })
            .collect();

            ControllerInner {
                driver_profile: Mutex::new(DriverInfo::with_id(identity.user_id.clone())),
                identity,
                config: ride_config,
                relay_config,
                connection,
                api,
                store,
                relay,
                updates,
                state: Mutex::new(ControllerState::default()),
                _subscriptions: subscriptions,
            }
        });

        Self { inner }
    }

    fn upgrade(weak: &Weak<ControllerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, update: RideUpdate) {
        // No receivers is fine.
        let _ = self.inner.updates.send(update);
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RideUpdate> {
        self.inner.updates.subscribe()
    }

    /// The current ride, including a terminal one not yet dismissed.
    pub fn current_ride(&self) -> Option<RideRequest> {
        self.state().active.as_ref().map(|r| r.request.clone())
    }

    pub fn ride_state(&self) -> RideState {
        self.state()
            .active
            .as_ref()
            .map_or(RideState::Idle, |r| r.request.state)
    }

    /// Search ticks counted for the current ride.
    pub fn search_ticks(&self) -> u32 {
        self.state().active.as_ref().map_or(0, |r| r.search_ticks)
    }

    /// Names of the timers the current ride owns.
    pub fn active_timers(&self) -> Vec<&'static str> {
        self.state()
            .active
            .as_ref()
            .map(|r| r.timers.names())
            .unwrap_or_default()
    }

    /// Archived terminal rides, oldest first.
    pub fn history(&self) -> Vec<RideRequest> {
        self.state().history.iter().cloned().collect()
    }

    pub fn relay(&self) -> &LocationRelay {
        &self.inner.relay
    }

    pub fn set_driver_profile(&self, mut profile: DriverInfo) {
        profile.id = self.inner.identity.user_id.clone();
        *self
            .inner
            .driver_profile
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = profile;
    }

    /// Moves a finished ride into history. Returns whether one was archived.
    pub fn dismiss(&self) -> bool {
        let mut state = self.state();
        self.archive_terminal(&mut state)
    }

    fn archive_terminal(&self, state: &mut ControllerState) -> bool {
        if !state
            .active
            .as_ref()
            .is_some_and(|r| r.request.state.is_terminal())
        {
            return false;
        }
        let Some(ride) = state.active.take() else {
            return false;
        };
        state.history.push_back(ride.request);
        while state.history.len() > self.inner.config.history_limit {
            state.history.pop_front();
        }
        true
    }

    fn require_role(&self, role: UserRole, action: &'static str) -> Result<(), RideError> {
        if self.inner.identity.role == role {
            Ok(())
        } else {
            Err(RideError::WrongRole {
                action,
                role: self.inner.identity.role,
            })
        }
    }

    fn new_ride(&self, request: RideRequest) -> ActiveRide {
        ActiveRide {
            request,
            counterparty_id: None,
            arrival: ArrivalDetector::from_config(&self.inner.relay_config),
            search_ticks: 0,
            timers: RideTimers::default(),
        }
    }

    // ---------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------

    /// The only place a ride changes state.
    fn transition(&self, ride: &mut ActiveRide, to: RideState) {
        let from = ride.request.state;
        if from == to {
            return;
        }
        ride.request.state = to;
        ride.timers.retain_for(to);

        let weak = Arc::downgrade(&self.inner);
        let ride_id = ride.request.id.clone();
        match to {
            RideState::Searching => {
                ride.search_ticks = 0;
                ride.timers.search = Some(TimerHandle::spawn(
                    "search",
                    search_loop(weak.clone(), ride_id.clone(), self.inner.config.clone()),
                ));
                ride.timers.status_poll = Some(TimerHandle::spawn(
                    "status-poll",
                    status_poll_loop(
                        weak,
                        ride_id.clone(),
                        self.inner.connection.watch_status(),
                        self.inner.config.clone(),
                    ),
                ));
            }
            RideState::DriverArrived => {
                let grace = self.inner.config.arrival_grace();
                let grace_ride = ride_id.clone();
                ride.timers.arrival_grace = Some(TimerHandle::spawn("arrival-grace", async move {
                    tokio::time::sleep(grace).await;
                    if let Some(controller) = RideLifecycleController::upgrade(&weak) {
                        controller.on_arrival_grace(&grace_ride);
                    }
                }));
            }
            _ => {}
        }

        if to.is_tracking() {
            if let Some(counterparty) = &ride.counterparty_id {
                self.inner.relay.start_tracking(&ride_id, counterparty);
            }
        } else {
            self.inner.relay.stop_ride(&ride_id);
        }

        tracing::info!(ride_id = %ride_id, %from, %to, "ride state changed");
        self.emit(RideUpdate::StateChanged { ride_id, from, to });
    }

    fn time_out(&self, ride: &mut ActiveRide) {
        tracing::warn!(ride_id = %ride.request.id, ticks = ride.search_ticks, "no drivers available");
        self.emit(RideUpdate::NoDriversAvailable {
            ride_id: ride.request.id.clone(),
        });
        self.transition(ride, RideState::SearchTimedOut);
    }

    fn assign_driver(&self, ride: &mut ActiveRide, driver: Option<DriverInfo>, eta: Option<u32>) {
        if let Some(driver) = &driver {
            ride.counterparty_id = Some(driver.id.clone());
            self.emit(RideUpdate::DriverAssigned {
                ride_id: ride.request.id.clone(),
                driver: driver.clone(),
                estimated_arrival: eta,
            });
        }
        ride.request.driver = driver;
        self.transition(ride, RideState::Accepted);
    }

    fn on_push(&self, event: &PushEvent) {
        let Some(ride_id) = event.ride_id() else {
            return;
        };
        let mut state = self.state();
        let Some(ride) = active_mut(&mut state, ride_id) else {
            tracing::debug!(event = %event.kind(), ride_id, "push for a ride that is not active");
            return;
        };
        let current = ride.request.state;

        match event {
            PushEvent::RideAccepted(accepted) => {
                if current != RideState::Searching {
                    tracing::info!(ride_id, state = %current, "ignoring acceptance outside search");
                    return;
                }
                self.assign_driver(
                    ride,
                    Some(accepted.driver.clone()),
                    accepted.estimated_arrival,
                );
            }
            PushEvent::RideRejected(rejected) => {
                if !current.is_terminal() {
                    tracing::info!(ride_id, reason = ?rejected.reason, "ride rejected by a driver");
                    self.emit(RideUpdate::Rejected {
                        ride_id: ride_id.to_string(),
                        reason: rejected.reason.clone(),
                    });
                }
            }
            PushEvent::RideStarted(_) => {
                if matches!(
                    current,
                    RideState::Accepted | RideState::DriverEnRoute | RideState::DriverArrived
                ) {
                    self.transition(ride, RideState::InProgress);
                }
            }
            PushEvent::RideCompleted(completed) => {
                if !current.is_terminal() {
                    self.emit(RideUpdate::Completed {
                        ride_id: ride_id.to_string(),
                        fare: completed.fare,
                    });
                    self.transition(ride, RideState::Completed);
                }
            }
            PushEvent::RideCancelled(cancelled) => {
                if !current.is_terminal() {
                    self.emit(RideUpdate::Cancelled {
                        ride_id: ride_id.to_string(),
                        cancelled_by: cancelled.cancelled_by.clone(),
                        reason: cancelled.reason.clone(),
                    });
                    self.transition(ride, RideState::Cancelled);
                }
            }
            PushEvent::NoDriversAvailable(_) => {
                if current == RideState::Searching {
                    self.time_out(ride);
                }
            }
            _ => {}
        }
    }

    /// Returns whether the search should keep ticking.
    fn on_search_tick(&self, ride_id: &str, tick: u32) -> bool {
        let mut state = self.state();
        let Some(ride) = active_mut(&mut state, ride_id)
            .filter(|r| r.request.state == RideState::Searching)
        else {
            return false;
        };
        ride.search_ticks = tick;

        if let Some(index) = self
            .inner
            .config
            .search_milestones
            .iter()
            .position(|&t| t == tick)
        {
            let milestone = SearchMilestone::from_index(index);
            tracing::debug!(ride_id, tick, milestone = milestone.message(), "search progress");
            self.emit(RideUpdate::SearchProgress {
                ride_id: ride_id.to_string(),
                tick,
                milestone,
            });
        }

        if tick >= self.inner.config.search_max_ticks {
            self.time_out(ride);
            return false;
        }
        true
    }

    /// Applies a polled ride record. Returns whether polling should stop.
    fn on_polled_status(&self, ride_id: &str, record: &RideRecord) -> bool {
        let mut state = self.state();
        let Some(ride) = active_mut(&mut state, ride_id)
            .filter(|r| r.request.state == RideState::Searching)
        else {
            return true;
        };

        if record.status == RideStatus::NoDrivers {
            self.time_out(ride);
            return true;
        }
        if !record.status.ends_polling() {
            return false;
        }

        match record.status {
            RideStatus::Accepted | RideStatus::InProgress => {
                tracing::info!(ride_id, status = ?record.status, "status poll found the ride assigned");
                self.assign_driver(ride, record.driver.clone(), None);
                if record.status == RideStatus::InProgress {
                    self.transition(ride, RideState::InProgress);
                }
            }
            RideStatus::Completed => {
                self.emit(RideUpdate::Completed {
                    ride_id: ride_id.to_string(),
                    fare: record.fare,
                });
                self.transition(ride, RideState::Completed);
            }
            RideStatus::Cancelled => {
                self.emit(RideUpdate::Cancelled {
                    ride_id: ride_id.to_string(),
                    cancelled_by: None,
                    reason: None,
                });
                self.transition(ride, RideState::Cancelled);
            }
            _ => {}
        }
        true
    }

    fn on_arrival_grace(&self, ride_id: &str) {
        let mut state = self.state();
        if let Some(ride) = active_mut(&mut state, ride_id)
            .filter(|r| r.request.state == RideState::DriverArrived)
        {
            tracing::info!(ride_id, "arrival grace elapsed; starting ride");
            self.transition(ride, RideState::InProgress);
        }
    }

    fn on_counterparty_sample(&self, sample: &CounterpartySample) {
        let mut state = self.state();
        let Some(ride) = active_mut(&mut state, &sample.ride_id) else {
            return;
        };
        self.emit(RideUpdate::CounterpartyLocation {
            ride_id: sample.ride_id.clone(),
            location: sample.sample.location,
            distance_m: sample.distance_m,
        });

        let Some(distance) = sample.distance_m else {
            return;
        };
        let arrived = ride.arrival.observe(distance);
        match ride.request.state {
            RideState::Accepted | RideState::DriverEnRoute if arrived => {
                tracing::info!(ride_id = %sample.ride_id, distance_m = distance, "counterparty arrived");
                self.transition(ride, RideState::DriverArrived);
            }
            RideState::Accepted if distance >= ride.arrival.arm_m() => {
                self.transition(ride, RideState::DriverEnRoute);
            }
            _ => {}
        }
    }

    // ---------------------------------------------------------------------
    // Outbox
    // ---------------------------------------------------------------------

    fn spawn_resync(&self, entry: PendingRide) -> TimerHandle {
        TimerHandle::spawn(
            "outbox-resync",
            resync_loop(
                Arc::downgrade(&self.inner),
                entry,
                ResyncBackoff::new(
                    self.inner.config.resync_initial_delay(),
                    self.inner.config.resync_max_delay(),
                ),
            ),
        )
    }

    /// Hands a resubmitted ride to the controller. Returns false when the
    /// queued request was cancelled in the meantime and the backend copy has
    /// to be cancelled too.
    fn on_resynced(&self, local_id: &str, record: RideRecord) -> bool {
        let mut state = self.state();
        let orphan = state.orphan_resyncs.remove(local_id);
        state.resubmitting.remove(local_id);

        let withdrawn = state.withdrawn.remove(local_id)
            || state
                .active
                .as_ref()
                .is_some_and(|r| r.request.id == local_id && r.request.state.is_terminal());
        if withdrawn {
            drop(state);
            drop(orphan);
            tracing::warn!(local_id, ride_id = %record.id, "queued ride was cancelled while resubmitting");
            return false;
        }

        let adopt = match state.active.as_ref() {
            Some(ride) if ride.request.id == local_id && ride.request.is_local_fallback => true,
            Some(ride) if !ride.request.state.is_terminal() => false,
            _ => {
                self.inner.identity.role == UserRole::Rider
                    && record.rider_id == self.inner.identity.user_id
            }
        };

        tracing::info!(local_id, ride_id = %record.id, adopt, "queued ride accepted by backend");
        self.emit(RideUpdate::Resynced {
            local_id: local_id.to_string(),
            ride_id: record.id.clone(),
        });

        if adopt {
            let current = state.active.as_ref().is_some_and(|r| r.request.id == local_id);
            if !current {
                self.archive_terminal(&mut state);
            }
            let mut ride = match state.active.take() {
                Some(ride) if current => ride,
                other => {
                    state.active = other;
                    self.new_ride(RideRequest::from_record(&record, RideState::Requesting))
                }
            };
            ride.request = RideRequest::from_record(&record, RideState::Requesting);
            self.transition(&mut ride, RideState::Searching);
            state.active = Some(ride);
        }
        drop(state);
        drop(orphan);
        true
    }

    /// Ends a resubmission that did not reach the backend. Returns whether
    /// the queued request was cancelled while it was out.
    fn finish_resubmit(&self, local_id: &str) -> bool {
        let mut state = self.state();
        state.resubmitting.remove(local_id);
        state.withdrawn.remove(local_id)
    }

    fn on_resync_refused(&self, local_id: &str, err: &ActionError) {
        let mut state = self.state();
        let orphan = state.orphan_resyncs.remove(local_id);
        state.resubmitting.remove(local_id);
        state.withdrawn.remove(local_id);
        if let Some(ride) = active_mut(&mut state, local_id) {
            self.emit(RideUpdate::Cancelled {
                ride_id: local_id.to_string(),
                cancelled_by: None,
                reason: Some(err.to_string()),
            });
            self.transition(ride, RideState::Cancelled);
        }
        drop(state);
        drop(orphan);
    }

    /// Resumes outbox entries left behind by a previous run. An entry for
    /// this rider becomes the current ride when no other ride is active.
    pub async fn resume_pending(&self) -> Result<usize, RideError> {
        let entries = self.inner.store.list().await?;
        let mut state = self.state();
        let mut resumed = 0;

        for entry in entries {
            let tracked = state
                .active
                .as_ref()
                .is_some_and(|r| r.request.id == entry.local_id)
                || state.orphan_resyncs.contains_key(&entry.local_id);
            if tracked {
                continue;
            }

            let adopt = self.inner.identity.role == UserRole::Rider
                && entry.ride.rider_id == self.inner.identity.user_id
                && state
                    .active
                    .as_ref()
                    .map_or(true, |r| r.request.state.is_terminal());

            if adopt {
                self.archive_terminal(&mut state);
                let mut request = RideRequest::local_fallback(entry.local_id.clone(), &entry.ride);
                request.created_at = entry.queued_at;
                let mut ride = self.new_ride(request);
                let local_id = entry.local_id.clone();
                ride.timers.resync = Some(self.spawn_resync(entry));
                state.active = Some(ride);
                self.emit(RideUpdate::StateChanged {
                    ride_id: local_id.clone(),
                    from: RideState::Idle,
                    to: RideState::Requesting,
                });
                self.emit(RideUpdate::QueuedOffline { local_id });
            } else {
                let local_id = entry.local_id.clone();
                let worker = self.spawn_resync(entry);
                state.orphan_resyncs.insert(local_id, worker);
            }
            resumed += 1;
        }

        if resumed > 0 {
            tracing::info!(resumed, "resumed queued ride requests");
        }
        Ok(resumed)
    }

    // ---------------------------------------------------------------------
    // Rider actions
    // ---------------------------------------------------------------------

    /// Submits a ride request.
    ///
    /// On success the ride is searching. If the backend cannot be reached the
    /// request is queued in the outbox and returned with `is_local_fallback`
    /// set; any other failure is returned as-is and leaves no ride behind.
    pub async fn request_ride(&self, ride: NewRide) -> Result<RideRequest, RideError> {
        self.require_role(UserRole::Rider, "request a ride")?;
        let local_id = format!("local-{}", Uuid::new_v4());

        {
            let mut state = self.state();
            if state
                .active
                .as_ref()
                .is_some_and(|r| !r.request.state.is_terminal())
            {
                return Err(RideError::AlreadyActive(ride.rider_id.clone()));
            }
            self.archive_terminal(&mut state);
            let mut request = RideRequest::local_fallback(local_id.clone(), &ride);
            request.is_local_fallback = false;
            state.active = Some(self.new_ride(request));
        }
        self.emit(RideUpdate::StateChanged {
            ride_id: local_id.clone(),
            from: RideState::Idle,
            to: RideState::Requesting,
        });

        match self.inner.api.request_ride(&ride).await {
            Ok(record) => {
                let mut state = self.state();
                let Some(active) = active_mut(&mut state, &local_id) else {
                    return Err(RideError::NoActiveRide);
                };
                active.request = RideRequest::from_record(&record, RideState::Requesting);
                self.transition(active, RideState::Searching);
                Ok(active.request.clone())
            }
            Err(err) if err.is_network() => self.queue_offline(local_id, ride, err).await,
            Err(err) => {
                tracing::warn!(error = %err, "ride request refused");
                self.abandon_request(&local_id);
                Err(err.into())
            }
        }
    }

    fn abandon_request(&self, local_id: &str) {
        let mut state = self.state();
        if state.active.as_ref().is_some_and(|r| r.request.id == local_id) {
            state.active = None;
            drop(state);
            self.emit(RideUpdate::StateChanged {
                ride_id: local_id.to_string(),
                from: RideState::Requesting,
                to: RideState::Idle,
            });
        }
    }

    async fn queue_offline(
        &self,
        local_id: String,
        ride: NewRide,
        cause: ActionError,
    ) -> Result<RideRequest, RideError> {
        tracing::warn!(local_id, error = %cause, "backend unreachable; queueing ride request");
        let entry = PendingRide::new(local_id.clone(), ride);
        if let Err(err) = self.inner.store.put(&entry).await {
            tracing::error!(local_id, error = %err, "failed to queue ride request");
            self.abandon_request(&local_id);
            return Err(err.into());
        }

        let mut state = self.state();
        let Some(active) = active_mut(&mut state, &local_id) else {
            return Err(RideError::NoActiveRide);
        };
        active.request.is_local_fallback = true;
        active.timers.resync = Some(self.spawn_resync(entry));
        let request = active.request.clone();
        drop(state);

        self.emit(RideUpdate::QueuedOffline { local_id });
        Ok(request)
    }

    /// Cancels the current ride. A queued request is dropped from the outbox;
    /// anything else is cancelled on the backend first and only changes state
    /// once the backend agreed.
    pub async fn cancel_ride(&self, reason: Option<String>) -> Result<(), RideError> {
        let (ride_id, queued, worker) = {
            let mut state = self.state();
            let ControllerState {
                active,
                resubmitting,
                withdrawn,
                ..
            } = &mut *state;
            let ride = active.as_mut().ok_or(RideError::NoActiveRide)?;
            let current = ride.request.state;
            if current.is_terminal() {
                return Err(RideError::InvalidTransition {
                    action: "cancel",
                    state: current,
                });
            }
            if current == RideState::Requesting && !ride.request.is_local_fallback {
                return Err(RideError::NotSubmitted(ride.request.id.clone()));
            }

            let id = ride.request.id.clone();
            let queued = ride.request.is_local_fallback;
            // Stop resubmitting before the outbox entry goes away.
            let worker = if queued { ride.timers.resync.take() } else { None };
            if queued && resubmitting.contains(&id) {
                withdrawn.insert(id.clone());
            }
            (id, queued, worker)
        };
        drop(worker);

        let role = self.inner.identity.role;
        if queued {
            if let Err(err) = self.inner.store.remove(&ride_id).await {
                self.restore_queued(&ride_id);
                return Err(err.into());
            }
        } else {
            let body = CancelBody {
                cancelled_by: role,
                reason: reason.clone(),
            };
            self.inner.api.cancel_ride(&ride_id, &body).await?;
        }

        let mut state = self.state();
        if let Some(ride) = active_mut(&mut state, &ride_id).filter(|r| !r.request.state.is_terminal()) {
            self.emit(RideUpdate::Cancelled {
                ride_id: ride_id.clone(),
                cancelled_by: Some(role.as_str().to_string()),
                reason,
            });
            self.transition(ride, RideState::Cancelled);
        }
        Ok(())
    }

    /// Puts a queued ride back in the resync loop after a cancel could not
    /// clear its outbox entry.
    fn restore_queued(&self, local_id: &str) {
        let mut state = self.state();
        state.withdrawn.remove(local_id);
        let Some(ride) = active_mut(&mut state, local_id)
            .filter(|r| r.request.state == RideState::Requesting && r.timers.resync.is_none())
        else {
            return;
        };
        let mut entry = PendingRide::new(local_id, ride.request.to_new_ride());
        entry.queued_at = ride.request.created_at;
        ride.timers.resync = Some(self.spawn_resync(entry));
    }

    /// Confirms pickup without waiting for the arrival grace delay.
    pub fn confirm_pickup(&self) -> Result<(), RideError> {
        let mut state = self.state();
        let ride = state.active.as_mut().ok_or(RideError::NoActiveRide)?;
        if ride.request.state != RideState::DriverArrived {
            return Err(RideError::InvalidTransition {
                action: "confirm pickup",
                state: ride.request.state,
            });
        }
        self.transition(ride, RideState::InProgress);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Driver actions
    // ---------------------------------------------------------------------

    pub async fn pending_rides(&self) -> Result<Vec<RideRecord>, RideError> {
        self.require_role(UserRole::Driver, "list pending rides")?;
        Ok(self.inner.api.pending_rides().await?)
    }

    /// Takes a pending ride. Tracking of the rider starts immediately.
    pub async fn accept_ride(&self, ride_id: &str) -> Result<RideRequest, RideError> {
        self.require_role(UserRole::Driver, "accept a ride")?;
        self.ensure_idle()?;

        let driver = self
            .inner
            .driver_profile
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let body = AcceptBody {
            driver_id: self.inner.identity.user_id.clone(),
            driver: driver.clone(),
        };
        let record = self.inner.api.accept_ride(ride_id, &body).await?;

        let mut state = self.state();
        if state
            .active
            .as_ref()
            .is_some_and(|r| !r.request.state.is_terminal())
        {
            return Err(RideError::AlreadyActive(self.inner.identity.user_id.clone()));
        }
        self.archive_terminal(&mut state);

        let mut request = RideRequest::from_record(&record, RideState::Idle);
        request.driver = Some(record.driver.clone().unwrap_or(driver));
        let mut ride = self.new_ride(request);
        ride.counterparty_id = Some(record.rider_id.clone());
        self.transition(&mut ride, RideState::Accepted);
        let accepted = ride.request.clone();
        state.active = Some(ride);
        Ok(accepted)
    }

    fn ensure_idle(&self) -> Result<(), RideError> {
        let state = self.state();
        match state.active.as_ref() {
            Some(ride) if !ride.request.state.is_terminal() => {
                Err(RideError::AlreadyActive(self.inner.identity.user_id.clone()))
            }
            _ => Ok(()),
        }
    }

    pub async fn reject_ride(&self, ride_id: &str, reason: Option<String>) -> Result<(), RideError> {
        self.require_role(UserRole::Driver, "reject a ride")?;
        let body = RejectBody {
            driver_id: self.inner.identity.user_id.clone(),
            reason,
        };
        self.inner.api.reject_ride(ride_id, &body).await?;
        tracing::info!(ride_id, "ride rejected");
        Ok(())
    }

    /// Picks the rider up: `in_progress` once the backend agreed.
    pub async fn start_ride(&self) -> Result<(), RideError> {
        self.require_role(UserRole::Driver, "start a ride")?;
        let startable = |s: RideState| {
            matches!(
                s,
                RideState::Accepted | RideState::DriverEnRoute | RideState::DriverArrived
            )
        };
        let ride_id = self.current_id_if("start", startable)?;
        self.inner.api.start_ride(&ride_id).await?;

        let mut state = self.state();
        if let Some(ride) = active_mut(&mut state, &ride_id).filter(|r| startable(r.request.state)) {
            self.transition(ride, RideState::InProgress);
        }
        Ok(())
    }

    /// Drops the rider off. Returns the final fare reported by the backend.
    pub async fn complete_ride(&self) -> Result<Option<f64>, RideError> {
        self.require_role(UserRole::Driver, "complete a ride")?;
        let ride_id = self.current_id_if("complete", |s| s == RideState::InProgress)?;
        let record = self.inner.api.complete_ride(&ride_id).await?;

        let mut state = self.state();
        if let Some(ride) = active_mut(&mut state, &ride_id)
            .filter(|r| r.request.state == RideState::InProgress)
        {
            self.emit(RideUpdate::Completed {
                ride_id: ride_id.clone(),
                fare: record.fare,
            });
            self.transition(ride, RideState::Completed);
        }
        Ok(record.fare)
    }

    fn current_id_if(
        &self,
        action: &'static str,
        allowed: impl Fn(RideState) -> bool,
    ) -> Result<String, RideError> {
        let state = self.state();
        let ride = state.active.as_ref().ok_or(RideError::NoActiveRide)?;
        if allowed(ride.request.state) {
            Ok(ride.request.id.clone())
        } else {
            Err(RideError::InvalidTransition {
                action,
                state: ride.request.state,
            })
        }
    }

    /// Stops every timer and the relay. The current ride stays readable.
    pub fn shutdown(&self) {
        let (timers, orphans) = {
            let mut state = self.state();
            let timers = state
                .active
                .as_mut()
                .map(|r| std::mem::take(&mut r.timers));
            (timers, std::mem::take(&mut state.orphan_resyncs))
        };
        drop((timers, orphans));
        self.inner.relay.stop();
    }
}

async fn search_loop(weak: Weak<ControllerInner>, ride_id: String, config: RideConfig) {
    let tick = config.search_tick();
    let mut ticker = interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut elapsed = 0u32;

    loop {
        ticker.tick().await;
        elapsed += 1;
        let Some(controller) = RideLifecycleController::upgrade(&weak) else {
            return;
        };
        if !controller.on_search_tick(&ride_id, elapsed) {
            return;
        }
    }
}

/// Polls the ride record while the push channel is down, for at most the
/// configured window.
async fn status_poll_loop(
    weak: Weak<ControllerInner>,
    ride_id: String,
    mut status: watch::Receiver<ConnectionStatus>,
    config: RideConfig,
) {
    let every = config.status_poll_interval();
    let mut polled_for = std::time::Duration::ZERO;

    loop {
        while status.borrow_and_update().is_connected() {
            if status.changed().await.is_err() {
                return;
            }
        }
        tracing::debug!(ride_id, "push channel down; polling ride status");

        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = status.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if status.borrow().is_connected() {
                        break;
                    }
                    continue;
                }
            }

            polled_for += every;
            if polled_for > config.status_poll_max() {
                tracing::info!(ride_id, "status poll window exhausted");
                return;
            }
            let Some(controller) = RideLifecycleController::upgrade(&weak) else {
                return;
            };
            match controller.inner.api.get_ride(&ride_id).await {
                Ok(record) => {
                    if controller.on_polled_status(&ride_id, &record) {
                        return;
                    }
                }
                Err(err) => tracing::debug!(ride_id, error = %err, "status poll failed"),
            }
        }
    }
}

async fn resync_loop(weak: Weak<ControllerInner>, mut entry: PendingRide, mut backoff: ResyncBackoff) {
    loop {
        tokio::time::sleep(backoff.next_delay()).await;
        let Some(controller) = RideLifecycleController::upgrade(&weak) else {
            return;
        };
        entry.attempts += 1;

        // The attempt runs on its own task so that cancelling this loop never
        // loses a ride the backend has already created.
        controller.state().resubmitting.insert(entry.local_id.clone());
        let attempt = tokio::spawn(resubmit(controller, entry.clone()));
        match attempt.await {
            Ok(Resubmit::Retry) => {}
            Ok(Resubmit::Done) => return,
            Err(err) => {
                tracing::error!(local_id = %entry.local_id, error = %err, "resubmission task failed");
                return;
            }
        }
    }
}

enum Resubmit {
    Done,
    Retry,
}

async fn resubmit(controller: RideLifecycleController, entry: PendingRide) -> Resubmit {
    let inner = &controller.inner;
    match inner.api.request_ride(&entry.ride).await {
        Ok(record) => {
            if let Err(err) = inner.store.remove(&entry.local_id).await {
                tracing::warn!(local_id = %entry.local_id, error = %err, "failed to clear outbox entry");
            }
            let ride_id = record.id.clone();
            if !controller.on_resynced(&entry.local_id, record) {
                let body = CancelBody {
                    cancelled_by: inner.identity.role,
                    reason: Some("cancelled while queued".to_string()),
                };
                match inner.api.cancel_ride(&ride_id, &body).await {
                    Ok(()) => tracing::info!(local_id = %entry.local_id, ride_id, "cancelled resubmitted ride"),
                    Err(err) => tracing::error!(ride_id, error = %err, "failed to cancel resubmitted ride"),
                }
            }
            Resubmit::Done
        }
        Err(err) if err.is_network() => {
            tracing::warn!(
                local_id = %entry.local_id,
                attempt = entry.attempts,
                error = %err,
                "resubmission failed; will retry"
            );
            if let Err(err) = inner.store.put(&entry).await {
                tracing::warn!(local_id = %entry.local_id, error = %err, "failed to update outbox entry");
            }
            if controller.finish_resubmit(&entry.local_id) {
                // The cancel may have cleared the entry before the put above.
                if let Err(err) = inner.store.remove(&entry.local_id).await {
                    tracing::warn!(local_id = %entry.local_id, error = %err, "failed to clear outbox entry");
                }
                return Resubmit::Done;
            }
            Resubmit::Retry
        }
        Err(err) => {
            tracing::error!(local_id = %entry.local_id, error = %err, "backend refused queued ride; dropping it");
            if let Err(err) = inner.store.remove(&entry.local_id).await {
                tracing::warn!(local_id = %entry.local_id, error = %err, "failed to clear outbox entry");
            }
            controller.on_resync_refused(&entry.local_id, &err);
            Resubmit::Done
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::ConnectionConfig;
    use crate::core::event_router::EventRouter;
    use crate::outbox::MemoryPendingStore;
    use crate::testing::{new_ride, FixedPosition, MockConnector, MockRideApi, RecordingMap};
    use serde_json::json;
    use std::time::Duration;

    struct Rig {
        controller: RideLifecycleController,
        connection: ConnectionManager,
        connector: Arc<MockConnector>,
        api: Arc<MockRideApi>,
        store: Arc<MemoryPendingStore>,
        updates: broadcast::Receiver<RideUpdate>,
    }

    impl Rig {
        fn push(&self, event: &str, data: serde_json::Value) {
            self.connector.latest().unwrap().push(event, data);
        }

        fn drain(&mut self) -> Vec<RideUpdate> {
            let mut out = Vec::new();
            while let Ok(update) = self.updates.try_recv() {
                out.push(update);
            }
            out
        }
    }

    fn rig(role: UserRole, user_id: &str) -> Rig {
        let connector = Arc::new(MockConnector::new().auto_confirm());
        let connection =
            ConnectionManager::new(connector.clone(), EventRouter::new(), ConnectionConfig::default());
        let api = Arc::new(MockRideApi::new());
        let store = Arc::new(MemoryPendingStore::new());
        let controller = RideLifecycleController::new(ControllerDeps {
            identity: Identity::new(role, user_id),
            ride_config: RideConfig::default(),
            relay_config: RelayConfig::default(),
            connection: connection.clone(),
            api: api.clone(),
            store: store.clone(),
            position: Arc::new(FixedPosition::new(LatLng::new(40.7580, -73.9855))),
            map: Arc::new(RecordingMap::default()),
        });
        let updates = controller.subscribe();
        Rig {
            controller,
            connection,
            connector,
            api,
            store,
            updates,
        }
    }

    async fn connected_rider() -> Rig {
        let rig = rig(UserRole::Rider, "r1");
        rig.connection.connect(UserRole::Rider, "r1").await.unwrap();
        rig
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn accepted_frame(ride_id: &str) -> serde_json::Value {
        json!({
            "rideId": ride_id,
            "driver": {"id": "D1", "name": "Dana", "vehicleInfo": {"plate": "T-123"}},
            "estimatedArrival": 4
        })
    }

    #[tokio::test(start_paused = true)]
    async fn request_moves_to_searching_and_reports_milestones() {
        let mut rig = connected_rider().await;
        let ride = rig.controller.request_ride(new_ride("r1")).await.unwrap();
        assert_eq!(ride.state, RideState::Searching);
        assert_eq!(ride.id, "ride-1");
        assert!(!ride.is_local_fallback);

        tokio::time::sleep(Duration::from_millis(8_500)).await;
        let milestones: Vec<(u32, SearchMilestone)> = rig
            .drain()
            .into_iter()
            .filter_map(|u| match u {
                RideUpdate::SearchProgress { tick, milestone, .. } => Some((tick, milestone)),
                _ => None,
            })
            .collect();
        assert_eq!(
            milestones,
            vec![
                (2, SearchMilestone::ScanningArea),
                (5, SearchMilestone::LocatingDrivers),
                (8, SearchMilestone::ContactingDrivers),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn search_times_out_after_thirty_ticks_exactly_once() {
        let mut rig = connected_rider().await;
        rig.controller.request_ride(new_ride("r1")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(29_500)).await;
        assert_eq!(rig.controller.ride_state(), RideState::Searching);
        assert_eq!(rig.controller.search_ticks(), 29);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rig.controller.ride_state(), RideState::SearchTimedOut);
        assert_eq!(rig.controller.search_ticks(), 30);
        assert!(rig.controller.active_timers().is_empty());

        let outcomes = rig
            .drain()
            .into_iter()
            .filter(|u| matches!(u, RideUpdate::NoDriversAvailable { .. }))
            .count();
        assert_eq!(outcomes, 1);

        // A late acceptance cannot resurrect the ride.
        rig.push("ride_accepted", accepted_frame("ride-1"));
        settle().await;
        assert_eq!(rig.controller.ride_state(), RideState::SearchTimedOut);
        assert_eq!(rig.controller.current_ride().unwrap().driver, None);
    }

    #[tokio::test(start_paused = true)]
    async fn acceptance_clears_the_search_and_starts_tracking() {
        let mut rig = connected_rider().await;
        rig.controller.request_ride(new_ride("r1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        rig.push("ride_accepted", accepted_frame("ride-1"));
        settle().await;

        let ride = rig.controller.current_ride().unwrap();
        assert_eq!(ride.state, RideState::Accepted);
        assert_eq!(ride.driver.as_ref().unwrap().id, "D1");
        assert!(rig.controller.active_timers().is_empty());
        assert_eq!(rig.controller.relay().tracking().as_deref(), Some("ride-1"));
        assert!(rig.drain().iter().any(|u| matches!(
            u,
            RideUpdate::DriverAssigned { estimated_arrival: Some(4), .. }
        )));

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(rig.controller.ride_state(), RideState::Accepted);
        assert!(!rig
            .drain()
            .iter()
            .any(|u| matches!(u, RideUpdate::NoDriversAvailable { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn no_drivers_push_ends_search_once() {
        let mut rig = connected_rider().await;
        rig.controller.request_ride(new_ride("r1")).await.unwrap();

        rig.push("no_drivers_available", json!({"rideId": "ride-1"}));
        settle().await;
        assert_eq!(rig.controller.ride_state(), RideState::SearchTimedOut);

        tokio::time::sleep(Duration::from_secs(40)).await;
        let outcomes = rig
            .drain()
            .into_iter()
            .filter(|u| matches!(u, RideUpdate::NoDriversAvailable { .. }))
            .count();
        assert_eq!(outcomes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_counterparty_triggers_arrival_once_then_auto_start() {
        let mut rig = connected_rider().await;
        rig.controller.request_ride(new_ride("r1")).await.unwrap();
        rig.push("ride_accepted", accepted_frame("ride-1"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 0.00072 degrees of latitude is about 80 m.
        let near = json!({"rideId": "ride-1", "location": {"lat": 40.75872, "lng": -73.9855}});
        rig.push("driver_location_update", near.clone());
        settle().await;
        assert_eq!(rig.controller.ride_state(), RideState::DriverArrived);

        rig.push("driver_location_update", near.clone());
        rig.push("driver_location_update", near);
        settle().await;
        let arrivals = rig
            .drain()
            .into_iter()
            .filter(|u| {
                matches!(
                    u,
                    RideUpdate::StateChanged { to: RideState::DriverArrived, .. }
                )
            })
            .count();
        assert_eq!(arrivals, 1);
        assert_eq!(rig.controller.active_timers(), vec!["arrival-grace"]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rig.controller.ride_state(), RideState::InProgress);
        assert!(rig.controller.active_timers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn distant_counterparty_marks_driver_en_route() {
        let rig = connected_rider().await;
        rig.controller.request_ride(new_ride("r1")).await.unwrap();
        rig.push("ride_accepted", accepted_frame("ride-1"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        rig.push(
            "driver_location_update",
            json!({"rideId": "ride-1", "location": {"lat": 40.7680, "lng": -73.9855}}),
        );
        settle().await;
        assert_eq!(rig.controller.ride_state(), RideState::DriverEnRoute);

        rig.controller.confirm_pickup().unwrap_err();
    }

    #[tokio::test(start_paused = true)]
    async fn manual_pickup_confirmation_skips_the_grace_delay() {
        let rig = connected_rider().await;
        rig.controller.request_ride(new_ride("r1")).await.unwrap();
        rig.push("ride_accepted", accepted_frame("ride-1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        rig.push(
            "driver_location_update",
            json!({"rideId": "ride-1", "location": {"lat": 40.7581, "lng": -73.9855}}),
        );
        settle().await;

        rig.controller.confirm_pickup().unwrap();
        assert_eq!(rig.controller.ride_state(), RideState::InProgress);

        rig.push("ride_completed", json!({"rideId": "ride-1", "fare": 48.75}));
        settle().await;
        assert_eq!(rig.controller.ride_state(), RideState::Completed);
        assert_eq!(rig.controller.relay().tracking(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_request_is_queued_and_resynced() {
        let mut rig = connected_rider().await;
        rig.api.set_offline(true);

        let ride = rig.controller.request_ride(new_ride("r1")).await.unwrap();
        assert!(ride.is_local_fallback);
        assert_eq!(ride.state, RideState::Requesting);
        assert!(ride.id.starts_with("local-"));
        assert_eq!(rig.store.list().await.unwrap().len(), 1);

        // First retry after 5 s fails, the next one 10 s later succeeds.
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(rig.api.request_count(), 2);
        rig.api.set_offline(false);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let ride_now = rig.controller.current_ride().unwrap();
        assert!(!ride_now.is_local_fallback);
        assert_eq!(ride_now.id, "ride-1");
        assert_eq!(ride_now.state, RideState::Searching);
        assert!(rig.store.list().await.unwrap().is_empty());
        assert!(rig.drain().contains(&RideUpdate::Resynced {
            local_id: ride.id.clone(),
            ride_id: "ride-1".to_string(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_queued_request_clears_the_outbox() {
        let rig = connected_rider().await;
        rig.api.set_offline(true);
        rig.controller.request_ride(new_ride("r1")).await.unwrap();

        rig.controller.cancel_ride(Some("changed plans".into())).await.unwrap();
        assert_eq!(rig.controller.ride_state(), RideState::Cancelled);
        assert!(rig.store.list().await.unwrap().is_empty());

        rig.api.set_offline(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rig.api.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_request_leaves_no_ride() {
        let rig = connected_rider().await;
        rig.api.reject_next(422, "pickup outside service area");

        let err = rig.controller.request_ride(new_ride("r1")).await.unwrap_err();
        assert!(matches!(
            err,
            RideError::Action(ActionError::ServerRejected { status: 422, .. })
        ));
        assert_eq!(rig.controller.ride_state(), RideState::Idle);
        assert!(rig.store.list().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_active_ride_per_rider() {
        let rig = connected_rider().await;
        rig.controller.request_ride(new_ride("r1")).await.unwrap();
        let err = rig.controller.request_ride(new_ride("r1")).await.unwrap_err();
        assert!(matches!(err, RideError::AlreadyActive(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cancel_keeps_the_ride() {
        let rig = connected_rider().await;
        rig.controller.request_ride(new_ride("r1")).await.unwrap();
        rig.api.set_offline(true);

        let err = rig.controller.cancel_ride(None).await.unwrap_err();
        assert!(matches!(err, RideError::Action(ActionError::Network(_))));
        assert_eq!(rig.controller.ride_state(), RideState::Searching);
        assert!(rig.controller.active_timers().contains(&"search"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_by_http_and_by_push() {
        let rig = connected_rider().await;
        rig.controller.request_ride(new_ride("r1")).await.unwrap();
        rig.controller.cancel_ride(Some("too slow".into())).await.unwrap();
        assert_eq!(rig.controller.ride_state(), RideState::Cancelled);
        assert!(rig.controller.active_timers().is_empty());

        rig.controller.request_ride(new_ride("r1")).await.unwrap();
        assert_eq!(rig.controller.history().len(), 1);
        rig.push(
            "ride_cancelled",
            json!({"rideId": "ride-2", "cancelledBy": "driver", "reason": "vehicle issue"}),
        );
        settle().await;
        assert_eq!(rig.controller.ride_state(), RideState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn status_is_polled_while_disconnected() {
        let rig = rig(UserRole::Rider, "r1");
        rig.controller.request_ride(new_ride("r1")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(4_100)).await;
        assert_eq!(rig.api.get_ride_calls(), 2);

        rig.api.set_status("ride-1", RideStatus::Accepted);
        rig.api.set_driver("ride-1", DriverInfo::with_id("D9"));
        tokio::time::sleep(Duration::from_secs(2)).await;

        let ride = rig.controller.current_ride().unwrap();
        assert_eq!(ride.state, RideState::Accepted);
        assert_eq!(ride.driver.unwrap().id, "D9");
    }

    #[tokio::test(start_paused = true)]
    async fn no_polling_while_connected() {
        let rig = connected_rider().await;
        rig.controller.request_ride(new_ride("r1")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rig.api.get_ride_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_adopts_a_queued_request_from_a_previous_run() {
        let rig = connected_rider().await;
        rig.store
            .put(&PendingRide::new("local-old", new_ride("r1")))
            .await
            .unwrap();
        rig.store
            .put(&PendingRide::new("local-other", new_ride("someone-else")))
            .await
            .unwrap();

        assert_eq!(rig.controller.resume_pending().await.unwrap(), 2);
        let ride = rig.controller.current_ride().unwrap();
        assert_eq!(ride.id, "local-old");
        assert!(ride.is_local_fallback);
        assert_eq!(rig.controller.resume_pending().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert!(rig.store.list().await.unwrap().is_empty());
        assert_eq!(rig.controller.ride_state(), RideState::Searching);
        assert!(!rig.controller.current_ride().unwrap().is_local_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn driver_accepts_starts_and_completes() {
        let mut rig = rig(UserRole::Driver, "D1");
        rig.connection.connect(UserRole::Driver, "D1").await.unwrap();
        let record = rig.api.request_ride(&new_ride("r1")).await.unwrap();

        let pending = rig.controller.pending_rides().await.unwrap();
        assert_eq!(pending.len(), 1);

        let ride = rig.controller.accept_ride(&record.id).await.unwrap();
        assert_eq!(ride.state, RideState::Accepted);
        assert_eq!(ride.driver.unwrap().id, "D1");
        assert_eq!(rig.controller.relay().counterparty_id().as_deref(), Some("r1"));

        rig.controller.start_ride().await.unwrap();
        assert_eq!(rig.controller.ride_state(), RideState::InProgress);

        let fare = rig.controller.complete_ride().await.unwrap();
        assert_eq!(fare, Some(52.0));
        assert_eq!(rig.controller.ride_state(), RideState::Completed);
        assert!(rig
            .drain()
            .contains(&RideUpdate::Completed { ride_id: record.id.clone(), fare: Some(52.0) }));
    }

    #[tokio::test(start_paused = true)]
    async fn driver_action_failures_do_not_change_state() {
        let rig = rig(UserRole::Driver, "D1");
        let record = rig.api.request_ride(&new_ride("r1")).await.unwrap();
        rig.controller.accept_ride(&record.id).await.unwrap();

        rig.api.reject_next(409, "ride already started");
        let err = rig.controller.start_ride().await.unwrap_err();
        assert!(matches!(
            err,
            RideError::Action(ActionError::ServerRejected { status: 409, .. })
        ));
        assert_eq!(rig.controller.ride_state(), RideState::Accepted);

        let err = rig.controller.complete_ride().await.unwrap_err();
        assert!(matches!(err, RideError::InvalidTransition { action: "complete", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn roles_are_enforced() {
        let rider = rig(UserRole::Rider, "r1");
        assert!(matches!(
            rider.controller.accept_ride("ride-1").await,
            Err(RideError::WrongRole { .. })
        ));
        let driver = rig(UserRole::Driver, "D1");
        assert!(matches!(
            driver.controller.request_ride(new_ride("D1")).await,
            Err(RideError::WrongRole { .. })
        ));
    }
}
