//! In-memory collaborators for exercising the dispatch core without a
//! network: a scriptable connector whose sessions play the server side of
//! the push channel, a ride backend kept in a map, a settable position
//! source and a map sink that records what it was shown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::location_relay::{MapSink, PositionSource};
use crate::core::transport::{Connector, TransportHandle};
use crate::error::{ActionError, TransportError};
use crate::models::events::LocationUpdate;
use crate::models::identity::{Identity, UserRole};
use crate::models::location::{LatLng, LocationSample, Place};
use crate::models::ride::{DriverInfo, NewRide, RideRecord, RideStatus, VehicleType};
use crate::retrieve::{AcceptBody, CancelBody, RejectBody, RideApi};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A typical request used across tests.
pub fn new_ride(rider_id: &str) -> NewRide {
    NewRide {
        rider_id: rider_id.to_string(),
        pickup: Place::new(LatLng::new(40.7580, -73.9855), Some("Times Square".into())),
        destination: Place::new(LatLng::new(40.6413, -73.7781), Some("JFK".into())),
        fare_estimate: 52.0,
        vehicle_type: VehicleType::Economy,
    }
}

// ---------------------------------------------------------------------------
// Push channel
// ---------------------------------------------------------------------------

/// Server end of one transport opened through [`MockConnector`].
#[derive(Clone)]
pub struct MockSession {
    identity: Identity,
    to_client: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    from_client: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    open: Arc<AtomicBool>,
    close: CancellationToken,
}

impl MockSession {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Pushes `{"event": event, "data": data}` to the client.
    pub fn push(&self, event: &str, data: Value) -> bool {
        self.push_raw(json!({ "event": event, "data": data }).to_string())
    }

    pub fn push_raw(&self, text: impl Into<String>) -> bool {
        lock(&self.to_client)
            .as_ref()
            .is_some_and(|tx| tx.send(text.into()).is_ok())
    }

    /// Drains every frame the client sent so far.
    pub fn sent(&self) -> Vec<Value> {
        let mut rx = lock(&self.from_client);
        let mut frames = Vec::new();
        while let Ok(text) = rx.try_recv() {
            if let Ok(value) = serde_json::from_str(&text) {
                frames.push(value);
            }
        }
        frames
    }

    /// Drains sent frames and returns only their event names.
    pub fn sent_events(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|f| f["event"].as_str().map(str::to_string))
            .collect()
    }

    /// Closes the connection from the server side.
    pub fn drop_connection(&self) {
        self.open.store(false, Ordering::SeqCst);
        lock(&self.to_client).take();
    }

    /// The transport dies without closing the inbound stream.
    pub fn go_silent(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// True once the client tore this transport down.
    pub fn closed_by_client(&self) -> bool {
        self.close.is_cancelled()
    }
}

#[derive(Default)]
struct ConnectorState {
    sessions: Vec<MockSession>,
    failures_left: u32,
    attempts: u32,
}

/// Connector that hands out in-memory sessions.
#[derive(Default)]
pub struct MockConnector {
    state: Mutex<ConnectorState>,
    auto_confirm: bool,
    open_delay: Duration,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `registration_confirmed` on every new session.
    pub fn auto_confirm(mut self) -> Self {
        self.auto_confirm = true;
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// The next `n` open attempts fail.
    pub fn fail_next(&self, n: u32) {
        lock(&self.state).failures_left = n;
    }

    pub fn attempts(&self) -> u32 {
        lock(&self.state).attempts
    }

    pub fn sessions(&self) -> Vec<MockSession> {
        lock(&self.state).sessions.clone()
    }

    pub fn latest(&self) -> Option<MockSession> {
        lock(&self.state).sessions.last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, identity: &Identity) -> Result<TransportHandle, TransportError> {
        lock(&self.state).attempts += 1;
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        let mut state = lock(&self.state);
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let close = CancellationToken::new();

        if self.auto_confirm {
            let _ = to_client.send(json!({"event": "registration_confirmed", "data": {}}).to_string());
        }

        state.sessions.push(MockSession {
            identity: identity.clone(),
            to_client: Arc::new(Mutex::new(Some(to_client))),
            from_client: Arc::new(Mutex::new(from_client)),
            open: open.clone(),
            close: close.clone(),
        });

        Ok(TransportHandle {
            outbound,
            inbound,
            open,
            close,
        })
    }
}

// ---------------------------------------------------------------------------
// Ride backend
// ---------------------------------------------------------------------------

/// One call received by [`MockRideApi`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    RequestRide(NewRide),
    Accept { ride_id: String, driver_id: String },
    Reject { ride_id: String, driver_id: String },
    Start(String),
    Complete(String),
    Cancel { ride_id: String, cancelled_by: UserRole },
    UpdateLocation(LocationUpdate),
    GetRide(String),
    PendingRides,
}

#[derive(Default)]
struct ApiState {
    rides: BTreeMap<String, RideRecord>,
    calls: Vec<ApiCall>,
    offline: bool,
    reject_next: Option<(u16, String)>,
    next_id: u32,
}

/// Ride backend kept in memory.
#[derive(Default)]
pub struct MockRideApi {
    state: Mutex<ApiState>,
}

fn blank_record(ride_id: &str) -> RideRecord {
    RideRecord {
        id: ride_id.to_string(),
        rider_id: "rider".to_string(),
        pickup: Place::new(LatLng::new(0.0, 0.0), None),
        destination: Place::new(LatLng::new(0.0, 0.0), None),
        fare_estimate: 0.0,
        vehicle_type: VehicleType::Economy,
        status: RideStatus::Pending,
        created_at: Utc::now(),
        driver: None,
        driver_location: None,
        rider_location: None,
        fare: None,
    }
}

fn not_found(ride_id: &str) -> ActionError {
    ActionError::ServerRejected {
        status: 404,
        message: format!("ride {} not found", ride_id),
    }
}

impl MockRideApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with a network error while offline.
    pub fn set_offline(&self, offline: bool) {
        lock(&self.state).offline = offline;
    }

    /// The next call is answered with a non-2xx status.
    pub fn reject_next(&self, status: u16, message: &str) {
        lock(&self.state).reject_next = Some((status, message.to_string()));
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        lock(&self.state).calls.clone()
    }

    pub fn request_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ApiCall::RequestRide(_)))
            .count()
    }

    pub fn get_ride_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ApiCall::GetRide(_)))
            .count()
    }

    pub fn location_updates(&self) -> Vec<LocationUpdate> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ApiCall::UpdateLocation(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    pub fn insert(&self, record: RideRecord) {
        lock(&self.state).rides.insert(record.id.clone(), record);
    }

    pub fn ride(&self, ride_id: &str) -> Option<RideRecord> {
        lock(&self.state).rides.get(ride_id).cloned()
    }

    fn update(&self, ride_id: &str, f: impl FnOnce(&mut RideRecord)) {
        let mut state = lock(&self.state);
        let record = state
            .rides
            .entry(ride_id.to_string())
            .or_insert_with(|| blank_record(ride_id));
        f(record);
    }

    pub fn set_status(&self, ride_id: &str, status: RideStatus) {
        self.update(ride_id, |r| r.status = status);
    }

    pub fn set_driver(&self, ride_id: &str, driver: DriverInfo) {
        self.update(ride_id, |r| r.driver = Some(driver));
    }

    pub fn set_driver_location(&self, ride_id: &str, location: LatLng) {
        self.update(ride_id, |r| r.driver_location = Some(location));
    }

    pub fn set_rider_location(&self, ride_id: &str, location: LatLng) {
        self.update(ride_id, |r| r.rider_location = Some(location));
    }

    fn gate(&self, call: ApiCall) -> Result<(), ActionError> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if state.offline {
            return Err(ActionError::Network("connection refused".to_string()));
        }
        if let Some((status, message)) = state.reject_next.take() {
            return Err(ActionError::ServerRejected { status, message });
        }
        Ok(())
    }

    fn transition(
        &self,
        ride_id: &str,
        f: impl FnOnce(&mut RideRecord),
    ) -> Result<RideRecord, ActionError> {
        let mut state = lock(&self.state);
        let record = state.rides.get_mut(ride_id).ok_or_else(|| not_found(ride_id))?;
        f(record);
        Ok(record.clone())
    }
}

#[async_trait]
impl RideApi for MockRideApi {
    async fn request_ride(&self, ride: &NewRide) -> Result<RideRecord, ActionError> {
        self.gate(ApiCall::RequestRide(ride.clone()))?;
        let mut state = lock(&self.state);
        state.next_id += 1;
        let record = RideRecord {
            id: format!("ride-{}", state.next_id),
            rider_id: ride.rider_id.clone(),
            pickup: ride.pickup.clone(),
            destination: ride.destination.clone(),
            fare_estimate: ride.fare_estimate,
            vehicle_type: ride.vehicle_type,
            ..blank_record("")
        };
        state.rides.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn accept_ride(&self, ride_id: &str, body: &AcceptBody) -> Result<RideRecord, ActionError> {
        self.gate(ApiCall::Accept {
            ride_id: ride_id.to_string(),
            driver_id: body.driver_id.clone(),
        })?;
        self.transition(ride_id, |r| {
            r.status = RideStatus::Accepted;
            r.driver = Some(body.driver.clone());
        })
    }

    async fn reject_ride(&self, ride_id: &str, body: &RejectBody) -> Result<(), ActionError> {
        self.gate(ApiCall::Reject {
            ride_id: ride_id.to_string(),
            driver_id: body.driver_id.clone(),
        })
    }

    async fn start_ride(&self, ride_id: &str) -> Result<RideRecord, ActionError> {
        self.gate(ApiCall::Start(ride_id.to_string()))?;
        self.transition(ride_id, |r| r.status = RideStatus::InProgress)
    }

    async fn complete_ride(&self, ride_id: &str) -> Result<RideRecord, ActionError> {
        self.gate(ApiCall::Complete(ride_id.to_string()))?;
        self.transition(ride_id, |r| {
            r.status = RideStatus::Completed;
            r.fare = Some(r.fare_estimate);
        })
    }

    async fn cancel_ride(&self, ride_id: &str, body: &CancelBody) -> Result<(), ActionError> {
        self.gate(ApiCall::Cancel {
            ride_id: ride_id.to_string(),
            cancelled_by: body.cancelled_by,
        })?;
        self.transition(ride_id, |r| r.status = RideStatus::Cancelled)
            .map(|_| ())
    }

    async fn update_location(&self, update: &LocationUpdate) -> Result<(), ActionError> {
        self.gate(ApiCall::UpdateLocation(update.clone()))?;
        let mut state = lock(&self.state);
        if let Some(record) = state.rides.get_mut(&update.ride_id) {
            match update.role {
                UserRole::Rider => record.rider_location = Some(update.location),
                UserRole::Driver => record.driver_location = Some(update.location),
            }
        }
        Ok(())
    }

    async fn get_ride(&self, ride_id: &str) -> Result<RideRecord, ActionError> {
        self.gate(ApiCall::GetRide(ride_id.to_string()))?;
        self.ride(ride_id).ok_or_else(|| not_found(ride_id))
    }

    async fn pending_rides(&self) -> Result<Vec<RideRecord>, ActionError> {
        self.gate(ApiCall::PendingRides)?;
        Ok(lock(&self.state)
            .rides
            .values()
            .filter(|r| r.status == RideStatus::Pending)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Position source that reports whatever it was last set to.
#[derive(Default)]
pub struct FixedPosition {
    position: Mutex<Option<LatLng>>,
}

impl FixedPosition {
    pub fn new(position: LatLng) -> Self {
        Self {
            position: Mutex::new(Some(position)),
        }
    }

    pub fn set(&self, position: LatLng) {
        *lock(&self.position) = Some(position);
    }

    pub fn clear(&self) {
        *lock(&self.position) = None;
    }
}

#[async_trait]
impl PositionSource for FixedPosition {
    async fn current_position(&self) -> Option<LatLng> {
        *lock(&self.position)
    }
}

/// Map sink that keeps everything it was asked to draw.
#[derive(Default)]
pub struct RecordingMap {
    shown: Mutex<Vec<(String, LocationSample, Option<f64>)>>,
    cleared: Mutex<Vec<String>>,
}

impl RecordingMap {
    pub fn shown(&self) -> Vec<(String, LocationSample, Option<f64>)> {
        lock(&self.shown).clone()
    }

    pub fn cleared(&self) -> Vec<String> {
        lock(&self.cleared).clone()
    }
}

impl MapSink for RecordingMap {
    fn show_counterparty(&self, ride_id: &str, sample: &LocationSample, distance_m: Option<f64>) {
        lock(&self.shown).push((ride_id.to_string(), sample.clone(), distance_m));
    }

    fn clear(&self, ride_id: &str) {
        lock(&self.cleared).push(ride_id.to_string());
    }
}
