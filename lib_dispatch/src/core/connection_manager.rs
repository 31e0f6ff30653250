//! # Connection Manager
//!
//! Owns the single push-channel connection for one authenticated identity.
//!
//! ## Lifecycle
//!
//! - `connect` opens a transport, re-attaches every router subscription and
//!   sends `register`. If `registration_confirmed` does not arrive within the
//!   grace period the registration is sent once more.
//! - When the transport goes away the manager retries on a fixed delay, up to
//!   a bounded number of attempts, then reports [`ConnectionStatus::Dead`].
//!   Registered router subscriptions survive reconnects untouched.
//! - A single keepalive task drives both the heartbeat ping and the health
//!   check, so the two can never run concurrently. The health check catches
//!   transports that died without closing their inbound stream.
//!
//! Background tasks hold only a `Weak` reference to the manager; dropping the
//! last [`ConnectionManager`] tears everything down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::configs::ConnectionConfig;
use crate::core::event_router::EventRouter;
use crate::core::timer::TimerHandle;
use crate::core::transport::{Connector, TransportHandle};
use crate::error::TransportError;
use crate::models::events::{OutboundMessage, PushEvent};
use crate::models::identity::{Identity, UserRole};
use crate::utils::time::now_ms;

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before, or performing, reconnection attempt `attempt`.
    Reconnecting { attempt: u32 },
    /// Reconnection gave up. Only an explicit `connect` recovers from here.
    Dead,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Returned by a successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub identity: Identity,
    /// Increments on every transport the manager opens.
    pub generation: u64,
}

struct Connection {
    identity: Identity,
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    transport_open: Arc<AtomicBool>,
    close: CancellationToken,
    registered: bool,
    last_activity_at: Instant,
    reader: Option<TimerHandle>,
    registration_watch: Option<TimerHandle>,
}

impl Connection {
    fn is_live(&self) -> bool {
        self.transport_open.load(Ordering::SeqCst)
    }

    fn send(&self, frame: String) -> Result<(), TransportError> {
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close.cancel();
    }
}

#[derive(Default)]
struct Shared {
    identity: Option<Identity>,
    connection: Option<Connection>,
    generation: u64,
    reconnect_attempts: u32,
    last_ping_at: Option<Instant>,
    last_latency: Option<Duration>,
    keepalive: Option<TimerHandle>,
    reconnect: Option<TimerHandle>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    router: EventRouter,
    config: ConnectionConfig,
    shared: Mutex<Shared>,
    connecting: AtomicBool,
    status: watch::Sender<ConnectionStatus>,
}

/// Resets the in-progress flag however the connect attempt ends.
struct ConnectGuard<'a>(&'a AtomicBool);

impl<'a> ConnectGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ConnectGuard(flag))
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, router: EventRouter, config: ConnectionConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                router,
                config,
                shared: Mutex::new(Shared::default()),
                connecting: AtomicBool::new(false),
                status,
            }),
        }
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    fn set_status(&self, next: ConnectionStatus) {
        let changed = self.inner.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::debug!(status = ?next, "connection status changed");
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        self.shared().identity.clone()
    }

    /// True while a transport is up and still reports itself open.
    pub fn is_connected(&self) -> bool {
        self.shared().connection.as_ref().is_some_and(Connection::is_live)
    }

    pub fn is_registered(&self) -> bool {
        self.shared().connection.as_ref().is_some_and(|c| c.registered)
    }

    /// Round trip of the most recent heartbeat.
    pub fn last_latency(&self) -> Option<Duration> {
        self.shared().last_latency
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared().reconnect_attempts
    }

    /// Time since the current transport last delivered a frame.
    pub fn idle_for(&self) -> Option<Duration> {
        self.shared()
            .connection
            .as_ref()
            .map(|c| c.last_activity_at.elapsed())
    }

    fn current_handle(&self, identity: &Identity) -> Option<ConnectionHandle> {
        let shared = self.shared();
        shared
            .connection
            .as_ref()
            .filter(|c| &c.identity == identity && c.is_live())
            .map(|c| ConnectionHandle {
                identity: c.identity.clone(),
                generation: c.generation,
            })
    }

    /// Opens the push channel for `role`/`user_id`.
    ///
    /// Connecting again with the identity that is already connected is a
    /// no-op. A different identity replaces the current connection. A call
    /// made while another attempt is still in flight fails with
    /// [`TransportError::ConnectInProgress`].
    pub async fn connect(
        &self,
        role: UserRole,
        user_id: impl Into<String>,
    ) -> Result<ConnectionHandle, TransportError> {
        let identity = Identity::new(role, user_id);
        if let Some(handle) = self.current_handle(&identity) {
            tracing::debug!(%identity, "already connected");
            return Ok(handle);
        }

        let _guard = ConnectGuard::acquire(&self.inner.connecting)
            .ok_or(TransportError::ConnectInProgress)?;

        let previous = {
            let mut shared = self.shared();
            shared.identity = Some(identity.clone());
            shared.reconnect_attempts = 0;
            (shared.connection.take(), shared.reconnect.take())
        };
        if previous.0.is_some() {
            self.inner.router.detach_transport();
        }
        drop(previous);

        self.set_status(ConnectionStatus::Connecting);
        match self.establish(&identity).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                tracing::error!(%identity, error = %err, "connection failed");
                let keepalive = {
                    let mut shared = self.shared();
                    if shared.identity.as_ref() == Some(&identity) {
                        shared.identity = None;
                    }
                    shared.keepalive.take()
                };
                drop(keepalive);
                self.set_status(ConnectionStatus::Disconnected);
                Err(err)
            }
        }
    }

    async fn establish(&self, identity: &Identity) -> Result<ConnectionHandle, TransportError> {
        let timeout = self.inner.config.connect_timeout();
        let transport = tokio::time::timeout(timeout, self.inner.connector.open(identity))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        let TransportHandle {
            outbound,
            inbound,
            open,
            close,
        } = transport;

        let generation = {
            let mut shared = self.shared();
            if shared.identity.as_ref() != Some(identity) {
                close.cancel();
                tracing::info!(%identity, "identity changed while connecting; dropping transport");
                return Err(TransportError::Closed);
            }
            shared.generation += 1;
            let generation = shared.generation;
            shared.connection = Some(Connection {
                identity: identity.clone(),
                generation,
                outbound,
                transport_open: open,
                close,
                registered: false,
                last_activity_at: Instant::now(),
                reader: None,
                registration_watch: None,
            });
            shared.reconnect_attempts = 0;
            shared.last_ping_at = None;
            if shared.keepalive.is_none() {
                shared.keepalive = Some(TimerHandle::spawn(
                    "keepalive",
                    keepalive_loop(
                        Arc::downgrade(&self.inner),
                        self.inner.config.heartbeat_interval(),
                        self.inner.config.health_check_interval(),
                    ),
                ));
            }
            generation
        };

        // Listeners go in before the reader starts pulling frames.
        self.inner.router.attach_transport();
        let reader = TimerHandle::spawn(
            "transport-reader",
            reader_loop(Arc::downgrade(&self.inner), generation, inbound),
        );
        {
            let mut shared = self.shared();
            match shared.connection.as_mut() {
                Some(conn) if conn.generation == generation => conn.reader = Some(reader),
                _ => return Err(TransportError::Closed),
            }
        }

        self.set_status(ConnectionStatus::Connected);
        tracing::info!(%identity, generation, "push channel connected");

        if let Err(err) = self.send_registration(generation) {
            tracing::warn!(%identity, error = %err, "failed to send registration");
        }
        self.arm_registration_watch(generation);

        Ok(ConnectionHandle {
            identity: identity.clone(),
            generation,
        })
    }

    fn send_registration(&self, generation: u64) -> Result<(), TransportError> {
        let shared = self.shared();
        let conn = shared
            .connection
            .as_ref()
            .filter(|c| c.generation == generation)
            .ok_or(TransportError::NotConnected)?;
        let frame = OutboundMessage::Register {
            role: conn.identity.role,
            user_id: conn.identity.user_id.clone(),
        }
        .to_frame()
        .map_err(|e| TransportError::Encode(e.to_string()))?;
        conn.send(frame)
    }

    fn arm_registration_watch(&self, generation: u64) {
        let weak = Arc::downgrade(&self.inner);
        let grace = self.inner.config.registration_grace();
        let watch = TimerHandle::spawn("registration-grace", async move {
            tokio::time::sleep(grace).await;
            let Some(manager) = ConnectionManager::upgrade(&weak) else {
                return;
            };
            let unconfirmed = manager
                .shared()
                .connection
                .as_ref()
                .is_some_and(|c| c.generation == generation && !c.registered);
            if unconfirmed {
                tracing::warn!(generation, "registration not confirmed in time; registering again");
                if let Err(err) = manager.send_registration(generation) {
                    tracing::warn!(error = %err, "registration retry failed");
                }
            }
        });

        let mut shared = self.shared();
        if let Some(conn) = shared.connection.as_mut().filter(|c| c.generation == generation) {
            if !conn.registered {
                conn.registration_watch = Some(watch);
            }
        }
    }

    fn on_frame(&self, generation: u64, text: &str) {
        let event = match PushEvent::from_frame(text) {
            Ok(event) => event,
            Err(err) => {
                self.inner.router.record_frame_error(err);
                return;
            }
        };

        {
            let mut guard = self.shared();
            let shared = &mut *guard;
            let Some(conn) = shared
                .connection
                .as_mut()
                .filter(|c| c.generation == generation)
            else {
                return;
            };
            conn.last_activity_at = Instant::now();
            match &event {
                PushEvent::RegistrationConfirmed => {
                    if !conn.registered {
                        tracing::info!(identity = %conn.identity, "registration confirmed");
                    }
                    conn.registered = true;
                    conn.registration_watch = None;
                }
                PushEvent::Pong(pong) => {
                    let latency = Duration::from_millis((now_ms() - pong.timestamp).max(0) as u64);
                    shared.last_latency = Some(latency);
                    if latency > self.inner.config.latency_warn() {
                        tracing::warn!(
                            latency_ms = latency.as_millis() as u64,
                            "degraded connection: slow heartbeat round trip"
                        );
                    } else {
                        tracing::trace!(latency_ms = latency.as_millis() as u64, "pong");
                    }
                }
                _ => {}
            }
        }

        // Never call out to subscribers with the state lock held.
        self.inner.router.deliver(&event);
    }

    fn on_transport_lost(&self, generation: u64, reason: &str) {
        let (lost, identity) = {
            let mut shared = self.shared();
            if !shared
                .connection
                .as_ref()
                .is_some_and(|c| c.generation == generation)
            {
                return;
            }
            (shared.connection.take(), shared.identity.clone())
        };
        drop(lost);
        self.inner.router.detach_transport();

        let Some(identity) = identity else {
            self.set_status(ConnectionStatus::Disconnected);
            return;
        };
        tracing::warn!(%identity, generation, reason, "push channel lost; reconnecting");
        let task = TimerHandle::spawn(
            "reconnect",
            reconnect_loop(Arc::downgrade(&self.inner), identity),
        );
        self.shared().reconnect = Some(task);
    }

    /// Clears the handle of a reconnect loop that got `generation` up. A loss
    /// that already replaced that transport keeps its own loop.
    fn release_reconnect(&self, generation: u64) {
        let finished = {
            let mut shared = self.shared();
            let current = shared
                .connection
                .as_ref()
                .is_some_and(|c| c.generation == generation);
            if current {
                shared.reconnect.take()
            } else {
                None
            }
        };
        drop(finished);
    }

    /// Closes the connection and stops every background task. Router
    /// registrations are left in place for the next connect.
    pub fn disconnect(&self) {
        let (connection, reconnect, keepalive, identity) = {
            let mut shared = self.shared();
            (
                shared.connection.take(),
                shared.reconnect.take(),
                shared.keepalive.take(),
                shared.identity.take(),
            )
        };
        drop((connection, reconnect, keepalive));
        self.inner.router.detach_transport();
        self.set_status(ConnectionStatus::Disconnected);
        if let Some(identity) = identity {
            tracing::info!(%identity, "push channel disconnected");
        }
    }

    /// Sends a frame on the push channel.
    pub fn emit(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let frame = message
            .to_frame()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        let shared = self.shared();
        let conn = shared
            .connection
            .as_ref()
            .ok_or(TransportError::NotConnected)?;
        if !conn.is_live() {
            return Err(TransportError::Closed);
        }
        conn.send(frame)
    }

    /// Sends a heartbeat ping unless one went out within the debounce window.
    /// Returns whether a ping was sent.
    pub fn ping(&self) -> bool {
        let mut guard = self.shared();
        let shared = &mut *guard;
        let Some(conn) = shared.connection.as_ref().filter(|c| c.is_live()) else {
            return false;
        };
        let debounce = self.inner.config.ping_debounce();
        if shared
            .last_ping_at
            .is_some_and(|sent| sent.elapsed() < debounce)
        {
            tracing::trace!("ping suppressed by debounce");
            return false;
        }
        let frame = match (OutboundMessage::Ping { timestamp: now_ms() }).to_frame() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode ping");
                return false;
            }
        };
        if conn.send(frame).is_err() {
            return false;
        }
        shared.last_ping_at = Some(Instant::now());
        true
    }

    /// Compares the manager's view with the transport's. Returns false when a
    /// silent disconnect was found, in which case reconnection has started.
    pub fn check_health(&self) -> bool {
        let silent = self
            .shared()
            .connection
            .as_ref()
            .filter(|c| !c.is_live())
            .map(|c| c.generation);
        match silent {
            Some(generation) => {
                tracing::warn!(generation, "health check found a dead transport");
                self.on_transport_lost(generation, "silent disconnect");
                false
            }
            None => true,
        }
    }
}

async fn reader_loop(weak: Weak<Inner>, generation: u64, mut inbound: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = inbound.recv().await {
        let Some(manager) = ConnectionManager::upgrade(&weak) else {
            return;
        };
        manager.on_frame(generation, &text);
    }
    if let Some(manager) = ConnectionManager::upgrade(&weak) {
        manager.on_transport_lost(generation, "inbound stream closed");
    }
}

async fn reconnect_loop(weak: Weak<Inner>, identity: Identity) {
    let Some((max_attempts, delay)) = weak
        .upgrade()
        .map(|inner| (inner.config.max_reconnect_attempts, inner.config.reconnect_delay()))
    else {
        return;
    };

    for attempt in 1..=max_attempts {
        match ConnectionManager::upgrade(&weak) {
            Some(manager) => {
                manager.shared().reconnect_attempts = attempt;
                manager.set_status(ConnectionStatus::Reconnecting { attempt });
            }
            None => return,
        }

        tokio::time::sleep(delay).await;

        let Some(manager) = ConnectionManager::upgrade(&weak) else {
            return;
        };
        if manager.identity().as_ref() != Some(&identity) {
            return;
        }
        let Some(_guard) = ConnectGuard::acquire(&manager.inner.connecting) else {
            tracing::debug!("explicit connect in flight; reconnect loop standing down");
            return;
        };
        match manager.establish(&identity).await {
            Ok(handle) => {
                tracing::info!(attempt, generation = handle.generation, "reconnected");
                manager.release_reconnect(handle.generation);
                return;
            }
            Err(err) => {
                tracing::warn!(attempt, max_attempts, error = %err, "reconnect attempt failed");
            }
        }
    }

    if let Some(manager) = ConnectionManager::upgrade(&weak) {
        tracing::error!(%identity, attempts = max_attempts, "giving up on reconnection");
        let finished = manager.shared().reconnect.take();
        drop(finished);
        manager.set_status(ConnectionStatus::Dead);
    }
}

async fn keepalive_loop(weak: Weak<Inner>, heartbeat: Duration, health: Duration) {
    let start = Instant::now();
    let mut heartbeat_tick = interval_at(start + heartbeat, heartbeat);
    let mut health_tick = interval_at(start + health, health);
    heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Health first: never ping a transport that is already gone.
            biased;
            _ = health_tick.tick() => {
                let Some(manager) = ConnectionManager::upgrade(&weak) else { return };
                manager.check_health();
            }
            _ = heartbeat_tick.tick() => {
                let Some(manager) = ConnectionManager::upgrade(&weak) else { return };
                manager.ping();
            }
        }
    }
}
