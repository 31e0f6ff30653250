//! # Event Router
//!
//! Keeps the set of subscribers for every [`EventKind`] and fans decoded push
//! events out to them.
//!
//! Subscribers live in a registry that outlives any single connection. The
//! connection manager calls [`EventRouter::attach_transport`] each time a
//! transport comes up; the router then throws away every transport-level
//! listener it had and rebuilds the table from the registry, so a reconnect
//! can never leave a callback attached twice. Registrations made while no
//! transport is up are queued in the registry and picked up by the next
//! attach.
//!
//! Callbacks are identified by the address of their `Arc`, which makes
//! duplicate registration a structural no-op: registering the same callback
//! for the same kind again hands back another handle to the existing entry.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;

use crate::models::events::{EventKind, FrameError, PushEvent};

/// A subscriber callback. Returning `Err` is logged and isolated.
pub type EventCallback = Arc<dyn Fn(&PushEvent) -> anyhow::Result<()> + Send + Sync>;

/// Wraps a closure into an [`EventCallback`]. Each call yields a new identity.
pub fn callback<F>(f: F) -> EventCallback
where
    F: Fn(&PushEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Unknown event names kept for inspection.
const UNKNOWN_NAME_CAP: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Counters for everything that reached the router but no subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterDiagnostics {
    /// Events that fired with nobody listening.
    pub unhandled: BTreeMap<EventKind, u64>,
    /// Most recent names outside the known event set.
    pub unknown_events: Vec<String>,
    pub unknown_count: u64,
    /// Frames with a known name whose payload failed to decode.
    pub malformed: u64,
    /// Callbacks that returned an error or panicked.
    pub callback_failures: u64,
}

struct Subscriber {
    id: SubscriptionId,
    callback: EventCallback,
    /// Live `Subscription` handles pointing at this entry.
    handles: usize,
}

#[derive(Default)]
struct RouterState {
    next_id: u64,
    registry: BTreeMap<EventKind, Vec<Subscriber>>,
    /// Transport-level listener table, rebuilt on every attach.
    attached: BTreeMap<EventKind, Vec<SubscriptionId>>,
    transport_live: bool,
    attach_count: u64,
    diagnostics: RouterDiagnostics,
}

impl RouterState {
    fn remove(&mut self, kind: EventKind, id: SubscriptionId) {
        if let Some(subs) = self.registry.get_mut(&kind) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                self.registry.remove(&kind);
            }
        }
        if let Some(ids) = self.attached.get_mut(&kind) {
            ids.retain(|attached| *attached != id);
        }
    }
}

/// Handle returned by [`EventRouter::on`]. Dropping it (or calling
/// [`Subscription::unsubscribe`]) removes the callback once no other handle
/// refers to it.
#[must_use = "dropping a Subscription removes the callback"]
pub struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    router: Weak<Mutex<RouterState>>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let Some(state) = self.router.upgrade() else {
            return;
        };
        let mut state = lock(&state);
        let remaining = state
            .registry
            .get_mut(&self.kind)
            .and_then(|subs| subs.iter_mut().find(|s| s.id == self.id))
            .map(|sub| {
                sub.handles = sub.handles.saturating_sub(1);
                sub.handles
            });
        if remaining == Some(0) {
            state.remove(self.kind, self.id);
            tracing::debug!(event = %self.kind, id = self.id.0, "subscription removed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("active", &self.active)
            .finish()
    }
}

fn lock(state: &Mutex<RouterState>) -> MutexGuard<'_, RouterState> {
    // A panicking callback never runs under this lock, so poisoning only
    // happens on a bug inside the router itself; keep serving regardless.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn same_callback(a: &EventCallback, b: &EventCallback) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Registry and fan-out for push events. Cheap to clone.
#[derive(Clone, Default)]
pub struct EventRouter {
    state: Arc<Mutex<RouterState>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `kind`.
    ///
    /// If a transport is attached the callback starts receiving transport
    /// events right away; otherwise it is queued until the next attach.
    pub fn on(&self, kind: EventKind, callback: EventCallback) -> Subscription {
        let mut state = lock(&self.state);

        let existing = state
            .registry
            .get_mut(&kind)
            .and_then(|subs| subs.iter_mut().find(|s| same_callback(&s.callback, &callback)));
        if let Some(sub) = existing {
            sub.handles += 1;
            tracing::debug!(event = %kind, id = sub.id.0, "duplicate registration ignored");
            return Subscription {
                id: sub.id,
                kind,
                router: Arc::downgrade(&self.state),
                active: true,
            };
        }

        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        state.registry.entry(kind).or_default().push(Subscriber {
            id,
            callback,
            handles: 1,
        });

        if state.transport_live {
            state.attached.entry(kind).or_default().push(id);
            tracing::debug!(event = %kind, id = id.0, "subscriber attached to live transport");
        } else {
            tracing::debug!(event = %kind, id = id.0, "subscriber queued until connect");
        }

        Subscription {
            id,
            kind,
            router: Arc::downgrade(&self.state),
            active: true,
        }
    }

    /// Removes `callback` from `kind` regardless of outstanding handles.
    pub fn off(&self, kind: EventKind, callback: &EventCallback) -> bool {
        let mut state = lock(&self.state);
        let id = state
            .registry
            .get(&kind)
            .and_then(|subs| subs.iter().find(|s| same_callback(&s.callback, callback)))
            .map(|s| s.id);
        match id {
            Some(id) => {
                state.remove(kind, id);
                true
            }
            None => false,
        }
    }

    /// Drops every transport-level listener and re-attaches the whole
    /// registry. Called by the connection manager on each (re)connect.
    pub fn attach_transport(&self) -> usize {
        let mut state = lock(&self.state);
        state.attached.clear();
        let table: BTreeMap<EventKind, Vec<SubscriptionId>> = state
            .registry
            .iter()
            .map(|(kind, subs)| (*kind, subs.iter().map(|s| s.id).collect()))
            .collect();
        let total = table.values().map(Vec::len).sum();
        state.attached = table;
        state.transport_live = true;
        state.attach_count += 1;
        tracing::info!(
            subscribers = total,
            attach = state.attach_count,
            "re-attached subscriptions to transport"
        );
        total
    }

    /// Marks the transport as gone. Registrations stay in the registry.
    pub fn detach_transport(&self) {
        let mut state = lock(&self.state);
        state.attached.clear();
        state.transport_live = false;
    }

    /// Fires a named event with a JSON payload at every registered
    /// subscriber, connected or not. Used for local injection.
    pub fn trigger(&self, name: &str, data: Value) {
        match PushEvent::decode(name, data) {
            Ok(event) => self.publish(&event),
            Err(err) => self.record_frame_error(err),
        }
    }

    /// Fires an already decoded event at every registered subscriber.
    pub fn publish(&self, event: &PushEvent) {
        let callbacks = {
            let state = lock(&self.state);
            state
                .registry
                .get(&event.kind())
                .map(|subs| subs.iter().map(|s| s.callback.clone()).collect::<Vec<_>>())
                .unwrap_or_default()
        };
        self.invoke(event, callbacks);
    }

    /// Entry point for frames read off the transport. Only listeners attached
    /// to the current transport see them.
    pub fn deliver_frame(&self, text: &str) {
        match PushEvent::from_frame(text) {
            Ok(event) => self.deliver(&event),
            Err(err) => self.record_frame_error(err),
        }
    }

    pub(crate) fn deliver(&self, event: &PushEvent) {
        let callbacks = {
            let state = lock(&self.state);
            let ids = state.attached.get(&event.kind());
            state
                .registry
                .get(&event.kind())
                .map(|subs| {
                    subs.iter()
                        .filter(|s| ids.is_some_and(|ids| ids.contains(&s.id)))
                        .map(|s| s.callback.clone())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        self.invoke(event, callbacks);
    }

    fn invoke(&self, event: &PushEvent, callbacks: Vec<EventCallback>) {
        let kind = event.kind();
        if callbacks.is_empty() {
            tracing::debug!(event = %kind, "no subscribers for event");
            let mut state = lock(&self.state);
            *state.diagnostics.unhandled.entry(kind).or_default() += 1;
            return;
        }

        let mut failures = 0u64;
        for cb in callbacks {
            match catch_unwind(AssertUnwindSafe(|| cb(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures += 1;
                    tracing::error!(event = %kind, error = %err, "event callback failed");
                }
                Err(panic) => {
                    failures += 1;
                    tracing::error!(event = %kind, panic = panic_message(&*panic), "event callback panicked");
                }
            }
        }

        if failures > 0 {
            lock(&self.state).diagnostics.callback_failures += failures;
        }
    }

    pub(crate) fn record_frame_error(&self, err: FrameError) {
        let mut state = lock(&self.state);
        match err {
            FrameError::UnknownEvent(name) => {
                tracing::warn!(event = %name, "unknown event routed to diagnostics");
                state.diagnostics.unknown_count += 1;
                if state.diagnostics.unknown_events.len() == UNKNOWN_NAME_CAP {
                    state.diagnostics.unknown_events.remove(0);
                }
                state.diagnostics.unknown_events.push(name);
            }
            other => {
                tracing::warn!(error = %other, "dropping undecodable frame");
                state.diagnostics.malformed += 1;
            }
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        lock(&self.state).registry.get(&kind).map_or(0, Vec::len)
    }

    pub fn attached_count(&self, kind: EventKind) -> usize {
        lock(&self.state).attached.get(&kind).map_or(0, Vec::len)
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.state).transport_live
    }

    pub fn diagnostics(&self) -> RouterDiagnostics {
        lock(&self.state).diagnostics.clone()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, EventCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let cb = callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (hits, cb)
    }

    fn started_frame(ride: &str) -> String {
        json!({"event": "ride_started", "data": {"rideId": ride}}).to_string()
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let router = EventRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut subs = Vec::new();
        for n in 0..3 {
            let order = order.clone();
            subs.push(router.on(
                EventKind::RideStarted,
                callback(move |_| {
                    order.lock().unwrap().push(n);
                    Ok(())
                }),
            ));
        }

        router.trigger("ride_started", json!({"rideId": "R1"}));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn duplicate_registration_does_not_grow_the_set() {
        let router = EventRouter::new();
        let (hits, cb) = counter();
        let first = router.on(EventKind::Pong, cb.clone());
        let second = router.on(EventKind::Pong, cb.clone());
        assert_eq!(first.id(), second.id());
        assert_eq!(router.subscriber_count(EventKind::Pong), 1);

        router.trigger("pong", json!({"timestamp": 1}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The entry survives until the last handle is gone.
        drop(first);
        assert_eq!(router.subscriber_count(EventKind::Pong), 1);
        drop(second);
        assert_eq!(router.subscriber_count(EventKind::Pong), 0);
    }

    #[test]
    fn registrations_survive_reattach_without_duplication() {
        let router = EventRouter::new();
        let (hits, cb) = counter();
        let _sub = router.on(EventKind::RideStarted, cb);

        // Queued before any transport exists.
        router.deliver_frame(&started_frame("R1"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        for _ in 0..3 {
            router.detach_transport();
            router.attach_transport();
        }
        assert_eq!(router.attached_count(EventKind::RideStarted), 1);

        router.deliver_frame(&started_frame("R1"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_registration_attaches_immediately() {
        let router = EventRouter::new();
        router.attach_transport();
        let (hits, cb) = counter();
        let _sub = router.on(EventKind::RideStarted, cb);
        router.deliver_frame(&started_frame("R9"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_callbacks_are_isolated() {
        let router = EventRouter::new();
        let _err = router.on(
            EventKind::RideStarted,
            callback(|_| Err(anyhow::anyhow!("boom"))),
        );
        let _panic = router.on(
            EventKind::RideStarted,
            callback(|_| panic!("callback exploded")),
        );
        let (hits, cb) = counter();
        let _ok = router.on(EventKind::RideStarted, cb);

        router.trigger("ride_started", json!({"rideId": "R1"}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(router.diagnostics().callback_failures, 2);
    }

    #[test]
    fn off_removes_by_callback_identity() {
        let router = EventRouter::new();
        let (hits, cb) = counter();
        let sub = router.on(EventKind::Pong, cb.clone());
        assert!(router.off(EventKind::Pong, &cb));
        assert!(!router.off(EventKind::Pong, &cb));
        router.trigger("pong", json!({"timestamp": 1}));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        // Dropping a handle to an already removed entry is harmless.
        drop(sub);
    }

    #[test]
    fn unknown_unhandled_and_malformed_events_are_counted() {
        let router = EventRouter::new();
        router.trigger("surge_pricing", json!({}));
        router.trigger("ride_started", json!({"rideId": "R1"}));
        router.deliver_frame(r#"{"event":"ride_started","data":{"wrong":1}}"#);

        let diag = router.diagnostics();
        assert_eq!(diag.unknown_count, 1);
        assert_eq!(diag.unknown_events, vec!["surge_pricing".to_string()]);
        assert_eq!(diag.unhandled.get(&EventKind::RideStarted), Some(&1));
        assert_eq!(diag.malformed, 1);
    }

    #[test]
    fn callbacks_may_register_from_inside_a_callback() {
        let router = EventRouter::new();
        let inner_router = router.clone();
        let held = Arc::new(Mutex::new(Vec::new()));
        let held_in = held.clone();
        let _sub = router.on(
            EventKind::RideStarted,
            callback(move |_| {
                let sub = inner_router.on(EventKind::Pong, callback(|_| Ok(())));
                held_in.lock().unwrap().push(sub);
                Ok(())
            }),
        );
        router.trigger("ride_started", json!({"rideId": "R1"}));
        assert_eq!(router.subscriber_count(EventKind::Pong), 1);
    }
}
