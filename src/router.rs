//! Publish/subscribe core for the event stream.
//!
//! One [`Router`] is shared by the connection task (which feeds it raw text
//! frames) and every mounted consumer (which registers callbacks per
//! discriminant).
//!
//! # Design Principle: "Subscribe on mount. Drop on unmount."
//!
//! [`Router::subscribe`] returns a [`Subscription`] guard. Dropping the guard
//! (or calling [`Subscription::unsubscribe`]) removes exactly that
//! registration, and a discriminant with no subscribers left is removed from
//! the registry, so remounting a consumer never leaves a stale handler behind.
//!
//! # Deadlock Prevention
//!
//! Callbacks are collected under the registry lock, then the lock is released
//! before any callback runs. A callback may therefore subscribe or unsubscribe
//! (itself included) without deadlocking, and the in-progress fan-out is not
//! disturbed because it iterates over the snapshot.
//!
//! # Failure Isolation
//!
//! A callback that returns `Err` or panics is logged and skipped; its siblings
//! still receive the event. A malformed frame is logged and dropped.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::Result;
use chrono::Utc;

use crate::envelope::{Envelope, EventKind};
use crate::event::Event;

/// Subscriber callback.
///
/// Registration uses `Arc` pointer identity: subscribing the same `Arc` twice
/// for one discriminant registers it once.
pub type Callback = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

struct Registration {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    /// Discriminant -> callbacks in registration order.
    subscribers: HashMap<EventKind, Vec<Registration>>,
    /// Counter for generating unique registration IDs.
    next_id: u64,
}

impl Registry {
    /// Remove one registration. The caller drops the returned value after
    /// releasing the lock, since a callback may own other subscriptions.
    fn remove(&mut self, kind: &EventKind, id: u64) -> Option<Registration> {
        let list = self.subscribers.get_mut(kind)?;
        let idx = list.iter().position(|r| r.id == id)?;
        let removed = list.remove(idx);
        if list.is_empty() {
            self.subscribers.remove(kind);
        }
        Some(removed)
    }

    fn contains(&self, kind: &EventKind, id: u64) -> bool {
        self.subscribers
            .get(kind)
            .is_some_and(|list| list.iter().any(|r| r.id == id))
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    // Callbacks never run under the lock, so a poisoned registry is still
    // structurally sound.
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

fn same_callback(a: &Callback, b: &Callback) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Demultiplexes stream frames to subscribers by discriminant.
pub struct Router {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = lock(&self.registry);
        f.debug_struct("Router")
            .field("kind_count", &registry.subscribers.len())
            .field(
                "total_subscribers",
                &registry.subscribers.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create a router with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Register `callback` for `kind`.
    ///
    /// If the same callback is already registered for `kind`, no second
    /// registration is made and the returned guard refers to the existing one.
    pub fn subscribe(&self, kind: impl Into<EventKind>, callback: Callback) -> Subscription {
        let kind = kind.into();
        let mut registry = lock(&self.registry);

        let existing = registry
            .subscribers
            .get(&kind)
            .and_then(|list| list.iter().find(|r| same_callback(&r.callback, &callback)))
            .map(|r| r.id);

        let id = if let Some(id) = existing {
            id
        } else {
            let id = registry.next_id;
            registry.next_id += 1;
            registry
                .subscribers
                .entry(kind.clone())
                .or_default()
                .push(Registration { id, callback });
            log::debug!("[Router] Registered subscriber {} for '{}'", id, kind);
            id
        };

        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.registry),
            active: AtomicBool::new(true),
        }
    }

    /// Register a closure for `kind`.
    pub fn on<F>(&self, kind: impl Into<EventKind>, f: F) -> Subscription
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(f))
    }

    /// Parse a raw text frame and dispatch it.
    ///
    /// Malformed frames are logged and dropped. Returns the number of
    /// callbacks invoked.
    pub fn dispatch_frame(&self, frame: &str) -> usize {
        match Envelope::parse(frame) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) => {
                log::warn!(
                    "[Router] Dropping frame: {:#} ({})",
                    e,
                    frame.chars().take(100).collect::<String>()
                );
                0
            }
        }
    }

    /// Normalize and dispatch an envelope to every subscriber of its kind.
    ///
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, envelope: Envelope) -> usize {
        let kind = envelope.kind.clone();

        // Snapshot under the lock, invoke after releasing it.
        let callbacks: Vec<Callback> = {
            let registry = lock(&self.registry);
            match registry.subscribers.get(&kind) {
                Some(list) => list.iter().map(|r| Arc::clone(&r.callback)).collect(),
                None => {
                    log::trace!("[Router] No subscribers for '{}'", kind);
                    return 0;
                }
            }
        };

        let event = Event::normalize(envelope, Utc::now());
        for callback in &callbacks {
            invoke(&kind, callback, &event);
        }
        callbacks.len()
    }

    /// Remove every subscription.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut lock(&self.registry).subscribers);
        let total: usize = removed.values().map(Vec::len).sum();
        if total > 0 {
            log::debug!("[Router] Cleared {} subscribers", total);
        }
    }

    /// Number of callbacks registered for `kind`.
    #[must_use]
    pub fn subscriber_count(&self, kind: &EventKind) -> usize {
        lock(&self.registry).subscribers.get(kind).map_or(0, Vec::len)
    }

    /// Discriminants with at least one subscriber.
    #[must_use]
    pub fn registered_kinds(&self) -> Vec<EventKind> {
        lock(&self.registry).subscribers.keys().cloned().collect()
    }

    /// True if nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.registry).subscribers.is_empty()
    }
}

fn invoke(kind: &EventKind, callback: &Callback, event: &Event) {
    // The event is shared read-only; a panicking callback cannot leave it
    // half-updated.
    match catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log::error!("[Router] Subscriber for '{}' failed: {:#}", kind, e);
        }
        Err(panic_info) => {
            let msg = panic_info
                .downcast_ref::<String>()
                .map(String::as_str)
                .or_else(|| panic_info.downcast_ref::<&str>().copied())
                .unwrap_or("unknown panic");
            log::error!("[Router] Subscriber for '{}' panicked: {}", kind, msg);
        }
    }
}

/// Guard for one registration.
///
/// Dropping the guard unsubscribes. [`Self::unsubscribe`] may be called any
/// number of times; only the first call has an effect.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    kind: EventKind,
    id: u64,
    registry: Weak<Mutex<Registry>>,
    active: AtomicBool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}

impl Subscription {
    /// Remove this registration. Returns `true` if this call removed it.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let removed = lock(&registry).remove(&self.kind, self.id);
        if removed.is_some() {
            log::debug!("[Router] Unregistered subscriber {} for '{}'", self.id, self.kind);
        }
        removed.is_some()
    }

    /// True while the registration is still in the router.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
            && self
                .registry
                .upgrade()
                .is_some_and(|r| lock(&r).contains(&self.kind, self.id))
    }

    /// Discriminant this subscription listens to.
    #[must_use]
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Level;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Callback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: Callback = Arc::new(move |event: &Event| {
            let text = match event {
                Event::Log(entry) => entry.message.clone(),
                other => other.envelope().map(Envelope::message_text).unwrap_or_default(),
            };
            sink.lock().unwrap().push(text);
            Ok(())
        });
        (seen, cb)
    }

    #[test]
    fn test_subscribe_then_unsubscribe_is_not_invoked() {
        let router = Router::new();
        let (seen, cb) = recorder();
        let sub = router.subscribe(EventKind::Log, cb);
        assert!(sub.unsubscribe());

        let invoked = router.dispatch_frame(r#"{"type":"log","message":"m"}"#);
        assert_eq!(invoked, 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_removes_empty_kind() {
        let router = Router::new();
        let (_seen, cb) = recorder();
        let sub = router.subscribe("system", cb);
        assert_eq!(router.subscriber_count(&EventKind::System), 1);

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(!sub.is_active());
        assert!(router.is_empty());
        assert!(router.registered_kinds().is_empty());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let router = Router::new();
        let (seen, cb) = recorder();
        {
            let _sub = router.subscribe(EventKind::Log, cb);
            router.dispatch_frame(r#"{"type":"log","message":"mounted"}"#);
        }
        router.dispatch_frame(r#"{"type":"log","message":"unmounted"}"#);
        assert_eq!(*seen.lock().unwrap(), vec!["mounted"]);
        assert!(router.is_empty());
    }

    #[test]
    fn test_same_callback_registers_once() {
        let router = Router::new();
        let (seen, cb) = recorder();
        let a = router.subscribe(EventKind::Log, Arc::clone(&cb));
        let b = router.subscribe(EventKind::Log, Arc::clone(&cb));
        assert_eq!(router.subscriber_count(&EventKind::Log), 1);

        router.dispatch_frame(r#"{"type":"log","message":"once"}"#);
        assert_eq!(*seen.lock().unwrap(), vec!["once"]);

        // Either guard removes the single registration.
        assert!(b.unsubscribe());
        assert!(!a.is_active());
        assert!(!a.unsubscribe());
    }

    #[test]
    fn test_unsubscribe_removes_only_its_own_registration() {
        let router = Router::new();
        let (seen_a, cb_a) = recorder();
        let (seen_b, cb_b) = recorder();
        let a = router.subscribe(EventKind::Log, cb_a);
        let _b = router.subscribe(EventKind::Log, cb_b);

        a.unsubscribe();
        router.dispatch_frame(r#"{"type":"log","message":"x"}"#);
        assert!(seen_a.lock().unwrap().is_empty());
        assert_eq!(*seen_b.lock().unwrap(), vec!["x"]);
        assert_eq!(router.subscriber_count(&EventKind::Log), 1);
    }

    #[test]
    fn test_malformed_frame_between_good_frames() {
        let router = Router::new();
        let (seen_a, cb_a) = recorder();
        let (seen_b, cb_b) = recorder();
        let _a = router.subscribe(EventKind::Log, cb_a);
        let _b = router.subscribe(EventKind::Log, cb_b);

        router.dispatch_frame(r#"{"type":"log","message":"first"}"#);
        assert_eq!(router.dispatch_frame(r#"{"type":"log","message":"#), 0);
        router.dispatch_frame(r#"{"type":"log","message":"second"}"#);

        assert_eq!(*seen_a.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(*seen_b.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_failing_subscribers_do_not_block_siblings() {
        let router = Router::new();
        let _err = router.on(EventKind::Log, |_| anyhow::bail!("subscriber failed"));
        let _panic = router.on(EventKind::Log, |_| panic!("subscriber panicked"));
        let (seen, cb) = recorder();
        let _ok = router.subscribe(EventKind::Log, cb);

        let invoked = router.dispatch_frame(r#"{"type":"log","message":"still here"}"#);
        assert_eq!(invoked, 3);
        assert_eq!(*seen.lock().unwrap(), vec!["still here"]);
    }

    #[test]
    fn test_registration_order_is_dispatch_order() {
        let router = Router::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let subs: Vec<Subscription> = (0..5)
            .map(|i| {
                let order = Arc::clone(&order);
                router.on(EventKind::System, move |_| {
                    order.lock().unwrap().push(i);
                    Ok(())
                })
            })
            .collect();

        router.dispatch_frame(r#"{"type":"system","message":"tick"}"#);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        drop(subs);
    }

    #[test]
    fn test_self_unsubscribe_mid_dispatch() {
        let router = Arc::new(Router::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let first_calls = Arc::new(AtomicUsize::new(0));

        let sub = {
            let slot = Arc::clone(&slot);
            let calls = Arc::clone(&first_calls);
            router.on(EventKind::Log, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = slot.lock().unwrap().take() {
                    me.unsubscribe();
                }
                Ok(())
            })
        };
        *slot.lock().unwrap() = Some(sub);

        let (seen, cb) = recorder();
        let _second = router.subscribe(EventKind::Log, cb);

        // The snapshot still reaches the second subscriber.
        assert_eq!(router.dispatch_frame(r#"{"type":"log","message":"a"}"#), 2);
        assert_eq!(router.dispatch_frame(r#"{"type":"log","message":"b"}"#), 1);
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_subscribe_inside_callback_does_not_deadlock() {
        let router = Arc::new(Router::new());
        let late: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));
        let hits = Arc::new(AtomicUsize::new(0));

        let _outer = {
            let router_ref = Arc::clone(&router);
            let late = Arc::clone(&late);
            let hits = Arc::clone(&hits);
            router.on(EventKind::System, move |_| {
                let hits = Arc::clone(&hits);
                let sub = router_ref.on(EventKind::Installation, move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                late.lock().unwrap().push(sub);
                Ok(())
            })
        };

        router.dispatch_frame(r#"{"type":"system"}"#);
        router.dispatch_frame(r#"{"type":"installation"}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_log_subscriber_receives_normalized_entry() {
        let router = Router::new();
        let got = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&got);
        let _sub = router.on(EventKind::Log, move |event| {
            *sink.lock().unwrap() = event.as_log().cloned();
            Ok(())
        });

        router.dispatch_frame(
            r#"{"type":"log","message":"m1","timestamp":1700000000000,"level":"error"}"#,
        );
        let entry = got.lock().unwrap().clone().unwrap();
        assert_eq!(entry.level, Level::Error);
        assert_eq!(entry.message, "m1");
        assert_eq!(entry.timestamp, "2023-11-14T22:13:20.000Z");
    }

    #[test]
    fn test_frames_with_mistyped_fields_still_delivered() {
        let router = Router::new();
        let (seen, cb) = recorder();
        let _sub = router.subscribe(EventKind::Log, cb);

        assert_eq!(
            router.dispatch_frame(r#"{"type":"log","message":"numlevel","level":3}"#),
            1
        );
        assert_eq!(
            router.dispatch_frame(r#"{"type":"log","message":"numop","operation":7}"#),
            1
        );
        assert_eq!(
            router.dispatch_frame(r#"{"type":"log","message":"boolts","timestamp":true}"#),
            1
        );
        assert_eq!(*seen.lock().unwrap(), vec!["numlevel", "numop", "boolts"]);
    }

    #[test]
    fn test_kinds_are_isolated() {
        let router = Router::new();
        let (seen_log, cb_log) = recorder();
        let (seen_sys, cb_sys) = recorder();
        let _a = router.subscribe(EventKind::Log, cb_log);
        let _b = router.subscribe(EventKind::System, cb_sys);

        router.dispatch_frame(r#"{"type":"system","message":"boot"}"#);
        router.dispatch_frame(r#"{"type":"unknown","message":"ignored"}"#);
        assert!(seen_log.lock().unwrap().is_empty());
        assert_eq!(*seen_sys.lock().unwrap(), vec!["boot"]);
    }

    #[test]
    fn test_clear_removes_everything() {
        let router = Router::new();
        let (seen, cb) = recorder();
        let sub = router.subscribe(EventKind::Log, cb);
        router.clear();
        assert!(router.is_empty());
        assert!(!sub.is_active());
        router.dispatch_frame(r#"{"type":"log","message":"gone"}"#);
        assert!(seen.lock().unwrap().is_empty());
        // Guard drop after clear is a no-op.
        assert!(!sub.unsubscribe());
    }
}
