//! Event dispatcher with token-based, revocable subscriptions.
//!
//! The dispatcher multiplexes orchestrator events to registered listeners.
//! Each `on()` call returns a [`SubscriptionToken`] whose sole purpose is
//! revocation; holding the token is the only way to remove that specific
//! listener. This replaces ambient global callback slots: a caller's
//! interest in events has a bounded lifetime tied to its own, and must be
//! revoked when the caller goes away.
//!
//! Delivery contract:
//! - `emit` is synchronous and delivers in registration order;
//! - a panicking handler is isolated and does not prevent delivery to the
//!   remaining handlers or corrupt the registry;
//! - `off` is complete and synchronous: no event reaches the revoked
//!   handler after `off` returns, even one already being dispatched in the
//!   same batch.

use log::warn;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Event categories a listener can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Progress,
    Complete,
    Error,
    Cancelled,
}

/// Payloads delivered to listeners.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScanEvent {
    Progress {
        frames_captured: u32,
        frames_total: u32,
    },
    Complete {
        output_path: PathBuf,
        frames_captured: u32,
        success: bool,
    },
    Error {
        message: String,
    },
    Cancelled {
        frames_captured: u32,
    },
}

impl ScanEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ScanEvent::Progress { .. } => EventKind::Progress,
            ScanEvent::Complete { .. } => EventKind::Complete,
            ScanEvent::Error { .. } => EventKind::Error,
            ScanEvent::Cancelled { .. } => EventKind::Cancelled,
        }
    }
}

/// Opaque revocation handle returned by [`EventDispatcher::on`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Handler = Arc<dyn Fn(&ScanEvent) + Send + Sync>;

struct Entry {
    token: u64,
    kind: EventKind,
    // Checked immediately before each delivery so that off() during an
    // in-flight batch still suppresses the remaining deliveries.
    revoked: Arc<AtomicBool>,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_token: u64,
    entries: Vec<Entry>,
}

/// Fan-out point for orchestrator events.
#[derive(Default)]
pub struct EventDispatcher {
    inner: Mutex<Registry>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of `kind` and returns the token that
    /// revokes exactly this registration.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionToken
    where
        F: Fn(&ScanEvent) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let token = registry.next_token;
        registry.next_token += 1;
        registry.entries.push(Entry {
            token,
            kind,
            revoked: Arc::new(AtomicBool::new(false)),
            handler: Arc::new(handler),
        });
        SubscriptionToken(token)
    }

    /// Removes the handler associated with `token`. Idempotent: revoking an
    /// unknown or already-revoked token is harmless.
    pub fn off(&self, token: SubscriptionToken) {
        let mut registry = self.lock();
        if let Some(pos) = registry.entries.iter().position(|e| e.token == token.0) {
            let entry = registry.entries.remove(pos);
            entry.revoked.store(true, Ordering::SeqCst);
        }
    }

    /// Delivers `event` to every currently registered handler of its kind,
    /// synchronously, in registration order.
    pub fn emit(&self, event: &ScanEvent) {
        let kind = event.kind();
        // Snapshot under the lock, deliver outside it: handlers may call
        // on()/off() without deadlocking, and the revoked flag keeps off()
        // authoritative for the remainder of this batch.
        let snapshot: Vec<(Arc<AtomicBool>, Handler)> = {
            let registry = self.lock();
            registry
                .entries
                .iter()
                .filter(|e| e.kind == kind)
                .map(|e| (Arc::clone(&e.revoked), Arc::clone(&e.handler)))
                .collect()
        };

        for (revoked, handler) in snapshot {
            if revoked.load(Ordering::SeqCst) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            if outcome.is_err() {
                warn!("event handler panicked while handling {kind:?} event; continuing");
            }
        }
    }

    /// Number of live registrations, across all kinds.
    pub fn subscriber_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // A poisoned registry is still structurally sound: handler panics
        // happen outside the lock, and registry mutation cannot panic.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn progress(n: u32) -> ScanEvent {
        ScanEvent::Progress {
            frames_captured: n,
            frames_total: 72,
        }
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let order = Arc::clone(&order);
            dispatcher.on(EventKind::Progress, move |_| {
                order.lock().expect("order lock").push(id);
            });
        }

        dispatcher.emit(&progress(1));
        assert_eq!(*order.lock().expect("order lock"), vec![0, 1, 2]);
    }

    #[test]
    fn test_off_is_idempotent() {
        let dispatcher = EventDispatcher::new();
        let token = dispatcher.on(EventKind::Error, |_| {});
        dispatcher.off(token);
        dispatcher.off(token);
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[test]
    fn test_off_only_removes_its_own_handler() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_a = Arc::clone(&hits);
        let token_a = dispatcher.on(EventKind::Progress, move |_| {
            hits_a.fetch_add(1, Ordering::SeqCst);
        });
        let hits_b = Arc::clone(&hits);
        let _token_b = dispatcher.on(EventKind::Progress, move |_| {
            hits_b.fetch_add(10, Ordering::SeqCst);
        });

        dispatcher.off(token_a);
        dispatcher.emit(&progress(1));
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_same_batch_revocation() {
        // A handler that revokes a later-registered listener during emit:
        // the revoked listener must not see the event already in flight.
        let dispatcher = Arc::new(EventDispatcher::new());
        let victim_hits = Arc::new(AtomicUsize::new(0));

        let victim_token = Arc::new(Mutex::new(None));

        let d = Arc::clone(&dispatcher);
        let slot = Arc::clone(&victim_token);
        dispatcher.on(EventKind::Progress, move |_| {
            if let Some(token) = slot.lock().expect("token lock").take() {
                d.off(token);
            }
        });

        let hits = Arc::clone(&victim_hits);
        let token = dispatcher.on(EventKind::Progress, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        *victim_token.lock().expect("token lock") = Some(token);

        dispatcher.emit(&progress(1));
        dispatcher.emit(&progress(2));
        assert_eq!(victim_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.on(EventKind::Error, |_| panic!("listener bug"));
        let hits_clone = Arc::clone(&hits);
        dispatcher.on(EventKind::Error, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit(&ScanEvent::Error {
            message: "boom".to_string(),
        });
        dispatcher.emit(&ScanEvent::Error {
            message: "boom again".to_string(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.subscriber_count(), 2, "registry not corrupted");
    }

    #[test]
    fn test_kinds_are_independent() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        dispatcher.on(EventKind::Complete, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit(&progress(5));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
