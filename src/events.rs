//! Typed listener registries with fault-isolated dispatch.
//!
//! Consumers (a renderer, a headless observer, a test) register callbacks
//! for each notification type instead of polling. Dispatch is synchronous
//! and in registration order, but each listener runs inside a fault
//! boundary: one panicking subscriber is logged and skipped, never allowed
//! to take the rest of the fan-out down with it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nostr_sdk::PublicKey;
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Listener registry
// ---------------------------------------------------------------------------

/// Handle returned by [`Listeners::add`]; removal is by id, so two
/// registrations of the same closure stay independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

/// A registry of callbacks for one notification type.
pub struct Listeners<T> {
    entries: Mutex<Vec<(ListenerId, Callback<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a listener. Unknown ids are a no-op.
    pub fn remove(&self, id: ListenerId) {
        self.entries.lock().retain(|(entry_id, _)| *entry_id != id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Notify every listener in registration order.
    ///
    /// The registry lock is released before any callback runs, so a
    /// listener may add or remove listeners (including itself) without
    /// deadlocking; such changes take effect from the next emit.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<(ListenerId, Callback<T>)> = self.entries.lock().clone();
        for (id, callback) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                log::warn!("listener {id:?} panicked; skipping it for this event");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Disconnected,
}

/// Emitted on every connection-state transition of the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionUpdate {
    pub state: ConnectionState,
    /// Resolved identity, present once `Active`.
    pub pubkey: Option<PublicKey>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_all_listeners_in_order() {
        let listeners: Listeners<u32> = Listeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            listeners.add(move |v: &u32| seen.lock().push(format!("{tag}{v}")));
        }

        listeners.emit(&7);
        assert_eq!(*seen.lock(), vec!["a7", "b7", "c7"]);
    }

    #[test]
    fn remove_by_id() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let id = listeners.add(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        listeners.emit(&());
        listeners.remove(id);
        listeners.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn panicking_listener_does_not_block_the_rest() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        listeners.add(|_| panic!("bad subscriber"));
        let c = count.clone();
        listeners.add(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&());
        listeners.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listener_may_remove_itself_during_emit() {
        let listeners: Arc<Listeners<()>> = Arc::new(Listeners::new());
        let count = Arc::new(AtomicUsize::new(0));

        let inner = listeners.clone();
        let c = count.clone();
        let id = Arc::new(Mutex::new(None));
        let id_slot = id.clone();
        let registered = listeners.add(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(own) = *id_slot.lock() {
                inner.remove(own);
            }
        });
        *id.lock() = Some(registered);

        listeners.emit(&());
        listeners.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
