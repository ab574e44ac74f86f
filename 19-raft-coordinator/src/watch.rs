//! Node-side watch registry.
//!
//! Watches are never replicated: the node serving a `Watch` RPC registers a
//! [`WatchSignal`] here, and the apply path pokes it whenever the watched key
//! (or one of its children) changes. A client re-issuing a watch on the same
//! key from the same session cancels the previous registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
pub struct WatchSignal {
    notify: Notify,
    canceled: AtomicBool,
    child_changed: AtomicBool,
}

impl WatchSignal {
    /// Resolves after the next change notification or cancellation.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Whether a key below the watched one changed since registration.
    pub fn child_changed(&self) -> bool {
        self.child_changed.load(Ordering::Acquire)
    }

    fn fire(&self) {
        self.notify.notify_one();
    }
}

/// Handle returned by [`WatchRegistry::register`].
#[derive(Debug)]
pub struct WatchTicket {
    id: u64,
    ns: String,
    key: String,
    pub signal: Arc<WatchSignal>,
}

#[derive(Debug)]
struct Registration {
    id: u64,
    session: String,
    signal: Arc<WatchSignal>,
}

#[derive(Debug, Default)]
struct RegistryState {
    next_id: u64,
    by_key: HashMap<(String, String), Vec<Registration>>,
}

#[derive(Debug, Default)]
pub struct WatchRegistry {
    state: Mutex<RegistryState>,
}

impl WatchRegistry {
    pub fn register(&self, ns: &str, key: &str, session: &str) -> WatchTicket {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        let slot = state
            .by_key
            .entry((ns.to_string(), key.to_string()))
            .or_default();
        slot.retain(|existing| {
            if existing.session == session && !session.is_empty() {
                existing.signal.canceled.store(true, Ordering::Release);
                existing.signal.fire();
                false
            } else {
                true
            }
        });
        let signal = Arc::new(WatchSignal::default());
        slot.push(Registration {
            id,
            session: session.to_string(),
            signal: Arc::clone(&signal),
        });
        WatchTicket {
            id,
            ns: ns.to_string(),
            key: key.to_string(),
            signal,
        }
    }

    pub fn unregister(&self, ticket: &WatchTicket) {
        let mut state = self.state.lock();
        let map_key = (ticket.ns.clone(), ticket.key.clone());
        if let Some(slot) = state.by_key.get_mut(&map_key) {
            slot.retain(|existing| existing.id != ticket.id);
            if slot.is_empty() {
                state.by_key.remove(&map_key);
            }
        }
    }

    /// Wakes watchers of `key` and of its parent (`a/b` for `a/b/c`).
    pub fn notify_change(&self, ns: &str, key: &str) {
        let state = self.state.lock();
        if let Some(slot) = state.by_key.get(&(ns.to_string(), key.to_string())) {
            debug!(ns, key, watchers = slot.len(), "watch triggered");
            for registration in slot {
                registration.signal.fire();
            }
        }
        if let Some(parent) = parent_key(key) {
            if let Some(slot) = state.by_key.get(&(ns.to_string(), parent.to_string())) {
                debug!(ns, key = parent, watchers = slot.len(), "parent watch triggered");
                for registration in slot {
                    registration.signal.child_changed.store(true, Ordering::Release);
                    registration.signal.fire();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().by_key.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parent_key(key: &str) -> Option<&str> {
    match key.rfind('/') {
        Some(pos) if pos > 0 => Some(&key[..pos]),
        _ => None,
    }
}
