use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::traits::{Event, Listener, ListenerId};

struct Entry {
    id: ListenerId,
    once: bool,
    listener: Listener,
}

/// Multi-listener event registry.
///
/// Link implementations embed one of these to back `on`/`once`/`off`.
/// [`EventEmitter::dispatch`] snapshots the listeners before invoking them,
/// so listeners may register or remove listeners (including themselves)
/// while being called.
pub struct EventEmitter {
    listeners: Mutex<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a persistent listener.
    pub fn on(&self, event: &str, listener: Listener) -> ListenerId {
        self.insert(event, listener, false)
    }

    /// Register a listener removed after its first invocation.
    pub fn once(&self, event: &str, listener: Listener) -> ListenerId {
        self.insert(event, listener, true)
    }

    /// Remove one listener. Unknown ids are ignored.
    pub fn off(&self, event: &str, id: ListenerId) {
        let mut listeners = self.lock();
        if let Some(entries) = listeners.get_mut(event) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                listeners.remove(event);
            }
        }
    }

    /// Remove every listener of `event`.
    pub fn off_all(&self, event: &str) {
        self.lock().remove(event);
    }

    /// Remove every listener of every event.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.lock().get(event).map_or(0, Vec::len)
    }

    /// Deliver `event` to its listeners in registration order.
    ///
    /// Returns the number of listeners invoked.
    pub fn dispatch(&self, name: &str, event: Event) -> usize {
        let snapshot: Vec<Listener> = {
            let mut listeners = self.lock();
            let Some(entries) = listeners.get_mut(name) else {
                return 0;
            };
            let snapshot = entries
                .iter()
                .map(|entry| entry.listener.clone())
                .collect();
            entries.retain(|entry| !entry.once);
            if entries.is_empty() {
                listeners.remove(name);
            }
            snapshot
        };

        trace!(event = name, listeners = snapshot.len(), "dispatching event");
        let count = snapshot.len();
        for listener in snapshot {
            listener(event.clone());
        }
        count
    }

    fn insert(&self, event: &str, listener: Listener, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(event.to_string())
            .or_default()
            .push(Entry { id, once, listener });
        id
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Entry>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
