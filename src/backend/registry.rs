//! Callback registry keyed by event name.
//!
//! Each key maps to an ordered list of callbacks. Registration order is
//! dispatch order, and the same callback (same `Arc`) is never listed twice
//! under one key.
//!
//! ```text
//! callbacks: {
//!     "VOICE_SETTINGS_UPDATE": [ (1, cb_a), (3, cb_b) ],
//!     "VOICE_CHANNEL_SELECT":  [ (2, cb_a) ],
//! }
//! ```
//!
//! Entries survive reconnects; the backend re-subscribes every key after
//! each successful `AUTHENTICATE`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// Callback invoked with an event's `data`.
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one registration; pass it back to unregister.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallbackHandle {
    key: String,
    id: u64,
}

impl CallbackHandle {
    /// Event key this handle is registered under.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Event key to ordered, deduplicated callbacks.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, Vec<(u64, EventCallback)>>,
    next_id: u64,
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .callbacks
            .iter()
            .map(|(k, v)| (k.as_str(), v.len()))
            .collect();
        f.debug_struct("CallbackRegistry").field("callbacks", &counts).finish()
    }
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `key`.
    ///
    /// Returns the handle and whether `key` had no callbacks before. If the
    /// callback is already registered for `key`, its existing handle is
    /// returned and nothing changes.
    pub fn register(&mut self, key: &str, callback: EventCallback) -> (CallbackHandle, bool) {
        let entries = self.callbacks.entry(key.to_string()).or_default();

        if let Some((id, _)) = entries.iter().find(|(_, cb)| Arc::ptr_eq(cb, &callback)) {
            let handle = CallbackHandle {
                key: key.to_string(),
                id: *id,
            };
            return (handle, false);
        }

        let newly_keyed = entries.is_empty();
        self.next_id += 1;
        entries.push((self.next_id, callback));

        let handle = CallbackHandle {
            key: key.to_string(),
            id: self.next_id,
        };
        (handle, newly_keyed)
    }

    /// Remove a registration.
    ///
    /// Returns false if `handle` was not registered. A key whose last
    /// callback is removed disappears from [`CallbackRegistry::keys`].
    pub fn unregister(&mut self, handle: &CallbackHandle) -> bool {
        let Some(entries) = self.callbacks.get_mut(&handle.key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != handle.id);
        let removed = entries.len() != before;

        if entries.is_empty() {
            self.callbacks.remove(&handle.key);
        }
        removed
    }

    /// Snapshot of the callbacks for `key`, in registration order.
    ///
    /// Returned by value so callers can invoke them without holding a lock.
    pub fn callbacks(&self, key: &str) -> Vec<EventCallback> {
        self.callbacks
            .get(key)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    /// Keys with at least one callback, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.callbacks.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether `key` has any callbacks.
    pub fn contains(&self, key: &str) -> bool {
        self.callbacks.contains_key(key)
    }

    /// Total number of registrations.
    pub fn len(&self) -> usize {
        self.callbacks.values().map(Vec::len).sum()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}
