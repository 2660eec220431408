//! Removal Notifications
//!
//! Listeners are told exactly once about every element the store removes on
//! its own initiative: capacity evictions and expiries. Explicit `remove`
//! and `remove_all` calls are not reported.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::element::Element;

/// Why the store dropped an element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// Capacity-driven removal of an unexpired element
    Evicted,
    /// TTL/TTI elapsed
    Expired,
}

impl RemovalCause {
    /// Pick the cause for an element removed at `now`
    pub fn for_element<K>(element: &Element<K>, now: u64) -> Self {
        if element.is_expired_at(now) {
            RemovalCause::Expired
        } else {
            RemovalCause::Evicted
        }
    }

    /// The boolean form: true when the removal was an expiry
    pub fn is_expiry(&self) -> bool {
        matches!(self, RemovalCause::Expired)
    }
}

impl std::fmt::Display for RemovalCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalCause::Evicted => write!(f, "evicted"),
            RemovalCause::Expired => write!(f, "expired"),
        }
    }
}

/// Receiver of removal notifications
///
/// Called on whichever thread performed the removal (a caller thread or a
/// background worker) and never while a segment lock is held.
pub trait StoreEventListener<K>: Send + Sync {
    /// An element left the store
    fn on_removal(&self, element: &Arc<Element<K>>, cause: RemovalCause);
}

/// Listener that records every notification, for tests and diagnostics
pub struct RecordingListener<K> {
    events: Mutex<Vec<(K, RemovalCause)>>,
}

impl<K> Default for RecordingListener<K> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }
}

impl<K: Clone> RecordingListener<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events in arrival order
    pub fn events(&self) -> Vec<(K, RemovalCause)> {
        self.events.lock().clone()
    }

    /// Number of events recorded for `key` with `cause`
    pub fn count(&self, key: &K, cause: RemovalCause) -> usize
    where
        K: PartialEq,
    {
        self.events
            .lock()
            .iter()
            .filter(|(k, c)| k == key && *c == cause)
            .count()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl<K: Clone + Send + Sync> StoreEventListener<K> for RecordingListener<K> {
    fn on_removal(&self, element: &Arc<Element<K>>, cause: RemovalCause) {
        self.events.lock().push((element.key().clone(), cause));
    }
}
