//! Per-device window cache of the most recent readings.
//!
//! Each device owns a bounded FIFO of at most `capacity` readings in arrival
//! order. The whole device map sits behind one reader/writer lock: snapshots
//! share the lock, appends take it exclusively. Critical sections are O(N)
//! with small N, so a coarse lock is sufficient.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use crate::models::Reading;

// ---

/// Result of asking the cache for a device window.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowSnapshot {
    // ---
    /// The window holds exactly `capacity` readings, in arrival order.
    Warm(Vec<Reading>),
    /// Fewer than `capacity` readings have been seen for this device.
    Cold,
}

/// Shared per-device windows, one bounded FIFO per device id.
pub struct WindowCache {
    capacity: usize,
    windows: RwLock<HashMap<i64, VecDeque<Reading>>>,
}

impl std::fmt::Debug for WindowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowCache")
            .field("capacity", &self.capacity)
            .field("devices", &self.device_count())
            .finish()
    }
}

impl WindowCache {
    // ---
    /// Create an empty cache whose windows hold `capacity` readings.
    ///
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a reading to its device window, evicting the oldest entry when full.
    pub fn append(&self, reading: Reading) {
        self.push(reading, false);
    }

    /// Append unless the device window already holds a reading with the same
    /// timestamp. Returns `false` when the reading was skipped.
    ///
    /// Used for redelivered messages, whose reading may already be cached.
    pub fn append_once(&self, reading: Reading) -> bool {
        self.push(reading, true)
    }

    fn push(&self, reading: Reading, skip_seen: bool) -> bool {
        // ---
        // A panic while holding the lock cannot leave a window over capacity,
        // so a poisoned lock is still safe to use.
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        let window = windows
            .entry(reading.device_id)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        if skip_seen && window.iter().any(|r| r.timestamp == reading.timestamp) {
            return false;
        }
        if window.len() >= self.capacity {
            window.pop_front();
        }
        window.push_back(reading);
        true
    }

    /// Return the device window if it is warm.
    pub fn snapshot(&self, device_id: i64) -> WindowSnapshot {
        // ---
        let windows = self.windows.read().unwrap_or_else(PoisonError::into_inner);
        match windows.get(&device_id) {
            Some(window) if window.len() >= self.capacity => {
                WindowSnapshot::Warm(window.iter().cloned().collect())
            }
            _ => WindowSnapshot::Cold,
        }
    }

    /// Number of readings currently held for a device.
    pub fn len(&self, device_id: i64) -> usize {
        self.windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device_id)
            .map_or(0, VecDeque::len)
    }

    pub fn device_count(&self) -> usize {
        self.windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
