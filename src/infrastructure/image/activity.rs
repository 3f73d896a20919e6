//! Default network activity and background task trackers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::domain::ports::{BackgroundTaskId, BackgroundTaskPort, NetworkActivityPort};

/// Counts active transfers; logs when the indicator turns on or off.
#[derive(Debug, Default)]
pub struct NetworkActivityCounter {
    active: AtomicUsize,
}

impl NetworkActivityCounter {
    /// Creates an idle counter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
        }
    }
}

impl NetworkActivityPort for NetworkActivityCounter {
    fn increment(&self) {
        if self.active.fetch_add(1, Ordering::AcqRel) == 0 {
            debug!("Network activity started");
        }
    }

    fn decrement(&self) {
        let previous = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => debug!("Network activity stopped"),
            Ok(_) => {}
            Err(_) => warn!("Network activity decremented below zero"),
        }
    }

    fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// In-process background task registry.
#[derive(Debug, Default)]
pub struct BackgroundTaskTracker {
    next_id: AtomicU64,
    outstanding: Mutex<HashSet<BackgroundTaskId>>,
}

impl BackgroundTaskTracker {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackgroundTaskPort for BackgroundTaskTracker {
    fn begin(&self, name: &str) -> BackgroundTaskId {
        let id = BackgroundTaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.outstanding.lock().insert(id);
        debug!(task = id.0, name, "Background task started");
        id
    }

    fn end(&self, id: BackgroundTaskId) {
        if self.outstanding.lock().remove(&id) {
            debug!(task = id.0, "Background task ended");
        } else {
            warn!(task = id.0, "Ending unknown background task");
        }
    }

    fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }
}
