//! Latest-snapshot store shared between the collector and HTTP handlers.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::sample::Snapshot;

/// Holds the most recently published [`Snapshot`].
///
/// Publishing swaps a pointer; readers load it without taking a lock, so a
/// scrape never waits for a collection cycle and vice versa.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    latest: ArcSwapOption<Snapshot>,
}

/// Thread-safe store handle.
pub type SharedStore = Arc<SnapshotStore>;

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }

    /// Replace the visible snapshot.
    pub fn publish(&self, snapshot: Snapshot) {
        self.latest.store(Some(Arc::new(snapshot)));
    }

    /// The latest snapshot, or `None` before the first publish.
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.latest.load_full()
    }

    pub fn has_snapshot(&self) -> bool {
        self.latest.load().is_some()
    }
}
