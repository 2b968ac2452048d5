//! Store counters. All fields are atomic so readers never take the store
//! locks.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StoreStats {
    /// Messages accepted into a channel log.
    pub appended: AtomicU64,
    /// Messages rejected because their id did not advance the channel.
    pub stale_dropped: AtomicU64,
    /// Messages evicted by the per-channel capacity.
    pub evicted: AtomicU64,
    /// Annotations applied.
    pub annotations: AtomicU64,
    /// Annotations ignored as repeats.
    pub duplicate_annotations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStatsSnapshot {
    pub appended: u64,
    pub stale_dropped: u64,
    pub evicted: u64,
    pub annotations: u64,
    pub duplicate_annotations: u64,
}

impl StoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            appended: self.appended.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            annotations: self.annotations.load(Ordering::Relaxed),
            duplicate_annotations: self.duplicate_annotations.load(Ordering::Relaxed),
        }
    }
}
