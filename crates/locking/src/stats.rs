use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-lifetime counters of a [`Locking`](crate::Locking) orchestrator.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    calls: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    stale_hits: AtomicU64,
}

impl Stats {
    pub fn call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// Combines the counters with the live gauges into a snapshot.
    pub fn snapshot(&self, gauges: Gauges) -> StatsSnapshot {
        StatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            active_waiters: gauges.active_waiters,
            in_flight: gauges.in_flight,
            refreshes: gauges.refreshes,
            size: gauges.size,
        }
    }
}

/// Values that are computed at snapshot time rather than counted.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Gauges {
    pub active_waiters: usize,
    pub in_flight: usize,
    pub refreshes: usize,
    pub size: u64,
}

/// A read-only view of the statistics of a [`Locking`](crate::Locking) orchestrator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Number of calls, including the ones that failed to derive a key.
    pub calls: u64,
    /// Calls answered from the store, fresh or stale.
    pub hits: u64,
    /// Calls that found no usable entry in the store.
    pub misses: u64,
    /// Misses that were queued behind an outstanding producer invocation.
    pub coalesced: u64,
    /// Hits that served a stale entry and triggered a background refresh check.
    pub stale_hits: u64,
    /// Callers currently waiting for a producer invocation to settle.
    pub active_waiters: usize,
    /// Keys with an outstanding producer invocation that callers wait on.
    pub in_flight: usize,
    /// Background refreshes currently running.
    pub refreshes: usize,
    /// Entries held by the store.
    pub size: u64,
}
