//! Engine-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub tasks_executed: u64,
    pub tasks_failed: u64,
    pub events_replayed: u64,
    pub events_applied: u64,
    pub commands_emitted: u64,
    pub nondeterminism_faults: u64,
    pub duplicate_events_dropped: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Metrics {
    tasks_executed: AtomicU64,
    tasks_failed: AtomicU64,
    events_replayed: AtomicU64,
    events_applied: AtomicU64,
    commands_emitted: AtomicU64,
    nondeterminism_faults: AtomicU64,
    duplicate_events_dropped: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl Metrics {
    pub(crate) fn record_task(&self, replayed: usize, applied: usize, commands: usize) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        self.events_replayed.fetch_add(replayed as u64, Ordering::Relaxed);
        self.events_applied.fetch_add(applied as u64, Ordering::Relaxed);
        self.commands_emitted.fetch_add(commands as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, nondeterminism: bool) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        if nondeterminism {
            self.nondeterminism_faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_duplicates(&self, dropped: usize) {
        self.duplicate_events_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_cache(&self, hit: bool) {
        let counter = if hit { &self.cache_hits } else { &self.cache_misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            events_replayed: self.events_replayed.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            commands_emitted: self.commands_emitted.load(Ordering::Relaxed),
            nondeterminism_faults: self.nondeterminism_faults.load(Ordering::Relaxed),
            duplicate_events_dropped: self.duplicate_events_dropped.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}
