use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for one manager. Relaxed ordering: values are for observation only.
#[derive(Debug, Default)]
pub struct ManagerStats {
    pub(crate) enqueued: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) delivered_local: AtomicU64,
    pub(crate) forwarded: AtomicU64,
    pub(crate) persisted: AtomicU64,
    pub(crate) failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub dispatched: u64,
    pub delivered_local: u64,
    pub forwarded: u64,
    pub persisted: u64,
    pub failures: u64,
}

impl ManagerStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delivered_local: self.delivered_local.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
