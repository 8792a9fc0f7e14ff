//! Controller Statistics

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by reconcile workers
#[derive(Debug, Default)]
pub struct ControllerStats {
    reconciles: AtomicU64,
    failures: AtomicU64,
    removals: AtomicU64,
    malformed: AtomicU64,
    resyncs: AtomicU64,
}

impl ControllerStats {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_reconcile(&self) {
        self.reconciles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reconciles: self.reconciles.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ControllerStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Successful reconciliations
    pub reconciles: u64,
    /// Failed reconciliations (each one retried)
    pub failures: u64,
    /// Backends removed from the registry
    pub removals: u64,
    /// Reconciliations skipped for malformed descriptors
    pub malformed: u64,
    /// Periodic resync passes
    pub resyncs: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reconciles={} failures={} removals={} malformed={} resyncs={}",
            self.reconciles, self.failures, self.removals, self.malformed, self.resyncs
        )
    }
}
