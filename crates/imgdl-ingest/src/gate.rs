//! Admission control
//!
//! The gate bounds how many jobs are between dispatch and resolution. A
//! permit is taken before a job is handed out and travels with the job and
//! then its outcome; dropping it is the release.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
struct GateCounters {
    acquired: AtomicU64,
    released: AtomicU64,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Counting gate with acquire/release accounting
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    counters: Arc<GateCounters>,
    capacity: usize,
}

/// Point-in-time view of a gate's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub capacity: usize,
    pub acquired: u64,
    pub released: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

impl GateStats {
    /// Every acquired unit has been released
    pub fn is_balanced(&self) -> bool {
        self.acquired == self.released && self.in_flight == 0
    }
}

impl AdmissionGate {
    /// A gate admitting at most `capacity` jobs; zero is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            counters: Arc::new(GateCounters::default()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a free unit.
    ///
    /// Returns `None` only if the gate was closed.
    pub async fn acquire(&self) -> Option<AdmissionPermit> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        Some(self.admit(permit))
    }

    /// Take a unit without waiting
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(self.admit(permit))
    }

    /// Wake every pending and future `acquire` with `None`
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            capacity: self.capacity,
            acquired: self.counters.acquired.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.counters.peak.load(Ordering::SeqCst),
        }
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> AdmissionPermit {
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);
        AdmissionPermit {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        }
    }
}

/// One admitted unit; released exactly once, on drop
#[derive(Debug)]
#[must_use = "dropping the permit releases the admission unit"]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<GateCounters>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}
