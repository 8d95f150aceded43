//! Work-unit capacity slots.
//!
//! A slot is one worker's capacity for the class it dispatches to, plus the
//! load it carries right now. Fit checks tolerate [`CAPACITY_EPSILON`] so a
//! worker filled exactly to capacity through repeated fractional costs is
//! not rejected for rounding noise.

use serde::{Deserialize, Serialize};

/// Floating-point tolerance for capacity comparisons.
pub const CAPACITY_EPSILON: f64 = 1e-5;

/// Which capacity pool a worker serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerClass {
    /// Runs tasks directly on the worker host.
    Local,
    /// Forwards tasks to an external batch-cluster queue.
    Cluster,
}

impl WorkerClass {
    pub fn is_cluster(self) -> bool {
        matches!(self, WorkerClass::Cluster)
    }
}

/// Capacity and current load of one worker for its class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub worker_id: String,
    pub class: WorkerClass,
    pub capacity: f64,
    pub load: f64,
}

impl WorkerSlot {
    pub fn new(worker_id: impl Into<String>, class: WorkerClass, capacity: f64, load: f64) -> Self {
        Self {
            worker_id: worker_id.into(),
            class,
            capacity,
            load,
        }
    }

    /// Unused capacity, never negative.
    pub fn spare(&self) -> f64 {
        (self.capacity - self.load).max(0.0)
    }

    /// True if one more task of `cost` fits without exceeding capacity.
    pub fn can_fit(&self, cost: f64) -> bool {
        self.capacity - self.load + CAPACITY_EPSILON >= cost
    }

    /// How many tasks of `cost` still fit.
    ///
    /// A zero or negative cost never consumes capacity; the caller's batch
    /// size is then the only bound, reported here as `usize::MAX`.
    pub fn fits(&self, cost: f64) -> usize {
        if cost <= 0.0 {
            return usize::MAX;
        }
        let n = ((self.capacity - self.load + CAPACITY_EPSILON) / cost).floor();
        if n <= 0.0 { 0 } else { n as usize }
    }

    /// Charge `cost` against the slot. Returns false (and changes nothing)
    /// if it does not fit.
    pub fn reserve(&mut self, cost: f64) -> bool {
        if !self.can_fit(cost) {
            return false;
        }
        self.load += cost;
        true
    }

    /// Return `cost` to the slot. Load never drops below zero.
    pub fn release(&mut self, cost: f64) {
        self.load = (self.load - cost).max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_within_epsilon() {
        let mut slot = WorkerSlot::new("w1", WorkerClass::Local, 1.0, 0.0);
        for _ in 0..10 {
            assert!(slot.reserve(0.1));
        }
        // 10 x 0.1 accumulates rounding error but is still "full", not over.
        assert!(!slot.can_fit(0.1));
        assert!(slot.load <= slot.capacity + CAPACITY_EPSILON);
    }

    #[test]
    fn rejects_cost_over_spare() {
        let mut slot = WorkerSlot::new("w1", WorkerClass::Local, 4.0, 3.5);
        assert!(!slot.can_fit(1.0));
        assert!(!slot.reserve(1.0));
        assert_eq!(slot.load, 3.5);
        assert!(slot.reserve(0.5));
        assert_eq!(slot.spare(), 0.0);
    }

    #[test]
    fn fits_counts_whole_tasks() {
        let slot = WorkerSlot::new("w1", WorkerClass::Cluster, 10.0, 2.0);
        assert_eq!(slot.fits(3.0), 2);
        assert_eq!(slot.fits(8.0), 1);
        assert_eq!(slot.fits(9.0), 0);
        assert_eq!(slot.fits(0.0), usize::MAX);
    }

    #[test]
    fn overloaded_slot_fits_nothing() {
        let slot = WorkerSlot::new("w1", WorkerClass::Local, 2.0, 5.0);
        assert_eq!(slot.spare(), 0.0);
        assert_eq!(slot.fits(1.0), 0);
    }

    #[test]
    fn release_floors_at_zero() {
        let mut slot = WorkerSlot::new("w1", WorkerClass::Local, 2.0, 1.0);
        slot.release(3.0);
        assert_eq!(slot.load, 0.0);
    }

    #[test]
    fn class_ordering_puts_local_first() {
        assert!(WorkerClass::Local < WorkerClass::Cluster);
        assert!(WorkerClass::Cluster.is_cluster());
    }
}
