//! Type conversions between state store types and capacity slots.
//!
//! Bridges `tilegrid_state::{WorkerInfo, TaskDefinition}` to [`WorkerSlot`]
//! and per-class task cost.

use tilegrid_state::{TaskDefinition, WorkerInfo};

use crate::capacity::{WorkerClass, WorkerSlot};

pub fn class_of(worker: &WorkerInfo) -> WorkerClass {
    if worker.is_cluster_proxy {
        WorkerClass::Cluster
    } else {
        WorkerClass::Local
    }
}

/// Convert a [`WorkerInfo`] and its live load into a [`WorkerSlot`].
///
/// `reported_capacity` is what the worker last said it can run for its
/// class; the stored capacity applies when it said nothing usable.
/// Returns `None` when the load is unknown (NaN) or negative: the worker
/// is treated as unreachable for this pass.
pub fn worker_to_slot(
    worker: &WorkerInfo,
    reported_capacity: Option<f64>,
    load: f64,
) -> Option<WorkerSlot> {
    if !load.is_finite() || load < 0.0 {
        return None;
    }
    let capacity = reported_capacity
        .filter(|c| c.is_finite() && *c >= 0.0)
        .unwrap_or_else(|| worker.work_capacity());
    Some(WorkerSlot::new(
        worker.id.clone(),
        class_of(worker),
        capacity,
        load,
    ))
}

/// Work-unit cost of one run of `task` on a slot of the given class.
pub fn task_cost(task: &TaskDefinition, class: WorkerClass) -> f64 {
    task.work_units(class.is_cluster())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str, proxy: bool) -> WorkerInfo {
        WorkerInfo {
            id: id.to_string(),
            address: "10.0.0.1".to_string(),
            port: 6201,
            local_work_capacity: 8.0,
            cluster_work_capacity: 200.0,
            is_in_scheduler_pool: true,
            is_cluster_proxy: proxy,
            updated_at: 0,
        }
    }

    #[test]
    fn local_worker_uses_local_capacity() {
        let slot = worker_to_slot(&worker("w1", false), None, 2.0).unwrap();
        assert_eq!(slot.class, WorkerClass::Local);
        assert_eq!(slot.capacity, 8.0);
        assert_eq!(slot.load, 2.0);
    }

    #[test]
    fn proxy_uses_cluster_capacity() {
        let slot = worker_to_slot(&worker("proxy", true), None, 0.0).unwrap();
        assert_eq!(slot.class, WorkerClass::Cluster);
        assert_eq!(slot.capacity, 200.0);
    }

    #[test]
    fn reported_capacity_overrides_stored() {
        let slot = worker_to_slot(&worker("w1", false), Some(2.0), 0.0).unwrap();
        assert_eq!(slot.capacity, 2.0);

        let slot = worker_to_slot(&worker("w1", false), Some(-1.0), 0.0).unwrap();
        assert_eq!(slot.capacity, 8.0);
    }

    #[test]
    fn unknown_or_negative_load_is_unusable() {
        assert!(worker_to_slot(&worker("w1", false), None, -1.0).is_none());
        assert!(worker_to_slot(&worker("w1", false), None, f64::NAN).is_none());
    }

    #[test]
    fn cost_follows_class() {
        let task = TaskDefinition {
            id: "t".to_string(),
            name: "t".to_string(),
            script: "/bin/true".to_string(),
            interpreter: None,
            args: Vec::new(),
            expected_exit_code: 0,
            local_work_units: 1.0,
            cluster_work_units: 0.25,
        };
        assert_eq!(task_cost(&task, WorkerClass::Local), 1.0);
        assert_eq!(task_cost(&task, WorkerClass::Cluster), 0.25);
    }
}
