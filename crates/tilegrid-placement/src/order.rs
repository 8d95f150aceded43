//! Candidate ordering and per-worker fill quotas.
//!
//! Dispatch is greedy: each worker is filled before the next is tried, so
//! the order here decides where work lands. Local workers come first and
//! cluster proxies absorb only what local capacity cannot.

use tracing::trace;

use tilegrid_state::WorkerInfo;

use crate::capacity::WorkerSlot;
use crate::convert::class_of;

/// In-pool workers in dispatch order: local before cluster, then by id.
pub fn order_candidates(workers: &[WorkerInfo]) -> Vec<&WorkerInfo> {
    let mut candidates: Vec<&WorkerInfo> = workers
        .iter()
        .filter(|w| w.is_in_scheduler_pool)
        .collect();
    candidates.sort_by(|a, b| class_of(a).cmp(&class_of(b)).then_with(|| a.id.cmp(&b.id)));
    trace!(
        candidates = candidates.len(),
        total = workers.len(),
        "ordered dispatch candidates"
    );
    candidates
}

/// Number of queue entries to pull for one worker in one batch.
pub fn fill_quota(slot: &WorkerSlot, cost: f64, batch_limit: usize) -> usize {
    slot.fits(cost).min(batch_limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::WorkerClass;

    fn worker(id: &str, proxy: bool, in_pool: bool) -> WorkerInfo {
        WorkerInfo {
            id: id.to_string(),
            address: "127.0.0.1".to_string(),
            port: 6201,
            local_work_capacity: 4.0,
            cluster_work_capacity: 100.0,
            is_in_scheduler_pool: in_pool,
            is_cluster_proxy: proxy,
            updated_at: 0,
        }
    }

    #[test]
    fn local_workers_precede_cluster_proxies() {
        let workers = vec![
            worker("proxy-a", true, true),
            worker("w2", false, true),
            worker("w1", false, true),
        ];
        let ids: Vec<&str> = order_candidates(&workers)
            .iter()
            .map(|w| w.id.as_str())
            .collect();
        assert_eq!(ids, vec!["w1", "w2", "proxy-a"]);
    }

    #[test]
    fn workers_outside_pool_are_excluded() {
        let workers = vec![worker("w1", false, false), worker("w2", false, true)];
        let ordered = order_candidates(&workers);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].id, "w2");
    }

    #[test]
    fn quota_bounded_by_capacity_and_batch() {
        let slot = WorkerSlot::new("w1", WorkerClass::Local, 10.0, 0.0);
        assert_eq!(fill_quota(&slot, 1.0, 50), 10);
        assert_eq!(fill_quota(&slot, 1.0, 4), 4);
        assert_eq!(fill_quota(&slot, 0.0, 7), 7);
    }
}
