//! Runtime worker pool.
//!
//! Holds what the store does not: each worker's last reported load, the
//! work charged to it since that report, and whether it is reachable. One
//! pool is shared by every stage scheduler so a worker's capacity is
//! accounted once across all of them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use tilegrid_placement::{WorkerSlot, worker_to_slot};
use tilegrid_state::{WorkerId, WorkerInfo};

use crate::client::WorkerClient;

/// Runtime record for one worker.
#[derive(Debug, Clone)]
struct WorkerRuntime {
    info: WorkerInfo,
    /// Load from the most recent successful query or heartbeat.
    reported_load: Option<f64>,
    /// Capacity from the most recent query, when the worker sent one.
    reported_capacity: Option<f64>,
    /// Work charged by dispatch since that report.
    reserved: f64,
    available: bool,
    last_seen: Option<Instant>,
    /// Earliest time an unavailable worker is probed again.
    retry_at: Option<Instant>,
}

impl WorkerRuntime {
    fn new(info: WorkerInfo) -> Self {
        Self {
            info,
            reported_load: None,
            reported_capacity: None,
            reserved: 0.0,
            available: true,
            last_seen: None,
            retry_at: None,
        }
    }

    fn tracked_load(&self) -> Option<f64> {
        self.reported_load.map(|l| l + self.reserved)
    }

    fn slot(&self) -> Option<WorkerSlot> {
        worker_to_slot(&self.info, self.reported_capacity, self.tracked_load()?)
    }

    fn capacity(&self) -> f64 {
        self.reported_capacity
            .filter(|c| c.is_finite() && *c >= 0.0)
            .unwrap_or_else(|| self.info.work_capacity())
    }

    fn record_report(&mut self, load: f64) {
        self.reported_load = Some(load);
        self.reserved = 0.0;
        self.available = true;
        self.last_seen = Some(Instant::now());
        self.retry_at = None;
    }
}

/// Point-in-time view of one worker, for admin surfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub endpoint: String,
    pub is_cluster_proxy: bool,
    pub capacity: f64,
    pub tracked_load: Option<f64>,
    pub available: bool,
    pub seconds_since_seen: Option<u64>,
}

/// Shared runtime state of all known workers.
pub struct WorkerPool {
    workers: RwLock<HashMap<WorkerId, WorkerRuntime>>,
    retry: Duration,
}

impl WorkerPool {
    /// `retry` is how long an unreachable worker sits out before it is
    /// probed again.
    pub fn new(retry: Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            retry,
        }
    }

    /// Add or refresh a worker record, keeping its runtime state.
    pub async fn upsert(&self, info: WorkerInfo) {
        let mut workers = self.workers.write().await;
        match workers.get_mut(&info.id) {
            Some(rt) => rt.info = info,
            None => {
                debug!(worker = %info.id, endpoint = %info.endpoint(), "worker registered");
                workers.insert(info.id.clone(), WorkerRuntime::new(info));
            }
        }
    }

    /// Make the pool match `infos`: refresh known workers, add new ones,
    /// drop the rest.
    pub async fn sync(&self, infos: Vec<WorkerInfo>) {
        let mut workers = self.workers.write().await;
        let keep: Vec<WorkerId> = infos.iter().map(|w| w.id.clone()).collect();
        workers.retain(|id, _| keep.contains(id));
        for info in infos {
            match workers.get_mut(&info.id) {
                Some(rt) => rt.info = info,
                None => {
                    workers.insert(info.id.clone(), WorkerRuntime::new(info));
                }
            }
        }
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.workers.write().await.remove(id).is_some()
    }

    /// Workers eligible for dispatch right now: in the scheduler pool and
    /// either available or past their retry backoff.
    pub async fn candidates(&self) -> Vec<WorkerInfo> {
        let now = Instant::now();
        let workers = self.workers.read().await;
        workers
            .values()
            .filter(|rt| rt.info.is_in_scheduler_pool)
            .filter(|rt| rt.available || rt.retry_at.is_none_or(|at| now >= at))
            .map(|rt| rt.info.clone())
            .collect()
    }

    /// Query a worker's live load and capacity and record the outcome.
    ///
    /// Returns the worker's slot at its tracked load, or `None` when the
    /// worker is unreachable or reports an unknown (negative) load; an
    /// unreachable worker is marked unavailable until the retry backoff
    /// passes or it heartbeats.
    pub async fn probe(&self, client: &dyn WorkerClient, info: &WorkerInfo) -> Option<WorkerSlot> {
        match client.query_worker(info).await {
            Ok(status) if status.task_load.is_finite() && status.task_load >= 0.0 => {
                let mut workers = self.workers.write().await;
                let rt = workers.get_mut(&info.id)?;
                if !rt.available {
                    info!(worker = %info.id, "worker reachable again");
                }
                rt.record_report(status.task_load);
                rt.reported_capacity = status.capacity_for(rt.info.is_cluster_proxy);
                rt.slot()
            }
            Ok(status) => {
                debug!(worker = %info.id, load = status.task_load, "worker reported unknown load");
                None
            }
            Err(e) => {
                warn!(worker = %info.id, error = %e, "worker unreachable");
                self.mark_unavailable(&info.id).await;
                None
            }
        }
    }

    pub async fn mark_unavailable(&self, id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(rt) = workers.get_mut(id) {
            rt.available = false;
            rt.retry_at = Some(Instant::now() + self.retry);
        }
    }

    /// Record a worker-initiated heartbeat. Returns false for unknown ids.
    pub async fn heartbeat(&self, id: &str, load: Option<f64>) -> bool {
        let mut workers = self.workers.write().await;
        let Some(rt) = workers.get_mut(id) else {
            return false;
        };
        match load {
            Some(l) if l.is_finite() && l >= 0.0 => rt.record_report(l),
            _ => {
                rt.available = true;
                rt.last_seen = Some(Instant::now());
                rt.retry_at = None;
            }
        }
        debug!(worker = %id, ?load, "worker heartbeat");
        true
    }

    /// Charge dispatched work to a worker until its next report, if it
    /// fits within the worker's capacity. Checked and charged under one
    /// lock so concurrent dispatchers cannot overshoot together.
    pub async fn try_reserve(&self, id: &str, cost: f64) -> bool {
        let mut workers = self.workers.write().await;
        let Some(rt) = workers.get_mut(id) else {
            return false;
        };
        match rt.slot() {
            Some(slot) if slot.can_fit(cost) => {
                rt.reserved += cost;
                true
            }
            _ => false,
        }
    }

    /// Return work charged by [`try_reserve`](Self::try_reserve) once it
    /// completes or fails to start.
    pub async fn release(&self, id: &str, cost: f64) {
        if let Some(rt) = self.workers.write().await.get_mut(id) {
            rt.reserved = (rt.reserved - cost).max(0.0);
        }
    }

    pub async fn tracked_load(&self, id: &str) -> Option<f64> {
        self.workers.read().await.get(id).and_then(|rt| rt.tracked_load())
    }

    pub async fn is_available(&self, id: &str) -> bool {
        self.workers
            .read()
            .await
            .get(id)
            .is_some_and(|rt| rt.available)
    }

    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let workers = self.workers.read().await;
        let mut out: Vec<WorkerSnapshot> = workers
            .values()
            .map(|rt| WorkerSnapshot {
                id: rt.info.id.clone(),
                endpoint: rt.info.endpoint(),
                is_cluster_proxy: rt.info.is_cluster_proxy,
                capacity: rt.capacity(),
                tracked_load: rt.tracked_load(),
                available: rt.available,
                seconds_since_seen: rt.last_seen.map(|t| t.elapsed().as_secs()),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{
        ExecutionPayload, StartedExecution, WorkerError, WorkerFuture, WorkerStatus,
    };

    struct FixedLoad(Option<f64>);

    impl WorkerClient for FixedLoad {
        fn query_worker<'a>(&'a self, worker: &'a WorkerInfo) -> WorkerFuture<'a, WorkerStatus> {
            let load = self.0;
            let endpoint = worker.endpoint();
            Box::pin(async move {
                match load {
                    Some(task_load) => Ok(WorkerStatus {
                        task_load,
                        local_work_capacity: None,
                        cluster_work_capacity: None,
                    }),
                    None => Err(WorkerError::Connect {
                        endpoint,
                        reason: "refused".to_string(),
                    }),
                }
            })
        }

        fn start_task_execution<'a>(
            &'a self,
            _worker: &'a WorkerInfo,
            _payload: &'a ExecutionPayload,
        ) -> WorkerFuture<'a, StartedExecution> {
            Box::pin(async { Ok(StartedExecution::default()) })
        }
    }

    fn info(id: &str, in_pool: bool) -> WorkerInfo {
        WorkerInfo {
            id: id.to_string(),
            address: "127.0.0.1".to_string(),
            port: 6201,
            local_work_capacity: 4.0,
            cluster_work_capacity: 0.0,
            is_in_scheduler_pool: in_pool,
            is_cluster_proxy: false,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn candidates_exclude_out_of_pool() {
        let pool = WorkerPool::new(Duration::from_secs(30));
        pool.upsert(info("w1", true)).await;
        pool.upsert(info("w2", false)).await;
        let ids: Vec<String> = pool.candidates().await.into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec!["w1"]);
    }

    #[tokio::test]
    async fn probe_records_load_and_reserve_adds_to_it() {
        let pool = WorkerPool::new(Duration::from_secs(30));
        let w = info("w1", true);
        pool.upsert(w.clone()).await;

        let slot = pool.probe(&FixedLoad(Some(1.0)), &w).await.unwrap();
        assert_eq!(slot.load, 1.0);
        assert_eq!(slot.capacity, 4.0);
        assert!(pool.try_reserve("w1", 2.0).await);
        assert_eq!(pool.tracked_load("w1").await, Some(3.0));
        pool.release("w1", 0.5).await;
        assert_eq!(pool.tracked_load("w1").await, Some(2.5));

        // A fresh report supersedes reservations.
        pool.probe(&FixedLoad(Some(2.0)), &w).await;
        assert_eq!(pool.tracked_load("w1").await, Some(2.0));
    }

    #[tokio::test]
    async fn try_reserve_respects_capacity() {
        let pool = WorkerPool::new(Duration::from_secs(30));
        let w = info("w1", true);
        pool.upsert(w.clone()).await;

        // No report yet: load unknown, nothing may be charged.
        assert!(!pool.try_reserve("w1", 1.0).await);

        pool.probe(&FixedLoad(Some(0.0)), &w).await;
        for _ in 0..4 {
            assert!(pool.try_reserve("w1", 1.0).await);
        }
        assert!(!pool.try_reserve("w1", 1.0).await);
        assert_eq!(pool.tracked_load("w1").await, Some(4.0));
    }

    #[tokio::test]
    async fn unreachable_worker_sits_out_until_retry() {
        let pool = WorkerPool::new(Duration::from_secs(3600));
        let w = info("w1", true);
        pool.upsert(w.clone()).await;

        assert!(pool.probe(&FixedLoad(None), &w).await.is_none());
        assert!(!pool.is_available("w1").await);
        assert!(pool.candidates().await.is_empty());

        assert!(pool.heartbeat("w1", Some(0.0)).await);
        assert!(pool.is_available("w1").await);
        assert_eq!(pool.candidates().await.len(), 1);
    }

    #[tokio::test]
    async fn zero_retry_makes_worker_eligible_again() {
        let pool = WorkerPool::new(Duration::ZERO);
        let w = info("w1", true);
        pool.upsert(w.clone()).await;
        pool.probe(&FixedLoad(None), &w).await;
        assert_eq!(pool.candidates().await.len(), 1);
    }

    #[tokio::test]
    async fn negative_load_is_unknown() {
        let pool = WorkerPool::new(Duration::from_secs(30));
        let w = info("w1", true);
        pool.upsert(w.clone()).await;
        assert!(pool.probe(&FixedLoad(Some(-1.0)), &w).await.is_none());
    }

    struct SmallerThanStored;

    impl WorkerClient for SmallerThanStored {
        fn query_worker<'a>(&'a self, _worker: &'a WorkerInfo) -> WorkerFuture<'a, WorkerStatus> {
            Box::pin(async {
                Ok(WorkerStatus {
                    task_load: 0.0,
                    local_work_capacity: Some(2.0),
                    cluster_work_capacity: Some(50.0),
                })
            })
        }

        fn start_task_execution<'a>(
            &'a self,
            _worker: &'a WorkerInfo,
            _payload: &'a ExecutionPayload,
        ) -> WorkerFuture<'a, StartedExecution> {
            Box::pin(async { Ok(StartedExecution::default()) })
        }
    }

    #[tokio::test]
    async fn reported_capacity_bounds_reservations() {
        let pool = WorkerPool::new(Duration::from_secs(30));
        let w = info("w1", true);
        pool.upsert(w.clone()).await;

        let slot = pool.probe(&SmallerThanStored, &w).await.unwrap();
        assert_eq!(slot.capacity, 2.0);
        assert!(pool.try_reserve("w1", 1.0).await);
        assert!(pool.try_reserve("w1", 1.0).await);
        assert!(!pool.try_reserve("w1", 1.0).await);

        // A heartbeat refreshes load but keeps the reported capacity.
        assert!(pool.heartbeat("w1", Some(0.0)).await);
        assert!(pool.try_reserve("w1", 2.0).await);
        assert!(!pool.try_reserve("w1", 0.5).await);
        assert_eq!(pool.snapshot().await[0].capacity, 2.0);
    }

    #[tokio::test]
    async fn sync_drops_removed_workers() {
        let pool = WorkerPool::new(Duration::from_secs(30));
        pool.upsert(info("w1", true)).await;
        pool.upsert(info("w2", true)).await;
        pool.sync(vec![info("w2", true), info("w3", true)]).await;

        let ids: Vec<String> = pool.snapshot().await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["w2", "w3"]);
        assert!(!pool.heartbeat("w1", None).await);
    }
}
