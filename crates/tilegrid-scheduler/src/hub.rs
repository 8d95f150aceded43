//! Scheduler hub — keeps one scheduler running per active project and stage.
//!
//! Each tick:
//! 1. stops schedulers whose project is not processing, whose project or
//!    stage no longer exists, or whose task has ended
//! 2. starts any missing scheduler for processing projects and their stages
//! 3. copies each stage's `is_processing` into its scheduler
//! 4. drops cached connectors of projects and stages that were deleted

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info};

use tilegrid_state::StateStore;

use crate::connectors::ConnectorCache;
use crate::error::SchedulerResult;
use crate::handle::{SchedulerHandle, SchedulerSpawner};
use crate::scheduler::ScheduleTarget;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubReport {
    pub started: usize,
    pub stopped: usize,
    /// Schedulers whose processing flag changed.
    pub toggled: usize,
    /// Cached connectors dropped for deleted owners.
    pub evicted: usize,
}

pub struct SchedulerHub {
    store: StateStore,
    connectors: Arc<ConnectorCache>,
    spawner: Arc<dyn SchedulerSpawner>,
    registry: Arc<RwLock<HashMap<ScheduleTarget, SchedulerHandle>>>,
}

impl SchedulerHub {
    pub fn new(
        store: StateStore,
        connectors: Arc<ConnectorCache>,
        spawner: Arc<dyn SchedulerSpawner>,
    ) -> Self {
        Self {
            store,
            connectors,
            spawner,
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn tick(&self) -> SchedulerResult<HubReport> {
        let projects = self.store.list_projects()?;
        let mut report = HubReport::default();

        // Targets that should be running, projects before their stages and
        // stages in depth order.
        let mut wanted: Vec<(ScheduleTarget, bool)> = Vec::new();
        for project in projects.iter().filter(|p| p.is_processing) {
            wanted.push((ScheduleTarget::Project(project.id.clone()), false));
            for stage in self.store.list_stages_for_project(&project.id)? {
                wanted.push((ScheduleTarget::Stage(stage.id), stage.is_processing));
            }
        }
        let wanted_set: HashSet<&ScheduleTarget> = wanted.iter().map(|(t, _)| t).collect();
        let owners: HashSet<String> = projects
            .iter()
            .map(|p| p.id.clone())
            .chain(self.store.list_stages()?.into_iter().map(|s| s.id))
            .collect();

        let mut registry = self.registry.write().await;

        let stale: Vec<ScheduleTarget> = registry
            .iter()
            .filter(|(target, handle)| !wanted_set.contains(target) || handle.is_finished())
            .map(|(target, _)| target.clone())
            .collect();
        for target in stale {
            if let Some(handle) = registry.remove(&target) {
                handle.cancel();
                info!(scheduler = %target, "scheduler stopped");
                report.stopped += 1;
            }
        }

        for (target, processing) in wanted {
            match registry.get(&target) {
                Some(handle) => {
                    if handle.is_processing() != processing {
                        handle.set_processing(processing);
                        info!(scheduler = %target, processing, "scheduler processing changed");
                        report.toggled += 1;
                    }
                }
                None => {
                    let handle = self.spawner.start(target.clone(), processing);
                    info!(scheduler = %target, processing, "scheduler started");
                    registry.insert(target, handle);
                    report.started += 1;
                }
            }
        }
        drop(registry);

        for owner in self.connectors.owners().await {
            if !owners.contains(&owner) && self.connectors.evict(&owner).await {
                debug!(owner = %owner, "connector evicted");
                report.evicted += 1;
            }
        }

        Ok(report)
    }

    /// Tick every `interval` until `shutdown` changes, then stop every
    /// scheduler.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(?interval, "scheduler hub started");
        loop {
            match self.tick().await {
                Ok(report) if report != HubReport::default() => {
                    debug!(
                        started = report.started,
                        stopped = report.stopped,
                        toggled = report.toggled,
                        evicted = report.evicted,
                        "hub tick"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "hub tick failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("scheduler hub shutting down");
                    break;
                }
            }
        }
        self.stop_all().await;
    }

    /// Stop every scheduler and wait for them to finish.
    pub async fn stop_all(&self) -> usize {
        let handles: Vec<SchedulerHandle> = self.registry.write().await.drain().map(|(_, h)| h).collect();
        let count = handles.len();
        for handle in &handles {
            handle.cancel();
        }
        for handle in handles {
            handle.stop().await;
        }
        count
    }

    /// Running targets with their processing flag, in a stable order.
    pub async fn active(&self) -> Vec<(ScheduleTarget, bool)> {
        let registry = self.registry.read().await;
        let mut active: Vec<(ScheduleTarget, bool)> = registry
            .iter()
            .map(|(target, handle)| (target.clone(), handle.is_processing()))
            .collect();
        active.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        active
    }
}
