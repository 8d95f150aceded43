//! Capacity-aware dispatch of queued tiles to workers.
//!
//! Workers are probed once per tick for their live load, then filled in
//! order (local before cluster, then by id) until each is full or the
//! queue is empty. Every start is charged to the shared [`WorkerPool`]
//! under its lock, so concurrent stage dispatchers never oversubscribe a
//! worker between its load reports.

use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tilegrid_placement::{WorkerSlot, fill_quota, order_candidates, task_cost};
use tilegrid_state::{
    CompletionResult, ExecutionStart, ExecutionStatus, InProcessEntry, PipelineStage, Project,
    StageConnector, StateStore, TaskDefinition, TaskExecution, Tile, TileStatus, WorkerInfo,
    epoch_secs,
};
use tilegrid_worker::{ExecutionPayload, StartedExecution, WorkerClient, WorkerPool};

use crate::error::{SchedulerError, SchedulerResult};
use crate::params::{ParamContext, resolve_args};
use crate::status::upstream_ready;
use crate::strategy::StageStrategy;

/// Everything about a stage that stays fixed for one tick.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub project: Project,
    pub stage: PipelineStage,
    pub task: TaskDefinition,
}

impl StageContext {
    pub fn load(store: &StateStore, stage_id: &str) -> SchedulerResult<Self> {
        let stage = store
            .get_stage(stage_id)?
            .ok_or_else(|| SchedulerError::StageNotFound(stage_id.to_string()))?;
        let project = store
            .get_project(&stage.project_id)?
            .ok_or_else(|| SchedulerError::ProjectNotFound(stage.project_id.clone()))?;
        let task = store
            .get_task(&stage.task_id)?
            .ok_or_else(|| SchedulerError::TaskNotFound(stage.task_id.clone()))?;
        Ok(Self {
            project,
            stage,
            task,
        })
    }

    /// Root of the data this stage reads: the previous stage's output, or
    /// the project root for depth-1 stages.
    pub fn input_root(&self, store: &StateStore) -> SchedulerResult<String> {
        match &self.stage.previous_stage_id {
            None => Ok(self.project.root_path.clone()),
            Some(prev) => Ok(store
                .get_stage(prev)?
                .map(|s| s.dst_path)
                .unwrap_or_else(|| self.project.root_path.clone())),
        }
    }

    pub fn strategy(&self) -> StageStrategy {
        StageStrategy::for_function(self.stage.function_type)
    }
}

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    /// Executions a worker accepted.
    pub started: usize,
    /// Queue entries removed because their tile could not run.
    pub dropped: usize,
    /// Workers passed over (unknown load or no room for one task).
    pub workers_skipped: usize,
    /// Workers abandoned for this tick after a failed start.
    pub workers_failed: usize,
    /// Work units charged across all workers.
    pub units: f64,
}

/// Where a task execution writes its log.
pub fn log_file_path(stage: &PipelineStage, tile: &Tile, execution_id: &str) -> String {
    Path::new(&stage.dst_path)
        .join(".log")
        .join(format!("{}-{execution_id}.log", tile.tile_name))
        .to_string_lossy()
        .into_owned()
}

/// Dispatches one stage's queue.
pub struct Dispatcher<'a> {
    pub connector: &'a dyn StageConnector,
    pub pool: &'a WorkerPool,
    pub client: &'a dyn WorkerClient,
    pub batch_size: usize,
}

impl Dispatcher<'_> {
    pub async fn dispatch(
        &self,
        ctx: &StageContext,
        input_root: &str,
    ) -> SchedulerResult<DispatchReport> {
        let mut report = DispatchReport::default();
        if self.connector.count_to_process()? == 0 {
            return Ok(report);
        }

        let candidates = self.pool.candidates().await;
        let mut slots: Vec<(&WorkerInfo, WorkerSlot)> = Vec::new();
        for worker in order_candidates(&candidates) {
            match self.pool.probe(self.client, worker).await {
                Some(slot) => slots.push((worker, slot)),
                None => report.workers_skipped += 1,
            }
        }

        let strategy = ctx.strategy();
        let batch_size = self.batch_size.max(1);

        'workers: for (worker, mut slot) in slots {
            let cost = task_cost(&ctx.task, slot.class);
            if !slot.can_fit(cost) {
                report.workers_skipped += 1;
                continue;
            }
            loop {
                let quota = fill_quota(&slot, cost, batch_size);
                if quota == 0 {
                    continue 'workers;
                }
                let entries = self.connector.load_to_process(quota)?;
                if entries.is_empty() {
                    break 'workers;
                }
                for entry in entries {
                    let Some(tile) = self.ready_tile(&entry.relative_path)? else {
                        report.dropped += 1;
                        continue;
                    };
                    if !self.pool.try_reserve(&worker.id, cost).await {
                        debug!(worker = %worker.id, "worker filled by another dispatcher");
                        continue 'workers;
                    }
                    let prepared = self.prepare(
                        ctx,
                        input_root,
                        &strategy,
                        worker,
                        slot.class.is_cluster(),
                        &tile,
                    );
                    let execution = match prepared {
                        Ok(execution) => execution,
                        Err(e) => {
                            self.pool.release(&worker.id, cost).await;
                            return Err(e);
                        }
                    };
                    let payload = ExecutionPayload::from(&execution);
                    match self.client.start_task_execution(worker, &payload).await {
                        Ok(started) => {
                            // The worker owns the task now; its reservation
                            // is released by the completion report.
                            self.record_started(ctx, worker, execution, started, &tile)?;
                            slot.reserve(cost);
                            report.started += 1;
                            report.units += cost;
                        }
                        Err(e) => {
                            self.pool.release(&worker.id, cost).await;
                            warn!(
                                stage = %ctx.stage.id,
                                worker = %worker.id,
                                error = %e,
                                "task start failed, skipping worker"
                            );
                            if e.is_unreachable() {
                                self.pool.mark_unavailable(&worker.id).await;
                            }
                            report.workers_failed += 1;
                            self.record_orphaned(execution)?;
                            continue 'workers;
                        }
                    }
                }
            }
        }

        if report.started > 0 {
            info!(
                stage = %ctx.stage.id,
                started = report.started,
                units = report.units,
                "dispatched tiles"
            );
        }
        Ok(report)
    }

    /// Load the tile behind a queue entry if it can run now. Entries whose
    /// tile is gone, not Queued, or no longer has a Complete upstream are
    /// removed from the queue.
    fn ready_tile(&self, relative_path: &str) -> SchedulerResult<Option<Tile>> {
        let paths = [relative_path.to_string()];
        let Some(mut tile) = self.connector.load_tile(relative_path)? else {
            warn!(owner = %self.connector.owner_id(), path = %relative_path, "queued tile vanished");
            self.connector.delete_to_process(&paths)?;
            return Ok(None);
        };
        if tile.this_stage_status == TileStatus::Queued && upstream_ready(&tile) {
            return Ok(Some(tile));
        }
        if tile.this_stage_status == TileStatus::Queued {
            tile.this_stage_status = TileStatus::Incomplete;
            self.connector.update_tiles(std::slice::from_ref(&tile))?;
        }
        debug!(
            owner = %self.connector.owner_id(),
            path = %relative_path,
            status = ?tile.this_stage_status,
            "queued tile not runnable"
        );
        self.connector.delete_to_process(&paths)?;
        Ok(None)
    }

    /// Resolve the task arguments and record a fresh execution for `tile`.
    fn prepare(
        &self,
        ctx: &StageContext,
        input_root: &str,
        strategy: &StageStrategy,
        worker: &WorkerInfo,
        is_cluster: bool,
        tile: &Tile,
    ) -> SchedulerResult<TaskExecution> {
        let execution_id = Uuid::new_v4().to_string();
        let log_file = log_file_path(&ctx.stage, tile, &execution_id);
        let adjacent = if strategy.is_adjacent() {
            self.connector.load_adjacent_tile(&tile.relative_path)?
        } else {
            None
        };

        let params = ParamContext {
            project: &ctx.project,
            stage: &ctx.stage,
            task: &ctx.task,
            tile,
            adjacent: adjacent.as_ref(),
            execution_id: &execution_id,
            input_root,
            log_file: &log_file,
            is_cluster,
        };
        let resolved_args = resolve_args(&ctx.task.args, &params, strategy);

        Ok(self.connector.create_task_execution(
            worker,
            &ctx.task,
            ExecutionStart {
                id: execution_id,
                tile_relative_path: tile.relative_path.clone(),
                resolved_args,
                log_file,
            },
        )?)
    }

    /// Move an accepted tile out of the queue and into Processing.
    fn record_started(
        &self,
        ctx: &StageContext,
        worker: &WorkerInfo,
        mut execution: TaskExecution,
        started: StartedExecution,
        tile: &Tile,
    ) -> SchedulerResult<()> {
        let now = epoch_secs();
        let paths = [tile.relative_path.clone()];
        self.connector.modify_tiles(&paths, &mut |current: &mut Tile| {
            current.this_stage_status = TileStatus::Processing;
            true
        })?;
        self.connector.delete_to_process(&paths)?;

        execution.execution_status = ExecutionStatus::Running;
        execution.remote_execution_id = started.remote_execution_id;
        execution.started_at = Some(started.started_at.unwrap_or(now));
        self.connector.insert_in_process_tile(&InProcessEntry {
            relative_path: tile.relative_path.clone(),
            worker_id: worker.id.clone(),
            execution_id: execution.id.clone(),
            remote_execution_id: execution.remote_execution_id.clone(),
            last_seen: now,
        })?;
        self.connector.update_task_execution(&execution)?;
        debug!(
            stage = %ctx.stage.id,
            worker = %worker.id,
            path = %tile.relative_path,
            execution = %execution.id,
            "task started"
        );
        Ok(())
    }

    fn record_orphaned(&self, mut execution: TaskExecution) -> SchedulerResult<()> {
        execution.execution_status = ExecutionStatus::Orphaned;
        execution.completion_result = CompletionResult::Incomplete;
        execution.completed_at = Some(epoch_secs());
        self.connector.update_task_execution(&execution)?;
        Ok(())
    }
}
