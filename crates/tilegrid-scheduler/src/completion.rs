//! Completion ingress.
//!
//! Workers report the end (or progress) of an execution by id. The report
//! updates the execution record, settles the tile and frees the work units
//! the execution held on its worker.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tilegrid_state::{CompletionResult, ExecutionStatus, StateStore, Tile, TileStatus, epoch_secs};
use tilegrid_worker::WorkerPool;

use crate::connectors::ConnectorCache;
use crate::error::{SchedulerError, SchedulerResult};
use crate::status::{CompletionEffect, completion_effect};

/// What a worker reports when an execution ends or changes state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub execution_id: String,
    pub execution_status: ExecutionStatus,
    pub completion_result: CompletionResult,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub started_at: Option<u64>,
    #[serde(default)]
    pub completed_at: Option<u64>,
    #[serde(default)]
    pub max_memory_mb: Option<f64>,
    #[serde(default)]
    pub max_cpu_percent: Option<f64>,
}

/// What a report did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionOutcome {
    pub execution_id: String,
    pub stage_id: String,
    pub relative_path: String,
    /// Result recorded on the execution (may differ from the reported one
    /// when the exit code did not match).
    pub completion_result: CompletionResult,
    /// New tile status, or `None` if the tile was left as it was.
    pub tile_status: Option<TileStatus>,
    /// The execution had already been closed; nothing changed.
    pub duplicate: bool,
}

/// Apply a worker's completion report.
pub async fn on_task_execution_complete(
    store: &StateStore,
    connectors: &ConnectorCache,
    pool: &WorkerPool,
    report: CompletionReport,
) -> SchedulerResult<CompletionOutcome> {
    let mut execution = store
        .get_execution(&report.execution_id)?
        .ok_or_else(|| SchedulerError::ExecutionNotFound(report.execution_id.clone()))?;
    let connector = connectors.get(&execution.stage_id).await?;

    let mut outcome = CompletionOutcome {
        execution_id: execution.id.clone(),
        stage_id: execution.stage_id.clone(),
        relative_path: execution.tile_relative_path.clone(),
        completion_result: execution.completion_result,
        tile_status: None,
        duplicate: false,
    };

    if execution.completed_at.is_some() {
        debug!(execution = %execution.id, "completion for closed execution ignored");
        outcome.duplicate = true;
        return Ok(outcome);
    }

    let (result, effect) = completion_effect(
        report.completion_result,
        report.execution_status,
        report.exit_code,
        execution.expected_exit_code,
    );

    execution.execution_status = report.execution_status;
    execution.completion_result = result;
    execution.exit_code = report.exit_code.or(execution.exit_code);
    execution.started_at = report.started_at.or(execution.started_at);
    execution.max_memory_mb = report.max_memory_mb.or(execution.max_memory_mb);
    execution.max_cpu_percent = report.max_cpu_percent.or(execution.max_cpu_percent);
    outcome.completion_result = result;

    let CompletionEffect::Settle(status) = effect else {
        connector.update_task_execution(&execution)?;
        debug!(execution = %execution.id, result = ?result, "execution still running");
        return Ok(outcome);
    };

    execution.completed_at = Some(report.completed_at.unwrap_or_else(epoch_secs));
    connector.update_task_execution(&execution)?;

    let path = execution.tile_relative_path.clone();
    let written = connector.modify_tiles(std::slice::from_ref(&path), &mut |tile: &mut Tile| {
        tile.this_stage_status = status;
        true
    })?;
    if written.is_empty() {
        warn!(stage = %execution.stage_id, path = %path, "completed tile no longer exists");
    } else {
        outcome.tile_status = Some(status);
    }
    connector.delete_in_process(std::slice::from_ref(&path))?;
    pool.release(&execution.worker_id, execution.work_units).await;

    info!(
        stage = %execution.stage_id,
        path = %path,
        execution = %execution.id,
        result = ?result,
        "task execution complete"
    );
    Ok(outcome)
}
