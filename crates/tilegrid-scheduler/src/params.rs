//! Dispatch-time argument resolution.
//!
//! Literal tokens pass through; parameter tokens are looked up by name,
//! case-insensitively, first in the common set below and then in the
//! stage strategy's own set. An unknown name resolves to its own text so
//! positional arguments never shift.

use tilegrid_core::{ArgumentKind, ArgumentToken};
use tilegrid_state::{AdjacentTileLink, PipelineStage, Project, TaskDefinition, Tile};

use crate::strategy::StageStrategy;

/// Everything a parameter can resolve against for one execution.
#[derive(Debug, Clone, Copy)]
pub struct ParamContext<'a> {
    pub project: &'a Project,
    pub stage: &'a PipelineStage,
    pub task: &'a TaskDefinition,
    pub tile: &'a Tile,
    pub adjacent: Option<&'a AdjacentTileLink>,
    pub execution_id: &'a str,
    pub input_root: &'a str,
    pub log_file: &'a str,
    pub is_cluster: bool,
}

/// Resolve a parameter shared by every stage type.
pub fn resolve_common(name: &str, ctx: &ParamContext<'_>) -> Option<String> {
    let tile = ctx.tile;
    let value = match name.to_ascii_uppercase().as_str() {
        "PROJECT_NAME" => ctx.project.name.clone(),
        "PROJECT_ROOT" => ctx.project.root_path.clone(),
        "STAGE_ID" => ctx.stage.id.clone(),
        "PIPELINE_INPUT_ROOT" => ctx.input_root.to_string(),
        "PIPELINE_OUTPUT_ROOT" => ctx.stage.dst_path.clone(),
        "TILE_RELATIVE_PATH" => tile.relative_path.clone(),
        "TILE_NAME" => tile.tile_name.clone(),
        "LOG_FILE" => ctx.log_file.to_string(),
        "EXECUTION_ID" => ctx.execution_id.to_string(),
        "TASK_ID" => ctx.task.id.clone(),
        "EXPECTED_EXIT_CODE" => ctx.task.expected_exit_code.to_string(),
        "X" => tile.position.x.to_string(),
        "Y" => tile.position.y.to_string(),
        "Z" => tile.position.z.to_string(),
        "STEP_X" => tile.step.x.to_string(),
        "STEP_Y" => tile.step.y.to_string(),
        "STEP_Z" => tile.step.z.to_string(),
        "IS_CLUSTER_JOB" => ctx.is_cluster.to_string(),
        _ => return None,
    };
    Some(value)
}

/// Resolve a task's argument tokens to the strings passed to its script.
pub fn resolve_args(
    tokens: &[ArgumentToken],
    ctx: &ParamContext<'_>,
    strategy: &StageStrategy,
) -> Vec<String> {
    tokens
        .iter()
        .map(|token| match token.kind {
            ArgumentKind::Literal => token.value.clone(),
            ArgumentKind::Parameter => resolve_common(&token.value, ctx)
                .or_else(|| strategy.resolve_parameter(&token.value, ctx))
                .unwrap_or_else(|| token.value.clone()),
        })
        .collect()
}
