//! Stage strategies.
//!
//! One scheduler type runs every stage; what differs per `function_type` is
//! how the upstream view is derived from the input table and which extra
//! parameters a task may use.

use tilegrid_state::{Project, StageConnector, StageFunction, TileFilter};

use crate::adjacency::{self, Axis};
use crate::error::SchedulerResult;
use crate::mux::UpstreamTile;
use crate::params::ParamContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStrategy {
    /// Pass-through: each input tile maps to one output tile.
    Map,
    /// Compare each input tile with its neighbor along an axis.
    Adjacent(Axis),
}

impl StageStrategy {
    pub fn for_function(function: StageFunction) -> Self {
        match function {
            StageFunction::MapTile | StageFunction::DashboardRefresh => StageStrategy::Map,
            StageFunction::XAdjacent => StageStrategy::Adjacent(Axis::X),
            StageFunction::YAdjacent => StageStrategy::Adjacent(Axis::Y),
            StageFunction::ZAdjacent => StageStrategy::Adjacent(Axis::Z),
        }
    }

    pub fn is_adjacent(&self) -> bool {
        matches!(self, StageStrategy::Adjacent(_))
    }

    /// Build the upstream tile set the stage's mux reconciles against.
    ///
    /// Adjacent strategies also bring the output table's links up to date.
    pub fn resolve_input_output(
        &self,
        input: &dyn StageConnector,
        output: &dyn StageConnector,
        project: &Project,
        chunk_size: usize,
    ) -> SchedulerResult<Vec<UpstreamTile>> {
        let source = input.load_tiles(&TileFilter::all())?;
        match self {
            StageStrategy::Map => Ok(source.iter().map(UpstreamTile::from_tile).collect()),
            StageStrategy::Adjacent(axis) => {
                let existing = output.load_adjacent_all()?;
                let plan = adjacency::resolve(*axis, &source, &project.skip_planes, &existing);
                adjacency::apply_links(output, &plan, chunk_size)?;
                Ok(plan.upstream)
            }
        }
    }

    /// Strategy-specific parameters, or `None` if `name` is not one.
    pub fn resolve_parameter(&self, name: &str, ctx: &ParamContext<'_>) -> Option<String> {
        match self {
            StageStrategy::Map => None,
            StageStrategy::Adjacent(_) => {
                let link = ctx.adjacent?;
                match name.to_ascii_uppercase().as_str() {
                    "ADJACENT_TILE_RELATIVE_PATH" => Some(link.adjacent_relative_path.clone()),
                    "ADJACENT_TILE_NAME" => Some(link.adjacent_tile_name.clone()),
                    "ADJACENT_X" => Some(link.adjacent_position.x.to_string()),
                    "ADJACENT_Y" => Some(link.adjacent_position.y.to_string()),
                    "ADJACENT_Z" => Some(link.adjacent_position.z.to_string()),
                    _ => None,
                }
            }
        }
    }
}
