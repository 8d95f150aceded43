//! Domain types for the TileGrid state store.
//!
//! These types represent projects, pipeline stages, per-stage tile tables,
//! task definitions and executions, and workers. All types are serializable
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

use tilegrid_core::ArgumentToken;

pub type ProjectId = String;
pub type StageId = String;
pub type TaskId = String;
pub type ExecutionId = String;
pub type WorkerId = String;

// ── Project ───────────────────────────────────────────────────────

/// Root of a stage dependency graph; owns the source tile set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub root_path: String,
    /// Optional rectangular region; tiles outside it never enter depth-1 stages.
    #[serde(default)]
    pub region: RegionBounds,
    /// z-plane indices excluded from Z adjacency search.
    #[serde(default)]
    pub skip_planes: Vec<i64>,
    pub is_processing: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Per-axis lattice bounds. `None` leaves that side unbounded.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegionBounds {
    pub x_min: Option<i64>,
    pub x_max: Option<i64>,
    pub y_min: Option<i64>,
    pub y_max: Option<i64>,
    pub z_min: Option<i64>,
    pub z_max: Option<i64>,
}

impl RegionBounds {
    /// True when every defined bound admits the position.
    pub fn contains(&self, p: &Lattice) -> bool {
        within(p.x, self.x_min, self.x_max)
            && within(p.y, self.y_min, self.y_max)
            && within(p.z, self.z_min, self.z_max)
    }

    pub fn is_unbounded(&self) -> bool {
        *self == RegionBounds::default()
    }
}

fn within(v: i64, min: Option<i64>, max: Option<i64>) -> bool {
    min.is_none_or(|m| v >= m) && max.is_none_or(|m| v <= m)
}

// ── Pipeline stage ────────────────────────────────────────────────

/// Algorithm a stage runs to derive its tile set from its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFunction {
    MapTile,
    XAdjacent,
    YAdjacent,
    ZAdjacent,
    DashboardRefresh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineStage {
    pub id: StageId,
    pub project_id: ProjectId,
    pub name: String,
    pub task_id: TaskId,
    pub function_type: StageFunction,
    /// `None` means the stage consumes the project's own tile set.
    pub previous_stage_id: Option<StageId>,
    pub depth: u32,
    pub dst_path: String,
    pub is_processing: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PipelineStage {
    /// Owner id of the tile table this stage reads from.
    pub fn input_owner(&self) -> &str {
        self.previous_stage_id.as_deref().unwrap_or(&self.project_id)
    }

    /// Depth-1 stages read the project tile set directly.
    pub fn is_root_adjacent(&self) -> bool {
        self.previous_stage_id.is_none()
    }
}

// ── Tiles ─────────────────────────────────────────────────────────

/// Integer lattice position (or step) of a tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lattice {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Lattice {
    pub const fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }
}

/// Per-stage tile status.
///
/// `DoesNotExist` through `Complete` are ordered by progress; `Failed` and
/// `Canceled` are terminal and sit outside that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileStatus {
    DoesNotExist,
    Incomplete,
    Queued,
    Processing,
    Complete,
    Failed,
    Canceled,
}

impl TileStatus {
    pub const ALL: [TileStatus; 7] = [
        TileStatus::DoesNotExist,
        TileStatus::Incomplete,
        TileStatus::Queued,
        TileStatus::Processing,
        TileStatus::Complete,
        TileStatus::Failed,
        TileStatus::Canceled,
    ];

    pub const fn ordinal(self) -> u8 {
        match self {
            TileStatus::DoesNotExist => 0,
            TileStatus::Incomplete => 1,
            TileStatus::Queued => 2,
            TileStatus::Processing => 3,
            TileStatus::Complete => 4,
            TileStatus::Failed => 5,
            TileStatus::Canceled => 6,
        }
    }

    pub fn from_ordinal(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }
}

/// One row of a stage (or project) tile table, keyed by `relative_path`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tile {
    pub relative_path: String,
    pub tile_name: String,
    pub position: Lattice,
    pub step: Lattice,
    pub this_stage_status: TileStatus,
    /// Mirror of the upstream status for the same key. `None` on project tiles.
    pub prev_stage_status: Option<TileStatus>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Resolved spatial neighbor of a tile in a comparison stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdjacentTileLink {
    pub relative_path: String,
    pub adjacent_relative_path: String,
    pub adjacent_tile_name: String,
    pub adjacent_position: Lattice,
}

/// Tile queued for dispatch at a stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToProcessEntry {
    pub relative_path: String,
    pub queued_at: u64,
}

/// Tile dispatched to a worker and not yet reported complete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InProcessEntry {
    pub relative_path: String,
    pub worker_id: WorkerId,
    pub execution_id: ExecutionId,
    pub remote_execution_id: Option<String>,
    pub last_seen: u64,
}

/// Selection over a tile table. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileFilter {
    pub this_stage_status: Option<TileStatus>,
    pub prev_stage_status: Option<TileStatus>,
    pub z_planes: Option<Vec<i64>>,
}

impl TileFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TileStatus) -> Self {
        self.this_stage_status = Some(status);
        self
    }

    pub fn with_prev_status(mut self, status: TileStatus) -> Self {
        self.prev_stage_status = Some(status);
        self
    }

    pub fn in_planes(mut self, planes: Vec<i64>) -> Self {
        self.z_planes = Some(planes);
        self
    }

    pub fn matches(&self, tile: &Tile) -> bool {
        self.this_stage_status
            .is_none_or(|s| tile.this_stage_status == s)
            && self
                .prev_stage_status
                .is_none_or(|s| tile.prev_stage_status == Some(s))
            && self
                .z_planes
                .as_ref()
                .is_none_or(|planes| planes.contains(&tile.position.z))
    }
}

/// Tile counts per status for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileStatusCounts {
    pub does_not_exist: u64,
    pub incomplete: u64,
    pub queued: u64,
    pub processing: u64,
    pub complete: u64,
    pub failed: u64,
    pub canceled: u64,
}

impl TileStatusCounts {
    pub fn record(&mut self, status: TileStatus) {
        let slot = match status {
            TileStatus::DoesNotExist => &mut self.does_not_exist,
            TileStatus::Incomplete => &mut self.incomplete,
            TileStatus::Queued => &mut self.queued,
            TileStatus::Processing => &mut self.processing,
            TileStatus::Complete => &mut self.complete,
            TileStatus::Failed => &mut self.failed,
            TileStatus::Canceled => &mut self.canceled,
        };
        *slot += 1;
    }

    pub fn get(&self, status: TileStatus) -> u64 {
        match status {
            TileStatus::DoesNotExist => self.does_not_exist,
            TileStatus::Incomplete => self.incomplete,
            TileStatus::Queued => self.queued,
            TileStatus::Processing => self.processing,
            TileStatus::Complete => self.complete,
            TileStatus::Failed => self.failed,
            TileStatus::Canceled => self.canceled,
        }
    }

    pub fn total(&self) -> u64 {
        TileStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

// ── Tasks ─────────────────────────────────────────────────────────

/// Script a stage runs once per tile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDefinition {
    pub id: TaskId,
    pub name: String,
    pub script: String,
    /// e.g. `python3`; `None` executes the script directly.
    pub interpreter: Option<String>,
    pub args: Vec<ArgumentToken>,
    pub expected_exit_code: i32,
    pub local_work_units: f64,
    pub cluster_work_units: f64,
}

impl TaskDefinition {
    /// Work units one run costs on the given worker class.
    pub fn work_units(&self, cluster: bool) -> f64 {
        if cluster {
            self.cluster_work_units
        } else {
            self.local_work_units
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Initializing,
    Running,
    Completed,
    Zombie,
    Orphaned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionResult {
    Incomplete,
    Cancel,
    Success,
    Error,
    Resubmitted,
}

/// Input for recording a new execution before it is sent to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStart {
    pub id: ExecutionId,
    pub tile_relative_path: String,
    pub resolved_args: Vec<String>,
    pub log_file: String,
}

/// One concrete run of a task against one tile on one worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskExecution {
    pub id: ExecutionId,
    pub stage_id: StageId,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub tile_relative_path: String,
    pub remote_execution_id: Option<String>,
    pub resolved_script: String,
    pub resolved_interpreter: Option<String>,
    pub resolved_args: Vec<String>,
    pub expected_exit_code: i32,
    pub is_cluster: bool,
    /// Cost charged against the worker while this execution runs.
    pub work_units: f64,
    pub log_file: String,
    pub execution_status: ExecutionStatus,
    pub completion_result: CompletionResult,
    pub exit_code: Option<i32>,
    pub queued_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub max_memory_mb: Option<f64>,
    pub max_cpu_percent: Option<f64>,
}

// ── Workers ───────────────────────────────────────────────────────

/// A remote compute worker. Load is runtime state and not persisted here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub address: String,
    pub port: u16,
    pub local_work_capacity: f64,
    pub cluster_work_capacity: f64,
    pub is_in_scheduler_pool: bool,
    pub is_cluster_proxy: bool,
    pub updated_at: u64,
}

impl WorkerInfo {
    /// Capacity of the class this worker dispatches to.
    pub fn work_capacity(&self) -> f64 {
        if self.is_cluster_proxy {
            self.cluster_work_capacity
        } else {
            self.local_work_capacity
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Build the composite key for a per-owner table row.
pub fn owner_key(owner_id: &str, relative_path: &str) -> String {
    format!("{owner_id}|{relative_path}")
}

/// Key prefix covering every row of one owner.
pub fn owner_prefix(owner_id: &str) -> String {
    format!("{owner_id}|")
}
