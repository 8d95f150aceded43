//! The per-owner tile table interface the scheduler programs against.
//!
//! An owner is either a pipeline stage or a project (whose table holds the
//! root tile set). Bulk mutations commit in one transaction; callers chunk
//! large batches to bound transaction size.

use crate::error::StateResult;
use crate::types::*;

pub trait StageConnector: Send + Sync {
    /// Stage or project id whose rows this connector reads and writes.
    fn owner_id(&self) -> &str;

    // ── Tiles ──────────────────────────────────────────────────────

    /// Load tiles matching `filter`, in relative-path order.
    fn load_tiles(&self, filter: &TileFilter) -> StateResult<Vec<Tile>>;

    fn load_tile(&self, relative_path: &str) -> StateResult<Option<Tile>>;

    fn insert_tiles(&self, tiles: &[Tile]) -> StateResult<()>;

    fn update_tiles(&self, tiles: &[Tile]) -> StateResult<()>;

    /// Read-modify-write the listed tiles in one transaction. `edit` sees
    /// the current row and returns whether to write it back; missing paths
    /// are skipped. Returns the rows written.
    fn modify_tiles(
        &self,
        relative_paths: &[String],
        edit: &mut dyn FnMut(&mut Tile) -> bool,
    ) -> StateResult<Vec<Tile>>;

    /// Returns the number of rows that existed.
    fn delete_tiles(&self, relative_paths: &[String]) -> StateResult<u32>;

    fn count_tiles_by_status(&self) -> StateResult<TileStatusCounts>;

    // ── To-process queue ───────────────────────────────────────────

    fn count_to_process(&self) -> StateResult<u64>;

    /// Oldest-first (path order) slice of the queue.
    fn load_to_process(&self, limit: usize) -> StateResult<Vec<ToProcessEntry>>;

    fn insert_to_process(&self, entries: &[ToProcessEntry]) -> StateResult<()>;

    fn delete_to_process(&self, relative_paths: &[String]) -> StateResult<u32>;

    // ── In-process ─────────────────────────────────────────────────

    fn insert_in_process_tile(&self, entry: &InProcessEntry) -> StateResult<()>;

    fn load_in_process(&self) -> StateResult<Vec<InProcessEntry>>;

    fn delete_in_process(&self, relative_paths: &[String]) -> StateResult<u32>;

    // ── Adjacent links ─────────────────────────────────────────────

    fn load_adjacent_tile(&self, relative_path: &str) -> StateResult<Option<AdjacentTileLink>>;

    fn load_adjacent_all(&self) -> StateResult<Vec<AdjacentTileLink>>;

    /// Insert or replace links.
    fn insert_adjacent(&self, links: &[AdjacentTileLink]) -> StateResult<()>;

    fn delete_adjacent(&self, relative_paths: &[String]) -> StateResult<u32>;

    // ── Executions ─────────────────────────────────────────────────

    /// Record a new execution in `Initializing` state.
    fn create_task_execution(
        &self,
        worker: &WorkerInfo,
        task: &TaskDefinition,
        start: ExecutionStart,
    ) -> StateResult<TaskExecution>;

    fn load_task_execution(&self, id: &str) -> StateResult<Option<TaskExecution>>;

    fn update_task_execution(&self, execution: &TaskExecution) -> StateResult<()>;
}
