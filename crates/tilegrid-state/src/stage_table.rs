//! One owner's view over the shared tile tables.
//!
//! Rows live under `{owner_id}|{relative_path}` so every scan is a single
//! prefix range in path order.

use redb::{ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::connector::StageConnector;
use crate::error::StateResult;
use crate::store::{StateStore, epoch_secs};
use crate::tables::*;
use crate::types::*;

type JsonTable = redb::TableDefinition<'static, &'static str, &'static [u8]>;

/// redb-backed [`StageConnector`] for one stage or project.
#[derive(Clone)]
pub struct StageTable {
    store: StateStore,
    owner_id: String,
}

impl StageTable {
    pub(crate) fn new(store: StateStore, owner_id: &str) -> Self {
        Self {
            store,
            owner_id: owner_id.to_string(),
        }
    }

    fn scan<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        self.scan_limited(def, usize::MAX)
    }

    /// First `limit` rows of the owner's range. Stops reading at the limit.
    fn scan_limited<T: DeserializeOwned>(
        &self,
        def: JsonTable,
        limit: usize,
    ) -> StateResult<Vec<T>> {
        let prefix = owner_prefix(&self.owner_id);
        let txn = self.store.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut rows = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            if rows.len() >= limit {
                break;
            }
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            rows.push(serde_json::from_slice(value.value()).map_err(map_err!(Codec))?);
        }
        Ok(rows)
    }

    /// Number of rows in the owner's range. Values are not decoded.
    fn count_rows(&self, def: JsonTable) -> StateResult<u64> {
        let prefix = owner_prefix(&self.owner_id);
        let txn = self.store.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    fn get_row<T: DeserializeOwned>(&self, def: JsonTable, path: &str) -> StateResult<Option<T>> {
        let key = owner_key(&self.owner_id, path);
        let txn = self.store.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?,
            )),
            None => Ok(None),
        }
    }

    fn upsert<'r, T, I>(&self, def: JsonTable, rows: I) -> StateResult<usize>
    where
        T: Serialize + 'r,
        I: IntoIterator<Item = (&'r str, &'r T)>,
    {
        let txn = self.store.db.begin_write().map_err(map_err!(Transaction))?;
        let mut written = 0;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            for (path, row) in rows {
                let key = owner_key(&self.owner_id, path);
                let bytes = serde_json::to_vec(row).map_err(map_err!(Codec))?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                written += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(written)
    }

    fn remove(&self, def: JsonTable, paths: &[String]) -> StateResult<u32> {
        if paths.is_empty() {
            return Ok(0);
        }
        let txn = self.store.db.begin_write().map_err(map_err!(Transaction))?;
        let mut removed = 0;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            for path in paths {
                let key = owner_key(&self.owner_id, path);
                if table.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                    removed += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }
}

impl StageConnector for StageTable {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn load_tiles(&self, filter: &TileFilter) -> StateResult<Vec<Tile>> {
        let tiles: Vec<Tile> = self.scan(TILES)?;
        Ok(tiles.into_iter().filter(|t| filter.matches(t)).collect())
    }

    fn load_tile(&self, relative_path: &str) -> StateResult<Option<Tile>> {
        self.get_row(TILES, relative_path)
    }

    fn insert_tiles(&self, tiles: &[Tile]) -> StateResult<()> {
        let n = self.upsert(TILES, tiles.iter().map(|t| (t.relative_path.as_str(), t)))?;
        debug!(owner = %self.owner_id, count = n, "tiles inserted");
        Ok(())
    }

    fn update_tiles(&self, tiles: &[Tile]) -> StateResult<()> {
        let now = epoch_secs();
        let stamped: Vec<Tile> = tiles
            .iter()
            .cloned()
            .map(|mut t| {
                t.updated_at = now;
                t
            })
            .collect();
        let n = self.upsert(TILES, stamped.iter().map(|t| (t.relative_path.as_str(), t)))?;
        trace!(owner = %self.owner_id, count = n, "tiles updated");
        Ok(())
    }

    fn modify_tiles(
        &self,
        relative_paths: &[String],
        edit: &mut dyn FnMut(&mut Tile) -> bool,
    ) -> StateResult<Vec<Tile>> {
        if relative_paths.is_empty() {
            return Ok(Vec::new());
        }
        let now = epoch_secs();
        let txn = self.store.db.begin_write().map_err(map_err!(Transaction))?;
        let mut changed = Vec::new();
        {
            let mut table = txn.open_table(TILES).map_err(map_err!(Table))?;
            for path in relative_paths {
                let key = owner_key(&self.owner_id, path);
                let current: Option<Tile> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => Some(serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?),
                    None => None,
                };
                let Some(mut tile) = current else {
                    continue;
                };
                if !edit(&mut tile) {
                    continue;
                }
                tile.updated_at = now;
                let bytes = serde_json::to_vec(&tile).map_err(map_err!(Codec))?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                changed.push(tile);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        trace!(owner = %self.owner_id, count = changed.len(), "tiles modified");
        Ok(changed)
    }

    fn delete_tiles(&self, relative_paths: &[String]) -> StateResult<u32> {
        let removed = self.remove(TILES, relative_paths)?;
        debug!(owner = %self.owner_id, removed, "tiles deleted");
        Ok(removed)
    }

    fn count_tiles_by_status(&self) -> StateResult<TileStatusCounts> {
        let mut counts = TileStatusCounts::default();
        for tile in self.scan::<Tile>(TILES)? {
            counts.record(tile.this_stage_status);
        }
        Ok(counts)
    }

    fn count_to_process(&self) -> StateResult<u64> {
        self.count_rows(TO_PROCESS)
    }

    fn load_to_process(&self, limit: usize) -> StateResult<Vec<ToProcessEntry>> {
        self.scan_limited(TO_PROCESS, limit)
    }

    fn insert_to_process(&self, entries: &[ToProcessEntry]) -> StateResult<()> {
        self.upsert(TO_PROCESS, entries.iter().map(|e| (e.relative_path.as_str(), e)))?;
        Ok(())
    }

    fn delete_to_process(&self, relative_paths: &[String]) -> StateResult<u32> {
        self.remove(TO_PROCESS, relative_paths)
    }

    fn insert_in_process_tile(&self, entry: &InProcessEntry) -> StateResult<()> {
        self.upsert(IN_PROCESS, [(entry.relative_path.as_str(), entry)])?;
        Ok(())
    }

    fn load_in_process(&self) -> StateResult<Vec<InProcessEntry>> {
        self.scan(IN_PROCESS)
    }

    fn delete_in_process(&self, relative_paths: &[String]) -> StateResult<u32> {
        self.remove(IN_PROCESS, relative_paths)
    }

    fn load_adjacent_tile(&self, relative_path: &str) -> StateResult<Option<AdjacentTileLink>> {
        self.get_row(ADJACENT, relative_path)
    }

    fn load_adjacent_all(&self) -> StateResult<Vec<AdjacentTileLink>> {
        self.scan(ADJACENT)
    }

    fn insert_adjacent(&self, links: &[AdjacentTileLink]) -> StateResult<()> {
        self.upsert(ADJACENT, links.iter().map(|l| (l.relative_path.as_str(), l)))?;
        Ok(())
    }

    fn delete_adjacent(&self, relative_paths: &[String]) -> StateResult<u32> {
        self.remove(ADJACENT, relative_paths)
    }

    fn create_task_execution(
        &self,
        worker: &WorkerInfo,
        task: &TaskDefinition,
        start: ExecutionStart,
    ) -> StateResult<TaskExecution> {
        let is_cluster = worker.is_cluster_proxy;
        let execution = TaskExecution {
            id: start.id,
            stage_id: self.owner_id.clone(),
            task_id: task.id.clone(),
            worker_id: worker.id.clone(),
            tile_relative_path: start.tile_relative_path,
            remote_execution_id: None,
            resolved_script: task.script.clone(),
            resolved_interpreter: task.interpreter.clone(),
            resolved_args: start.resolved_args,
            expected_exit_code: task.expected_exit_code,
            is_cluster,
            work_units: task.work_units(is_cluster),
            log_file: start.log_file,
            execution_status: ExecutionStatus::Initializing,
            completion_result: CompletionResult::Incomplete,
            exit_code: None,
            queued_at: epoch_secs(),
            started_at: None,
            completed_at: None,
            max_memory_mb: None,
            max_cpu_percent: None,
        };
        self.store.put_execution(&execution)?;
        debug!(
            owner = %self.owner_id,
            execution = %execution.id,
            worker = %execution.worker_id,
            "task execution recorded"
        );
        Ok(execution)
    }

    fn load_task_execution(&self, id: &str) -> StateResult<Option<TaskExecution>> {
        self.store.get_execution(id)
    }

    fn update_task_execution(&self, execution: &TaskExecution) -> StateResult<()> {
        self.store.put_execution(execution)
    }
}
