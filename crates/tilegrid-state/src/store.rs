//! StateStore — redb-backed state persistence for TileGrid.
//!
//! Provides typed CRUD over projects, stages, task definitions, workers, and
//! executions, and hands out per-owner [`StageTable`]s for tile data. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::stage_table::StageTable;
use crate::tables::*;
use crate::types::*;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for def in [
            PROJECTS, STAGES, TASKS, WORKERS, EXECUTIONS, TILES, TO_PROCESS, IN_PROCESS, ADJACENT,
        ] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Tile tables ────────────────────────────────────────────────

    /// Per-owner view over the tile tables. The owner must be a known
    /// project or stage.
    pub fn stage_table(&self, owner_id: &str) -> StateResult<StageTable> {
        let known = self.get_stage(owner_id)?.is_some() || self.get_project(owner_id)?.is_some();
        if !known {
            return Err(StateError::UnknownOwner(owner_id.to_string()));
        }
        Ok(StageTable::new(self.clone(), owner_id))
    }

    // ── Projects ───────────────────────────────────────────────────

    pub fn put_project(&self, project: &Project) -> StateResult<()> {
        self.put_json(PROJECTS, &project.id, project)?;
        debug!(project = %project.id, "project stored");
        Ok(())
    }

    pub fn get_project(&self, id: &str) -> StateResult<Option<Project>> {
        self.get_json(PROJECTS, id)
    }

    pub fn list_projects(&self) -> StateResult<Vec<Project>> {
        self.list_json(PROJECTS)
    }

    /// Delete a project by id. Returns true if it existed.
    pub fn delete_project(&self, id: &str) -> StateResult<bool> {
        self.delete_key(PROJECTS, id)
    }

    // ── Stages ─────────────────────────────────────────────────────

    pub fn put_stage(&self, stage: &PipelineStage) -> StateResult<()> {
        self.put_json(STAGES, &stage.id, stage)?;
        debug!(stage = %stage.id, "stage stored");
        Ok(())
    }

    pub fn get_stage(&self, id: &str) -> StateResult<Option<PipelineStage>> {
        self.get_json(STAGES, id)
    }

    pub fn list_stages(&self) -> StateResult<Vec<PipelineStage>> {
        self.list_json(STAGES)
    }

    /// Stages of one project, shallowest first.
    pub fn list_stages_for_project(&self, project_id: &str) -> StateResult<Vec<PipelineStage>> {
        let mut stages: Vec<PipelineStage> = self
            .list_stages()?
            .into_iter()
            .filter(|s| s.project_id == project_id)
            .collect();
        stages.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.id.cmp(&b.id)));
        Ok(stages)
    }

    pub fn delete_stage(&self, id: &str) -> StateResult<bool> {
        self.delete_key(STAGES, id)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn put_task(&self, task: &TaskDefinition) -> StateResult<()> {
        self.put_json(TASKS, &task.id, task)
    }

    pub fn get_task(&self, id: &str) -> StateResult<Option<TaskDefinition>> {
        self.get_json(TASKS, id)
    }

    // ── Workers ────────────────────────────────────────────────────

    pub fn put_worker(&self, worker: &WorkerInfo) -> StateResult<()> {
        self.put_json(WORKERS, &worker.id, worker)
    }

    pub fn get_worker(&self, id: &str) -> StateResult<Option<WorkerInfo>> {
        self.get_json(WORKERS, id)
    }

    pub fn list_workers(&self) -> StateResult<Vec<WorkerInfo>> {
        self.list_json(WORKERS)
    }

    pub fn delete_worker(&self, id: &str) -> StateResult<bool> {
        self.delete_key(WORKERS, id)
    }

    // ── Executions ─────────────────────────────────────────────────

    pub fn put_execution(&self, execution: &TaskExecution) -> StateResult<()> {
        self.put_json(EXECUTIONS, &execution.id, execution)
    }

    pub fn get_execution(&self, id: &str) -> StateResult<Option<TaskExecution>> {
        self.get_json(EXECUTIONS, id)
    }

    // ── JSON helpers ───────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Codec))?);
        }
        Ok(results)
    }

    fn delete_key(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "row deleted");
        Ok(existed)
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilegrid_core::ArgumentToken;

    fn test_project(id: &str, processing: bool) -> Project {
        Project {
            id: id.to_string(),
            name: format!("{id}-name"),
            root_path: format!("/data/{id}"),
            region: RegionBounds::default(),
            skip_planes: vec![3, 4],
            is_processing: processing,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_stage(id: &str, project_id: &str, depth: u32, prev: Option<&str>) -> PipelineStage {
        PipelineStage {
            id: id.to_string(),
            project_id: project_id.to_string(),
            name: id.to_string(),
            task_id: "task-1".to_string(),
            function_type: StageFunction::MapTile,
            previous_stage_id: prev.map(str::to_string),
            depth,
            dst_path: format!("/out/{id}"),
            is_processing: true,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[test]
    fn project_put_get_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let project = test_project("p1", true);

        store.put_project(&project).unwrap();
        assert_eq!(store.get_project("p1").unwrap(), Some(project));
        assert_eq!(store.list_projects().unwrap().len(), 1);

        assert!(store.delete_project("p1").unwrap());
        assert!(!store.delete_project("p1").unwrap());
        assert!(store.get_project("p1").unwrap().is_none());
    }

    #[test]
    fn stages_for_project_sorted_by_depth() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_stage(&test_stage("c", "p1", 3, Some("b"))).unwrap();
        store.put_stage(&test_stage("a", "p1", 1, None)).unwrap();
        store.put_stage(&test_stage("b", "p1", 2, Some("a"))).unwrap();
        store.put_stage(&test_stage("x", "p2", 1, None)).unwrap();

        let ids: Vec<String> = store
            .list_stages_for_project("p1")
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn task_round_trip_keeps_argument_tokens() {
        let store = StateStore::open_in_memory().unwrap();
        let task = TaskDefinition {
            id: "task-1".to_string(),
            name: "stitch".to_string(),
            script: "/opt/stitch.sh".to_string(),
            interpreter: None,
            args: vec![
                ArgumentToken::literal("-v"),
                ArgumentToken::parameter("TILE_RELATIVE_PATH"),
            ],
            expected_exit_code: 0,
            local_work_units: 1.0,
            cluster_work_units: 1.0,
        };
        store.put_task(&task).unwrap();
        assert_eq!(store.get_task("task-1").unwrap(), Some(task));
    }

    #[test]
    fn worker_list_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        for id in ["w1", "w2"] {
            store
                .put_worker(&WorkerInfo {
                    id: id.to_string(),
                    address: "10.0.0.1".to_string(),
                    port: 6201,
                    local_work_capacity: 4.0,
                    cluster_work_capacity: 0.0,
                    is_in_scheduler_pool: true,
                    is_cluster_proxy: false,
                    updated_at: 0,
                })
                .unwrap();
        }
        assert_eq!(store.list_workers().unwrap().len(), 2);
        assert!(store.delete_worker("w1").unwrap());
        assert!(store.get_worker("w1").unwrap().is_none());
    }

    #[test]
    fn stage_table_requires_known_owner() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(matches!(
            store.stage_table("ghost"),
            Err(StateError::UnknownOwner(_))
        ));

        store.put_project(&test_project("p1", false)).unwrap();
        store.put_stage(&test_stage("s1", "p1", 1, None)).unwrap();
        assert!(store.stage_table("p1").is_ok());
        assert!(store.stage_table("s1").is_ok());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_project(&test_project("p1", true)).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let project = store.get_project("p1").unwrap().unwrap();
        assert_eq!(project.skip_planes, vec![3, 4]);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_projects().unwrap().is_empty());
        assert!(store.list_stages().unwrap().is_empty());
        assert!(store.list_workers().unwrap().is_empty());
        assert!(store.get_execution("nope").unwrap().is_none());
        assert!(!store.delete_stage("nope").unwrap());
    }
}
