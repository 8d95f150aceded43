//! Operator actions on projects, stages and their tiles.
//!
//! Every status change keeps the to-process queue in agreement with the
//! tiles: a tile set to Queued gets a queue entry, any other status loses it.

use tracing::{info, warn};

use tilegrid_state::{
    PipelineStage, Project, StageConnector, StateStore, Tile, TileFilter, TileStatus,
    TileStatusCounts, ToProcessEntry, epoch_secs,
};

use crate::connectors::ConnectorCache;
use crate::error::{SchedulerError, SchedulerResult};
use crate::queue;
use crate::status::{check_manual_source, check_manual_status, check_manual_target, upstream_ready};

/// Administrative operations over the shared store and connector cache.
pub struct Admin<'a> {
    pub store: &'a StateStore,
    pub connectors: &'a ConnectorCache,
    pub chunk_size: usize,
}

impl Admin<'_> {
    async fn stage_connector(
        &self,
        stage_id: &str,
    ) -> SchedulerResult<std::sync::Arc<dyn StageConnector>> {
        if self.store.get_stage(stage_id)?.is_none() {
            return Err(SchedulerError::StageNotFound(stage_id.to_string()));
        }
        Ok(self.connectors.get(stage_id).await?)
    }

    /// Set the status of the listed tiles. Unknown paths are skipped; an
    /// invalid target for any listed tile rejects the whole request.
    pub async fn set_tile_status(
        &self,
        stage_id: &str,
        relative_paths: &[String],
        status: TileStatus,
    ) -> SchedulerResult<usize> {
        check_manual_target(status)?;
        let connector = self.stage_connector(stage_id).await?;

        let mut tiles = Vec::with_capacity(relative_paths.len());
        for path in relative_paths {
            match connector.load_tile(path)? {
                Some(tile) => {
                    check_manual_status(&tile, status)?;
                    tiles.push(tile);
                }
                None => warn!(stage = %stage_id, path = %path, "status change for unknown tile"),
            }
        }

        let changed = self.write_status(connector.as_ref(), tiles, status)?;
        info!(stage = %stage_id, ?status, count = changed, "tile status set");
        Ok(changed)
    }

    /// Move every tile in `from` to `to`. Tiles whose upstream is not
    /// Complete are left alone when `to` is Queued.
    pub async fn convert_tile_status(
        &self,
        stage_id: &str,
        from: TileStatus,
        to: TileStatus,
    ) -> SchedulerResult<usize> {
        check_manual_target(to)?;
        check_manual_source(from, to)?;
        let connector = self.stage_connector(stage_id).await?;
        let tiles: Vec<Tile> = connector
            .load_tiles(&TileFilter::all().with_status(from))?
            .into_iter()
            .filter(|t| to != TileStatus::Queued || upstream_ready(t))
            .collect();

        let changed = self.write_status(connector.as_ref(), tiles, to)?;
        info!(stage = %stage_id, ?from, ?to, count = changed, "tile status converted");
        Ok(changed)
    }

    /// Give Canceled tiles another run by sending them back to Incomplete.
    pub async fn requeue_canceled(&self, stage_id: &str) -> SchedulerResult<usize> {
        self.convert_tile_status(stage_id, TileStatus::Canceled, TileStatus::Incomplete)
            .await
    }

    /// Pull every queued tile on the given z-planes back to Incomplete.
    pub async fn dequeue_planes(&self, stage_id: &str, planes: &[i64]) -> SchedulerResult<usize> {
        let connector = self.stage_connector(stage_id).await?;
        let count = queue::dequeue_planes(connector.as_ref(), planes, self.chunk_size)?;
        info!(stage = %stage_id, ?planes, count, "planes dequeued");
        Ok(count)
    }

    pub async fn tile_status_counts(&self, stage_id: &str) -> SchedulerResult<TileStatusCounts> {
        let connector = self.stage_connector(stage_id).await?;
        Ok(connector.count_tiles_by_status()?)
    }

    pub fn set_project_processing(&self, project_id: &str, on: bool) -> SchedulerResult<Project> {
        let mut project = self
            .store
            .get_project(project_id)?
            .ok_or_else(|| SchedulerError::ProjectNotFound(project_id.to_string()))?;
        project.is_processing = on;
        project.updated_at = epoch_secs();
        self.store.put_project(&project)?;
        info!(project = %project_id, processing = on, "project processing changed");
        Ok(project)
    }

    pub fn set_stage_processing(&self, stage_id: &str, on: bool) -> SchedulerResult<PipelineStage> {
        let mut stage = self
            .store
            .get_stage(stage_id)?
            .ok_or_else(|| SchedulerError::StageNotFound(stage_id.to_string()))?;
        stage.is_processing = on;
        stage.updated_at = epoch_secs();
        self.store.put_stage(&stage)?;
        info!(stage = %stage_id, processing = on, "stage processing changed");
        Ok(stage)
    }

    /// Write `status` to the listed tiles and sync the queue. Each row is
    /// re-checked as stored, so a tile dispatch claimed since it was loaded
    /// is left alone.
    fn write_status(
        &self,
        connector: &dyn StageConnector,
        tiles: Vec<Tile>,
        status: TileStatus,
    ) -> SchedulerResult<usize> {
        let chunk_size = self.chunk_size.max(1);
        let requested: Vec<String> = tiles.into_iter().map(|t| t.relative_path).collect();

        let mut paths: Vec<String> = Vec::with_capacity(requested.len());
        for chunk in requested.chunks(chunk_size) {
            let written = connector.modify_tiles(chunk, &mut |current: &mut Tile| {
                if current.this_stage_status == TileStatus::Processing {
                    return false;
                }
                if status == TileStatus::Queued && !upstream_ready(current) {
                    return false;
                }
                current.this_stage_status = status;
                true
            })?;
            paths.extend(written.into_iter().map(|t| t.relative_path));
        }
        if paths.len() < requested.len() {
            warn!(
                owner = %connector.owner_id(),
                skipped = requested.len() - paths.len(),
                "tiles changed before their status was written"
            );
        }

        if status == TileStatus::Queued {
            let now = epoch_secs();
            let entries: Vec<ToProcessEntry> = paths
                .iter()
                .map(|p| ToProcessEntry {
                    relative_path: p.clone(),
                    queued_at: now,
                })
                .collect();
            for chunk in entries.chunks(chunk_size) {
                connector.insert_to_process(chunk)?;
            }
        } else {
            for chunk in paths.chunks(chunk_size) {
                connector.delete_to_process(chunk)?;
            }
        }
        Ok(paths.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilegrid_state::{Lattice, RegionBounds, StageFunction};

    fn tile(path: &str, z: i64, this: TileStatus, prev: TileStatus) -> Tile {
        Tile {
            relative_path: path.to_string(),
            tile_name: path.to_string(),
            position: Lattice::new(0, 0, z),
            step: Lattice::default(),
            this_stage_status: this,
            prev_stage_status: Some(prev),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn setup() -> (StateStore, ConnectorCache) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_project(&Project {
                id: "p1".to_string(),
                name: "p1".to_string(),
                root_path: "/data".to_string(),
                region: RegionBounds::default(),
                skip_planes: Vec::new(),
                is_processing: false,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        store
            .put_stage(&PipelineStage {
                id: "s1".to_string(),
                project_id: "p1".to_string(),
                name: "s1".to_string(),
                task_id: "t1".to_string(),
                function_type: StageFunction::MapTile,
                previous_stage_id: None,
                depth: 1,
                dst_path: "/out".to_string(),
                is_processing: false,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        let table = store.stage_table("s1").unwrap();
        table
            .insert_tiles(&[
                tile("a", 0, TileStatus::Incomplete, TileStatus::Complete),
                tile("b", 1, TileStatus::Incomplete, TileStatus::Incomplete),
                tile("c", 1, TileStatus::Canceled, TileStatus::Complete),
                tile("d", 2, TileStatus::Failed, TileStatus::Complete),
            ])
            .unwrap();
        let connectors = ConnectorCache::new(store.clone());
        (store, connectors)
    }

    fn admin<'a>(store: &'a StateStore, connectors: &'a ConnectorCache) -> Admin<'a> {
        Admin {
            store,
            connectors,
            chunk_size: 2,
        }
    }

    #[tokio::test]
    async fn queuing_tiles_adds_queue_entries() {
        let (store, connectors) = setup();
        let admin = admin(&store, &connectors);

        let n = admin
            .set_tile_status("s1", &["a".to_string(), "zz".to_string()], TileStatus::Queued)
            .await
            .unwrap();
        assert_eq!(n, 1);
        let table = connectors.get("s1").await.unwrap();
        assert_eq!(table.count_to_process().unwrap(), 1);

        admin
            .set_tile_status("s1", &["a".to_string()], TileStatus::Incomplete)
            .await
            .unwrap();
        assert_eq!(table.count_to_process().unwrap(), 0);
    }

    #[tokio::test]
    async fn queued_needs_complete_upstream() {
        let (store, connectors) = setup();
        let admin = admin(&store, &connectors);
        let err = admin
            .set_tile_status("s1", &["a".to_string(), "b".to_string()], TileStatus::Queued)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));

        let table = connectors.get("s1").await.unwrap();
        assert_eq!(table.count_tiles_by_status().unwrap().queued, 0);
    }

    #[tokio::test]
    async fn processing_cannot_be_set_by_hand() {
        let (store, connectors) = setup();
        let admin = admin(&store, &connectors);
        let err = admin
            .convert_tile_status("s1", TileStatus::Failed, TileStatus::Processing)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidTransition { to: TileStatus::Processing, .. }
        ));
    }

    #[tokio::test]
    async fn convert_and_requeue_canceled() {
        let (store, connectors) = setup();
        let admin = admin(&store, &connectors);

        assert_eq!(
            admin
                .convert_tile_status("s1", TileStatus::Failed, TileStatus::Incomplete)
                .await
                .unwrap(),
            1
        );
        assert_eq!(admin.requeue_canceled("s1").await.unwrap(), 1);

        let counts = admin.tile_status_counts("s1").await.unwrap();
        assert_eq!(counts.incomplete, 4);
        assert_eq!(counts.canceled, 0);
        assert_eq!(counts.failed, 0);
    }

    #[tokio::test]
    async fn convert_to_queued_skips_blocked_tiles() {
        let (store, connectors) = setup();
        let admin = admin(&store, &connectors);
        let n = admin
            .convert_tile_status("s1", TileStatus::Incomplete, TileStatus::Queued)
            .await
            .unwrap();
        assert_eq!(n, 1);
        let table = connectors.get("s1").await.unwrap();
        assert_eq!(table.load_tile("b").unwrap().unwrap().this_stage_status, TileStatus::Incomplete);
    }

    #[tokio::test]
    async fn dequeue_planes_reverts_queued_tiles() {
        let (store, connectors) = setup();
        let admin = admin(&store, &connectors);
        admin
            .set_tile_status("s1", &["a".to_string(), "c".to_string()], TileStatus::Queued)
            .await
            .unwrap();

        assert_eq!(admin.dequeue_planes("s1", &[1]).await.unwrap(), 1);
        let table = connectors.get("s1").await.unwrap();
        assert_eq!(table.load_tile("c").unwrap().unwrap().this_stage_status, TileStatus::Incomplete);
        assert_eq!(table.load_tile("a").unwrap().unwrap().this_stage_status, TileStatus::Queued);
        assert_eq!(table.count_to_process().unwrap(), 1);
    }

    #[tokio::test]
    async fn processing_flags_persist() {
        let (store, connectors) = setup();
        let admin = admin(&store, &connectors);
        admin.set_project_processing("p1", true).unwrap();
        admin.set_stage_processing("s1", true).unwrap();
        assert!(store.get_project("p1").unwrap().unwrap().is_processing);
        assert!(store.get_stage("s1").unwrap().unwrap().is_processing);

        assert!(matches!(
            admin.set_stage_processing("nope", true),
            Err(SchedulerError::StageNotFound(_))
        ));
        assert!(matches!(
            admin.tile_status_counts("nope").await,
            Err(SchedulerError::StageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn processing_tiles_are_not_moved() {
        let (store, connectors) = setup();
        let table = connectors.get("s1").await.unwrap();
        table
            .insert_tiles(&[tile("run", 0, TileStatus::Processing, TileStatus::Complete)])
            .unwrap();
        let admin = admin(&store, &connectors);

        let err = admin
            .set_tile_status("s1", &["run".to_string()], TileStatus::Incomplete)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));

        let err = admin
            .convert_tile_status("s1", TileStatus::Processing, TileStatus::Canceled)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidTransition { to: TileStatus::Canceled, .. }
        ));
        assert_eq!(
            table.load_tile("run").unwrap().unwrap().this_stage_status,
            TileStatus::Processing
        );
    }
}
