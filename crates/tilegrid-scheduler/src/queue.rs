//! Work queue manager.
//!
//! Keeps a stage's to-process queue and its Queued tiles in agreement:
//! ready tiles are queued, drifted entries are healed or dropped.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use tilegrid_state::{
    StageConnector, StateResult, Tile, TileFilter, TileStatus, ToProcessEntry, epoch_secs,
};

use crate::status::{is_queueable, upstream_ready};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    /// Incomplete tiles newly queued.
    pub queued: usize,
    /// Entries or tiles corrected to agree with each other.
    pub healed: usize,
    /// Entries removed because their tile cannot run.
    pub dropped: usize,
}

/// Queue every ready tile and repair drift between tiles and the queue.
pub fn materialize(connector: &dyn StageConnector, chunk_size: usize) -> StateResult<QueueSummary> {
    let chunk_size = chunk_size.max(1);
    let now = epoch_secs();
    let tiles = connector.load_tiles(&TileFilter::all())?;
    let by_path: HashMap<&str, &Tile> = tiles.iter().map(|t| (t.relative_path.as_str(), t)).collect();
    let entries = connector.load_to_process(usize::MAX)?;
    let queued_paths: HashSet<&str> = entries.iter().map(|e| e.relative_path.as_str()).collect();

    let mut summary = QueueSummary::default();
    let mut tile_updates: Vec<Tile> = Vec::new();
    let mut drop_entries: Vec<String> = Vec::new();
    let mut new_entries: Vec<ToProcessEntry> = Vec::new();

    for entry in &entries {
        let Some(tile) = by_path.get(entry.relative_path.as_str()) else {
            warn!(owner = %connector.owner_id(), path = %entry.relative_path, "queued tile has no tile row, dropping");
            drop_entries.push(entry.relative_path.clone());
            summary.dropped += 1;
            continue;
        };
        match tile.this_stage_status {
            _ if !upstream_ready(tile) => {
                if tile.this_stage_status == TileStatus::Queued {
                    tile_updates.push(with_status(tile, TileStatus::Incomplete));
                }
                drop_entries.push(entry.relative_path.clone());
                summary.dropped += 1;
            }
            TileStatus::Queued => {}
            TileStatus::Incomplete => {
                tile_updates.push(with_status(tile, TileStatus::Queued));
                summary.healed += 1;
            }
            other => {
                warn!(
                    owner = %connector.owner_id(),
                    path = %entry.relative_path,
                    status = ?other,
                    "queued tile is not runnable, dropping"
                );
                drop_entries.push(entry.relative_path.clone());
                summary.dropped += 1;
            }
        }
    }

    for tile in &tiles {
        if queued_paths.contains(tile.relative_path.as_str()) {
            continue;
        }
        if is_queueable(tile) {
            tile_updates.push(with_status(tile, TileStatus::Queued));
            new_entries.push(ToProcessEntry { relative_path: tile.relative_path.clone(), queued_at: now });
            summary.queued += 1;
        } else if tile.this_stage_status == TileStatus::Queued {
            // Queued without an entry: requeue if it can run, else revert.
            if upstream_ready(tile) {
                new_entries.push(ToProcessEntry { relative_path: tile.relative_path.clone(), queued_at: now });
            } else {
                tile_updates.push(with_status(tile, TileStatus::Incomplete));
            }
            summary.healed += 1;
        }
    }

    for chunk in drop_entries.chunks(chunk_size) {
        connector.delete_to_process(chunk)?;
    }
    for chunk in tile_updates.chunks(chunk_size) {
        connector.update_tiles(chunk)?;
    }
    for chunk in new_entries.chunks(chunk_size) {
        connector.insert_to_process(chunk)?;
    }

    if summary != QueueSummary::default() {
        debug!(
            owner = %connector.owner_id(),
            queued = summary.queued,
            healed = summary.healed,
            dropped = summary.dropped,
            "work queue refreshed"
        );
    }
    Ok(summary)
}

/// Remove queued tiles on the given z-planes and return them to Incomplete.
///
/// Returns the number of tiles dequeued.
pub fn dequeue_planes(
    connector: &dyn StageConnector,
    planes: &[i64],
    chunk_size: usize,
) -> StateResult<usize> {
    let chunk_size = chunk_size.max(1);
    let filter = TileFilter::all()
        .with_status(TileStatus::Queued)
        .in_planes(planes.to_vec());
    let tiles = connector.load_tiles(&filter)?;
    let paths: Vec<String> = tiles.iter().map(|t| t.relative_path.clone()).collect();
    let reverted: Vec<Tile> = tiles
        .iter()
        .map(|t| with_status(t, TileStatus::Incomplete))
        .collect();

    for chunk in paths.chunks(chunk_size) {
        connector.delete_to_process(chunk)?;
    }
    for chunk in reverted.chunks(chunk_size) {
        connector.update_tiles(chunk)?;
    }
    debug!(owner = %connector.owner_id(), ?planes, count = paths.len(), "planes dequeued");
    Ok(paths.len())
}

fn with_status(tile: &Tile, status: TileStatus) -> Tile {
    let mut t = tile.clone();
    t.this_stage_status = status;
    t
}
