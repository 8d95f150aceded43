//! Diff/Mux — reconcile a stage's tile table with its upstream tile set.
//!
//! [`diff`] is pure: one pass over upstream and one over local, keyed by
//! relative path. [`apply`] writes the result through a connector in
//! bounded chunks.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use tilegrid_state::{
    Lattice, RegionBounds, StageConnector, StateResult, Tile, TileStatus, epoch_secs,
};

use crate::status::on_upstream_change;

/// One tile as seen from upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamTile {
    pub relative_path: String,
    pub tile_name: String,
    pub position: Lattice,
    #[serde(default)]
    pub step: Lattice,
    pub status: TileStatus,
}

impl UpstreamTile {
    /// Upstream view of a stored tile, using its own stage status.
    pub fn from_tile(tile: &Tile) -> Self {
        Self {
            relative_path: tile.relative_path.clone(),
            tile_name: tile.tile_name.clone(),
            position: tile.position,
            step: tile.step,
            status: tile.this_stage_status,
        }
    }
}

/// Which local field carries the upstream status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mirror {
    /// Stage tables: upstream status lands in `prev_stage_status` and
    /// `this_stage_status` follows the state machine.
    #[default]
    PrevStage,
    /// Project tables: the tile's own status is the upstream status.
    ThisStage,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MuxDiff {
    pub to_insert: Vec<Tile>,
    /// Existing tiles with their new mirrored fields (and status, for resets).
    pub to_update: Vec<Tile>,
    pub to_delete: Vec<String>,
    /// Paths in `to_update` that regressed from Queued to Incomplete.
    pub to_reset: Vec<String>,
    pub mirror: Mirror,
}

impl MuxDiff {
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// Counts written by [`apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MuxSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub reset: usize,
}

/// Classify upstream vs local tiles.
///
/// With `bounds`, upstream tiles outside the region are never inserted. A
/// local copy that already exists keeps mirroring its upstream tile.
pub fn diff(
    upstream: &[UpstreamTile],
    local: &[Tile],
    bounds: Option<&RegionBounds>,
    mirror: Mirror,
) -> MuxDiff {
    let now = epoch_secs();
    let local_by_path: HashMap<&str, &Tile> = local
        .iter()
        .map(|t| (t.relative_path.as_str(), t))
        .collect();

    let mut out = MuxDiff {
        mirror,
        ..MuxDiff::default()
    };
    let mut seen: HashSet<&str> = HashSet::with_capacity(upstream.len());

    for up in upstream {
        seen.insert(up.relative_path.as_str());

        match local_by_path.get(up.relative_path.as_str()) {
            None => {
                if bounds.is_none_or(|b| b.contains(&up.position)) {
                    out.to_insert.push(new_tile(up, mirror, now));
                }
            }
            Some(existing) => {
                if let Some(updated) = reconcile(existing, up, mirror) {
                    if existing.this_stage_status == TileStatus::Queued
                        && updated.this_stage_status == TileStatus::Incomplete
                    {
                        out.to_reset.push(updated.relative_path.clone());
                    }
                    out.to_update.push(updated);
                }
            }
        }
    }

    for tile in local {
        if !seen.contains(tile.relative_path.as_str()) {
            out.to_delete.push(tile.relative_path.clone());
        }
    }

    out
}

fn new_tile(up: &UpstreamTile, mirror: Mirror, now: u64) -> Tile {
    let (this, prev) = match mirror {
        Mirror::PrevStage => (TileStatus::Incomplete, Some(up.status)),
        Mirror::ThisStage => (up.status, None),
    };
    Tile {
        relative_path: up.relative_path.clone(),
        tile_name: up.tile_name.clone(),
        position: up.position,
        step: up.step,
        this_stage_status: this,
        prev_stage_status: prev,
        created_at: now,
        updated_at: now,
    }
}

/// The updated tile, or `None` if nothing mirrored has changed.
fn reconcile(existing: &Tile, up: &UpstreamTile, mirror: Mirror) -> Option<Tile> {
    let mirrored = match mirror {
        Mirror::PrevStage => existing.prev_stage_status,
        Mirror::ThisStage => Some(existing.this_stage_status),
    };
    if mirrored == Some(up.status) && existing.position == up.position && existing.step == up.step
    {
        return None;
    }

    let mut tile = existing.clone();
    tile.tile_name = up.tile_name.clone();
    tile.position = up.position;
    tile.step = up.step;
    match mirror {
        Mirror::PrevStage => {
            tile.prev_stage_status = Some(up.status);
            tile.this_stage_status = on_upstream_change(existing.this_stage_status, up.status);
        }
        Mirror::ThisStage => tile.this_stage_status = up.status,
    }
    Some(tile)
}

/// Write a diff: inserts, updates, deletes (with their queue, in-process and
/// adjacency rows), then drop resets and deletes from the to-process queue.
///
/// Updates are re-derived from the stored row inside the write, so a status
/// settled after `diff` read the table is kept. Only regressions that still
/// apply to the stored row are counted and dequeued.
pub fn apply(
    connector: &dyn StageConnector,
    diff: &MuxDiff,
    chunk_size: usize,
) -> StateResult<MuxSummary> {
    let chunk_size = chunk_size.max(1);

    for chunk in diff.to_insert.chunks(chunk_size) {
        connector.insert_tiles(chunk)?;
    }

    let mut reset: Vec<String> = Vec::new();
    for chunk in diff.to_update.chunks(chunk_size) {
        let wanted: HashMap<&str, &Tile> = chunk
            .iter()
            .map(|t| (t.relative_path.as_str(), t))
            .collect();
        let paths: Vec<String> = chunk.iter().map(|t| t.relative_path.clone()).collect();
        connector.modify_tiles(&paths, &mut |current: &mut Tile| {
            let Some(target) = wanted.get(current.relative_path.as_str()) else {
                return false;
            };
            current.tile_name = target.tile_name.clone();
            current.position = target.position;
            current.step = target.step;
            match diff.mirror {
                Mirror::PrevStage => {
                    let Some(prev) = target.prev_stage_status else {
                        return true;
                    };
                    let next = on_upstream_change(current.this_stage_status, prev);
                    if current.this_stage_status == TileStatus::Queued
                        && next == TileStatus::Incomplete
                    {
                        reset.push(current.relative_path.clone());
                    }
                    current.prev_stage_status = Some(prev);
                    current.this_stage_status = next;
                }
                Mirror::ThisStage => current.this_stage_status = target.this_stage_status,
            }
            true
        })?;
    }

    for chunk in diff.to_delete.chunks(chunk_size) {
        connector.delete_tiles(chunk)?;
        connector.delete_in_process(chunk)?;
        connector.delete_adjacent(chunk)?;
    }

    let dequeue: Vec<String> = reset
        .iter()
        .chain(diff.to_delete.iter())
        .cloned()
        .collect();
    for chunk in dequeue.chunks(chunk_size) {
        connector.delete_to_process(chunk)?;
    }

    let summary = MuxSummary {
        inserted: diff.to_insert.len(),
        updated: diff.to_update.len(),
        deleted: diff.to_delete.len(),
        reset: reset.len(),
    };
    if !diff.is_empty() {
        debug!(
            owner = %connector.owner_id(),
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            reset = summary.reset,
            "tile table reconciled"
        );
    }
    Ok(summary)
}
