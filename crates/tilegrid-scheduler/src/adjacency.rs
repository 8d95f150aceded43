//! Adjacency resolver for comparison stages.
//!
//! Pairs each input tile with its +1 neighbor along one axis, keeps one
//! [`AdjacentTileLink`] per tile in step with that pairing, and derives the
//! upstream status the stage's mux sees from the pair.

use std::collections::HashMap;

use tracing::debug;

use tilegrid_state::{AdjacentTileLink, Lattice, StageConnector, StateResult, Tile};

use crate::mux::UpstreamTile;
use crate::status::combine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Position of the neighbor of `from` along `axis`.
///
/// Along Z, planes listed in `skip_planes` are stepped over.
pub fn neighbor_position(axis: Axis, from: Lattice, skip_planes: &[i64]) -> Lattice {
    match axis {
        Axis::X => Lattice::new(from.x + 1, from.y, from.z),
        Axis::Y => Lattice::new(from.x, from.y + 1, from.z),
        Axis::Z => {
            let mut z = from.z + 1;
            while skip_planes.contains(&z) {
                z += 1;
            }
            Lattice::new(from.x, from.y, z)
        }
    }
}

/// Link changes plus the derived upstream set for one refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdjacencyPlan {
    /// One entry per input tile the stage should carry.
    pub upstream: Vec<UpstreamTile>,
    /// New or changed links.
    pub upsert: Vec<AdjacentTileLink>,
    /// Links whose source is gone, skipped, or no longer has a neighbor.
    pub delete: Vec<String>,
}

/// Resolve neighbors for `source` tiles against existing links.
pub fn resolve(
    axis: Axis,
    source: &[Tile],
    skip_planes: &[i64],
    existing: &[AdjacentTileLink],
) -> AdjacencyPlan {
    let by_position: HashMap<Lattice, &Tile> = source.iter().map(|t| (t.position, t)).collect();
    let mut links: HashMap<&str, &AdjacentTileLink> = existing
        .iter()
        .map(|l| (l.relative_path.as_str(), l))
        .collect();

    let mut plan = AdjacencyPlan::default();

    for tile in source {
        // A tile on a skipped plane takes no part in a Z comparison.
        if axis == Axis::Z && skip_planes.contains(&tile.position.z) {
            continue;
        }

        let neighbor = by_position
            .get(&neighbor_position(axis, tile.position, skip_planes))
            .copied();
        let current = links.remove(tile.relative_path.as_str());

        match neighbor {
            Some(n) => {
                let wanted = AdjacentTileLink {
                    relative_path: tile.relative_path.clone(),
                    adjacent_relative_path: n.relative_path.clone(),
                    adjacent_tile_name: n.tile_name.clone(),
                    adjacent_position: n.position,
                };
                if current != Some(&wanted) {
                    plan.upsert.push(wanted);
                }
            }
            None => {
                if current.is_some() {
                    plan.delete.push(tile.relative_path.clone());
                }
            }
        }

        plan.upstream.push(UpstreamTile {
            relative_path: tile.relative_path.clone(),
            tile_name: tile.tile_name.clone(),
            position: tile.position,
            step: tile.step,
            status: combine(tile.this_stage_status, neighbor.map(|n| n.this_stage_status)),
        });
    }

    // Links left over belong to tiles that were skipped or have disappeared.
    plan.delete.extend(links.into_keys().map(str::to_string));
    plan
}

/// Write link changes through the stage's connector.
pub fn apply_links(
    connector: &dyn StageConnector,
    plan: &AdjacencyPlan,
    chunk_size: usize,
) -> StateResult<()> {
    let chunk_size = chunk_size.max(1);
    for chunk in plan.upsert.chunks(chunk_size) {
        connector.insert_adjacent(chunk)?;
    }
    for chunk in plan.delete.chunks(chunk_size) {
        connector.delete_adjacent(chunk)?;
    }
    if !plan.upsert.is_empty() || !plan.delete.is_empty() {
        debug!(
            owner = %connector.owner_id(),
            upserted = plan.upsert.len(),
            deleted = plan.delete.len(),
            "adjacent links refreshed"
        );
    }
    Ok(())
}
