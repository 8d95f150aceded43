//! Tile status state machine.
//!
//! ```text
//!   DoesNotExist < Incomplete < Queued < Processing < Complete
//!                      ^           |          |
//!                      └── reset ──┘          ├── Error  → Failed
//!                                             └── Cancel → Canceled
//! ```
//!
//! A tile may only be Queued or Processing while its upstream mirror is
//! Complete. Processing is left alone by reconciliation and only leaves
//! through a completion report.

use tilegrid_state::{CompletionResult, ExecutionStatus, Tile, TileStatus};

use crate::error::{SchedulerError, SchedulerResult};

/// True once the upstream prerequisite allows this tile to advance.
pub fn upstream_ready(tile: &Tile) -> bool {
    tile.prev_stage_status == Some(TileStatus::Complete)
}

/// Incomplete with a Complete upstream: the queue manager should queue it.
pub fn is_queueable(tile: &Tile) -> bool {
    tile.this_stage_status == TileStatus::Incomplete && upstream_ready(tile)
}

/// Status a tile takes when its upstream mirror changes to `upstream`.
///
/// Only a Queued tile regresses (back to Incomplete). Processing is never
/// preempted; Complete/Failed/Canceled stay as they are.
pub fn on_upstream_change(current: TileStatus, upstream: TileStatus) -> TileStatus {
    if current == TileStatus::Queued && upstream != TileStatus::Complete {
        TileStatus::Incomplete
    } else {
        current
    }
}

/// Combined upstream status of a tile and its spatial neighbor.
///
/// Failed wins over Canceled, which wins over the lower of the two ordered
/// statuses. A tile without a neighbor has nothing to compare against.
pub fn combine(source: TileStatus, neighbor: Option<TileStatus>) -> TileStatus {
    let Some(neighbor) = neighbor else {
        return TileStatus::DoesNotExist;
    };
    if source == TileStatus::Failed || neighbor == TileStatus::Failed {
        TileStatus::Failed
    } else if source == TileStatus::Canceled || neighbor == TileStatus::Canceled {
        TileStatus::Canceled
    } else if source.ordinal() <= neighbor.ordinal() {
        source
    } else {
        neighbor
    }
}

/// What a completion report does to the tile it ran against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionEffect {
    /// Set the tile to this status and close out the in-process entry.
    Settle(TileStatus),
    /// The work was handed on (e.g. resubmitted to a cluster queue); the
    /// tile keeps running.
    StillRunning,
}

/// Map a worker-reported result to its effect on the tile.
///
/// A `Success` whose exit code differs from the expected one counts as
/// `Error`. An `Incomplete` report for an execution that is still running
/// changes nothing; for a zombie, orphaned or finished one it sends the
/// tile back to the queue.
pub fn completion_effect(
    result: CompletionResult,
    execution_status: ExecutionStatus,
    exit_code: Option<i32>,
    expected_exit_code: i32,
) -> (CompletionResult, CompletionEffect) {
    match result {
        CompletionResult::Success if exit_code.is_some_and(|c| c != expected_exit_code) => (
            CompletionResult::Error,
            CompletionEffect::Settle(TileStatus::Failed),
        ),
        CompletionResult::Success => (result, CompletionEffect::Settle(TileStatus::Complete)),
        CompletionResult::Error => (result, CompletionEffect::Settle(TileStatus::Failed)),
        CompletionResult::Cancel => (result, CompletionEffect::Settle(TileStatus::Canceled)),
        CompletionResult::Resubmitted => (result, CompletionEffect::StillRunning),
        // Still initializing or running: a progress report, not an ending.
        CompletionResult::Incomplete
            if matches!(
                execution_status,
                ExecutionStatus::Initializing | ExecutionStatus::Running
            ) =>
        {
            (result, CompletionEffect::StillRunning)
        }
        CompletionResult::Incomplete => (result, CompletionEffect::Settle(TileStatus::Incomplete)),
    }
}

/// Reject statuses an operator may never set directly.
///
/// Processing is owned by dispatch and DoesNotExist is not a stored state.
pub fn check_manual_target(target: TileStatus) -> SchedulerResult<()> {
    match target {
        TileStatus::Processing => Err(SchedulerError::InvalidTransition {
            to: target,
            reason: "only dispatch starts processing",
        }),
        TileStatus::DoesNotExist => Err(SchedulerError::InvalidTransition {
            to: target,
            reason: "tiles are removed by reconciliation, not by status",
        }),
        _ => Ok(()),
    }
}

/// Reject moving tiles out of a status an operator may not touch.
///
/// A Processing tile has a live execution and in-process entry; only its
/// completion report moves it.
pub fn check_manual_source(current: TileStatus, target: TileStatus) -> SchedulerResult<()> {
    if current == TileStatus::Processing {
        return Err(SchedulerError::InvalidTransition {
            to: target,
            reason: "tile is processing until its execution completes",
        });
    }
    Ok(())
}

/// Validate an operator-requested status for a tile. Queued also needs a
/// Complete upstream.
pub fn check_manual_status(tile: &Tile, target: TileStatus) -> SchedulerResult<()> {
    check_manual_target(target)?;
    check_manual_source(tile.this_stage_status, target)?;
    if target == TileStatus::Queued && !upstream_ready(tile) {
        return Err(SchedulerError::InvalidTransition {
            to: target,
            reason: "upstream tile is not complete",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilegrid_state::Lattice;
    use TileStatus::*;

    fn tile(this: TileStatus, prev: Option<TileStatus>) -> Tile {
        Tile {
            relative_path: "a".to_string(),
            tile_name: "a".to_string(),
            position: Lattice::default(),
            step: Lattice::default(),
            this_stage_status: this,
            prev_stage_status: prev,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn queueable_needs_complete_upstream() {
        assert!(is_queueable(&tile(Incomplete, Some(Complete))));
        for prev in [DoesNotExist, Incomplete, Queued, Processing, Failed, Canceled] {
            assert!(!is_queueable(&tile(Incomplete, Some(prev))));
        }
        assert!(!is_queueable(&tile(Incomplete, None)));
        assert!(!is_queueable(&tile(Complete, Some(Complete))));
    }

    #[test]
    fn only_queued_resets_on_regression() {
        assert_eq!(on_upstream_change(Queued, Incomplete), Incomplete);
        assert_eq!(on_upstream_change(Queued, Failed), Incomplete);
        assert_eq!(on_upstream_change(Queued, Complete), Queued);
        assert_eq!(on_upstream_change(Processing, Incomplete), Processing);
        assert_eq!(on_upstream_change(Complete, Canceled), Complete);
    }

    #[test]
    fn combine_precedence() {
        assert_eq!(combine(Complete, Some(Failed)), Failed);
        assert_eq!(combine(Canceled, Some(Failed)), Failed);
        assert_eq!(combine(Canceled, Some(Complete)), Canceled);
        assert_eq!(combine(Complete, Some(Queued)), Queued);
        assert_eq!(combine(Incomplete, Some(Complete)), Incomplete);
        assert_eq!(combine(Complete, Some(Complete)), Complete);
        assert_eq!(combine(Complete, None), DoesNotExist);
    }

    #[test]
    fn success_with_wrong_exit_code_fails() {
        let (result, effect) =
            completion_effect(CompletionResult::Success, ExecutionStatus::Completed, Some(2), 0);
        assert_eq!(result, CompletionResult::Error);
        assert_eq!(effect, CompletionEffect::Settle(Failed));

        let (_, effect) =
            completion_effect(CompletionResult::Success, ExecutionStatus::Completed, Some(0), 0);
        assert_eq!(effect, CompletionEffect::Settle(Complete));
    }

    #[test]
    fn completion_mapping() {
        let settle = |r, s| completion_effect(r, s, None, 0).1;
        assert_eq!(
            settle(CompletionResult::Error, ExecutionStatus::Completed),
            CompletionEffect::Settle(Failed)
        );
        assert_eq!(
            settle(CompletionResult::Cancel, ExecutionStatus::Completed),
            CompletionEffect::Settle(Canceled)
        );
        assert_eq!(
            settle(CompletionResult::Incomplete, ExecutionStatus::Orphaned),
            CompletionEffect::Settle(Incomplete)
        );
        assert_eq!(
            settle(CompletionResult::Incomplete, ExecutionStatus::Zombie),
            CompletionEffect::Settle(Incomplete)
        );
        assert_eq!(
            settle(CompletionResult::Incomplete, ExecutionStatus::Running),
            CompletionEffect::StillRunning
        );
        assert_eq!(
            settle(CompletionResult::Resubmitted, ExecutionStatus::Running),
            CompletionEffect::StillRunning
        );
    }

    #[test]
    fn manual_status_rules() {
        let ready = tile(Incomplete, Some(Complete));
        let blocked = tile(Incomplete, Some(Incomplete));
        assert!(check_manual_status(&ready, Queued).is_ok());
        assert!(check_manual_status(&blocked, Queued).is_err());
        assert!(check_manual_status(&ready, Processing).is_err());
        assert!(check_manual_status(&ready, DoesNotExist).is_err());
        assert!(check_manual_status(&blocked, Canceled).is_ok());
        assert!(check_manual_status(&tile(Processing, Some(Complete)), Incomplete).is_err());
        assert!(check_manual_source(Processing, Canceled).is_err());
        assert!(check_manual_source(Failed, Canceled).is_ok());
    }
}
