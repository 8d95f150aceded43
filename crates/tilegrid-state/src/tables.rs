//! redb table definitions for the TileGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Global tables are keyed by id; per-owner tables use `{owner_id}|{relative_path}`
//! so one stage's rows form a contiguous, path-ordered key range.

use redb::TableDefinition;

/// Projects keyed by `{project_id}`.
pub const PROJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("projects");

/// Pipeline stages keyed by `{stage_id}`.
pub const STAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("stages");

/// Task definitions keyed by `{task_id}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Workers keyed by `{worker_id}`.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Task executions keyed by `{execution_id}`.
pub const EXECUTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("executions");

/// Tiles keyed by `{owner_id}|{relative_path}`.
pub const TILES: TableDefinition<&str, &[u8]> = TableDefinition::new("tiles");

/// To-process queue keyed by `{owner_id}|{relative_path}`.
pub const TO_PROCESS: TableDefinition<&str, &[u8]> = TableDefinition::new("to_process");

/// In-process entries keyed by `{owner_id}|{relative_path}`.
pub const IN_PROCESS: TableDefinition<&str, &[u8]> = TableDefinition::new("in_process");

/// Adjacent tile links keyed by `{owner_id}|{relative_path}`.
pub const ADJACENT: TableDefinition<&str, &[u8]> = TableDefinition::new("adjacent");
