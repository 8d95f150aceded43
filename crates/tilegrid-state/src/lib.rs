//! tilegrid-state — embedded state store for TileGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for projects, pipeline stages, task definitions, executions,
//! workers, and the per-stage tile tables the scheduler reconciles.
//!
//! # Architecture
//!
//! ```text
//! StateStore (Arc<Database>, Clone + Send + Sync)
//!   ├── projects / stages / tasks / workers / executions   keyed by id
//!   └── tiles / to_process / in_process / adjacent         keyed by {owner}|{path}
//!         └── StageTable: one owner's view, implements StageConnector
//! ```
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod connector;
pub mod error;
pub mod stage_table;
pub mod store;
pub mod tables;
pub mod types;

pub use connector::StageConnector;
pub use error::{StateError, StateResult};
pub use stage_table::StageTable;
pub use store::{StateStore, epoch_secs};
pub use types::*;
