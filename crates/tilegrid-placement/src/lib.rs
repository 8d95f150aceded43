//! TileGrid capacity model — worker slots, candidate ordering, greedy fill.
//!
//! This crate decides *where* queued work may go. It does not talk to
//! workers or touch tile tables (that's `tilegrid-scheduler`). Instead it
//! turns worker records and their live load into capacity slots and orders
//! them for the dispatcher's fill-one-then-the-next pass.
//!
//! # Components
//!
//! - **`capacity`**: Work-unit slots with epsilon-tolerant fit checks
//! - **`order`**: Candidate ordering (local workers before cluster proxies)
//! - **`convert`**: Conversions from state store worker records

pub mod capacity;
pub mod convert;
pub mod order;

pub use capacity::{CAPACITY_EPSILON, WorkerClass, WorkerSlot};
pub use convert::{class_of, task_cost, worker_to_slot};
pub use order::{fill_quota, order_candidates};
