//! tilegrid-worker — remote worker access for TileGrid.
//!
//! Provides the HTTP client used to query worker load and start task
//! executions, and the shared runtime pool that tracks each worker's load
//! and reachability between queries.
//!
//! # Architecture
//!
//! ```text
//! WorkerPool (shared by all stage schedulers)
//!   ├── WorkerRuntime per worker: reported load + reserved work, availability
//!   ├── probe() → WorkerClient::query_worker → record load and capacity / mark unavailable
//!   └── heartbeat() / try_reserve() / release()
//!
//! WorkerClient (trait)
//!   └── HttpWorkerClient: GET /api/v1/status, POST /api/v1/executions
//! ```
//!
//! An unreachable worker is skipped, not retried in place: it sits out for
//! the configured retry interval, or until it heartbeats, and is then
//! probed again by the next dispatch pass.

pub mod client;
pub mod pool;

pub use client::{
    ExecutionPayload, HttpWorkerClient, StartedExecution, WorkerClient, WorkerError,
    WorkerFuture, WorkerResult, WorkerStatus,
};
pub use pool::{WorkerPool, WorkerSnapshot};
