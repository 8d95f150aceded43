//! tilegrid-scheduler — per-stage tile reconciliation and dispatch.
//!
//! Keeps every stage's tile table in step with its upstream and hands
//! ready tiles to workers within their capacity.
//!
//! # Architecture
//!
//! ```text
//! SchedulerHub (one per daemon)
//!   ├── registry: target → SchedulerHandle
//!   └── SchedulerSpawner → PipelineScheduler per project / stage
//!       ├── StageStrategy::resolve_input_output (map or adjacency)
//!       ├── mux::diff + mux::apply
//!       ├── queue::materialize
//!       └── Dispatcher (WorkerPool + WorkerClient), if processing
//!
//! ConnectorCache     lazily built per-owner StageConnectors
//! completion         worker reports → execution + tile status
//! admin              operator status changes and processing flags
//! ```

pub mod adjacency;
pub mod admin;
pub mod completion;
pub mod connectors;
pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod hub;
pub mod mux;
pub mod params;
pub mod queue;
pub mod scheduler;
pub mod status;
pub mod strategy;

pub use admin::Admin;
pub use completion::{CompletionOutcome, CompletionReport, on_task_execution_complete};
pub use connectors::{ConnectorCache, ConnectorFactory, LazyMap};
pub use dispatcher::{DispatchReport, Dispatcher, StageContext};
pub use error::{SchedulerError, SchedulerResult};
pub use handle::{InProcessSpawner, SchedulerHandle, SchedulerSpawner};
pub use hub::{HubReport, SchedulerHub};
pub use scheduler::{
    MANIFEST_FILE, PipelineScheduler, ScheduleTarget, SchedulerContext, SchedulerSettings,
    TickReport,
};
pub use strategy::StageStrategy;
