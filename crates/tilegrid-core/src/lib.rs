//! tilegrid-core — shared configuration and the task argument grammar.

pub mod args;
pub mod config;

pub use args::{ArgumentKind, ArgumentToken, tokenize};
pub use config::{
    IngressConfig, LogConfig, SchedulerConfig, StoreConfig, TileGridConfig, WorkerConfig,
    parse_duration,
};
