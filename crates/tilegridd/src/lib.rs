//! tilegridd — the TileGrid daemon.
//!
//! Assembles the scheduling engine into one process:
//! - State store (redb)
//! - Worker pool seeded from config and the store
//! - Scheduler hub running one scheduler per project and stage
//! - HTTP ingress for worker completions, heartbeats and admin actions

pub mod daemon;
pub mod ingress;
