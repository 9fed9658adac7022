//! Warden keeps a per-node, eventually-consistent replica of every running
//! function instance and reconciles the registry when nodes or schedulers
//! fail.
//!
//! The moving parts:
//!
//! - [`meta`] - the metadata-store contract (etcd-like revisions, watches,
//!   compare-and-swap writes), the key layout, an embedded in-memory store
//!   and the operation replay buffer.
//! - [`registry`] - instance records, the local replica with its secondary
//!   indices, and the parent/child family tracker.
//! - [`sync`] - bootstrap-then-watch replication with per-instance revision
//!   fencing, plus the periodic resync and replay safety net.
//! - [`reconcile`] - the serialized control task, the leader/follower
//!   business split and the kill coordinator.
//! - [`placement`] - the boundary to the placement layer that actually
//!   schedules instances and carries signals to nodes.
//!
//! Everything stateful runs inside one control task; store and placement
//! I/O happens in spawned tasks whose outcomes re-enter through the command
//! queue. Recovery actions are idempotent and converge under retries, never
//! exactly-once.

pub mod cli;
pub mod core;
pub mod meta;
pub mod placement;
pub mod reconcile;
pub mod registry;
pub mod sync;

pub use crate::core::config::Config;
pub use crate::core::error::{WardenError, WardenResult};
pub use crate::core::runtime::Warden;
