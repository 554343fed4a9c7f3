//! Gridline - distributed shared object cache for peer-to-peer clusters.
//!
//! Each node caches variable-size opaque data items ("lines") identified by
//! 64-bit reference ids; the cluster maintains coherence under a
//! directory-based MOESI-style protocol adapted to the network setting. The
//! crate implements the per-node coherence engine:
//!
//! - **State machine**: I < S < O < E transitions driven by local operations
//!   and inbound coherence messages
//! - **Line tables**: unbounded owned map plus a weight-bounded shared table
//!   with concurrent LRU eviction
//! - **Pending queues**: deferred ops and messages drained on state changes
//! - **Transactions**: multi-line locking with rollback journals and backup
//!   flushes on commit
//! - **Dirty reads**: per-owner clocks proving when an invalidated line's
//!   last known data is still safe to return
//! - **Node events**: sweeps repairing every line when a peer dies or fails
//!   over to its slave
//!
//! The wire transport, backup replicator, storage allocator, id allocator
//! and cluster membership are external collaborators behind the traits in
//! [`cache::traits`].

pub mod gridline;
pub mod prelude;

pub mod cache;

pub use cache::coherence::mark_comm_thread;
pub use gridline::{Gridline, GridlineBuilder};
pub use prelude::*;
