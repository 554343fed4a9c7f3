//! Gridline prelude - convenient imports for users.

// Re-export the public API
pub use crate::gridline::{Gridline, GridlineBuilder};

// Re-export essential error types that users might need
pub use crate::cache::error::{CacheError, NodeNotFound};

// Core identifier and protocol types
pub use crate::cache::types::{LineId, MAX_RESERVED_ID, NO_NODE, NodeId, SERVER, State, is_reserved};

// Wire messages and configuration
pub use crate::cache::config::CacheConfig;
pub use crate::cache::message::{Message, MessageKind};

// External collaborator traits users plug implementations into
pub use crate::cache::traits::{
    Backup, CacheListener, CacheStorage, Cluster, Comm, HeapStorage, IdAllocator, MessageReceiver,
    NullBackup, SerialIdAllocator,
};

// Transactions and introspection
pub use crate::cache::line::LineView;
pub use crate::cache::monitor::{CacheMonitor, CacheStats, MessageDelayReason, NoopMonitor, StatsMonitor};
pub use crate::cache::ops::OpFuture;
pub use crate::cache::txn::Transaction;
