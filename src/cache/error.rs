//! Error types for cache operations.

use std::fmt;

use crate::cache::types::LineId;

/// Errors surfaced to callers of cache operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The operation did not complete within the configured timeout.
    Timeout,
    /// The line is deleted or was never allocated at the directory.
    RefNotFound(LineId),
    /// Grid operations are not allowed while the local node is a slave.
    NotMaster,
    /// A write payload exceeded the configured maximum item size.
    SizeExceeded { size: usize, max: usize },
    /// A blocking operation was attempted on a transport thread.
    CommThreadBlocked,
    /// The engine was constructed with an invalid configuration.
    InvalidConfiguration(String),
    /// Rollback was requested but the cache is configured without rollback support.
    RollbackUnsupported,
    /// An internal invariant was violated.
    Internal,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Timeout => write!(f, "Operation timed out"),
            CacheError::RefNotFound(id) => write!(f, "Line {:#x} not found", id),
            CacheError::NotMaster => {
                write!(f, "Node is a slave. Cannot run grid operations")
            }
            CacheError::SizeExceeded { size, max } => write!(
                f,
                "Data size is {} bytes and exceeds the limit of {} bytes",
                size, max
            ),
            CacheError::CommThreadBlocked => {
                write!(f, "This operation blocks a comm thread")
            }
            CacheError::InvalidConfiguration(msg) => {
                write!(f, "Invalid configuration: {}", msg)
            }
            CacheError::RollbackUnsupported => {
                write!(f, "Cache configured to not support rollbacks")
            }
            CacheError::Internal => write!(f, "Internal error"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Raised by the transport when the target node has left the cluster. The
/// engine reacts by synthesizing a locally-delivered auto-response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeNotFound(pub crate::cache::types::NodeId);

impl fmt::Display for NodeNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node {} not found", self.0)
    }
}

impl std::error::Error for NodeNotFound {}
