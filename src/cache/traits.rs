//! External collaborator interfaces.
//!
//! The engine is specified against these seams: the wire transport, the
//! slave-side backup replicator, the byte-buffer storage allocator, the
//! reference-id allocator, the cluster membership view and the outbound
//! listener surface. Production deployments plug real implementations in;
//! the provided in-process defaults cover tests and single-node use.

use std::sync::Mutex;

use crate::cache::error::NodeNotFound;
use crate::cache::message::Message;
use crate::cache::types::{LineId, NodeId};

/// The wire transport. Delivers messages from a given sender in send order
/// and reports departed targets synchronously via [`NodeNotFound`].
pub trait Comm: Send + Sync {
    fn send(&self, msg: &Message) -> Result<(), NodeNotFound>;

    /// When true, broadcasts are routed through the directory server instead
    /// of being multicast; the GETX wait-set rule special-cases this.
    fn is_send_to_server_instead_of_multicast(&self) -> bool {
        false
    }
}

/// Sink for owner-directed user messages (MSG) and node-level MSGACKs.
pub trait MessageReceiver: Send + Sync {
    fn receive(&self, msg: Message);
}

/// The slave-side backup replication channel.
pub trait Backup: Send + Sync {
    fn start_backup(&self);
    fn backup(&self, id: LineId, version: u64);
    fn end_backup(&self);
    fn flush(&self);
    /// Asks the slave to drop its view of `id` on behalf of `sharer`.
    /// Returns true iff the slave is guaranteed to have no stale view.
    fn inv(&self, id: LineId, sharer: NodeId) -> bool;
    /// Inbound BACKUP_PACKETACK messages are routed here.
    fn receive(&self, msg: Message);
}

/// Byte-buffer allocator backing line payloads.
pub trait CacheStorage: Send + Sync {
    fn allocate_storage(&self, len: usize) -> Vec<u8>;
    fn deallocate_storage(&self, id: LineId, buffer: Vec<u8>);
}

/// Allocator of fresh reference ids. Returns `None` while unready; parked
/// PUT/ALLOC ops are re-run when the engine is told the allocator is ready.
pub trait IdAllocator: Send + Sync {
    fn allocate_ids(&self, count: u64) -> Option<LineId>;
}

/// The cluster membership view.
pub trait Cluster: Send + Sync {
    fn my_node_id(&self) -> NodeId;
    fn is_master(&self) -> bool;
    fn has_server(&self) -> bool;
    /// The master currently backing `node`, or `None` if the node is not a
    /// known cluster member.
    fn get_master(&self, node: NodeId) -> Option<NodeId>;
}

/// Outbound cache event listener. Errors must not propagate into the engine;
/// they are caught and logged.
pub trait CacheListener: Send + Sync {
    fn invalidated(&self, id: LineId);
    fn received(&self, id: LineId, version: u64, data: Option<&[u8]>);
    fn evicted(&self, id: LineId);
}

/// Plain heap-backed storage. Suitable for tests and single-process use.
#[derive(Debug, Default)]
pub struct HeapStorage;

impl CacheStorage for HeapStorage {
    fn allocate_storage(&self, len: usize) -> Vec<u8> {
        Vec::with_capacity(len)
    }

    fn deallocate_storage(&self, _id: LineId, _buffer: Vec<u8>) {}
}

/// Backup channel for deployments without a slave. `inv` reports the slave
/// clean unconditionally.
#[derive(Debug, Default)]
pub struct NullBackup;

impl Backup for NullBackup {
    fn start_backup(&self) {}
    fn backup(&self, _id: LineId, _version: u64) {}
    fn end_backup(&self) {}
    fn flush(&self) {}
    fn inv(&self, _id: LineId, _sharer: NodeId) -> bool {
        true
    }
    fn receive(&self, _msg: Message) {}
}

/// Serial in-process id allocator starting above the reserved range.
#[derive(Debug)]
pub struct SerialIdAllocator {
    next: Mutex<LineId>,
}

impl Default for SerialIdAllocator {
    fn default() -> Self {
        Self {
            next: Mutex::new(crate::cache::types::MAX_RESERVED_ID + 1),
        }
    }
}

impl IdAllocator for SerialIdAllocator {
    fn allocate_ids(&self, count: u64) -> Option<LineId> {
        let mut next = self.next.lock().ok()?;
        let first = *next;
        *next += count;
        Some(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_allocator_consecutive() {
        let alloc = SerialIdAllocator::default();
        let a = alloc.allocate_ids(3).unwrap();
        let b = alloc.allocate_ids(1).unwrap();
        assert_eq!(b, a + 3);
        assert!(a > crate::cache::types::MAX_RESERVED_ID);
    }
}
