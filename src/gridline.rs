//! Simple public API for the Gridline distributed cache.
//!
//! [`Gridline`] wraps the coherence engine with a typed operation surface;
//! [`GridlineBuilder`] wires the external collaborators (cluster view,
//! transport, backup channel, storage and id allocation) and validates the
//! configuration before construction. The hosting process feeds inbound
//! messages and cluster events through [`Gridline::receive`],
//! [`Gridline::node_removed`] and friends.

use std::sync::Arc;

use crate::cache::coherence::CoherenceEngine;
use crate::cache::config::CacheConfig;
use crate::cache::error::CacheError;
use crate::cache::line::LineView;
use crate::cache::message::{Message, MessageKind};
use crate::cache::monitor::{CacheMonitor, CacheStats, NoopMonitor, StatsMonitor};
use crate::cache::ops::{OpExtra, OpFuture, OpKind, OpValue};
use crate::cache::traits::{
    Backup, CacheListener, CacheStorage, Cluster, Comm, HeapStorage, IdAllocator, MessageReceiver,
    NullBackup, SerialIdAllocator,
};
use crate::cache::txn::Transaction;
use crate::cache::types::{LineId, NO_NODE, NodeId, State};

/// Builder for [`Gridline`].
pub struct GridlineBuilder {
    config: CacheConfig,
    cluster: Option<Arc<dyn Cluster>>,
    comm: Option<Arc<dyn Comm>>,
    backup: Arc<dyn Backup>,
    storage: Arc<dyn CacheStorage>,
    id_allocator: Arc<dyn IdAllocator>,
    stats: Option<Arc<StatsMonitor>>,
}

impl Default for GridlineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GridlineBuilder {
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            cluster: None,
            comm: None,
            backup: Arc::new(NullBackup),
            storage: Arc::new(HeapStorage),
            id_allocator: Arc::new(SerialIdAllocator::default()),
            stats: None,
        }
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.timeout_ms = timeout_ms;
        self
    }

    pub fn max_item_size(mut self, bytes: usize) -> Self {
        self.config.max_item_size = bytes;
        self
    }

    pub fn max_capacity(mut self, weighted: u64) -> Self {
        self.config.max_capacity = weighted;
        self
    }

    pub fn compare_before_write(mut self, value: bool) -> Self {
        self.config.compare_before_write = value;
        self
    }

    pub fn rollback_supported(mut self, value: bool) -> Self {
        self.config.rollback_supported = value;
        self
    }

    pub fn dirty_reads(mut self, value: bool) -> Self {
        self.config.dirty_reads = value;
        self
    }

    pub fn reuse_lines(mut self, value: bool) -> Self {
        self.config.reuse_lines = value;
        self
    }

    pub fn reuse_sharer_sets(mut self, value: bool) -> Self {
        self.config.reuse_sharer_sets = value;
        self
    }

    pub fn cluster(mut self, cluster: Arc<dyn Cluster>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn comm(mut self, comm: Arc<dyn Comm>) -> Self {
        self.comm = Some(comm);
        self
    }

    pub fn backup(mut self, backup: Arc<dyn Backup>) -> Self {
        self.backup = backup;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn CacheStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn id_allocator(mut self, id_allocator: Arc<dyn IdAllocator>) -> Self {
        self.id_allocator = id_allocator;
        self
    }

    /// Collect statistics; exposed through [`Gridline::stats`].
    pub fn with_stats(mut self) -> Self {
        self.stats = Some(Arc::new(StatsMonitor::new()));
        self
    }

    pub fn build(self) -> Result<Gridline, CacheError> {
        let cluster = self.cluster.ok_or_else(|| {
            CacheError::InvalidConfiguration("a cluster view is required".to_string())
        })?;
        let comm = self.comm.ok_or_else(|| {
            CacheError::InvalidConfiguration("a transport is required".to_string())
        })?;
        let monitor: Arc<dyn CacheMonitor> = match &self.stats {
            Some(stats) => stats.clone(),
            None => Arc::new(NoopMonitor),
        };
        let engine = CoherenceEngine::new(
            self.config,
            cluster,
            comm,
            self.backup,
            self.storage,
            self.id_allocator,
            monitor,
        )?;
        Ok(Gridline {
            engine: Arc::new(engine),
            stats: self.stats,
        })
    }
}

/// A node's handle on the distributed shared object cache.
#[derive(Clone)]
pub struct Gridline {
    engine: Arc<CoherenceEngine>,
    stats: Option<Arc<StatsMonitor>>,
}

impl Gridline {
    pub fn builder() -> GridlineBuilder {
        GridlineBuilder::new()
    }

    /// The underlying engine, for transports and cluster glue that deliver
    /// straight into it.
    pub fn engine(&self) -> &Arc<CoherenceEngine> {
        &self.engine
    }

    // ------------------------------------------------------------ grid ops

    /// Reads a line, fetching a shared copy if necessary.
    pub fn get(&self, id: LineId) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self
            .engine
            .do_op(OpKind::Get, id, None, OpExtra::None, None)?
            .into_data())
    }

    /// As [`get`](Self::get), trying `node` first when the owner is unknown.
    pub fn get_with_hint(&self, id: LineId, node: NodeId) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self
            .engine
            .do_op(OpKind::Get, id, None, OpExtra::NodeHint(node), None)?
            .into_data())
    }

    /// Reads a line and locks it under the transaction.
    pub fn gets(
        &self,
        id: LineId,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self
            .engine
            .do_op(OpKind::GetS, id, None, OpExtra::None, txn.cloned())?
            .into_data())
    }

    /// Acquires exclusive ownership, locks the line and returns its data.
    pub fn getx(
        &self,
        id: LineId,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self
            .engine
            .do_op(OpKind::GetX, id, None, OpExtra::None, txn.cloned())?
            .into_data())
    }

    /// Writes a line, acquiring exclusive ownership first.
    pub fn set(
        &self,
        id: LineId,
        data: &[u8],
        txn: Option<&Arc<Transaction>>,
    ) -> Result<(), CacheError> {
        self.engine
            .do_op(OpKind::Set, id, Some(data.to_vec()), OpExtra::None, txn.cloned())?;
        Ok(())
    }

    /// Deletes a line. With a directory present the server is notified and
    /// remote replicas observe NOT_FOUND.
    pub fn del(&self, id: LineId, txn: Option<&Arc<Transaction>>) -> Result<(), CacheError> {
        self.engine
            .do_op(OpKind::Del, id, None, OpExtra::None, txn.cloned())?;
        Ok(())
    }

    /// Allocates a fresh id and stores `data` in a new exclusively-owned,
    /// locked line. Release the line (or commit the transaction) to publish.
    pub fn put(&self, data: &[u8], txn: Option<&Arc<Transaction>>) -> Result<LineId, CacheError> {
        match self
            .engine
            .do_op(OpKind::Put, 0, Some(data.to_vec()), OpExtra::None, txn.cloned())?
        {
            OpValue::Id(id) => Ok(id),
            _ => Err(CacheError::Internal),
        }
    }

    /// Allocates `count` consecutive ids, each backing a fresh owned line.
    pub fn alloc(&self, count: u64, txn: Option<&Arc<Transaction>>) -> Result<LineId, CacheError> {
        match self
            .engine
            .do_op(OpKind::Alloc, 0, None, OpExtra::Count(count), txn.cloned())?
        {
            OpValue::Id(id) => Ok(id),
            _ => Err(CacheError::Internal),
        }
    }

    /// Proactively replicates an owned line to `nodes`.
    pub fn push(&self, id: LineId, nodes: &[NodeId]) -> Result<(), CacheError> {
        self.engine
            .do_op(OpKind::Push, id, None, OpExtra::Nodes(nodes.to_vec()), None)?;
        Ok(())
    }

    /// Transfers exclusive ownership of a line to `node`.
    pub fn push_exclusive(&self, id: LineId, node: NodeId) -> Result<(), CacheError> {
        self.engine
            .do_op(OpKind::PushX, id, None, OpExtra::Node(node), None)?;
        Ok(())
    }

    /// Routes a user message to the line's owner; completes when the owner
    /// acknowledges delivery.
    pub fn send_to_owner(&self, id: LineId, data: Vec<u8>) -> Result<(), CacheError> {
        let msg = self.engine.msg(
            NO_NODE,
            MessageKind::Msg {
                line: id,
                data,
                reply_required: true,
            },
        );
        self.engine
            .do_op(OpKind::Send, id, None, OpExtra::Msg(msg), None)?;
        Ok(())
    }

    /// Installs a per-line listener.
    pub fn listen(&self, id: LineId, listener: Arc<dyn CacheListener>) -> Result<(), CacheError> {
        self.engine
            .do_op(OpKind::Listen, id, None, OpExtra::Listener(listener), None)?;
        Ok(())
    }

    // --------------------------------------------------------- async track

    pub fn get_async(&self, id: LineId) -> Result<OpFuture, CacheError> {
        self.engine
            .do_op_async(OpKind::Get, id, None, OpExtra::None, None)
    }

    pub fn getx_async(
        &self,
        id: LineId,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<OpFuture, CacheError> {
        self.engine
            .do_op_async(OpKind::GetX, id, None, OpExtra::None, txn.cloned())
    }

    pub fn set_async(
        &self,
        id: LineId,
        data: &[u8],
        txn: Option<&Arc<Transaction>>,
    ) -> Result<OpFuture, CacheError> {
        self.engine.do_op_async(
            OpKind::Set,
            id,
            Some(data.to_vec()),
            OpExtra::None,
            txn.cloned(),
        )
    }

    // --------------------------------------------------------- transactions

    pub fn begin_transaction(&self) -> Arc<Transaction> {
        self.engine.begin_transaction()
    }

    /// Commits: unlocks every line, backing up the modified ones. The first
    /// op error is re-raised after cleanup.
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<(), CacheError> {
        self.engine.end_transaction(txn, false)
    }

    /// Rolls back every recorded write, then unlocks.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<(), CacheError> {
        self.engine.rollback(txn)?;
        self.engine.end_transaction(txn, true)
    }

    /// Releases a single line locked outside a transaction.
    pub fn release(&self, id: LineId) {
        self.engine.release(id)
    }

    // ----------------------------------------------------------- inbound edge

    /// Delivers an inbound coherence message from the transport.
    pub fn receive(&self, msg: Message) {
        self.engine.receive(msg)
    }

    pub fn node_added(&self, node: NodeId) {
        self.engine.node_added(node)
    }

    pub fn node_removed(&self, node: NodeId) {
        self.engine.node_removed(node)
    }

    pub fn node_switched(&self, node: NodeId) {
        self.engine.node_switched(node)
    }

    /// Re-runs PUT/ALLOC ops parked while the id allocator was unready.
    pub fn allocator_ready(&self) {
        self.engine.allocator_ready()
    }

    /// Installs the sink for owner-directed user messages.
    pub fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        self.engine.set_receiver(receiver)
    }

    // -------------------------------------------------------- introspection

    pub fn add_cache_listener(&self, listener: Arc<dyn CacheListener>) {
        self.engine.add_cache_listener(listener)
    }

    pub fn remove_cache_listener(&self, listener: &Arc<dyn CacheListener>) {
        self.engine.remove_cache_listener(listener)
    }

    pub fn is_locked(&self, id: LineId) -> bool {
        self.engine.is_locked(id)
    }

    pub fn state_of(&self, id: LineId) -> Option<State> {
        self.engine.state_of(id)
    }

    pub fn inspect(&self, id: LineId) -> Option<LineView> {
        self.engine.inspect(id)
    }

    pub fn has_server(&self) -> bool {
        self.engine.has_server()
    }

    /// Statistics snapshot; present when built with
    /// [`GridlineBuilder::with_stats`].
    pub fn stats(&self) -> Option<CacheStats> {
        self.stats.as_ref().map(|s| s.snapshot())
    }
}
