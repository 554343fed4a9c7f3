//! The per-node coherence engine: dispatch tracks, pending-work queues and
//! the send/receive edges.
//!
//! Operations enter on the fast track (resolved on the caller's thread with
//! no record allocation) or the slow track (a deferred [`Op`] with a future).
//! Inbound messages are routed per-line into the state machine; every state
//! or flag change drains the line's pending ops and, when the line is neither
//! locked nor modified, its pending messages.
//!
//! Rust mutexes are not reentrant, so every entry point runs inside a
//! dispatch region: messages the engine sends to itself while a line lock is
//! held are parked in a per-thread queue and drained outermost-first once all
//! locks are released.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use dashmap::DashMap;
use log::{debug, info, warn};

use crate::cache::config::CacheConfig;
use crate::cache::coherence::dirty_reads::DirtyReadTracker;
use crate::cache::coherence::node_events::NodeEvent;
use crate::cache::error::CacheError;
use crate::cache::line::{CacheLine, LineInner, LineView};
use crate::cache::message::{Message, MessageKind};
use crate::cache::monitor::{CacheMonitor, MessageDelayReason};
use crate::cache::ops::{Op, OpExtra, OpFuture, OpKind, OpValue};
use crate::cache::store::LineStore;
use crate::cache::traits::{
    Backup, CacheListener, CacheStorage, Cluster, Comm, IdAllocator, MessageReceiver,
};
use crate::cache::txn::Transaction;
use crate::cache::types::{
    Change, LINE_EVERYTHING_CHANGED, LINE_MODIFIED_CHANGED, LINE_NO_CHANGE, LINE_STATE_CHANGED,
    LineId, NO_LINE, NO_NODE, NodeId, State, flags,
};

thread_local! {
    static RECURSIVE: Cell<bool> = const { Cell::new(false) };
    static IN_NODE_EVENT: Cell<bool> = const { Cell::new(false) };
    static COMM_THREAD: Cell<bool> = const { Cell::new(false) };
    static SHORT_CIRCUIT: RefCell<VecDeque<Message>> = const { RefCell::new(VecDeque::new()) };
}

/// Marks the current thread as a transport thread. Blocking operations on
/// such threads fail with [`CacheError::CommThreadBlocked`] instead of
/// stalling message delivery.
pub fn mark_comm_thread() {
    COMM_THREAD.set(true);
}

fn is_comm_thread() -> bool {
    COMM_THREAD.get()
}

pub(crate) fn in_node_event_handler() -> bool {
    IN_NODE_EVENT.get()
}

pub(crate) fn set_in_node_event_handler(value: bool) {
    IN_NODE_EVENT.set(value);
}

/// Result of running an op against the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RunResult {
    /// The op cannot complete yet and stays (or becomes) pending.
    Pending,
    Done(OpValue),
}

/// The per-node coherence engine.
pub struct CoherenceEngine {
    config: CacheConfig,
    cluster: Arc<dyn Cluster>,
    comm: Arc<dyn Comm>,
    backup: Arc<dyn Backup>,
    storage: Arc<dyn CacheStorage>,
    id_allocator: Arc<dyn IdAllocator>,
    monitor: Arc<dyn CacheMonitor>,
    receiver: RwLock<Option<Arc<dyn MessageReceiver>>>,
    has_server: bool,
    broadcasts_routed_to_server: bool,
    pub(crate) store: LineStore,
    pub(crate) pending_ops: DashMap<LineId, Vec<Op>>,
    pending_messages: DashMap<LineId, Vec<Message>>,
    pending_allocs: Mutex<Vec<Op>>,
    pub(crate) dirty: DirtyReadTracker,
    pub(crate) node_events: Mutex<Vec<NodeEvent>>,
    listeners: RwLock<Vec<Arc<dyn CacheListener>>>,
    next_message_id: AtomicI64,
}

impl CoherenceEngine {
    pub fn new(
        config: CacheConfig,
        cluster: Arc<dyn Cluster>,
        comm: Arc<dyn Comm>,
        backup: Arc<dyn Backup>,
        storage: Arc<dyn CacheStorage>,
        id_allocator: Arc<dyn IdAllocator>,
        monitor: Arc<dyn CacheMonitor>,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        let has_server = cluster.has_server();
        let broadcasts_routed_to_server =
            has_server && comm.is_send_to_server_instead_of_multicast();
        Ok(Self {
            store: LineStore::new(&config),
            dirty: DirtyReadTracker::new(config.dirty_reads),
            config,
            cluster,
            comm,
            backup,
            storage,
            id_allocator,
            monitor,
            receiver: RwLock::new(None),
            has_server,
            broadcasts_routed_to_server,
            pending_ops: DashMap::new(),
            pending_messages: DashMap::new(),
            pending_allocs: Mutex::new(Vec::new()),
            node_events: Mutex::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            next_message_id: AtomicI64::new(1),
        })
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn cluster(&self) -> &dyn Cluster {
        &*self.cluster
    }

    pub(crate) fn backup(&self) -> &dyn Backup {
        &*self.backup
    }

    pub(crate) fn storage(&self) -> &dyn CacheStorage {
        &*self.storage
    }

    pub(crate) fn id_allocator(&self) -> &dyn IdAllocator {
        &*self.id_allocator
    }

    pub(crate) fn monitor(&self) -> &dyn CacheMonitor {
        &*self.monitor
    }

    pub(crate) fn my_node_id(&self) -> NodeId {
        self.cluster.my_node_id()
    }

    pub fn has_server(&self) -> bool {
        self.has_server
    }

    pub(crate) fn broadcasts_routed_to_server(&self) -> bool {
        self.broadcasts_routed_to_server
    }

    /// Installs the sink for owner-directed user messages.
    pub fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        if let Ok(mut slot) = self.receiver.write() {
            *slot = Some(receiver);
        }
    }

    fn receiver(&self) -> Option<Arc<dyn MessageReceiver>> {
        self.receiver.read().ok().and_then(|r| r.clone())
    }

    pub fn add_cache_listener(&self, listener: Arc<dyn CacheListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    pub fn remove_cache_listener(&self, listener: &Arc<dyn CacheListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn CacheListener>> {
        self.listeners
            .read()
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    // ---------------------------------------------------------------- lookup

    pub(crate) fn get_line(&self, id: LineId) -> Option<Arc<CacheLine>> {
        self.store.get_line(id)
    }

    pub(crate) fn get_or_create_line(&self, id: LineId) -> Arc<CacheLine> {
        if let Some(line) = self.store.get_line(id) {
            return line;
        }
        let line = self.store.allocate_line(id);
        if let Some(existing) = self.store.shared.insert_if_absent(id, line.clone(), 1) {
            self.store.recycle_line(line);
            return existing;
        }
        self.evict_as_needed(id);
        line
    }

    /// True when the line is pinned by a lock or transaction.
    pub fn is_locked(&self, id: LineId) -> bool {
        self.get_line(id)
            .map(|line| line.lock().is_locked())
            .unwrap_or(false)
    }

    pub fn state_of(&self, id: LineId) -> Option<State> {
        self.get_line(id).map(|line| line.lock().state)
    }

    /// Read-only snapshot of a line's record.
    pub fn inspect(&self, id: LineId) -> Option<LineView> {
        self.get_line(id).map(|line| LineView::of(&line.lock()))
    }

    // ------------------------------------------------------------- dispatch

    /// Runs `f` inside a dispatch region. Self-addressed messages produced by
    /// `f` are parked and drained, outermost-first, after `f` returns and all
    /// line locks are released.
    pub(crate) fn in_dispatch<R>(&self, f: impl FnOnce() -> R) -> R {
        if RECURSIVE.get() {
            return f();
        }
        RECURSIVE.set(true);
        let result = f();
        self.drain_short_circuit();
        RECURSIVE.set(false);
        result
    }

    fn drain_short_circuit(&self) {
        loop {
            let Some(msg) = SHORT_CIRCUIT.with_borrow_mut(|q| q.pop_front()) else {
                return;
            };
            self.receive1(msg);
        }
    }

    /// Runs an operation, blocking up to the configured timeout if it cannot
    /// complete immediately.
    pub fn do_op(
        &self,
        kind: OpKind,
        id: LineId,
        data: Option<Vec<u8>>,
        extra: OpExtra,
        txn: Option<Arc<Transaction>>,
    ) -> Result<OpValue, CacheError> {
        if !self.cluster.is_master() && kind != OpKind::Listen {
            return Err(CacheError::NotMaster);
        }
        debug!("Run(fast): Op::{:?}(line:{:#x})", kind, id);
        let fast =
            self.in_dispatch(|| self.run_fast_track(id, kind, data.as_deref(), &extra, txn.as_ref()))?;
        match fast {
            RunResult::Done(v) => Ok(v),
            RunResult::Pending => {
                if is_comm_thread() {
                    return Err(CacheError::CommThreadBlocked);
                }
                self.do_op_slow(Op::new(kind, id, data, extra, txn))
            }
        }
    }

    /// Future-returning variant of [`do_op`](Self::do_op). Synchronous
    /// completions yield an already-resolved future.
    pub fn do_op_async(
        &self,
        kind: OpKind,
        id: LineId,
        data: Option<Vec<u8>>,
        extra: OpExtra,
        txn: Option<Arc<Transaction>>,
    ) -> Result<OpFuture, CacheError> {
        if !self.cluster.is_master() && kind != OpKind::Listen {
            return Err(CacheError::NotMaster);
        }
        debug!("Run(fast): Op::{:?}(line:{:#x})", kind, id);
        let fast =
            self.in_dispatch(|| self.run_fast_track(id, kind, data.as_deref(), &extra, txn.as_ref()))?;
        match fast {
            RunResult::Done(v) => Ok(OpFuture::ready(Ok(v))),
            RunResult::Pending => {
                let op = Op::new(kind, id, data, extra, txn);
                if let Some(txn) = op.txn() {
                    txn.add_op(op.clone());
                }
                match self.in_dispatch(|| self.run_op(&op))? {
                    RunResult::Done(v) => Ok(OpFuture::ready(Ok(v))),
                    RunResult::Pending => Ok(op.ensure_future().clone()),
                }
            }
        }
    }

    fn do_op_slow(&self, op: Op) -> Result<OpValue, CacheError> {
        if let Some(txn) = op.txn() {
            txn.add_op(op.clone());
        }
        match self.in_dispatch(|| self.run_op(&op))? {
            RunResult::Done(v) => Ok(v),
            RunResult::Pending => {
                let future = op.ensure_future().clone();
                future.get(self.config.timeout())
            }
        }
    }

    /// Attempts to resolve the op without allocating a record. Returns
    /// `Pending` when a record (and possibly a wait) is required.
    fn run_fast_track(
        &self,
        id: LineId,
        kind: OpKind,
        data: Option<&[u8]>,
        extra: &OpExtra,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<RunResult, CacheError> {
        if !kind.is_fast_track() {
            return Ok(RunResult::Pending);
        }
        let Some(line) = self.get_line(id) else {
            return Ok(match self.handle_op_no_line(kind, id) {
                Some(v) => RunResult::Done(v),
                None => RunResult::Pending,
            });
        };

        let res = {
            let mut l = line.lock();
            self.handle_op_line(&line, &mut l, kind, data, extra, txn, false, LINE_EVERYTHING_CHANGED)?
        };
        if let RunResult::Done(_) = res {
            self.monitor.add_op(kind, 0);
        }
        Ok(res)
    }

    pub(crate) fn run_op(&self, op: &Op) -> Result<RunResult, CacheError> {
        debug!("Run: {:?}", op);
        if matches!(op.kind(), OpKind::Put | OpKind::Alloc) {
            return self.exec_alloc_op(op);
        }

        let id = op.line();
        let line = match self.get_line(id) {
            Some(line) => line,
            None => {
                if let Some(v) = self.handle_op_no_line(op.kind(), id) {
                    self.complete_op(op, &v, false);
                    return Ok(RunResult::Done(v));
                }
                self.get_or_create_line(id)
            }
        };

        let mut l = line.lock();
        self.exec_op(op, &line, &mut l)
    }

    fn exec_op(
        &self,
        op: &Op,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
    ) -> Result<RunResult, CacheError> {
        let res = self.handle_op_line(
            line,
            l,
            op.kind(),
            op.data(),
            op.extra(),
            op.txn(),
            false,
            LINE_EVERYTHING_CHANGED,
        );
        match res {
            Ok(RunResult::Pending) => {
                op.set_start(Instant::now());
                debug!("Adding op to pending {:?} on line {:?}", op, l);
                self.add_pending_op(op);
                Ok(RunResult::Pending)
            }
            Ok(RunResult::Done(v)) => {
                self.complete_op(op, &v, false);
                Ok(RunResult::Done(v))
            }
            Err(e) => {
                if op.has_future() {
                    op.fail(e);
                    Ok(RunResult::Done(OpValue::Unit))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Runs the state machine for one op against a line. `change` is the
    /// change mask of the event that triggered re-evaluation; fresh ops pass
    /// [`LINE_EVERYTHING_CHANGED`].
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn handle_op_line(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        kind: OpKind,
        data: Option<&[u8]>,
        extra: &OpExtra,
        txn: Option<&Arc<Transaction>>,
        pending: bool,
        change: Change,
    ) -> Result<RunResult, CacheError> {
        self.apply_node_events(line, l);

        if self.should_hold_op(l, kind) {
            return Ok(RunResult::Pending);
        }

        let res = match kind {
            OpKind::Get | OpKind::GetS => {
                self.handle_op_get(line, l, kind, Self::node_hint(extra), txn, change)
            }
            OpKind::GetX => self.handle_op_getx(line, l, Self::node_hint(extra), txn, change),
            OpKind::Set => self.handle_op_set(line, l, data, Self::node_hint(extra), txn, change),
            OpKind::Del => self.handle_op_del(line, l, Self::node_hint(extra), txn, change),
            OpKind::Send => self.handle_op_send(line, l, extra, change),
            OpKind::Push => self.handle_op_push(line, l, extra, change),
            OpKind::PushX => self.handle_op_pushx(line, l, extra, change),
            OpKind::Listen => self.handle_op_listen(l, extra),
            // PUT/ALLOC are routed through exec_alloc_op and never get here
            OpKind::Put | OpKind::Alloc => Ok(RunResult::Pending),
        }?;

        if !pending && kind.is_hit_or_miss() && res != RunResult::Pending {
            if l.state == State::I {
                self.monitor.add_stale_hit();
            } else {
                self.monitor.add_hit();
            }
        }
        Ok(res)
    }

    /// Handles an op whose line is absent. Returns `Some` when the op is
    /// fully handled without a line record.
    fn handle_op_no_line(&self, kind: OpKind, id: LineId) -> Option<OpValue> {
        debug!("Line {:#x} not found.", id);
        match kind {
            OpKind::Push | OpKind::PushX => {
                info!("Attempt to push line {:#x}, but line is not in cache.", id);
                Some(OpValue::Unit)
            }
            _ => None,
        }
    }

    /// An op is held back when the line has messages waiting (a locking op
    /// must let them through first) or when a push races an unfinished
    /// backup.
    fn should_hold_op(&self, l: &LineInner, kind: OpKind) -> bool {
        (self.has_pending_messages(l.id)
            && kind.is_locking()
            && !l.is_locked()
            && !(l.state != State::E && l.next_state == Some(State::E)))
            || (l.is(flags::MODIFIED) && kind.is_push())
    }

    pub(crate) fn complete_op(&self, op: &Op, value: &OpValue, pending: bool) {
        let duration = if pending { op.pending_micros() } else { 0 };
        op.complete(value.clone());
        self.monitor.add_op(op.kind(), duration);
    }

    fn node_hint(extra: &OpExtra) -> NodeId {
        match extra {
            OpExtra::NodeHint(node) => *node,
            _ => NO_NODE,
        }
    }

    // --------------------------------------------------------- pending ops

    fn add_pending_op(&self, op: &Op) {
        if op.has_future() {
            return; // already queued
        }
        op.ensure_future();
        self.pending_ops.entry(op.line()).or_default().push(op.clone());
    }

    /// Re-evaluates the line's pending ops in insertion order; ops that no
    /// longer report pending are completed and dropped from the queue.
    pub(crate) fn handle_pending_ops(&self, line: &Arc<CacheLine>, l: &mut LineInner, change: Change) {
        let Some((_, ops)) = self.pending_ops.remove(&l.id) else {
            return;
        };
        let mut still_pending = Vec::with_capacity(ops.len());
        for op in ops {
            debug!("Handling pending op {:?}, change = {}", op, change);
            match self.handle_op_line(
                line,
                l,
                op.kind(),
                op.data(),
                op.extra(),
                op.txn(),
                true,
                change,
            ) {
                Ok(RunResult::Pending) => still_pending.push(op),
                Ok(RunResult::Done(v)) => self.complete_op(&op, &v, true),
                Err(e) => op.fail(e),
            }
        }
        if !still_pending.is_empty() {
            self.pending_ops.insert(l.id, still_pending);
        }
    }

    // ----------------------------------------------------- pending messages

    pub(crate) fn add_pending_message(&self, l: &LineInner, msg: Message) {
        let mut queue = self.pending_messages.entry(l.id).or_default();
        if !queue.iter().any(|m| m.dedup_key() == msg.dedup_key()) {
            queue.push(msg);
        }
    }

    pub(crate) fn has_pending_messages(&self, id: LineId) -> bool {
        self.pending_messages
            .get(&id)
            .map(|q| !q.is_empty())
            .unwrap_or(false)
    }

    pub(crate) fn drop_pending_messages_from(&self, id: LineId, node: NodeId) {
        if let Some(mut queue) = self.pending_messages.get_mut(&id) {
            queue.retain(|m| m.node != node);
        }
    }

    fn take_pending_messages(&self, id: LineId) -> Vec<Message> {
        self.pending_messages
            .remove(&id)
            .map(|(_, q)| q)
            .unwrap_or_default()
    }

    /// Messages that mutate line state are held while the line is locked,
    /// modified, or mid-transition to E. INV passes the transition hold and
    /// is blocked only by a lock or an unfinished backup.
    pub(crate) fn should_hold_message(&self, l: &LineInner, msg: &Message) -> bool {
        let blocked_kind = matches!(
            msg.kind,
            MessageKind::Get { .. }
                | MessageKind::GetX { .. }
                | MessageKind::Inv { .. }
                | MessageKind::Put { .. }
                | MessageKind::PutX { .. }
        );
        let held = blocked_kind
            && (l.is_locked()
                || l.is(flags::MODIFIED)
                || (l.state != State::E && l.next_state == Some(State::E)));
        if held
            && matches!(msg.kind, MessageKind::Inv { .. })
            && !l.is_locked()
            && !l.is(flags::MODIFIED)
        {
            return false;
        }
        held
    }

    /// Drains and re-runs the line's pending messages, reporting the delay to
    /// the monitor, then cascades to pending ops if anything changed.
    pub(crate) fn handle_pending_messages(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        reason: MessageDelayReason,
    ) -> Change {
        let msgs = self.take_pending_messages(l.id);
        let mut change = LINE_NO_CHANGE;
        let mut count = 0usize;
        let mut total_delay = 0u64;

        for msg in msgs {
            debug!("Handling pending message {:?}", msg);
            let delay = msg
                .received_at
                .map(|t| t.elapsed().as_nanos() as u64)
                .unwrap_or(0);
            change |= self.handle_message1(line, l, msg);
            count += 1;
            total_delay += delay;
        }

        if count > 0 {
            self.monitor
                .add_message_handling_delay(count, total_delay, reason);
        }

        if change != LINE_NO_CHANGE {
            self.handle_pending_ops(line, l, change);
            self.handle_pending_messages_after_message(line, l, change);
        }
        change
    }

    pub(crate) fn handle_pending_messages_after_message(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        change: Change,
    ) {
        if l.is_locked() || l.is(flags::MODIFIED) {
            return;
        }
        let reason = if change & LINE_MODIFIED_CHANGED != 0 {
            Some(MessageDelayReason::Backup)
        } else if change & LINE_STATE_CHANGED != 0 {
            Some(MessageDelayReason::Other)
        } else {
            None
        };
        if let Some(reason) = reason {
            self.handle_pending_messages(line, l, reason);
        }
    }

    // -------------------------------------------------------------- receive

    /// Inbound edge: called by the transport (and by the engine itself for
    /// self-addressed messages). Reentrant deliveries are parked and drained
    /// after the outer dispatch completes.
    pub fn receive(&self, msg: Message) {
        if RECURSIVE.get() {
            debug!("Received short-circuit: {:?}", msg);
            SHORT_CIRCUIT.with_borrow_mut(|q| q.push_back(msg));
            return;
        }
        RECURSIVE.set(true);
        debug!("Received: {:?}", msg);
        self.receive1(msg);
        self.drain_short_circuit();
        RECURSIVE.set(false);
    }

    fn receive1(&self, mut msg: Message) {
        msg.incoming = true;
        if msg.received_at.is_none() {
            msg.received_at = Some(Instant::now());
        }
        if matches!(msg.kind, MessageKind::Msg { .. }) {
            self.handle_message_msg(msg);
            return;
        }
        if matches!(msg.kind, MessageKind::MsgAck { line } if line == NO_LINE) {
            if let Some(receiver) = self.receiver() {
                receiver.receive(msg);
            }
            return;
        }
        if matches!(msg.kind, MessageKind::BackupPacketAck { .. }) {
            self.backup.receive(msg);
            return;
        }
        self.monitor.add_message_received(&msg);
        self.run_message(msg);
    }

    fn run_message(&self, msg: Message) {
        let Some(id) = msg.line() else {
            warn!("Unhandled node-level message {:?}", msg);
            return;
        };
        let line = match self.get_line(id) {
            Some(line) => line,
            None => {
                if self.handle_message_no_line(&msg) {
                    return;
                }
                self.get_or_create_line(id)
            }
        };

        let mut l = line.lock();
        self.handle_message(&line, &mut l, msg);
    }

    fn handle_message(&self, line: &Arc<CacheLine>, l: &mut LineInner, msg: Message) {
        self.apply_node_events(line, l);
        let change = self.handle_message1(line, l, msg);
        self.handle_pending_ops(line, l, change);
        self.handle_pending_messages_after_message(line, l, change);
    }

    /// Owner-directed user messages are delivered to the registered receiver
    /// rather than the line state machine, once ownership is verified.
    fn handle_message_msg(&self, msg: Message) {
        let Some(receiver) = self.receiver() else {
            return;
        };

        self.dirty.note_put(msg.node, msg.msg_id, &*self.monitor);

        let reply_required = matches!(
            msg.kind,
            MessageKind::Msg {
                reply_required: true,
                ..
            }
        );
        let (node, msg_id) = (msg.node, msg.msg_id);

        match msg.line() {
            None => {
                receiver.receive(msg);
                if reply_required {
                    self.send(Message::new(node, msg_id, MessageKind::MsgAck { line: NO_LINE }));
                }
            }
            Some(id) => {
                let Some(line) = self.get_line(id) else {
                    let handled = self.handle_message_no_line(&msg);
                    debug_assert!(handled);
                    return;
                };
                {
                    let l = line.lock();
                    if self.handle_not_owner(&msg, Some(&*l)) {
                        return;
                    }
                }
                receiver.receive(msg);
                if reply_required {
                    self.send(Message::new(node, msg_id, MessageKind::MsgAck { line: id }));
                }
            }
        }
    }

    // ----------------------------------------------------------------- send

    /// Stamps a fresh outbound message.
    pub(crate) fn msg(&self, node: NodeId, kind: MessageKind) -> Message {
        Message::new(
            node,
            self.next_message_id.fetch_add(1, Ordering::Relaxed),
            kind,
        )
    }

    /// Sends through the transport. If the target is gone, synthesizes the
    /// auto-response and delivers it to ourselves through the short-circuit
    /// queue.
    pub(crate) fn send(&self, msg: Message) {
        debug!("Sending: {:?}", msg);
        if self.comm.send(&msg).is_err() {
            if let Some(mut response) = self.gen_response(&msg) {
                debug!("Auto response: {:?} (to: {:?})", response, msg);
                response.incoming = true;
                response.node = msg.node;
                self.receive(response);
            }
        }
        self.monitor.add_message_sent(&msg);
    }

    /// The reply a departed node can no longer give: INV is acknowledged,
    /// GET/GETX are redirected with an uncertain unknown owner.
    fn gen_response(&self, msg: &Message) -> Option<Message> {
        match msg.kind {
            MessageKind::Inv { line, .. } => Some(self.msg(NO_NODE, MessageKind::InvAck { line })),
            MessageKind::Get { line } | MessageKind::GetX { line } => Some(self.msg(
                NO_NODE,
                MessageKind::ChngdOwnr {
                    line,
                    new_owner: NO_NODE,
                    certain: false,
                },
            )),
            _ => None,
        }
    }

    // ------------------------------------------------------------- eviction

    /// Evicts LRU shared lines until the table is back under its weighted
    /// capacity. Never evicts `exclude` (held locked by the caller) and never
    /// blocks on a line lock: a contended victim is reinstated and eviction
    /// retries on a later insert.
    pub(crate) fn evict_as_needed(&self, exclude: LineId) {
        while self.store.shared.over_capacity() {
            let Some((id, line, weight)) = self.store.shared.pop_victim(exclude) else {
                return;
            };
            let Some(mut l) = line.try_lock() else {
                self.store.shared.insert(id, line, weight);
                return;
            };
            self.discard_line(&mut l, true);
            drop(l);
            self.store.recycle_line(line);
        }
    }

    /// Releases a line's resources. A shared (S) line acknowledges its
    /// invalidation to the owner so the sharer set stays accurate.
    pub(crate) fn discard_line(&self, l: &mut LineInner, invack: bool) {
        debug!("Evicted {:?}", l);
        self.fire_line_evicted(l);
        let id = l.id;
        if let Some(data) = l.data.take() {
            self.storage.deallocate_storage(id, data);
        }
        if invack && l.state == State::S {
            let ack = self.msg(l.owner, MessageKind::InvAck { line: id });
            self.send(ack);
        }
        if let Some(sharers) = l.sharers.take() {
            self.store.recycle_sharer_set(sharers);
        }
        l.clear();
    }

    // ------------------------------------------------------------ allocator

    pub(crate) fn park_alloc_op(&self, op: &Op) {
        op.ensure_future();
        if let Ok(mut parked) = self.pending_allocs.lock() {
            parked.push(op.clone());
        }
    }

    /// Re-runs PUT/ALLOC ops parked while the id allocator was unready.
    pub fn allocator_ready(&self) {
        info!("Id allocator is ready");
        let parked = match self.pending_allocs.lock() {
            Ok(mut parked) => std::mem::take(&mut *parked),
            Err(_) => return,
        };
        for op in parked {
            self.in_dispatch(|| {
                if let Err(e) = self.run_op(&op) {
                    op.fail(e);
                }
            });
        }
    }
}
