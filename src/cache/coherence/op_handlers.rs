//! Local operation handlers and the S/O/E transition drivers.
//!
//! Each handler either resolves the op against the current state or starts a
//! transition (emitting the protocol messages) and reports pending; the
//! change mask of the triggering event gates re-evaluation so a parked op is
//! only re-run when something it waits on actually moved.

use std::sync::Arc;

use log::{debug, info};

use crate::cache::coherence::engine::{CoherenceEngine, RunResult};
use crate::cache::error::CacheError;
use crate::cache::line::{CacheLine, LineInner};
use crate::cache::message::MessageKind;
use crate::cache::ops::{Op, OpExtra, OpKind, OpValue};
use crate::cache::txn::Transaction;
use crate::cache::types::{
    Change, LINE_MODIFIED_CHANGED, LINE_OWNER_CHANGED, LINE_STATE_CHANGED, LineId, NO_NODE, NodeId,
    SERVER, State, flags, is_reserved,
};

impl CoherenceEngine {
    pub(crate) fn handle_op_get(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        kind: OpKind,
        node_hint: NodeId,
        txn: Option<&Arc<Transaction>>,
        change: Change,
    ) -> Result<RunResult, CacheError> {
        if change & (LINE_STATE_CHANGED | LINE_OWNER_CHANGED) == 0 {
            return Ok(RunResult::Pending);
        }

        if l.is(flags::DELETED) {
            self.handle_deleted(line, l)?;
        }

        if !self.transition_to_s(l, node_hint) {
            // a plain GET may be served from the last known data while the
            // owner-clock proves no inconsistent view is possible
            if kind != OpKind::GetS && l.version > 0 && !self.dirty.is_possible_inconsistency(l) {
                return Ok(RunResult::Done(OpValue::Data(self.read_data(l))));
            }
            return Ok(RunResult::Pending);
        }

        if kind == OpKind::GetS {
            self.lock_line(l, txn);
        }
        Ok(RunResult::Done(OpValue::Data(self.read_data(l))))
    }

    pub(crate) fn handle_op_getx(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        node_hint: NodeId,
        txn: Option<&Arc<Transaction>>,
        change: Change,
    ) -> Result<RunResult, CacheError> {
        if change & (LINE_STATE_CHANGED | LINE_OWNER_CHANGED) == 0 {
            return Ok(RunResult::Pending);
        }

        if l.is(flags::DELETED) {
            self.handle_deleted(line, l)?;
        }

        if !self.transition_to_e(l, node_hint) {
            return Ok(RunResult::Pending);
        }

        self.lock_line(l, txn); // we are at least O here
        Ok(RunResult::Done(OpValue::Data(self.read_data(l))))
    }

    pub(crate) fn handle_op_set(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        data: Option<&[u8]>,
        node_hint: NodeId,
        txn: Option<&Arc<Transaction>>,
        change: Change,
    ) -> Result<RunResult, CacheError> {
        if change & (LINE_STATE_CHANGED | LINE_OWNER_CHANGED) == 0 {
            return Ok(RunResult::Pending);
        }

        if l.is(flags::DELETED) {
            self.handle_deleted(line, l)?;
        }

        // the E-transition flags MODIFIED on success; the rollback snapshot
        // must capture the state the write found
        let was_modified = l.is(flags::MODIFIED);

        if !self.transition_to_e(l, node_hint) {
            return Ok(RunResult::Pending);
        }

        self.set_data(l, data, txn, was_modified)?;

        if txn.is_none() && !l.is_locked() {
            self.backup_line(l);
        }
        Ok(RunResult::Done(OpValue::Unit))
    }

    pub(crate) fn handle_op_del(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        node_hint: NodeId,
        _txn: Option<&Arc<Transaction>>,
        change: Change,
    ) -> Result<RunResult, CacheError> {
        if change & (LINE_STATE_CHANGED | LINE_OWNER_CHANGED) == 0 {
            return Ok(RunResult::Pending);
        }

        if !self.transition_to_e(l, node_hint) {
            return Ok(RunResult::Pending);
        }

        l.set(flags::DELETED, true);

        if self.has_server() {
            if l.state == State::E {
                self.set_state(line, l, State::O);
            }
            l.sharers_mut().insert(SERVER);
            let del = self.msg(SERVER, MessageKind::Del { line: l.id });
            self.send(del);
        } else {
            self.set_state(line, l, State::I);
        }

        if let Some(buffer) = l.data.take() {
            self.storage().deallocate_storage(l.id, buffer);
            if !l.state.is_owned() {
                self.store.shared.set_weight(l.id, 1);
            }
        }

        self.fire_line_evicted(l);
        Ok(RunResult::Done(OpValue::Unit))
    }

    /// Routes a user message to the line's owner: redelivered locally when we
    /// own the line, otherwise forwarded. A forwarded SEND stays pending
    /// until its MSGACK arrives.
    pub(crate) fn handle_op_send(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        extra: &OpExtra,
        change: Change,
    ) -> Result<RunResult, CacheError> {
        let OpExtra::Msg(msg) = extra else {
            return Ok(RunResult::Done(OpValue::Unit));
        };

        if l.is(flags::DELETED) {
            self.handle_deleted(line, l)?;
        }

        if change & LINE_OWNER_CHANGED == 0 {
            return Ok(RunResult::Pending); // there's no reason to resend
        }
        if msg.node != NO_NODE && msg.node == l.owner {
            return Ok(RunResult::Pending);
        }

        if !l.state.is_less_than(State::O) {
            let mut local = msg.clone();
            local.node = self.my_node_id();
            if let MessageKind::Msg { reply_required, .. } = &mut local.kind {
                *reply_required = false;
            }
            local.incoming = true;
            self.receive(local); // parked and drained after this dispatch
            return Ok(RunResult::Done(OpValue::Unit));
        }

        // forward a copy; the original may still sit in transport queues
        let mut forwarded = msg.clone();
        forwarded.node = l.owner;
        forwarded.incoming = false;
        self.send(forwarded);
        Ok(RunResult::Pending) // completed by the matching MSGACK
    }

    pub(crate) fn handle_op_push(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        extra: &OpExtra,
        change: Change,
    ) -> Result<RunResult, CacheError> {
        if change & LINE_MODIFIED_CHANGED == 0 {
            return Ok(RunResult::Pending);
        }

        if l.state.is_less_than(State::O) {
            info!(
                "Attempt to push line {:#x} while state is only {:?}",
                l.id, l.state
            );
            return Ok(RunResult::Done(OpValue::Unit));
        }

        let OpExtra::Nodes(nodes) = extra else {
            return Ok(RunResult::Done(OpValue::Unit));
        };

        self.set_state(line, l, State::O);
        for &node in nodes {
            l.sharers_mut().insert(node);
        }
        for &node in nodes {
            let put = self.msg(
                node,
                MessageKind::Put {
                    line: l.id,
                    version: l.version,
                    data: l.data.clone(),
                },
            );
            self.send(put);
        }
        Ok(RunResult::Done(OpValue::Unit))
    }

    pub(crate) fn handle_op_pushx(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        extra: &OpExtra,
        change: Change,
    ) -> Result<RunResult, CacheError> {
        if change & LINE_MODIFIED_CHANGED == 0 {
            return Ok(RunResult::Pending);
        }

        if l.state.is_less_than(State::E) {
            info!(
                "Attempt to push line {:#x} while state is only {:?}",
                l.id, l.state
            );
            return Ok(RunResult::Done(OpValue::Unit));
        }

        let OpExtra::Node(to_node) = extra else {
            return Ok(RunResult::Done(OpValue::Unit));
        };

        self.set_owner(l, *to_node);
        let sharers: Vec<NodeId> = l
            .sharers
            .as_ref()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        self.set_state(line, l, State::I);

        let putx = self.msg(
            *to_node,
            MessageKind::PutX {
                line: l.id,
                sharers,
                version: l.version,
                data: l.data.clone(),
            },
        );
        self.send(putx);
        Ok(RunResult::Done(OpValue::Unit))
    }

    pub(crate) fn handle_op_listen(
        &self,
        l: &mut LineInner,
        extra: &OpExtra,
    ) -> Result<RunResult, CacheError> {
        l.listener = match extra {
            OpExtra::Listener(listener) => Some(listener.clone()),
            _ => None,
        };
        Ok(RunResult::Done(OpValue::Unit))
    }

    // ------------------------------------------------------------ PUT/ALLOC

    /// Runs a PUT or ALLOC, which create lines instead of looking them up.
    /// While the id allocator is unready the op parks until
    /// [`allocator_ready`](CoherenceEngine::allocator_ready).
    pub(crate) fn exec_alloc_op(&self, op: &Op) -> Result<RunResult, CacheError> {
        let res = match op.kind() {
            OpKind::Put => self.handle_op_put(op),
            OpKind::Alloc => self.handle_op_alloc(op),
            _ => Ok(RunResult::Pending),
        };
        match res {
            Ok(RunResult::Pending) => {
                op.set_start(std::time::Instant::now());
                Ok(RunResult::Pending)
            }
            Ok(RunResult::Done(v)) => {
                self.complete_op(op, &v, op.has_future());
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

    fn handle_op_put(&self, op: &Op) -> Result<RunResult, CacheError> {
        let Some(id) = self.id_allocator().allocate_ids(1) else {
            self.park_alloc_op(op);
            return Ok(RunResult::Pending);
        };

        self.materialize_owned_line(id, op.data(), op.txn())?;
        Ok(RunResult::Done(OpValue::Id(id)))
    }

    fn handle_op_alloc(&self, op: &Op) -> Result<RunResult, CacheError> {
        let count = match op.extra() {
            OpExtra::Count(count) => *count,
            _ => 1,
        };
        let Some(first) = self.id_allocator().allocate_ids(count) else {
            self.park_alloc_op(op);
            return Ok(RunResult::Pending);
        };

        for i in 0..count {
            self.materialize_owned_line(first + i, None, op.txn())?;
        }
        Ok(RunResult::Done(OpValue::Id(first)))
    }

    /// Builds a fresh exclusively-owned, locked line for a newly allocated id.
    fn materialize_owned_line(
        &self,
        id: LineId,
        data: Option<&[u8]>,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<(), CacheError> {
        let line = self.store.allocate_line(id);
        let mut l = line.lock();
        self.set_state(&line, &mut l, State::E);
        self.set_owner(&mut l, self.my_node_id());
        self.set_data(&mut l, data, txn, false)?;
        self.lock_line(&mut l, txn);
        Ok(())
    }

    // ---------------------------------------------------------- transitions

    /// Ensures the line is at least S, asking the owner (or the hinted node,
    /// or everyone) for a copy if not. Returns true when already there.
    pub(crate) fn transition_to_s(&self, l: &mut LineInner, node_hint: NodeId) -> bool {
        if l.state.is_less_than(State::S) {
            if self.set_next_state(l, Some(State::S)) {
                let get = self.msg(Self::target(l, node_hint), MessageKind::Get { line: l.id });
                self.send(get);
            }
            false
        } else {
            true
        }
    }

    fn transition_to_o(&self, l: &mut LineInner, node_hint: NodeId) -> bool {
        if l.state.is_less_than(State::O) {
            if self.set_next_state(l, Some(State::O)) {
                let getx = self.msg(Self::target(l, node_hint), MessageKind::GetX { line: l.id });
                self.send(getx);
            }
            false
        } else {
            true
        }
    }

    /// Progresses towards E through O, invalidating every non-server sharer.
    /// Whether the transition must wait for INVACKs depends on the
    /// deployment: with broadcasts routed through the server we wait for the
    /// server's ack, without a server for the previous owner's (which
    /// guarantees its slaves were invalidated), otherwise we proceed and let
    /// the acks clean up asynchronously.
    pub(crate) fn transition_to_e(&self, l: &mut LineInner, node_hint: NodeId) -> bool {
        if !self.transition_to_o(l, node_hint) {
            return false;
        }
        debug_assert!(!l.state.is_less_than(State::O));

        let reached = if l.state.is_less_than(State::E) {
            if self.set_next_state(l, Some(State::E)) {
                let id = l.id;
                let owner = l.owner; // may be the previous owner; routes the INVACK
                let targets: Vec<NodeId> = l
                    .sharers
                    .as_ref()
                    .map(|s| s.iter().copied().filter(|&n| n != SERVER).collect())
                    .unwrap_or_default();
                for sharer in targets {
                    let inv = self.msg(
                        sharer,
                        MessageKind::Inv {
                            line: id,
                            previous_owner: owner,
                        },
                    );
                    self.send(inv);
                }
            }
            if self.broadcasts_routed_to_server() {
                !l.sharers_contains(SERVER)
            } else if !self.has_server() {
                !l.sharers_contains(l.owner)
            } else {
                true
            }
        } else {
            true
        };

        if reached {
            l.set(flags::MODIFIED, true); // let slaves know we own the line
        }
        reached
    }

    /// Resurrects a reserved line from deletion; anything else is an error.
    pub(crate) fn handle_deleted(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
    ) -> Result<(), CacheError> {
        if is_reserved(l.id) {
            l.set(flags::DELETED, false);
            self.set_state(line, l, State::E);
            Ok(())
        } else {
            Err(CacheError::RefNotFound(l.id))
        }
    }

    /// Records the rollback snapshot on first write, then writes and bumps
    /// the version. The first write always bumps, even when null.
    pub(crate) fn set_data(
        &self,
        l: &mut LineInner,
        data: Option<&[u8]>,
        txn: Option<&Arc<Transaction>>,
        was_modified: bool,
    ) -> Result<(), CacheError> {
        debug_assert!(l.state.is_owned());

        if let Some(txn) = txn {
            if self.config().rollback_supported && !txn.is_recorded(l.id) {
                txn.record_rollback(l.id, l.version, was_modified, l.data.clone());
            }
        }

        if self.write_data(l, data)? || l.version == 0 {
            l.version += 1;
            l.set(flags::MODIFIED, true);
            debug!(
                "Line {:#x} now has a new version {}. Setting to modified.",
                l.id, l.version
            );
        }
        Ok(())
    }

    fn target(l: &LineInner, node_hint: NodeId) -> NodeId {
        if l.owner >= 0 { l.owner } else { node_hint }
    }
}
