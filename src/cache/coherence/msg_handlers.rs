//! Inbound coherence message handlers.
//!
//! Each handler validates the line's state against the protocol, applies the
//! transition and returns the change mask that drives pending-work drains.
//! A message arriving in an incompatible state is logged and discarded.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::cache::coherence::engine::CoherenceEngine;
use crate::cache::error::CacheError;
use crate::cache::line::{CacheLine, LineInner};
use crate::cache::message::{Message, MessageKind};
use crate::cache::ops::{OpExtra, OpKind, OpValue};
use crate::cache::types::{
    Change, LINE_MODIFIED_CHANGED, LINE_NO_CHANGE, LINE_OWNER_CHANGED, LINE_STATE_CHANGED, NO_NODE,
    NodeId, SERVER, State, flags,
};

/// Message-handling failure: either the line's state is incompatible with
/// the message (discarded) or a local resource error occurred.
pub(crate) enum MsgHandlerError {
    IrrelevantState,
    Cache(CacheError),
}

impl From<CacheError> for MsgHandlerError {
    fn from(e: CacheError) -> Self {
        MsgHandlerError::Cache(e)
    }
}

type MsgResult = Result<Change, MsgHandlerError>;

impl CoherenceEngine {
    /// Routes one message into the state machine, holding it back when the
    /// line is not ready to process it.
    pub(crate) fn handle_message1(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        msg: Message,
    ) -> Change {
        if self.should_hold_message(l, &msg) {
            debug!("Adding message to pending {:?} on line {:?}", msg, l);
            let modified = l.is(flags::MODIFIED);
            self.add_pending_message(l, msg);
            if modified {
                self.backup().flush();
            }
            return LINE_NO_CHANGE;
        }

        let res = match &msg.kind {
            MessageKind::Put { version, data, .. } => {
                self.handle_message_put(line, l, &msg, *version, data.as_deref())
            }
            MessageKind::PutX {
                sharers,
                version,
                data,
                ..
            } => self.handle_message_putx(line, l, &msg, sharers, *version, data.as_deref()),
            MessageKind::Get { .. } => self.handle_message_get(line, l, &msg),
            MessageKind::GetX { .. } => self.handle_message_getx(line, l, &msg),
            MessageKind::Inv { previous_owner, .. } => {
                self.handle_message_invalidate(line, l, &msg, *previous_owner)
            }
            MessageKind::InvAck { .. } => self.handle_message_invalidate_ack(line, l, &msg),
            MessageKind::NotFound { .. } => self.handle_message_not_found(line, l, &msg),
            MessageKind::ChngdOwnr { new_owner, .. } => {
                self.handle_message_chngd_ownr(line, l, &msg, *new_owner)
            }
            MessageKind::MsgAck { .. } => self.handle_message_msg_ack(l, &msg),
            MessageKind::Backup { version, data, .. } => {
                self.handle_message_backup(line, l, &msg, *version, data.as_deref())
            }
            MessageKind::BackupAck { version, .. } => {
                self.handle_message_backup_ack(l, *version)
            }
            MessageKind::Timeout { .. } => self.handle_message_timeout(l),
            _ => {
                warn!("Unhandled message {:?}", msg);
                Ok(LINE_NO_CHANGE)
            }
        };

        match res {
            Ok(change) => change,
            Err(MsgHandlerError::IrrelevantState) => {
                warn!(
                    "Got message {:?} when at irrelevant state {:?}",
                    msg, l.state
                );
                LINE_NO_CHANGE
            }
            Err(MsgHandlerError::Cache(e)) => {
                warn!("Failed to handle message {:?}: {}", msg, e);
                LINE_NO_CHANGE
            }
        }
    }

    /// Handles a line message for which no record exists. Returns true when
    /// the message needs no line (and none should be created).
    pub(crate) fn handle_message_no_line(&self, msg: &Message) -> bool {
        debug!("Line {:?} not found.", msg.line());
        match &msg.kind {
            MessageKind::Inv { line, .. } => {
                let ack = self.msg(msg.node, MessageKind::InvAck { line: *line });
                self.send(ack);
                true
            }
            MessageKind::InvAck { .. } => true,
            MessageKind::Get { .. } | MessageKind::GetX { .. } | MessageKind::Msg { .. } => {
                self.handle_not_owner(msg, None);
                true
            }
            _ => false,
        }
    }

    /// Redirects a requester we cannot serve: deleted lines answer
    /// NOT_FOUND, non-owned lines answer CHNGD_OWNR (or ACK a broadcast we
    /// know nothing certain about). Returns true when the message was
    /// answered here.
    pub(crate) fn handle_not_owner(&self, msg: &Message, l: Option<&LineInner>) -> bool {
        if let Some(l) = l {
            if l.is(flags::DELETED) {
                let not_found = self.msg(msg.node, MessageKind::NotFound { line: l.id });
                self.send(not_found);
                return true;
            }
            if l.state != State::I && l.state != State::S {
                return false;
            }
        }

        let (id, owner, certain) = match l {
            None => (msg.line().unwrap_or(crate::cache::types::NO_LINE), NO_NODE, false),
            // ownership transfer happens before the INVs go out, so even S is
            // not a certainty; it is still a better hint than I
            Some(l) => (l.id, l.owner, l.state == State::S),
        };

        if certain || !msg.is_broadcast() {
            let redirect = self.msg(
                msg.node,
                MessageKind::ChngdOwnr {
                    line: id,
                    new_owner: owner,
                    certain,
                },
            );
            self.send(redirect);
        } else {
            let ack = self.msg(msg.node, MessageKind::Ack { line: id });
            self.send(ack);
        }
        true
    }

    fn handle_message_get(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        msg: &Message,
    ) -> MsgResult {
        if self.handle_not_owner(msg, Some(l)) {
            return Ok(LINE_NO_CHANGE);
        }
        self.relevant_states(l, &[State::E, State::O])?;

        let mut change = LINE_NO_CHANGE;
        if self.set_state(line, l, State::O) {
            change |= LINE_STATE_CHANGED;
        }
        l.sharers_mut().insert(msg.node);

        let put = self.msg(
            msg.node,
            MessageKind::Put {
                line: l.id,
                version: l.version,
                data: l.data.clone(),
            },
        );
        self.send(put);
        Ok(change)
    }

    fn handle_message_put(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        msg: &Message,
        version: u64,
        data: Option<&[u8]>,
    ) -> MsgResult {
        self.relevant_states(l, &[State::I, State::S])?;

        if l.version > version {
            return Ok(LINE_NO_CHANGE);
        }

        let mut change = LINE_NO_CHANGE;
        if self.set_state(line, l, State::S) {
            change |= LINE_STATE_CHANGED;
        }
        if self.set_owner(l, msg.node) {
            change |= LINE_OWNER_CHANGED;
        }
        l.version = version;
        self.write_data(l, data)?;
        self.dirty.note_message(l, msg, self.monitor());

        self.fire_line_received(l);
        Ok(change)
    }

    fn handle_message_getx(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        msg: &Message,
    ) -> MsgResult {
        if self.handle_not_owner(msg, Some(l)) {
            return Ok(LINE_NO_CHANGE);
        }
        self.relevant_states(l, &[State::E, State::O])?;

        if l.is(flags::SLAVE) && self.backup().inv(l.id, msg.node) {
            l.set(flags::SLAVE, false);
        }

        if !self.has_server() && l.is(flags::SLAVE) {
            let me = self.my_node_id();
            l.sharers_mut().insert(me);
        }

        // capture before set_state resets the sharer set
        let sharers: Vec<NodeId> = l
            .sharers
            .as_ref()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        let next = if self.has_server() || !l.is(flags::SLAVE) {
            State::I
        } else {
            State::S
        };

        let mut change = LINE_NO_CHANGE;
        if self.set_state(line, l, next) {
            change |= LINE_STATE_CHANGED;
        }
        if self.set_owner(l, msg.node) {
            change |= LINE_OWNER_CHANGED;
        }

        let putx = self.msg(
            msg.node,
            MessageKind::PutX {
                line: l.id,
                sharers,
                version: l.version,
                data: l.data.clone(),
            },
        );
        self.send(putx);
        Ok(change)
    }

    fn handle_message_putx(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        msg: &Message,
        msg_sharers: &[NodeId],
        version: u64,
        data: Option<&[u8]>,
    ) -> MsgResult {
        self.relevant_states(l, &[State::I, State::S])?;

        if l.version > version {
            warn!(
                "Got PUTX with version {} which is older than current version {}",
                version, l.version
            );
            return Ok(LINE_NO_CHANGE);
        }

        let mut sharers: HashSet<NodeId> = msg_sharers.iter().copied().collect();
        if self.has_server() && msg.node != SERVER {
            // make sure the server learns of the ownership transfer via INV
            sharers.insert(SERVER);
        }
        sharers.remove(&self.my_node_id()); // don't INV ourselves

        let mut change = LINE_NO_CHANGE;
        if l.state.is_less_than(State::O) {
            change |= LINE_OWNER_CHANGED;
        }
        let empty = sharers.is_empty();
        if self.set_state(line, l, if empty { State::E } else { State::O }) {
            change |= LINE_STATE_CHANGED;
        }
        if empty {
            let me = self.my_node_id();
            if self.set_owner(l, me) {
                change |= LINE_OWNER_CHANGED;
            }
        } else {
            // keep the previous owner; it routes the INVACKs we now wait for
            self.set_owner(l, msg.node);
        }
        l.sharers_mut().extend(sharers.iter().copied());
        l.version = version;
        self.write_data(l, data)?;

        self.dirty.note_message(l, msg, self.monitor());
        self.fire_line_received(l);

        if self.has_server() && msg.node != SERVER {
            let inv = self.msg(
                SERVER,
                MessageKind::Inv {
                    line: l.id,
                    previous_owner: msg.node,
                },
            );
            self.send(inv);
        }
        Ok(change)
    }

    fn handle_message_invalidate(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        msg: &Message,
        previous_owner: NodeId,
    ) -> MsgResult {
        if self.cluster().is_master() {
            // an INV from the server can arrive while O after a failover
            self.relevant_states(l, &[State::S, State::I, State::O])?;
        } else {
            self.relevant_states(l, &[State::I, State::E])?;
        }

        let owner = if msg.node == SERVER || msg.node == self.my_node_id() {
            previous_owner
        } else {
            msg.node
        };

        let mut change = LINE_NO_CHANGE;
        self.set_next_state(l, None);
        if self.set_state(line, l, State::I) {
            change |= LINE_STATE_CHANGED;
        }
        if self.set_owner(l, owner) {
            change |= LINE_OWNER_CHANGED;
        }
        self.dirty.note_message(l, msg, self.monitor());

        if self.cluster().is_master() {
            if l.is(flags::SLAVE) && self.backup().inv(l.id, owner) {
                l.set(flags::SLAVE, false);
            }

            if l.is(flags::SLAVE) {
                // answer once our slave confirms it dropped the line
                self.add_pending_message(l, msg.clone());
            } else if msg.node != SERVER {
                let ack = self.msg(msg.node, MessageKind::InvAck { line: l.id });
                self.send(ack);
            }
        }
        Ok(change)
    }

    fn handle_message_invalidate_ack(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        msg: &Message,
    ) -> MsgResult {
        if msg.node == self.my_node_id() {
            // our slave confirmed it invalidated its view of the line
            debug_assert!(l.is(flags::SLAVE));
            if l.is_locked() {
                self.add_pending_message(l, msg.clone());
                return Ok(LINE_NO_CHANGE);
            }

            self.relevant_states(l, &[State::I, State::S])?;

            l.set(flags::SLAVE, false);
            let mut change = LINE_MODIFIED_CHANGED;
            if l.state == State::S {
                // the owner is waiting for our INVACK
                self.set_next_state(l, None);
                if self.set_state(line, l, State::I) {
                    change |= LINE_STATE_CHANGED;
                }
                self.dirty.note_message(l, msg, self.monitor());
                let ack = self.msg(l.owner, MessageKind::InvAck { line: l.id });
                self.send(ack);
            }
            return Ok(change);
        }

        self.relevant_states(l, &[State::O])?;

        let mut change = LINE_NO_CHANGE;
        l.sharers_mut().remove(&msg.node);
        if l.sharers_is_empty() {
            let target = if l.is(flags::DELETED) {
                State::I
            } else {
                State::E
            };
            if self.set_state(line, l, target) {
                change |= LINE_STATE_CHANGED;
            }
            let me = self.my_node_id();
            if self.set_owner(l, me) {
                change |= LINE_OWNER_CHANGED;
            }
            // reported unconditionally; pending drains depend on it
            change |= LINE_STATE_CHANGED;
        } else if (self.broadcasts_routed_to_server() && msg.node == SERVER)
            || (!self.has_server() && msg.node == l.owner)
        {
            // the ack the E-transition waits for, even though nothing moved
            change |= LINE_STATE_CHANGED;
        }
        Ok(change)
    }

    fn handle_message_not_found(
        &self,
        _line: &Arc<CacheLine>,
        l: &mut LineInner,
        msg: &Message,
    ) -> MsgResult {
        self.relevant_states(l, &[State::I])?;

        if msg.node == SERVER || !self.has_server() {
            l.set(flags::DELETED, true);
            Ok(LINE_STATE_CHANGED)
        } else {
            self.set_owner(l, SERVER);
            self.set_next_state(l, None);
            Ok(LINE_OWNER_CHANGED)
        }
    }

    fn handle_message_chngd_ownr(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        msg: &Message,
        new_owner: NodeId,
    ) -> MsgResult {
        self.relevant_states(l, &[State::I, State::S])?;

        if new_owner != NO_NODE && self.cluster().get_master(new_owner).is_none() {
            // our cluster view and the sender's disagree; retry and hope
            // membership catches up
            debug!(
                "Not changing owner of {:#x} to {} because node is not in the cluster.",
                l.id, new_owner
            );
            self.set_next_state(l, None);
            return Ok(LINE_OWNER_CHANGED);
        }

        if self.set_owner(l, new_owner) {
            let mut change = LINE_OWNER_CHANGED;

            if msg.node == SERVER && new_owner == self.my_node_id() {
                // probably our PUTX target died before taking ownership
                self.set_state(line, l, State::E);
                change |= LINE_STATE_CHANGED;
            }

            // force pending ops to resend towards the new owner
            self.set_next_state(l, None);
            return Ok(change);
        }
        Ok(LINE_NO_CHANGE)
    }

    fn handle_message_msg_ack(&self, l: &mut LineInner, msg: &Message) -> MsgResult {
        let mut matched = None;
        if let Some(ops) = self.pending_ops.get(&l.id) {
            for op in ops.iter() {
                if op.kind() == OpKind::Send {
                    if let OpExtra::Msg(m) = op.extra() {
                        if m.msg_id == msg.msg_id {
                            matched = Some(op.clone());
                            break;
                        }
                    }
                }
            }
        }

        if let Some(op) = matched {
            self.complete_op(&op, &OpValue::Unit, true);
            if let Some(mut ops) = self.pending_ops.get_mut(&l.id) {
                ops.retain(|o| !o.same_op(&op));
            }
            self.pending_ops.remove_if(&l.id, |_, ops| ops.is_empty());
        }
        Ok(LINE_NO_CHANGE)
    }

    fn handle_message_backup(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        msg: &Message,
        version: u64,
        data: Option<&[u8]>,
    ) -> MsgResult {
        if self.cluster().is_master() {
            warn!("Received backup message while master (ignoring): {:?}", msg);
            return Ok(LINE_NO_CHANGE);
        }

        if l.version > version {
            return Ok(LINE_NO_CHANGE);
        }

        // E without sharer tracking: when the master dies, the node-event
        // sweep on the other peers takes their copies S -> I
        let mut change = LINE_NO_CHANGE;
        if self.set_state(line, l, State::E) {
            change |= LINE_STATE_CHANGED;
        }
        if self.set_owner(l, msg.node) {
            change |= LINE_OWNER_CHANGED;
        }
        l.version = version;
        self.write_data(l, data)?;

        self.fire_line_received(l);
        Ok(change)
    }

    fn handle_message_backup_ack(&self, l: &mut LineInner, version: u64) -> MsgResult {
        self.relevant_states(l, &[State::O, State::E])?;

        if l.is(flags::MODIFIED) && l.version == version {
            debug!(
                "Backup of line {:#x} version {} done. Setting to unmodified.",
                l.id, l.version
            );
            l.set(flags::MODIFIED, false);
            return Ok(LINE_MODIFIED_CHANGED);
        }
        Ok(LINE_NO_CHANGE)
    }

    fn handle_message_timeout(&self, l: &mut LineInner) -> MsgResult {
        let ops = self
            .pending_ops
            .remove(&l.id)
            .map(|(_, ops)| ops)
            .unwrap_or_default();
        for op in ops {
            info!("TIMEOUT: {:?}", op);
            op.fail(CacheError::Timeout);
        }
        l.next_state = None;
        Ok(LINE_STATE_CHANGED)
    }

    fn relevant_states(&self, l: &LineInner, states: &[State]) -> Result<(), MsgHandlerError> {
        if states.contains(&l.state) {
            Ok(())
        } else {
            Err(MsgHandlerError::IrrelevantState)
        }
    }
}
