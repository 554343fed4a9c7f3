//! Cluster node-event processing.
//!
//! When a node dies or fails over to its slave, every line that referenced it
//! must be repaired: shared lines it owned drop to I and retarget (the server
//! if there is one), owned lines lose it as a sharer, and pending work
//! addressed to it is cancelled. Lines touched by normal dispatch first apply
//! any in-flight events so no line observes a vanished peer.

use std::sync::Arc;

use log::{debug, info};

use crate::cache::coherence::engine::{
    CoherenceEngine, in_node_event_handler, set_in_node_event_handler,
};
use crate::cache::line::{CacheLine, LineInner};
use crate::cache::types::{
    LINE_NO_CHANGE, LINE_OWNER_CHANGED, LINE_STATE_CHANGED, NO_NODE, NodeId, SERVER, State,
};

/// A registered membership change, applied to every line exactly once.
/// Identified by the node, matching how the cluster reports events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeEvent {
    pub node: NodeId,
    pub new_owner: NodeId,
}

impl CoherenceEngine {
    pub fn node_added(&self, _node: NodeId) {}

    /// A node left the cluster for good. Lines it owned are retargeted at
    /// the server (or at nobody) and its pending messages are dropped.
    pub fn node_removed(&self, node: NodeId) {
        info!("Node {} removed.", node);
        let new_owner = if self.has_server() { SERVER } else { NO_NODE };
        self.run_node_event(NodeEvent { node, new_owner }, false);
    }

    /// A node's slave took over. The sweep is the same as removal except the
    /// owner stays (the slave answers under the same id), and dirty reads
    /// from the node are disabled for the duration of the window.
    pub fn node_switched(&self, node: NodeId) {
        info!("Node {} switched.", node);
        self.run_node_event(
            NodeEvent {
                node,
                new_owner: node,
            },
            true,
        );
    }

    fn run_node_event(&self, event: NodeEvent, switched: bool) {
        self.in_dispatch(|| {
            set_in_node_event_handler(true);
            if let Ok(mut events) = self.node_events.lock() {
                events.push(event);
            }

            if switched {
                self.dirty.reset(event.node, -1, self.monitor());
            }

            for line in self.store.all_lines() {
                let mut l = line.lock();
                if !switched {
                    self.drop_pending_messages_from(l.id, event.node);
                }
                self.process_line_on_node_event(&line, &mut l, event.node, event.new_owner);
            }

            if switched {
                // puts can update the clock again
                self.dirty.reset(event.node, 1, self.monitor());
            }

            if let Ok(mut events) = self.node_events.lock() {
                events.retain(|e| e.node != event.node);
            }
            set_in_node_event_handler(false);
        });
    }

    /// Applies all registered node events to a line before dispatch touches
    /// it. Suppressed inside the sweep itself.
    pub(crate) fn apply_node_events(&self, line: &Arc<CacheLine>, l: &mut LineInner) {
        if in_node_event_handler() {
            return;
        }
        let events: Vec<NodeEvent> = match self.node_events.lock() {
            Ok(events) => events.clone(),
            Err(_) => return,
        };
        for event in events {
            self.process_line_on_node_event(line, l, event.node, event.new_owner);
        }
    }

    fn process_line_on_node_event(
        &self,
        line: &Arc<CacheLine>,
        l: &mut LineInner,
        node: NodeId,
        new_owner: NodeId,
    ) {
        if l.state.is_less_than(State::O) && l.owner == node {
            debug!(
                "Node {} switched/removed - owned line {:?}. Setting to I and owner to {}",
                node, l, new_owner
            );
            // must go S -> I: the dead node's slave holds the line as E
            let mut change = LINE_NO_CHANGE;
            if self.set_state(line, l, State::I) {
                change |= LINE_STATE_CHANGED;
            }
            self.set_next_state(l, None);
            if node != new_owner && self.set_owner(l, new_owner) {
                change |= LINE_OWNER_CHANGED;
            }
            l.owner_clock = 0;
            self.handle_pending_ops(line, l, change);
        } else if l.state == State::O && l.sharers_contains(node) {
            debug!(
                "Node {} switched/removed - removing from sharers of line {:?}",
                node, l
            );
            l.sharers_mut().remove(&node);
            if l.sharers_is_empty() {
                self.set_state(line, l, State::E);
                self.handle_pending_ops(line, l, LINE_STATE_CHANGED);
            }
        }
    }
}
