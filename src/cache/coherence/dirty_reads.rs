//! Dirty reads: serving invalidated lines from their last known data.
//!
//! The tracker keeps, per owner, the id of the last content-bearing message
//! (PUT/PUTX/MSG) and a count of invalidations seen since. An I line may be
//! read without a fetch only while its own stamp is newer than the owner's
//! last put; once any invalidated line from that owner has been re-PUT, every
//! other stale line of that owner becomes suspect until refreshed.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use dashmap::DashMap;
use log::debug;

use crate::cache::line::LineInner;
use crate::cache::message::{Message, MessageKind};
use crate::cache::monitor::CacheMonitor;
use crate::cache::types::{NO_NODE, NodeId};

/// Per-owner clock pair.
#[derive(Debug, Default)]
pub struct OwnerClock {
    /// Message id of the last PUT/PUTX/MSG from this owner. Negative while
    /// dirty reads from the owner are administratively disabled.
    pub last_put: AtomicI64,
    /// Invalidations from this owner since the last put.
    pub inv_counter: AtomicI32,
}

/// Tracks owner clocks for every peer this node has heard from.
pub struct DirtyReadTracker {
    enabled: bool,
    clocks: DashMap<NodeId, Arc<OwnerClock>>,
}

impl DirtyReadTracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            clocks: DashMap::new(),
        }
    }

    fn clock(&self, owner: NodeId) -> Arc<OwnerClock> {
        self.clocks
            .entry(owner)
            .or_insert_with(|| Arc::new(OwnerClock::default()))
            .clone()
    }

    /// Stamps the line with the message that last established its content and
    /// advances the sender's clocks by message kind.
    pub fn note_message(&self, l: &mut LineInner, msg: &Message, monitor: &dyn CacheMonitor) {
        if !self.enabled {
            return;
        }
        l.owner_clock = msg.msg_id;

        match msg.kind {
            MessageKind::Inv { .. } => {
                self.clock(msg.node).inv_counter.fetch_add(1, Ordering::Relaxed);
            }
            MessageKind::Put { .. } | MessageKind::PutX { .. } | MessageKind::Msg { .. } => {
                self.note_put(msg.node, msg.msg_id, monitor);
            }
            _ => {}
        }
    }

    /// Advances an owner's last-put clock, purging the stale-line count.
    pub fn note_put(&self, owner: NodeId, clock: i64, monitor: &dyn CacheMonitor) {
        if !self.enabled {
            return;
        }
        let oc = self.clock(owner);
        loop {
            let current = oc.last_put.load(Ordering::Acquire);
            if current < 0 || clock <= current {
                // negative means a node-switch window has dirty reads disabled
                break;
            }
            if oc
                .last_put
                .compare_exchange(current, clock, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                monitor.add_stale_purge(oc.inv_counter.swap(0, Ordering::AcqRel));
                break;
            }
        }
    }

    /// Forces an owner's clock to `value`; used around node-switch windows.
    pub fn reset(&self, owner: NodeId, value: i64, monitor: &dyn CacheMonitor) {
        if !self.enabled {
            return;
        }
        if let Some(oc) = self.clocks.get(&owner) {
            oc.last_put.store(value, Ordering::Release);
            let count = oc.inv_counter.swap(0, Ordering::AcqRel);
            monitor.add_stale_purge(count);
            debug!("Resetting owner clock for {}. Purging {} lines.", owner, count);
        }
    }

    /// True when reading the line's last known data could produce an
    /// inconsistent view, so the op must fetch instead.
    pub fn is_possible_inconsistency(&self, l: &LineInner) -> bool {
        if !self.enabled {
            return true;
        }
        if l.owner == NO_NODE {
            return false;
        }
        let Some(oc) = self.clocks.get(&l.owner) else {
            return false;
        };
        let last_put = oc.last_put.load(Ordering::Acquire);
        last_put < 0 || l.owner_clock <= last_put
    }
}
