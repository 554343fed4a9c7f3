//! Line state mutation primitives.
//!
//! `set_state` is the single place a line migrates between the owned and
//! shared tables; `set_next_state` advances the in-progress transition target
//! monotonically. Payload writes go through the storage allocator and keep
//! the shared table's weights accurate.

use std::sync::Arc;

use log::{debug, error};

use crate::cache::coherence::engine::CoherenceEngine;
use crate::cache::error::CacheError;
use crate::cache::line::{CacheLine, LineInner};
use crate::cache::types::{NodeId, State, flags};

impl CoherenceEngine {
    /// Sets the transition target. Targets only advance (I < S < O < E);
    /// clearing (`None`) always succeeds. Returns true when the target
    /// actually changed, which is the cue to emit the transition's messages.
    pub(crate) fn set_next_state(&self, l: &mut LineInner, next: Option<State>) -> bool {
        if l.next_state == next {
            return false;
        }
        let advances = match (l.next_state, next) {
            (None, _) | (_, None) => true,
            (Some(current), Some(target)) => current.is_less_than(target),
        };
        if !advances {
            return false;
        }
        l.next_state = next;
        match next {
            Some(State::S) | Some(State::O) => self.monitor().add_miss(),
            Some(State::E) => self
                .monitor()
                .add_invalidates(l.sharers.as_ref().map(|s| s.len()).unwrap_or(0)),
            _ => {}
        }
        true
    }

    /// Transitions the line, migrating it between the owned and shared
    /// tables and resetting the sharer set. Returns true when the state
    /// changed.
    pub(crate) fn set_state(&self, line: &Arc<CacheLine>, l: &mut LineInner, state: State) -> bool {
        if let Some(next) = l.next_state {
            if next == state || next.is_less_than(state) {
                l.next_state = None;
            }
        }
        if l.state == state {
            return false;
        }
        debug!("Set state {:#x} {:?} -> {:?}", l.id, l.state, state);

        if state.is_owned() && !l.state.is_owned() {
            self.store.insert_owned(l.id, line.clone());
            self.store.shared.remove(l.id);
        } else if !state.is_owned() && l.state.is_owned() {
            self.store.shared.insert(l.id, line.clone(), l.weight());
            self.store.remove_owned(l.id);
            self.evict_as_needed(l.id);
        }

        l.state = state;

        if state.is_owned() {
            if let Some(old) = l.sharers.take() {
                self.store.recycle_sharer_set(old);
            }
            l.sharers = Some(self.store.allocate_sharer_set());
        } else if let Some(old) = l.sharers.take() {
            self.store.recycle_sharer_set(old);
        }

        if state == State::I && !l.is(flags::DELETED) {
            self.fire_line_invalidated(l);
        }
        true
    }

    /// Updates the owner belief. Call after `set_state`.
    pub(crate) fn set_owner(&self, l: &mut LineInner, owner: NodeId) -> bool {
        if l.owner == owner {
            return false;
        }
        debug!("Set owner {:#x} {} -> {}", l.id, l.owner, owner);
        l.owner = owner;
        true
    }

    /// Writes a payload into the line, reusing or reallocating its buffer.
    /// Returns true when the data actually changed (the version-bump cue).
    pub(crate) fn write_data(
        &self,
        l: &mut LineInner,
        data: Option<&[u8]>,
    ) -> Result<bool, CacheError> {
        let Some(bytes) = data else {
            return Ok(self.write_null(l));
        };
        if bytes.len() > self.config().max_item_size {
            return Err(CacheError::SizeExceeded {
                size: bytes.len(),
                max: self.config().max_item_size,
            });
        }
        if self.config().compare_before_write && l.data.as_deref() == Some(bytes) {
            return Ok(false);
        }

        self.allocate_line_data(l, bytes.len());
        if let Some(buffer) = l.data.as_mut() {
            buffer.clear();
            buffer.extend_from_slice(bytes);
        }
        Ok(true)
    }

    fn write_null(&self, l: &mut LineInner) -> bool {
        let Some(buffer) = l.data.take() else {
            return false;
        };
        self.storage().deallocate_storage(l.id, buffer);
        if !l.state.is_owned() {
            // state must be settled before the write; the weight follows it
            self.store.shared.set_weight(l.id, 1);
        }
        true
    }

    /// Ensures the line's buffer can hold `size` bytes. A buffer is reused
    /// while it is large enough but not wastefully so; otherwise it goes back
    /// to the allocator.
    fn allocate_line_data(&self, l: &mut LineInner, size: usize) {
        if let Some(buffer) = l.data.take() {
            if buffer.capacity() >= size && buffer.capacity() < size * 4 {
                debug!(
                    "Reusing storage for line {:#x}. Storage: {} bytes. Data: {} bytes",
                    l.id,
                    buffer.capacity(),
                    size
                );
                l.data = Some(buffer);
            } else {
                self.storage().deallocate_storage(l.id, buffer);
            }
        }
        if l.data.is_none() {
            debug!("Allocating storage ({} bytes) for line {:#x}", size, l.id);
            l.data = Some(self.storage().allocate_storage(size));
            if !l.state.is_owned() {
                self.store.shared.set_weight(l.id, 1 + size as u64);
                self.evict_as_needed(l.id);
            }
        }
    }

    /// Returns a copy of the line's payload.
    pub(crate) fn read_data(&self, l: &LineInner) -> Option<Vec<u8>> {
        l.data.clone()
    }

    // ------------------------------------------------------------ listeners

    fn each_listener(&self, l: &LineInner, f: impl Fn(&dyn crate::cache::traits::CacheListener)) {
        if let Some(listener) = &l.listener {
            Self::guard_listener(|| f(&**listener));
        }
        for listener in self.listeners() {
            Self::guard_listener(|| f(&*listener));
        }
    }

    fn guard_listener(f: impl FnOnce()) {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
            error!("Listener threw an exception.");
        }
    }

    pub(crate) fn fire_line_invalidated(&self, l: &LineInner) {
        let id = l.id;
        self.each_listener(l, |listener| listener.invalidated(id));
    }

    pub(crate) fn fire_line_received(&self, l: &LineInner) {
        let id = l.id;
        let version = l.version;
        self.each_listener(l, |listener| listener.received(id, version, l.data.as_deref()));
    }

    pub(crate) fn fire_line_evicted(&self, l: &LineInner) {
        let id = l.id;
        self.each_listener(l, |listener| listener.evicted(id));
    }
}
