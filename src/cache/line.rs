//! The per-line record.
//!
//! A [`CacheLine`] is the monitor for everything concerning one line: its
//! coherence state, transition target, ownership view, version, payload and
//! flags are all mutated under the line's mutex, which is the sole ordering
//! authority for that line's state machine.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::traits::CacheListener;
use crate::cache::types::{LineId, NO_NODE, NodeId, State, flags};

/// A cached line. Shared between the line tables and in-flight work via
/// `Arc`; all field access goes through [`CacheLine::lock`].
pub struct CacheLine {
    inner: Mutex<LineInner>,
}

/// The mutable per-line record.
pub struct LineInner {
    pub id: LineId,
    pub state: State,
    pub next_state: Option<State>,
    pub version: u64,
    /// Message id of the message that last established this line's content
    /// from its owner; drives dirty-read safety checks.
    pub owner_clock: i64,
    pub data: Option<Vec<u8>>,
    pub owner: NodeId,
    /// Nodes believed to hold a valid replica. Present iff state >= O.
    pub sharers: Option<HashSet<NodeId>>,
    pub listener: Option<Arc<dyn CacheListener>>,
    flags: u8,
}

impl CacheLine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LineInner::empty()),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, LineInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, LineInner>> {
        self.inner.try_lock().ok()
    }
}

impl Default for LineInner {
    fn default() -> Self {
        Self::empty()
    }
}

impl LineInner {
    fn empty() -> Self {
        Self {
            id: 0,
            state: State::I,
            next_state: None,
            version: 0,
            owner_clock: 0,
            data: None,
            owner: NO_NODE,
            sharers: None,
            listener: None,
            flags: 0,
        }
    }

    /// Resets every field for record reuse. The payload and sharer set are
    /// returned to their pools by the caller beforehand.
    pub fn clear(&mut self) {
        *self = Self::empty();
    }

    pub fn is(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set(&mut self, flag: u8, value: bool) {
        if value {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    pub fn lock_line(&mut self) {
        self.flags |= flags::LOCKED;
    }

    /// Releases the protocol lock. Returns false (with no change) when the
    /// line was not locked.
    pub fn unlock_line(&mut self) -> bool {
        if !self.is(flags::LOCKED) {
            return false;
        }
        self.flags &= !flags::LOCKED;
        true
    }

    pub fn is_locked(&self) -> bool {
        self.is(flags::LOCKED)
    }

    /// Payload size in bytes; the shared-table weight of a line is 1 + size.
    pub fn size(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    pub fn weight(&self) -> u64 {
        1 + self.size() as u64
    }

    pub fn sharers_mut(&mut self) -> &mut HashSet<NodeId> {
        self.sharers.get_or_insert_with(HashSet::new)
    }

    pub fn sharers_contains(&self, node: NodeId) -> bool {
        self.sharers
            .as_ref()
            .map(|s| s.contains(&node))
            .unwrap_or(false)
    }

    pub fn sharers_is_empty(&self) -> bool {
        self.sharers.as_ref().map(|s| s.is_empty()).unwrap_or(true)
    }
}

impl fmt::Debug for LineInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LINE: {:#x} {:?}", self.id, self.state)?;
        if let Some(next) = self.next_state {
            write!(f, " (->{:?})", next)?;
        }
        write!(f, " OWN: {}", self.owner)?;
        write!(f, " SHARE: {:?}", self.sharers)?;
        write!(f, " VER: {}", self.version)?;
        match &self.data {
            Some(d) => write!(f, " DATA: ({} bytes)", d.len())?,
            None => write!(f, " DATA: null")?,
        }
        if self.is_locked() {
            write!(f, " LOCKED")?;
        }
        if self.is(flags::MODIFIED) {
            write!(f, " MODIFIED")?;
        }
        if self.is(flags::SLAVE) {
            write!(f, " SLAVE")?;
        }
        if self.is(flags::DELETED) {
            write!(f, " DELETED")?;
        }
        Ok(())
    }
}

/// Read-only snapshot of a line, for introspection and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineView {
    pub id: LineId,
    pub state: State,
    pub next_state: Option<State>,
    pub owner: NodeId,
    pub version: u64,
    pub locked: bool,
    pub modified: bool,
    pub slave: bool,
    pub deleted: bool,
    pub sharers: Vec<NodeId>,
}

impl LineView {
    pub fn of(l: &LineInner) -> Self {
        let mut sharers: Vec<NodeId> = l
            .sharers
            .as_ref()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        sharers.sort_unstable();
        Self {
            id: l.id,
            state: l.state,
            next_state: l.next_state,
            owner: l.owner,
            version: l.version,
            locked: l.is_locked(),
            modified: l.is(flags::MODIFIED),
            slave: l.is(flags::SLAVE),
            deleted: l.is(flags::DELETED),
            sharers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_round_trip() {
        let mut l = LineInner::empty();
        assert!(!l.is(flags::MODIFIED));
        l.set(flags::MODIFIED, true);
        assert!(l.is(flags::MODIFIED));
        l.set(flags::MODIFIED, false);
        assert!(!l.is(flags::MODIFIED));
    }

    #[test]
    fn test_unlock_without_lock() {
        let mut l = LineInner::empty();
        assert!(!l.unlock_line());
        l.lock_line();
        assert!(l.unlock_line());
        assert!(!l.is_locked());
    }

    #[test]
    fn test_weight_tracks_payload() {
        let mut l = LineInner::empty();
        assert_eq!(l.weight(), 1);
        l.data = Some(vec![0u8; 16]);
        assert_eq!(l.weight(), 17);
    }
}
