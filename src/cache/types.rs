//! Core identifier and protocol types shared across the cache engine.
//!
//! Defines line/node identifiers, the coherence state lattice, per-line
//! flag bits and the line-change bitmask used to drive pending-work drains.

use serde::{Deserialize, Serialize};

/// Identifier of a cached line (a variable-size opaque data item).
pub type LineId = u64;

/// Identifier of a cluster node.
pub type NodeId = i16;

/// Sentinel for "no node" / broadcast target.
pub const NO_NODE: NodeId = -1;

/// Reserved node id designating the directory/server, when the cluster has one.
pub const SERVER: NodeId = 0;

/// Sentinel line id carried by node-level messages.
pub const NO_LINE: LineId = LineId::MAX;

/// Highest reserved line id. Reserved lines are cluster-wide constants that
/// survive deletion.
pub const MAX_RESERVED_ID: LineId = 0xFFFF_FFFF;

/// Returns true if `id` is a reserved (well-known) line id.
pub fn is_reserved(id: LineId) -> bool {
    id <= MAX_RESERVED_ID
}

/// Coherence state of a cached line. The order matters: I < S < O < E, and
/// state comparisons drive the transition logic throughout the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum State {
    /// Invalid: no authoritative copy; last known data may still be present.
    I,
    /// Shared: non-authoritative replica of a line owned elsewhere.
    S,
    /// Owned: authoritative copy with known sharers.
    O,
    /// Exclusive: authoritative copy with no sharers.
    E,
}

impl State {
    /// Strict ordering check used by the transition helpers.
    pub fn is_less_than(self, other: State) -> bool {
        self < other
    }

    /// A line is owned (locally authoritative) iff its state is O or E.
    pub fn is_owned(self) -> bool {
        self >= State::O
    }
}

/// Per-line flag bits.
pub mod flags {
    /// Line is pinned by an in-flight locking operation or transaction.
    pub const LOCKED: u8 = 1;
    /// Local writes not yet acknowledged by the slave.
    pub const MODIFIED: u8 = 1 << 1;
    /// The slave believes this line is owned by the local master.
    pub const SLAVE: u8 = 1 << 2;
    /// Line has been deleted by its owner.
    pub const DELETED: u8 = 1 << 3;
}

/// Bitmask describing what changed on a line during message handling; used
/// to decide which pending operations are worth re-evaluating.
pub type Change = u8;

pub const LINE_NO_CHANGE: Change = 0;
pub const LINE_STATE_CHANGED: Change = 1;
pub const LINE_OWNER_CHANGED: Change = 1 << 1;
pub const LINE_MODIFIED_CHANGED: Change = 1 << 2;
pub const LINE_EVERYTHING_CHANGED: Change = 0xff;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(State::I < State::S);
        assert!(State::S < State::O);
        assert!(State::O < State::E);
        assert!(State::I.is_less_than(State::E));
        assert!(!State::E.is_less_than(State::E));
    }

    #[test]
    fn test_owned_threshold() {
        assert!(!State::I.is_owned());
        assert!(!State::S.is_owned());
        assert!(State::O.is_owned());
        assert!(State::E.is_owned());
    }

    #[test]
    fn test_reserved_ids() {
        assert!(is_reserved(0));
        assert!(is_reserved(MAX_RESERVED_ID));
        assert!(!is_reserved(MAX_RESERVED_ID + 1));
    }
}
