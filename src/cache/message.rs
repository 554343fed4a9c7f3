//! Coherence wire messages.
//!
//! Every message carries the peer node id (the target when outbound, the
//! sender once received) and a message id that is monotonically increasing
//! per sender; the owner-clock mechanism depends on that monotonicity.

use serde::{Deserialize, Serialize};

use crate::cache::types::{LineId, NO_LINE, NO_NODE, NodeId};

/// A coherence protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Peer node: the target when sending, the sender once received.
    pub node: NodeId,
    /// Monotonic per-sender message id.
    pub msg_id: i64,
    /// Set once the message has been received (or short-circuited) rather
    /// than built for sending.
    #[serde(skip)]
    pub incoming: bool,
    /// Set by the transport when the message was delivered via broadcast.
    #[serde(skip)]
    pub broadcast: bool,
    /// Local receive timestamp, for pending-delay reporting.
    #[serde(skip)]
    pub received_at: Option<std::time::Instant>,
    pub kind: MessageKind,
}

/// The closed set of wire message kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Request a shared copy of a line.
    Get { line: LineId },
    /// Request exclusive ownership of a line.
    GetX { line: LineId },
    /// Owner's reply carrying a shared copy.
    Put {
        line: LineId,
        version: u64,
        data: Option<Vec<u8>>,
    },
    /// Ownership transfer carrying the previous owner's sharer set.
    PutX {
        line: LineId,
        sharers: Vec<NodeId>,
        version: u64,
        data: Option<Vec<u8>>,
    },
    /// Invalidate a shared copy. `previous_owner` routes the INVACK when the
    /// sender is not the owner of record.
    Inv {
        line: LineId,
        previous_owner: NodeId,
    },
    /// Acknowledge an invalidation.
    InvAck { line: LineId },
    /// The line does not exist at the directory (or the owner).
    NotFound { line: LineId },
    /// Redirect: the line is believed owned by `new_owner`.
    ChngdOwnr {
        line: LineId,
        new_owner: NodeId,
        certain: bool,
    },
    /// Owner-directed user message (line-level when `line != NO_LINE`).
    Msg {
        line: LineId,
        data: Vec<u8>,
        reply_required: bool,
    },
    /// Acknowledges a Msg, matched by message id.
    MsgAck { line: LineId },
    /// Owner notifies the directory of a deletion.
    Del { line: LineId },
    /// Master-to-slave replication of a line (slave side only).
    Backup {
        line: LineId,
        version: u64,
        data: Option<Vec<u8>>,
    },
    /// Slave acknowledges replication up to `version`.
    BackupAck { line: LineId, version: u64 },
    /// Transport-level ack of a backup packet; routed to the Backup
    /// collaborator, not the line state machine.
    BackupPacketAck { id: u64 },
    /// Transport-generated timeout for the line's in-flight work.
    Timeout { line: LineId },
    /// Node-level acknowledgement of a broadcast we cannot answer.
    Ack { line: LineId },
}

impl Message {
    pub fn new(node: NodeId, msg_id: i64, kind: MessageKind) -> Self {
        Self {
            node,
            msg_id,
            incoming: false,
            broadcast: false,
            received_at: None,
            kind,
        }
    }

    /// The line this message addresses, if any. Node-level messages carry
    /// [`NO_LINE`].
    pub fn line(&self) -> Option<LineId> {
        let id = match self.kind {
            MessageKind::Get { line }
            | MessageKind::GetX { line }
            | MessageKind::Put { line, .. }
            | MessageKind::PutX { line, .. }
            | MessageKind::Inv { line, .. }
            | MessageKind::InvAck { line }
            | MessageKind::NotFound { line }
            | MessageKind::ChngdOwnr { line, .. }
            | MessageKind::Msg { line, .. }
            | MessageKind::MsgAck { line }
            | MessageKind::Del { line }
            | MessageKind::Backup { line, .. }
            | MessageKind::BackupAck { line, .. }
            | MessageKind::Timeout { line }
            | MessageKind::Ack { line } => line,
            MessageKind::BackupPacketAck { .. } => NO_LINE,
        };
        if id == NO_LINE { None } else { Some(id) }
    }

    /// True when the message targets no specific node.
    pub fn is_broadcast(&self) -> bool {
        if self.incoming {
            self.broadcast
        } else {
            self.node == NO_NODE
        }
    }

    /// Short name of the kind, for logs and monitoring.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            MessageKind::Get { .. } => "GET",
            MessageKind::GetX { .. } => "GETX",
            MessageKind::Put { .. } => "PUT",
            MessageKind::PutX { .. } => "PUTX",
            MessageKind::Inv { .. } => "INV",
            MessageKind::InvAck { .. } => "INVACK",
            MessageKind::NotFound { .. } => "NOT_FOUND",
            MessageKind::ChngdOwnr { .. } => "CHNGD_OWNR",
            MessageKind::Msg { .. } => "MSG",
            MessageKind::MsgAck { .. } => "MSGACK",
            MessageKind::Del { .. } => "DEL",
            MessageKind::Backup { .. } => "BACKUP",
            MessageKind::BackupAck { .. } => "BACKUPACK",
            MessageKind::BackupPacketAck { .. } => "BACKUP_PACKETACK",
            MessageKind::Timeout { .. } => "TIMEOUT",
            MessageKind::Ack { .. } => "ACK",
        }
    }

    /// Pending-message dedup key: a re-delivered message is identified by its
    /// sender and id.
    pub fn dedup_key(&self) -> (NodeId, i64) {
        (self.node, self.msg_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_extraction() {
        let m = Message::new(2, 7, MessageKind::Get { line: 10 });
        assert_eq!(m.line(), Some(10));

        let m = Message::new(
            2,
            8,
            MessageKind::Msg {
                line: NO_LINE,
                data: vec![1],
                reply_required: true,
            },
        );
        assert_eq!(m.line(), None);
    }

    #[test]
    fn test_broadcast_detection() {
        let mut m = Message::new(NO_NODE, 1, MessageKind::Get { line: 3 });
        assert!(m.is_broadcast());
        m.incoming = true;
        assert!(!m.is_broadcast());
        m.broadcast = true;
        assert!(m.is_broadcast());
    }
}
