//! Protocol scenario tests driven through a scripted transport and cluster.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::coherence::engine::CoherenceEngine;
use crate::cache::config::CacheConfig;
use crate::cache::error::{CacheError, NodeNotFound};
use crate::cache::message::{Message, MessageKind};
use crate::cache::monitor::NoopMonitor;
use crate::cache::ops::{OpExtra, OpKind, OpValue};
use crate::cache::traits::{
    Backup, CacheListener, Cluster, Comm, HeapStorage, MessageReceiver, NullBackup,
    SerialIdAllocator,
};
use crate::cache::types::{LineId, NO_NODE, NodeId, SERVER, State};

const WAIT: Duration = Duration::from_millis(100);

/// Transport that records outbound traffic and can simulate dead targets.
struct TestComm {
    sent: Mutex<Vec<Message>>,
    dead: Mutex<HashSet<NodeId>>,
}

impl TestComm {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            dead: Mutex::new(HashSet::new()),
        })
    }

    fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    fn sent_kinds(&self) -> Vec<(&'static str, NodeId)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| (m.kind_name(), m.node))
            .collect()
    }

    fn kill(&self, node: NodeId) {
        self.dead.lock().unwrap().insert(node);
    }
}

impl Comm for TestComm {
    fn send(&self, msg: &Message) -> Result<(), NodeNotFound> {
        if self.dead.lock().unwrap().contains(&msg.node) {
            return Err(NodeNotFound(msg.node));
        }
        self.sent.lock().unwrap().push(msg.clone());
        Ok(())
    }
}

struct TestCluster {
    me: NodeId,
    master: AtomicBool,
    server: bool,
    members: Mutex<HashSet<NodeId>>,
}

impl TestCluster {
    fn new(me: NodeId, server: bool) -> Arc<Self> {
        Arc::new(Self {
            me,
            master: AtomicBool::new(true),
            server,
            members: Mutex::new([1, 2, 3, 4].into_iter().collect()),
        })
    }

    fn remove_member(&self, node: NodeId) {
        self.members.lock().unwrap().remove(&node);
    }
}

impl Cluster for TestCluster {
    fn my_node_id(&self) -> NodeId {
        self.me
    }

    fn is_master(&self) -> bool {
        self.master.load(Ordering::Relaxed)
    }

    fn has_server(&self) -> bool {
        self.server
    }

    fn get_master(&self, node: NodeId) -> Option<NodeId> {
        self.members
            .lock()
            .unwrap()
            .contains(&node)
            .then_some(node)
    }
}

#[derive(Default)]
struct RecordingListener {
    invalidated: Mutex<Vec<LineId>>,
    received: Mutex<Vec<(LineId, u64)>>,
    evicted: Mutex<Vec<LineId>>,
}

impl CacheListener for RecordingListener {
    fn invalidated(&self, id: LineId) {
        self.invalidated.lock().unwrap().push(id);
    }

    fn received(&self, id: LineId, version: u64, _data: Option<&[u8]>) {
        self.received.lock().unwrap().push((id, version));
    }

    fn evicted(&self, id: LineId) {
        self.evicted.lock().unwrap().push(id);
    }
}

#[derive(Default)]
struct RecordingReceiver {
    messages: Mutex<Vec<Message>>,
}

impl MessageReceiver for RecordingReceiver {
    fn receive(&self, msg: Message) {
        self.messages.lock().unwrap().push(msg);
    }
}

/// One engine under test plus its scripted collaborators.
struct Rig {
    engine: Arc<CoherenceEngine>,
    comm: Arc<TestComm>,
    cluster: Arc<TestCluster>,
    seq: AtomicI64,
}

/// Backup whose `inv` answers can be scripted: while `dirty` is set the
/// slave refuses to confirm it has no stale view.
struct StickyBackup {
    dirty: AtomicBool,
}

impl StickyBackup {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            dirty: AtomicBool::new(false),
        })
    }
}

impl Backup for StickyBackup {
    fn start_backup(&self) {}
    fn backup(&self, _id: LineId, _version: u64) {}
    fn end_backup(&self) {}
    fn flush(&self) {}
    fn inv(&self, _id: LineId, _sharer: NodeId) -> bool {
        !self.dirty.load(Ordering::Relaxed)
    }
    fn receive(&self, _msg: Message) {}
}

impl Rig {
    fn new(server: bool) -> Self {
        Self::with_config(server, CacheConfig::default())
    }

    fn with_config(server: bool, config: CacheConfig) -> Self {
        Self::with_parts(server, config, Arc::new(NullBackup))
    }

    fn with_parts(server: bool, config: CacheConfig, backup: Arc<dyn Backup>) -> Self {
        let comm = TestComm::new();
        let cluster = TestCluster::new(1, server);
        let engine = CoherenceEngine::new(
            config,
            cluster.clone(),
            comm.clone(),
            backup,
            Arc::new(HeapStorage),
            Arc::new(SerialIdAllocator::default()),
            Arc::new(NoopMonitor),
        )
        .expect("engine construction");
        Self {
            engine: Arc::new(engine),
            comm,
            cluster,
            seq: AtomicI64::new(1000),
        }
    }

    /// Delivers an inbound message from `from` with a fresh monotonic id.
    fn deliver(&self, from: NodeId, kind: MessageKind) -> i64 {
        let msg_id = self.seq.fetch_add(1, Ordering::Relaxed);
        self.deliver_with_id(from, msg_id, kind);
        msg_id
    }

    fn deliver_with_id(&self, from: NodeId, msg_id: i64, kind: MessageKind) {
        let mut msg = Message::new(from, msg_id, kind);
        msg.incoming = true;
        self.engine.receive(msg);
    }

    /// PUT + release + backup-ack: an unlocked, unmodified owned line.
    fn put_settled(&self, data: &[u8]) -> LineId {
        let id = match self
            .engine
            .do_op(OpKind::Put, 0, Some(data.to_vec()), OpExtra::None, None)
            .expect("put")
        {
            OpValue::Id(id) => id,
            other => panic!("unexpected put result {:?}", other),
        };
        self.engine.release(id);
        let version = self.engine.inspect(id).unwrap().version;
        self.deliver(1, MessageKind::BackupAck { line: id, version });
        id
    }

    /// Creates a shared (S) replica of `id` owned by `owner`.
    fn seed_shared(&self, id: LineId, owner: NodeId, version: u64, data: &[u8]) {
        let pending = self
            .engine
            .do_op_async(OpKind::Get, id, None, OpExtra::None, None)
            .expect("get");
        self.deliver(
            owner,
            MessageKind::Put {
                line: id,
                version,
                data: Some(data.to_vec()),
            },
        );
        assert!(matches!(pending.get(WAIT), Ok(OpValue::Data(Some(_)))));
        self.comm.take_sent();
    }
}

// ---------------------------------------------------------------- scenarios

#[test]
fn test_put_then_remote_get_shares_line() {
    let rig = Rig::new(false);
    let id = rig.put_settled(&[0x42]);

    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.state, State::E);
    assert_eq!(view.owner, 1);
    assert_eq!(view.version, 1);
    assert!(!view.locked);
    assert!(!view.modified);

    rig.comm.take_sent();
    rig.deliver(2, MessageKind::Get { line: id });

    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.state, State::O);
    assert_eq!(view.sharers, vec![2]);

    let sent = rig.comm.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].node, 2);
    match &sent[0].kind {
        MessageKind::Put {
            line,
            version,
            data,
        } => {
            assert_eq!(*line, id);
            assert_eq!(*version, 1);
            assert_eq!(data.as_deref(), Some(&[0x42][..]));
        }
        other => panic!("expected PUT, got {:?}", other),
    }
}

#[test]
fn test_remote_getx_transfers_ownership() {
    let rig = Rig::new(false);
    let id = rig.put_settled(&[7]);
    rig.deliver(2, MessageKind::Get { line: id });
    rig.comm.take_sent();

    // the sharer asks for exclusive ownership
    rig.deliver(2, MessageKind::GetX { line: id });

    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.state, State::I);
    assert_eq!(view.owner, 2);

    let sent = rig.comm.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].node, 2);
    match &sent[0].kind {
        MessageKind::PutX {
            line,
            sharers,
            version,
            ..
        } => {
            assert_eq!(*line, id);
            assert_eq!(*version, 1);
            assert_eq!(sharers, &vec![2]);
        }
        other => panic!("expected PUTX, got {:?}", other),
    }
}

#[test]
fn test_getx_on_empty_putx_reaches_exclusive() {
    let rig = Rig::new(false);
    let id = 0x1_0000_0010;

    let future = rig
        .engine
        .do_op_async(OpKind::GetX, id, None, OpExtra::None, None)
        .expect("getx");
    // owner unknown: a broadcast GETX goes out
    let sent = rig.comm.take_sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0].kind, MessageKind::GetX { .. }));
    assert_eq!(sent[0].node, NO_NODE);

    rig.deliver(
        2,
        MessageKind::PutX {
            line: id,
            sharers: vec![],
            version: 5,
            data: Some(vec![9]),
        },
    );

    assert_eq!(future.get(WAIT), Ok(OpValue::Data(Some(vec![9]))));
    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.state, State::E);
    assert_eq!(view.owner, 1);
    assert_eq!(view.version, 5);
    assert!(view.locked);
}

#[test]
fn test_three_node_exclusive_waits_for_sharer_invack() {
    let rig = Rig::new(false);
    let id = 0x1_0000_0020;

    let future = rig
        .engine
        .do_op_async(OpKind::GetX, id, None, OpExtra::None, None)
        .expect("getx");
    rig.comm.take_sent();

    // previous owner hands over ownership with one remaining sharer
    rig.deliver(
        2,
        MessageKind::PutX {
            line: id,
            sharers: vec![3],
            version: 2,
            data: Some(vec![1, 2]),
        },
    );

    // the op completes at O; the sharer is invalidated with the previous
    // owner recorded for INVACK routing
    assert_eq!(future.get(WAIT), Ok(OpValue::Data(Some(vec![1, 2]))));
    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.state, State::O);
    assert_eq!(view.owner, 2);
    assert_eq!(view.sharers, vec![3]);
    assert_eq!(view.next_state, Some(State::E));

    let sent = rig.comm.take_sent();
    let invs: Vec<_> = sent
        .iter()
        .filter(|m| matches!(m.kind, MessageKind::Inv { .. }))
        .collect();
    assert_eq!(invs.len(), 1);
    assert_eq!(invs[0].node, 3);
    match invs[0].kind {
        MessageKind::Inv { previous_owner, .. } => assert_eq!(previous_owner, 2),
        _ => unreachable!(),
    }

    // the final INVACK empties the sharer set and completes the transition
    rig.deliver(3, MessageKind::InvAck { line: id });
    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.state, State::E);
    assert_eq!(view.owner, 1);
    assert!(view.sharers.is_empty());
    assert_eq!(view.next_state, None);
}

#[test]
fn test_get_message_held_while_locked() {
    let rig = Rig::new(false);
    let id = match rig
        .engine
        .do_op(OpKind::Put, 0, Some(vec![5]), OpExtra::None, None)
        .unwrap()
    {
        OpValue::Id(id) => id,
        _ => unreachable!(),
    };
    // line still locked by the PUT
    rig.comm.take_sent();

    rig.deliver(2, MessageKind::Get { line: id });
    assert!(rig.comm.take_sent().is_empty());
    assert_eq!(rig.engine.inspect(id).unwrap().state, State::E);

    rig.engine.release(id);
    let version = rig.engine.inspect(id).unwrap().version;
    rig.deliver(1, MessageKind::BackupAck { line: id, version });

    // the held GET drains once the line is unlocked and backed up
    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.state, State::O);
    assert_eq!(view.sharers, vec![2]);
    assert!(rig
        .comm
        .sent_kinds()
        .contains(&("PUT", 2)));
}

#[test]
fn test_inv_held_by_lock_applies_on_release() {
    let rig = Rig::new(false);
    let id = 0x1_0000_0030;
    rig.seed_shared(id, 2, 1, &[1]);

    // lock the line under a read
    let data = rig.engine.do_op(OpKind::GetS, id, None, OpExtra::None, None);
    assert!(matches!(data, Ok(OpValue::Data(Some(_)))));
    assert!(rig.engine.is_locked(id));

    rig.deliver(2, MessageKind::Inv {
        line: id,
        previous_owner: 2,
    });
    // held: the lock wins over the invalidation
    assert_eq!(rig.engine.inspect(id).unwrap().state, State::S);
    assert!(rig.comm.take_sent().is_empty());

    rig.engine.release(id);

    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.state, State::I);
    assert!(rig.comm.sent_kinds().contains(&("INVACK", 2)));
}

#[test]
fn test_stale_read_allowed_until_owner_puts_again() {
    let rig = Rig::new(false);
    let id = 0x1_0000_0040;
    rig.seed_shared(id, 2, 1, &[0xAA]);

    rig.deliver(2, MessageKind::Inv {
        line: id,
        previous_owner: 2,
    });
    assert_eq!(rig.engine.inspect(id).unwrap().state, State::I);

    // the line was invalidated after the owner's last put: its data is
    // still a consistent view and may be served without a fetch
    let stale = rig
        .engine
        .do_op(OpKind::Get, id, None, OpExtra::None, None)
        .unwrap();
    assert_eq!(stale, OpValue::Data(Some(vec![0xAA])));

    // a newer put from the same owner poisons every stale line it owns
    rig.deliver(
        2,
        MessageKind::Put {
            line: id + 1,
            version: 1,
            data: Some(vec![1]),
        },
    );

    let fetch = rig
        .engine
        .do_op_async(OpKind::Get, id, None, OpExtra::None, None)
        .unwrap();
    assert_eq!(fetch.try_get(), None); // must go to the network now

    rig.deliver(
        2,
        MessageKind::Put {
            line: id,
            version: 2,
            data: Some(vec![0xBB]),
        },
    );
    assert_eq!(fetch.get(WAIT), Ok(OpValue::Data(Some(vec![0xBB]))));
}

#[test]
fn test_node_removed_sweeps_lines() {
    let rig = Rig::new(true);

    // a shared line owned by node 3
    let shared_id = 0x1_0000_0050;
    rig.seed_shared(shared_id, 3, 1, &[1]);

    // an owned line with node 3 as its only sharer
    let owned_id = rig.put_settled(&[2]);
    rig.deliver(3, MessageKind::Get { line: owned_id });
    assert_eq!(rig.engine.inspect(owned_id).unwrap().sharers, vec![3]);

    rig.cluster.remove_member(3);
    rig.engine.node_removed(3);

    let view = rig.engine.inspect(shared_id).unwrap();
    assert_eq!(view.state, State::I);
    assert_eq!(view.owner, SERVER);

    let view = rig.engine.inspect(owned_id).unwrap();
    assert_eq!(view.state, State::E);
    assert!(view.sharers.is_empty());
}

#[test]
fn test_not_found_marks_deleted_and_reserved_id_resurrects() {
    let rig = Rig::new(false);
    let reserved = 5; // within the reserved range

    let future = rig
        .engine
        .do_op_async(OpKind::Set, reserved, Some(vec![3]), OpExtra::None, None)
        .expect("set");
    rig.comm.take_sent();

    rig.deliver(2, MessageKind::NotFound { line: reserved });

    // NOT_FOUND marked the line deleted; a reserved id resurrects as E and
    // the pending SET completes against the fresh line
    assert_eq!(future.get(WAIT), Ok(OpValue::Unit));
    let view = rig.engine.inspect(reserved).unwrap();
    assert_eq!(view.state, State::E);
    assert!(!view.deleted);
    assert_eq!(view.version, 1);
}

#[test]
fn test_del_with_server_waits_for_server_invack() {
    let rig = Rig::new(true);
    let id = rig.put_settled(&[4]);
    rig.comm.take_sent();

    rig.engine
        .do_op(OpKind::Del, id, None, OpExtra::None, None)
        .expect("del");

    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.state, State::O);
    assert!(view.deleted);
    assert_eq!(view.sharers, vec![SERVER]);
    assert!(rig.comm.sent_kinds().contains(&("DEL", SERVER)));

    // the directory acknowledges: the deleted line drops O -> I
    rig.deliver(SERVER, MessageKind::InvAck { line: id });
    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.state, State::I);
    assert!(view.deleted);
}

#[test]
fn test_size_exceeded_is_synchronous() {
    let rig = Rig::new(false);
    let oversized = vec![0u8; 1025];

    let res = rig
        .engine
        .do_op(OpKind::Put, 0, Some(oversized.clone()), OpExtra::None, None);
    assert!(matches!(res, Err(CacheError::SizeExceeded { size: 1025, .. })));

    let id = rig.put_settled(&[1]);
    let res = rig
        .engine
        .do_op(OpKind::Set, id, Some(oversized), OpExtra::None, None);
    assert!(matches!(res, Err(CacheError::SizeExceeded { .. })));

    // boundary: exactly max_item_size succeeds
    let res = rig
        .engine
        .do_op(OpKind::Set, id, Some(vec![0u8; 1024]), OpExtra::None, None);
    assert!(res.is_ok());
}

#[test]
fn test_slave_refuses_grid_ops() {
    let rig = Rig::new(false);
    rig.cluster.master.store(false, Ordering::Relaxed);

    let res = rig.engine.do_op(OpKind::Get, 10, None, OpExtra::None, None);
    assert_eq!(res.unwrap_err(), CacheError::NotMaster);

    // only LSTN is permitted on a slave
    let listener = Arc::new(RecordingListener::default());
    let res = rig
        .engine
        .do_op(OpKind::Listen, 10, None, OpExtra::Listener(listener), None);
    assert!(res.is_ok());
}

#[test]
fn test_compare_before_write_skips_version_bump() {
    let rig = Rig::new(false);
    let id = rig.put_settled(&[1, 2, 3]);

    rig.engine
        .do_op(OpKind::Set, id, Some(vec![1, 2, 3]), OpExtra::None, None)
        .expect("identical set");
    assert_eq!(rig.engine.inspect(id).unwrap().version, 1);

    rig.engine
        .do_op(OpKind::Set, id, Some(vec![9, 9, 9]), OpExtra::None, None)
        .expect("different set");
    assert_eq!(rig.engine.inspect(id).unwrap().version, 2);
}

#[test]
fn test_eviction_sends_invack_and_fires_listener() {
    let config = CacheConfig {
        max_capacity: 12,
        ..CacheConfig::default()
    };
    let rig = Rig::with_config(false, config);
    let listener = Arc::new(RecordingListener::default());
    rig.engine.add_cache_listener(listener.clone());

    let base = 0x1_0000_0100u64;
    for i in 0..6 {
        rig.deliver(
            2,
            MessageKind::Put {
                line: base + i,
                version: 1,
                data: Some(vec![0u8; 4]),
            },
        );
    }

    // weight 5 each against capacity 12: early lines must have been evicted
    assert!(rig.engine.inspect(base).is_none());
    assert!(!listener.evicted.lock().unwrap().is_empty());
    let invacks: Vec<_> = rig
        .comm
        .take_sent()
        .into_iter()
        .filter(|m| matches!(m.kind, MessageKind::InvAck { .. }))
        .collect();
    assert!(!invacks.is_empty());
    assert!(invacks.iter().all(|m| m.node == 2));
}

#[test]
fn test_timeout_message_fails_pending_ops() {
    let rig = Rig::new(false);
    let id = 0x1_0000_0060;

    let future = rig
        .engine
        .do_op_async(OpKind::Get, id, None, OpExtra::None, None)
        .expect("get");
    assert_eq!(future.try_get(), None);

    rig.deliver(1, MessageKind::Timeout { line: id });
    assert_eq!(future.get(WAIT), Err(CacheError::Timeout));
    assert_eq!(rig.engine.inspect(id).unwrap().next_state, None);
}

#[test]
fn test_transaction_rollback_restores_snapshot() {
    let rig = Rig::new(false);

    let txn = rig.engine.begin_transaction();
    let id = match rig
        .engine
        .do_op(
            OpKind::Put,
            0,
            Some(vec![1]),
            OpExtra::None,
            Some(txn.clone()),
        )
        .unwrap()
    {
        OpValue::Id(id) => id,
        _ => unreachable!(),
    };
    rig.engine.end_transaction(&txn, false).expect("commit");
    let version = rig.engine.inspect(id).unwrap().version;
    rig.deliver(1, MessageKind::BackupAck { line: id, version });

    let txn2 = rig.engine.begin_transaction();
    let read = rig
        .engine
        .do_op(OpKind::GetS, id, None, OpExtra::None, Some(txn2.clone()))
        .unwrap();
    assert_eq!(read, OpValue::Data(Some(vec![1])));

    rig.engine
        .do_op(
            OpKind::Set,
            id,
            Some(vec![2]),
            OpExtra::None,
            Some(txn2.clone()),
        )
        .expect("set");
    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.version, 2);
    assert!(view.modified);

    rig.engine.rollback(&txn2).expect("rollback");
    rig.engine.end_transaction(&txn2, true).expect("abort");

    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.version, 1);
    assert!(!view.modified);
    assert!(!view.locked);
    let data = rig
        .engine
        .do_op(OpKind::Get, id, None, OpExtra::None, None)
        .unwrap();
    assert_eq!(data, OpValue::Data(Some(vec![1])));
}

#[test]
fn test_send_delivers_locally_when_owner() {
    let rig = Rig::new(false);
    let receiver = Arc::new(RecordingReceiver::default());
    rig.engine.set_receiver(receiver.clone());

    let id = rig.put_settled(&[1]);
    let msg = rig.engine.msg(
        NO_NODE,
        MessageKind::Msg {
            line: id,
            data: vec![0xCA, 0xFE],
            reply_required: true,
        },
    );
    let res = rig
        .engine
        .do_op(OpKind::Send, id, None, OpExtra::Msg(msg), None)
        .expect("send");
    assert_eq!(res, OpValue::Unit);

    let delivered = receiver.messages.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    match &delivered[0].kind {
        MessageKind::Msg {
            data,
            reply_required,
            ..
        } => {
            assert_eq!(data, &vec![0xCA, 0xFE]);
            assert!(!reply_required); // local redelivery never asks for an ack
        }
        other => panic!("expected MSG, got {:?}", other),
    }
}

#[test]
fn test_send_forwards_to_owner_and_completes_on_msgack() {
    let rig = Rig::new(false);
    let id = 0x1_0000_0070;
    rig.seed_shared(id, 2, 1, &[1]);

    let msg = rig.engine.msg(
        NO_NODE,
        MessageKind::Msg {
            line: id,
            data: vec![1, 2, 3],
            reply_required: true,
        },
    );
    let sent_id = msg.msg_id;
    let future = rig
        .engine
        .do_op_async(OpKind::Send, id, None, OpExtra::Msg(msg), None)
        .expect("send");
    assert_eq!(future.try_get(), None);

    let sent = rig.comm.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].node, 2);
    assert_eq!(sent[0].msg_id, sent_id);

    rig.deliver_with_id(2, sent_id, MessageKind::MsgAck { line: id });
    assert_eq!(future.get(WAIT), Ok(OpValue::Unit));
}

#[test]
fn test_push_replicates_and_pushx_transfers() {
    let rig = Rig::new(false);

    let id = rig.put_settled(&[8]);
    rig.comm.take_sent();
    rig.engine
        .do_op(OpKind::Push, id, None, OpExtra::Nodes(vec![2, 3]), None)
        .expect("push");
    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.state, State::O);
    assert_eq!(view.sharers, vec![2, 3]);
    let kinds = rig.comm.sent_kinds();
    assert!(kinds.contains(&("PUT", 2)));
    assert!(kinds.contains(&("PUT", 3)));

    let id2 = rig.put_settled(&[9]);
    rig.comm.take_sent();
    rig.engine
        .do_op(OpKind::PushX, id2, None, OpExtra::Node(2), None)
        .expect("pushx");
    let view = rig.engine.inspect(id2).unwrap();
    assert_eq!(view.state, State::I);
    assert_eq!(view.owner, 2);
    assert!(rig.comm.sent_kinds().contains(&("PUTX", 2)));
}

#[test]
fn test_departed_node_triggers_auto_response_and_retry() {
    let rig = Rig::new(false);
    let id = 0x1_0000_0080;
    rig.seed_shared(id, 2, 1, &[1]);

    rig.comm.kill(2);
    rig.cluster.remove_member(2);

    let future = rig
        .engine
        .do_op_async(OpKind::GetX, id, None, OpExtra::None, None)
        .expect("getx");
    assert_eq!(future.try_get(), None);

    // the GETX to the dead owner was answered by a synthesized
    // CHNGD_OWNR(-1): the owner belief resets and the op rebroadcasts
    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.owner, NO_NODE);
    let sent = rig.comm.take_sent();
    assert!(sent
        .iter()
        .any(|m| matches!(m.kind, MessageKind::GetX { .. }) && m.node == NO_NODE));
}

#[test]
fn test_listener_fires_on_invalidate_and_receive() {
    let rig = Rig::new(false);
    let id = 0x1_0000_0090;
    let listener = Arc::new(RecordingListener::default());

    rig.engine
        .do_op(
            OpKind::Listen,
            id,
            None,
            OpExtra::Listener(listener.clone()),
            None,
        )
        .expect("listen");

    rig.deliver(
        2,
        MessageKind::Put {
            line: id,
            version: 1,
            data: Some(vec![1]),
        },
    );
    assert_eq!(*listener.received.lock().unwrap(), vec![(id, 1)]);

    rig.deliver(2, MessageKind::Inv {
        line: id,
        previous_owner: 2,
    });
    assert_eq!(*listener.invalidated.lock().unwrap(), vec![id]);
}

#[test]
fn test_alloc_creates_consecutive_owned_lines() {
    let rig = Rig::new(false);
    let first = match rig
        .engine
        .do_op(OpKind::Alloc, 0, None, OpExtra::Count(3), None)
        .unwrap()
    {
        OpValue::Id(id) => id,
        _ => unreachable!(),
    };

    for i in 0..3 {
        let view = rig.engine.inspect(first + i).unwrap();
        assert_eq!(view.state, State::E);
        assert_eq!(view.owner, 1);
        assert!(view.locked);
    }
}

#[test]
fn test_slave_receives_backup_as_exclusive() {
    let rig = Rig::new(false);
    rig.cluster.master.store(false, Ordering::Relaxed);

    rig.deliver(
        1,
        MessageKind::Backup {
            line: 77,
            version: 4,
            data: Some(vec![6]),
        },
    );

    let view = rig.engine.inspect(77).unwrap();
    assert_eq!(view.state, State::E);
    assert_eq!(view.owner, 1);
    assert_eq!(view.version, 4);

    // replays with an older version are ignored
    rig.deliver(
        1,
        MessageKind::Backup {
            line: 77,
            version: 3,
            data: Some(vec![9]),
        },
    );
    assert_eq!(rig.engine.inspect(77).unwrap().version, 4);
}

#[test]
fn test_inv_waits_for_slave_confirmation() {
    let backup = StickyBackup::new();
    let rig = Rig::with_parts(false, CacheConfig::default(), backup.clone());
    backup.dirty.store(true, Ordering::Relaxed);

    let id = rig.put_settled(&[1]);
    rig.deliver(2, MessageKind::Get { line: id });

    // ownership leaves while our slave still believes we own the line: we
    // stay a sharer of our own slave and drop only to S
    rig.deliver(2, MessageKind::GetX { line: id });
    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.state, State::S);
    assert!(view.slave);
    assert_eq!(view.owner, 2);
    rig.comm.take_sent();

    // the new owner invalidates us; the INV must wait for the slave
    rig.deliver(
        2,
        MessageKind::Inv {
            line: id,
            previous_owner: 2,
        },
    );
    assert!(rig.engine.inspect(id).unwrap().slave);
    assert!(rig.comm.take_sent().is_empty()); // no INVACK yet

    // the slave confirms: SLAVE clears and the held INV is answered
    backup.dirty.store(false, Ordering::Relaxed);
    rig.deliver(1, MessageKind::InvAck { line: id });

    let view = rig.engine.inspect(id).unwrap();
    assert!(!view.slave);
    assert_eq!(view.state, State::I);
    assert!(rig.comm.sent_kinds().contains(&("INVACK", 2)));
}

#[test]
fn test_version_gate_ignores_stale_put() {
    let rig = Rig::new(false);
    let id = 0x1_0000_00A0;
    rig.seed_shared(id, 2, 3, &[3]);

    rig.deliver(
        2,
        MessageKind::Put {
            line: id,
            version: 2,
            data: Some(vec![0xFF]),
        },
    );

    let view = rig.engine.inspect(id).unwrap();
    assert_eq!(view.version, 3);
    let data = rig
        .engine
        .do_op(OpKind::Get, id, None, OpExtra::None, None)
        .unwrap();
    assert_eq!(data, OpValue::Data(Some(vec![3])));
}
