//! Operation records, futures and the dispatch-track classification.
//!
//! Fast-track ops resolve on the caller's thread without allocating a record;
//! everything else becomes an [`Op`] with a completion future and may sit in
//! a line's pending queue until a state change drains it.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::cache::error::CacheError;
use crate::cache::message::Message;
use crate::cache::traits::CacheListener;
use crate::cache::txn::Transaction;
use crate::cache::types::{LineId, NodeId};

/// The closed set of local operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Get,
    GetS,
    GetX,
    Set,
    Del,
    Send,
    Push,
    PushX,
    Put,
    Alloc,
    Listen,
}

impl OpKind {
    /// Ops eligible for the fast track (no record allocation) when the line
    /// already exists and can be served without a state change.
    pub fn is_fast_track(self) -> bool {
        matches!(
            self,
            OpKind::Get | OpKind::GetS | OpKind::GetX | OpKind::Set | OpKind::Del | OpKind::Listen
        )
    }

    /// Ops that acquire the line's protocol lock.
    pub fn is_locking(self) -> bool {
        matches!(
            self,
            OpKind::GetS | OpKind::GetX | OpKind::Set | OpKind::Del
        )
    }

    pub fn is_push(self) -> bool {
        matches!(self, OpKind::Push | OpKind::PushX)
    }

    /// Ops counted against the hit/miss statistics.
    pub fn is_hit_or_miss(self) -> bool {
        matches!(
            self,
            OpKind::Get | OpKind::GetS | OpKind::GetX | OpKind::Set | OpKind::Del
        )
    }
}

/// Value produced by a completed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpValue {
    Unit,
    Data(Option<Vec<u8>>),
    Id(LineId),
}

impl OpValue {
    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            OpValue::Data(d) => d,
            _ => None,
        }
    }

    pub fn into_id(self) -> Option<LineId> {
        match self {
            OpValue::Id(id) => Some(id),
            _ => None,
        }
    }
}

/// Operation-specific argument.
pub enum OpExtra {
    None,
    /// Node to try when the owner is unknown (GET/GETX/SET/DEL).
    NodeHint(NodeId),
    /// Target sharers of a PUSH.
    Nodes(Vec<NodeId>),
    /// Ownership-transfer target of a PUSHX.
    Node(NodeId),
    /// Number of consecutive ids for ALLOC.
    Count(u64),
    /// The user message a SEND routes to the line's owner.
    Msg(Message),
    /// The per-line listener installed by LSTN.
    Listener(Arc<dyn CacheListener>),
}

impl fmt::Debug for OpExtra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpExtra::None => write!(f, "-"),
            OpExtra::NodeHint(n) => write!(f, "hint:{}", n),
            OpExtra::Nodes(n) => write!(f, "nodes:{:?}", n),
            OpExtra::Node(n) => write!(f, "node:{}", n),
            OpExtra::Count(c) => write!(f, "count:{}", c),
            OpExtra::Msg(m) => write!(f, "msg:{}", m.msg_id),
            OpExtra::Listener(_) => write!(f, "listener"),
        }
    }
}

pub type OpOutcome = Result<OpValue, CacheError>;

/// Memoizing completion future for a deferred op. Completion is one-shot;
/// every waiter observes the same outcome.
#[derive(Clone)]
pub struct OpFuture {
    tx: Sender<OpOutcome>,
    rx: Receiver<OpOutcome>,
    memo: Arc<Mutex<Option<OpOutcome>>>,
}

impl OpFuture {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self {
            tx,
            rx,
            memo: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolves the future. The first completion wins; later ones are
    /// ignored.
    pub fn set(&self, outcome: OpOutcome) {
        let _ = self.tx.try_send(outcome);
    }

    /// Blocks until the outcome is available or `timeout` elapses.
    pub fn get(&self, timeout: Duration) -> OpOutcome {
        let mut memo = match self.memo.lock() {
            Ok(memo) => memo,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(outcome) = memo.as_ref() {
            return outcome.clone();
        }
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => {
                *memo = Some(outcome.clone());
                outcome
            }
            Err(_) => Err(CacheError::Timeout),
        }
    }

    /// Non-blocking poll.
    pub fn try_get(&self) -> Option<OpOutcome> {
        let mut memo = match self.memo.lock() {
            Ok(memo) => memo,
            Err(poisoned) => poisoned.into_inner(),
        };
        if memo.is_none() {
            if let Ok(outcome) = self.rx.try_recv() {
                *memo = Some(outcome);
            }
        }
        memo.clone()
    }

    /// An already-resolved future, for sync completions on the async path.
    pub fn ready(outcome: OpOutcome) -> Self {
        let fut = Self::new();
        fut.set(outcome);
        fut
    }
}

impl fmt::Debug for OpFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpFuture")
    }
}

struct OpInner {
    kind: OpKind,
    line: LineId,
    data: Option<Vec<u8>>,
    extra: OpExtra,
    txn: Option<Arc<Transaction>>,
    future: OnceLock<OpFuture>,
    start: Mutex<Option<Instant>>,
}

/// A deferred operation. Cheap to clone; clones share completion state.
#[derive(Clone)]
pub struct Op {
    inner: Arc<OpInner>,
}

impl Op {
    pub fn new(
        kind: OpKind,
        line: LineId,
        data: Option<Vec<u8>>,
        extra: OpExtra,
        txn: Option<Arc<Transaction>>,
    ) -> Self {
        Self {
            inner: Arc::new(OpInner {
                kind,
                line,
                data,
                extra,
                txn,
                future: OnceLock::new(),
                start: Mutex::new(None),
            }),
        }
    }

    pub fn kind(&self) -> OpKind {
        self.inner.kind
    }

    pub fn line(&self) -> LineId {
        self.inner.line
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.inner.data.as_deref()
    }

    pub fn extra(&self) -> &OpExtra {
        &self.inner.extra
    }

    pub fn txn(&self) -> Option<&Arc<Transaction>> {
        self.inner.txn.as_ref()
    }

    pub fn has_future(&self) -> bool {
        self.inner.future.get().is_some()
    }

    pub fn future(&self) -> Option<&OpFuture> {
        self.inner.future.get()
    }

    /// Creates the completion future if it does not exist yet.
    pub fn ensure_future(&self) -> &OpFuture {
        self.inner.future.get_or_init(OpFuture::new)
    }

    pub fn complete(&self, value: OpValue) {
        if let Some(future) = self.inner.future.get() {
            future.set(Ok(value));
        }
    }

    pub fn fail(&self, err: CacheError) {
        self.ensure_future().set(Err(err));
    }

    pub fn set_start(&self, at: Instant) {
        if let Ok(mut start) = self.inner.start.lock() {
            *start = Some(at);
        }
    }

    /// Microseconds since the op was parked, for latency reporting.
    pub fn pending_micros(&self) -> u64 {
        self.inner
            .start
            .lock()
            .ok()
            .and_then(|s| *s)
            .map(|at| at.elapsed().as_micros() as u64)
            .unwrap_or(0)
    }

    pub fn same_op(&self, other: &Op) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Op::{:?}(line:{:#x}, extra:{:?})",
            self.inner.kind, self.inner.line, self.inner.extra
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_future_memoizes_outcome() {
        let fut = OpFuture::new();
        fut.set(Ok(OpValue::Id(42)));
        assert_eq!(
            fut.get(Duration::from_millis(10)),
            Ok(OpValue::Id(42))
        );
        // second wait must observe the same value, not block
        assert_eq!(
            fut.get(Duration::from_millis(10)),
            Ok(OpValue::Id(42))
        );
    }

    #[test]
    fn test_future_timeout() {
        let fut = OpFuture::new();
        assert_eq!(
            fut.get(Duration::from_millis(5)),
            Err(CacheError::Timeout)
        );
    }

    #[test]
    fn test_first_completion_wins() {
        let fut = OpFuture::new();
        fut.set(Ok(OpValue::Unit));
        fut.set(Err(CacheError::Timeout));
        assert_eq!(fut.get(Duration::from_millis(5)), Ok(OpValue::Unit));
    }

    #[test]
    fn test_op_future_lifecycle() {
        let op = Op::new(OpKind::Get, 10, None, OpExtra::None, None);
        assert!(!op.has_future());
        op.ensure_future();
        assert!(op.has_future());
        op.complete(OpValue::Data(Some(vec![1])));
        assert_eq!(
            op.future().unwrap().get(Duration::from_millis(5)),
            Ok(OpValue::Data(Some(vec![1])))
        );
    }
}
