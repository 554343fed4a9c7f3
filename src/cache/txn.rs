//! Transactions: multi-line locking with rollback journals.
//!
//! A transaction collects the ops run under it and the lines they locked.
//! Commit unlocks every line, pushing modified ones to the backup channel;
//! abort restores the rollback snapshots recorded at first write.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::cache::error::CacheError;
use crate::cache::line::LineInner;
use crate::cache::monitor::MessageDelayReason;
use crate::cache::ops::Op;
use crate::cache::types::{LineId, flags};

use crate::cache::coherence::CoherenceEngine;

/// Snapshot taken at the first write to a line within a transaction.
#[derive(Debug, Clone)]
pub struct RollbackInfo {
    pub version: u64,
    pub modified: bool,
    pub data: Option<Vec<u8>>,
}

/// A group of operations whose line locks are released together.
pub struct Transaction {
    rollback_supported: bool,
    ops: Mutex<Vec<Op>>,
    lines: Mutex<HashSet<LineId>>,
    rollbacks: Mutex<HashMap<LineId, RollbackInfo>>,
}

impl Transaction {
    pub fn new(rollback_supported: bool) -> Self {
        Self {
            rollback_supported,
            ops: Mutex::new(Vec::new()),
            lines: Mutex::new(HashSet::new()),
            rollbacks: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_op(&self, op: Op) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.push(op);
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().map(|ops| ops.clone()).unwrap_or_default()
    }

    pub fn add_line(&self, id: LineId) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.insert(id);
        }
    }

    pub fn contains_line(&self, id: LineId) -> bool {
        self.lines
            .lock()
            .map(|lines| lines.contains(&id))
            .unwrap_or(false)
    }

    pub fn lines(&self) -> Vec<LineId> {
        self.lines
            .lock()
            .map(|lines| lines.iter().copied().collect())
            .unwrap_or_default()
    }

    /// True once a rollback snapshot exists for the line.
    pub fn is_recorded(&self, id: LineId) -> bool {
        self.rollbacks
            .lock()
            .map(|r| r.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn record_rollback(&self, id: LineId, version: u64, modified: bool, data: Option<Vec<u8>>) {
        if !self.rollback_supported {
            return;
        }
        if let Ok(mut rollbacks) = self.rollbacks.lock() {
            rollbacks.entry(id).or_insert(RollbackInfo {
                version,
                modified,
                data,
            });
        }
    }

    pub fn rollbacks(&self) -> Vec<(LineId, RollbackInfo)> {
        self.rollbacks
            .lock()
            .map(|r| r.iter().map(|(id, info)| (*id, info.clone())).collect())
            .unwrap_or_default()
    }
}

impl CoherenceEngine {
    /// Starts a new transaction.
    pub fn begin_transaction(&self) -> Arc<Transaction> {
        Arc::new(Transaction::new(self.config().rollback_supported))
    }

    /// Restores every line recorded in the transaction's rollback journal to
    /// its snapshot.
    pub fn rollback(&self, txn: &Arc<Transaction>) -> Result<(), CacheError> {
        if !self.config().rollback_supported {
            return Err(CacheError::RollbackUnsupported);
        }

        for (id, info) in txn.rollbacks() {
            let Some(line) = self.get_line(id) else {
                warn!("Rollback target line {:#x} is gone", id);
                continue;
            };
            let mut l = line.lock();
            debug!(
                "Rolling back line {:#x} to version {}. Modified = {}",
                id, info.version, info.modified
            );
            l.version = info.version;
            l.set(flags::MODIFIED, info.modified);
            self.write_data(&mut l, info.data.as_deref())?;
        }
        Ok(())
    }

    /// Ends the transaction: unlocks every locked line, schedules backups for
    /// modified ones and drains pending messages of the rest. The first op
    /// error is re-raised after cleanup unless the transaction is aborting.
    pub fn end_transaction(&self, txn: &Arc<Transaction>, abort: bool) -> Result<(), CacheError> {
        self.in_dispatch(|| {
            let mut first_err = None;
            for op in txn.ops() {
                if let Some(future) = op.future() {
                    if let Err(e) = future.get(self.config().timeout()) {
                        debug!("Error in op {:?}: {}", op, e);
                        first_err.get_or_insert(e);
                    }
                }
            }

            let mut flush = false;
            let mut unmodified = Vec::new();

            self.backup().start_backup();
            for id in txn.lines() {
                let Some(line) = self.get_line(id) else {
                    continue;
                };
                let mut l = line.lock();
                if self.unlock_line(&mut l, Some(txn)) {
                    if !l.is(flags::MODIFIED) {
                        unmodified.push(line.clone());
                    } else {
                        l.set(flags::SLAVE, true);
                        self.backup().backup(l.id, l.version);
                        if self.has_pending_messages(l.id) {
                            flush = true;
                        }
                    }
                }
            }
            self.backup().end_backup();
            if flush {
                self.backup().flush();
            }

            for line in unmodified {
                let mut l = line.lock();
                self.handle_pending_messages(&line, &mut l, MessageDelayReason::Lock);
            }

            if !abort {
                if let Some(e) = first_err {
                    return Err(e);
                }
            }
            Ok(())
        })
    }

    /// Single-line commit without a transaction object.
    pub fn release(&self, id: LineId) {
        self.in_dispatch(|| {
            let Some(line) = self.get_line(id) else {
                warn!("Release of unknown line {:#x}", id);
                return;
            };
            let mut l = line.lock();
            if self.unlock_line(&mut l, None) {
                if !l.is(flags::MODIFIED) {
                    self.handle_pending_messages(&line, &mut l, MessageDelayReason::Lock);
                } else {
                    self.backup_line(&mut l);
                }
            }
        })
    }

    /// Flags the line for its slave and pushes it down the backup channel.
    pub(crate) fn backup_line(&self, l: &mut LineInner) {
        l.set(flags::SLAVE, true);
        self.backup().start_backup();
        self.backup().backup(l.id, l.version);
        self.backup().end_backup();
        if self.has_pending_messages(l.id) {
            self.backup().flush();
        }
    }

    pub(crate) fn lock_line(&self, l: &mut LineInner, txn: Option<&Arc<Transaction>>) {
        debug!("Locking line {:?}", l);
        l.lock_line();
        if let Some(txn) = txn {
            txn.add_line(l.id);
        }
    }

    /// Releases the protocol lock taken under `txn`. Returns false when the
    /// line was not locked.
    pub(crate) fn unlock_line(&self, l: &mut LineInner, txn: Option<&Arc<Transaction>>) -> bool {
        debug!("Unlocking line {:?}", l);
        debug_assert!(txn.is_none_or(|t| t.contains_line(l.id)));
        if !l.unlock_line() {
            warn!("Line {:#x} released without being locked", l.id);
            return false;
        }
        true
    }
}
