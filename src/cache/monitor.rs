//! Monitoring hooks and the atomic statistics collector.
//!
//! The engine reports hits, misses, invalidation fan-out, op latency and
//! message traffic through [`CacheMonitor`]; a no-op implementation is
//! injected when monitoring is disabled.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::cache::message::Message;
use crate::cache::ops::OpKind;

/// Why a pending message sat in the queue before being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDelayReason {
    /// Waiting for the backup channel to clear the MODIFIED flag.
    Backup,
    /// Waiting for a lock release.
    Lock,
    /// Waiting for a state transition.
    Other,
}

/// Sink for engine telemetry. All methods have empty defaults so partial
/// implementations stay small.
pub trait CacheMonitor: Send + Sync {
    fn add_hit(&self) {}
    fn add_stale_hit(&self) {}
    fn add_miss(&self) {}
    fn add_invalidates(&self, _num: usize) {}
    fn add_stale_purge(&self, _num: i32) {}
    fn add_op(&self, _kind: OpKind, _duration_micros: u64) {}
    fn add_message_sent(&self, _msg: &Message) {}
    fn add_message_received(&self, _msg: &Message) {}
    fn add_message_handling_delay(
        &self,
        _count: usize,
        _total_delay_nanos: u64,
        _reason: MessageDelayReason,
    ) {
    }
}

/// Monitor used when monitoring is disabled.
#[derive(Debug, Default)]
pub struct NoopMonitor;

impl CacheMonitor for NoopMonitor {}

/// Lock-free statistics collector.
#[derive(Debug, Default)]
pub struct StatsMonitor {
    hits: CachePadded<AtomicU64>,
    stale_hits: CachePadded<AtomicU64>,
    misses: CachePadded<AtomicU64>,
    invalidates: CachePadded<AtomicU64>,
    stale_purges: CachePadded<AtomicU64>,
    ops: CachePadded<AtomicU64>,
    op_time_micros: CachePadded<AtomicU64>,
    messages_sent: CachePadded<AtomicU64>,
    messages_received: CachePadded<AtomicU64>,
    delayed_messages: CachePadded<AtomicU64>,
    delay_nanos: CachePadded<AtomicU64>,
}

/// Point-in-time view of the collected statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub invalidates: u64,
    pub stale_purges: u64,
    pub ops: u64,
    pub op_time_micros: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub delayed_messages: u64,
    pub delay_nanos: u64,
}

impl StatsMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidates: self.invalidates.load(Ordering::Relaxed),
            stale_purges: self.stale_purges.load(Ordering::Relaxed),
            ops: self.ops.load(Ordering::Relaxed),
            op_time_micros: self.op_time_micros.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            delayed_messages: self.delayed_messages.load(Ordering::Relaxed),
            delay_nanos: self.delay_nanos.load(Ordering::Relaxed),
        }
    }
}

impl CacheMonitor for StatsMonitor {
    fn add_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn add_stale_hit(&self) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn add_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn add_invalidates(&self, num: usize) {
        self.invalidates.fetch_add(num as u64, Ordering::Relaxed);
    }

    fn add_stale_purge(&self, num: i32) {
        if num > 0 {
            self.stale_purges.fetch_add(num as u64, Ordering::Relaxed);
        }
    }

    fn add_op(&self, _kind: OpKind, duration_micros: u64) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.op_time_micros
            .fetch_add(duration_micros, Ordering::Relaxed);
    }

    fn add_message_sent(&self, _msg: &Message) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn add_message_received(&self, _msg: &Message) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    fn add_message_handling_delay(
        &self,
        count: usize,
        total_delay_nanos: u64,
        _reason: MessageDelayReason,
    ) {
        self.delayed_messages.fetch_add(count as u64, Ordering::Relaxed);
        self.delay_nanos.fetch_add(total_delay_nanos, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulate() {
        let stats = StatsMonitor::new();
        stats.add_hit();
        stats.add_hit();
        stats.add_miss();
        stats.add_invalidates(3);
        stats.add_op(OpKind::Get, 40);

        let snap = stats.snapshot();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.invalidates, 3);
        assert_eq!(snap.ops, 1);
        assert_eq!(snap.op_time_micros, 40);
    }
}
