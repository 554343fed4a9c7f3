//! Line tables: the unbounded owned map and the weight-bounded shared table.
//!
//! Owned lines (states O/E) live in a plain concurrent map and are never
//! evicted; shared lines (states I/S) live in a weighted LRU whose access
//! order is tracked lock-free. Optional free lists recycle line records and
//! sharer sets.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipSet;
use dashmap::DashMap;

use crate::cache::config::CacheConfig;
use crate::cache::line::CacheLine;
use crate::cache::types::{LineId, NodeId};

const SHARER_SET_DEFAULT_CAPACITY: usize = 10;

/// LRU position of a shared line. Ordered by stamp, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct AccessStamp {
    stamp: u64,
    id: LineId,
}

struct SharedEntry {
    line: Arc<CacheLine>,
    weight: AtomicU64,
    stamp: AtomicU64,
}

/// Concurrent weighted-LRU table of shared (I/S) lines.
pub struct SharedTable {
    max_weight: i64,
    entries: DashMap<LineId, SharedEntry>,
    access_order: SkipSet<AccessStamp>,
    clock: AtomicU64,
    total_weight: AtomicI64,
}

impl SharedTable {
    fn new(max_weight: u64) -> Self {
        Self {
            max_weight: max_weight as i64,
            entries: DashMap::new(),
            access_order: SkipSet::new(),
            clock: AtomicU64::new(0),
            total_weight: AtomicI64::new(0),
        }
    }

    fn touch(&self, id: LineId, entry: &SharedEntry) {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let old = entry.stamp.swap(stamp, Ordering::Relaxed);
        self.access_order.remove(&AccessStamp { stamp: old, id });
        self.access_order.insert(AccessStamp { stamp, id });
    }

    /// Looks a line up and refreshes its LRU position.
    pub fn get(&self, id: LineId) -> Option<Arc<CacheLine>> {
        let entry = self.entries.get(&id)?;
        self.touch(id, entry.value());
        Some(entry.line.clone())
    }

    /// Inserts or replaces a shared line with the given weight.
    pub fn insert(&self, id: LineId, line: Arc<CacheLine>, weight: u64) {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = SharedEntry {
            line,
            weight: AtomicU64::new(weight),
            stamp: AtomicU64::new(stamp),
        };
        if let Some(old) = self.entries.insert(id, entry) {
            let old_stamp = old.stamp.load(Ordering::Relaxed);
            self.access_order.remove(&AccessStamp {
                stamp: old_stamp,
                id,
            });
            self.total_weight
                .fetch_sub(old.weight.load(Ordering::Relaxed) as i64, Ordering::Relaxed);
        }
        self.access_order.insert(AccessStamp { stamp, id });
        self.total_weight.fetch_add(weight as i64, Ordering::Relaxed);
    }

    /// Inserts `line` unless the id is already present; returns the line
    /// already in the table in that case.
    pub fn insert_if_absent(
        &self,
        id: LineId,
        line: Arc<CacheLine>,
        weight: u64,
    ) -> Option<Arc<CacheLine>> {
        match self.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                Some(occupied.get().line.clone())
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
                vacant.insert(SharedEntry {
                    line,
                    weight: AtomicU64::new(weight),
                    stamp: AtomicU64::new(stamp),
                });
                self.access_order.insert(AccessStamp { stamp, id });
                self.total_weight.fetch_add(weight as i64, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn remove(&self, id: LineId) -> Option<Arc<CacheLine>> {
        let (_, entry) = self.entries.remove(&id)?;
        let stamp = entry.stamp.load(Ordering::Relaxed);
        self.access_order.remove(&AccessStamp { stamp, id });
        self.total_weight
            .fetch_sub(entry.weight.load(Ordering::Relaxed) as i64, Ordering::Relaxed);
        Some(entry.line)
    }

    /// Re-records the weight of a resident line after its payload resized.
    pub fn set_weight(&self, id: LineId, weight: u64) {
        if let Some(entry) = self.entries.get(&id) {
            let old = entry.weight.swap(weight, Ordering::Relaxed);
            self.total_weight
                .fetch_add(weight as i64 - old as i64, Ordering::Relaxed);
        }
    }

    pub fn contains(&self, id: LineId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn over_capacity(&self) -> bool {
        self.total_weight.load(Ordering::Relaxed) > self.max_weight
    }

    pub fn total_weight(&self) -> i64 {
        self.total_weight.load(Ordering::Relaxed)
    }

    /// Removes and returns the least-recently-used line, skipping `exclude`
    /// (the line the caller currently holds locked) and entries whose LRU
    /// position is stale. Returns the line together with its last recorded
    /// weight so contended victims can be reinserted.
    pub fn pop_victim(&self, exclude: LineId) -> Option<(LineId, Arc<CacheLine>, u64)> {
        loop {
            let front = self.access_order.front()?;
            let candidate = *front.value();
            front.remove();

            if candidate.id == exclude {
                // keep the excluded line resident with a fresh position
                if let Some(entry) = self.entries.get(&candidate.id) {
                    if entry.stamp.load(Ordering::Relaxed) == candidate.stamp {
                        self.touch(candidate.id, entry.value());
                    }
                }
                continue;
            }

            let Some((_, entry)) = self.entries.remove_if(&candidate.id, |_, e| {
                e.stamp.load(Ordering::Relaxed) == candidate.stamp
            }) else {
                continue; // stale position or already gone
            };
            let weight = entry.weight.load(Ordering::Relaxed);
            self.total_weight.fetch_sub(weight as i64, Ordering::Relaxed);
            return Some((candidate.id, entry.line, weight));
        }
    }

    fn snapshot(&self) -> Vec<Arc<CacheLine>> {
        self.entries.iter().map(|e| e.line.clone()).collect()
    }
}

/// Both line tables plus the optional record pools.
pub struct LineStore {
    owned: DashMap<LineId, Arc<CacheLine>>,
    pub shared: SharedTable,
    free_lines: Option<Mutex<Vec<Arc<CacheLine>>>>,
    free_sharer_sets: Option<Mutex<Vec<HashSet<NodeId>>>>,
}

impl LineStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            owned: DashMap::new(),
            shared: SharedTable::new(config.max_capacity),
            free_lines: config.reuse_lines.then(|| Mutex::new(Vec::new())),
            free_sharer_sets: config.reuse_sharer_sets.then(|| Mutex::new(Vec::new())),
        }
    }

    /// Finds a line in either table; a shared hit refreshes its LRU position.
    pub fn get_line(&self, id: LineId) -> Option<Arc<CacheLine>> {
        if let Some(line) = self.owned.get(&id) {
            return Some(line.clone());
        }
        self.shared.get(id)
    }

    pub fn insert_owned(&self, id: LineId, line: Arc<CacheLine>) {
        self.owned.insert(id, line);
    }

    pub fn remove_owned(&self, id: LineId) -> Option<Arc<CacheLine>> {
        self.owned.remove(&id).map(|(_, line)| line)
    }

    pub fn is_owned(&self, id: LineId) -> bool {
        self.owned.contains_key(&id)
    }

    /// Removes a line from whichever table holds it.
    pub fn remove_line(&self, id: LineId) {
        if self.remove_owned(id).is_none() {
            self.shared.remove(id);
        }
    }

    /// Snapshot of every resident line, owned first. The snapshot decouples
    /// sweeps from table mutation so lines can migrate while being processed.
    pub fn all_lines(&self) -> Vec<Arc<CacheLine>> {
        let mut lines: Vec<Arc<CacheLine>> =
            self.owned.iter().map(|e| e.value().clone()).collect();
        lines.extend(self.shared.snapshot());
        lines
    }

    /// Takes a cleared record from the pool, or allocates one.
    pub fn allocate_line(&self, id: LineId) -> Arc<CacheLine> {
        if let Some(pool) = &self.free_lines {
            if let Ok(mut pool) = pool.lock() {
                while let Some(arc) = pool.pop() {
                    if Arc::strong_count(&arc) != 1 {
                        continue; // still referenced somewhere; drop it
                    }
                    let locked = arc.try_lock().is_some_and(|mut l| {
                        l.clear();
                        l.id = id;
                        true
                    });
                    if locked {
                        return arc;
                    }
                }
            }
        }
        let arc = CacheLine::new();
        arc.lock().id = id;
        arc
    }

    pub fn recycle_line(&self, line: Arc<CacheLine>) {
        if let Some(pool) = &self.free_lines {
            if let Ok(mut pool) = pool.lock() {
                pool.push(line);
            }
        }
    }

    pub fn allocate_sharer_set(&self) -> HashSet<NodeId> {
        if let Some(pool) = &self.free_sharer_sets {
            if let Ok(mut pool) = pool.lock() {
                if let Some(set) = pool.pop() {
                    return set;
                }
            }
        }
        HashSet::with_capacity(SHARER_SET_DEFAULT_CAPACITY)
    }

    pub fn recycle_sharer_set(&self, mut set: HashSet<NodeId>) {
        if let Some(pool) = &self.free_sharer_sets {
            set.clear();
            if let Ok(mut pool) = pool.lock() {
                pool.push(set);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_with_id(id: LineId) -> Arc<CacheLine> {
        let arc = CacheLine::new();
        arc.lock().id = id;
        arc
    }

    #[test]
    fn test_shared_weight_accounting() {
        let table = SharedTable::new(100);
        table.insert(1, line_with_id(1), 10);
        table.insert(2, line_with_id(2), 20);
        assert_eq!(table.total_weight(), 30);
        table.set_weight(2, 5);
        assert_eq!(table.total_weight(), 15);
        table.remove(1);
        assert_eq!(table.total_weight(), 5);
    }

    #[test]
    fn test_lru_victim_order() {
        let table = SharedTable::new(1);
        table.insert(1, line_with_id(1), 1);
        table.insert(2, line_with_id(2), 1);
        table.insert(3, line_with_id(3), 1);
        // refresh line 1 so line 2 becomes the LRU
        assert!(table.get(1).is_some());

        assert!(table.over_capacity());
        let (victim, _, w) = table.pop_victim(0).unwrap();
        assert_eq!(victim, 2);
        assert_eq!(w, 1);
        let (victim, _, _) = table.pop_victim(0).unwrap();
        assert_eq!(victim, 3);
        let (victim, _, _) = table.pop_victim(0).unwrap();
        assert_eq!(victim, 1);
        assert!(table.pop_victim(0).is_none());
        assert_eq!(table.total_weight(), 0);
    }

    #[test]
    fn test_pop_victim_skips_excluded() {
        let table = SharedTable::new(1);
        table.insert(7, line_with_id(7), 1);
        table.insert(8, line_with_id(8), 1);
        let (victim, _, _) = table.pop_victim(7).unwrap();
        assert_eq!(victim, 8);
        // the excluded line stays resident
        assert!(table.contains(7));
    }

    #[test]
    fn test_insert_if_absent_returns_existing() {
        let table = SharedTable::new(10);
        let first = line_with_id(4);
        assert!(table.insert_if_absent(4, first.clone(), 1).is_none());
        let second = line_with_id(4);
        let existing = table.insert_if_absent(4, second, 1).unwrap();
        assert!(Arc::ptr_eq(&existing, &first));
    }

    #[test]
    fn test_line_pool_reuse() {
        let config = CacheConfig::default();
        let store = LineStore::new(&config);
        let line = store.allocate_line(9);
        {
            let mut l = line.lock();
            l.version = 5;
            l.data = Some(vec![1, 2, 3]);
        }
        store.recycle_line(line);
        let reused = store.allocate_line(11);
        let l = reused.lock();
        assert_eq!(l.id, 11);
        assert_eq!(l.version, 0);
        assert!(l.data.is_none());
    }
}
