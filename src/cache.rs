//! In-process cache of partition records.
//!
//! The cache is the synchronous view of the store: writes land here first,
//! reads refresh it. Every write bumps a global generation counter and the
//! entry remembers the generation that produced it, so:
//! - a failed write only rolls back the entry it staged (not a newer write)
//! - a read that raced with a write cannot overwrite the newer value
//!
//! A staged generation stays in flight until its commit settles. Reads never
//! replace an in-flight entry: the store may still hold the older value.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::value::Value;

/// A cached record. `value: None` caches a known-absent key.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Option<Value>,
    pub generation: u64,
    pub refreshed_at: DateTime<Utc>,
}

/// Token returned by [`CacheTable::stage`], used to undo the write.
#[derive(Debug, Clone, PartialEq)]
pub struct Staged {
    pub generation: u64,
    pub previous: Option<CacheEntry>,
}

#[derive(Debug, Default)]
struct Table {
    partitions: HashMap<String, HashMap<String, CacheEntry>>,
    /// Staged generations whose commit has not settled yet.
    in_flight: HashSet<u64>,
}

/// Shared cache, keyed by partition then key. Cloning shares the table.
#[derive(Debug, Clone, Default)]
pub struct CacheTable {
    table: Arc<RwLock<Table>>,
    generation: Arc<AtomicU64>,
}

impl CacheTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current generation. A read that observes this before going to the store
    /// passes it back to [`CacheTable::refresh`].
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn get(&self, partition: &str, key: &str) -> Option<CacheEntry> {
        self.read().partitions.get(partition)?.get(key).cloned()
    }

    /// True while the write that produced the entry is still committing.
    pub fn is_pending(&self, partition: &str, key: &str) -> bool {
        let table = self.read();
        table
            .partitions
            .get(partition)
            .and_then(|bucket| bucket.get(key))
            .is_some_and(|entry| table.in_flight.contains(&entry.generation))
    }

    /// Cached value; `None` for unknown and known-absent keys alike.
    pub fn value(&self, partition: &str, key: &str) -> Option<Value> {
        self.get(partition, key)?.value
    }

    /// Writes `value` ahead of the store and returns the undo token.
    ///
    /// The entry is in flight until [`CacheTable::settle`] or
    /// [`CacheTable::rollback`] is called with the token's generation.
    pub fn stage(&self, partition: &str, key: &str, value: Option<Value>) -> Staged {
        let mut table = self.write();
        let generation = self.next_generation();
        table.in_flight.insert(generation);
        let previous = table.partitions.entry(partition.to_string()).or_default().insert(
            key.to_string(),
            CacheEntry {
                value,
                generation,
                refreshed_at: Utc::now(),
            },
        );
        Staged {
            generation,
            previous,
        }
    }

    /// Marks a staged write as committed.
    pub fn settle(&self, generation: u64) {
        self.write().in_flight.remove(&generation);
    }

    /// Undoes a staged write, unless a newer write replaced it since.
    /// Returns true if the entry was restored.
    pub fn rollback(&self, partition: &str, key: &str, staged: Staged) -> bool {
        let mut table = self.write();
        table.in_flight.remove(&staged.generation);
        let Some(bucket) = table.partitions.get_mut(partition) else {
            return false;
        };
        if bucket.get(key).map(|e| e.generation) != Some(staged.generation) {
            return false;
        }
        match staged.previous {
            Some(previous) => {
                bucket.insert(key.to_string(), previous);
            }
            None => {
                bucket.remove(key);
            }
        }
        true
    }

    /// Stores a value read from the store, unless the entry changed after
    /// `observed_generation` or its write is still in flight. Returns true if
    /// the cache was updated.
    pub fn refresh(&self, partition: &str, key: &str, value: Option<Value>, observed_generation: u64) -> bool {
        let mut table = self.write();
        let Table { partitions, in_flight } = &mut *table;
        let bucket = partitions.entry(partition.to_string()).or_default();
        if bucket
            .get(key)
            .is_some_and(|e| e.generation > observed_generation || in_flight.contains(&e.generation))
        {
            return false;
        }
        // Refreshes do not advance the generation, so two reads of the same
        // state never reject each other.
        let generation = self.generation();
        bucket.insert(
            key.to_string(),
            CacheEntry {
                value,
                generation,
                refreshed_at: Utc::now(),
            },
        );
        true
    }

    /// Forgets everything cached for `partition`.
    pub fn invalidate_partition(&self, partition: &str) {
        self.write().partitions.remove(partition);
        self.next_generation();
    }

    pub fn clear(&self) {
        self.write().partitions.clear();
        self.next_generation();
    }

    /// Number of cached entries, known-absent keys included.
    pub fn len(&self) -> usize {
        self.read().partitions.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
