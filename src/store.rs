//! Partitioned key-value API.
//!
//! [`KeyValueStore`] is what application code talks to. Every write is
//! sanitized by the [`SerializationGuard`], written through to the shared
//! [`CacheTable`] and then committed on the connection owned by the
//! [`ConnectionManager`]. Commits run in a spawned task, so a caller that
//! stops waiting does not cancel the write.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::cache::CacheTable;
use crate::connection::ConnectionManager;
use crate::diagnostics::{PartitionUsage, UsageReport};
use crate::error::{SerializationError, StoreError};
use crate::guard::{Compaction, Sanitized, SerializationGuard};
use crate::node::Node;
use crate::storage::Mutation;
use crate::value::Value;

const EVENT_CAPACITY: usize = 256;

/// Read access shared by the primary store and the tiered decorator.
///
/// Implementations keep the shared [`CacheTable`] current: a successful `get`
/// has already refreshed the cache entry it read.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn get(&self, partition: &str, key: &str) -> Result<Option<Value>, StoreError>;

    async fn list_keys(&self, partition: &str) -> Result<Vec<String>, StoreError>;
}

/// Outcome of a successful `set`.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReport {
    /// Nodes the guard dropped from the value.
    pub omissions: Vec<SerializationError>,
    pub compaction: Option<Compaction>,
    pub encoded_len: usize,
}

/// Outcome of a successful `batch_set`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub written: usize,
    /// Items the guard refused; they were skipped.
    pub rejected: Vec<(String, SerializationError)>,
    /// Total omissions across the written items.
    pub omissions: usize,
}

/// A window over an array-shaped record, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub total: usize,
    /// True if older items exist before this page.
    pub has_more: bool,
}

impl Page {
    /// Takes `limit` items ending `offset` items before the newest one.
    fn slice(mut items: Vec<Value>, limit: usize, offset: usize) -> Self {
        let total = items.len();
        let end = total.saturating_sub(offset);
        let start = end.saturating_sub(limit);
        items.truncate(end);
        let items = items.split_off(start);
        Self {
            items,
            total,
            has_more: start > 0,
        }
    }
}

/// Change notification, sent once a commit is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Written { partition: String, key: String },
    Deleted { partition: String, key: String },
    Cleared { partition: String },
}

struct StoreInner {
    connection: ConnectionManager,
    guard: SerializationGuard,
    cache: CacheTable,
    events: broadcast::Sender<StoreEvent>,
}

/// Partitioned key-value store. Cheap to clone.
#[derive(Clone)]
pub struct KeyValueStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for KeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueStore")
            .field("connection", &self.inner.connection)
            .field("cached", &self.inner.cache.len())
            .finish()
    }
}

impl KeyValueStore {
    pub fn new(connection: ConnectionManager, guard: SerializationGuard, cache: CacheTable) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                connection,
                guard,
                cache,
                events,
            }),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn cache(&self) -> &CacheTable {
        &self.inner.cache
    }

    pub fn guard(&self) -> &SerializationGuard {
        &self.inner.guard
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.inner.events.send(event);
    }

    fn ensure_partition(&self, partition: &str) -> Result<(), StoreError> {
        if self.inner.connection.config().has_partition(partition) {
            Ok(())
        } else {
            Err(StoreError::not_found(partition))
        }
    }

    /// Reads a record and refreshes its cache entry.
    ///
    /// # Errors
    /// `NotFound` for an unknown partition, `Unavailable` if no connection
    /// could be opened.
    pub async fn get(&self, partition: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.ensure_partition(partition)?;
        let observed = self.inner.cache.generation();
        let value = self
            .inner
            .connection
            .run(|conn| async move { conn.get(partition, key).await })
            .await?;
        self.inner.cache.refresh(partition, key, value.clone(), observed);
        Ok(value)
    }

    /// Sanitizes and stores a value.
    ///
    /// The cache sees the value immediately and keeps it while the commit is
    /// in flight, even if a concurrent read returns the older stored value.
    /// The returned future resolves once the commit is durable. On failure the
    /// cache entry is rolled back unless a newer write replaced it.
    ///
    /// # Errors
    /// - `Serialization(SizeExceeded)` if the value cannot be compacted under
    ///   the partition's ceiling; nothing is written
    /// - `QuotaExceeded` when the physical store is full
    /// - `Unavailable` if no connection could be opened
    pub async fn set(&self, partition: &str, key: &str, value: impl Into<Node>) -> Result<WriteReport, StoreError> {
        self.ensure_partition(partition)?;
        let node = value.into();
        let Sanitized {
            value,
            omissions,
            compaction,
            encoded_len,
        } = self.inner.guard.sanitize(partition, &node)?;

        for omission in &omissions {
            warn!(partition, key, omission = %omission, "value stored with omissions");
        }

        let staged = self.inner.cache.stage(partition, key, Some(value.clone()));
        debug!(partition, key, bytes = encoded_len, "record staged");

        let (p, k) = (partition.to_string(), key.to_string());
        self.spawn_commit(partition, vec![Mutation::put(key, value)], move |store, result| {
            match result {
                Ok(()) => {
                    store.inner.cache.settle(staged.generation);
                    store.emit(StoreEvent::Written { partition: p, key: k });
                }
                Err(_) => {
                    store.inner.cache.rollback(&p, &k, staged);
                }
            }
        })
        .await?;

        Ok(WriteReport {
            omissions,
            compaction,
            encoded_len,
        })
    }

    /// Removes a record. Deleting a missing key succeeds.
    pub async fn delete(&self, partition: &str, key: &str) -> Result<(), StoreError> {
        self.ensure_partition(partition)?;
        let staged = self.inner.cache.stage(partition, key, None);

        let (p, k) = (partition.to_string(), key.to_string());
        self.spawn_commit(partition, vec![Mutation::delete(key)], move |store, result| match result {
            Ok(()) => {
                store.inner.cache.settle(staged.generation);
                store.emit(StoreEvent::Deleted { partition: p, key: k });
            }
            Err(_) => {
                store.inner.cache.rollback(&p, &k, staged);
            }
        })
        .await
    }

    /// Removes every record of a partition.
    pub async fn clear(&self, partition: &str) -> Result<(), StoreError> {
        self.ensure_partition(partition)?;

        let p = partition.to_string();
        self.spawn_commit(partition, vec![Mutation::Clear], move |store, result| {
            if result.is_ok() {
                store.inner.cache.invalidate_partition(&p);
                store.emit(StoreEvent::Cleared { partition: p });
            }
        })
        .await
    }

    /// All keys of a partition, sorted.
    pub async fn list_keys(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_partition(partition)?;
        let mut keys = self
            .inner
            .connection
            .run(|conn| async move { conn.keys(partition).await })
            .await?;
        keys.sort_unstable();
        Ok(keys)
    }

    /// Writes many records in one transaction.
    ///
    /// Items the guard rejects are reported and skipped; everything else is
    /// committed together or not at all.
    pub async fn batch_set<I, K, N>(&self, partition: &str, entries: I) -> Result<BatchReport, StoreError>
    where
        I: IntoIterator<Item = (K, N)>,
        K: Into<String>,
        N: Into<Node>,
    {
        self.ensure_partition(partition)?;

        let mut mutations = Vec::new();
        let mut staged = Vec::new();
        let mut rejected = Vec::new();
        let mut omissions = 0;

        for (key, node) in entries {
            let key = key.into();
            match self.inner.guard.sanitize(partition, &node.into()) {
                Ok(sanitized) => {
                    if !sanitized.omissions.is_empty() {
                        warn!(
                            partition,
                            key = %key,
                            omitted = sanitized.omissions.len(),
                            "batch item stored with omissions"
                        );
                    }
                    omissions += sanitized.omissions.len();
                    let token = self.inner.cache.stage(partition, &key, Some(sanitized.value.clone()));
                    staged.push((key.clone(), token));
                    mutations.push(Mutation::put(key, sanitized.value));
                }
                Err(e) => {
                    warn!(partition, key = %key, error = %e, "batch item rejected");
                    rejected.push((key, e));
                }
            }
        }

        let written = mutations.len();
        if written == 0 {
            return Ok(BatchReport {
                written,
                rejected,
                omissions,
            });
        }

        let p = partition.to_string();
        self.spawn_commit(partition, mutations, move |store, result| match result {
            Ok(()) => {
                for (key, token) in staged {
                    store.inner.cache.settle(token.generation);
                    store.emit(StoreEvent::Written {
                        partition: p.clone(),
                        key,
                    });
                }
            }
            Err(_) => {
                // Reverse order so repeated keys unwind to the original entry.
                for (key, token) in staged.into_iter().rev() {
                    store.inner.cache.rollback(&p, &key, token);
                }
            }
        })
        .await?;

        debug!(partition, written, rejected = rejected.len(), "batch committed");
        Ok(BatchReport {
            written,
            rejected,
            omissions,
        })
    }

    /// Reads a window of an array-shaped record.
    ///
    /// `offset` counts back from the newest item. Missing records and
    /// non-array values read as an empty page.
    pub async fn get_page(&self, partition: &str, key: &str, limit: usize, offset: usize) -> Result<Page, StoreError> {
        let items = match self.get(partition, key).await? {
            Some(Value::Array(items)) => items,
            Some(other) => {
                debug!(partition, key, found = other.type_name(), "paged read of a non-array record");
                Vec::new()
            }
            None => Vec::new(),
        };
        Ok(Page::slice(items, limit, offset))
    }

    /// Record counts and encoded sizes per configured partition.
    pub async fn usage(&self) -> Result<UsageReport, StoreError> {
        let partitions = self.inner.connection.config().partitions.clone();
        let mut usage = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let name = partition.as_str();
            let entries = self
                .inner
                .connection
                .run(|conn| async move { conn.entries(name).await })
                .await?;
            let bytes = entries
                .iter()
                .map(|(key, value)| (key.len() + value.encoded_len()) as u64)
                .sum();
            usage.push(PartitionUsage {
                partition,
                records: entries.len(),
                bytes,
            });
        }
        Ok(UsageReport::from_partitions(usage))
    }

    /// Commits in a spawned task, then runs `settle` with the outcome.
    async fn spawn_commit<F>(&self, partition: &str, mutations: Vec<Mutation>, settle: F) -> Result<(), StoreError>
    where
        F: FnOnce(&KeyValueStore, &Result<(), StoreError>) + Send + 'static,
    {
        let store = self.clone();
        let partition = partition.to_string();

        let task = tokio::spawn(async move {
            let name = partition.as_str();
            let result = store
                .inner
                .connection
                .run(|conn| {
                    let mutations = mutations.clone();
                    async move { conn.commit(name, mutations).await }
                })
                .await;

            match &result {
                Ok(()) => debug!(partition = %partition, "commit durable"),
                Err(e) if e.is_quota() => error!(partition = %partition, error = %e, "commit refused: storage full"),
                Err(e) => warn!(partition = %partition, error = %e, "commit failed"),
            }
            settle(&store, &result);
            result
        });

        task.await
            .map_err(|e| StoreError::aborted(format!("commit task failed: {e}")))?
    }
}

#[async_trait]
impl RecordSource for KeyValueStore {
    async fn get(&self, partition: &str, key: &str) -> Result<Option<Value>, StoreError> {
        KeyValueStore::get(self, partition, key).await
    }

    async fn list_keys(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        KeyValueStore::list_keys(self, partition).await
    }
}
