//! Cache-aside reads for synchronous callers.
//!
//! UI code often needs a value *now* and cannot await the store. The reader
//! answers from the shared [`CacheTable`] without blocking and keeps it fresh
//! with async reads:
//!
//! - construction spawns a preload of frequently read keys
//! - `get_sync` returns the cached snapshot, `Null` if nothing is cached yet
//! - `get` goes to the source, which refreshes the snapshot
//!
//! The reader never writes the table itself. Writes and reads through the
//! store update it, so `get_sync` right after a `set` already sees the new
//! value.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::CacheTable;
use crate::store::RecordSource;
use crate::value::Value;

#[derive(Clone)]
pub struct CacheAsideReader {
    source: Arc<dyn RecordSource>,
    cache: CacheTable,
    preloaded: watch::Receiver<bool>,
}

impl std::fmt::Debug for CacheAsideReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAsideReader")
            .field("cached", &self.cache.len())
            .field("preloaded", &self.is_preloaded())
            .finish_non_exhaustive()
    }
}

impl CacheAsideReader {
    /// Creates the reader and starts preloading `preload_keys`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(source: Arc<dyn RecordSource>, cache: CacheTable, preload_keys: Vec<(String, String)>) -> Self {
        let (done, preloaded) = watch::channel(false);

        let task_source = Arc::clone(&source);
        let task_cache = cache.clone();
        tokio::spawn(async move {
            let total = preload_keys.len();
            let mut loaded = 0;
            for (partition, key) in preload_keys {
                if load(task_source.as_ref(), &partition, &key).await.is_some() {
                    loaded += 1;
                }
            }
            debug!(loaded, total, cached = task_cache.len(), "cache preload finished");
            let _ = done.send(true);
        });

        Self {
            source,
            cache,
            preloaded,
        }
    }

    pub fn cache(&self) -> &CacheTable {
        &self.cache
    }

    /// Cached value, `Null` if nothing is cached. Never blocks on the store.
    pub fn get_sync(&self, partition: &str, key: &str) -> Value {
        self.cache.value(partition, key).unwrap_or_default()
    }

    /// Cached array items; empty if nothing is cached or the value is not an
    /// array.
    pub fn get_sync_items(&self, partition: &str, key: &str) -> Vec<Value> {
        match self.cache.value(partition, key) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        }
    }

    /// Reads from the source, which refreshes the cache.
    ///
    /// If the source fails, the failure is logged and the cached snapshot is
    /// returned instead.
    pub async fn get(&self, partition: &str, key: &str) -> Value {
        match load(self.source.as_ref(), partition, key).await {
            Some(value) => value.unwrap_or_default(),
            None => self.get_sync(partition, key),
        }
    }

    /// Waits for the preload to finish.
    pub async fn preloaded(&self) {
        let mut preloaded = self.preloaded.clone();
        // An error means the preload task is gone; nothing left to wait for.
        let _ = preloaded.wait_for(|done| *done).await;
    }

    pub fn is_preloaded(&self) -> bool {
        *self.preloaded.borrow()
    }
}

/// Reads one record through the source. `None` if the source failed.
async fn load(source: &dyn RecordSource, partition: &str, key: &str) -> Option<Option<Value>> {
    match source.get(partition, key).await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(partition, key, error = %e, "read failed; serving cached snapshot");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::error::StoreError;

    #[derive(Default)]
    struct FlakySource {
        failing: AtomicBool,
        cache: CacheTable,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl RecordSource for FlakySource {
        async fn get(&self, partition: &str, key: &str) -> Result<Option<Value>, StoreError> {
            self.reads.fetch_add(1, Ordering::AcqRel);
            if self.failing.load(Ordering::Acquire) {
                return Err(StoreError::aborted("offline"));
            }
            let observed = self.cache.generation();
            let value = Some(Value::from(format!("{partition}/{key}")));
            self.cache.refresh(partition, key, value.clone(), observed);
            Ok(value)
        }

        async fn list_keys(&self, _partition: &str) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn keys(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(p, k)| ((*p).to_string(), (*k).to_string())).collect()
    }

    #[tokio::test]
    async fn test_preload_fills_cache() {
        let source = Arc::new(FlakySource::default());
        let cache = source.cache.clone();
        let reader = CacheAsideReader::new(source, cache, keys(&[("settings", "chatList")]));

        reader.preloaded().await;
        assert!(reader.is_preloaded());
        assert_eq!(reader.get_sync("settings", "chatList"), Value::from("settings/chatList"));
    }

    #[tokio::test]
    async fn test_get_sync_before_load_is_empty() {
        let source = Arc::new(FlakySource::default());
        let reader = CacheAsideReader::new(source, CacheTable::new(), Vec::new());

        assert_eq!(reader.get_sync("moments", "moments"), Value::Null);
        assert!(reader.get_sync_items("moments", "moments").is_empty());
    }

    #[tokio::test]
    async fn test_get_degrades_to_snapshot() {
        let source = Arc::new(FlakySource::default());
        let cache = source.cache.clone();
        let reader = CacheAsideReader::new(Arc::clone(&source) as Arc<dyn RecordSource>, cache, Vec::new());

        assert_eq!(reader.get("settings", "a").await, Value::from("settings/a"));

        source.failing.store(true, Ordering::Release);
        assert_eq!(reader.get("settings", "a").await, Value::from("settings/a"));
        assert_eq!(reader.get("settings", "never").await, Value::Null);
    }

    #[tokio::test]
    async fn test_get_sync_items() {
        let cache = CacheTable::new();
        cache.stage("messages", "chat", Some(Value::Array(vec![Value::from(1), Value::from(2)])));
        cache.stage("settings", "theme", Some(Value::from("dark")));
        let reader = CacheAsideReader::new(Arc::new(FlakySource::default()), cache, Vec::new());

        assert_eq!(reader.get_sync_items("messages", "chat").len(), 2);
        assert!(reader.get_sync_items("settings", "theme").is_empty());
    }

    #[tokio::test]
    async fn test_get_leaves_cache_to_source() {
        let source = Arc::new(FlakySource::default());
        let cache = CacheTable::new();
        let staged = cache.stage("settings", "theme", Some(Value::from("dark")));
        cache.settle(staged.generation);
        // The source refreshes its own table, not the reader's.
        let reader = CacheAsideReader::new(Arc::clone(&source) as Arc<dyn RecordSource>, cache, Vec::new());

        assert_eq!(reader.get("settings", "theme").await, Value::from("settings/theme"));
        assert_eq!(source.reads.load(Ordering::Acquire), 1);
        assert_eq!(reader.get_sync("settings", "theme"), Value::from("dark"));
        assert_eq!(source.cache.value("settings", "theme"), Some(Value::from("settings/theme")));
    }
}
