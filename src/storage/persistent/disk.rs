//! The on-disk store: directory lock, WAL, segments and the in-memory catalog.

use std::fs;
use std::io::Result as IoResult;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::storage::catalog::Catalog;
use crate::storage::traits::Mutation;
use crate::value::Value;

use super::file_lock::FileLock;
use super::segment::SegmentManager;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::{PersistentConfig, SEGMENTS_DIR, WAL_FILE};

/// Result of a compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    /// WAL entries folded into the new segment.
    pub entries_compacted: u64,
    /// Path of the new segment, if one was written.
    pub segment_path: Option<PathBuf>,
    pub wal_size_before: u64,
    pub wal_size_after: u64,
}

#[cfg(unix)]
fn is_disk_full(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOSPC)
}

#[cfg(not(unix))]
fn is_disk_full(_e: &std::io::Error) -> bool {
    false
}

pub(crate) struct DiskStore {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    segments: Mutex<SegmentManager>,
    catalog: RwLock<Catalog>,
    config: PersistentConfig,
}

impl DiskStore {
    /// Opens or creates a store directory.
    ///
    /// # Errors
    /// - `WouldBlock` if another process holds the directory lock
    /// - `InvalidData` if the WAL header or every segment is unreadable
    pub fn open(dir: &Path, config: PersistentConfig) -> IoResult<Self> {
        fs::create_dir_all(dir)?;
        let lock = FileLock::acquire(dir)?;
        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)?;
        let segments = SegmentManager::open(&dir.join(SEGMENTS_DIR))?;

        let mut catalog = segments.load_latest()?.unwrap_or_default();
        let replayed = replay(&wal, &mut catalog)?;
        catalog.recount();

        info!(
            dir = %dir.display(),
            version = catalog.version,
            partitions = catalog.partitions.len(),
            replayed,
            "persistent store opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            segments: Mutex::new(segments),
            catalog: RwLock::new(catalog),
            config,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.catalog.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn segments(&self) -> MutexGuard<'_, SegmentManager> {
        self.segments.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn version(&self) -> u32 {
        self.read().version
    }

    pub fn partitions(&self) -> Vec<String> {
        self.read().partitions.keys().cloned().collect()
    }

    pub fn get(&self, partition: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.read().get(partition, key)
    }

    pub fn keys(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        self.read().keys(partition)
    }

    pub fn entries(&self, partition: &str) -> Result<Vec<(String, Value)>, StoreError> {
        self.read().entries(partition)
    }

    /// Raises the stored version and creates missing partitions. A request at
    /// or below the stored version changes nothing.
    pub fn upgrade(&self, version: u32, partitions: &[String]) -> IoResult<Vec<String>> {
        let mut catalog = self.write();
        if version <= catalog.version {
            return Ok(Vec::new());
        }
        self.wal.append(WalEntryKind::Upgrade {
            version,
            partitions: partitions.to_vec(),
        })?;
        Ok(catalog.upgrade(version, partitions))
    }

    /// Applies a transaction; it is durable when this returns `Ok`.
    pub fn commit(&self, partition: &str, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        let mut catalog = self.write();
        let applied = catalog.apply(partition, &mutations)?;
        let added = applied.added;

        let entry = WalEntryKind::Commit {
            partition: partition.to_string(),
            mutations,
        };
        if let Err(e) = self.wal.append(entry) {
            catalog.revert(applied);
            error!(partition, error = %e, "WAL append failed");
            return Err(if is_disk_full(&e) {
                StoreError::QuotaExceeded {
                    required: added,
                    available: 0,
                }
            } else {
                StoreError::aborted(format!("WAL append failed: {e}"))
            });
        }

        if self.config.auto_compact {
            match self.wal.size_bytes() {
                Ok(size) if size > self.config.max_wal_size => {
                    debug!(size, limit = self.config.max_wal_size, "WAL over limit; compacting");
                    if let Err(e) = self.compact_locked(&catalog) {
                        warn!(error = %e, "automatic compaction failed; WAL keeps growing");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "could not stat WAL"),
            }
        }
        Ok(())
    }

    /// Folds the WAL into a new segment and truncates it.
    ///
    /// Safe to call at any time: if it fails partway, the WAL still holds
    /// every entry and is replayed on the next open.
    pub fn compact(&self) -> IoResult<CompactionResult> {
        let catalog = self.write();
        self.compact_locked(&catalog)
    }

    // Callers hold the catalog write lock, so no commit can slip in between
    // the snapshot and the truncate.
    fn compact_locked(&self, catalog: &Catalog) -> IoResult<CompactionResult> {
        let current = self.wal.current_sequence();
        if current == 0 {
            return Ok(CompactionResult {
                entries_compacted: 0,
                segment_path: None,
                wal_size_before: 0,
                wal_size_after: 0,
            });
        }
        let wal_size_before = self.wal.size_bytes().unwrap_or(0);

        let segment_path = {
            let mut segments = self.segments();
            let segment = segments.create_writer().write(catalog)?;
            let path = segment.path().to_path_buf();
            segments.install(segment);
            path
        };

        self.wal.append(WalEntryKind::Checkpoint {
            up_to_sequence: current,
        })?;
        self.wal.truncate()?;
        let wal_size_after = self.wal.size_bytes().unwrap_or(0);

        info!(
            entries = current,
            segment = %segment_path.display(),
            wal_size_before,
            wal_size_after,
            "WAL compacted"
        );

        Ok(CompactionResult {
            entries_compacted: current,
            segment_path: Some(segment_path),
            wal_size_before,
            wal_size_after,
        })
    }

    pub fn wal_size(&self) -> u64 {
        self.wal.size_bytes().unwrap_or(0)
    }

    pub fn segment_count(&self) -> usize {
        self.segments().segments().len()
    }
}

/// Replays WAL entries on top of the snapshot. Returns the number replayed.
fn replay(wal: &WriteAheadLog, catalog: &mut Catalog) -> IoResult<u64> {
    let mut count = 0;
    for entry in wal.iter()? {
        let entry = entry?;
        match entry.kind {
            WalEntryKind::Upgrade { version, partitions } => {
                catalog.upgrade(version, &partitions);
            }
            WalEntryKind::Commit {
                partition,
                mutations,
            } => {
                if let Err(e) = catalog.apply(&partition, &mutations) {
                    warn!(sequence = entry.sequence, partition, error = %e, "skipping WAL entry");
                }
            }
            WalEntryKind::Checkpoint { .. } => {}
        }
        count += 1;
    }
    if count > 0 {
        debug!(count, "replayed WAL entries");
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use tempfile::tempdir;

    fn open(dir: &Path) -> DiskStore {
        DiskStore::open(dir, PersistentConfig::default()).unwrap()
    }

    fn partitions() -> Vec<String> {
        vec!["settings".to_string(), "messages".to_string()]
    }

    #[test]
    fn test_open_write_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            assert_eq!(store.upgrade(1, &partitions()).unwrap().len(), 2);
            store
                .commit("settings", vec![Mutation::put("theme", Value::from("dark"))])
                .unwrap();
        }

        let store = open(dir.path());
        assert_eq!(store.version(), 1);
        assert_eq!(store.get("settings", "theme").unwrap(), Some(Value::from("dark")));
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let _store = open(dir.path());
        let err = DiskStore::open(dir.path(), PersistentConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn test_compaction_creates_segment() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.upgrade(1, &partitions()).unwrap();
        for i in 0..10 {
            store
                .commit("messages", vec![Mutation::put(format!("chat_{i}"), Value::from(i))])
                .unwrap();
        }

        let result = store.compact().unwrap();
        assert_eq!(result.entries_compacted, 11);
        assert!(result.segment_path.is_some());
        assert!(result.wal_size_after < result.wal_size_before);
        assert_eq!(store.segment_count(), 1);

        let again = store.compact().unwrap();
        assert_eq!(again.entries_compacted, 0);
        assert!(again.segment_path.is_none());
    }

    #[test]
    fn test_data_survives_compaction_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.upgrade(2, &partitions()).unwrap();
            store
                .commit("settings", vec![Mutation::put("a", Value::from(1))])
                .unwrap();
            store.compact().unwrap();
            store
                .commit("settings", vec![Mutation::put("b", Value::from(2)), Mutation::delete("a")])
                .unwrap();
        }

        let store = open(dir.path());
        assert_eq!(store.version(), 2);
        assert_eq!(store.keys("settings").unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_auto_compaction_keeps_wal_bounded() {
        let dir = tempdir().unwrap();
        let config = PersistentConfig {
            max_wal_size: 4 * 1024,
            sync_on_write: false,
            auto_compact: true,
        };
        let store = DiskStore::open(dir.path(), config).unwrap();
        store.upgrade(1, &partitions()).unwrap();

        for i in 0..100 {
            store
                .commit("messages", vec![Mutation::put(format!("k{i}"), Value::from("x".repeat(100)))])
                .unwrap();
        }
        assert!(store.wal_size() <= 4 * 1024 + 512);
        assert_eq!(store.segment_count(), 1);
        assert_eq!(store.keys("messages").unwrap().len(), 100);
    }

    #[test]
    fn test_failed_commit_on_unknown_partition_is_not_logged() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.upgrade(1, &partitions()).unwrap();
        let before = store.wal_size();

        let err = store.commit("nope", vec![Mutation::Clear]).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert_eq!(store.wal_size(), before);
    }

    #[test]
    fn test_failed_wal_append_is_not_replayed() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.upgrade(1, &partitions()).unwrap();
            store
                .commit("settings", vec![Mutation::put("theme", Value::from("light"))])
                .unwrap();

            store.wal.fail_next_append();
            let err = store
                .commit("settings", vec![Mutation::put("theme", Value::from("dark"))])
                .unwrap_err();
            assert!(matches!(err, StoreError::TransactionAborted { .. }));
            assert_eq!(store.get("settings", "theme").unwrap(), Some(Value::from("light")));

            store
                .commit("settings", vec![Mutation::put("font", Value::from(14))])
                .unwrap();
        }

        let store = open(dir.path());
        assert_eq!(store.get("settings", "theme").unwrap(), Some(Value::from("light")));
        assert_eq!(store.get("settings", "font").unwrap(), Some(Value::from(14)));
    }
}
