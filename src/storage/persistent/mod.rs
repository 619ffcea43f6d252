//! Persistent storage backend.
//!
//! Durable, crash-safe physical store with:
//! - a write-ahead log, one frame per transaction
//! - CRC32 checksums on every frame
//! - snapshot segments written with temp-file + rename
//! - an exclusive directory lock
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     PersistentBackend                        │
//! │        (handles, version upgrades, blocking IO offload)      │
//! ├──────────────────────────────────────────────────────────────┤
//! │                         DiskStore                            │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌──────────────┐  │
//! │  │ WriteAheadLog   │  │ SegmentManager  │  │   Catalog    │  │
//! │  │ (append-only)   │  │ (snapshots)     │  │ (in memory)  │  │
//! │  └─────────────────┘  └─────────────────┘  └──────────────┘  │
//! │                  ┌─────────────────────┐                     │
//! │                  │   FileLock (flock)  │                     │
//! │                  └─────────────────────┘                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod codec;
mod disk;
mod file_lock;
mod segment;
mod wal;

pub use disk::CompactionResult;
pub use file_lock::FileLock;
pub use segment::{Segment, SegmentHeader, SegmentManager};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{ConfigError, ConnectionError, StoreError};
use crate::value::Value;

use self::disk::DiskStore;
use super::registry::HandleRegistry;
use super::traits::{ConnectRequest, ConnectionEvent, Mutation, PhysicalConnection, StorageBackend};

/// WAL file name inside the store directory.
pub const WAL_FILE: &str = "store.wal";
/// Segment directory name inside the store directory.
pub const SEGMENTS_DIR: &str = "segments";

/// Configuration for persistent storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// WAL size that triggers automatic compaction (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every commit (slower but safer).
    pub sync_on_write: bool,
    /// Compact automatically once the WAL exceeds `max_wal_size`.
    pub auto_compact: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 16 * 1024 * 1024,
            sync_on_write: true,
            auto_compact: true,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024; // avoids degenerate compaction loops

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ConfigError::invalid(
                "persistent.max_wal_size",
                format!(
                    "must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            ));
        }
        Ok(self)
    }
}

struct DiskShared {
    store: DiskStore,
    registry: HandleRegistry,
    // Serializes admission and upgrade across concurrent connects.
    gate: Mutex<()>,
}

/// Durable physical store rooted at a directory.
///
/// The directory is opened lazily on the first connect and stays open while
/// the backend or any handle is alive.
///
/// # Example
/// ```rust,no_run
/// use kyrokv::storage::persistent::{PersistentBackend, PersistentConfig};
///
/// let backend = PersistentBackend::new("./app-data", PersistentConfig::default())?;
/// # Ok::<(), kyrokv::ConfigError>(())
/// ```
pub struct PersistentBackend {
    dir: PathBuf,
    config: PersistentConfig,
    store: tokio::sync::Mutex<Option<Arc<DiskShared>>>,
}

impl PersistentBackend {
    pub fn new(dir: impl Into<PathBuf>, config: PersistentConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            dir: dir.into(),
            config: config.validate()?,
            store: tokio::sync::Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn shared(&self, requested: u32) -> Result<Arc<DiskShared>, ConnectionError> {
        let mut slot = self.store.lock().await;
        if let Some(shared) = slot.as_ref() {
            return Ok(Arc::clone(shared));
        }

        let dir = self.dir.clone();
        let config = self.config.clone();
        let store = tokio::task::spawn_blocking(move || DiskStore::open(&dir, config))
            .await
            .map_err(|e| ConnectionError::Denied {
                reason: format!("open task failed: {e}"),
            })?
            .map_err(|e| match e.kind() {
                ErrorKind::WouldBlock => ConnectionError::Blocked {
                    requested,
                    open_handles: 1,
                },
                _ => ConnectionError::Denied {
                    reason: format!("cannot open store at {}: {e}", self.dir.display()),
                },
            })?;

        let shared = Arc::new(DiskShared {
            store,
            registry: HandleRegistry::default(),
            gate: Mutex::new(()),
        });
        *slot = Some(Arc::clone(&shared));
        Ok(shared)
    }

    /// Compacts the WAL into a segment now.
    ///
    /// # Errors
    /// `Unavailable` if the store cannot be opened; `TransactionAborted` if the
    /// segment cannot be written.
    pub async fn compact(&self) -> Result<CompactionResult, StoreError> {
        let shared = self.shared(0).await?;
        tokio::task::spawn_blocking(move || shared.store.compact())
            .await
            .map_err(|e| StoreError::aborted(format!("compaction task failed: {e}")))?
            .map_err(|e| StoreError::aborted(format!("compaction failed: {e}")))
    }

    /// Current WAL size, if the store is open.
    pub async fn wal_size(&self) -> Option<u64> {
        self.store.lock().await.as_ref().map(|s| s.store.wal_size())
    }

    /// Number of segments on disk, if the store is open.
    pub async fn segment_count(&self) -> Option<usize> {
        self.store.lock().await.as_ref().map(|s| s.store.segment_count())
    }

    /// Drops the backend's own reference to the open store. The directory lock
    /// is released once the last handle is gone too.
    pub async fn release(&self) {
        if self.store.lock().await.take().is_some() {
            debug!(dir = %self.dir.display(), "persistent store released");
        }
    }
}

#[async_trait]
impl StorageBackend for PersistentBackend {
    async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<Arc<dyn PhysicalConnection>, ConnectionError> {
        let shared = self.shared(request.version).await?;

        // The handle is built inside the blocking task: if this connect is
        // abandoned, the finished handle is dropped there and deregisters itself.
        let conn = tokio::task::spawn_blocking(move || -> Result<Arc<PersistentConnection>, ConnectionError> {
            let _gate = shared.gate.lock().unwrap_or_else(PoisonError::into_inner);
            let stored = shared.store.version();
            shared.registry.admit(request.version, stored)?;

            let created = shared
                .store
                .upgrade(request.version, &request.partitions)
                .map_err(|e| ConnectionError::Denied {
                    reason: format!("upgrade failed: {e}"),
                })?;
            if request.version > stored {
                info!(
                    database = %request.database,
                    from = stored,
                    to = request.version,
                    created = ?created,
                    "persistent store upgraded"
                );
            }

            let registration = shared.registry.register(request.version);
            Ok(Arc::new(PersistentConnection {
                id: registration.id,
                version: request.version,
                open: AtomicBool::new(true),
                events: registration.events,
                shared: Arc::clone(&shared),
            }))
        })
        .await
        .map_err(|e| ConnectionError::Denied {
            reason: format!("connect task failed: {e}"),
        })??;

        debug!(id = conn.id, version = conn.version, "persistent connection opened");
        Ok(conn as Arc<dyn PhysicalConnection>)
    }

    fn name(&self) -> &'static str {
        "persistent"
    }
}

struct PersistentConnection {
    id: u64,
    version: u32,
    open: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    shared: Arc<DiskShared>,
}

impl std::fmt::Debug for PersistentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentConnection")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("dir", &self.shared.store.dir())
            .field("open", &self.is_open())
            .finish()
    }
}

impl PersistentConnection {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::aborted("connection closed"))
        }
    }
}

#[async_trait]
impl PhysicalConnection for PersistentConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn partitions(&self) -> Vec<String> {
        self.shared.store.partitions()
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn get(&self, partition: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.ensure_open()?;
        self.shared.store.get(partition, key)
    }

    async fn keys(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        self.shared.store.keys(partition)
    }

    async fn entries(&self, partition: &str) -> Result<Vec<(String, Value)>, StoreError> {
        self.ensure_open()?;
        self.shared.store.entries(partition)
    }

    async fn commit(&self, partition: &str, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        self.ensure_open()?;
        let shared = Arc::clone(&self.shared);
        let partition = partition.to_string();
        tokio::task::spawn_blocking(move || shared.store.commit(&partition, mutations))
            .await
            .map_err(|e| StoreError::aborted(format!("commit task failed: {e}")))?
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.shared.registry.release(self.id);
            debug!(id = self.id, "persistent connection closed");
        }
    }
}

impl Drop for PersistentConnection {
    fn drop(&mut self) {
        self.shared.registry.release(self.id);
    }
}
