//! In-memory storage backend.
//!
//! Thread-safe in-process implementation of the physical store. It is intended
//! for embedded usage and tests: an optional byte quota and one-shot fault
//! injection let every connection-lifecycle branch be exercised without a disk.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{ConnectionError, StoreError};
use crate::value::Value;

use super::catalog::Catalog;
use super::registry::HandleRegistry;
use super::traits::{ConnectRequest, ConnectionEvent, Mutation, PhysicalConnection, StorageBackend};

fn lock_err(context: &'static str) -> StoreError {
    StoreError::aborted(format!("poisoned lock: {context}"))
}

/// A one-shot failure consumed by the next matching operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The next connect registers its handle, then stalls for this long.
    SlowOpen(Duration),
    /// The next connect reports `Blocked`.
    Blocked,
    /// The next connect reports `Denied`.
    Denied(String),
    /// The next commit stalls for this long, then applies normally.
    SlowCommit(Duration),
    /// The next commit fails with `TransactionAborted`; the handle stays open.
    AbortCommit,
    /// The next commit loses its connection: the handle is closed and the
    /// commit aborted.
    DropConnection,
}

impl Fault {
    const fn on_connect(&self) -> bool {
        matches!(self, Self::SlowOpen(_) | Self::Blocked | Self::Denied(_))
    }

    const fn on_commit(&self) -> bool {
        matches!(self, Self::SlowCommit(_) | Self::AbortCommit | Self::DropConnection)
    }
}

/// Counters exposed for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub connect_calls: u64,
    pub commits: u64,
    pub live_handles: usize,
    pub stored_version: u32,
    pub used_bytes: u64,
}

struct MemoryShared {
    catalog: RwLock<Catalog>,
    registry: HandleRegistry,
    quota: Option<u64>,
    faults: Mutex<VecDeque<Fault>>,
    connect_calls: AtomicU64,
    commits: AtomicU64,
}

impl MemoryShared {
    fn read(&self) -> Result<RwLockReadGuard<'_, Catalog>, StoreError> {
        self.catalog.read().map_err(|_| lock_err("memory.catalog"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Catalog>, StoreError> {
        self.catalog.write().map_err(|_| lock_err("memory.catalog"))
    }

    fn take_fault(&self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = faults.iter().position(matches)?;
        faults.remove(idx)
    }
}

/// In-process physical store.
///
/// Cloning shares the same underlying store, so a test can keep a handle to
/// inject faults after giving a clone to a connection manager.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<MemoryShared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a store that refuses commits once `bytes` of records are stored.
    pub fn with_quota(bytes: u64) -> Self {
        Self::build(Some(bytes))
    }

    fn build(quota: Option<u64>) -> Self {
        Self {
            shared: Arc::new(MemoryShared {
                catalog: RwLock::new(Catalog::default()),
                registry: HandleRegistry::default(),
                quota,
                faults: Mutex::new(VecDeque::new()),
                connect_calls: AtomicU64::new(0),
                commits: AtomicU64::new(0),
            }),
        }
    }

    /// Queues a one-shot fault.
    pub fn inject(&self, fault: Fault) {
        self.shared
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(fault);
    }

    /// Number of queued faults not yet consumed.
    pub fn pending_faults(&self) -> usize {
        self.shared
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn stats(&self) -> MemoryStats {
        let (stored_version, used_bytes) = self
            .shared
            .read()
            .map(|c| (c.version, c.used_bytes()))
            .unwrap_or_default();
        MemoryStats {
            connect_calls: self.shared.connect_calls.load(Ordering::Relaxed),
            commits: self.shared.commits.load(Ordering::Relaxed),
            live_handles: self.shared.registry.live_count(),
            stored_version,
            used_bytes,
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<Arc<dyn PhysicalConnection>, ConnectionError> {
        self.shared.connect_calls.fetch_add(1, Ordering::Relaxed);

        let fault = self.shared.take_fault(Fault::on_connect);
        match &fault {
            Some(Fault::Blocked) => {
                return Err(ConnectionError::Blocked {
                    requested: request.version,
                    open_handles: self.shared.registry.live_count(),
                });
            }
            Some(Fault::Denied(reason)) => {
                return Err(ConnectionError::Denied {
                    reason: reason.clone(),
                });
            }
            _ => {}
        }

        let conn = {
            let mut catalog = self.shared.write().map_err(|e| ConnectionError::Denied {
                reason: e.to_string(),
            })?;
            self.shared.registry.admit(request.version, catalog.version)?;

            let from = catalog.version;
            if request.version > from {
                let created = catalog.upgrade(request.version, &request.partitions);
                info!(
                    database = %request.database,
                    from,
                    to = catalog.version,
                    created = ?created,
                    "memory store upgraded"
                );
            }

            let registration = self.shared.registry.register(request.version);
            Arc::new(MemoryConnection {
                id: registration.id,
                version: request.version,
                open: AtomicBool::new(true),
                events: registration.events,
                shared: Arc::clone(&self.shared),
            })
        };

        if let Some(Fault::SlowOpen(delay)) = fault {
            tokio::time::sleep(delay).await;
        }

        debug!(id = conn.id, version = conn.version, "memory connection opened");
        Ok(conn as Arc<dyn PhysicalConnection>)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryConnection {
    id: u64,
    version: u32,
    open: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    shared: Arc<MemoryShared>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::aborted("connection closed"))
        }
    }
}

#[async_trait]
impl PhysicalConnection for MemoryConnection {
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
        self.shared
            .read()
            .map(|c| c.partitions.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn get(&self, partition: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.ensure_open()?;
        self.shared.read()?.get(partition, key)
    }

    async fn keys(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        self.shared.read()?.keys(partition)
    }

    async fn entries(&self, partition: &str) -> Result<Vec<(String, Value)>, StoreError> {
        self.ensure_open()?;
        self.shared.read()?.entries(partition)
    }

    async fn commit(&self, partition: &str, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        self.ensure_open()?;

        match self.shared.take_fault(Fault::on_commit) {
            Some(Fault::AbortCommit) => return Err(StoreError::aborted("injected abort")),
            Some(Fault::DropConnection) => {
                self.close();
                return Err(StoreError::aborted("connection lost"));
            }
            Some(Fault::SlowCommit(delay)) => {
                tokio::time::sleep(delay).await;
                self.ensure_open()?;
            }
            _ => {}
        }

        let mut catalog = self.shared.write()?;
        let before = catalog.used_bytes();
        let applied = catalog.apply(partition, &mutations)?;

        if let Some(quota) = self.shared.quota {
            if catalog.used_bytes() > quota {
                let required = applied.added.saturating_sub(applied.removed);
                catalog.revert(applied);
                return Err(StoreError::QuotaExceeded {
                    required,
                    available: quota.saturating_sub(before),
                });
            }
        }

        self.shared.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.shared.registry.release(self.id);
            debug!(id = self.id, "memory connection closed");
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shared.registry.release(self.id);
    }
}
