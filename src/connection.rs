//! Connection lifecycle management.
//!
//! [`ConnectionManager`] owns the single physical connection of a store:
//!
//! - opened lazily on first use, concurrent openers share one attempt
//! - each attempt bounded by a timeout, transient failures retried with
//!   exponential backoff
//! - closed when another connect upgrades the schema, then reopened lazily
//!
//! ```text
//!            open()                 connect ok
//!  Closed ─────────────▶ Opening ─────────────▶ Open
//!    ▲                   │  ▲  │                  │
//!    │  retries spent    │  │  │ fatal            │ close() / version change
//!    └───────────────────┘  │  ▼                  │
//!                     Blocked  Invalid            ▼
//!                                               Closed
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, StoreError};
use crate::storage::{ConnectRequest, ConnectionEvent, PhysicalConnection, StorageBackend};

type OpenFuture = Shared<BoxFuture<'static, Result<Arc<dyn PhysicalConnection>, ConnectionError>>>;

const EVENT_CAPACITY: usize = 64;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    /// Opening, and the last attempt was blocked by older handles.
    Blocked,
    /// The last open failed fatally; the next `open()` tries again.
    Invalid,
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Opened { connection_id: u64, version: u32 },
    Retrying { attempt: u32, error: ConnectionError },
    Closed { connection_id: u64 },
    VersionChange { connection_id: u64, new_version: u32 },
    Failed { error: ConnectionError },
}

enum Slot {
    Closed,
    Opening { epoch: u64, future: OpenFuture },
    Open(Arc<dyn PhysicalConnection>),
    Invalid(ConnectionError),
}

struct Inner {
    backend: Arc<dyn StorageBackend>,
    config: ConnectionConfig,
    slot: Mutex<Slot>,
    epoch: AtomicU64,
    blocked: AtomicBool,
    created: AtomicU64,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn establish(self: Arc<Self>, epoch: u64) -> Result<Arc<dyn PhysicalConnection>, ConnectionError> {
        let request = ConnectRequest {
            database: self.config.database.clone(),
            version: self.config.version,
            partitions: self.config.partitions.clone(),
        };
        let timeout = self.config.open_timeout();
        let max_attempts = self.config.max_open_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            // A timed-out attempt is dropped here; a handle it already
            // registered is released by its own drop.
            let outcome = match tokio::time::timeout(timeout, self.backend.connect(request.clone())).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::timeout(timeout)),
            };

            match outcome {
                Ok(conn) => {
                    self.blocked.store(false, Ordering::Release);
                    self.created.fetch_add(1, Ordering::Relaxed);
                    return Ok(self.install(epoch, conn));
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    self.blocked
                        .store(matches!(err, ConnectionError::Blocked { .. }), Ordering::Release);
                    let delay = self.config.backoff_for(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        error = %err,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "open attempt failed; retrying"
                    );
                    self.emit(LifecycleEvent::Retrying { attempt, error: err });
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.blocked.store(false, Ordering::Release);
                    error!(attempt, database = %request.database, error = %err, "failed to open store");
                    let next = if err.is_transient() {
                        Slot::Closed
                    } else {
                        Slot::Invalid(err.clone())
                    };
                    self.finish(epoch, next);
                    self.emit(LifecycleEvent::Failed { error: err.clone() });
                    return Err(err);
                }
            }
        }
    }

    /// Leaves the `Opening` state, unless a newer open or a close superseded it.
    fn finish(&self, epoch: u64, next: Slot) -> bool {
        let mut slot = self.slot();
        let current = matches!(&*slot, Slot::Opening { epoch: e, .. } if *e == epoch);
        if current {
            *slot = next;
        }
        current
    }

    fn install(self: &Arc<Self>, epoch: u64, conn: Arc<dyn PhysicalConnection>) -> Arc<dyn PhysicalConnection> {
        if !self.finish(epoch, Slot::Open(Arc::clone(&conn))) {
            debug!(id = conn.id(), "connection opened after close was requested; discarding");
            conn.close();
            return conn;
        }

        info!(
            id = conn.id(),
            version = conn.version(),
            backend = self.backend.name(),
            "store connection open"
        );
        self.emit(LifecycleEvent::Opened {
            connection_id: conn.id(),
            version: conn.version(),
        });
        self.watch(&conn);
        conn
    }

    /// Closes `conn` when an upgrade elsewhere asks for it.
    fn watch(self: &Arc<Self>, conn: &Arc<dyn PhysicalConnection>) {
        let mut events = conn.events();
        let conn = Arc::downgrade(conn);
        let inner = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::VersionChange { new_version, .. }) => {
                        let Some(conn) = conn.upgrade() else { break };
                        conn.close();
                        if let Some(inner) = inner.upgrade() {
                            info!(id = conn.id(), new_version, "store upgraded elsewhere; connection closed");
                            inner.invalidate(conn.id());
                            inner.emit(LifecycleEvent::VersionChange {
                                connection_id: conn.id(),
                                new_version,
                            });
                        }
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Drops the current handle if it is `id`; the next call reopens.
    fn invalidate(&self, id: u64) {
        let mut slot = self.slot();
        if matches!(&*slot, Slot::Open(conn) if conn.id() == id) {
            *slot = Slot::Closed;
        }
    }
}

/// Owner of the store's single physical connection.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("backend", &self.inner.backend.name())
            .field("database", &self.inner.config.database)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn StorageBackend>, config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                slot: Mutex::new(Slot::Closed),
                epoch: AtomicU64::new(0),
                blocked: AtomicBool::new(false),
                created: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.inner.slot() {
            Slot::Closed => ConnectionState::Closed,
            Slot::Opening { .. } if self.inner.blocked.load(Ordering::Acquire) => ConnectionState::Blocked,
            Slot::Opening { .. } => ConnectionState::Opening,
            Slot::Open(conn) if conn.is_open() => ConnectionState::Open,
            Slot::Open(_) => ConnectionState::Closed,
            Slot::Invalid(_) => ConnectionState::Invalid,
        }
    }

    /// The error that left the manager `Invalid`, if any.
    pub fn last_error(&self) -> Option<ConnectionError> {
        match &*self.inner.slot() {
            Slot::Invalid(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Number of physical connections established so far.
    pub fn connections_created(&self) -> u64 {
        self.inner.created.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// Returns the open connection, establishing it if needed.
    ///
    /// Concurrent callers while an open is in flight share that attempt.
    ///
    /// # Errors
    /// The final `ConnectionError`: `Denied` or `VersionConflict` right away,
    /// `Timeout` or `Blocked` once all attempts are spent.
    pub async fn open(&self) -> Result<Arc<dyn PhysicalConnection>, ConnectionError> {
        let future = {
            let mut slot = self.inner.slot();
            match &*slot {
                Slot::Open(conn) if conn.is_open() => return Ok(Arc::clone(conn)),
                Slot::Opening { future, .. } => future.clone(),
                _ => {
                    let epoch = self.inner.epoch.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(epoch, database = %self.inner.config.database, "opening store");
                    let future = Arc::clone(&self.inner).establish(epoch).boxed().shared();
                    *slot = Slot::Opening {
                        epoch,
                        future: future.clone(),
                    };
                    future
                }
            }
        };
        future.await
    }

    /// Closes the connection. The next operation reopens it.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.inner.slot(), Slot::Closed);
        self.inner.blocked.store(false, Ordering::Release);
        if let Slot::Open(conn) = previous {
            conn.close();
            info!(id = conn.id(), "store connection closed");
            self.inner.emit(LifecycleEvent::Closed {
                connection_id: conn.id(),
            });
        }
    }

    /// Runs `op` against the open connection.
    ///
    /// If the connection is lost while `op` runs (`TransactionAborted` on a
    /// handle that is no longer open), `op` is retried on a fresh connection,
    /// up to `max_open_attempts` times.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: Fn(Arc<dyn PhysicalConnection>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.inner.config.max_open_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let conn = self.open().await?;
            match op(Arc::clone(&conn)).await {
                Err(StoreError::TransactionAborted { reason }) if !conn.is_open() && attempt < max_attempts => {
                    warn!(attempt, reason = %reason, "connection lost during operation; retrying");
                    self.inner.invalidate(conn.id());
                }
                result => return result,
            }
        }
    }
}
