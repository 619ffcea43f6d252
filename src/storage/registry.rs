//! Live handle bookkeeping for version upgrades.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

use crate::error::ConnectionError;

use super::traits::ConnectionEvent;

const EVENT_CAPACITY: usize = 4;

struct LiveHandle {
    version: u32,
    events: broadcast::Sender<ConnectionEvent>,
}

/// A freshly registered handle.
pub(crate) struct Registration {
    pub id: u64,
    pub events: broadcast::Sender<ConnectionEvent>,
}

/// Tracks open handles so an upgrade can ask older ones to close.
#[derive(Default)]
pub(crate) struct HandleRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, LiveHandle>>,
}

impl HandleRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, LiveHandle>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decides whether a connect at `requested` may proceed against the
    /// `stored` version.
    ///
    /// An upgrade with older handles still open signals each of them and
    /// reports `Blocked`; the caller retries once they have closed.
    pub fn admit(&self, requested: u32, stored: u32) -> Result<(), ConnectionError> {
        if requested < stored {
            return Err(ConnectionError::VersionConflict { requested, stored });
        }
        if requested == stored {
            return Ok(());
        }

        let live = self.lock();
        let stale: Vec<&LiveHandle> = live.values().filter(|h| h.version < requested).collect();
        if stale.is_empty() {
            return Ok(());
        }
        for handle in &stale {
            // A handle nobody listens to is closed by its owner's drop.
            let _ = handle.events.send(ConnectionEvent::VersionChange {
                old_version: handle.version,
                new_version: requested,
            });
        }
        debug!(requested, stale = stale.len(), "upgrade blocked by open handles");
        Err(ConnectionError::Blocked {
            requested,
            open_handles: stale.len(),
        })
    }

    pub fn register(&self, version: u32) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        self.lock().insert(
            id,
            LiveHandle {
                version,
                events: events.clone(),
            },
        );
        Registration { id, events }
    }

    /// Forgets a handle. Returns false if it was already released.
    pub fn release(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_rejects_downgrade() {
        let registry = HandleRegistry::default();
        let err = registry.admit(1, 3).unwrap_err();
        assert_eq!(err, ConnectionError::VersionConflict { requested: 1, stored: 3 });
    }

    #[test]
    fn test_upgrade_blocked_and_signalled() {
        let registry = HandleRegistry::default();
        let old = registry.register(1);
        let mut rx = old.events.subscribe();

        let err = registry.admit(2, 1).unwrap_err();
        assert!(matches!(err, ConnectionError::Blocked { requested: 2, open_handles: 1 }));
        assert_eq!(
            rx.try_recv().unwrap(),
            ConnectionEvent::VersionChange { old_version: 1, new_version: 2 }
        );

        assert!(registry.release(old.id));
        assert!(!registry.release(old.id));
        assert!(registry.admit(2, 1).is_ok());
    }

    #[test]
    fn test_same_version_never_blocks() {
        let registry = HandleRegistry::default();
        let a = registry.register(1);
        let b = registry.register(1);
        assert_ne!(a.id, b.id);
        assert!(registry.admit(1, 1).is_ok());
        assert_eq!(registry.live_count(), 2);
    }
}
