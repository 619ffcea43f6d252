//! One-time migration from the legacy area into the partitioned store.
//!
//! The pass is guarded by a marker record holding the migration version:
//! - marker current: nothing to do
//! - otherwise every mapped legacy key is parsed and `set` into its partition,
//!   then the marker is written
//!
//! A bad record is logged and skipped. Losing the store itself aborts the pass
//! with the marker unset, so it runs again on the next start; re-running is
//! safe because every write overwrites the same address.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::MigrationConfig;
use crate::error::{MigrationError, StoreError};
use crate::legacy::{parse_legacy, LegacyLayout, LegacySource};
use crate::store::KeyValueStore;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    /// The marker already matched; nothing was written.
    AlreadyCurrent,
    /// All records were processed and the marker written.
    Completed,
    /// The store became unavailable; the marker was left unset.
    Incomplete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationResult {
    pub status: MigrationStatus,
    pub migrated: usize,
    /// Legacy keys no layout rule covers.
    pub unmapped: usize,
    /// Mapped keys with an empty value.
    pub skipped: usize,
    pub failures: Vec<MigrationError>,
    pub duration: Duration,
}

impl MigrationResult {
    fn new(status: MigrationStatus) -> Self {
        Self {
            status,
            migrated: 0,
            unmapped: 0,
            skipped: 0,
            failures: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// True once the marker is current.
    pub fn is_done(&self) -> bool {
        self.status != MigrationStatus::Incomplete
    }
}

pub struct MigrationRunner {
    store: KeyValueStore,
    legacy: Arc<dyn LegacySource>,
    layout: Arc<LegacyLayout>,
    config: MigrationConfig,
}

impl std::fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MigrationRunner {
    pub fn new(
        store: KeyValueStore,
        legacy: Arc<dyn LegacySource>,
        layout: Arc<LegacyLayout>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            store,
            legacy,
            layout,
            config,
        }
    }

    pub fn store(&self) -> &KeyValueStore {
        &self.store
    }

    /// The stored marker, if any.
    pub async fn marker(&self) -> Result<Option<String>, StoreError> {
        let value = self
            .store
            .get(&self.config.marker_partition, &self.config.marker_key)
            .await?;
        Ok(value.and_then(|v| v.as_str().map(str::to_string)))
    }

    pub async fn needs_migration(&self) -> Result<bool, StoreError> {
        Ok(self.marker().await?.as_deref() != Some(self.config.version.as_str()))
    }

    /// Runs the migration pass. Never fails; the outcome is in the result.
    pub async fn migrate(&self) -> MigrationResult {
        let started = Instant::now();
        let mut result = self.run().await;
        result.duration = started.elapsed();

        match result.status {
            MigrationStatus::AlreadyCurrent => {
                debug!(version = %self.config.version, "legacy migration already current");
            }
            MigrationStatus::Completed => info!(
                version = %self.config.version,
                migrated = result.migrated,
                failed = result.failures.len(),
                unmapped = result.unmapped,
                duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
                "legacy migration finished"
            ),
            MigrationStatus::Incomplete => warn!(
                migrated = result.migrated,
                "legacy migration incomplete; will retry on next start"
            ),
        }
        result
    }

    async fn run(&self) -> MigrationResult {
        match self.marker().await {
            Ok(Some(marker)) if marker == self.config.version => {
                return MigrationResult::new(MigrationStatus::AlreadyCurrent);
            }
            Ok(marker) => {
                info!(from = ?marker, to = %self.config.version, "starting legacy migration");
            }
            Err(e) => {
                error!(error = %e, "cannot read migration marker");
                return MigrationResult::new(MigrationStatus::Incomplete);
            }
        }

        let mut result = MigrationResult::new(MigrationStatus::Completed);
        let mut keys = self.legacy.keys();
        keys.sort_unstable();

        for legacy_key in keys {
            let Some(target) = self.layout.resolve(&legacy_key) else {
                debug!(legacy_key = %legacy_key, "no mapping for legacy key");
                result.unmapped += 1;
                continue;
            };
            let Some(raw) = self.legacy.get(&legacy_key).filter(|raw| !raw.is_empty()) else {
                result.skipped += 1;
                continue;
            };

            let value = match parse_legacy(&raw, target.parse) {
                Ok(value) => value,
                Err(reason) => {
                    warn!(legacy_key = %legacy_key, reason = %reason, "legacy record not parseable; skipped");
                    result.failures.push(MigrationError::PartialFailure { legacy_key, reason });
                    continue;
                }
            };

            match self.store.set(&target.partition, &target.key, value).await {
                Ok(_) => {
                    debug!(legacy_key = %legacy_key, partition = %target.partition, key = %target.key, "migrated");
                    result.migrated += 1;
                }
                Err(StoreError::Unavailable(e)) => {
                    error!(legacy_key = %legacy_key, error = %e, "store unavailable; aborting migration");
                    result.status = MigrationStatus::Incomplete;
                    return result;
                }
                Err(e) => {
                    warn!(legacy_key = %legacy_key, error = %e, "legacy record not migrated; skipped");
                    result.failures.push(MigrationError::PartialFailure {
                        legacy_key,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let marker = Value::from(self.config.version.as_str());
        if let Err(e) = self
            .store
            .set(&self.config.marker_partition, &self.config.marker_key, marker)
            .await
        {
            error!(error = %e, "failed to write migration marker");
            result.status = MigrationStatus::Incomplete;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cache::CacheTable;
    use crate::config::ConnectionConfig;
    use crate::connection::ConnectionManager;
    use crate::guard::SerializationGuard;
    use crate::legacy::{default_layout, MemoryLegacyStore};
    use crate::storage::{Fault, MemoryBackend};

    fn runner(backend: &MemoryBackend, legacy: MemoryLegacyStore) -> MigrationRunner {
        let config = ConnectionConfig {
            retry_backoff_ms: 5,
            ..ConnectionConfig::default()
        };
        let connection = ConnectionManager::new(Arc::new(backend.clone()), config);
        let store = KeyValueStore::new(connection, SerializationGuard::default(), CacheTable::new());
        MigrationRunner::new(store, Arc::new(legacy), Arc::new(default_layout()), MigrationConfig::default())
    }

    #[tokio::test]
    async fn test_migrates_and_writes_marker() {
        let backend = MemoryBackend::new();
        let legacy: MemoryLegacyStore = [
            ("messages_42", r#"[{"id":1}]"#),
            ("wallet_balance", "120.50"),
            ("unrelated", "x"),
        ]
        .into_iter()
        .collect();
        let runner = runner(&backend, legacy);

        let result = runner.migrate().await;
        assert_eq!(result.status, MigrationStatus::Completed);
        assert_eq!(result.migrated, 2);
        assert_eq!(result.unmapped, 1);
        assert!(result.failures.is_empty());

        let store = runner.store();
        assert!(store.get("messages", "42").await.unwrap().is_some());
        assert_eq!(store.get("wallet", "balance").await.unwrap(), Some(Value::from("120.50")));
        assert_eq!(runner.marker().await.unwrap().as_deref(), Some("1.0"));
        assert!(!runner.needs_migration().await.unwrap());
    }

    #[tokio::test]
    async fn test_second_run_writes_nothing() {
        let backend = MemoryBackend::new();
        let legacy: MemoryLegacyStore = [("chatList", "[1]")].into_iter().collect();
        let runner = runner(&backend, legacy);

        runner.migrate().await;
        let commits = backend.stats().commits;

        let again = runner.migrate().await;
        assert_eq!(again.status, MigrationStatus::AlreadyCurrent);
        assert_eq!(again.migrated, 0);
        assert_eq!(backend.stats().commits, commits);
    }

    #[tokio::test]
    async fn test_bad_record_does_not_abort_pass() {
        let backend = MemoryBackend::new();
        let legacy: MemoryLegacyStore = [
            ("characters", "{broken"),
            ("moments", "[]"),
            ("userInfo", ""),
        ]
        .into_iter()
        .collect();
        let runner = runner(&backend, legacy);

        let result = runner.migrate().await;
        assert_eq!(result.status, MigrationStatus::Completed);
        assert_eq!(result.migrated, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.failures.len(), 1);
        assert!(matches!(
            &result.failures[0],
            MigrationError::PartialFailure { legacy_key, .. } if legacy_key == "characters"
        ));
        assert_eq!(runner.marker().await.unwrap().as_deref(), Some("1.0"));
    }

    #[tokio::test]
    async fn test_unavailable_store_leaves_marker_unset() {
        let backend = MemoryBackend::new();
        let legacy: MemoryLegacyStore = [("moments", "[]"), ("characters", "[]")].into_iter().collect();
        let runner = runner(&backend, legacy);

        runner.store().connection().open().await.unwrap();
        backend.inject(Fault::DropConnection);
        backend.inject(Fault::Denied("storage disabled".to_string()));

        let result = runner.migrate().await;
        assert_eq!(result.status, MigrationStatus::Incomplete);
        assert!(!result.is_done());
        assert_eq!(runner.marker().await.unwrap(), None);

        let retry = runner.migrate().await;
        assert_eq!(retry.status, MigrationStatus::Completed);
        assert_eq!(retry.migrated, 2);
    }
}
