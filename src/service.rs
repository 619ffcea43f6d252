//! Application-root composition of the storage layer.
//!
//! A [`StorageService`] is created once at startup and handed to whatever
//! needs storage. It owns the connection, store, cache and reader; there is
//! no module-level state anywhere in the crate.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kyrokv::legacy::{default_layout, MemoryLegacyStore};
//! use kyrokv::storage::MemoryBackend;
//! use kyrokv::StorageService;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let service = StorageService::builder(Arc::new(MemoryBackend::new()))
//!     .legacy(Arc::new(MemoryLegacyStore::new()), default_layout())
//!     .preload("settings", "chatList")
//!     .start()
//!     .await?;
//!
//! service.store().set("settings", "theme", "dark").await?;
//! let chats = service.reader().get_sync_items("settings", "chatList");
//! # let _ = chats;
//! service.close();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::info;

use crate::cache::CacheTable;
use crate::config::StorageConfig;
use crate::connection::ConnectionManager;
use crate::error::ConfigError;
use crate::guard::SerializationGuard;
use crate::legacy::{LegacyLayout, LegacySource};
use crate::migration::{MigrationResult, MigrationRunner};
use crate::reader::CacheAsideReader;
use crate::storage::StorageBackend;
use crate::store::{KeyValueStore, RecordSource};
use crate::tiered::TieredStore;

/// Builder for [`StorageService`].
pub struct StorageServiceBuilder {
    backend: Arc<dyn StorageBackend>,
    config: StorageConfig,
    legacy: Option<(Arc<dyn LegacySource>, LegacyLayout)>,
    preload: Vec<(String, String)>,
}

impl StorageServiceBuilder {
    #[must_use]
    pub fn config(mut self, config: StorageConfig) -> Self {
        self.config = config;
        self
    }

    /// Attaches a legacy area: it is migrated on start and serves as read
    /// fallback through [`StorageService::tiered`].
    #[must_use]
    pub fn legacy(mut self, source: Arc<dyn LegacySource>, layout: LegacyLayout) -> Self {
        self.legacy = Some((source, layout));
        self
    }

    /// Adds a key to preload into the cache on start.
    #[must_use]
    pub fn preload(mut self, partition: impl Into<String>, key: impl Into<String>) -> Self {
        self.preload.push((partition.into(), key.into()));
        self
    }

    /// Validates the configuration, runs the migration and starts the
    /// preload.
    ///
    /// Migration problems never fail startup; see
    /// [`StorageService::migration`].
    ///
    /// # Errors
    /// `ConfigError` if the configuration is invalid.
    pub async fn start(self) -> Result<StorageService, ConfigError> {
        let config = self.config.validate()?;

        let cache = CacheTable::new();
        let connection = ConnectionManager::new(self.backend, config.connection.clone());
        let store = KeyValueStore::new(
            connection.clone(),
            SerializationGuard::new(config.guard.clone()),
            cache.clone(),
        );

        let (tiered, migration) = match self.legacy {
            Some((source, layout)) => {
                let layout = Arc::new(layout);
                let runner = MigrationRunner::new(
                    store.clone(),
                    Arc::clone(&source),
                    Arc::clone(&layout),
                    config.migration.clone(),
                );
                let result = runner.migrate().await;
                let tiered = TieredStore::new(store.clone(), source, layout, config.migration.promote_legacy_reads);
                (Some(tiered), Some(result))
            }
            None => (None, None),
        };

        let source: Arc<dyn RecordSource> = match &tiered {
            Some(tiered) => Arc::new(tiered.clone()) as Arc<dyn RecordSource>,
            None => Arc::new(store.clone()) as Arc<dyn RecordSource>,
        };
        let reader = CacheAsideReader::new(source, cache, self.preload);

        info!(
            database = %config.connection.database,
            partitions = config.connection.partitions.len(),
            legacy = tiered.is_some(),
            "storage service started"
        );

        Ok(StorageService {
            config,
            connection,
            store,
            tiered,
            reader,
            migration,
        })
    }
}

/// The storage layer, composed.
pub struct StorageService {
    config: StorageConfig,
    connection: ConnectionManager,
    store: KeyValueStore,
    tiered: Option<TieredStore>,
    reader: CacheAsideReader,
    migration: Option<MigrationResult>,
}

impl std::fmt::Debug for StorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageService")
            .field("connection", &self.connection)
            .field("legacy", &self.tiered.is_some())
            .field("migration", &self.migration.as_ref().map(|m| m.status))
            .finish_non_exhaustive()
    }
}

impl StorageService {
    pub fn builder(backend: Arc<dyn StorageBackend>) -> StorageServiceBuilder {
        StorageServiceBuilder {
            backend,
            config: StorageConfig::default(),
            legacy: None,
            preload: Vec::new(),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn store(&self) -> &KeyValueStore {
        &self.store
    }

    /// Store with legacy fallback, if a legacy area is attached.
    pub fn tiered(&self) -> Option<&TieredStore> {
        self.tiered.as_ref()
    }

    pub fn reader(&self) -> &CacheAsideReader {
        &self.reader
    }

    /// Outcome of the startup migration, if a legacy area is attached.
    pub fn migration(&self) -> Option<&MigrationResult> {
        self.migration.as_ref()
    }

    /// Closes the connection. Later operations reopen it.
    pub fn close(&self) {
        self.connection.close();
        info!("storage service closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::ConnectionConfig;
    use crate::legacy::{default_layout, MemoryLegacyStore};
    use crate::migration::MigrationStatus;
    use crate::storage::MemoryBackend;
    use crate::value::Value;

    #[tokio::test]
    async fn test_start_without_legacy() {
        let service = StorageService::builder(Arc::new(MemoryBackend::new()))
            .start()
            .await
            .unwrap();

        assert!(service.tiered().is_none());
        assert!(service.migration().is_none());
        service.store().set("settings", "theme", "dark").await.unwrap();
        assert_eq!(service.reader().get_sync("settings", "theme"), Value::from("dark"));
    }

    #[tokio::test]
    async fn test_start_migrates_then_preloads() {
        let legacy: MemoryLegacyStore = [("chatList", r#"[{"id":"c1"}]"#)].into_iter().collect();
        let service = StorageService::builder(Arc::new(MemoryBackend::new()))
            .legacy(Arc::new(legacy), default_layout())
            .preload("settings", "chatList")
            .start()
            .await
            .unwrap();

        assert_eq!(service.migration().unwrap().status, MigrationStatus::Completed);
        service.reader().preloaded().await;
        assert_eq!(service.reader().get_sync_items("settings", "chatList").len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = StorageConfig {
            connection: ConnectionConfig::with_partitions(Vec::<String>::new()),
            ..StorageConfig::default()
        };
        let err = StorageService::builder(Arc::new(MemoryBackend::new()))
            .config(config)
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { field: "connection.partitions", .. }));
    }
}
