//! Two-tier reads: the partitioned store first, the legacy area on a miss.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::legacy::{parse_legacy, LegacyLayout, LegacySource};
use crate::store::{KeyValueStore, RecordSource};
use crate::value::Value;

/// Read decorator that falls back to the legacy area.
///
/// Legacy hits are optionally promoted into the primary store so the next
/// read is served from there. The legacy area itself is never written.
#[derive(Clone)]
pub struct TieredStore {
    primary: KeyValueStore,
    legacy: Arc<dyn LegacySource>,
    layout: Arc<LegacyLayout>,
    promote: bool,
}

impl std::fmt::Debug for TieredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStore")
            .field("primary", &self.primary)
            .field("promote", &self.promote)
            .finish_non_exhaustive()
    }
}

impl TieredStore {
    pub fn new(primary: KeyValueStore, legacy: Arc<dyn LegacySource>, layout: Arc<LegacyLayout>, promote: bool) -> Self {
        Self {
            primary,
            legacy,
            layout,
            promote,
        }
    }

    pub fn primary(&self) -> &KeyValueStore {
        &self.primary
    }

    fn read_legacy(&self, partition: &str, key: &str) -> Option<Value> {
        let legacy_key = self.layout.reverse(partition, key)?;
        let raw = self.legacy.get(&legacy_key).filter(|raw| !raw.is_empty())?;
        let target = self.layout.resolve(&legacy_key)?;
        match parse_legacy(&raw, target.parse) {
            Ok(value) => Some(value),
            Err(reason) => {
                warn!(legacy_key = %legacy_key, reason = %reason, "unreadable legacy record");
                None
            }
        }
    }
}

#[async_trait]
impl RecordSource for TieredStore {
    async fn get(&self, partition: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let observed = self.primary.cache().generation();
        if let Some(value) = self.primary.get(partition, key).await? {
            return Ok(Some(value));
        }
        let Some(value) = self.read_legacy(partition, key) else {
            return Ok(None);
        };
        debug!(partition, key, "served from legacy area");

        if self.promote {
            // The value is returned either way; a failed promotion only means
            // the next read hits the legacy area again.
            if let Err(e) = self.primary.set(partition, key, value.clone()).await {
                warn!(partition, key, error = %e, "failed to promote legacy record");
            }
        } else {
            self.primary.cache().refresh(partition, key, Some(value.clone()), observed);
        }
        Ok(Some(value))
    }

    /// Keys of the partition in either tier, sorted and deduplicated.
    async fn list_keys(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = self.primary.list_keys(partition).await?;
        keys.extend(self.legacy.keys().into_iter().filter_map(|legacy_key| {
            let target = self.layout.resolve(&legacy_key)?;
            (target.partition == partition).then_some(target.key)
        }));
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}
