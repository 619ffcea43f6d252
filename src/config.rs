//! Configuration for the storage service.
//!
//! Every section has sensible defaults and a `validate` step; the whole tree
//! can also be loaded from TOML:
//!
//! ```toml
//! [connection]
//! version = 2
//! partitions = ["messages", "settings", "feed"]
//! open_timeout_ms = 2000
//!
//! [guard.default_policy]
//! max_bytes = 4194304
//!
//! [guard.partitions.feed]
//! retain_last = 200
//!
//! [migration]
//! marker_partition = "settings"
//! ```

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Partitions created by default, matching the application's record families.
pub const DEFAULT_PARTITIONS: &[&str] = &[
    "messages",
    "moments",
    "characters",
    "userInfo",
    "wallet",
    "emojis",
    "settings",
    "misc",
    "dmMessages",
    "dmConversations",
];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub connection: ConnectionConfig,
    pub guard: GuardConfig,
    pub migration: MigrationConfig,
}

impl StorageConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()
    }

    /// Validates all sections, including cross-section references.
    pub fn validate(self) -> Result<Self, ConfigError> {
        let connection = self.connection.validate()?;
        let guard = self.guard.validate()?;
        let migration = self.migration.validate()?;

        if !connection.has_partition(&migration.marker_partition) {
            return Err(ConfigError::invalid(
                "migration.marker_partition",
                format!("'{}' is not a configured partition", migration.marker_partition),
            ));
        }
        for name in guard.partitions.keys() {
            if !connection.has_partition(name) {
                return Err(ConfigError::invalid(
                    "guard.partitions",
                    format!("policy given for unknown partition '{name}'"),
                ));
            }
        }

        Ok(Self {
            connection,
            guard,
            migration,
        })
    }
}

/// Connection lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Logical database name, reported in logs.
    pub database: String,
    /// Schema version requested on open. Raising it triggers an upgrade.
    pub version: u32,
    /// Partitions that must exist once the connection is open.
    pub partitions: Vec<String>,
    /// Bound on a single open attempt.
    pub open_timeout_ms: u64,
    /// Open attempts before a transient failure is surfaced.
    pub max_open_attempts: u32,
    /// Delay before the second attempt; doubles on each further attempt.
    pub retry_backoff_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            database: "kyrokv".to_string(),
            version: 1,
            partitions: DEFAULT_PARTITIONS.iter().map(|p| (*p).to_string()).collect(),
            open_timeout_ms: 3_000,
            max_open_attempts: 3,
            retry_backoff_ms: 100,
        }
    }
}

impl ConnectionConfig {
    /// Convenience constructor for a custom partition set.
    pub fn with_partitions<I, S>(partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            partitions: partitions.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Backoff before attempt `attempt + 1` (attempts are 1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1u64 << shift))
    }

    pub fn has_partition(&self, name: &str) -> bool {
        self.partitions.iter().any(|p| p == name)
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.version == 0 {
            return Err(ConfigError::invalid("connection.version", "must be at least 1"));
        }
        if self.partitions.is_empty() {
            return Err(ConfigError::invalid("connection.partitions", "at least one partition is required"));
        }
        let mut seen = BTreeSet::new();
        for name in &self.partitions {
            if name.trim().is_empty() {
                return Err(ConfigError::invalid("connection.partitions", "partition names cannot be empty"));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::invalid(
                    "connection.partitions",
                    format!("duplicate partition '{name}'"),
                ));
            }
        }
        if self.open_timeout_ms == 0 {
            return Err(ConfigError::invalid("connection.open_timeout_ms", "must be positive"));
        }
        if self.max_open_attempts == 0 {
            return Err(ConfigError::invalid("connection.max_open_attempts", "must be at least 1"));
        }
        Ok(self)
    }
}

/// Compaction rules for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionPolicy {
    /// Ceiling on the encoded size of a single record.
    pub max_bytes: usize,
    /// Arrays longer than this always keep only their most recent elements.
    pub retain_last: Option<usize>,
    /// Elements kept when an array record is over `max_bytes`.
    pub overflow_retain_last: usize,
    /// Replace embedded blobs in retained elements when over `max_bytes`.
    pub strip_blobs: bool,
    /// Strings starting with this prefix are treated as embedded blobs.
    pub blob_prefix: String,
    /// Replacement for a stripped blob.
    pub blob_placeholder: String,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 8 * 1024 * 1024,
            retain_last: None,
            overflow_retain_last: 300,
            strip_blobs: true,
            blob_prefix: "data:".to_string(),
            blob_placeholder: "[blob removed]".to_string(),
        }
    }
}

impl CompactionPolicy {
    const MIN_MAX_BYTES: usize = 64;

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_bytes < Self::MIN_MAX_BYTES {
            return Err(ConfigError::invalid(
                "guard.max_bytes",
                format!("must be at least {} bytes (got {})", Self::MIN_MAX_BYTES, self.max_bytes),
            ));
        }
        if self.overflow_retain_last == 0 {
            return Err(ConfigError::invalid("guard.overflow_retain_last", "must be at least 1"));
        }
        if self.retain_last == Some(0) {
            return Err(ConfigError::invalid("guard.retain_last", "must be at least 1 when set"));
        }
        if self.strip_blobs && self.blob_prefix.is_empty() {
            return Err(ConfigError::invalid("guard.blob_prefix", "cannot be empty when strip_blobs is set"));
        }
        Ok(self)
    }
}

/// Serialization guard settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Nodes nested deeper than this are omitted.
    pub max_depth: usize,
    /// Policy for partitions without an override.
    pub default_policy: CompactionPolicy,
    /// Per-partition overrides.
    pub partitions: HashMap<String, CompactionPolicy>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_depth: 128,
            default_policy: CompactionPolicy::default(),
            partitions: HashMap::new(),
        }
    }
}

impl GuardConfig {
    pub fn policy_for(&self, partition: &str) -> &CompactionPolicy {
        self.partitions.get(partition).unwrap_or(&self.default_policy)
    }

    /// Adds or replaces the policy for one partition.
    #[must_use]
    pub fn with_policy(mut self, partition: impl Into<String>, policy: CompactionPolicy) -> Self {
        self.partitions.insert(partition.into(), policy);
        self
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::invalid("guard.max_depth", "must be at least 1"));
        }
        let default_policy = self.default_policy.validate()?;
        let partitions = self
            .partitions
            .into_iter()
            .map(|(name, policy)| policy.validate().map(|p| (name, p)))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            max_depth: self.max_depth,
            default_policy,
            partitions,
        })
    }
}

/// Legacy migration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Partition holding the migration marker.
    pub marker_partition: String,
    /// Reserved key of the migration marker.
    pub marker_key: String,
    /// Current migration version.
    pub version: String,
    /// Copy legacy values into the primary store when read through the tiered store.
    pub promote_legacy_reads: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            marker_partition: "settings".to_string(),
            marker_key: "__migration_version".to_string(),
            version: "1.0".to_string(),
            promote_legacy_reads: true,
        }
    }
}

impl MigrationConfig {
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.marker_key.is_empty() {
            return Err(ConfigError::invalid("migration.marker_key", "cannot be empty"));
        }
        if self.version.is_empty() {
            return Err(ConfigError::invalid("migration.version", "cannot be empty"));
        }
        Ok(self)
    }
}
