//! Abstract physical store contract.
//!
//! A backend hands out connection handles; a handle exposes partitioned reads
//! and atomic per-partition commits. By keeping this behind traits we get:
//! - an in-process backend for embedding and tests
//! - a durable on-disk backend for production

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{ConnectionError, StoreError};
use crate::value::Value;

/// Parameters of a connect call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub database: String,
    /// Requested schema version. Higher than stored triggers an upgrade.
    pub version: u32,
    /// Partitions that must exist after the connect succeeds.
    pub partitions: Vec<String>,
}

/// Signals delivered to a live handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Another connect wants to upgrade the store; this handle should close.
    VersionChange {
        old_version: u32,
        new_version: u32,
    },
}

/// One staged change inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Put { key: String, value: Value },
    Delete { key: String },
    Clear,
}

impl Mutation {
    pub fn put(key: impl Into<String>, value: Value) -> Self {
        Self::Put {
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// Source of physical connections.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Opens (and if needed upgrades) the store.
    ///
    /// # Errors
    /// - `Blocked` when older handles are still open during an upgrade
    /// - `VersionConflict` when the stored version is newer than requested
    /// - `Denied` when the store cannot be accessed at all
    async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<Arc<dyn PhysicalConnection>, ConnectionError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// A live handle onto the physical store.
///
/// A commit is durable once it returns `Ok`. Dropping the last reference to a
/// handle closes it.
#[async_trait]
pub trait PhysicalConnection: Send + Sync + std::fmt::Debug {
    /// Unique id of this handle within its backend.
    fn id(&self) -> u64;

    /// Schema version this handle was opened at.
    fn version(&self) -> u32;

    fn is_open(&self) -> bool;

    /// Names of all partitions, sorted.
    fn partitions(&self) -> Vec<String>;

    /// Subscribes to signals addressed to this handle.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    async fn get(&self, partition: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// All keys of a partition, sorted.
    async fn keys(&self, partition: &str) -> Result<Vec<String>, StoreError>;

    /// All records of a partition, sorted by key.
    async fn entries(&self, partition: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Applies `mutations` to one partition as a single all-or-nothing transaction.
    async fn commit(&self, partition: &str, mutations: Vec<Mutation>) -> Result<(), StoreError>;

    /// Closes the handle. Operations on a closed handle fail with
    /// `TransactionAborted`.
    fn close(&self);
}
