//! # kyrokv - embedded partitioned key-value storage
//!
//! kyrokv is the client-side storage layer of an application: a fixed set of
//! named partitions, each a flat `key → value` map, kept on an asynchronous
//! physical store.
//!
//! ## Core Concepts
//!
//! - **ConnectionManager**: lazily opens the single physical connection,
//!   coalesces concurrent opens, retries transient failures, reopens after an
//!   upgrade elsewhere
//! - **SerializationGuard**: turns arbitrary value graphs into storable
//!   [`Value`] trees (cycles, host objects and callables omitted, oversized
//!   arrays compacted)
//! - **KeyValueStore**: `get` / `set` / `delete` / `clear` / `list_keys` /
//!   `batch_set` with a write-through cache
//! - **CacheAsideReader**: non-blocking reads from the cache for synchronous
//!   callers
//! - **MigrationRunner** and **TieredStore**: one-time import of the legacy
//!   flat area, and read fallback to it
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use kyrokv::storage::MemoryBackend;
//! use kyrokv::{Node, StorageService, Value};
//!
//! # async fn run() -> Result<(), kyrokv::KvError> {
//! let service = StorageService::builder(Arc::new(MemoryBackend::new()))
//!     .start()
//!     .await?;
//! let store = service.store();
//!
//! store.set("settings", "theme", "dark").await?;
//! assert_eq!(store.get("settings", "theme").await?, Some(Value::from("dark")));
//!
//! // A self-referencing object is stored without the cycle.
//! let note = Node::object([("title", Node::from("n1"))]);
//! if let Some(fields) = note.object_handle() {
//!     fields.write().insert("me".to_string(), note.clone());
//! }
//! store.set("settings", "note", note).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Values and configuration
pub mod config;
pub mod error;
pub mod node;
pub mod value;

// Physical store and connection lifecycle
pub mod connection;
pub mod storage;

// Write path and reads
pub mod cache;
pub mod guard;
pub mod reader;
pub mod store;

// Legacy area
pub mod legacy;
pub mod migration;
pub mod tiered;

pub mod diagnostics;
pub mod service;

// Re-export primary types at crate root for convenience
pub use cache::{CacheEntry, CacheTable};
pub use config::{
    CompactionPolicy, ConnectionConfig, GuardConfig, MigrationConfig, StorageConfig, DEFAULT_PARTITIONS,
};
pub use connection::{ConnectionManager, ConnectionState, LifecycleEvent};
pub use diagnostics::{format_size, UsageReport};
pub use error::{ConfigError, ConnectionError, KvError, KvResult, MigrationError, SerializationError, StoreError};
pub use guard::{Compaction, CompactionReason, Sanitized, SerializationGuard};
pub use legacy::{LegacyLayout, LegacySource};
pub use migration::{MigrationResult, MigrationRunner, MigrationStatus};
pub use node::Node;
pub use reader::CacheAsideReader;
pub use service::{StorageService, StorageServiceBuilder};
pub use store::{BatchReport, KeyValueStore, Page, RecordSource, StoreEvent, WriteReport};
pub use tiered::TieredStore;
pub use value::Value;
