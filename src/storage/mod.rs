//! Physical store backends.
//!
//! [`StorageBackend`] and [`PhysicalConnection`] define the object-store
//! primitive everything else is built on. Two implementations ship:
//! [`MemoryBackend`] and, behind the `persistent` feature,
//! [`persistent::PersistentBackend`].

mod catalog;
mod memory;
mod registry;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use catalog::Catalog;
pub use memory::{Fault, MemoryBackend, MemoryStats};
pub use traits::{ConnectRequest, ConnectionEvent, Mutation, PhysicalConnection, StorageBackend};
