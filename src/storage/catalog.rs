//! Partition tables shared by the backends.
//!
//! A `Catalog` is the full logical content of a store: its schema version and
//! every partition's records. The memory backend keeps one behind a lock; the
//! persistent backend keeps one as its in-memory index and snapshots it into
//! segments.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::value::Value;

use super::traits::Mutation;

/// Bytes a record occupies: key plus encoded value.
pub(crate) fn record_size(key: &str, value: &Value) -> u64 {
    (key.len() + value.encoded_len()) as u64
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub version: u32,
    pub partitions: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(skip)]
    used_bytes: u64,
}

/// Undo information for an applied transaction.
#[derive(Debug)]
pub(crate) struct Applied {
    partition: String,
    undo: Vec<Undo>,
    pub added: u64,
    pub removed: u64,
}

#[derive(Debug)]
enum Undo {
    Restore { key: String, previous: Option<Value> },
    Table(BTreeMap<String, Value>),
}

impl Catalog {
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn has_partition(&self, partition: &str) -> bool {
        self.partitions.contains_key(partition)
    }

    /// Raises the version and creates missing partitions. Returns the created
    /// partition names.
    pub fn upgrade(&mut self, version: u32, partitions: &[String]) -> Vec<String> {
        self.version = self.version.max(version);
        let mut created = Vec::new();
        for name in partitions {
            if !self.partitions.contains_key(name) {
                self.partitions.insert(name.clone(), BTreeMap::new());
                created.push(name.clone());
            }
        }
        created
    }

    /// Recomputes the byte counter after a bulk load.
    pub fn recount(&mut self) {
        self.used_bytes = self
            .partitions
            .values()
            .flat_map(|t| t.iter())
            .map(|(k, v)| record_size(k, v))
            .sum();
    }

    fn table(&self, partition: &str) -> Result<&BTreeMap<String, Value>, StoreError> {
        self.partitions
            .get(partition)
            .ok_or_else(|| StoreError::not_found(partition))
    }

    pub fn get(&self, partition: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.table(partition)?.get(key).cloned())
    }

    pub fn keys(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.table(partition)?.keys().cloned().collect())
    }

    pub fn entries(&self, partition: &str) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self
            .table(partition)?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Applies a transaction. Fails only if the partition does not exist, in
    /// which case nothing is changed.
    pub(crate) fn apply(&mut self, partition: &str, mutations: &[Mutation]) -> Result<Applied, StoreError> {
        let table = self
            .partitions
            .get_mut(partition)
            .ok_or_else(|| StoreError::not_found(partition))?;

        let mut undo = Vec::with_capacity(mutations.len());
        let mut added = 0u64;
        let mut removed = 0u64;

        for mutation in mutations {
            match mutation {
                Mutation::Put { key, value } => {
                    added += record_size(key, value);
                    let previous = table.insert(key.clone(), value.clone());
                    if let Some(prev) = &previous {
                        removed += record_size(key, prev);
                    }
                    undo.push(Undo::Restore {
                        key: key.clone(),
                        previous,
                    });
                }
                Mutation::Delete { key } => {
                    if let Some(prev) = table.remove(key) {
                        removed += record_size(key, &prev);
                        undo.push(Undo::Restore {
                            key: key.clone(),
                            previous: Some(prev),
                        });
                    }
                }
                Mutation::Clear => {
                    let old = std::mem::take(table);
                    removed += old.iter().map(|(k, v)| record_size(k, v)).sum::<u64>();
                    undo.push(Undo::Table(old));
                }
            }
        }

        self.used_bytes = (self.used_bytes + added).saturating_sub(removed);
        Ok(Applied {
            partition: partition.to_string(),
            undo,
            added,
            removed,
        })
    }

    /// Rolls back a transaction returned by [`Catalog::apply`].
    pub(crate) fn revert(&mut self, applied: Applied) {
        if let Some(table) = self.partitions.get_mut(&applied.partition) {
            for step in applied.undo.into_iter().rev() {
                match step {
                    Undo::Restore {
                        key,
                        previous: Some(value),
                    } => {
                        table.insert(key, value);
                    }
                    Undo::Restore { key, previous: None } => {
                        table.remove(&key);
                    }
                    Undo::Table(old) => *table = old,
                }
            }
        }
        self.used_bytes = (self.used_bytes + applied.removed).saturating_sub(applied.added);
    }
}
