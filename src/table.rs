//! The authoritative pod-to-address mapping.
//!
//! [`TableWriter`] is the only handle that mutates; it is not `Clone` and is
//! owned by the reconciler. Any number of [`AddressTable`] readers may exist.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::subscriber::PodKey;

type Entries = HashMap<PodKey, Option<String>>;

/// Shared read handle. Every read takes the lock once, so it sees either the
/// state before or after a mutation, never in between.
#[derive(Debug, Clone, Default)]
pub struct AddressTable {
    entries: Arc<RwLock<Entries>>,
}

impl AddressTable {
    /// Returns the address of `key`: `None` if unobserved, `Some(None)` if unresolved.
    pub fn get(&self, key: &PodKey) -> Option<Option<String>> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &PodKey) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn namespace_len(&self, namespace: &str) -> usize {
        self.entries
            .read()
            .keys()
            .filter(|key| key.namespace == namespace)
            .count()
    }

    /// Copies the whole table at one instant.
    pub fn snapshot(&self) -> HashMap<PodKey, Option<String>> {
        self.entries.read().clone()
    }
}

/// Exclusive write handle.
#[derive(Debug)]
pub struct TableWriter {
    entries: Arc<RwLock<Entries>>,
}

impl TableWriter {
    pub fn new() -> (Self, AddressTable) {
        let reader = AddressTable::default();
        let writer = Self {
            entries: Arc::clone(&reader.entries),
        };
        (writer, reader)
    }

    /// Inserts `key`, replacing its address only if `address` is resolved.
    pub fn upsert(&mut self, key: PodKey, address: Option<String>) {
        let mut entries = self.entries.write();
        let slot = entries.entry(key).or_default();
        if address.is_some() {
            *slot = address;
        }
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&mut self, key: &PodKey) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Removes every entry in `namespace`, returning how many were dropped.
    pub fn purge_namespace(&mut self, namespace: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| key.namespace != namespace);
        before - entries.len()
    }

    /// Makes `namespace` contain exactly `pods`, keeping addresses already
    /// resolved for pods that survive.
    pub fn replace_namespace(
        &mut self,
        namespace: &str,
        pods: impl IntoIterator<Item = (PodKey, Option<String>)>,
    ) {
        let mut fresh: Entries = pods
            .into_iter()
            .filter(|(key, _)| key.namespace == namespace)
            .collect();

        let mut entries = self.entries.write();
        entries.retain(|key, address| {
            if key.namespace != namespace {
                return true;
            }
            match fresh.get_mut(key) {
                Some(incoming) => {
                    if incoming.is_none() {
                        *incoming = address.take();
                    }
                    false
                }
                None => false,
            }
        });
        entries.extend(fresh);
    }
}
