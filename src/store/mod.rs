// Entry storage: the data model and the transactional store interface

pub mod mem;
pub mod sql;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::config::{StoreConfig, StoreKind};
use crate::dn::{Dn, Prefix};

/// Attribute map with lowercase keys. Values keep their insertion order.
///
/// Serialises as a plain JSON object of string arrays, which is the column
/// format of the relational backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, Vec<String>>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values of `key` (case-insensitive); empty when absent.
    pub fn get(&self, key: &str) -> &[String] {
        self.0
            .get(&key.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_lowercase())
    }

    /// Replace the values of `key`. An empty list removes the attribute.
    pub fn set(&mut self, key: &str, values: Vec<String>) {
        let key = key.to_lowercase();
        if values.is_empty() {
            self.0.remove(&key);
        } else {
            self.0.insert(key, values);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.0.remove(&key.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>> FromIterator<(K, Vec<String>)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (K, Vec<String>)>>(iter: T) -> Self {
        let mut attrs = Attributes::new();
        for (key, values) in iter {
            attrs.set(key.as_ref(), values);
        }
        attrs
    }
}

/// A directory entry. The leaf component of the DN is always mirrored into the attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub dn: Dn,
    pub attributes: Attributes,
}

impl Entry {
    pub fn new(dn: Dn, mut attributes: Attributes) -> Self {
        if let Some(leaf) = dn.leaf() {
            attributes.set(&leaf.typ, vec![leaf.value.clone()]);
        }
        Self { dn, attributes }
    }

    pub fn get(&self, key: &str) -> &[String] {
        self.attributes.get(key)
    }
}

/// Read side of the store.
#[async_trait]
pub trait Store: Send + Sync {
    /// All entries at or below `prefix`; with `exact` only the entry at `prefix` itself.
    async fn list(&self, prefix: &Prefix, exact: bool) -> Result<Vec<Entry>>;

    /// Start a write transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// A write transaction. Reads through the transaction see its own pending writes.
/// Dropping a transaction without committing discards it.
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, dn: &Dn) -> Result<Option<Entry>>;

    async fn list(&mut self, prefix: &Prefix, exact: bool) -> Result<Vec<Entry>>;

    /// Insert or replace an entry.
    async fn store(&mut self, entry: Entry) -> Result<()>;

    async fn delete(&mut self, dn: &Dn) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Open the backend selected in the configuration.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config.kind {
        StoreKind::Mem => {
            info!("Using in-memory entry store");
            Ok(Arc::new(mem::MemStore::new()))
        }
        StoreKind::Sql => {
            let store = sql::SqlStore::connect(config).await?;
            info!("Using SQL entry store");
            Ok(Arc::new(store))
        }
    }
}
