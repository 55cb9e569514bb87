// In-memory entry store
//
// Entries live in an ordered map keyed by their Prefix string. A subtree is the
// key range [prefix, prefix + U+10FFFF), narrowed to real descendants
// component by component. One write transaction is open at a time; its changes
// are buffered and applied under the write lock on commit.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use super::{Entry, Store, Transaction};
use crate::dn::{Dn, Prefix};

type EntryMap = BTreeMap<String, Entry>;

#[derive(Default)]
pub struct MemStore {
    entries: Arc<RwLock<EntryMap>>,
    writer: Arc<Mutex<()>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn range_end(key: &str) -> String {
    format!("{}{}", key, char::MAX)
}

fn in_scope(prefix: &Prefix, key: &str, entry: &Entry, exact: bool) -> bool {
    if exact {
        entry.dn.prefix().to_string() == key
    } else {
        prefix.is_prefix_of(&entry.dn.prefix())
    }
}

fn scan(entries: &EntryMap, prefix: &Prefix, exact: bool) -> Vec<Entry> {
    let key = prefix.to_string();
    if exact {
        return entries.get(&key).cloned().into_iter().collect();
    }
    if prefix.level() == 0 {
        return entries.values().cloned().collect();
    }
    entries
        .range(key.clone()..range_end(&key))
        .filter(|(_, entry)| prefix.is_prefix_of(&entry.dn.prefix()))
        .map(|(_, entry)| entry.clone())
        .collect()
}

#[async_trait]
impl Store for MemStore {
    async fn list(&self, prefix: &Prefix, exact: bool) -> Result<Vec<Entry>> {
        let entries = self.entries.read().await;
        Ok(scan(&entries, prefix, exact))
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let gate = self.writer.clone().lock_owned().await;
        Ok(Box::new(MemTransaction {
            entries: self.entries.clone(),
            changes: BTreeMap::new(),
            _gate: gate,
        }))
    }
}

pub struct MemTransaction {
    entries: Arc<RwLock<EntryMap>>,
    // pending writes by key; None marks a deletion
    changes: BTreeMap<String, Option<Entry>>,
    _gate: OwnedMutexGuard<()>,
}

#[async_trait]
impl Transaction for MemTransaction {
    async fn get(&mut self, dn: &Dn) -> Result<Option<Entry>> {
        let key = dn.prefix().to_string();
        if let Some(change) = self.changes.get(&key) {
            return Ok(change.clone());
        }
        let entries = self.entries.read().await;
        Ok(entries.get(&key).cloned())
    }

    async fn list(&mut self, prefix: &Prefix, exact: bool) -> Result<Vec<Entry>> {
        let key = prefix.to_string();
        let mut merged: EntryMap = {
            let entries = self.entries.read().await;
            scan(&entries, prefix, exact)
                .into_iter()
                .map(|entry| (entry.dn.prefix().to_string(), entry))
                .collect()
        };
        for (change_key, change) in &self.changes {
            match change {
                Some(entry) if in_scope(prefix, &key, entry, exact) => {
                    merged.insert(change_key.clone(), entry.clone());
                }
                Some(_) => {}
                None => {
                    merged.remove(change_key);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    async fn store(&mut self, entry: Entry) -> Result<()> {
        self.changes.insert(entry.dn.prefix().to_string(), Some(entry));
        Ok(())
    }

    async fn delete(&mut self, dn: &Dn) -> Result<()> {
        self.changes.insert(dn.prefix().to_string(), None);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemTransaction {
            entries, changes, ..
        } = *self;
        let mut entries = entries.write().await;
        debug!("Committing {} change(s) to memory store", changes.len());
        for (key, change) in changes {
            match change {
                Some(entry) => {
                    entries.insert(key, entry);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}
