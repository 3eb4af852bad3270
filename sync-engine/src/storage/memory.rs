use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Backend, Storage, StoreKind, Write, WriteBatch};
use crate::error::Result;

type Tables = HashMap<StoreKind, BTreeMap<String, Vec<u8>>>;

/// In-process fallback backend. Values are held as encoded bytes, so callers
/// only ever see copies, same as with a persistent backend.
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self { tables: Mutex::new(HashMap::new()) }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, store: StoreKind, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tables().get(&store).and_then(|t| t.get(id)).cloned())
    }

    fn put(&self, store: StoreKind, id: &str, value: &[u8]) -> Result<()> {
        self.tables().entry(store).or_default().insert(id.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, store: StoreKind, id: &str) -> Result<()> {
        if let Some(table) = self.tables().get_mut(&store) {
            table.remove(id);
        }
        Ok(())
    }

    fn list(&self, store: StoreKind) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self.tables()
            .get(&store)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn clear(&self, store: StoreKind) -> Result<()> {
        self.tables().remove(&store);
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self.tables();
        for write in batch.writes {
            match write {
                Write::Put { store, id, value } => {
                    tables.entry(store).or_default().insert(id, value);
                }
                Write::Delete { store, id } => {
                    if let Some(table) = tables.get_mut(&store) {
                        table.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }

    fn backend(&self) -> Backend {
        Backend::Ephemeral
    }
}
