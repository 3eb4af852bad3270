use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::storage::{Storage, StoreKind, WriteBatch};

/// A value persisted under its own opaque id.
pub trait Record: Serialize + DeserializeOwned {
    fn id(&self) -> &str;
}

/// Typed view of one logical store.
pub struct RecordStore<T> {
    storage: Arc<dyn Storage>,
    kind: StoreKind,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for RecordStore<T> {
    fn clone(&self) -> Self {
        Self { storage: Arc::clone(&self.storage), kind: self.kind, _record: PhantomData }
    }
}

impl<T: Record> RecordStore<T> {
    pub fn new(storage: Arc<dyn Storage>, kind: StoreKind) -> Self {
        Self { storage, kind, _record: PhantomData }
    }

    pub fn put(&self, record: &T) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        tracing::trace!(store = %self.kind, id = record.id(), "put");
        self.storage.put(self.kind, record.id(), &bytes)
    }

    pub fn get(&self, id: &str) -> Result<Option<T>> {
        match self.storage.get(self.kind, id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_all(&self) -> Result<Vec<T>> {
        self.storage
            .list(self.kind)?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(crate::Error::from))
            .collect()
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        tracing::trace!(store = %self.kind, id, "delete");
        self.storage.delete(self.kind, id)
    }

    /// Stages a put into `batch` instead of writing immediately.
    pub fn stage_put(&self, batch: &mut WriteBatch, record: &T) -> Result<()> {
        batch.put(self.kind, record.id(), serde_json::to_vec(record)?);
        Ok(())
    }

    pub fn stage_delete(&self, batch: &mut WriteBatch, id: &str) {
        batch.delete(self.kind, id);
    }

    pub fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.storage.write_batch(batch)
    }
}
