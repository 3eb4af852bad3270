//! Prerequisite tracking between queued operations.
//!
//! Records are created lazily and never deleted; a finished operation is
//! tombstoned with `resolved = true` so the reverse index stays stable after
//! its queue entry is gone.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::{now_millis, Storage, StoreKind, WriteBatch};
use crate::store::{Record, RecordStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRecord {
    pub id: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub dependents: Vec<String>,
    pub resolved: bool,
    #[serde(default)]
    pub created_at: u64,
}

impl DependencyRecord {
    fn placeholder(id: &str, resolved: bool) -> Self {
        Self {
            id: id.to_string(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            resolved,
            created_at: now_millis(),
        }
    }
}

impl Record for DependencyRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Shared by every queue. Read-modify-write cycles run under one lock so
/// concurrent registrations and resolutions never lose updates.
#[derive(Clone)]
pub struct DependencyGraph {
    records: RecordStore<DependencyRecord>,
    lock: Arc<Mutex<()>>,
}

impl DependencyGraph {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            records: RecordStore::new(storage, StoreKind::DependencyGraph),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Result<Option<DependencyRecord>> {
        self.records.get(id)
    }

    pub fn list_all(&self) -> Result<Vec<DependencyRecord>> {
        self.records.list_all()
    }

    pub fn register_dependencies(&self, op_id: &str, deps: &[String]) -> Result<()> {
        let _guard = self.guard();
        let mut batch = WriteBatch::new();

        let mut record = self
            .records
            .get(op_id)?
            .unwrap_or_else(|| DependencyRecord::placeholder(op_id, false));
        for dep in deps {
            if !record.dependencies.contains(dep) {
                record.dependencies.push(dep.clone());
            }
        }
        self.records.stage_put(&mut batch, &record)?;

        for dep in deps {
            if dep == op_id {
                continue;
            }
            let mut parent = self
                .records
                .get(dep)?
                .unwrap_or_else(|| DependencyRecord::placeholder(dep, false));
            if !parent.dependents.iter().any(|d| d == op_id) {
                parent.dependents.push(op_id.to_string());
            }
            self.records.stage_put(&mut batch, &parent)?;
        }

        self.records.commit(batch)
    }

    pub fn mark_resolved(&self, op_id: &str) -> Result<()> {
        self.resolve_with(op_id, WriteBatch::new())
    }

    /// Resolves `op_id` in the same atomic write as `batch`. Deleting a
    /// queued operation goes through here so the two cannot diverge.
    pub fn resolve_with(&self, op_id: &str, mut batch: WriteBatch) -> Result<()> {
        let _guard = self.guard();
        let mut record = self
            .records
            .get(op_id)?
            .unwrap_or_else(|| DependencyRecord::placeholder(op_id, true));
        if !record.resolved {
            tracing::debug!(op_id, dependents = record.dependents.len(), "dependency resolved");
        }
        record.resolved = true;
        self.records.stage_put(&mut batch, &record)?;
        self.records.commit(batch)
    }

    /// Untracked ids count as resolved.
    pub fn are_dependencies_resolved(&self, ids: &[String]) -> Result<bool> {
        for id in ids {
            if let Some(record) = self.records.get(id)? {
                if !record.resolved {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    pub fn unresolved(&self, ids: &[String]) -> Result<Vec<String>> {
        let mut pending = Vec::new();
        for id in ids {
            if let Some(record) = self.records.get(id)? {
                if !record.resolved {
                    pending.push(id.clone());
                }
            }
        }
        Ok(pending)
    }
}
