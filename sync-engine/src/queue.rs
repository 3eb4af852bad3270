use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::operation::{sort_for_replay, QueueKind, QueuedOperation};
use crate::storage::{Storage, StoreKind, WriteBatch};
use crate::store::{Record, RecordStore};

/// One of the five operation queues.
///
/// Operations leave a queue only through the engine, which resolves their
/// dependency node in the same write.
#[derive(Clone)]
pub struct MutationQueue {
    records: RecordStore<QueuedOperation>,
}

impl MutationQueue {
    pub fn new(storage: Arc<dyn Storage>, kind: QueueKind) -> Self {
        Self { records: RecordStore::new(storage, kind.store()) }
    }

    pub fn get(&self, id: &str) -> Result<Option<QueuedOperation>> {
        self.records.get(id)
    }

    pub fn put(&self, op: &QueuedOperation) -> Result<()> {
        self.records.put(op)
    }

    /// Every operation in the queue, in replay order.
    pub fn list_all(&self) -> Result<Vec<QueuedOperation>> {
        let mut ops = self.records.list_all()?;
        sort_for_replay(&mut ops);
        Ok(ops)
    }

    pub fn list_scope(&self, scope: &str, view: Option<&str>) -> Result<Vec<QueuedOperation>> {
        let mut ops: Vec<_> = self
            .records
            .list_all()?
            .into_iter()
            .filter(|op| op.matches_scope(scope, view))
            .collect();
        sort_for_replay(&mut ops);
        Ok(ops)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.records.list_all()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub(crate) fn stage_put(&self, batch: &mut WriteBatch, op: &QueuedOperation) -> Result<()> {
        self.records.stage_put(batch, op)
    }

    pub(crate) fn stage_delete(&self, batch: &mut WriteBatch, id: &str) {
        self.records.stage_delete(batch, id)
    }
}

/// Last known-good materialized board view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSnapshot {
    pub id: String,
    pub board_id: String,
    pub view: String,
    pub items: Vec<Value>,
    pub updated_at: u64,
}

impl BoardSnapshot {
    pub fn key(board_id: &str, view: &str) -> String {
        format!("{}::{}", board_id, view)
    }
}

impl Record for BoardSnapshot {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Clone)]
pub struct SnapshotCache {
    records: RecordStore<BoardSnapshot>,
}

impl SnapshotCache {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { records: RecordStore::new(storage, StoreKind::BoardSnapshots) }
    }

    pub fn save(&self, board_id: &str, view: &str, items: Vec<Value>, updated_at: u64) -> Result<BoardSnapshot> {
        let snapshot = BoardSnapshot {
            id: BoardSnapshot::key(board_id, view),
            board_id: board_id.to_string(),
            view: view.to_string(),
            items,
            updated_at,
        };
        self.records.put(&snapshot)?;
        Ok(snapshot)
    }

    pub fn get(&self, board_id: &str, view: &str) -> Result<Option<BoardSnapshot>> {
        self.records.get(&BoardSnapshot::key(board_id, view))
    }

    pub fn delete(&self, board_id: &str, view: &str) -> Result<()> {
        self.records.delete(&BoardSnapshot::key(board_id, view))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Payload;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    #[test]
    fn test_list_scope_filters_and_orders() {
        let queue = MutationQueue::new(Arc::new(MemoryStorage::new()), QueueKind::Board);
        for (ts, board, view) in [(3, "b1", "kanban"), (1, "b1", "kanban"), (2, "b2", "kanban"), (4, "b1", "table")] {
            let op = QueuedOperation::new(QueueKind::Board, board, Some(view), "i", Payload::Delete, ts);
            queue.put(&op).unwrap();
        }

        let stamps: Vec<u64> = queue.list_scope("b1", Some("kanban")).unwrap().iter().map(|o| o.timestamp).collect();
        assert_eq!(stamps, vec![1, 3]);
        assert_eq!(queue.list_scope("b1", None).unwrap().len(), 3);
        assert_eq!(queue.len().unwrap(), 4);
    }

    #[test]
    fn test_snapshots_keyed_by_board_and_view() {
        let cache = SnapshotCache::new(Arc::new(MemoryStorage::new()));
        cache.save("b1", "kanban", vec![json!({ "id": "i1" })], 100).unwrap();
        cache.save("b1", "calendar", vec![], 200).unwrap();

        let kanban = cache.get("b1", "kanban").unwrap().unwrap();
        assert_eq!(kanban.id, "b1::kanban");
        assert_eq!(kanban.items.len(), 1);
        assert_eq!(cache.get("b1", "calendar").unwrap().unwrap().updated_at, 200);
        assert!(cache.get("b2", "kanban").unwrap().is_none());

        cache.save("b1", "kanban", vec![], 300).unwrap();
        assert!(cache.get("b1", "kanban").unwrap().unwrap().items.is_empty());

        cache.delete("b1", "kanban").unwrap();
        assert!(cache.get("b1", "kanban").unwrap().is_none());
    }
}
