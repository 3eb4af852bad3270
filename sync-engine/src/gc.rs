use tracing::warn;

use crate::engine::OfflineEngine;
use crate::error::Result;
use crate::operation::{OperationStatus, QueueKind};
use crate::storage::{now_millis, WriteBatch};

impl OfflineEngine {
    /// Promotes dependencies that can never resolve on their own: unresolved
    /// graph nodes older than the configured grace period whose operation no
    /// longer exists in any queue.
    pub fn sweep_orphans(&self) -> Result<usize> {
        self.sweep_orphans_at(now_millis())
    }

    pub fn sweep_orphans_at(&self, now: u64) -> Result<usize> {
        let grace = self.config.orphan_grace_millis;
        let mut promoted = 0;
        for record in self.graph.list_all()? {
            if record.resolved || now.saturating_sub(record.created_at) < grace {
                continue;
            }
            if self.find_operation(&record.id)?.is_some() {
                continue;
            }
            warn!(op_id = %record.id, dependents = ?record.dependents, "promoting orphaned dependency");
            self.graph.mark_resolved(&record.id)?;
            promoted += 1;
        }
        Ok(promoted)
    }

    /// Drops synced tombstones from a queue.
    pub fn purge_synced(&self, kind: QueueKind) -> Result<usize> {
        let mut purged = 0;
        for op in self.queue(kind).list_all()? {
            if matches!(op.status, OperationStatus::Synced) {
                self.remove_operation(&op, WriteBatch::new())?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}
