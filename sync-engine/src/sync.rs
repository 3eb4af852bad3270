use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::clock::VectorClock;
use crate::engine::OfflineEngine;
use crate::error::{Error, Result, TransportError};
use crate::merge::{remote_clock, resolve, Resolution, ResolutionKind};
use crate::operation::{OperationStatus, Payload, QueueKind, QueuedOperation};
use crate::storage::{now_millis, WriteBatch};

/// What the remote made of one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Success { record: Option<Value> },
    Conflict { remote: Value, reason: Option<String> },
    Skipped,
}

/// The single boundary to the remote system. Called once per operation, one
/// call outstanding at a time; timeouts are the implementor's business.
pub trait Syncer {
    fn sync(&mut self, op: &QueuedOperation) -> std::result::Result<SyncOutcome, TransportError>;
}

impl<F> Syncer for F
where
    F: FnMut(&QueuedOperation) -> std::result::Result<SyncOutcome, TransportError>,
{
    fn sync(&mut self, op: &QueuedOperation) -> std::result::Result<SyncOutcome, TransportError> {
        self(op)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictEntry {
    pub operation: QueuedOperation,
    pub remote: Value,
    pub reason: Option<String>,
}

/// A record the caller must fold into its local view.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedRemote {
    pub op_id: String,
    pub queue: QueueKind,
    pub entity_id: String,
    pub resolution: ResolutionKind,
    pub record: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryEntry {
    pub op_id: String,
    pub attempt: u32,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessReport {
    pub processed: Vec<String>,
    pub conflicts: Vec<ConflictEntry>,
    pub applied_remote: Vec<AppliedRemote>,
    /// Held back by unresolved dependencies.
    pub skipped: Vec<String>,
    /// The syncer answered `Skipped`.
    pub deferred: Vec<String>,
    /// Not attempted because an earlier member of the same batch did not go
    /// through in this pass.
    pub held: Vec<String>,
    pub retrying: Vec<RetryEntry>,
    pub failed: Vec<RetryEntry>,
}

impl ProcessReport {
    pub fn is_halted(&self) -> bool {
        !self.conflicts.is_empty() || !self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    Discard,
    Retry,
}

impl OfflineEngine {
    pub fn process_board_mutation_queue(&self, board_id: &str, view: &str, syncer: &mut impl Syncer) -> Result<ProcessReport> {
        self.process_queue(QueueKind::Board, board_id, Some(view), syncer)
    }

    pub fn process_item_mutation_queue(&self, board_id: &str, syncer: &mut impl Syncer) -> Result<ProcessReport> {
        self.process_queue(QueueKind::Item, board_id, None, syncer)
    }

    pub fn process_doc_operation_queue(&self, doc_id: &str, syncer: &mut impl Syncer) -> Result<ProcessReport> {
        self.process_queue(QueueKind::Doc, doc_id, None, syncer)
    }

    pub fn process_comment_mutation_queue(&self, item_id: &str, syncer: &mut impl Syncer) -> Result<ProcessReport> {
        self.process_queue(QueueKind::Comment, item_id, None, syncer)
    }

    pub fn process_file_upload_queue(&self, owner_id: &str, syncer: &mut impl Syncer) -> Result<ProcessReport> {
        self.process_queue(QueueKind::FileUpload, owner_id, None, syncer)
    }

    /// Drains one queue scope in timestamp order. Halts at the first
    /// operation parked in `conflict` or `failed` so conflicts surface in
    /// arrival order.
    #[instrument(skip(self, syncer), fields(queue = %kind), err)]
    pub fn process_queue(
        &self,
        kind: QueueKind,
        scope: &str,
        view: Option<&str>,
        syncer: &mut impl Syncer,
    ) -> Result<ProcessReport> {
        self.sweep_orphans()?;

        let queue = self.queue(kind);
        let mut report = ProcessReport::default();
        // Batches whose earlier member did not go through this pass.
        let mut held_batches: HashSet<String> = HashSet::new();

        for mut op in queue.list_scope(scope, view)? {
            match &op.status {
                OperationStatus::Synced => continue,
                OperationStatus::Conflict { remote, reason } => {
                    debug!(op_id = %op.id, "queue halted on carried-over conflict");
                    report.conflicts.push(ConflictEntry {
                        remote: remote.clone(),
                        reason: reason.clone(),
                        operation: op.clone(),
                    });
                    break;
                }
                OperationStatus::Failed { error } => {
                    report.failed.push(RetryEntry {
                        op_id: op.id.clone(),
                        attempt: op.metadata.attempt,
                        error: error.clone(),
                    });
                    break;
                }
                OperationStatus::Pending | OperationStatus::Syncing => {}
            }

            if let Some(key) = op.batch_key() {
                if held_batches.contains(key) {
                    report.held.push(op.id.clone());
                    continue;
                }
            }

            let blocked = self.graph.unresolved(&op.metadata.dependencies)?;
            if !blocked.is_empty() {
                debug!(op_id = %op.id, ?blocked, "waiting on dependencies");
                if let Some(key) = op.batch_key() {
                    held_batches.insert(key.to_string());
                }
                report.skipped.push(op.id.clone());
                continue;
            }

            op.status = OperationStatus::Syncing;
            op.metadata.attempt += 1;
            op.metadata.last_attempt_at = Some(now_millis());
            queue.put(&op)?;

            match syncer.sync(&op) {
                Ok(SyncOutcome::Success { record }) => {
                    if let Some(clock) = record.as_ref().and_then(remote_clock) {
                        self.observe_clock(&clock)?;
                    }
                    self.remove_operation(&op, WriteBatch::new())?;
                    debug!(op_id = %op.id, attempt = op.metadata.attempt, "synced");
                    report.processed.push(op.id);
                }
                Ok(SyncOutcome::Conflict { remote, reason }) => {
                    let resolution = resolve(&op, &remote, &self.config.default_merge_field);
                    let resolved_as = resolution.kind();
                    match resolution {
                        Resolution::KeepLocal => {
                            self.remove_operation(&op, WriteBatch::new())?;
                            debug!(op_id = %op.id, "conflict resolved, local kept");
                            report.processed.push(op.id);
                        }
                        Resolution::UseRemote(record) | Resolution::Merge(record) => {
                            if let Some(clock) = remote_clock(&record) {
                                self.observe_clock(&clock)?;
                            }
                            self.remove_operation(&op, WriteBatch::new())?;
                            debug!(op_id = %op.id, resolution = ?resolved_as, "conflict resolved automatically");
                            report.applied_remote.push(AppliedRemote {
                                op_id: op.id.clone(),
                                queue: op.queue,
                                entity_id: op.entity_id.clone(),
                                resolution: resolved_as,
                                record,
                            });
                            report.processed.push(op.id);
                        }
                        Resolution::Manual => {
                            warn!(op_id = %op.id, ?reason, "conflict needs manual resolution");
                            op.status = OperationStatus::Conflict { remote: remote.clone(), reason: reason.clone() };
                            queue.put(&op)?;
                            report.conflicts.push(ConflictEntry { operation: op, remote, reason });
                            break;
                        }
                    }
                }
                Ok(SyncOutcome::Skipped) => {
                    op.status = OperationStatus::Pending;
                    queue.put(&op)?;
                    if let Some(key) = op.batch_key() {
                        held_batches.insert(key.to_string());
                    }
                    report.deferred.push(op.id);
                }
                Err(e) => {
                    let error = e.to_string();
                    warn!(op_id = %op.id, attempt = op.metadata.attempt, %error, "transport failure");
                    op.metadata.last_error = Some(error.clone());
                    let entry = RetryEntry { op_id: op.id.clone(), attempt: op.metadata.attempt, error: error.clone() };

                    let exhausted = self
                        .config
                        .max_attempts
                        .is_some_and(|max| op.metadata.attempt >= max);
                    if exhausted {
                        op.status = OperationStatus::Failed { error };
                        queue.put(&op)?;
                        report.failed.push(entry);
                        break;
                    }
                    op.status = OperationStatus::Pending;
                    queue.put(&op)?;
                    if let Some(key) = op.batch_key() {
                        held_batches.insert(key.to_string());
                    }
                    report.retrying.push(entry);
                }
            }
        }

        debug!(
            processed = report.processed.len(),
            conflicts = report.conflicts.len(),
            skipped = report.skipped.len(),
            held = report.held.len(),
            "drain finished"
        );
        Ok(report)
    }

    /// Settles an operation parked in `conflict` (or `failed`).
    ///
    /// `Discard` drops it, optionally recording `remote_replacement` in the
    /// document queue as a synced tombstone. `Retry` re-arms it with a fresh
    /// attempt counter, seeding the expected remote snapshot when given.
    #[instrument(skip(self, remote_replacement), err)]
    pub fn resolve_conflict(
        &self,
        op_id: &str,
        action: ConflictAction,
        remote_replacement: Option<Value>,
    ) -> Result<()> {
        let mut op = self
            .find_operation(op_id)?
            .ok_or_else(|| Error::NotFound { id: op_id.to_string() })?;
        if !matches!(op.status, OperationStatus::Conflict { .. } | OperationStatus::Failed { .. }) {
            return Err(Error::InvalidState(format!("operation {} is not awaiting resolution", op_id)));
        }

        match action {
            ConflictAction::Discard => {
                let mut extra = WriteBatch::new();
                if let Some(replacement) = remote_replacement {
                    let mut clock = op.metadata.vector_clock.clone();
                    if let Some(remote) = remote_clock(&replacement) {
                        self.observe_clock(&remote)?;
                        clock = VectorClock::merge([&clock, &remote]);
                    }
                    let mut tombstone = QueuedOperation::new(
                        QueueKind::Doc,
                        &op.scope,
                        None,
                        &op.entity_id,
                        Payload::RawOps { ops: vec![replacement] },
                        op.timestamp,
                    );
                    tombstone.status = OperationStatus::Synced;
                    tombstone.metadata.vector_clock = clock;
                    self.queue(QueueKind::Doc).stage_put(&mut extra, &tombstone)?;
                }
                self.remove_operation(&op, extra)?;
                debug!(op_id, "discarded");
            }
            ConflictAction::Retry => {
                op.status = OperationStatus::Pending;
                op.metadata.attempt = 0;
                op.metadata.last_error = None;
                op.metadata.expected_remote = remote_replacement;
                self.queue(op.queue).put(&op)?;
                debug!(op_id, "re-armed for retry");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::merge::{ConflictPolicy, MergeStrategy};
    use serde_json::json;
    use std::collections::HashMap;

    fn engine() -> OfflineEngine {
        OfflineEngine::open_in_memory(EngineConfig::default().with_node_id("nodeA")).unwrap()
    }

    fn ok() -> std::result::Result<SyncOutcome, TransportError> {
        Ok::<_, TransportError>(SyncOutcome::Success { record: None })
    }

    fn update(field: &str, value: Value) -> Payload {
        Payload::Update { field: field.into(), value }
    }

    #[test]
    fn test_drains_in_timestamp_order() {
        let engine = engine();
        let ids: Vec<String> = (0..3)
            .map(|i| engine.enqueue_item_mutation("b1", "i1", update("title", json!(i))).commit().unwrap().id)
            .collect();

        let mut seen = Vec::new();
        let report = engine
            .process_item_mutation_queue("b1", &mut |op: &QueuedOperation| {
                seen.push(op.id.clone());
                ok()
            })
            .unwrap();

        assert_eq!(seen, ids);
        assert_eq!(report.processed, ids);
        assert!(engine.queue(QueueKind::Item).is_empty().unwrap());
    }

    #[test]
    fn test_attempt_metadata_stamped_before_send() {
        let engine = engine();
        engine.enqueue_item_mutation("b1", "i1", Payload::Delete).commit().unwrap();

        engine
            .process_item_mutation_queue("b1", &mut |op: &QueuedOperation| {
                assert_eq!(op.status, OperationStatus::Syncing);
                assert_eq!(op.metadata.attempt, 1);
                assert!(op.metadata.last_attempt_at.is_some());
                ok()
            })
            .unwrap();
    }

    #[test]
    fn test_only_requested_scope_is_drained() {
        let engine = engine();
        engine.enqueue_board_mutation("b1", "kanban", "i1", Payload::Delete).commit().unwrap();
        let other_view = engine.enqueue_board_mutation("b1", "table", "i1", Payload::Delete).commit().unwrap();
        let other_board = engine.enqueue_board_mutation("b2", "kanban", "i1", Payload::Delete).commit().unwrap();

        let report = engine.process_board_mutation_queue("b1", "kanban", &mut |_: &QueuedOperation| ok()).unwrap();
        assert_eq!(report.processed.len(), 1);

        let left: Vec<_> = engine.list_queue(QueueKind::Board).unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(left, vec![other_view.id, other_board.id]);
    }

    // op1 lives in the item queue, op2 in the board queue and depends on it.
    #[test]
    fn test_dependency_gating_across_queues() {
        let engine = engine();
        let op1 = engine.enqueue_item_mutation("b1", "i1", Payload::Create { record: json!({ "id": "i1" }) }).commit().unwrap();
        let op2 = engine
            .enqueue_board_mutation("b1", "kanban", "i1", Payload::Move { from: json!("todo"), to: json!("doing") })
            .depends_on(&op1.id)
            .commit()
            .unwrap();

        let mut sent = Vec::new();
        let mut syncer = |op: &QueuedOperation| {
            sent.push(op.id.clone());
            ok()
        };

        let report = engine.process_board_mutation_queue("b1", "kanban", &mut syncer).unwrap();
        assert_eq!(report.skipped, vec![op2.id.clone()]);
        assert_eq!(engine.find_operation(&op2.id).unwrap().unwrap().status, OperationStatus::Pending);

        let report = engine.process_item_mutation_queue("b1", &mut syncer).unwrap();
        assert_eq!(report.processed, vec![op1.id.clone()]);
        assert!(engine.find_operation(&op1.id).unwrap().is_none());
        assert!(engine.graph().get(&op1.id).unwrap().unwrap().resolved);

        let report = engine.process_board_mutation_queue("b1", "kanban", &mut syncer).unwrap();
        assert_eq!(report.processed, vec![op2.id.clone()]);
        assert_eq!(sent, vec![op1.id, op2.id]);
    }

    #[test]
    fn test_dependency_resolved_earlier_in_same_pass() {
        let engine = engine();
        let op1 = engine.enqueue_item_mutation("b1", "i1", Payload::Create { record: json!({}) }).commit().unwrap();
        let op2 = engine.enqueue_item_mutation("b1", "i1", update("title", json!("x"))).depends_on(&op1.id).commit().unwrap();

        let report = engine.process_item_mutation_queue("b1", &mut |_: &QueuedOperation| ok()).unwrap();
        assert_eq!(report.processed, vec![op1.id, op2.id]);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn test_blocked_operation_never_reaches_syncer() {
        let engine = engine();
        let parent = engine.enqueue_item_mutation("b1", "i1", Payload::Create { record: json!({}) }).commit().unwrap();
        let child = engine.enqueue_item_mutation("b1", "i1", Payload::Delete).depends_on(&parent.id).commit().unwrap();

        let report = engine
            .process_item_mutation_queue("b1", &mut |op: &QueuedOperation| {
                assert_ne!(op.id, child.id, "dependent sent before its prerequisite");
                Ok::<_, TransportError>(SyncOutcome::Skipped)
            })
            .unwrap();
        assert_eq!(report.deferred, vec![parent.id]);
        assert_eq!(report.skipped, vec![child.id]);
    }

    #[test]
    fn test_manual_conflict_halts_drain() {
        let engine = engine();
        let ops: Vec<_> = (0..3)
            .map(|i| engine.enqueue_item_mutation("b1", "i1", update("title", json!(i))).commit().unwrap())
            .collect();

        let mut calls = 0;
        let report = engine
            .process_item_mutation_queue("b1", &mut |op: &QueuedOperation| {
                calls += 1;
                if op.id == ops[1].id {
                    // Concurrent with nodeA's clock.
                    Ok::<_, TransportError>(SyncOutcome::Conflict {
                        remote: json!({ "title": "theirs", "vectorClock": { "nodeB": 1 } }),
                        reason: Some("edited elsewhere".into()),
                    })
                } else {
                    ok()
                }
            })
            .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(report.processed, vec![ops[0].id.clone()]);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].operation.id, ops[1].id);
        assert_eq!(report.conflicts[0].reason.as_deref(), Some("edited elsewhere"));

        let parked = engine.find_operation(&ops[1].id).unwrap().unwrap();
        assert!(parked.status.is_conflict());
        assert!(engine.find_operation(&ops[2].id).unwrap().unwrap().status.is_pending());

        // Carried over: the next drain reports it again without calling the syncer.
        let report = engine
            .process_item_mutation_queue("b1", &mut |_: &QueuedOperation| -> std::result::Result<SyncOutcome, TransportError> {
                panic!("drain must not pass a pending conflict")
            })
            .unwrap();
        assert_eq!(report.conflicts.len(), 1);
        assert!(report.processed.is_empty());
    }

    #[test]
    fn test_numeric_sum_conflict_merges() {
        let engine = engine();
        let op1 = engine
            .enqueue_item_mutation("b1", "i1", update("value", json!(5)))
            .policy(ConflictPolicy::new(MergeStrategy::NumericSum).on_field("value"))
            .commit()
            .unwrap();

        let report = engine
            .process_item_mutation_queue("b1", &mut |_: &QueuedOperation| {
                Ok::<_, TransportError>(SyncOutcome::Conflict { remote: json!({ "value": 3 }), reason: None })
            })
            .unwrap();

        assert!(engine.find_operation(&op1.id).unwrap().is_none());
        assert_eq!(report.processed, vec![op1.id.clone()]);
        assert_eq!(report.applied_remote.len(), 1);
        assert_eq!(report.applied_remote[0].resolution, ResolutionKind::Merge);
        assert_eq!(report.applied_remote[0].record, json!({ "value": 8 }));
    }

    #[test]
    fn test_concurrent_lww_without_prefer_is_manual() {
        let engine = OfflineEngine::open_in_memory(EngineConfig::default().with_node_id("A")).unwrap();
        engine.enqueue_item_mutation("b1", "i1", Payload::Delete).commit().unwrap();
        let op = engine.enqueue_item_mutation("b1", "i1", update("title", json!("mine"))).commit().unwrap();
        assert_eq!(op.metadata.vector_clock, VectorClock::from([("A", 2)]));

        let report = engine
            .process_item_mutation_queue("b1", &mut |o: &QueuedOperation| {
                if o.id == op.id {
                    Ok::<_, TransportError>(SyncOutcome::Conflict { remote: json!({ "vectorClock": { "A": 1, "B": 1 } }), reason: None })
                } else {
                    ok()
                }
            })
            .unwrap();
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].operation.id, op.id);
    }

    #[test]
    fn test_use_remote_is_surfaced_and_clock_folded() {
        let engine = engine();
        let op = engine.enqueue_item_mutation("b1", "i1", update("title", json!("mine"))).commit().unwrap();
        let remote = json!({ "title": "theirs", "vectorClock": { "nodeA": 5, "nodeB": 2 } });

        let report = engine
            .process_item_mutation_queue("b1", &mut |_: &QueuedOperation| {
                Ok::<_, TransportError>(SyncOutcome::Conflict { remote: remote.clone(), reason: None })
            })
            .unwrap();

        assert_eq!(report.applied_remote[0].op_id, op.id);
        assert_eq!(report.applied_remote[0].resolution, ResolutionKind::UseRemote);
        assert_eq!(report.applied_remote[0].record, remote);
        assert_eq!(engine.clock(), VectorClock::from([("nodeA", 5), ("nodeB", 2)]));
    }

    #[test]
    fn test_success_record_clock_is_merged() {
        let engine = engine();
        engine.enqueue_item_mutation("b1", "i1", Payload::Delete).commit().unwrap();
        engine
            .process_item_mutation_queue("b1", &mut |_: &QueuedOperation| {
                Ok::<_, TransportError>(SyncOutcome::Success { record: Some(json!({ "vectorClock": { "server": 9 } })) })
            })
            .unwrap();
        assert_eq!(engine.clock(), VectorClock::from([("nodeA", 1), ("server", 9)]));
    }

    #[test]
    fn test_exhausted_remote_clock_fails_next_enqueue() {
        let engine = engine();
        engine.enqueue_item_mutation("b1", "i1", Payload::Delete).commit().unwrap();
        engine
            .process_item_mutation_queue("b1", &mut |_: &QueuedOperation| {
                Ok::<_, TransportError>(SyncOutcome::Success { record: Some(json!({ "vectorClock": { "nodeA": u64::MAX } })) })
            })
            .unwrap();
        assert_eq!(engine.clock().get("nodeA"), u64::MAX);

        let err = engine.enqueue_item_mutation("b1", "i2", Payload::Delete).commit().unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(engine.clock().get("nodeA"), u64::MAX);
        assert!(engine.list_queue(QueueKind::Item).unwrap().is_empty());
    }

    #[test]
    fn test_deferred_batch_member_holds_the_rest() {
        let engine = engine();
        let first = engine.enqueue_doc_operation("d1", vec![json!({ "insert": "a" })]).batch("k").commit().unwrap();
        let second = engine.enqueue_doc_operation("d1", vec![json!({ "insert": "b" })]).batch("k").commit().unwrap();

        let report = engine
            .process_doc_operation_queue("d1", &mut |op: &QueuedOperation| {
                if op.id == first.id { Ok::<_, TransportError>(SyncOutcome::Skipped) } else { ok() }
            })
            .unwrap();

        assert_eq!(report.deferred, vec![first.id]);
        assert_eq!(report.held, vec![second.id]);
        assert!(report.skipped.is_empty());
        assert!(!report.is_halted());
    }

    #[test]
    fn test_transport_failure_keeps_operation_pending() {
        let engine = engine();
        let op = engine.enqueue_comment_mutation("i1", "c1", Payload::Create { record: json!({ "body": "hi" }) }).commit().unwrap();

        let mut failing = |_: &QueuedOperation| -> std::result::Result<SyncOutcome, TransportError> {
            Err("connection reset".into())
        };
        let report = engine.process_comment_mutation_queue("i1", &mut failing).unwrap();
        let report2 = engine.process_comment_mutation_queue("i1", &mut failing).unwrap();

        assert_eq!(report.retrying[0].error, "connection reset");
        assert_eq!(report2.retrying[0].attempt, 2);
        let stored = engine.find_operation(&op.id).unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);
        assert_eq!(stored.metadata.attempt, 2);
        assert_eq!(stored.metadata.last_error.as_deref(), Some("connection reset"));
        assert_eq!(stored.metadata.vector_clock, op.metadata.vector_clock, "retry must not bump the clock");
    }

    #[test]
    fn test_transport_failure_does_not_stop_unrelated_operations() {
        let engine = engine();
        let first = engine.enqueue_item_mutation("b1", "i1", Payload::Delete).commit().unwrap();
        let second = engine.enqueue_item_mutation("b1", "i2", Payload::Delete).commit().unwrap();

        let report = engine
            .process_item_mutation_queue("b1", &mut |op: &QueuedOperation| {
                if op.id == first.id { Err("timeout".into()) } else { ok() }
            })
            .unwrap();
        assert_eq!(report.retrying.len(), 1);
        assert_eq!(report.processed, vec![second.id]);
    }

    #[test]
    fn test_max_attempts_parks_operation_as_failed() {
        let engine = OfflineEngine::open_in_memory(EngineConfig::default().with_max_attempts(2)).unwrap();
        let op = engine.enqueue_file_upload("i1", "f1", Payload::UploadParts { file_name: "a.png".into(), parts: vec![] }).commit().unwrap();
        let later = engine.enqueue_file_upload("i1", "f2", Payload::Delete).commit().unwrap();

        let mut failing = |o: &QueuedOperation| -> std::result::Result<SyncOutcome, TransportError> {
            if o.id == op.id { Err("503".into()) } else { Ok::<_, TransportError>(SyncOutcome::Success { record: None }) }
        };
        let first = engine.process_file_upload_queue("i1", &mut failing).unwrap();
        assert_eq!(first.retrying.len(), 1);
        assert_eq!(first.processed, vec![later.id.clone()]);

        let later2 = engine.enqueue_file_upload("i1", "f3", Payload::Delete).commit().unwrap();
        let second = engine.process_file_upload_queue("i1", &mut failing).unwrap();
        assert_eq!(second.failed.len(), 1);
        assert!(second.processed.is_empty(), "failed operation must halt the queue");
        assert!(matches!(engine.find_operation(&op.id).unwrap().unwrap().status, OperationStatus::Failed { .. }));

        engine.resolve_conflict(&op.id, ConflictAction::Retry, None).unwrap();
        let third = engine.process_file_upload_queue("i1", &mut |_: &QueuedOperation| ok()).unwrap();
        assert_eq!(third.processed, vec![op.id, later2.id]);
    }

    #[test]
    fn test_skipped_outcome_reverts_without_side_effects() {
        let engine = engine();
        let op = engine.enqueue_item_mutation("b1", "i1", Payload::Delete).commit().unwrap();
        let report = engine.process_item_mutation_queue("b1", &mut |_: &QueuedOperation| Ok::<_, TransportError>(SyncOutcome::Skipped)).unwrap();

        assert_eq!(report.deferred, vec![op.id.clone()]);
        let stored = engine.find_operation(&op.id).unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);
        assert!(!engine.graph().get(&op.id).unwrap().is_some_and(|r| r.resolved));
    }

    #[test]
    fn test_batch_held_after_member_fails() {
        let engine = engine();
        let a = engine.enqueue_doc_operation("d1", vec![json!({ "insert": "a" })]).batch("para").commit().unwrap();
        let solo = engine.enqueue_doc_operation("d1", vec![json!({ "insert": "x" })]).commit().unwrap();
        let b = engine.enqueue_doc_operation("d1", vec![json!({ "insert": "b" })]).batch("para").commit().unwrap();

        let report = engine
            .process_doc_operation_queue("d1", &mut |op: &QueuedOperation| {
                if op.id == a.id { Err("offline".into()) } else { ok() }
            })
            .unwrap();

        assert_eq!(report.processed, vec![solo.id]);
        assert_eq!(report.held, vec![b.id.clone()]);
        assert!(report.skipped.is_empty());
        assert_eq!(engine.batch("para").unwrap().len(), 2);
    }

    #[test]
    fn test_discard_with_replacement_writes_tombstone() {
        let engine = engine();
        let dependent_parent = engine.enqueue_item_mutation("b1", "i1", update("title", json!("mine"))).commit().unwrap();
        let child = engine.enqueue_item_mutation("b1", "i1", Payload::Delete).depends_on(&dependent_parent.id).commit().unwrap();

        let report = engine
            .process_item_mutation_queue("b1", &mut |_: &QueuedOperation| {
                Ok::<_, TransportError>(SyncOutcome::Conflict { remote: json!({ "vectorClock": { "other": 1 } }), reason: None })
            })
            .unwrap();
        assert_eq!(report.conflicts.len(), 1);

        let replacement = json!({ "title": "theirs" });
        engine.resolve_conflict(&dependent_parent.id, ConflictAction::Discard, Some(replacement.clone())).unwrap();

        assert!(engine.find_operation(&dependent_parent.id).unwrap().is_none());
        assert!(engine.graph().are_dependencies_resolved(&child.metadata.dependencies).unwrap());

        let docs = engine.list_queue(QueueKind::Doc).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].status, OperationStatus::Synced);
        assert_eq!(docs[0].payload, Payload::RawOps { ops: vec![replacement] });

        let mut sent_docs = 0;
        engine.process_doc_operation_queue("b1", &mut |_: &QueuedOperation| { sent_docs += 1; ok() }).unwrap();
        assert_eq!(sent_docs, 0, "synced tombstones are never replayed");
    }

    #[test]
    fn test_retry_resets_attempts_and_seeds_expected_remote() {
        let engine = engine();
        let op = engine.enqueue_item_mutation("b1", "i1", update("title", json!("mine"))).commit().unwrap();
        engine
            .process_item_mutation_queue("b1", &mut |_: &QueuedOperation| {
                Ok::<_, TransportError>(SyncOutcome::Conflict { remote: json!({ "vectorClock": { "other": 1 } }), reason: None })
            })
            .unwrap();

        let expected = json!({ "title": "theirs", "rev": 7 });
        engine.resolve_conflict(&op.id, ConflictAction::Retry, Some(expected.clone())).unwrap();

        let stored = engine.find_operation(&op.id).unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);
        assert_eq!(stored.metadata.attempt, 0);

        let mut seen = HashMap::new();
        engine
            .process_item_mutation_queue("b1", &mut |o: &QueuedOperation| {
                seen.insert(o.id.clone(), o.metadata.expected_remote.clone());
                ok()
            })
            .unwrap();
        assert_eq!(seen[&op.id], Some(expected));
    }

    #[test]
    fn test_resolve_conflict_rejects_unknown_and_pending() {
        let engine = engine();
        assert!(matches!(
            engine.resolve_conflict("nope", ConflictAction::Discard, None),
            Err(Error::NotFound { .. })
        ));

        let op = engine.enqueue_item_mutation("b1", "i1", Payload::Delete).commit().unwrap();
        assert!(matches!(
            engine.resolve_conflict(&op.id, ConflictAction::Retry, None),
            Err(Error::InvalidState(_))
        ));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_queue_survives_restart_on_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::default().with_store_path(dir.path().join("offline.db"));

        let op_id = {
            let engine = OfflineEngine::open(config.clone()).unwrap();
            assert_eq!(engine.backend(), crate::storage::Backend::Persistent);
            engine.enqueue_item_mutation("b1", "i1", Payload::Delete).commit().unwrap().id
        };

        let engine = OfflineEngine::open(config).unwrap();
        let report = engine.process_item_mutation_queue("b1", &mut |_: &QueuedOperation| ok()).unwrap();
        assert_eq!(report.processed, vec![op_id]);
    }
}
