use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::batch::{group_by_batch, replay_order, BatchIndexRecord, BatchKey, BatchMember};
use crate::clock::VectorClock;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::merge::ConflictPolicy;
use crate::operation::{sort_for_replay, OperationStatus, Payload, QueueKind, QueuedOperation};
use crate::queue::{BoardSnapshot, MutationQueue, SnapshotCache};
use crate::storage::{now_millis, open_or_fallback, Backend, Storage, StoreKind, WriteBatch};
use crate::store::{Record, RecordStore};

const ENGINE_STATE_ID: &str = "engine";

/// Node identity and clock, persisted so causality survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EngineState {
    id: String,
    node_id: String,
    clock: VectorClock,
    last_timestamp: u64,
}

impl Record for EngineState {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Client-resident offline queue: enqueue, inspect, snapshot. Draining and
/// conflict resolution live in [`crate::sync`], sweeping in [`crate::gc`].
pub struct OfflineEngine {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) config: EngineConfig,
    pub(crate) graph: DependencyGraph,
    state: Mutex<EngineState>,
    meta: RecordStore<EngineState>,
    batches: RecordStore<BatchIndexRecord>,
    batch_lock: Mutex<()>,
    snapshots: SnapshotCache,
    fallback_reason: Option<String>,
}

impl OfflineEngine {
    /// Opens the configured store, falling back to memory when it cannot be opened.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let opened = open_or_fallback(config.store_path.as_deref());
        let mut engine = Self::with_storage(opened.storage, config)?;
        engine.fallback_reason = opened.fallback_reason.map(|e| e.to_string());
        Ok(engine)
    }

    pub fn open_in_memory(config: EngineConfig) -> Result<Self> {
        Self::with_storage(Arc::new(crate::storage::MemoryStorage::new()), config)
    }

    pub fn with_storage(storage: Arc<dyn Storage>, config: EngineConfig) -> Result<Self> {
        let meta: RecordStore<EngineState> = RecordStore::new(Arc::clone(&storage), StoreKind::Meta);
        let mut state = meta.get(ENGINE_STATE_ID)?.unwrap_or_else(|| EngineState {
            id: ENGINE_STATE_ID.to_string(),
            node_id: uuid::Uuid::new_v4().to_string(),
            clock: VectorClock::new(),
            last_timestamp: 0,
        });
        if let Some(node_id) = &config.node_id {
            state.node_id = node_id.clone();
        }
        state.clock = std::mem::take(&mut state.clock).ensure(&state.node_id);
        meta.put(&state)?;

        let engine = Self {
            graph: DependencyGraph::new(Arc::clone(&storage)),
            batches: RecordStore::new(Arc::clone(&storage), StoreKind::BatchIndex),
            snapshots: SnapshotCache::new(Arc::clone(&storage)),
            state: Mutex::new(state),
            batch_lock: Mutex::new(()),
            meta,
            storage,
            config,
            fallback_reason: None,
        };
        let recovered = engine.recover_interrupted()?;
        if recovered > 0 {
            tracing::debug!(recovered, "reset interrupted operations to pending");
        }
        Ok(engine)
    }

    pub fn backend(&self) -> Backend {
        self.storage.backend()
    }

    /// Why the persistent store could not be used, if the engine fell back.
    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback_reason.as_deref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn node_id(&self) -> String {
        self.state().node_id.clone()
    }

    pub fn clock(&self) -> VectorClock {
        self.state().clock.clone()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn queue(&self, kind: QueueKind) -> MutationQueue {
        MutationQueue::new(Arc::clone(&self.storage), kind)
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn batch_guard(&self) -> MutexGuard<'_, ()> {
        self.batch_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue_board_mutation(&self, board_id: &str, view: &str, entity_id: &str, payload: Payload) -> EnqueueBuilder<'_> {
        EnqueueBuilder::new(self, QueueKind::Board, board_id, Some(view), entity_id, payload)
    }

    pub fn enqueue_item_mutation(&self, board_id: &str, item_id: &str, payload: Payload) -> EnqueueBuilder<'_> {
        EnqueueBuilder::new(self, QueueKind::Item, board_id, None, item_id, payload)
    }

    pub fn enqueue_doc_operation(&self, doc_id: &str, ops: Vec<Value>) -> EnqueueBuilder<'_> {
        EnqueueBuilder::new(self, QueueKind::Doc, doc_id, None, doc_id, Payload::RawOps { ops })
    }

    pub fn enqueue_comment_mutation(&self, item_id: &str, comment_id: &str, payload: Payload) -> EnqueueBuilder<'_> {
        EnqueueBuilder::new(self, QueueKind::Comment, item_id, None, comment_id, payload)
    }

    pub fn enqueue_file_upload(&self, owner_id: &str, file_id: &str, payload: Payload) -> EnqueueBuilder<'_> {
        EnqueueBuilder::new(self, QueueKind::FileUpload, owner_id, None, file_id, payload)
    }

    /// Increments the local clock and hands out the next enqueue timestamp.
    fn tick(&self) -> Result<(VectorClock, u64)> {
        let mut state = self.state();
        let node_id = state.node_id.clone();
        state.clock = state
            .clock
            .clone()
            .increment(&node_id)
            .ok_or_else(|| Error::InvalidState(format!("clock counter for node {} is exhausted", node_id)))?;
        let now = now_millis();
        state.last_timestamp = if now > state.last_timestamp { now } else { state.last_timestamp + 1 };
        self.meta.put(&state)?;
        Ok((state.clock.clone(), state.last_timestamp))
    }

    /// Folds a remote clock into the local one.
    pub(crate) fn observe_clock(&self, remote: &VectorClock) -> Result<()> {
        let mut state = self.state();
        state.clock.merge_from(remote);
        self.meta.put(&state)
    }

    fn write_operation(&self, op: &QueuedOperation) -> Result<()> {
        let queue = self.queue(op.queue);
        let mut batch = WriteBatch::new();
        queue.stage_put(&mut batch, op)?;

        let _guard = self.batch_guard();
        if let Some(key) = op.batch_key() {
            let mut index = self.batches.get(key)?.unwrap_or_else(|| BatchIndexRecord {
                id: key.to_string(),
                members: Vec::new(),
            });
            index.members.push(BatchMember { queue: op.queue, op_id: op.id.clone() });
            self.batches.stage_put(&mut batch, &index)?;
        }
        self.storage.write_batch(batch)
    }

    /// Deletes `op` and resolves its dependency node in one write, together
    /// with any `extra` writes.
    pub(crate) fn remove_operation(&self, op: &QueuedOperation, mut extra: WriteBatch) -> Result<()> {
        self.queue(op.queue).stage_delete(&mut extra, &op.id);

        let _guard = self.batch_guard();
        if let Some(key) = op.batch_key() {
            if let Some(mut index) = self.batches.get(key)? {
                index.members.retain(|m| m.op_id != op.id);
                if index.members.is_empty() {
                    self.batches.stage_delete(&mut extra, key);
                } else {
                    self.batches.stage_put(&mut extra, &index)?;
                }
            }
        }
        self.graph.resolve_with(&op.id, extra)
    }

    pub fn find_operation(&self, op_id: &str) -> Result<Option<QueuedOperation>> {
        for kind in QueueKind::ALL {
            if let Some(op) = self.queue(kind).get(op_id)? {
                return Ok(Some(op));
            }
        }
        Ok(None)
    }

    pub fn list_queue(&self, kind: QueueKind) -> Result<Vec<QueuedOperation>> {
        self.queue(kind).list_all()
    }

    /// Operations still waiting to reach the remote, across every queue.
    pub fn pending_count(&self) -> Result<usize> {
        let mut count = 0;
        for kind in QueueKind::ALL {
            count += self
                .queue(kind)
                .list_all()?
                .iter()
                .filter(|op| !matches!(op.status, OperationStatus::Synced))
                .count();
        }
        Ok(count)
    }

    /// Members of a batch in replay order.
    pub fn batch(&self, key: &str) -> Result<Vec<QueuedOperation>> {
        let Some(index) = self.batches.get(key)? else {
            return Ok(Vec::new());
        };
        let mut ops = Vec::with_capacity(index.members.len());
        for member in &index.members {
            if let Some(op) = self.queue(member.queue).get(&member.op_id)? {
                ops.push(op);
            }
        }
        sort_for_replay(&mut ops);
        Ok(ops)
    }

    /// Unsynced contents of a queue scope, grouped into replay units.
    pub fn pending_batches(&self, kind: QueueKind, scope: &str) -> Result<Vec<(BatchKey, Vec<QueuedOperation>)>> {
        let ops = self
            .queue(kind)
            .list_scope(scope, None)?
            .into_iter()
            .filter(|op| !matches!(op.status, OperationStatus::Synced));
        Ok(replay_order(group_by_batch(ops)))
    }

    /// Resets operations left in `syncing` by an interrupted run.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for kind in QueueKind::ALL {
            let queue = self.queue(kind);
            for mut op in queue.list_all()? {
                if matches!(op.status, OperationStatus::Syncing) {
                    op.status = OperationStatus::Pending;
                    queue.put(&op)?;
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }

    pub fn save_board_snapshot(&self, board_id: &str, view: &str, items: Vec<Value>) -> Result<BoardSnapshot> {
        self.snapshots.save(board_id, view, items, now_millis())
    }

    pub fn get_board_snapshot(&self, board_id: &str, view: &str) -> Result<Option<BoardSnapshot>> {
        self.snapshots.get(board_id, view)
    }
}

/// Builder returned by the `enqueue_*` calls; nothing is written until `commit`.
pub struct EnqueueBuilder<'a> {
    engine: &'a OfflineEngine,
    queue: QueueKind,
    scope: String,
    view: Option<String>,
    entity_id: String,
    payload: Payload,
    policy: ConflictPolicy,
    dependencies: Vec<String>,
    batch_key: Option<String>,
}

impl<'a> EnqueueBuilder<'a> {
    fn new(
        engine: &'a OfflineEngine,
        queue: QueueKind,
        scope: &str,
        view: Option<&str>,
        entity_id: &str,
        payload: Payload,
    ) -> Self {
        Self {
            engine,
            queue,
            scope: scope.to_string(),
            view: view.map(str::to_string),
            entity_id: entity_id.to_string(),
            payload,
            policy: ConflictPolicy::default(),
            dependencies: Vec::new(),
            batch_key: None,
        }
    }

    pub fn policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn depends_on(mut self, op_id: &str) -> Self {
        if !self.dependencies.iter().any(|d| d == op_id) {
            self.dependencies.push(op_id.to_string());
        }
        self
    }

    pub fn batch(mut self, key: &str) -> Self {
        self.batch_key = Some(key.to_string());
        self
    }

    pub fn commit(self) -> Result<QueuedOperation> {
        let kind = self.payload.kind();
        if !self.queue.accepts(kind) {
            return Err(Error::InvalidPayload { queue: self.queue, payload: kind });
        }

        let (clock, timestamp) = self.engine.tick()?;
        let mut op = QueuedOperation::new(
            self.queue,
            &self.scope,
            self.view.as_deref(),
            &self.entity_id,
            self.payload,
            timestamp,
        );
        op.metadata.vector_clock = clock;
        op.metadata.conflict_policy = self.policy;
        op.metadata.dependencies = self.dependencies;
        op.metadata.batch_key = self.batch_key;

        // Prerequisites are recorded before the operation becomes visible to a drain.
        if !op.metadata.dependencies.is_empty() {
            self.engine.graph.register_dependencies(&op.id, &op.metadata.dependencies)?;
        }
        self.engine.write_operation(&op)?;

        tracing::debug!(
            queue = %op.queue,
            op_id = %op.id,
            entity = %op.entity_id,
            payload = %kind,
            deps = op.metadata.dependencies.len(),
            "enqueued"
        );
        Ok(op)
    }
}
