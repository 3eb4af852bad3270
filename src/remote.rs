use std::collections::HashMap;

use offline_sync::{
    remote_clock, ClockOrdering, Payload, QueuedOperation, SyncOutcome, Syncer, TransportError, VectorClock,
    REMOTE_CLOCK_FIELD,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tracing::{debug, trace};

/// In-process stand-in for the board service.
///
/// Keeps one JSON record per entity stamped with a vector clock, drops a
/// share of requests on the floor, and answers `Conflict` whenever the
/// incoming operation has not seen the stored record's clock.
pub struct SimulatedRemote {
    records: HashMap<String, Value>,
    doc_log: HashMap<String, Vec<Value>>,
    drop_rate: f64,
    rng: StdRng,
    requests: u64,
    dropped: u64,
}

impl SimulatedRemote {
    pub fn new(seed: u64, drop_rate: f64) -> Self {
        Self {
            records: HashMap::new(),
            doc_log: HashMap::new(),
            drop_rate: drop_rate.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
            requests: 0,
            dropped: 0,
        }
    }

    /// Writes a record as if another collaborator had made the change.
    pub fn seed_record(&mut self, entity_id: &str, mut record: Value, clock: VectorClock) {
        stamp(&mut record, &clock);
        self.records.insert(entity_id.to_string(), record);
    }

    /// Folds a record the client resolved locally back into the remote copy.
    pub fn accept(&mut self, entity_id: &str, record: Value) {
        self.records.insert(entity_id.to_string(), record);
    }

    pub fn record(&self, entity_id: &str) -> Option<&Value> {
        self.records.get(entity_id)
    }

    pub fn doc_len(&self, doc_id: &str) -> usize {
        self.doc_log.get(doc_id).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.requests, self.dropped)
    }

    fn apply(&mut self, op: &QueuedOperation) -> SyncOutcome {
        let existing = self.records.get(&op.entity_id).cloned();
        let stored_clock = existing.as_ref().and_then(remote_clock).unwrap_or_default();

        if let Some(remote) = &existing {
            if conflicts(&op.payload)
                && matches!(
                    op.metadata.vector_clock.compare(&stored_clock),
                    ClockOrdering::Behind | ClockOrdering::Concurrent
                )
            {
                return SyncOutcome::Conflict {
                    remote: remote.clone(),
                    reason: Some(format!("{} was changed by another collaborator", op.entity_id)),
                };
            }
        }

        let clock = VectorClock::merge([&stored_clock, &op.metadata.vector_clock]);
        let mut record = existing.unwrap_or_else(|| json!({ "id": op.entity_id }));
        match &op.payload {
            Payload::Create { record: fields } => {
                if let (Some(target), Some(source)) = (record.as_object_mut(), fields.as_object()) {
                    target.extend(source.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
            Payload::Update { field, value } => {
                if let Some(target) = record.as_object_mut() {
                    target.insert(field.clone(), value.clone());
                }
            }
            Payload::Move { to, .. } => {
                if let Some(target) = record.as_object_mut() {
                    target.insert("status".to_string(), to.clone());
                }
            }
            Payload::Delete => {
                self.records.remove(&op.entity_id);
                return SyncOutcome::Success { record: None };
            }
            Payload::RawOps { ops } => {
                let log = self.doc_log.entry(op.entity_id.clone()).or_default();
                log.extend(ops.iter().cloned());
                return SyncOutcome::Success { record: None };
            }
            Payload::UploadParts { file_name, parts } => {
                let mut upload = Map::new();
                upload.insert("id".to_string(), json!(op.entity_id));
                upload.insert("fileName".to_string(), json!(file_name));
                upload.insert("parts".to_string(), json!(parts.len()));
                upload.insert("bytes".to_string(), json!(parts.iter().map(|p| p.size).sum::<u64>()));
                record = Value::Object(upload);
            }
        }

        stamp(&mut record, &clock);
        self.records.insert(op.entity_id.clone(), record.clone());
        SyncOutcome::Success { record: Some(record) }
    }
}

impl Syncer for SimulatedRemote {
    fn sync(&mut self, op: &QueuedOperation) -> Result<SyncOutcome, TransportError> {
        self.requests += 1;
        if self.rng.gen_bool(self.drop_rate) {
            self.dropped += 1;
            debug!(op_id = %op.id, queue = %op.queue, "dropping request");
            return Err(format!("connection reset while sending {}", op.id).into());
        }
        let outcome = self.apply(op);
        trace!(op_id = %op.id, ?outcome, "remote answered");
        Ok(outcome)
    }
}

fn conflicts(payload: &Payload) -> bool {
    matches!(payload, Payload::Update { .. } | Payload::Move { .. } | Payload::Delete)
}

fn stamp(record: &mut Value, clock: &VectorClock) {
    if let Some(target) = record.as_object_mut() {
        target.insert(REMOTE_CLOCK_FIELD.to_string(), json!(clock));
    }
}
