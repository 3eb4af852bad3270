use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::operation::{sort_for_replay, QueueKind, QueuedOperation};
use crate::store::Record;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BatchKey {
    Keyed(String),
    /// Implicit group of one, for operations without a batch key.
    Solo(String),
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchKey::Keyed(key) => f.write_str(key),
            BatchKey::Solo(op_id) => write!(f, "solo:{}", op_id),
        }
    }
}

impl BatchKey {
    pub fn of(op: &QueuedOperation) -> Self {
        match op.batch_key() {
            Some(key) => BatchKey::Keyed(key.to_string()),
            None => BatchKey::Solo(op.id.clone()),
        }
    }
}

/// Groups operations by batch key, each group sorted by timestamp.
pub fn group_by_batch(
    operations: impl IntoIterator<Item = QueuedOperation>,
) -> BTreeMap<BatchKey, Vec<QueuedOperation>> {
    let mut groups: BTreeMap<BatchKey, Vec<QueuedOperation>> = BTreeMap::new();
    for op in operations {
        groups.entry(BatchKey::of(&op)).or_default().push(op);
    }
    for ops in groups.values_mut() {
        sort_for_replay(ops);
    }
    groups
}

/// Groups in the order they should be replayed: by their earliest member.
pub fn replay_order(groups: BTreeMap<BatchKey, Vec<QueuedOperation>>) -> Vec<(BatchKey, Vec<QueuedOperation>)> {
    let mut ordered: Vec<_> = groups.into_iter().filter(|(_, ops)| !ops.is_empty()).collect();
    ordered.sort_by(|(_, a), (_, b)| {
        let a = &a[0];
        let b = &b[0];
        a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id))
    });
    ordered
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMember {
    pub queue: QueueKind,
    pub op_id: String,
}

/// Persisted membership of one batch key, possibly spanning queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchIndexRecord {
    pub id: String,
    pub members: Vec<BatchMember>,
}

impl Record for BatchIndexRecord {
    fn id(&self) -> &str {
        &self.id
    }
}
