use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::{ClockOrdering, VectorClock};
use crate::operation::QueuedOperation;

/// Field under which remote records may embed their vector clock.
pub const REMOTE_CLOCK_FIELD: &str = "vectorClock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    #[default]
    LastWriterWins,
    SetUnion,
    SetIntersection,
    NumericMax,
    NumericMin,
    NumericSum,
}

/// Tie-break used when clocks are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prefer {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictPolicy {
    pub strategy: MergeStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default)]
    pub prefer: Prefer,
}

impl ConflictPolicy {
    pub fn new(strategy: MergeStrategy) -> Self {
        Self { strategy, field: None, prefer: Prefer::Local }
    }

    pub fn on_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }

    pub fn prefer(mut self, prefer: Prefer) -> Self {
        self.prefer = prefer;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    KeepLocal,
    UseRemote(Value),
    Merge(Value),
    Manual,
}

impl Resolution {
    pub fn kind(&self) -> ResolutionKind {
        match self {
            Resolution::KeepLocal => ResolutionKind::KeepLocal,
            Resolution::UseRemote(_) => ResolutionKind::UseRemote,
            Resolution::Merge(_) => ResolutionKind::Merge,
            Resolution::Manual => ResolutionKind::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionKind {
    KeepLocal,
    UseRemote,
    Merge,
    Manual,
}

pub fn remote_clock(record: &Value) -> Option<VectorClock> {
    record
        .get(REMOTE_CLOCK_FIELD)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Decides how a queued operation is reconciled with the remote record the
/// server reported as conflicting. Only last-writer-wins can yield `Manual`.
pub fn resolve(op: &QueuedOperation, remote: &Value, default_field: &str) -> Resolution {
    let policy = &op.metadata.conflict_policy;
    let field = policy.field.as_deref().unwrap_or(default_field);

    match policy.strategy {
        MergeStrategy::LastWriterWins => {
            let remote_clock = remote_clock(remote).unwrap_or_default();
            match op.metadata.vector_clock.compare(&remote_clock) {
                ClockOrdering::Ahead => Resolution::KeepLocal,
                ClockOrdering::Behind => Resolution::UseRemote(remote.clone()),
                ClockOrdering::Equal => match policy.prefer {
                    Prefer::Local => Resolution::KeepLocal,
                    Prefer::Remote => Resolution::UseRemote(remote.clone()),
                },
                ClockOrdering::Concurrent => Resolution::Manual,
            }
        }
        MergeStrategy::SetUnion | MergeStrategy::SetIntersection => {
            let local = as_set(op.payload.field_value(field));
            let theirs = as_set(remote.get(field));
            let merged = if policy.strategy == MergeStrategy::SetUnion {
                set_union(local, theirs)
            } else {
                set_intersection(local, theirs)
            };
            Resolution::Merge(merged_record(op, remote, field, Value::Array(merged)))
        }
        MergeStrategy::NumericMax | MergeStrategy::NumericMin | MergeStrategy::NumericSum => {
            let local = as_number(op.payload.field_value(field));
            let theirs = as_number(remote.get(field));
            let merged = match policy.strategy {
                MergeStrategy::NumericMax => local.max(theirs),
                MergeStrategy::NumericMin => local.min(theirs),
                _ => local + theirs,
            };
            Resolution::Merge(merged_record(op, remote, field, number_value(merged)))
        }
    }
}

fn merged_record(op: &QueuedOperation, remote: &Value, field: &str, merged: Value) -> Value {
    let mut record = match remote {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    record.insert(field.to_string(), merged);
    if let Some(clock) = remote_clock(remote) {
        let folded = VectorClock::merge([&op.metadata.vector_clock, &clock]);
        if let Ok(value) = serde_json::to_value(folded) {
            record.insert(REMOTE_CLOCK_FIELD.to_string(), value);
        }
    }
    Value::Object(record)
}

fn as_set(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => {
            let mut set = Vec::with_capacity(items.len());
            for item in items {
                if !set.contains(item) {
                    set.push(item.clone());
                }
            }
            set
        }
        _ => Vec::new(),
    }
}

fn set_union(mut local: Vec<Value>, remote: Vec<Value>) -> Vec<Value> {
    for item in remote {
        if !local.contains(&item) {
            local.push(item);
        }
    }
    local
}

fn set_intersection(local: Vec<Value>, remote: Vec<Value>) -> Vec<Value> {
    local.into_iter().filter(|item| remote.contains(item)).collect()
}

fn as_number(value: Option<&Value>) -> f64 {
    let n = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    if n.is_finite() { n } else { 0.0 }
}

// Integral results stay integers so `{"value": 8}` round-trips as written.
fn number_value(n: f64) -> Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if n.fract() == 0.0 && n.abs() <= MAX_EXACT {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::from(0))
    }
}
