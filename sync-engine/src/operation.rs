use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::VectorClock;
use crate::merge::ConflictPolicy;
use crate::storage::StoreKind;
use crate::store::Record;

/// The five mutation queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueKind {
    Board,
    Item,
    Doc,
    Comment,
    FileUpload,
}

impl QueueKind {
    pub const ALL: [QueueKind; 5] = [
        QueueKind::Board,
        QueueKind::Item,
        QueueKind::Doc,
        QueueKind::Comment,
        QueueKind::FileUpload,
    ];

    pub fn store(self) -> StoreKind {
        match self {
            QueueKind::Board => StoreKind::BoardMutations,
            QueueKind::Item => StoreKind::ItemMutations,
            QueueKind::Doc => StoreKind::DocOperations,
            QueueKind::Comment => StoreKind::CommentMutations,
            QueueKind::FileUpload => StoreKind::FileUploads,
        }
    }

    pub fn accepts(self, payload: PayloadKind) -> bool {
        use PayloadKind::*;
        match self {
            QueueKind::Board | QueueKind::Item => matches!(payload, Update | Move | Create | Delete),
            QueueKind::Doc => matches!(payload, RawOps),
            QueueKind::Comment => matches!(payload, Create | Update | Delete),
            QueueKind::FileUpload => matches!(payload, UploadParts | Delete),
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueKind::Board => "board",
            QueueKind::Item => "item",
            QueueKind::Doc => "doc",
            QueueKind::Comment => "comment",
            QueueKind::FileUpload => "file-upload",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPart {
    pub index: u32,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub uploaded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Payload {
    Update { field: String, value: Value },
    Move { from: Value, to: Value },
    Create { record: Value },
    Delete,
    /// Document ops are sequenced, never merged.
    RawOps { ops: Vec<Value> },
    UploadParts { file_name: String, parts: Vec<UploadPart> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Update,
    Move,
    Create,
    Delete,
    RawOps,
    UploadParts,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PayloadKind::Update => "update",
            PayloadKind::Move => "move",
            PayloadKind::Create => "create",
            PayloadKind::Delete => "delete",
            PayloadKind::RawOps => "raw-ops",
            PayloadKind::UploadParts => "upload-parts",
        })
    }
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Update { .. } => PayloadKind::Update,
            Payload::Move { .. } => PayloadKind::Move,
            Payload::Create { .. } => PayloadKind::Create,
            Payload::Delete => PayloadKind::Delete,
            Payload::RawOps { .. } => PayloadKind::RawOps,
            Payload::UploadParts { .. } => PayloadKind::UploadParts,
        }
    }

    /// The local value this payload carries for `field`, if any.
    pub fn field_value(&self, field: &str) -> Option<&Value> {
        match self {
            Payload::Update { field: f, value } if f == field => Some(value),
            Payload::Create { record } => record.get(field),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum OperationStatus {
    #[default]
    Pending,
    Syncing,
    Conflict {
        remote: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Synced,
    Failed { error: String },
}

impl OperationStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, OperationStatus::Pending)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, OperationStatus::Conflict { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineMetadata {
    pub vector_clock: VectorClock,
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_key: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Remote snapshot the next attempt should expect, seeded by a manual retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_remote: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    pub queue: QueueKind,
    /// Board, document, item or owner id the drain is filtered by.
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
    pub entity_id: String,
    pub payload: Payload,
    pub timestamp: u64,
    #[serde(default)]
    pub status: OperationStatus,
    pub metadata: OfflineMetadata,
}

impl QueuedOperation {
    pub fn new(
        queue: QueueKind,
        scope: &str,
        view: Option<&str>,
        entity_id: &str,
        payload: Payload,
        timestamp: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue,
            scope: scope.to_string(),
            view: view.map(str::to_string),
            entity_id: entity_id.to_string(),
            payload,
            timestamp,
            status: OperationStatus::Pending,
            metadata: OfflineMetadata::default(),
        }
    }

    pub fn matches_scope(&self, scope: &str, view: Option<&str>) -> bool {
        self.scope == scope && (view.is_none() || self.view.as_deref() == view)
    }

    pub fn batch_key(&self) -> Option<&str> {
        self.metadata.batch_key.as_deref()
    }
}

impl Record for QueuedOperation {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Replay order within a queue: enqueue timestamp, then id.
pub(crate) fn sort_for_replay(ops: &mut [QueuedOperation]) {
    ops.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}
