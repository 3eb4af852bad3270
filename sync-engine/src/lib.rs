//! Offline mutation queue with causal ordering and dependency-gated replay.
//!
//! # Example
//! ```rust
//! use offline_sync::{EngineConfig, OfflineEngine, Payload, QueuedOperation, SyncOutcome, TransportError};
//! use serde_json::json;
//!
//! let engine = OfflineEngine::open_in_memory(EngineConfig::default().with_node_id("laptop")).unwrap();
//!
//! // Edits made while offline
//! let create = engine
//!     .enqueue_item_mutation("board-1", "item-1", Payload::Create { record: json!({ "title": "Draft" }) })
//!     .commit()
//!     .unwrap();
//! engine
//!     .enqueue_board_mutation("board-1", "kanban", "item-1", Payload::Move { from: json!("todo"), to: json!("done") })
//!     .depends_on(&create.id)
//!     .commit()
//!     .unwrap();
//!
//! // Back online: the move waits until the create has reached the remote
//! let mut remote = |_: &QueuedOperation| Ok::<_, TransportError>(SyncOutcome::Success { record: None });
//! let board = engine.process_board_mutation_queue("board-1", "kanban", &mut remote).unwrap();
//! assert_eq!(board.skipped.len(), 1);
//!
//! engine.process_item_mutation_queue("board-1", &mut remote).unwrap();
//! let board = engine.process_board_mutation_queue("board-1", "kanban", &mut remote).unwrap();
//! assert_eq!(board.processed.len(), 1);
//! ```

mod batch;
mod clock;
mod config;
mod engine;
mod error;
mod gc;
mod graph;
mod merge;
mod operation;
mod queue;
mod storage;
mod store;
mod sync;

pub use batch::{group_by_batch, replay_order, BatchIndexRecord, BatchKey, BatchMember};
pub use clock::{ClockOrdering, VectorClock};
pub use config::EngineConfig;
pub use engine::{EnqueueBuilder, OfflineEngine};
pub use error::{Error, Result, TransportError};
pub use graph::{DependencyGraph, DependencyRecord};
pub use merge::{remote_clock, resolve, ConflictPolicy, MergeStrategy, Prefer, Resolution, ResolutionKind, REMOTE_CLOCK_FIELD};
pub use operation::{OfflineMetadata, OperationStatus, Payload, PayloadKind, QueueKind, QueuedOperation, UploadPart};
pub use queue::{BoardSnapshot, MutationQueue, SnapshotCache};
pub use storage::{
    now_millis, open_or_fallback, Backend, MemoryStorage, OpenedStorage, Storage, StoreKind, Write, WriteBatch,
    STORE_VERSION,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use store::{Record, RecordStore};
pub use sync::{AppliedRemote, ConflictAction, ConflictEntry, ProcessReport, RetryEntry, SyncOutcome, Syncer};
