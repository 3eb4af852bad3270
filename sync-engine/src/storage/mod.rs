#[cfg(feature = "sqlite")]
mod sqlite;
mod memory;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
pub use memory::MemoryStorage;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Bumping this wipes every persisted store on next open.
pub const STORE_VERSION: u32 = 1;

/// Logical stores sharing one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StoreKind {
    BoardMutations,
    ItemMutations,
    DocOperations,
    CommentMutations,
    FileUploads,
    BoardSnapshots,
    DependencyGraph,
    BatchIndex,
    Meta,
}

impl StoreKind {
    pub const ALL: [StoreKind; 9] = [
        StoreKind::BoardMutations,
        StoreKind::ItemMutations,
        StoreKind::DocOperations,
        StoreKind::CommentMutations,
        StoreKind::FileUploads,
        StoreKind::BoardSnapshots,
        StoreKind::DependencyGraph,
        StoreKind::BatchIndex,
        StoreKind::Meta,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StoreKind::BoardMutations => "board_mutations",
            StoreKind::ItemMutations => "item_mutations",
            StoreKind::DocOperations => "doc_operations",
            StoreKind::CommentMutations => "comment_mutations",
            StoreKind::FileUploads => "file_uploads",
            StoreKind::BoardSnapshots => "board_snapshots",
            StoreKind::DependencyGraph => "dependency_graph",
            StoreKind::BatchIndex => "batch_index",
            StoreKind::Meta => "meta",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Put { store: StoreKind, id: String, value: Vec<u8> },
    Delete { store: StoreKind, id: String },
}

/// Writes applied all-or-nothing by [`Storage::write_batch`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub(crate) writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, store: StoreKind, id: &str, value: Vec<u8>) -> &mut Self {
        self.writes.push(Write::Put { store, id: id.to_string(), value });
        self
    }

    pub fn delete(&mut self, store: StoreKind, id: &str) -> &mut Self {
        self.writes.push(Write::Delete { store, id: id.to_string() });
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Persistent,
    Ephemeral,
}

/// Keyed record storage. Values are opaque encoded records; every single
/// call is atomic with respect to one record, `write_batch` across records.
pub trait Storage: Send + Sync {
    fn get(&self, store: StoreKind, id: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, store: StoreKind, id: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, store: StoreKind, id: &str) -> Result<()>;
    fn list(&self, store: StoreKind) -> Result<Vec<(String, Vec<u8>)>>;
    fn clear(&self, store: StoreKind) -> Result<()>;
    fn write_batch(&self, batch: WriteBatch) -> Result<()>;
    fn backend(&self) -> Backend;
}

/// Result of [`open_or_fallback`]. `fallback_reason` is set when the
/// persistent backend could not be opened; logging it is up to the caller.
pub struct OpenedStorage {
    pub storage: Arc<dyn Storage>,
    pub fallback_reason: Option<crate::Error>,
}

#[cfg(feature = "sqlite")]
pub fn open_or_fallback(path: Option<&Path>) -> OpenedStorage {
    let Some(path) = path else {
        return OpenedStorage { storage: Arc::new(MemoryStorage::new()), fallback_reason: None };
    };
    match SqliteStorage::open(path) {
        Ok(storage) => OpenedStorage { storage: Arc::new(storage), fallback_reason: None },
        Err(e) => OpenedStorage {
            storage: Arc::new(MemoryStorage::new()),
            fallback_reason: Some(e),
        },
    }
}

#[cfg(not(feature = "sqlite"))]
pub fn open_or_fallback(path: Option<&Path>) -> OpenedStorage {
    OpenedStorage {
        storage: Arc::new(MemoryStorage::new()),
        fallback_reason: path.map(|p| {
            crate::Error::Storage(format!(
                "built without the sqlite feature, cannot open {}",
                p.display()
            ))
        }),
    }
}

pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
