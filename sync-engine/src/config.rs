use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_ORPHAN_GRACE_MILLIS: u64 = 5 * 60 * 1000;
pub const DEFAULT_MERGE_FIELD: &str = "value";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Local clock node id. Generated and persisted on first open when unset.
    pub node_id: Option<String>,
    /// SQLite file; `None` keeps everything in memory.
    pub store_path: Option<PathBuf>,
    /// Attempts after which a transport failure parks the operation as failed.
    pub max_attempts: Option<u32>,
    pub orphan_grace_millis: u64,
    /// Field read by set and numeric policies that name none.
    pub default_merge_field: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            store_path: None,
            max_attempts: None,
            orphan_grace_millis: DEFAULT_ORPHAN_GRACE_MILLIS,
            default_merge_field: DEFAULT_MERGE_FIELD.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn with_node_id(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_orphan_grace_millis(mut self, millis: u64) -> Self {
        self.orphan_grace_millis = millis;
        self
    }
}
