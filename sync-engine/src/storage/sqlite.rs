use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Backend, Storage, StoreKind, Write, WriteBatch, STORE_VERSION};
use crate::error::Result;

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS offline_records (
    store TEXT NOT NULL,
    id TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (store, id)
) WITHOUT ROWID;

PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
"#;

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version != STORE_VERSION {
            if version != 0 {
                tracing::debug!(from = version, to = STORE_VERSION, "store version changed, wiping records");
            }
            conn.execute_batch("DROP TABLE IF EXISTS offline_records;")?;
            conn.execute_batch(&format!("PRAGMA user_version = {};", STORE_VERSION))?;
        }
        conn.execute_batch(INIT_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for SqliteStorage {
    fn get(&self, store: StoreKind, id: &str) -> Result<Option<Vec<u8>>> {
        let value = self.conn().query_row(
            "SELECT value FROM offline_records WHERE store = ?1 AND id = ?2",
            params![store.name(), id],
            |row| row.get(0),
        ).optional()?;
        Ok(value)
    }

    fn put(&self, store: StoreKind, id: &str, value: &[u8]) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO offline_records (store, id, value) VALUES (?1, ?2, ?3)",
            params![store.name(), id, value],
        )?;
        Ok(())
    }

    fn delete(&self, store: StoreKind, id: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM offline_records WHERE store = ?1 AND id = ?2",
            params![store.name(), id],
        )?;
        Ok(())
    }

    fn list(&self, store: StoreKind) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, value FROM offline_records WHERE store = ?1 ORDER BY id"
        )?;
        let records = stmt.query_map(params![store.name()], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<(String, Vec<u8>)>, _>>()?;
        Ok(records)
    }

    fn clear(&self, store: StoreKind) -> Result<()> {
        self.conn().execute("DELETE FROM offline_records WHERE store = ?1", params![store.name()])?;
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for write in &batch.writes {
            match write {
                Write::Put { store, id, value } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO offline_records (store, id, value) VALUES (?1, ?2, ?3)",
                        params![store.name(), id, value],
                    )?;
                }
                Write::Delete { store, id } => {
                    tx.execute(
                        "DELETE FROM offline_records WHERE store = ?1 AND id = ?2",
                        params![store.name(), id],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn backend(&self) -> Backend {
        Backend::Persistent
    }
}
