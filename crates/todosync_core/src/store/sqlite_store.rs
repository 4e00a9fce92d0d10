//! SQLite-backed key-value store.
//!
//! # Responsibility
//! - Persist key-value entries in the `kv_entries` table.
//! - Serialize connection access so the store can be shared across threads.

use super::{prefix_upper_bound, KvStore, StoreError, StoreResult};
use crate::db::{open_db, open_db_in_memory, DbResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Key-value store over one SQLite connection.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Wraps a connection that already has migrations applied.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Opens (or creates) a database file and applies migrations.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        open_db(path).map(Self::new)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        open_db_in_memory().map(Self::new)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
    }
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1;",
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv_entries (key, value, updated_at)
             VALUES (?1, ?2, (strftime('%s', 'now') * 1000))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at;",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv_entries WHERE key = ?1;", [key])?;
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut entries = Vec::new();
        match prefix_upper_bound(prefix) {
            Some(upper) => {
                let mut stmt = conn.prepare(
                    "SELECT key, value FROM kv_entries
                     WHERE key >= ?1 AND key < ?2
                     ORDER BY key ASC;",
                )?;
                let mut rows = stmt.query(params![prefix, upper])?;
                while let Some(row) = rows.next()? {
                    entries.push((row.get(0)?, row.get(1)?));
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT key, value FROM kv_entries
                     WHERE key >= ?1
                     ORDER BY key ASC;",
                )?;
                let mut rows = stmt.query([prefix])?;
                while let Some(row) = rows.next()? {
                    entries.push((row.get(0)?, row.get(1)?));
                }
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteKvStore;
    use crate::store::KvStore;

    #[test]
    fn set_overwrites_and_delete_is_idempotent() {
        let store = SqliteKvStore::open_in_memory().expect("store should open");
        store.set("a/1", "one").expect("set should succeed");
        store.set("a/1", "uno").expect("overwrite should succeed");
        assert_eq!(store.get("a/1").expect("get").as_deref(), Some("uno"));

        store.delete("a/1").expect("delete should succeed");
        store.delete("a/1").expect("second delete should succeed");
        assert_eq!(store.get("a/1").expect("get"), None);
    }

    #[test]
    fn list_prefix_is_ordered_and_bounded() {
        let store = SqliteKvStore::open_in_memory().expect("store should open");
        store.set("log/002", "b").expect("set");
        store.set("log/001", "a").expect("set");
        store.set("log0", "outside").expect("set");
        store.set("lof/999", "outside").expect("set");

        let entries = store.list_prefix("log/").expect("list should succeed");
        assert_eq!(
            entries,
            vec![
                ("log/001".to_string(), "a".to_string()),
                ("log/002".to_string(), "b".to_string()),
            ]
        );
    }
}
