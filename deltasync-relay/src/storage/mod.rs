//! SQLite storage backend for the relay.
//!
//! Only the installed current version is persisted. Partial pushes live in
//! the coordinator's memory and are lost on restart.

pub mod models;

use crate::error::RelayError;
use chrono::Utc;
use deltasync_core::crypto::Ciphertext;
use deltasync_core::versions::ServerVersion;
use deltasync_core::{KevMap, SignedVerhash};
use models::StoredVersion;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe relay storage.
#[derive(Clone)]
pub struct RelayStorage {
    conn: Arc<Mutex<Connection>>,
}

impl RelayStorage {
    pub fn open(path: &Path) -> Result<Self, anyhow::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, anyhow::Error> {
        let conn = Connection::open_in_memory()?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<(), anyhow::Error> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS current_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                pointer TEXT NOT NULL,
                seqnum INTEGER NOT NULL,
                saved_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS version_entries (
                key TEXT PRIMARY KEY,
                ciphertext BLOB NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RelayError> {
        self.conn
            .lock()
            .map_err(|e| RelayError::Internal(format!("Lock error: {}", e)))
    }

    /// Replace the stored version with `version`.
    pub fn save_version(&self, version: &ServerVersion) -> Result<(), RelayError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM version_entries", [])?;
        {
            let mut insert =
                tx.prepare("INSERT INTO version_entries (key, ciphertext) VALUES (?1, ?2)")?;
            for (key, ciphertext) in version.kevs() {
                insert.execute(params![key, ciphertext.as_bytes()])?;
            }
        }
        tx.execute(
            "INSERT INTO current_version (id, pointer, seqnum, saved_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                pointer = excluded.pointer,
                seqnum = excluded.seqnum,
                saved_at = excluded.saved_at",
            params![
                version.signed_verhash().as_str(),
                version.seqnum() as i64,
                Utc::now().timestamp()
            ],
        )?;
        tx.commit()?;

        tracing::debug!(
            "Persisted version seqnum={} ({} entries)",
            version.seqnum(),
            version.len()
        );
        Ok(())
    }

    pub fn load_version(&self) -> Result<Option<StoredVersion>, RelayError> {
        let conn = self.conn()?;
        let head = conn
            .query_row(
                "SELECT pointer, seqnum, saved_at FROM current_version WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((pointer, seqnum, saved_at)) = head else {
            return Ok(None);
        };

        let mut stmt = conn.prepare("SELECT key, ciphertext FROM version_entries")?;
        let kevs = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Ciphertext::from_bytes(row.get::<_, Vec<u8>>(1)?),
                ))
            })?
            .collect::<Result<KevMap, _>>()?;

        Ok(Some(StoredVersion {
            pointer: SignedVerhash::from(pointer),
            seqnum: seqnum as u64,
            saved_at,
            kevs,
        }))
    }
}
