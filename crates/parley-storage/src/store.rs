//! Persisted tab state and settings

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::migrations::run_migrations;
use crate::{Result, StorageError};

#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Opens (or creates) the store at `path`.
    ///
    /// A file that SQLite cannot read as a database is moved aside to
    /// `<name>.corrupt` and a fresh store is created in its place.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match Self::open_file(path) {
            Err(StorageError::Sqlite(err)) if is_unreadable(&err) => {
                let backup = corrupt_path(path);
                warn!(
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %err,
                    "State store unreadable, starting fresh"
                );
                std::fs::rename(path, &backup)?;
                for suffix in ["-wal", "-shm"] {
                    let _ = std::fs::remove_file(sidecar_path(path, suffix));
                }
                Self::open_file(path)
            }
            other => other,
        }
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        run_migrations(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn open_file(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;

        // WAL keeps readers off the writer's back during saves
        let _: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        run_migrations(&mut conn)?;
        info!(path = %path.display(), "State store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Replaces the persisted tab list. Readers see either the old list or
    /// the new one, never a mix.
    pub fn save_tabs<T: Serialize>(&self, tabs: &[T]) -> Result<()> {
        let payloads = tabs
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let saved_at = Utc::now().to_rfc3339();

        self.transaction(|conn| {
            conn.execute("DELETE FROM tab_states", [])?;
            let mut stmt = conn.prepare(
                "INSERT INTO tab_states (position, payload, saved_at) VALUES (?1, ?2, ?3)",
            )?;
            for (position, payload) in payloads.iter().enumerate() {
                stmt.execute(rusqlite::params![position as i64, payload, saved_at])?;
            }
            Ok(())
        })?;

        debug!(count = payloads.len(), "Tab states saved");
        Ok(())
    }

    /// Loads tabs in saved order. Rows that no longer deserialize are
    /// skipped; an unreadable table yields an empty list.
    pub fn load_tabs<T: DeserializeOwned>(&self) -> Vec<T> {
        let rows = self.with_connection(|conn| {
            let mut stmt =
                conn.prepare("SELECT position, payload FROM tab_states ORDER BY position")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        });

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Failed to read tab states");
                return Vec::new();
            }
        };

        rows.into_iter()
            .filter_map(|(position, payload)| match serde_json::from_str(&payload) {
                Ok(tab) => Some(tab),
                Err(e) => {
                    warn!(position, error = %e, "Skipping unreadable tab state");
                    None
                }
            })
            .collect()
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            let value = conn
                .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value)
        })
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![key, value, updated_at],
            )?;
            Ok(())
        })
    }

    /// Returns whether the key existed
    pub fn remove_setting(&self, key: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let removed = conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
            Ok(removed > 0)
        })
    }

    pub fn all_settings(&self) -> Result<BTreeMap<String, String>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let settings: BTreeMap<String, String> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
            Ok(settings)
        })
    }
}

fn is_unreadable(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
    )
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn corrupt_path(path: &Path) -> PathBuf {
    sidecar_path(path, ".corrupt")
}
