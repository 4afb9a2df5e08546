//! Persisted environment records with `SQLite`.
//!
//! A named session keeps its environment across process restarts as long as
//! the configuration that shaped it is unchanged and the record is fresh.

use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

const SCHEMA_VERSION: i32 = 1;

/// Records older than this are discarded instead of reattached.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub name: String,
    pub environment_id: String,
    pub backend: String,
    pub config_hash: String,
    pub created_at: i64,
    pub last_used: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    Expired,
    ConfigChanged,
    BackendChanged,
}

/// Result of looking up a named session for reuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Reusable(SessionRecord),
    Stale {
        record: SessionRecord,
        reason: StaleReason,
    },
    Missing,
}

pub struct SessionStore {
    db: Mutex<Connection>,
}

impl SessionStore {
    /// Open or create a session store at the given path.
    pub fn open(path: &Path) -> Result<Self, SessionStoreError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                SessionStoreError::InvalidData(format!(
                    "Failed to create session directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let db = Connection::open(path)?;

        // Enable WAL mode for better concurrent access and performance
        db.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self { db: Mutex::new(db) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, SessionStoreError> {
        let store = Self {
            db: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn db(&self) -> MutexGuard<'_, Connection> {
        self.db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), SessionStoreError> {
        let db = self.db();
        let version: i32 = db.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        // Migration v0 -> v1: Initial schema
        if version < SCHEMA_VERSION {
            db.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS environments (
                    name            TEXT PRIMARY KEY,
                    environment_id  TEXT NOT NULL,
                    backend         TEXT NOT NULL,
                    config_hash     TEXT NOT NULL,
                    created_at      INTEGER NOT NULL,
                    last_used       INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_environments_last_used
                    ON environments(last_used DESC);

                PRAGMA user_version = 1;
                ",
            )?;
        }
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
        Ok(SessionRecord {
            name: row.get(0)?,
            environment_id: row.get(1)?,
            backend: row.get(2)?,
            config_hash: row.get(3)?,
            created_at: row.get(4)?,
            last_used: row.get(5)?,
        })
    }

    /// Upserts a record. `created_at` is kept from the first save.
    pub fn save(&self, record: &SessionRecord) -> Result<(), SessionStoreError> {
        self.db().execute(
            r"
            INSERT INTO environments
                (name, environment_id, backend, config_hash, created_at, last_used)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(name) DO UPDATE SET
                environment_id = excluded.environment_id,
                backend = excluded.backend,
                config_hash = excluded.config_hash,
                last_used = excluded.last_used
            ",
            params![
                record.name,
                record.environment_id,
                record.backend,
                record.config_hash,
                record.created_at,
                record.last_used
            ],
        )?;
        Ok(())
    }

    pub fn touch(&self, name: &str) -> Result<(), SessionStoreError> {
        let now = chrono::Utc::now().timestamp();
        let updated = self.db().execute(
            "UPDATE environments SET last_used = ?1 WHERE name = ?2",
            params![now, name],
        )?;
        if updated == 0 {
            return Err(SessionStoreError::NotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<SessionRecord, SessionStoreError> {
        self.db()
            .query_row(
                r"
                SELECT name, environment_id, backend, config_hash, created_at, last_used
                FROM environments WHERE name = ?1
                ",
                params![name],
                Self::from_row,
            )
            .optional()?
            .ok_or_else(|| SessionStoreError::NotFound(name.to_string()))
    }

    /// Decides whether the record for `name` may be reattached.
    pub fn lookup(
        &self,
        name: &str,
        backend: &str,
        config_hash: &str,
        max_age: Duration,
    ) -> Result<Lookup, SessionStoreError> {
        let record = match self.load(name) {
            Ok(record) => record,
            Err(SessionStoreError::NotFound(_)) => return Ok(Lookup::Missing),
            Err(e) => return Err(e),
        };

        let age = chrono::Utc::now().timestamp() - record.last_used;
        let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let reason = if age > max_age {
            Some(StaleReason::Expired)
        } else if record.backend != backend {
            Some(StaleReason::BackendChanged)
        } else if record.config_hash != config_hash {
            Some(StaleReason::ConfigChanged)
        } else {
            None
        };

        Ok(match reason {
            Some(reason) => Lookup::Stale { record, reason },
            None => Lookup::Reusable(record),
        })
    }

    pub fn delete(&self, name: &str) -> Result<bool, SessionStoreError> {
        let deleted = self
            .db()
            .execute("DELETE FROM environments WHERE name = ?1", params![name])?;
        Ok(deleted > 0)
    }

    /// All records, most recently used first.
    pub fn list(&self) -> Result<Vec<SessionRecord>, SessionStoreError> {
        let db = self.db();
        let mut stmt = db.prepare(
            r"
            SELECT name, environment_id, backend, config_hash, created_at, last_used
            FROM environments ORDER BY last_used DESC
            ",
        )?;
        let records = stmt
            .query_map([], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Removes and returns records not used within `max_age`.
    pub fn take_expired(&self, max_age: Duration) -> Result<Vec<SessionRecord>, SessionStoreError> {
        let cutoff = chrono::Utc::now().timestamp()
            - i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let expired: Vec<SessionRecord> = self
            .list()?
            .into_iter()
            .filter(|r| r.last_used < cutoff)
            .collect();
        for record in &expired {
            self.delete(&record.name)?;
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(name: &str, hash: &str, last_used: i64) -> SessionRecord {
        SessionRecord {
            name: name.to_string(),
            environment_id: format!("env-{name}"),
            backend: "local".to_string(),
            config_hash: hash.to_string(),
            created_at: last_used,
            last_used,
        }
    }

    #[test]
    fn test_save_and_load() {
        let store = SessionStore::open_in_memory().unwrap();
        let now = chrono::Utc::now().timestamp();
        store.save(&record("main", "abcd1234", now)).unwrap();
        assert_eq!(store.load("main").unwrap(), record("main", "abcd1234", now));
        assert!(matches!(
            store.load("other"),
            Err(SessionStoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_save_keeps_created_at() {
        let store = SessionStore::open_in_memory().unwrap();
        store.save(&record("main", "h1", 100)).unwrap();
        let mut updated = record("main", "h2", 200);
        updated.created_at = 200;
        store.save(&updated).unwrap();
        let loaded = store.load("main").unwrap();
        assert_eq!(loaded.created_at, 100);
        assert_eq!(loaded.last_used, 200);
        assert_eq!(loaded.config_hash, "h2");
    }

    #[test]
    fn test_lookup_rules() {
        let store = SessionStore::open_in_memory().unwrap();
        let now = chrono::Utc::now().timestamp();
        store.save(&record("fresh", "h1", now)).unwrap();
        store.save(&record("old", "h1", now - 25 * 3600)).unwrap();

        assert!(matches!(
            store.lookup("fresh", "local", "h1", DEFAULT_MAX_AGE).unwrap(),
            Lookup::Reusable(_)
        ));
        assert!(matches!(
            store.lookup("fresh", "local", "h2", DEFAULT_MAX_AGE).unwrap(),
            Lookup::Stale {
                reason: StaleReason::ConfigChanged,
                ..
            }
        ));
        assert!(matches!(
            store.lookup("fresh", "remote", "h1", DEFAULT_MAX_AGE).unwrap(),
            Lookup::Stale {
                reason: StaleReason::BackendChanged,
                ..
            }
        ));
        assert!(matches!(
            store.lookup("old", "local", "h1", DEFAULT_MAX_AGE).unwrap(),
            Lookup::Stale {
                reason: StaleReason::Expired,
                ..
            }
        ));
        assert_eq!(
            store.lookup("none", "local", "h1", DEFAULT_MAX_AGE).unwrap(),
            Lookup::Missing
        );
    }

    #[test]
    fn test_take_expired_and_list_order() {
        let store = SessionStore::open_in_memory().unwrap();
        let now = chrono::Utc::now().timestamp();
        store.save(&record("a", "h", now - 10)).unwrap();
        store.save(&record("b", "h", now)).unwrap();
        store.save(&record("c", "h", now - 48 * 3600)).unwrap();

        let names: Vec<String> = store.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["b", "a", "c"]);

        let expired = store.take_expired(DEFAULT_MAX_AGE).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].name, "c");
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_touch_and_delete() {
        let store = SessionStore::open_in_memory().unwrap();
        store.save(&record("main", "h", 0)).unwrap();
        store.touch("main").unwrap();
        assert!(store.load("main").unwrap().last_used > 0);
        assert!(store.delete("main").unwrap());
        assert!(!store.delete("main").unwrap());
        assert!(matches!(
            store.touch("main"),
            Err(SessionStoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("sessions.db");
        {
            let store = SessionStore::open(&path).unwrap();
            store.save(&record("main", "h", 42)).unwrap();
        }
        let store = SessionStore::open(&path).unwrap();
        assert_eq!(store.load("main").unwrap().last_used, 42);
    }
}
