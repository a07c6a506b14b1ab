//! SQLite database for build sessions and finished builds

use crate::partition::PartitionLimits;
use crate::session::BuildState;
use crate::store::SessionStore;
use crate::types::{BuildRecord, KeyKind};
use crate::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    limits: PartitionLimits,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>, limits: PartitionLimits) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            limits,
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory(limits: PartitionLimits) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            limits,
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn limits(&self) -> PartitionLimits {
        self.limits
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Working state of each browser session
            CREATE TABLE IF NOT EXISTS build_sessions (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Prepared builds
            CREATE TABLE IF NOT EXISTS builds (
                id TEXT PRIMARY KEY,
                vessels TEXT NOT NULL,
                users TEXT NOT NULL,
                keys_downloaded TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Build sessions
    // ========================================================================

    fn put_state(&self, id: &str, state: &BuildState) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT INTO build_sessions (id, state, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
            params![id, serde_json::to_string(state)?, now],
        )?;

        debug!("Saved build session {}", id);
        Ok(())
    }

    fn get_state(&self, id: &str) -> Result<Option<BuildState>> {
        let conn = self.conn.lock();

        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM build_sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Delete sessions untouched since `before` (unix seconds)
    pub fn prune_sessions(&self, before: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM build_sessions WHERE updated_at < ?1",
            params![before],
        )?;
        if rows > 0 {
            info!("Pruned {} stale build sessions", rows);
        }
        Ok(rows)
    }

    // ========================================================================
    // Builds
    // ========================================================================

    pub fn insert_build(&self, record: &BuildRecord) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO builds (id, vessels, users, keys_downloaded, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                serde_json::to_string(&record.vessels)?,
                serde_json::to_string(&record.users)?,
                serde_json::to_string(&record.keys_downloaded)?,
                record.created_at,
            ],
        )?;

        debug!("Inserted build {}", record.id);
        Ok(())
    }

    pub fn get_build(&self, id: &str) -> Result<Option<BuildRecord>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT id, vessels, users, keys_downloaded, created_at FROM builds WHERE id = ?1",
                params![id],
                |row| {
                    Ok(RawBuildRow {
                        id: row.get(0)?,
                        vessels: row.get(1)?,
                        users: row.get(2)?,
                        keys_downloaded: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;

        match row {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    /// Record that a key bundle was handed out
    pub fn mark_keys_downloaded(&self, id: &str, kind: KeyKind) -> Result<()> {
        let Some(mut record) = self.get_build(id)? else {
            return Err(crate::Error::not_found("build", id));
        };
        if record.keys_downloaded.contains(&kind) {
            return Ok(());
        }
        record.keys_downloaded.push(kind);

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE builds SET keys_downloaded = ?1 WHERE id = ?2",
            params![serde_json::to_string(&record.keys_downloaded)?, id],
        )?;
        Ok(())
    }

    pub fn delete_build(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM builds WHERE id = ?1", params![id])?;

        if rows > 0 {
            debug!("Deleted build {}", id);
        }

        Ok(rows > 0)
    }
}

impl SessionStore for Database {
    fn save(&self, session_id: Option<&str>, state: &BuildState) -> Result<String> {
        let id = match session_id {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        self.put_state(&id, state)?;
        Ok(id)
    }

    fn restore(&self, session_id: &str) -> Result<BuildState> {
        match self.get_state(session_id)? {
            Some(state) => Ok(state),
            None => self.reset(session_id),
        }
    }

    fn reset(&self, session_id: &str) -> Result<BuildState> {
        let state = BuildState::default_for(self.limits);
        self.put_state(session_id, &state)?;
        Ok(state)
    }
}

/// Raw database row before parsing
struct RawBuildRow {
    id: String,
    vessels: String,
    users: String,
    keys_downloaded: String,
    created_at: i64,
}

impl RawBuildRow {
    fn parse(self) -> Result<BuildRecord> {
        Ok(BuildRecord {
            id: self.id,
            vessels: serde_json::from_str(&self.vessels)?,
            users: serde_json::from_str(&self.users)?,
            keys_downloaded: serde_json::from_str(&self.keys_downloaded)?,
            created_at: self.created_at,
        })
    }
}
