//! SQLite-backed durable event store.
//!
//! One row per event id (`INSERT OR REPLACE`), indexed by timestamp for
//! newest-first loads and row-limit cleanup. A small key/value `settings`
//! table remembers whether persistence was enabled.
//!
//! All calls block; [`super::PersistenceBridge`] runs them off the async
//! runtime.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use hookscope_core::{EventId, HookCategory, HookEvent, SessionId, Severity};

use super::PersistenceError;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS hook_events (
        id                TEXT PRIMARY KEY,
        hook_type         TEXT NOT NULL,
        title             TEXT NOT NULL,
        message           TEXT NOT NULL,
        timestamp_ms      INTEGER NOT NULL,
        source            TEXT NOT NULL,
        severity          INTEGER NOT NULL,
        session_id        TEXT,
        sequence          INTEGER,
        execution_time_ms INTEGER,
        metadata          TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_hook_events_timestamp ON hook_events (timestamp_ms);
    CREATE TABLE IF NOT EXISTS settings (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

const SELECT_COLUMNS: &str = "id, hook_type, title, message, timestamp_ms, source, severity, \
                              session_id, sequence, execution_time_ms, metadata";

const PERSISTENCE_ENABLED_KEY: &str = "persistence_enabled";

/// Durable store of hook events.
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    /// In-memory store, for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Inserts the event, replacing any row with the same id.
    pub fn upsert(&self, event: &HookEvent) -> Result<(), PersistenceError> {
        let metadata = serde_json::to_string(event.metadata())?;
        self.conn.execute(
            "INSERT OR REPLACE INTO hook_events
                (id, hook_type, title, message, timestamp_ms, source, severity,
                 session_id, sequence, execution_time_ms, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.id().as_str(),
                event.category().as_hook_type(),
                event.title(),
                event.message(),
                event.timestamp().timestamp_millis(),
                event.source(),
                event.severity().rank(),
                event.session_id().map(SessionId::as_str),
                event.sequence(),
                event
                    .execution_time_ms()
                    .and_then(|ms| i64::try_from(ms).ok()),
                metadata,
            ],
        )?;
        Ok(())
    }

    /// Deletes the oldest rows beyond `max_rows`; returns how many went.
    pub fn enforce_row_limit(&self, max_rows: usize) -> Result<usize, PersistenceError> {
        let keep = i64::try_from(max_rows).unwrap_or(i64::MAX);
        let deleted = self.conn.execute(
            "DELETE FROM hook_events WHERE id IN (
                SELECT id FROM hook_events
                ORDER BY timestamp_ms DESC, rowid DESC
                LIMIT -1 OFFSET ?1
             )",
            params![keep],
        )?;
        if deleted > 0 {
            debug!(deleted, max_rows, "Trimmed durable store");
        }
        Ok(deleted)
    }

    /// Up to `limit` events, newest first.
    pub fn load_recent(&self, limit: usize) -> Result<Vec<HookEvent>, PersistenceError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM hook_events
             ORDER BY timestamp_ms DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], StoredRow::from_row)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?.into_event()?);
        }
        Ok(events)
    }

    pub fn get(&self, id: &EventId) -> Result<Option<HookEvent>, PersistenceError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM hook_events WHERE id = ?1"),
                params![id.as_str()],
                StoredRow::from_row,
            )
            .optional()?;
        row.map(StoredRow::into_event).transpose()
    }

    /// Removes every stored event; settings survive.
    pub fn clear(&self) -> Result<usize, PersistenceError> {
        Ok(self.conn.execute("DELETE FROM hook_events", [])?)
    }

    pub fn count(&self) -> Result<usize, PersistenceError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM hook_events", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Remembered enabled flag; `None` if never set.
    pub fn persistence_preference(&self) -> Result<Option<bool>, PersistenceError> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![PERSISTENCE_ENABLED_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|v| v == "1"))
    }

    pub fn set_persistence_preference(&self, enabled: bool) -> Result<(), PersistenceError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![PERSISTENCE_ENABLED_KEY, if enabled { "1" } else { "0" }],
        )?;
        Ok(())
    }
}

// ============================================================================
// Row Mapping
// ============================================================================

struct StoredRow {
    id: String,
    hook_type: String,
    title: String,
    message: String,
    timestamp_ms: i64,
    source: String,
    severity: i64,
    session_id: Option<String>,
    sequence: Option<i64>,
    execution_time_ms: Option<i64>,
    metadata: String,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            hook_type: row.get(1)?,
            title: row.get(2)?,
            message: row.get(3)?,
            timestamp_ms: row.get(4)?,
            source: row.get(5)?,
            severity: row.get(6)?,
            session_id: row.get(7)?,
            sequence: row.get(8)?,
            execution_time_ms: row.get(9)?,
            metadata: row.get(10)?,
        })
    }

    fn into_event(self) -> Result<HookEvent, PersistenceError> {
        let timestamp: DateTime<Utc> = Utc
            .timestamp_millis_opt(self.timestamp_ms)
            .single()
            .ok_or_else(|| PersistenceError::Corrupt {
                id: self.id.clone(),
                reason: format!("timestamp {} out of range", self.timestamp_ms),
            })?;
        let metadata: BTreeMap<String, String> = serde_json::from_str(&self.metadata)?;
        let severity = u8::try_from(self.severity)
            .ok()
            .and_then(Severity::from_rank)
            .unwrap_or_default();

        let mut builder = HookEvent::builder(
            self.id,
            HookCategory::from_hook_type(&self.hook_type),
            timestamp,
        )
        .title(self.title)
        .message(self.message)
        .source(self.source)
        .severity(severity)
        .session_id(self.session_id.map(SessionId::new))
        .sequence(self.sequence)
        .execution_time_ms(self.execution_time_ms.and_then(|ms| u64::try_from(ms).ok()));

        for (key, value) in metadata {
            builder = builder.metadata(key, value);
        }
        Ok(builder.build())
    }
}
