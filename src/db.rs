// 🗄️ Persistence handle - SQLite + WAL, schema, audit trail
//
// The Database handle is constructed explicitly (CLI / server startup) and
// passed into the pipeline. Store functions elsewhere take `&Connection`;
// the handle only hands out the connection for the duration of one call.

use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

// ============================================================================
// DATABASE HANDLE
// ============================================================================

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and make sure the schema exists
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        setup_database(&conn)?;
        Ok(Self::from_connection(conn))
    }

    /// In-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` with exclusive access to the connection.
    ///
    /// The lock is released when `f` returns, so callers must not hold it
    /// across an `.await` (the closure is synchronous).
    pub fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut guard = self.lock();
        f(&mut guard)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic inside another caller's closure leaves SQLite itself consistent
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Close the underlying connection if this is the last handle.
    /// Returns false when other clones are still alive.
    pub fn close(self) -> Result<bool> {
        match Arc::try_unwrap(self.conn) {
            Ok(mutex) => {
                let conn = mutex.into_inner().unwrap_or_else(|p| p.into_inner());
                conn.close().map_err(|(_, e)| e)?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery (no-op for in-memory databases)
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Uploaded statement documents
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bank_documents (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            original_name TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            mime_type TEXT NOT NULL,
            file_path TEXT NOT NULL,
            checksum TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            bank_account_id TEXT,
            user_id TEXT NOT NULL,
            extracted_data TEXT,
            transaction_count INTEGER NOT NULL DEFAULT 0,
            llm_provider TEXT,
            llm_model TEXT,
            processing_time_ms INTEGER,
            statement_start_date TEXT,
            statement_end_date TEXT,
            processing_error TEXT,
            uploaded_at TEXT NOT NULL,
            processed_at TEXT,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Staged (candidate) transactions awaiting review
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pending_transactions (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL REFERENCES bank_documents(id),
            date TEXT NOT NULL,
            description TEXT NOT NULL,
            original_description TEXT NOT NULL,
            amount REAL NOT NULL CHECK (amount > 0),
            type TEXT NOT NULL,
            category TEXT,
            suggested_categories TEXT NOT NULL DEFAULT '[]',
            confidence REAL NOT NULL,
            line_number INTEGER,
            status TEXT NOT NULL DEFAULT 'PENDING',
            user_category TEXT,
            user_notes TEXT,
            duplicate_of_id TEXT,
            imported_transaction_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Canonical ledger (owned by the wider application; we read + insert)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            description TEXT NOT NULL,
            amount REAL NOT NULL,
            type TEXT NOT NULL,
            category TEXT NOT NULL,
            date TEXT NOT NULL,
            budget_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail of status transitions)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_documents_user ON bank_documents(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pending_document ON pending_transactions(document_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ledger_user_date ON transactions(user_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

/// Current time in the format every table stores
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Event for audit trail ("every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }

    /// Status transition event, `data = {"from": .., "to": ..}`
    pub fn status_change(entity_type: &str, entity_id: &str, from: &str, to: &str, actor: &str) -> Self {
        Self::new(
            "status_changed",
            entity_type,
            entity_id,
            serde_json::json!({ "from": from, "to": to }),
            actor,
        )
    }
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, oldest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|e| conversion_error(1, e))?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| conversion_error(5, e))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

/// Status values recorded for an entity, in order (the initial status first)
pub fn status_history(conn: &Connection, entity_type: &str, entity_id: &str) -> Result<Vec<String>> {
    let events = get_events_for_entity(conn, entity_type, entity_id)?;
    let mut history: Vec<String> = Vec::new();

    for event in events.iter().filter(|e| e.event_type == "status_changed") {
        if history.is_empty() {
            if let Some(from) = event.data.get("from").and_then(|v| v.as_str()) {
                history.push(from.to_string());
            }
        }
        if let Some(to) = event.data.get("to").and_then(|v| v.as_str()) {
            history.push(to.to_string());
        }
    }

    Ok(history)
}

pub(crate) fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}
