// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Embedded SQLite persistence for the gateway.
//!
//! Two tables:
//! - `events` — the append-only event log.  `seq` is the authoritative
//!   global ordering; it is assigned inside the insert so callers can
//!   broadcast strictly after `append` returns and replay at any cursor
//!   with no gaps and no duplicates.
//! - `sessions` — one row per session key, mirroring the in-memory
//!   registry so sessions survive a restart.
//!
//! One writer connection behind a mutex.  All methods are synchronous and
//! quick; async callers invoke them inline.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::debug;

mod events;
mod sessions;

pub use events::StoredEvent;
pub use sessions::SessionRow;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("payload encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                 seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_key TEXT    NOT NULL,
                 event_type  TEXT    NOT NULL,
                 payload     BLOB    NOT NULL,
                 created_at  INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_events_key_seq
                 ON events (session_key, seq);
             CREATE TABLE IF NOT EXISTS sessions (
                 session_key        TEXT PRIMARY KEY,
                 session_id         TEXT    NOT NULL,
                 channel            TEXT    NOT NULL,
                 chat_id            TEXT    NOT NULL,
                 chat_type          TEXT    NOT NULL,
                 sender_name        TEXT,
                 provider_resume_id TEXT,
                 message_count      INTEGER NOT NULL DEFAULT 0,
                 last_message_at    INTEGER NOT NULL DEFAULT 0
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append one event and return its assigned sequence number.
    pub fn append(
        &self,
        session_key: &str,
        event_type: &str,
        payload: &Value,
    ) -> Result<i64, StoreError> {
        let blob = serde_json::to_vec(payload)?;
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO events (session_key, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_key, event_type, blob, Utc::now().timestamp_millis()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Events for `keys` with `seq > after_seq`, ordered by seq ascending.
    pub fn query(&self, keys: &[String], after_seq: i64) -> Result<Vec<StoredEvent>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
            "SELECT seq, session_key, event_type, payload, created_at
             FROM events
             WHERE session_key IN ({placeholders}) AND seq > ?
             ORDER BY seq ASC"
        );
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let mut params: Vec<&dyn rusqlite::ToSql> =
            keys.iter().map(|k| k as &dyn rusqlite::ToSql).collect();
        params.push(&after_seq);
        let rows = stmt.query_map(params.as_slice(), StoredEvent::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Drop events created before `cutoff_ms` (unix millis).  Returns the
    /// number of rows removed.
    pub fn cleanup_older_than(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let n = conn.execute(
            "DELETE FROM events WHERE created_at < ?1",
            params![cutoff_ms],
        )?;
        if n > 0 {
            debug!(removed = n, "event log retention sweep");
        }
        Ok(n)
    }

    /// Highest assigned sequence number (0 when the log is empty).
    pub fn last_seq(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let seq = conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM events", [], |r| {
            r.get(0)
        })?;
        Ok(seq)
    }

    // ── Session rows ─────────────────────────────────────────────────────────

    /// Insert or replace one session row.
    pub fn save_session(&self, row: &SessionRow) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO sessions
             (session_key, session_id, channel, chat_id, chat_type, sender_name,
              provider_resume_id, message_count, last_message_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.session_key,
                row.session_id,
                row.channel,
                row.chat_id,
                row.chat_type,
                row.sender_name,
                row.provider_resume_id,
                row.message_count,
                row.last_message_at,
            ],
        )?;
        Ok(())
    }

    pub fn load_sessions(&self) -> Result<Vec<SessionRow>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT session_key, session_id, channel, chat_id, chat_type, sender_name,
                    provider_resume_id, message_count, last_message_at
             FROM sessions",
        )?;
        let rows = stmt.query_map([], SessionRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn delete_session(&self, session_key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "DELETE FROM sessions WHERE session_key = ?1",
            params![session_key],
        )?;
        Ok(())
    }

    /// Test helper: rewrite an event's creation timestamp.
    #[cfg(any(test, feature = "testing"))]
    pub fn set_created_at(&self, seq: i64, created_at_ms: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE events SET created_at = ?1 WHERE seq = ?2",
            params![created_at_ms, seq],
        )?;
        Ok(())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_assigns_strictly_increasing_seq() {
        let store = Store::open_in_memory().unwrap();
        let a = store.append("k1", "agent.stream", &json!({"n": 1})).unwrap();
        let b = store.append("k1", "agent.stream", &json!({"n": 2})).unwrap();
        let c = store.append("k2", "agent.stream", &json!({"n": 3})).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn query_returns_only_later_events_in_order() {
        let store = Store::open_in_memory().unwrap();
        let keys = vec!["k1".to_string()];
        let first = store.append("k1", "agent.stream", &json!({"n": 1})).unwrap();
        store.append("k1", "agent.stream", &json!({"n": 2})).unwrap();
        store.append("k1", "agent.result", &json!({"n": 3})).unwrap();

        let events = store.query(&keys, first).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].seq < events[1].seq);
        assert_eq!(events[1].event_type, "agent.result");
    }

    #[test]
    fn query_filters_by_session_key() {
        let store = Store::open_in_memory().unwrap();
        store.append("k1", "agent.stream", &json!({})).unwrap();
        store.append("k2", "agent.stream", &json!({})).unwrap();

        let events = store.query(&["k2".to_string()], 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_key, "k2");
    }

    #[test]
    fn query_with_no_keys_is_empty() {
        let store = Store::open_in_memory().unwrap();
        store.append("k1", "agent.stream", &json!({})).unwrap();
        assert!(store.query(&[], 0).unwrap().is_empty());
    }

    #[test]
    fn cleanup_removes_only_old_events() {
        let store = Store::open_in_memory().unwrap();
        let old = store.append("k1", "agent.stream", &json!({})).unwrap();
        let recent = store.append("k1", "agent.stream", &json!({})).unwrap();
        store.set_created_at(old, 1_000).unwrap();

        let removed = store.cleanup_older_than(2_000).unwrap();
        assert_eq!(removed, 1);
        let left = store.query(&["k1".to_string()], 0).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].seq, recent);
    }

    #[test]
    fn payload_round_trips_as_json() {
        let store = Store::open_in_memory().unwrap();
        let payload = json!({"text": "héllo", "nested": {"n": 42}});
        store.append("k1", "agent.message", &payload).unwrap();
        let events = store.query(&["k1".to_string()], 0).unwrap();
        assert_eq!(events[0].payload, payload);
    }

    #[test]
    fn last_seq_tracks_appends() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.last_seq().unwrap(), 0);
        let seq = store.append("k1", "agent.stream", &json!({})).unwrap();
        assert_eq!(store.last_seq().unwrap(), seq);
    }

    #[test]
    fn session_rows_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let row = SessionRow {
            session_key: "telegram:dm:42".to_string(),
            session_id: "s-1".to_string(),
            channel: "telegram".to_string(),
            chat_id: "42".to_string(),
            chat_type: "dm".to_string(),
            sender_name: Some("alice".to_string()),
            provider_resume_id: Some("r-1".to_string()),
            message_count: 3,
            last_message_at: 1_700_000_000_000,
        };
        store.save_session(&row).unwrap();
        let loaded = store.load_sessions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].session_id, "s-1");
        assert_eq!(loaded[0].provider_resume_id.as_deref(), Some("r-1"));
    }

    #[test]
    fn save_session_replaces_existing_row() {
        let store = Store::open_in_memory().unwrap();
        let mut row = SessionRow::new("telegram:dm:42", "s-1", "telegram", "42", "dm");
        store.save_session(&row).unwrap();
        row.session_id = "s-2".to_string();
        store.save_session(&row).unwrap();
        let loaded = store.load_sessions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].session_id, "s-2");
    }

    #[test]
    fn delete_session_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.delete_session("missing").unwrap();
        let row = SessionRow::new("k", "s", "desktop", "c", "dm");
        store.save_session(&row).unwrap();
        store.delete_session("k").unwrap();
        assert!(store.load_sessions().unwrap().is_empty());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.db");
        let seq = {
            let store = Store::open(&path).unwrap();
            store.append("k1", "agent.stream", &json!({"n": 1})).unwrap()
        };
        let store = Store::open(&path).unwrap();
        assert_eq!(store.last_seq().unwrap(), seq);
    }
}
