// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One persisted event from the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub seq: i64,
    pub session_key: String,
    pub event_type: String,
    pub payload: Value,
    /// Unix millis.
    pub created_at: i64,
}

impl StoredEvent {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let blob: Vec<u8> = row.get(3)?;
        let payload = serde_json::from_slice(&blob).unwrap_or(Value::Null);
        Ok(Self {
            seq: row.get(0)?,
            session_key: row.get(1)?,
            event_type: row.get(2)?,
            payload,
            created_at: row.get(4)?,
        })
    }
}
