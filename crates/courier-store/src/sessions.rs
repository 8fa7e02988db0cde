// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// One persisted session row.  The in-memory registry is the source of
/// truth while the gateway runs; rows exist so identity and resume tokens
/// survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_key: String,
    pub session_id: String,
    pub channel: String,
    pub chat_id: String,
    pub chat_type: String,
    pub sender_name: Option<String>,
    pub provider_resume_id: Option<String>,
    pub message_count: i64,
    /// Unix millis of the last inbound message.
    pub last_message_at: i64,
}

impl SessionRow {
    pub fn new(
        session_key: impl Into<String>,
        session_id: impl Into<String>,
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        chat_type: impl Into<String>,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            session_id: session_id.into(),
            channel: channel.into(),
            chat_id: chat_id.into(),
            chat_type: chat_type.into(),
            sender_name: None,
            provider_resume_id: None,
            message_count: 0,
            last_message_at: 0,
        }
    }

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_key: row.get(0)?,
            session_id: row.get(1)?,
            channel: row.get(2)?,
            chat_id: row.get(3)?,
            chat_type: row.get(4)?,
            sender_name: row.get(5)?,
            provider_resume_id: row.get(6)?,
            message_count: row.get(7)?,
            last_message_at: row.get(8)?,
        })
    }
}
