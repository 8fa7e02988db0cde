// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Live run snapshots.
//!
//! A snapshot is the in-memory summary of an active run: what the agent is
//! doing right now, the text accumulated this turn, the tool in flight, and
//! any pending approval or question.  It exists so a subscriber that
//! reconnects (or recovers from backpressure) can re-render mid-run without
//! replaying every stream tick.
//!
//! Ownership: created when a turn starts, mutated only by the streaming
//! loop, destroyed at turn end.  The streaming loop's cleanup block is the
//! single point of deletion — a crashed run never leaves an orphan.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Thinking,
    Responding,
    ToolUse,
    Idle,
}

/// The tool currently being authored or executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentTool {
    pub tool_use_id: String,
    pub name: String,
    /// Partial input JSON accumulated from `input_json_delta` chunks.
    pub partial_input: String,
    /// Short human-readable detail once the input is complete.
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTool {
    pub tool_use_id: String,
    pub name: String,
    pub detail: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub status: SnapshotStatus,
    pub text: String,
    pub current_tool: Option<CurrentTool>,
    pub completed_tools: Vec<CompletedTool>,
    pub pending_approval: Option<Value>,
    pub pending_question: Option<Value>,
    /// Unix millis.
    pub updated_at: i64,
}

impl SessionSnapshot {
    fn new() -> Self {
        Self {
            status: SnapshotStatus::Thinking,
            text: String::new(),
            current_tool: None,
            completed_tools: Vec::new(),
            pending_approval: None,
            pending_question: None,
            updated_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self, session_key: &str) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or(Value::Null);
        v["sessionKey"] = session_key.into();
        v
    }
}

/// All live snapshots, keyed by session key.
#[derive(Default)]
pub struct SnapshotTable {
    inner: Mutex<HashMap<String, SessionSnapshot>>,
}

impl SnapshotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh snapshot for a starting turn.
    pub async fn create(&self, session_key: &str) {
        self.inner
            .lock()
            .await
            .insert(session_key.to_string(), SessionSnapshot::new());
    }

    /// Mutate the snapshot in place; a no-op when none exists.
    pub async fn update<F>(&self, session_key: &str, f: F)
    where
        F: FnOnce(&mut SessionSnapshot),
    {
        if let Some(snapshot) = self.inner.lock().await.get_mut(session_key) {
            f(snapshot);
            snapshot.updated_at = Utc::now().timestamp_millis();
        }
    }

    pub async fn remove(&self, session_key: &str) {
        self.inner.lock().await.remove(session_key);
    }

    pub async fn get(&self, session_key: &str) -> Option<SessionSnapshot> {
        self.inner.lock().await.get(session_key).cloned()
    }

    pub async fn contains(&self, session_key: &str) -> bool {
        self.inner.lock().await.contains_key(session_key)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
