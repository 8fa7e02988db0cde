// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Event envelope and the event-type catalog.
//!
//! Every event the gateway emits is a [`GatewayEvent`]: a type string, an
//! optional session key, an optional persisted sequence number, and an
//! opaque JSON payload.  Keyed events (except `agent.error`, which is
//! transient) are appended to the event log before broadcast; the assigned
//! `seq` rides along in the wire envelope so clients can resubscribe with a
//! cursor.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// Session-keyed agent events.
pub const EV_USER_MESSAGE: &str = "agent.user_message";
pub const EV_STREAM: &str = "agent.stream";
pub const EV_STREAM_BATCH: &str = "agent.stream_batch";
pub const EV_MESSAGE: &str = "agent.message";
pub const EV_TOOL_USE: &str = "agent.tool_use";
pub const EV_TOOL_RESULT: &str = "agent.tool_result";
pub const EV_TOOL_NOTIFY: &str = "agent.tool_notify";
pub const EV_TOOL_APPROVAL: &str = "agent.tool_approval";
pub const EV_ASK_USER: &str = "agent.ask_user";
pub const EV_QUESTION_DISMISSED: &str = "agent.question_dismissed";
pub const EV_RESULT: &str = "agent.result";
pub const EV_ERROR: &str = "agent.error";

// Global events.
pub const EV_STATUS_UPDATE: &str = "status.update";
pub const EV_SESSION_UPDATE: &str = "session.update";
pub const EV_SESSION_SNAPSHOT: &str = "session.snapshot";
pub const EV_CHANNEL_MESSAGE: &str = "channel.message";
pub const EV_CHANNEL_STATUS: &str = "channel.status";
pub const EV_REAUTH_REQUIRED: &str = "auth.reauth_required";

/// One event flowing through the fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    pub data: Value,
}

impl GatewayEvent {
    /// A session-scoped event.
    pub fn keyed(event: &str, session_key: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.to_string(),
            session_key: Some(session_key.into()),
            seq: None,
            data,
        }
    }

    /// A global event delivered to every authenticated subscriber.
    pub fn global(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            session_key: None,
            seq: None,
            data,
        }
    }

    /// Keyed events are persisted — except transient errors.
    pub fn is_persisted(&self) -> bool {
        self.session_key.is_some() && self.event != EV_ERROR
    }

    /// High-rate stream ticks are batched and may be skipped under
    /// backpressure; everything else is delivered as-is.
    pub fn is_stream(&self) -> bool {
        self.event == EV_STREAM
    }

    /// The wire envelope: `{event, data}` plus `seq` when persisted.
    pub fn to_wire(&self) -> Value {
        let mut wire = serde_json::json!({
            "event": self.event,
            "data": self.data,
        });
        if let Some(seq) = self.seq {
            wire["seq"] = seq.into();
        }
        wire
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
