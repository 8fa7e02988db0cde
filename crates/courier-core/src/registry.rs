// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Session registry — identity and lifecycle of conversational sessions.
//!
//! One session per key (`channel:chatType:chatId`), a stable `session_id`
//! UUID per incarnation, and the idle-timeout state machine:
//!
//! ```text
//!  idle (message_count == 0) ── inbound ──► active
//!  active ── now > last_message_at + idle_timeout & inbound ──► reset ► active'
//!  active ── explicit reset RPC ──► idle
//! ```
//!
//! A reset keeps the key, allocates a fresh `session_id`, and clears the
//! provider resume id.  All mutation goes through one mutex, so concurrent
//! callers touching the same key are serialized; rows are mirrored to the
//! store so identity survives a restart.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use courier_store::{SessionRow, Store};

use crate::events::{GatewayEvent, EV_SESSION_UPDATE};
use crate::fanout::EventBus;

/// Conversational scope: `channel:chatType:chatId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub channel: String,
    pub chat_type: String,
    pub chat_id: String,
}

impl SessionKey {
    pub fn new(
        channel: impl Into<String>,
        chat_type: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_type: chat_type.into(),
            chat_id: chat_id.into(),
        }
    }

    /// `dm` chat type shorthand.
    pub fn dm(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self::new(channel, "dm", chat_id)
    }

    /// Parse `channel:chatType:chatId`.  The chat id may itself contain
    /// colons; only the first two separators split.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        let channel = parts.next()?;
        let chat_type = parts.next()?;
        let chat_id = parts.next()?;
        if channel.is_empty() || chat_type.is_empty() || chat_id.is_empty() {
            return None;
        }
        Some(Self::new(channel, chat_type, chat_id))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.channel, self.chat_type, self.chat_id)
    }
}

/// In-memory session state (mirrored to the store on every mutation).
#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    pub session_id: String,
    pub provider_resume_id: Option<String>,
    pub message_count: i64,
    /// Unix millis of the last inbound message.
    pub last_message_at: i64,
    pub active_run: bool,
    pub sender_name: Option<String>,
}

impl Session {
    fn new(key: SessionKey) -> Self {
        Self {
            key,
            session_id: Uuid::new_v4().to_string(),
            provider_resume_id: None,
            message_count: 0,
            last_message_at: 0,
            active_run: false,
            sender_name: None,
        }
    }

    fn to_row(&self) -> SessionRow {
        SessionRow {
            session_key: self.key.to_string(),
            session_id: self.session_id.clone(),
            channel: self.key.channel.clone(),
            chat_id: self.key.chat_id.clone(),
            chat_type: self.key.chat_type.clone(),
            sender_name: self.sender_name.clone(),
            provider_resume_id: self.provider_resume_id.clone(),
            message_count: self.message_count,
            last_message_at: self.last_message_at,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "sessionKey": self.key.to_string(),
            "sessionId": self.session_id,
            "channel": self.key.channel,
            "chatId": self.key.chat_id,
            "chatType": self.key.chat_type,
            "messageCount": self.message_count,
            "lastMessageAt": self.last_message_at,
            "activeRun": self.active_run,
        })
    }
}

pub struct Registry {
    store: Arc<Store>,
    sessions: Mutex<HashMap<String, Session>>,
    idle_timeout_ms: i64,
    bus: Mutex<Option<Arc<EventBus>>>,
}

impl Registry {
    pub fn new(store: Arc<Store>, idle_timeout_hours: u64) -> Arc<Self> {
        let sessions = match store.load_sessions() {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|row| {
                    let key = SessionKey::parse(&row.session_key)?;
                    Some((
                        row.session_key.clone(),
                        Session {
                            key,
                            session_id: row.session_id,
                            provider_resume_id: row.provider_resume_id,
                            message_count: row.message_count,
                            last_message_at: row.last_message_at,
                            active_run: false,
                            sender_name: row.sender_name,
                        },
                    ))
                })
                .collect(),
            Err(e) => {
                warn!("could not load persisted sessions: {e}");
                HashMap::new()
            }
        };
        Arc::new(Self {
            store,
            sessions: Mutex::new(sessions),
            idle_timeout_ms: (idle_timeout_hours * 3_600_000) as i64,
            bus: Mutex::new(None),
        })
    }

    /// Wire the fan-out so mutations emit `session.update`.  Called once at
    /// startup, after the bus exists.
    pub async fn attach_bus(&self, bus: Arc<EventBus>) {
        *self.bus.lock().await = Some(bus);
    }

    pub fn make_key(channel: &str, chat_type: Option<&str>, chat_id: &str) -> SessionKey {
        SessionKey::new(channel, chat_type.unwrap_or("dm"), chat_id)
    }

    /// Stable identity for a key; creates the session on first use.
    pub async fn get_or_create(&self, key: &SessionKey) -> Session {
        self.touch_at(key, Utc::now().timestamp_millis()).await
    }

    /// `get_or_create` with an explicit clock, applying the idle-timeout
    /// reset: an existing session that has been quiet longer than the
    /// timeout is replaced (same key, fresh session id, resume id cleared)
    /// before it is returned.
    pub async fn touch_at(&self, key: &SessionKey, now_ms: i64) -> Session {
        let key_str = key.to_string();
        let (session, mutated) = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&key_str) {
                Some(existing) => {
                    let idle_for = now_ms - existing.last_message_at;
                    if existing.message_count > 0 && idle_for > self.idle_timeout_ms {
                        info!(session_key = %key_str, "idle timeout — starting fresh session");
                        let mut fresh = Session::new(key.clone());
                        fresh.sender_name = existing.sender_name.clone();
                        *existing = fresh;
                        let _ = self.store.save_session(&existing.to_row());
                        (existing.clone(), true)
                    } else {
                        (existing.clone(), false)
                    }
                }
                None => {
                    let session = Session::new(key.clone());
                    let _ = self.store.save_session(&session.to_row());
                    sessions.insert(key_str.clone(), session.clone());
                    (session, true)
                }
            }
        };
        if mutated {
            self.emit_update(&session).await;
        }
        session
    }

    /// Bump the message counter and the last-message timestamp.
    pub async fn increment_messages(&self, key: &SessionKey) {
        self.increment_messages_at(key, Utc::now().timestamp_millis())
            .await;
    }

    pub async fn increment_messages_at(&self, key: &SessionKey, now_ms: i64) {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(&key.to_string()) else {
                return;
            };
            session.message_count += 1;
            session.last_message_at = now_ms;
            let _ = self.store.save_session(&session.to_row());
            session.clone()
        };
        self.emit_update(&session).await;
    }

    /// Drop the session row entirely.  The resume id dies with it; the next
    /// inbound on the key creates a fresh session.
    pub async fn remove(&self, key: &SessionKey) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&key.to_string())
        };
        if removed.is_some() {
            let _ = self.store.delete_session(&key.to_string());
            if let Some(bus) = self.bus.lock().await.clone() {
                bus.publish(GatewayEvent::global(
                    EV_SESSION_UPDATE,
                    json!({"sessionKey": key.to_string(), "removed": true}),
                ))
                .await;
            }
        }
    }

    /// Explicit reset: same key, new session id, cleared resume id.
    pub async fn reset(&self, key: &SessionKey) -> Option<Session> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let existing = sessions.get_mut(&key.to_string())?;
            let mut fresh = Session::new(key.clone());
            fresh.sender_name = existing.sender_name.clone();
            *existing = fresh;
            let _ = self.store.save_session(&existing.to_row());
            existing.clone()
        };
        self.emit_update(&session).await;
        Some(session)
    }

    /// Flip the active-run flag.  Calls must be paired: exactly one `true`
    /// per run and one `false` at its end.
    pub async fn set_active_run(&self, key: &SessionKey, active: bool) {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(&key.to_string()) else {
                return;
            };
            session.active_run = active;
            session.clone()
        };
        self.emit_update(&session).await;
    }

    pub async fn set_provider_resume_id(&self, key: &SessionKey, id: Option<String>) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&key.to_string()) {
            session.provider_resume_id = id;
            let _ = self.store.save_session(&session.to_row());
        }
    }

    pub async fn set_sender_name(&self, key: &SessionKey, name: Option<String>) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&key.to_string()) {
            session.sender_name = name;
            let _ = self.store.save_session(&session.to_row());
        }
    }

    pub async fn get(&self, key: &SessionKey) -> Option<Session> {
        self.sessions.lock().await.get(&key.to_string()).cloned()
    }

    pub async fn list(&self) -> Vec<Session> {
        let mut all: Vec<Session> = self.sessions.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        all
    }

    /// Keys with a run currently executing — replayed to clients on auth.
    pub async fn get_active_run_keys(&self) -> Vec<String> {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.active_run)
            .map(|s| s.key.to_string())
            .collect()
    }

    async fn emit_update(&self, session: &Session) {
        if let Some(bus) = self.bus.lock().await.clone() {
            bus.publish(GatewayEvent::global(EV_SESSION_UPDATE, session.to_json()))
                .await;
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<Registry> {
        Registry::new(Arc::new(Store::open_in_memory().unwrap()), 4)
    }

    #[test]
    fn key_formats_and_parses() {
        let key = SessionKey::new("telegram", "dm", "42");
        assert_eq!(key.to_string(), "telegram:dm:42");
        assert_eq!(SessionKey::parse("telegram:dm:42"), Some(key));
    }

    #[test]
    fn key_chat_id_may_contain_colons() {
        let key = SessionKey::parse("whatsapp:group:a:b:c").unwrap();
        assert_eq!(key.chat_id, "a:b:c");
    }

    #[test]
    fn malformed_keys_do_not_parse() {
        assert!(SessionKey::parse("nocolons").is_none());
        assert!(SessionKey::parse("a:b:").is_none());
    }

    #[test]
    fn make_key_defaults_chat_type_to_dm() {
        let key = Registry::make_key("desktop", None, "task-1");
        assert_eq!(key.chat_type, "dm");
    }

    #[tokio::test]
    async fn get_or_create_is_stable() {
        let reg = registry();
        let key = SessionKey::dm("desktop", "c1");
        let a = reg.get_or_create(&key).await;
        let b = reg.get_or_create(&key).await;
        assert_eq!(a.session_id, b.session_id);
    }

    #[tokio::test]
    async fn idle_timeout_allocates_new_session_id() {
        let reg = registry();
        let key = SessionKey::dm("telegram", "42");
        let first = reg.touch_at(&key, 1_000).await;
        reg.increment_messages_at(&key, 1_000).await;

        // Within the window: same id.
        let hours3 = 3 * 3_600_000;
        let same = reg.touch_at(&key, 1_000 + hours3).await;
        assert_eq!(same.session_id, first.session_id);

        // Beyond 4 h: fresh id, resume cleared.
        reg.set_provider_resume_id(&key, Some("r-1".to_string()))
            .await;
        let hours5 = 5 * 3_600_000;
        let fresh = reg.touch_at(&key, 1_000 + hours5).await;
        assert_ne!(fresh.session_id, first.session_id);
        assert!(fresh.provider_resume_id.is_none());
    }

    #[tokio::test]
    async fn idle_timeout_ignores_virgin_sessions() {
        let reg = registry();
        let key = SessionKey::dm("telegram", "42");
        let first = reg.touch_at(&key, 1_000).await;
        // message_count == 0: a week later it is still the same session.
        let later = reg.touch_at(&key, 1_000 + 7 * 24 * 3_600_000).await;
        assert_eq!(later.session_id, first.session_id);
    }

    #[tokio::test]
    async fn reset_keeps_key_and_replaces_identity() {
        let reg = registry();
        let key = SessionKey::dm("telegram", "42");
        let first = reg.get_or_create(&key).await;
        reg.set_provider_resume_id(&key, Some("r-1".to_string()))
            .await;
        let reset = reg.reset(&key).await.unwrap();
        assert_eq!(reset.key, first.key);
        assert_ne!(reset.session_id, first.session_id);
        assert!(reset.provider_resume_id.is_none());
        assert_eq!(reset.message_count, 0);
    }

    #[tokio::test]
    async fn remove_then_create_is_a_fresh_session() {
        let reg = registry();
        let key = SessionKey::dm("telegram", "42");
        let first = reg.get_or_create(&key).await;
        reg.remove(&key).await;
        let second = reg.get_or_create(&key).await;
        assert_ne!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn active_run_keys_reflect_flag() {
        let reg = registry();
        let key = SessionKey::dm("desktop", "c1");
        reg.get_or_create(&key).await;
        assert!(reg.get_active_run_keys().await.is_empty());
        reg.set_active_run(&key, true).await;
        assert_eq!(reg.get_active_run_keys().await, vec!["desktop:dm:c1"]);
        reg.set_active_run(&key, false).await;
        assert!(reg.get_active_run_keys().await.is_empty());
    }

    #[tokio::test]
    async fn sessions_survive_reload() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let key = SessionKey::dm("telegram", "42");
        let first = {
            let reg = Registry::new(store.clone(), 4);
            let s = reg.get_or_create(&key).await;
            reg.set_provider_resume_id(&key, Some("r-9".to_string()))
                .await;
            s
        };
        let reg = Registry::new(store, 4);
        let loaded = reg.get(&key).await.unwrap();
        assert_eq!(loaded.session_id, first.session_id);
        assert_eq!(loaded.provider_resume_id.as_deref(), Some("r-9"));
        // Runtime flag does not survive restarts.
        assert!(!loaded.active_run);
    }
}
