// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Owner chat-id store.
//!
//! Channels configured `owner_only` drop messages from chats not listed
//! here.  The first DM on an empty channel claims ownership (logged), so a
//! fresh install works without hand-editing JSON.  Writes are debounced:
//! mutations mark the store dirty and a background task flushes at most
//! once per second.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::{info, warn};

const FLUSH_DEBOUNCE: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Default)]
struct OwnerState {
    /// channel name → owner chat ids.
    owners: BTreeMap<String, BTreeSet<String>>,
    dirty: bool,
}

pub struct OwnerStore {
    path: PathBuf,
    state: Mutex<OwnerState>,
    flush_wakeup: tokio::sync::Notify,
}

impl OwnerStore {
    /// Load the store from `path` (missing file means empty).
    pub fn load(path: PathBuf) -> Arc<Self> {
        let owners = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), "owner store unreadable ({e}), starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Arc::new(Self {
            path,
            state: Mutex::new(OwnerState {
                owners,
                dirty: false,
            }),
            flush_wakeup: tokio::sync::Notify::new(),
        })
    }

    /// Background flusher; spawn once at startup.
    pub async fn run_flusher(self: Arc<Self>) {
        loop {
            self.flush_wakeup.notified().await;
            tokio::time::sleep(FLUSH_DEBOUNCE).await;
            if let Err(e) = self.flush().await {
                warn!("owner store flush failed: {e}");
            }
        }
    }

    /// True when `chat_id` may talk to the gateway on `channel`.  An empty
    /// channel claims the first DM chat as owner.
    pub async fn check_or_claim(&self, channel: &str, chat_id: &str, chat_type: &str) -> bool {
        let mut state = self.state.lock().await;
        let set = state.owners.entry(channel.to_string()).or_default();
        if set.contains(chat_id) {
            return true;
        }
        if set.is_empty() && chat_type == "dm" {
            info!(channel, chat_id, "claiming first chat as owner");
            set.insert(chat_id.to_string());
            state.dirty = true;
            self.flush_wakeup.notify_one();
            return true;
        }
        false
    }

    pub async fn add(&self, channel: &str, chat_id: &str) {
        let mut state = self.state.lock().await;
        state
            .owners
            .entry(channel.to_string())
            .or_default()
            .insert(chat_id.to_string());
        state.dirty = true;
        self.flush_wakeup.notify_one();
    }

    pub async fn is_owner(&self, channel: &str, chat_id: &str) -> bool {
        let state = self.state.lock().await;
        state
            .owners
            .get(channel)
            .map(|set| set.contains(chat_id))
            .unwrap_or(false)
    }

    pub async fn list(&self, channel: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .owners
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Write the store to disk if dirty.  Called by the flusher and once at
    /// shutdown.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = {
            let mut state = self.state.lock().await;
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            state.owners.clone()
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> Arc<OwnerStore> {
        OwnerStore::load(dir.path().join("owner-chat-ids.json"))
    }

    #[tokio::test]
    async fn first_dm_chat_claims_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.check_or_claim("telegram", "42", "dm").await);
        assert!(store.is_owner("telegram", "42").await);
        // A different chat is now rejected.
        assert!(!store.check_or_claim("telegram", "43", "dm").await);
    }

    #[tokio::test]
    async fn group_chat_never_claims() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(!store.check_or_claim("telegram", "-100", "group").await);
        assert!(store.list("telegram").await.is_empty());
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add("telegram", "42").await;
        assert!(!store.is_owner("whatsapp", "42").await);
    }

    #[tokio::test]
    async fn flush_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owner-chat-ids.json");
        {
            let store = OwnerStore::load(path.clone());
            store.add("telegram", "42").await;
            store.flush().await.unwrap();
        }
        let store = OwnerStore::load(path);
        assert!(store.is_owner("telegram", "42").await);
    }

    #[tokio::test]
    async fn flush_without_changes_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.flush().await.unwrap();
        assert!(!dir.path().join("owner-chat-ids.json").exists());
    }
}
