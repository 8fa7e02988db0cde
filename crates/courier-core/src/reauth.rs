// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Mid-run OAuth recovery.
//!
//! When the provider rejects a run with an auth error, the gateway builds
//! an authorization URL, broadcasts it to subscribers, sends it to the
//! originating chat, and stashes the prompt keyed by chat.  The next
//! message from that chat that *looks like* an OAuth code (long
//! base64/hex, optional `#state` suffix) is intercepted, exchanged, and
//! the stashed prompt is re-dispatched unchanged.  `/cancel` clears the
//! stash without re-dispatch.

use std::collections::HashMap;

use regex::Regex;
use tokio::sync::Mutex;

use crate::context::ChannelMeta;
use crate::registry::SessionKey;

/// A prompt parked while the user re-authenticates.
#[derive(Debug, Clone)]
pub struct StashedPrompt {
    pub session_key: SessionKey,
    pub prompt: String,
    pub channel: Option<ChannelMeta>,
}

pub struct ReauthTable {
    /// `channel:chat_id` → parked prompt.
    pending: Mutex<HashMap<String, StashedPrompt>>,
    code_re: Regex,
}

impl ReauthTable {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            // Long unspaced base64url/hex blob, optionally "#state".
            code_re: Regex::new(r"^[A-Za-z0-9+/_=\-]{20,}(#[A-Za-z0-9_\-]+)?$")
                .expect("static regex"),
        }
    }

    fn chat_key(channel: &str, chat_id: &str) -> String {
        format!("{channel}:{chat_id}")
    }

    pub async fn stash(&self, channel: &str, chat_id: &str, prompt: StashedPrompt) {
        self.pending
            .lock()
            .await
            .insert(Self::chat_key(channel, chat_id), prompt);
    }

    /// True when this chat has a parked prompt.
    pub async fn has_pending(&self, channel: &str, chat_id: &str) -> bool {
        self.pending
            .lock()
            .await
            .contains_key(&Self::chat_key(channel, chat_id))
    }

    /// If the chat has a parked prompt and `body` looks like an OAuth code,
    /// take the prompt out and return it with the bare code (state suffix
    /// stripped).  Non-code messages leave the stash untouched.
    pub async fn take_if_code(
        &self,
        channel: &str,
        chat_id: &str,
        body: &str,
    ) -> Option<(String, StashedPrompt)> {
        let trimmed = body.trim();
        if !self.looks_like_code(trimmed) {
            return None;
        }
        let stashed = self
            .pending
            .lock()
            .await
            .remove(&Self::chat_key(channel, chat_id))?;
        let code = trimmed.split('#').next().unwrap_or(trimmed).to_string();
        Some((code, stashed))
    }

    /// `/cancel`: drop the parked prompt.  Returns whether one existed.
    pub async fn clear(&self, channel: &str, chat_id: &str) -> bool {
        self.pending
            .lock()
            .await
            .remove(&Self::chat_key(channel, chat_id))
            .is_some()
    }

    pub fn looks_like_code(&self, text: &str) -> bool {
        self.code_re.is_match(text)
    }
}

impl Default for ReauthTable {
    fn default() -> Self {
        Self::new()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
