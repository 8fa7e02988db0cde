// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Messaging channel adapters.
//!
//! The gateway core consumes every transport through the narrow
//! [`ChannelAdapter`] contract: send/edit/delete a message, fire a typing
//! indicator, post an approval request, ask a multiple-choice question.
//! Inbound traffic flows the other way as [`ChannelEvent`]s pushed into an
//! mpsc sender the adapter receives at construction.
//!
//! Transport failures on `edit`/`delete`/`typing` are expected (messages
//! get deleted by users, chats get archived) — callers treat them as
//! best-effort and log at debug.

mod mock;
mod owner;
mod registry;
mod telegram;
mod whatsapp;

pub use mock::{MockAdapter, MockCall};
pub use owner::OwnerStore;
pub use registry::ChannelRegistry;
pub use telegram::TelegramAdapter;
pub use whatsapp::WhatsAppAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel is not connected")]
    NotConnected,

    #[error("message not found")]
    NotFound,
}

/// Receipt for a sent message.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Provider-assigned id, used for later edit/delete.
    pub message_id: String,
}

/// An approval request rendered on a channel (buttons where the transport
/// supports them, free-form reply otherwise).
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub chat_id: String,
    pub tool_name: String,
    /// Short human-readable rendering of the tool input.
    pub summary: String,
}

/// A multiple-choice question rendered on a channel.
#[derive(Debug, Clone)]
pub struct QuestionRequest {
    pub request_id: String,
    pub chat_id: String,
    pub question: String,
    pub options: Vec<String>,
}

/// Outbound contract every transport implements.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel name (`telegram`, `whatsapp`, …) — also the session-key prefix.
    fn name(&self) -> &str;

    async fn send(&self, chat_id: &str, text: &str) -> Result<SendReceipt, ChannelError>;

    async fn edit(&self, chat_id: &str, message_id: &str, text: &str)
        -> Result<(), ChannelError>;

    async fn delete(&self, chat_id: &str, message_id: &str) -> Result<(), ChannelError>;

    /// Optional typing indicator; default is a no-op.
    async fn typing(&self, _chat_id: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn send_approval_request(&self, req: &ApprovalRequest) -> Result<(), ChannelError>;

    async fn send_question(&self, q: &QuestionRequest) -> Result<(), ChannelError>;
}

/// Inbound message shape, normalized across transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub chat_id: String,
    /// `dm`, `group`, `channel` — defaults to `dm`.
    pub chat_type: String,
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_path: Option<String>,
    /// Unix millis.
    pub timestamp: i64,
}

/// Inbound events pushed by adapters.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(InboundMessage),
    /// A slash command (`/reset`, `/cancel`, `/status`) with the slash kept.
    Command {
        channel: String,
        chat_id: String,
        command: String,
    },
    ApprovalResponse {
        channel: String,
        request_id: String,
        approved: bool,
        reason: Option<String>,
    },
    QuestionResponse {
        channel: String,
        request_id: String,
        index: usize,
        label: String,
    },
    /// Transport state change (`connected`, `disconnected`, `qr_pending` …).
    Status {
        channel: String,
        status: String,
    },
}

// ── Prompt framing ────────────────────────────────────────────────────────────

/// Strip control characters and anything XML-special from a sender name so
/// it is safe inside an attribute.
pub fn sanitize_sender_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control() && !matches!(c, '<' | '>' | '&' | '"' | '\''))
        .take(64)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Escape XML-special characters in message bodies.
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Frame an inbound message as the prompt handed to the provider.
pub fn frame_incoming_message(msg: &InboundMessage) -> String {
    let sender = sanitize_sender_name(&msg.sender_name);
    let mut prompt = format!(
        "<incoming_message channel=\"{}\" chat_type=\"{}\" sender=\"{}\">",
        msg.channel, msg.chat_type, sender
    );
    if let Some(reply) = &msg.reply_to_body {
        prompt.push_str(&format!(
            "\n<replying_to>{}</replying_to>",
            escape_xml(reply)
        ));
    }
    prompt.push('\n');
    prompt.push_str(&escape_xml(&msg.body));
    prompt.push_str("\n</incoming_message>");
    prompt
}

// ── Unit tests ────────────────────────────────────────────────────────────────
