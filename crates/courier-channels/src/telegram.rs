// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Telegram transport — Bot API over HTTPS with `getUpdates` long-polling.
//!
//! No webhook, no inbound port: the gateway polls `getUpdates` with a 30 s
//! timeout and acknowledges by advancing the offset.  Approvals and
//! questions render as inline keyboards; button taps come back as
//! `callback_query` updates carrying `a:<request_id>:<verdict>` or
//! `q:<request_id>:<index>` in `callback_data`.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    ApprovalRequest, ChannelAdapter, ChannelError, ChannelEvent, InboundMessage, QuestionRequest,
    SendReceipt,
};

pub struct TelegramAdapter {
    client: reqwest::Client,
    base_url: String,
    events: mpsc::Sender<ChannelEvent>,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str, events: mpsc::Sender<ChannelEvent>) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
            events,
        })
    }

    /// Long-poll `getUpdates` forever, reconnecting on failure.
    pub async fn run(self: Arc<Self>) {
        let mut offset: i64 = 0;
        let _ = self
            .events
            .send(ChannelEvent::Status {
                channel: "telegram".to_string(),
                status: "connected".to_string(),
            })
            .await;
        info!("telegram: long-poll started");

        loop {
            match self.poll_once(offset).await {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        self.dispatch(update).await;
                    }
                }
                Err(e) => {
                    warn!("telegram: getUpdates failed: {e}, retrying in 5s");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn poll_once(&self, offset: i64) -> Result<Vec<TgUpdate>, ChannelError> {
        let resp: TgResponse<Vec<TgUpdate>> = self
            .client
            .post(format!("{}/getUpdates", self.base_url))
            .json(&json!({"offset": offset, "timeout": 30, "allowed_updates": ["message", "callback_query"]}))
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        resp.into_result()
    }

    async fn dispatch(&self, update: TgUpdate) {
        if let Some(cb) = update.callback_query {
            self.dispatch_callback(cb).await;
            return;
        }
        let Some(msg) = update.message else { return };
        let Some(text) = msg.text else { return };
        let chat_id = msg.chat.id.to_string();

        if let Some(command) = text.strip_prefix('/') {
            // `/cancel@botname arg` → `/cancel`
            let bare = command
                .split_whitespace()
                .next()
                .unwrap_or(command)
                .split('@')
                .next()
                .unwrap_or(command);
            debug!(chat_id, command = bare, "telegram: command");
            let _ = self
                .events
                .send(ChannelEvent::Command {
                    channel: "telegram".to_string(),
                    chat_id,
                    command: format!("/{bare}"),
                })
                .await;
            return;
        }

        let sender = msg.from.unwrap_or_default();
        let inbound = InboundMessage {
            channel: "telegram".to_string(),
            chat_id,
            chat_type: match msg.chat.kind.as_deref() {
                Some("private") | None => "dm".to_string(),
                Some(other) => other.to_string(),
            },
            sender_id: sender.id.to_string(),
            sender_name: sender
                .username
                .or(sender.first_name)
                .unwrap_or_else(|| "unknown".to_string()),
            body: text,
            reply_to_id: msg
                .reply_to_message
                .as_ref()
                .map(|r| r.message_id.to_string()),
            reply_to_body: msg.reply_to_message.and_then(|r| r.text),
            media_type: None,
            media_path: None,
            timestamp: msg.date.unwrap_or(0) * 1000,
        };
        let _ = self.events.send(ChannelEvent::Message(inbound)).await;
    }

    async fn dispatch_callback(&self, cb: TgCallbackQuery) {
        // Acknowledge so the client stops showing a spinner.
        let _ = self
            .client
            .post(format!("{}/answerCallbackQuery", self.base_url))
            .json(&json!({"callback_query_id": cb.id}))
            .send()
            .await;

        let Some(data) = cb.data else { return };
        let parts: Vec<&str> = data.splitn(3, ':').collect();
        match parts.as_slice() {
            ["a", request_id, verdict] => {
                let _ = self
                    .events
                    .send(ChannelEvent::ApprovalResponse {
                        channel: "telegram".to_string(),
                        request_id: request_id.to_string(),
                        approved: *verdict == "yes",
                        reason: None,
                    })
                    .await;
            }
            ["q", request_id, index] => {
                let Ok(index) = index.parse::<usize>() else {
                    return;
                };
                let _ = self
                    .events
                    .send(ChannelEvent::QuestionResponse {
                        channel: "telegram".to_string(),
                        request_id: request_id.to_string(),
                        index,
                        // The tapped label is resolved by the pending table;
                        // the wire only carries the index.
                        label: String::new(),
                    })
                    .await;
            }
            _ => debug!(data, "telegram: unrecognized callback data"),
        }
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, ChannelError> {
        let resp: TgResponse<Value> = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        resp.into_result()
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<SendReceipt, ChannelError> {
        let result = self
            .call(
                "sendMessage",
                json!({"chat_id": chat_id, "text": text, "parse_mode": "Markdown"}),
            )
            .await?;
        let message_id = result
            .get("message_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ChannelError::Transport("sendMessage returned no message_id".into()))?;
        Ok(SendReceipt {
            message_id: message_id.to_string(),
        })
    }

    async fn edit(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.call(
            "editMessageText",
            json!({"chat_id": chat_id, "message_id": message_id.parse::<i64>().unwrap_or_default(),
                   "text": text, "parse_mode": "Markdown"}),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, chat_id: &str, message_id: &str) -> Result<(), ChannelError> {
        self.call(
            "deleteMessage",
            json!({"chat_id": chat_id, "message_id": message_id.parse::<i64>().unwrap_or_default()}),
        )
        .await?;
        Ok(())
    }

    async fn typing(&self, chat_id: &str) -> Result<(), ChannelError> {
        self.call(
            "sendChatAction",
            json!({"chat_id": chat_id, "action": "typing"}),
        )
        .await?;
        Ok(())
    }

    async fn send_approval_request(&self, req: &ApprovalRequest) -> Result<(), ChannelError> {
        let text = format!(
            "🔐 Approval needed: *{}*\n`{}`",
            req.tool_name, req.summary
        );
        let keyboard = json!({"inline_keyboard": [[
            {"text": "✅ Allow", "callback_data": format!("a:{}:yes", req.request_id)},
            {"text": "❌ Deny",  "callback_data": format!("a:{}:no",  req.request_id)},
        ]]});
        self.call(
            "sendMessage",
            json!({"chat_id": req.chat_id, "text": text, "parse_mode": "Markdown",
                   "reply_markup": keyboard}),
        )
        .await?;
        Ok(())
    }

    async fn send_question(&self, q: &QuestionRequest) -> Result<(), ChannelError> {
        let rows: Vec<Value> = q
            .options
            .iter()
            .enumerate()
            .map(|(i, label)| {
                json!([{"text": label, "callback_data": format!("q:{}:{}", q.request_id, i)}])
            })
            .collect();
        self.call(
            "sendMessage",
            json!({"chat_id": q.chat_id, "text": q.question,
                   "reply_markup": {"inline_keyboard": rows}}),
        )
        .await?;
        Ok(())
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

impl<T> TgResponse<T> {
    fn into_result(self) -> Result<T, ChannelError> {
        if self.ok {
            self.result
                .ok_or_else(|| ChannelError::Transport("missing result".into()))
        } else {
            Err(ChannelError::Transport(
                self.description.unwrap_or_else(|| "unknown error".into()),
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
    callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    text: Option<String>,
    chat: TgChat,
    from: Option<TgUser>,
    date: Option<i64>,
    reply_to_message: Option<Box<TgMessage>>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TgUser {
    id: i64,
    username: Option<String>,
    first_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgCallbackQuery {
    id: String,
    data: Option<String>,
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> (Arc<TelegramAdapter>, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (TelegramAdapter::new("123:abc", tx), rx)
    }

    fn update_with_text(text: &str) -> TgUpdate {
        serde_json::from_value(json!({
            "update_id": 1,
            "message": {
                "message_id": 77,
                "text": text,
                "chat": {"id": -200, "type": "private"},
                "from": {"id": 888, "username": "alice"},
                "date": 1700000000
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn text_update_becomes_inbound_message() {
        let (a, mut rx) = adapter();
        a.dispatch(update_with_text("hello there")).await;
        match rx.recv().await.unwrap() {
            ChannelEvent::Message(m) => {
                assert_eq!(m.channel, "telegram");
                assert_eq!(m.chat_id, "-200");
                assert_eq!(m.chat_type, "dm");
                assert_eq!(m.sender_name, "alice");
                assert_eq!(m.body, "hello there");
                assert_eq!(m.timestamp, 1_700_000_000_000);
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slash_text_becomes_command() {
        let (a, mut rx) = adapter();
        a.dispatch(update_with_text("/reset@courier_bot now")).await;
        match rx.recv().await.unwrap() {
            ChannelEvent::Command { command, chat_id, .. } => {
                assert_eq!(command, "/reset");
                assert_eq!(chat_id, "-200");
            }
            other => panic!("expected Command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn group_chat_type_is_preserved() {
        let (a, mut rx) = adapter();
        let update: TgUpdate = serde_json::from_value(json!({
            "update_id": 2,
            "message": {
                "message_id": 78,
                "text": "hi all",
                "chat": {"id": -300, "type": "group"},
                "from": {"id": 9, "first_name": "Bob"}
            }
        }))
        .unwrap();
        a.dispatch(update).await;
        match rx.recv().await.unwrap() {
            ChannelEvent::Message(m) => {
                assert_eq!(m.chat_type, "group");
                assert_eq!(m.sender_name, "Bob");
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn error_response_surfaces_description() {
        let resp: TgResponse<Value> = serde_json::from_value(json!({
            "ok": false, "description": "Bad Request: chat not found"
        }))
        .unwrap();
        let err = resp.into_result().unwrap_err();
        assert!(err.to_string().contains("chat not found"));
    }
}
