// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WhatsApp transport — a local bridge process owns the QR/link session and
//! the wire protocol; the gateway speaks JSON frames to it over a WebSocket.
//!
//! Outbound frames carry a correlation `id`; the bridge answers `sent`
//! frames with the provider message id.  Inbound `message` frames are
//! normalized into [`InboundMessage`]s.
//!
//! WhatsApp has no inline buttons, so approvals and questions are free-form:
//! the adapter remembers what is pending per chat and interprets the next
//! short reply (`yes` / `no reason…` / an option number or label) as the
//! answer.  Anything that does not parse flows through as a normal message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::{
    ApprovalRequest, ChannelAdapter, ChannelError, ChannelEvent, InboundMessage, QuestionRequest,
    SendReceipt,
};

#[derive(Debug, Clone)]
enum PendingPrompt {
    Approval { request_id: String },
    Question { request_id: String, options: Vec<String> },
}

pub struct WhatsAppAdapter {
    bridge_url: String,
    events: mpsc::Sender<ChannelEvent>,
    /// Outbound frames for the writer half of the socket.
    out_tx: mpsc::Sender<serde_json::Value>,
    out_rx: Mutex<Option<mpsc::Receiver<serde_json::Value>>>,
    /// Correlation id → waiting sender for the bridge's `sent` reply.
    waiting: Mutex<HashMap<u64, oneshot::Sender<String>>>,
    /// Chat id → prompt awaiting a free-form reply.
    pending: Mutex<HashMap<String, PendingPrompt>>,
    next_id: AtomicU64,
}

impl WhatsAppAdapter {
    pub fn new(bridge_url: &str, events: mpsc::Sender<ChannelEvent>) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(64);
        Arc::new(Self {
            bridge_url: bridge_url.to_string(),
            events,
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            waiting: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Connect to the bridge and pump frames both ways, reconnecting on
    /// failure.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.clone().connect_once().await {
                Ok(()) => info!("whatsapp: bridge connection closed, reconnecting in 5s"),
                Err(e) => warn!("whatsapp: bridge error: {e}, reconnecting in 5s"),
            }
            let _ = self
                .events
                .send(ChannelEvent::Status {
                    channel: "whatsapp".to_string(),
                    status: "disconnected".to_string(),
                })
                .await;
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
    }

    async fn connect_once(self: Arc<Self>) -> anyhow::Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(&self.bridge_url).await?;
        let (mut sink, mut stream) = ws.split();
        info!(url = %self.bridge_url, "whatsapp: bridge connected");
        let _ = self
            .events
            .send(ChannelEvent::Status {
                channel: "whatsapp".to_string(),
                status: "connected".to_string(),
            })
            .await;

        // One task owns both halves so the outbound receiver survives
        // reconnects.
        let mut out_rx = self
            .out_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("bridge pump already running"))?;

        let result = loop {
            tokio::select! {
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                            if let Ok(frame) = serde_json::from_str::<BridgeFrame>(&text) {
                                self.dispatch(frame).await;
                            } else {
                                debug!("whatsapp: unparseable bridge frame");
                            }
                        }
                        Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => {
                            break Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(anyhow::anyhow!("bridge socket: {e}")),
                    }
                }
                outbound = out_rx.recv() => {
                    let Some(frame) = outbound else { break Ok(()) };
                    if let Err(e) = sink
                        .send(tokio_tungstenite::tungstenite::Message::Text(frame.to_string()))
                        .await
                    {
                        break Err(anyhow::anyhow!("bridge send: {e}"));
                    }
                }
            }
        };

        *self.out_rx.lock().await = Some(out_rx);
        result
    }

    async fn dispatch(&self, frame: BridgeFrame) {
        match frame {
            BridgeFrame::Sent { id, message_id } => {
                if let Some(tx) = self.waiting.lock().await.remove(&id) {
                    let _ = tx.send(message_id);
                }
            }
            BridgeFrame::Status { status } => {
                let _ = self
                    .events
                    .send(ChannelEvent::Status {
                        channel: "whatsapp".to_string(),
                        status,
                    })
                    .await;
            }
            BridgeFrame::Message(raw) => {
                self.dispatch_message(raw).await;
            }
        }
    }

    async fn dispatch_message(&self, raw: BridgeInbound) {
        let body = raw.body.trim().to_string();

        if let Some(command) = body.strip_prefix('/') {
            let bare = command.split_whitespace().next().unwrap_or(command);
            let _ = self
                .events
                .send(ChannelEvent::Command {
                    channel: "whatsapp".to_string(),
                    chat_id: raw.chat_id.clone(),
                    command: format!("/{bare}"),
                })
                .await;
            return;
        }

        // A short reply may answer a pending approval or question.
        if let Some(event) = self.try_answer_pending(&raw.chat_id, &body).await {
            let _ = self.events.send(event).await;
            return;
        }

        let inbound = InboundMessage {
            channel: "whatsapp".to_string(),
            chat_id: raw.chat_id,
            chat_type: raw.chat_type.unwrap_or_else(|| "dm".to_string()),
            sender_id: raw.sender_id.unwrap_or_default(),
            sender_name: raw.sender_name.unwrap_or_else(|| "unknown".to_string()),
            body,
            reply_to_id: raw.reply_to_id,
            reply_to_body: raw.reply_to_body,
            media_type: raw.media_type,
            media_path: raw.media_path,
            timestamp: raw.timestamp.unwrap_or(0),
        };
        let _ = self.events.send(ChannelEvent::Message(inbound)).await;
    }

    /// Interpret `body` as an answer to the chat's pending prompt, if any.
    /// Returns the event to emit and clears the pending entry on a match.
    async fn try_answer_pending(&self, chat_id: &str, body: &str) -> Option<ChannelEvent> {
        let mut pending = self.pending.lock().await;
        let prompt = pending.get(chat_id)?.clone();
        let lower = body.to_lowercase();

        let event = match prompt {
            PendingPrompt::Approval { request_id } => {
                if lower == "yes" || lower == "ok" || lower == "approve" || lower == "y" {
                    ChannelEvent::ApprovalResponse {
                        channel: "whatsapp".to_string(),
                        request_id,
                        approved: true,
                        reason: None,
                    }
                } else if lower == "no" || lower == "deny" || lower.starts_with("no ") {
                    let reason = body
                        .splitn(2, ' ')
                        .nth(1)
                        .map(|r| r.trim().to_string())
                        .filter(|r| !r.is_empty());
                    ChannelEvent::ApprovalResponse {
                        channel: "whatsapp".to_string(),
                        request_id,
                        approved: false,
                        reason,
                    }
                } else {
                    return None;
                }
            }
            PendingPrompt::Question {
                request_id,
                options,
            } => {
                let index = if let Ok(n) = lower.parse::<usize>() {
                    // 1-based numeric choice
                    n.checked_sub(1).filter(|i| *i < options.len())?
                } else {
                    options.iter().position(|o| o.to_lowercase() == lower)?
                };
                ChannelEvent::QuestionResponse {
                    channel: "whatsapp".to_string(),
                    request_id,
                    index,
                    label: options[index].clone(),
                }
            }
        };
        pending.remove(chat_id);
        Some(event)
    }

    async fn request_send(&self, chat_id: &str, text: &str) -> Result<String, ChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.insert(id, tx);

        self.out_tx
            .send(json!({"type": "send", "id": id, "chat_id": chat_id, "text": text}))
            .await
            .map_err(|_| ChannelError::NotConnected)?;

        match tokio::time::timeout(std::time::Duration::from_secs(10), rx).await {
            Ok(Ok(message_id)) => Ok(message_id),
            _ => {
                self.waiting.lock().await.remove(&id);
                Err(ChannelError::Transport("bridge send timed out".into()))
            }
        }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WhatsAppAdapter {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<SendReceipt, ChannelError> {
        let message_id = self.request_send(chat_id, text).await?;
        Ok(SendReceipt { message_id })
    }

    async fn edit(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.out_tx
            .send(json!({"type": "edit", "chat_id": chat_id,
                         "message_id": message_id, "text": text}))
            .await
            .map_err(|_| ChannelError::NotConnected)
    }

    async fn delete(&self, chat_id: &str, message_id: &str) -> Result<(), ChannelError> {
        self.out_tx
            .send(json!({"type": "delete", "chat_id": chat_id, "message_id": message_id}))
            .await
            .map_err(|_| ChannelError::NotConnected)
    }

    async fn typing(&self, chat_id: &str) -> Result<(), ChannelError> {
        self.out_tx
            .send(json!({"type": "typing", "chat_id": chat_id}))
            .await
            .map_err(|_| ChannelError::NotConnected)
    }

    async fn send_approval_request(&self, req: &ApprovalRequest) -> Result<(), ChannelError> {
        let text = format!(
            "🔐 Approval needed: {}\n{}\n\nReply *yes* to allow, or *no <reason>* to deny.",
            req.tool_name, req.summary
        );
        self.pending.lock().await.insert(
            req.chat_id.clone(),
            PendingPrompt::Approval {
                request_id: req.request_id.clone(),
            },
        );
        self.request_send(&req.chat_id, &text).await?;
        Ok(())
    }

    async fn send_question(&self, q: &QuestionRequest) -> Result<(), ChannelError> {
        let mut text = format!("{}\n", q.question);
        for (i, opt) in q.options.iter().enumerate() {
            text.push_str(&format!("{}. {opt}\n", i + 1));
        }
        text.push_str("\nReply with a number or an option.");
        self.pending.lock().await.insert(
            q.chat_id.clone(),
            PendingPrompt::Question {
                request_id: q.request_id.clone(),
                options: q.options.clone(),
            },
        );
        self.request_send(&q.chat_id, &text).await?;
        Ok(())
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeFrame {
    Sent { id: u64, message_id: String },
    Status { status: String },
    Message(BridgeInbound),
}

#[derive(Debug, Deserialize)]
struct BridgeInbound {
    chat_id: String,
    chat_type: Option<String>,
    sender_id: Option<String>,
    sender_name: Option<String>,
    body: String,
    reply_to_id: Option<String>,
    reply_to_body: Option<String>,
    media_type: Option<String>,
    media_path: Option<String>,
    timestamp: Option<i64>,
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> (Arc<WhatsAppAdapter>, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (WhatsAppAdapter::new("ws://127.0.0.1:1/ws", tx), rx)
    }

    fn inbound_frame(chat_id: &str, body: &str) -> BridgeInbound {
        BridgeInbound {
            chat_id: chat_id.to_string(),
            chat_type: None,
            sender_id: Some("15550001111".to_string()),
            sender_name: Some("alice".to_string()),
            body: body.to_string(),
            reply_to_id: None,
            reply_to_body: None,
            media_type: None,
            media_path: None,
            timestamp: Some(1_700_000_000_000),
        }
    }

    #[tokio::test]
    async fn plain_text_becomes_inbound_message() {
        let (a, mut rx) = adapter();
        a.dispatch_message(inbound_frame("c1", "hello")).await;
        match rx.recv().await.unwrap() {
            ChannelEvent::Message(m) => {
                assert_eq!(m.channel, "whatsapp");
                assert_eq!(m.chat_type, "dm");
                assert_eq!(m.body, "hello");
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn yes_reply_resolves_pending_approval() {
        let (a, mut rx) = adapter();
        a.pending.lock().await.insert(
            "c1".to_string(),
            PendingPrompt::Approval {
                request_id: "r-1".to_string(),
            },
        );
        a.dispatch_message(inbound_frame("c1", "yes")).await;
        match rx.recv().await.unwrap() {
            ChannelEvent::ApprovalResponse {
                request_id,
                approved,
                ..
            } => {
                assert_eq!(request_id, "r-1");
                assert!(approved);
            }
            other => panic!("expected ApprovalResponse, got {other:?}"),
        }
        assert!(a.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn no_reply_carries_reason() {
        let (a, mut rx) = adapter();
        a.pending.lock().await.insert(
            "c1".to_string(),
            PendingPrompt::Approval {
                request_id: "r-1".to_string(),
            },
        );
        a.dispatch_message(inbound_frame("c1", "no touching prod")).await;
        match rx.recv().await.unwrap() {
            ChannelEvent::ApprovalResponse {
                approved, reason, ..
            } => {
                assert!(!approved);
                assert_eq!(reason.as_deref(), Some("touching prod"));
            }
            other => panic!("expected ApprovalResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unrelated_text_with_pending_approval_flows_through() {
        let (a, mut rx) = adapter();
        a.pending.lock().await.insert(
            "c1".to_string(),
            PendingPrompt::Approval {
                request_id: "r-1".to_string(),
            },
        );
        a.dispatch_message(inbound_frame("c1", "by the way, also check the logs"))
            .await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelEvent::Message(_)
        ));
        // Pending survives for the real answer.
        assert!(!a.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn numeric_reply_resolves_pending_question() {
        let (a, mut rx) = adapter();
        a.pending.lock().await.insert(
            "c1".to_string(),
            PendingPrompt::Question {
                request_id: "q-1".to_string(),
                options: vec!["red".to_string(), "green".to_string()],
            },
        );
        a.dispatch_message(inbound_frame("c1", "2")).await;
        match rx.recv().await.unwrap() {
            ChannelEvent::QuestionResponse { index, label, .. } => {
                assert_eq!(index, 1);
                assert_eq!(label, "green");
            }
            other => panic!("expected QuestionResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn label_reply_is_case_insensitive() {
        let (a, mut rx) = adapter();
        a.pending.lock().await.insert(
            "c1".to_string(),
            PendingPrompt::Question {
                request_id: "q-1".to_string(),
                options: vec!["Red".to_string(), "Green".to_string()],
            },
        );
        a.dispatch_message(inbound_frame("c1", "green")).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelEvent::QuestionResponse { index: 1, .. }
        ));
    }

    #[tokio::test]
    async fn out_of_range_number_flows_through_as_message() {
        let (a, mut rx) = adapter();
        a.pending.lock().await.insert(
            "c1".to_string(),
            PendingPrompt::Question {
                request_id: "q-1".to_string(),
                options: vec!["red".to_string()],
            },
        );
        a.dispatch_message(inbound_frame("c1", "7")).await;
        assert!(matches!(rx.recv().await.unwrap(), ChannelEvent::Message(_)));
    }

    #[tokio::test]
    async fn slash_text_becomes_command() {
        let (a, mut rx) = adapter();
        a.dispatch_message(inbound_frame("c1", "/cancel")).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelEvent::Command { command, .. } if command == "/cancel"
        ));
    }
}
