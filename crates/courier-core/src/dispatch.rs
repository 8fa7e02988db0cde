// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Inbound routing — every prompt enters the gateway here.
//!
//! Channel messages and RPC `chat.send` calls resolve to a session key,
//! pass the idle-timeout check, emit `agent.user_message`, and then either
//! inject into the key's live run or land on its FIFO.  Channel commands,
//! approval/question callbacks, and the OAuth code intercept are routed to
//! the structures that wait on them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_channels::{frame_incoming_message, ChannelEvent, InboundMessage};

use crate::calendar::CalendarEntry;
use crate::context::{ChannelMeta, GatewayContext};
use crate::events::{
    GatewayEvent, EV_CHANNEL_MESSAGE, EV_CHANNEL_STATUS, EV_USER_MESSAGE,
};
use crate::pending::{ApprovalVerdict, PendingError};
use crate::queue::{RunQueues, RunTask};
use crate::registry::SessionKey;

/// PKCE code exchange deadline.
const OAUTH_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(120);

pub struct Dispatcher {
    ctx: Arc<GatewayContext>,
    queues: Arc<RunQueues>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<GatewayContext>) -> Arc<Self> {
        let queues = RunQueues::new(ctx.clone());
        Arc::new(Self { ctx, queues })
    }

    pub fn ctx(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    pub fn queues(&self) -> &Arc<RunQueues> {
        &self.queues
    }

    // ── RPC entry points ─────────────────────────────────────────────────────

    /// `chat.send` — desktop prompt.  Without a chat id a fresh task scope
    /// is minted so every ad-hoc prompt gets its own session key.
    pub async fn chat_send(&self, prompt: &str, chat_id: Option<&str>) -> Value {
        let chat_id = match chat_id {
            Some(id) => id.to_string(),
            None => format!(
                "task-{}-{}",
                Utc::now().timestamp_millis(),
                &Uuid::new_v4().to_string()[..8]
            ),
        };
        let key = SessionKey::dm("desktop", chat_id);
        let session = self.dispatch_prompt(&key, prompt, None).await;
        json!({
            "sessionKey": key.to_string(),
            "sessionId": session_id_of(&session),
            "queued": true,
        })
    }

    pub async fn tool_approve(
        &self,
        request_id: &str,
        updated_input: Option<Value>,
    ) -> Result<(), PendingError> {
        self.ctx
            .pending
            .resolve_approval(
                request_id,
                ApprovalVerdict {
                    approved: true,
                    reason: None,
                    updated_input,
                },
            )
            .await
    }

    pub async fn tool_deny(
        &self,
        request_id: &str,
        reason: Option<String>,
    ) -> Result<(), PendingError> {
        self.ctx
            .pending
            .resolve_approval(
                request_id,
                ApprovalVerdict {
                    approved: false,
                    reason,
                    updated_input: None,
                },
            )
            .await
    }

    /// `chat.answerQuestion` — answers keyed by question text.
    pub async fn answer_question(
        &self,
        request_id: &str,
        answers: std::collections::HashMap<String, String>,
    ) -> Result<(), PendingError> {
        self.ctx.pending.resolve_question(request_id, answers).await
    }

    /// `agent.abort` — cancel the key's executing run.
    pub async fn abort(&self, key: &SessionKey) -> bool {
        self.queues.abort(key).await
    }

    /// Calendar firing: the prompt runs on the entry's own session key.
    pub async fn dispatch_calendar(&self, entry: &CalendarEntry) {
        let key = SessionKey::dm("calendar", entry.id.clone());
        self.dispatch_prompt(&key, &entry.prompt, None).await;
    }

    // ── Channel inbound ──────────────────────────────────────────────────────

    /// Pump adapter events forever; spawned once per gateway.
    pub async fn run_channel_pump(self: Arc<Self>, mut rx: mpsc::Receiver<ChannelEvent>) {
        while let Some(event) = rx.recv().await {
            self.on_channel_event(event).await;
        }
    }

    pub async fn on_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(msg) => self.on_channel_message(msg).await,
            ChannelEvent::Command {
                channel,
                chat_id,
                command,
            } => self.on_channel_command(&channel, &chat_id, &command).await,
            ChannelEvent::ApprovalResponse {
                request_id,
                approved,
                reason,
                ..
            } => {
                let verdict = ApprovalVerdict {
                    approved,
                    reason,
                    updated_input: None,
                };
                if let Err(e) = self
                    .ctx
                    .pending
                    .resolve_approval(&request_id, verdict)
                    .await
                {
                    debug!("channel approval response ignored: {e}");
                }
            }
            ChannelEvent::QuestionResponse {
                request_id,
                index,
                label,
                ..
            } => {
                let label = (!label.is_empty()).then_some(label);
                if let Err(e) = self
                    .ctx
                    .pending
                    .resolve_channel_question(&request_id, index, label)
                    .await
                {
                    debug!("channel question response ignored: {e}");
                }
            }
            ChannelEvent::Status { channel, status } => {
                info!(channel, status, "channel transport status");
                self.ctx
                    .bus
                    .publish(GatewayEvent::global(
                        EV_CHANNEL_STATUS,
                        json!({"channel": channel, "status": status}),
                    ))
                    .await;
            }
        }
    }

    async fn on_channel_message(&self, msg: InboundMessage) {
        if !self.channel_allows(&msg).await {
            debug!(
                channel = %msg.channel,
                chat_id = %msg.chat_id,
                "dropping message from non-owner chat"
            );
            return;
        }

        // A pending re-auth intercepts code-looking replies.
        if let Some((code, stashed)) = self
            .ctx
            .reauth
            .take_if_code(&msg.channel, &msg.chat_id, &msg.body)
            .await
        {
            self.exchange_and_redispatch(&msg, code, stashed).await;
            return;
        }

        self.ctx
            .bus
            .publish(GatewayEvent::global(
                EV_CHANNEL_MESSAGE,
                serde_json::to_value(&msg).unwrap_or(Value::Null),
            ))
            .await;

        let key = SessionKey::new(&msg.channel, &msg.chat_type, &msg.chat_id);
        self.ctx
            .registry
            .set_sender_name(&key, Some(msg.sender_name.clone()))
            .await;

        let prompt = frame_incoming_message(&msg);
        let meta = ChannelMeta {
            channel: msg.channel.clone(),
            chat_id: msg.chat_id.clone(),
        };
        self.dispatch_prompt(&key, &prompt, Some(meta)).await;
    }

    async fn channel_allows(&self, msg: &InboundMessage) -> bool {
        let owner_only = {
            let config = self.ctx.config.read().await;
            match msg.channel.as_str() {
                "telegram" => config
                    .channels
                    .telegram
                    .as_ref()
                    .map(|t| t.owner_only)
                    .unwrap_or(true),
                "whatsapp" => config
                    .channels
                    .whatsapp
                    .as_ref()
                    .map(|w| w.owner_only)
                    .unwrap_or(true),
                _ => false,
            }
        };
        if !owner_only {
            return true;
        }
        self.ctx
            .owners
            .check_or_claim(&msg.channel, &msg.chat_id, &msg.chat_type)
            .await
    }

    async fn on_channel_command(&self, channel: &str, chat_id: &str, command: &str) {
        let key = SessionKey::dm(channel, chat_id);
        let reply = match command {
            "/cancel" => {
                if self.ctx.reauth.clear(channel, chat_id).await {
                    "Sign-in cancelled.".to_string()
                } else if self.queues.abort(&key).await {
                    "Run aborted.".to_string()
                } else {
                    "Nothing to cancel.".to_string()
                }
            }
            "/reset" => match self.ctx.registry.reset(&key).await {
                Some(_) => "Session reset — starting fresh.".to_string(),
                None => "No session to reset.".to_string(),
            },
            "/status" => match self.ctx.registry.get(&key).await {
                Some(session) => format!(
                    "Session {} — {} message(s), {}",
                    &session.session_id[..8.min(session.session_id.len())],
                    session.message_count,
                    if session.active_run {
                        "run in progress"
                    } else {
                        "idle"
                    }
                ),
                None => "No session yet.".to_string(),
            },
            other => {
                debug!(command = other, "unknown channel command");
                return;
            }
        };
        if let Some(adapter) = self.ctx.adapter(channel) {
            if let Err(e) = adapter.send(chat_id, &reply).await {
                debug!("command reply failed: {e}");
            }
        }
    }

    async fn exchange_and_redispatch(
        &self,
        msg: &InboundMessage,
        code: String,
        stashed: crate::reauth::StashedPrompt,
    ) {
        info!(channel = %msg.channel, "OAuth code received, exchanging");
        let exchange = tokio::time::timeout(
            OAUTH_EXCHANGE_TIMEOUT,
            self.ctx.provider.exchange_code(&code),
        )
        .await;

        let adapter = self.ctx.adapter(&msg.channel);
        match exchange {
            Ok(Ok(())) => {
                if let Some(adapter) = &adapter {
                    let _ = adapter
                        .send(&msg.chat_id, "✅ Signed in — picking up where we left off.")
                        .await;
                }
                self.dispatch_prompt(
                    &stashed.session_key,
                    &stashed.prompt,
                    stashed.channel.clone(),
                )
                .await;
            }
            Ok(Err(e)) => {
                warn!("OAuth exchange failed: {e}");
                // Keep the prompt parked for another try.
                self.ctx
                    .reauth
                    .stash(&msg.channel, &msg.chat_id, stashed)
                    .await;
                if let Some(adapter) = &adapter {
                    let _ = adapter
                        .send(
                            &msg.chat_id,
                            "❌ That code did not work — paste it again, or /cancel.",
                        )
                        .await;
                }
            }
            Err(_) => {
                warn!("OAuth exchange timed out");
                self.ctx
                    .reauth
                    .stash(&msg.channel, &msg.chat_id, stashed)
                    .await;
                if let Some(adapter) = &adapter {
                    let _ = adapter
                        .send(&msg.chat_id, "❌ Sign-in timed out — paste the code again.")
                        .await;
                }
            }
        }
    }

    // ── The common path ──────────────────────────────────────────────────────

    /// Resolve the session (with idle reset), emit `agent.user_message`,
    /// then inject into the live run or enqueue.
    async fn dispatch_prompt(
        &self,
        key: &SessionKey,
        prompt: &str,
        channel: Option<ChannelMeta>,
    ) -> Value {
        let session = self.ctx.registry.get_or_create(key).await;
        self.ctx.registry.increment_messages(key).await;

        let live = self.queues.live_handle(key).await;
        match live {
            Some(handle) => {
                // Mid-run injection: the user message joins the open
                // conversation instead of queueing a new run.
                self.ctx
                    .bus
                    .publish(GatewayEvent::keyed(
                        EV_USER_MESSAGE,
                        key.to_string(),
                        json!({"text": prompt, "injected": true}),
                    ))
                    .await;
                self.ctx.registry.set_active_run(key, true).await;
                if let Err(e) = handle.inject(prompt) {
                    warn!(session_key = %key, "injection failed, queueing instead: {e}");
                    self.enqueue(key, prompt, channel).await;
                } else {
                    info!(session_key = %key, "prompt injected into live run");
                }
            }
            None => {
                self.ctx
                    .bus
                    .publish(GatewayEvent::keyed(
                        EV_USER_MESSAGE,
                        key.to_string(),
                        json!({"text": prompt, "injected": false}),
                    ))
                    .await;
                self.enqueue(key, prompt, channel).await;
            }
        }
        session.to_json()
    }

    async fn enqueue(&self, key: &SessionKey, prompt: &str, channel: Option<ChannelMeta>) {
        self.queues
            .enqueue(RunTask {
                session_key: key.clone(),
                prompt: prompt.to_string(),
                channel,
                extra_context: None,
            })
            .await;
    }
}

fn session_id_of(session_json: &Value) -> String {
    session_json
        .get("sessionId")
        .and_then(|s| s.as_str())
        .unwrap_or_default()
        .to_string()
}

// ── Scenario tests ────────────────────────────────────────────────────────────
