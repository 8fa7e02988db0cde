// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The streaming loop — drives one agent run from start to termination.
//!
//! One invocation owns the provider message stream and is the only writer
//! of the session's snapshot and channel status message for its duration.
//! Each provider message is classified, folded into the snapshot, persisted
//! and broadcast through the fan-out, and (for channel runs) reflected in
//! the live status message.
//!
//! A run may span several *turns*: after a `result` the provider can keep
//! the conversation open (`RunHandle::active`), in which case injected
//! inputs produce further turns inside the same run task.
//!
//! Every exit path funnels through one cleanup block: live handle released,
//! snapshot removed, active-run cleared, status message resolved, final
//! `status.update` broadcast.  Errors inside fan-out or persistence are
//! absorbed there and never terminate the run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use courier_provider::{ProviderError, ProviderMessage, RunHandle, RunRequest, ToolGate};

use crate::context::GatewayContext;
use crate::events::{
    GatewayEvent, EV_ERROR, EV_MESSAGE, EV_REAUTH_REQUIRED, EV_RESULT, EV_STATUS_UPDATE,
    EV_STREAM, EV_TOOL_RESULT, EV_TOOL_USE,
};
use crate::mediator::{strip_provider_prefix, ToolMediator};
use crate::queue::RunTask;
use crate::reauth::StashedPrompt;
use crate::registry::SessionKey;
use crate::snapshot::{CompletedTool, CurrentTool, SnapshotStatus};
use crate::status::{tool_detail, StatusDriver};

/// Per-turn scratch state.
struct TurnState {
    open: bool,
    /// Block index → in-flight tool authoring state.
    blocks: HashMap<u64, ToolBlock>,
    /// tool_use_id → (name, detail), for snapshot completion.
    tools_by_id: HashMap<String, (String, String)>,
    /// tool_use_ids belonging to the `Task` tool: their results are
    /// re-attributed to top level (parent = null).
    task_tool_ids: HashSet<String>,
    /// The agent messaged the chat itself; skip the automatic final reply.
    message_tool_used: bool,
}

struct ToolBlock {
    id: String,
    name: String,
    partial_json: String,
}

impl TurnState {
    fn new() -> Self {
        Self {
            open: true,
            blocks: HashMap::new(),
            tools_by_id: HashMap::new(),
            task_tool_ids: HashSet::new(),
            message_tool_used: false,
        }
    }
}

enum Outcome {
    Continue,
    TurnComplete { final_text: Option<String> },
}

/// Drive one run task to termination.
pub async fn run_streaming_loop(
    ctx: Arc<GatewayContext>,
    task: RunTask,
    mut cancel_rx: oneshot::Receiver<()>,
    live_slot: Arc<Mutex<Option<RunHandle>>>,
) {
    let key = task.session_key.clone();
    let key_str = key.to_string();
    info!(session_key = %key_str, "run starting");

    ctx.registry.set_active_run(&key, true).await;
    publish_status(&ctx, &key_str, true).await;
    ctx.snapshots.create(&key_str).await;

    let mediator = ToolMediator::new(ctx.clone(), key.clone(), task.channel.clone());
    let gate: Arc<dyn ToolGate> = mediator;

    let mut status = start_status_driver(&ctx, &task).await;

    // ── Provider start, with one resume-stale retry ──────────────────────────
    let resume = ctx
        .registry
        .get(&key)
        .await
        .and_then(|s| s.provider_resume_id);
    let request = RunRequest {
        prompt: task.prompt.clone(),
        resume_id: resume.clone(),
        model: None,
        extra_context: task.extra_context.clone(),
    };

    let run = match ctx.provider.start(request.clone(), gate.clone()).await {
        Ok(run) => Some(run),
        Err(ProviderError::ResumeStale) if resume.is_some() => {
            warn!(session_key = %key_str, "resume token stale, retrying with a fresh start");
            ctx.registry.set_provider_resume_id(&key, None).await;
            let fresh = RunRequest {
                resume_id: None,
                ..request
            };
            match ctx.provider.start(fresh, gate.clone()).await {
                Ok(run) => Some(run),
                Err(e) => {
                    publish_run_error(&ctx, &key_str, &e).await;
                    None
                }
            }
        }
        Err(ProviderError::AuthRequired) => {
            start_reauth(&ctx, &task).await;
            // Leave the placeholder until the user retries.
            if let Some(driver) = status.take() {
                driver.suspend();
            }
            cleanup(&ctx, &key, None).await;
            return;
        }
        Err(e) => {
            publish_run_error(&ctx, &key_str, &e).await;
            None
        }
    };

    let Some(mut run) = run else {
        cleanup(&ctx, &key, status.take()).await;
        return;
    };
    *live_slot.lock().await = Some(run.handle.clone());

    // ── Message loop ─────────────────────────────────────────────────────────
    let mut turn = TurnState::new();
    let mut auth_failed = false;

    loop {
        tokio::select! {
            biased;
            _ = &mut cancel_rx => {
                info!(session_key = %key_str, "run aborted");
                run.handle.interrupt();
                run.handle.close();
                ctx.bus
                    .publish(GatewayEvent::keyed(
                        EV_RESULT,
                        key_str.clone(),
                        json!({"subtype": "aborted"}),
                    ))
                    .await;
                break;
            }
            msg = run.messages.recv() => {
                let msg = match msg {
                    None => break,
                    Some(Err(ProviderError::AuthRequired)) => {
                        start_reauth(&ctx, &task).await;
                        auth_failed = true;
                        break;
                    }
                    Some(Err(e)) => {
                        publish_run_error(&ctx, &key_str, &e).await;
                        break;
                    }
                    Some(Ok(msg)) => msg,
                };

                // A message after a completed turn opens the next one.
                if !turn.open {
                    turn = TurnState::new();
                    ctx.snapshots.create(&key_str).await;
                    ctx.registry.set_active_run(&key, true).await;
                    publish_status(&ctx, &key_str, true).await;
                    if status.is_none() {
                        status = start_status_driver(&ctx, &task).await;
                    }
                }

                match handle_message(&ctx, &key, &mut turn, &mut status, msg).await {
                    Outcome::Continue => {}
                    Outcome::TurnComplete { final_text } => {
                        ctx.registry.set_active_run(&key, false).await;
                        publish_status(&ctx, &key_str, false).await;
                        ctx.snapshots.remove(&key_str).await;
                        if let Some(driver) = status.take() {
                            let reply = if turn.message_tool_used {
                                None
                            } else {
                                final_text.as_deref()
                            };
                            driver.finish(reply).await;
                        }
                        if run.handle.active() {
                            // Keep the run open for injected turns.
                            turn.open = false;
                        } else {
                            break;
                        }
                    }
                }
            }
        }
    }

    if auth_failed {
        if let Some(driver) = status.take() {
            driver.suspend();
        }
    }
    *live_slot.lock().await = None;
    cleanup(&ctx, &key, status.take()).await;
    info!(session_key = %key_str, "run terminated");
}

/// The single cleanup point: snapshot, active-run flag, leftover status
/// message, final status broadcast.
async fn cleanup(ctx: &Arc<GatewayContext>, key: &SessionKey, status: Option<StatusDriver>) {
    let key_str = key.to_string();
    ctx.snapshots.remove(&key_str).await;
    ctx.registry.set_active_run(key, false).await;
    if let Some(driver) = status {
        driver.finish(None).await;
    }
    publish_status(ctx, &key_str, false).await;
}

async fn publish_status(ctx: &Arc<GatewayContext>, key_str: &str, active: bool) {
    ctx.bus
        .publish(GatewayEvent::global(
            EV_STATUS_UPDATE,
            json!({"sessionKey": key_str, "activeRun": active}),
        ))
        .await;
}

async fn publish_run_error(ctx: &Arc<GatewayContext>, key_str: &str, err: &ProviderError) {
    warn!(session_key = %key_str, "provider error: {err}");
    ctx.bus
        .publish(GatewayEvent::keyed(
            EV_ERROR,
            key_str.to_string(),
            json!({"message": err.to_string()}),
        ))
        .await;
}

async fn start_status_driver(
    ctx: &Arc<GatewayContext>,
    task: &RunTask,
) -> Option<StatusDriver> {
    let meta = task.channel.as_ref()?;
    let adapter = ctx.adapter(&meta.channel)?;
    Some(StatusDriver::start(adapter, &meta.chat_id).await)
}

/// Begin the OAuth re-auth flow: broadcast the URL, tell the chat, stash
/// the prompt for re-dispatch once a code arrives.
async fn start_reauth(ctx: &Arc<GatewayContext>, task: &RunTask) {
    let url = match ctx.provider.auth_url() {
        Ok(url) => url,
        Err(e) => {
            publish_run_error(
                ctx,
                &task.session_key.to_string(),
                &ProviderError::Other(format!("re-auth unavailable: {e}")),
            )
            .await;
            return;
        }
    };

    info!(session_key = %task.session_key, "authentication required, starting re-auth flow");
    ctx.bus
        .publish(GatewayEvent::global(
            EV_REAUTH_REQUIRED,
            json!({"url": url, "sessionKey": task.session_key.to_string()}),
        ))
        .await;

    if let Some(meta) = &task.channel {
        if let Some(adapter) = ctx.adapter(&meta.channel) {
            let text = format!(
                "🔑 I need you to sign in again:\n{url}\n\nPaste the code here when done, or /cancel."
            );
            if let Err(e) = adapter.send(&meta.chat_id, &text).await {
                debug!("re-auth channel notice failed: {e}");
            }
        }
        ctx.reauth
            .stash(
                &meta.channel,
                &meta.chat_id,
                StashedPrompt {
                    session_key: task.session_key.clone(),
                    prompt: task.prompt.clone(),
                    channel: task.channel.clone(),
                },
            )
            .await;
    }
}

// ── Message classification ────────────────────────────────────────────────────

async fn handle_message(
    ctx: &Arc<GatewayContext>,
    key: &SessionKey,
    turn: &mut TurnState,
    status: &mut Option<StatusDriver>,
    msg: ProviderMessage,
) -> Outcome {
    let key_str = key.to_string();
    match msg {
        ProviderMessage::Init { session_id, raw } => {
            ctx.registry
                .set_provider_resume_id(key, Some(session_id))
                .await;
            ctx.bus
                .publish(GatewayEvent::keyed(EV_STREAM, key_str, raw))
                .await;
            Outcome::Continue
        }

        ProviderMessage::Stream { raw } => {
            handle_stream_event(ctx, &key_str, turn, status, &raw).await;
            Outcome::Continue
        }

        ProviderMessage::Assistant { raw } => {
            // Remember Task-tool ids for sub-agent attribution.
            if let Some(blocks) = raw
                .pointer("/message/content")
                .and_then(|c| c.as_array())
            {
                for block in blocks {
                    if block.get("type").and_then(|t| t.as_str()) == Some("tool_use")
                        && block.get("name").and_then(|n| n.as_str()) == Some("Task")
                    {
                        if let Some(id) = block.get("id").and_then(|i| i.as_str()) {
                            turn.task_tool_ids.insert(id.to_string());
                        }
                    }
                }
            }
            ctx.bus
                .publish(GatewayEvent::keyed(EV_MESSAGE, key_str, raw))
                .await;
            Outcome::Continue
        }

        ProviderMessage::User { raw } => {
            handle_tool_results(ctx, &key_str, turn, &raw).await;
            Outcome::Continue
        }

        ProviderMessage::Result { raw } => {
            let final_text = raw
                .get("result")
                .and_then(|r| r.as_str())
                .map(str::to_string);
            ctx.bus
                .publish(GatewayEvent::keyed(EV_RESULT, key_str, raw))
                .await;
            Outcome::TurnComplete { final_text }
        }
    }
}

async fn handle_stream_event(
    ctx: &Arc<GatewayContext>,
    key_str: &str,
    turn: &mut TurnState,
    status: &mut Option<StatusDriver>,
    raw: &Value,
) {
    let event = raw.get("event").cloned().unwrap_or(Value::Null);
    let index = event.get("index").and_then(|i| i.as_u64()).unwrap_or(0);

    // A completed tool block is derived below; publish the raw tick first
    // so subscribers see the stream verbatim and in order.
    ctx.bus
        .publish(GatewayEvent::keyed(
            EV_STREAM,
            key_str.to_string(),
            raw.clone(),
        ))
        .await;

    match event.get("type").and_then(|t| t.as_str()) {
        Some("content_block_start") => {
            let block = event.get("content_block").cloned().unwrap_or(Value::Null);
            match block.get("type").and_then(|t| t.as_str()) {
                Some("tool_use") => {
                    let id = block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let bare = strip_provider_prefix(&name).to_string();
                    if bare == "Task" {
                        turn.task_tool_ids.insert(id.clone());
                    }
                    if bare == "message" {
                        turn.message_tool_used = true;
                    }
                    ctx.snapshots
                        .update(key_str, |s| {
                            s.status = SnapshotStatus::ToolUse;
                            s.current_tool = Some(CurrentTool {
                                tool_use_id: id.clone(),
                                name: bare.clone(),
                                partial_input: String::new(),
                                detail: String::new(),
                            });
                        })
                        .await;
                    if let Some(driver) = status.as_mut() {
                        driver.on_tool_start(&bare).await;
                    }
                    turn.blocks.insert(
                        index,
                        ToolBlock {
                            id,
                            name: bare,
                            partial_json: String::new(),
                        },
                    );
                }
                Some("text") => {
                    ctx.snapshots
                        .update(key_str, |s| s.status = SnapshotStatus::Responding)
                        .await;
                }
                _ => {}
            }
        }

        Some("content_block_delta") => {
            let delta = event.get("delta").cloned().unwrap_or(Value::Null);
            match delta.get("type").and_then(|t| t.as_str()) {
                Some("text_delta") => {
                    if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                        let text = text.to_string();
                        ctx.snapshots
                            .update(key_str, |s| s.text.push_str(&text))
                            .await;
                    }
                }
                Some("input_json_delta") => {
                    if let Some(chunk) = delta.get("partial_json").and_then(|p| p.as_str()) {
                        if let Some(block) = turn.blocks.get_mut(&index) {
                            block.partial_json.push_str(chunk);
                        }
                        let chunk = chunk.to_string();
                        ctx.snapshots
                            .update(key_str, |s| {
                                if let Some(tool) = s.current_tool.as_mut() {
                                    tool.partial_input.push_str(&chunk);
                                }
                            })
                            .await;
                    }
                }
                _ => {}
            }
        }

        Some("content_block_stop") => {
            if let Some(block) = turn.blocks.remove(&index) {
                // Malformed (never-completed) input degrades to an empty
                // detail; the run keeps going.
                let input: Value =
                    serde_json::from_str(&block.partial_json).unwrap_or(Value::Null);
                let detail = tool_detail(&block.name, &input);
                turn.tools_by_id
                    .insert(block.id.clone(), (block.name.clone(), detail.clone()));
                ctx.snapshots
                    .update(key_str, |s| {
                        if let Some(tool) = s.current_tool.as_mut() {
                            tool.detail = detail.clone();
                        }
                    })
                    .await;
                if let Some(driver) = status.as_mut() {
                    driver.on_tool_detail(&detail).await;
                }
                ctx.bus
                    .publish(GatewayEvent::keyed(
                        EV_TOOL_USE,
                        key_str.to_string(),
                        json!({
                            "toolUseId": block.id,
                            "toolName": block.name,
                            "input": input,
                            "detail": detail,
                        }),
                    ))
                    .await;
            }
        }

        _ => {}
    }
}

async fn handle_tool_results(
    ctx: &Arc<GatewayContext>,
    key_str: &str,
    turn: &mut TurnState,
    raw: &Value,
) {
    let parent = raw
        .get("parent_tool_use_id")
        .and_then(|p| p.as_str())
        .map(str::to_string);
    let blocks = raw
        .pointer("/message/content")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    for block in blocks {
        if block.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
            continue;
        }
        let tool_use_id = block
            .get("tool_use_id")
            .and_then(|i| i.as_str())
            .unwrap_or_default()
            .to_string();
        let is_error = block
            .get("is_error")
            .and_then(|e| e.as_bool())
            .unwrap_or(false);

        // Task-tool results are top-level even when the provider tags them
        // with a sub-agent parent.
        let attributed_parent = if turn.task_tool_ids.contains(&tool_use_id) {
            None
        } else {
            parent.clone()
        };

        if let Some((name, detail)) = turn.tools_by_id.get(&tool_use_id).cloned() {
            ctx.snapshots
                .update(key_str, |s| {
                    if s.current_tool
                        .as_ref()
                        .map(|t| t.tool_use_id == tool_use_id)
                        .unwrap_or(false)
                    {
                        s.current_tool = None;
                    }
                    s.completed_tools.push(CompletedTool {
                        tool_use_id: tool_use_id.clone(),
                        name,
                        detail,
                        is_error,
                    });
                })
                .await;
        }

        ctx.bus
            .publish(GatewayEvent::keyed(
                EV_TOOL_RESULT,
                key_str.to_string(),
                json!({
                    "toolUseId": tool_use_id,
                    "content": block.get("content").cloned().unwrap_or(Value::Null),
                    "isError": is_error,
                    "parentToolUseId": attributed_parent,
                }),
            ))
            .await;
    }
}
