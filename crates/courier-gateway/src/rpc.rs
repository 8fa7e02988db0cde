// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! RPC dispatch — the method table over the subscriber transport.
//!
//! Requests are `{id, method, params}`; the table routes by method name
//! and returns `{id, result}` or `{id, error}`.  Validation failures
//! produce an error with no side effects.  Handlers are idempotent where
//! their side effects allow (`sessions.unsubscribe` on an unknown key is
//! a success, `calendar.remove` of a missing id reports `removed: false`).

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};

use courier_core::fanout::SubscriberShared;
use courier_core::registry::SessionKey;
use courier_core::Dispatcher;

use crate::fswatch::{self, WatchRegistry};

pub struct RpcState {
    pub dispatcher: Arc<Dispatcher>,
    pub watches: Arc<WatchRegistry>,
}

/// Per-connection bookkeeping the RPC layer mutates.
#[derive(Default)]
pub struct ClientState {
    /// Watch refs owned by this connection, released on disconnect.
    pub watch_refs: Vec<PathBuf>,
}

pub async fn dispatch(
    state: &RpcState,
    sub: &Arc<SubscriberShared>,
    client: &mut ClientState,
    method: &str,
    params: &Value,
) -> Result<Value, String> {
    let ctx = state.dispatcher.ctx();
    match method {
        // ── Subscriptions ────────────────────────────────────────────────────
        "sessions.subscribe" => {
            let keys = str_vec(params, "keys")?;
            let last_seq = params.get("lastSeq").and_then(|v| v.as_i64());
            let replayed = ctx
                .bus
                .subscribe(sub, &keys, last_seq)
                .await
                .map_err(|e| format!("replay failed: {e}"))?;
            Ok(json!({"replayed": replayed}))
        }
        "sessions.unsubscribe" => {
            let keys = str_vec(params, "keys")?;
            ctx.bus.unsubscribe(sub, &keys).await;
            Ok(json!({"ok": true}))
        }

        // ── Sessions ─────────────────────────────────────────────────────────
        "sessions.list" => {
            let sessions: Vec<Value> = ctx
                .registry
                .list()
                .await
                .iter()
                .map(|s| s.to_json())
                .collect();
            Ok(json!({"sessions": sessions}))
        }
        "sessions.get" => {
            let key = session_key(params)?;
            match ctx.registry.get(&key).await {
                Some(session) => Ok(session.to_json()),
                None => Err(format!("session not found: {key}")),
            }
        }
        "sessions.delete" => {
            let key = session_key(params)?;
            ctx.registry.remove(&key).await;
            Ok(json!({"ok": true}))
        }
        "sessions.reset" => {
            let key = session_key(params)?;
            match ctx.registry.reset(&key).await {
                Some(session) => Ok(session.to_json()),
                None => Err(format!("session not found: {key}")),
            }
        }
        "sessions.resume" => {
            let key = session_key(params)?;
            let resume_id = require_str(params, "resumeId")?;
            ctx.registry
                .set_provider_resume_id(&key, Some(resume_id.to_string()))
                .await;
            Ok(json!({"ok": true}))
        }

        // ── Chat ─────────────────────────────────────────────────────────────
        "chat.send" => {
            let prompt = require_str(params, "prompt")?;
            let chat_id = params.get("chatId").and_then(|v| v.as_str());
            Ok(state.dispatcher.chat_send(prompt, chat_id).await)
        }
        "chat.answerQuestion" => {
            let request_id = require_str(params, "requestId")?;
            let answers: std::collections::HashMap<String, String> = params
                .get("answers")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .ok_or("missing or malformed param: answers")?;
            state
                .dispatcher
                .answer_question(request_id, answers)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({"ok": true}))
        }
        "chat.history" => {
            let keys = str_vec(params, "keys").or_else(|_| {
                require_str(params, "key").map(|k| vec![k.to_string()])
            })?;
            let after_seq = params.get("afterSeq").and_then(|v| v.as_i64()).unwrap_or(0);
            let events = ctx
                .store
                .query(&keys, after_seq)
                .map_err(|e| format!("history query failed: {e}"))?;
            let events: Vec<Value> = events
                .iter()
                .map(|e| {
                    json!({
                        "seq": e.seq,
                        "sessionKey": e.session_key,
                        "event": e.event_type,
                        "data": e.payload,
                        "createdAt": e.created_at,
                    })
                })
                .collect();
            Ok(json!({"events": events}))
        }

        // ── Agent control ────────────────────────────────────────────────────
        "agent.abort" => {
            let key = session_key(params)?;
            let aborted = state.dispatcher.abort(&key).await;
            Ok(json!({"aborted": aborted}))
        }
        "agent.interrupt" => {
            let key = session_key(params)?;
            match state.dispatcher.queues().live_handle(&key).await {
                Some(handle) => {
                    handle.interrupt();
                    Ok(json!({"ok": true}))
                }
                None => Err(format!("no live run on {key}")),
            }
        }
        "agent.setModel" => {
            let key = session_key(params)?;
            let model = require_str(params, "model")?;
            match state.dispatcher.queues().live_handle(&key).await {
                Some(handle) => {
                    handle.set_model(model);
                    Ok(json!({"ok": true}))
                }
                None => Err(format!("no live run on {key}")),
            }
        }
        "agent.stopTask" => {
            let key = session_key(params)?;
            let task_id = require_str(params, "taskId")?;
            match state.dispatcher.queues().live_handle(&key).await {
                Some(handle) => {
                    handle.stop_task(task_id);
                    Ok(json!({"ok": true}))
                }
                None => Err(format!("no live run on {key}")),
            }
        }

        // ── Tool approvals ───────────────────────────────────────────────────
        "tool.approve" => {
            let request_id = require_str(params, "requestId")?;
            let updated_input = params.get("updatedInput").cloned();
            state
                .dispatcher
                .tool_approve(request_id, updated_input)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({"ok": true}))
        }
        "tool.deny" => {
            let request_id = require_str(params, "requestId")?;
            let reason = params
                .get("reason")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            state
                .dispatcher
                .tool_deny(request_id, reason)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({"ok": true}))
        }
        "tool.pending" => {
            let pending = ctx.pending.pending_approvals().await;
            Ok(json!({"pending": pending}))
        }

        // ── Channels ─────────────────────────────────────────────────────────
        "channels.status" => {
            let names = ctx.channels.names();
            let mut channels = Vec::new();
            for name in names {
                channels.push(json!({
                    "channel": name,
                    "owners": ctx.owners.list(&name).await,
                }));
            }
            Ok(json!({"channels": channels}))
        }
        "channels.setPolicy" => {
            let channel = require_str(params, "channel")?.to_string();
            let allow = str_vec(params, "allow").unwrap_or_default();
            let deny = str_vec(params, "deny").unwrap_or_default();
            let mut config = ctx.config.write().await;
            config
                .tools
                .channel_policies
                .insert(channel, courier_config::ChannelPolicy { allow, deny });
            Ok(json!({"ok": true}))
        }

        // ── Calendar ─────────────────────────────────────────────────────────
        "calendar.list" => Ok(json!({"entries": ctx.calendar.list().await})),
        "calendar.add" => {
            let cron = require_str(params, "cron")?;
            let prompt = require_str(params, "prompt")?;
            let entry = ctx
                .calendar
                .add(cron, prompt)
                .await
                .map_err(|e| e.to_string())?;
            Ok(entry.to_json())
        }
        "calendar.remove" => {
            let id = require_str(params, "id")?;
            Ok(json!({"removed": ctx.calendar.remove(id).await}))
        }

        // ── Config ───────────────────────────────────────────────────────────
        "config.get" => {
            let config = ctx.config.read().await;
            serde_json::to_value(&*config).map_err(|e| format!("config encode: {e}"))
        }
        "config.set" => {
            let patch = params.get("config").cloned().ok_or("missing param: config")?;
            let mut config = ctx.config.write().await;
            let mut current =
                serde_json::to_value(&*config).map_err(|e| format!("config encode: {e}"))?;
            json_merge(&mut current, patch);
            let updated: courier_config::GatewayConfig =
                serde_json::from_value(current).map_err(|e| format!("invalid config: {e}"))?;
            *config = updated;
            Ok(json!({"ok": true}))
        }

        // ── Filesystem ───────────────────────────────────────────────────────
        "fs.list" | "fs.read" | "fs.write" | "fs.mkdir" | "fs.delete" | "fs.rename"
        | "fs.watch.start" | "fs.watch.stop" => {
            let roots = { ctx.config.read().await.fs.roots() };
            dispatch_fs(state, client, &roots, method, params)
        }

        other => Err(format!("unknown method: {other}")),
    }
}

fn dispatch_fs(
    state: &RpcState,
    client: &mut ClientState,
    roots: &[PathBuf],
    method: &str,
    params: &Value,
) -> Result<Value, String> {
    let path = fswatch::check_path(roots, require_str(params, "path")?)?;
    match method {
        "fs.list" => fswatch::list(&path),
        "fs.read" => fswatch::read(&path),
        "fs.write" => {
            let content = require_str(params, "content")?;
            fswatch::write(&path, content)
        }
        "fs.mkdir" => fswatch::mkdir(&path),
        "fs.delete" => fswatch::delete(&path),
        "fs.rename" => {
            let to = fswatch::check_path(roots, require_str(params, "to")?)?;
            fswatch::rename(&path, &to)
        }
        "fs.watch.start" => {
            state.watches.start(&path)?;
            client.watch_refs.push(path);
            Ok(json!({"ok": true}))
        }
        "fs.watch.stop" => {
            if let Some(pos) = client.watch_refs.iter().position(|p| p == &path) {
                client.watch_refs.remove(pos);
                state.watches.stop(&path);
            }
            Ok(json!({"ok": true}))
        }
        _ => unreachable!("routed by caller"),
    }
}

// ── Param helpers ─────────────────────────────────────────────────────────────

fn require_str<'a>(params: &'a Value, field: &str) -> Result<&'a str, String> {
    params
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing param: {field}"))
}

fn str_vec(params: &Value, field: &str) -> Result<Vec<String>, String> {
    params
        .get(field)
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .ok_or_else(|| format!("missing param: {field}"))
}

fn session_key(params: &Value) -> Result<SessionKey, String> {
    let raw = require_str(params, "key")?;
    SessionKey::parse(raw).ok_or_else(|| format!("malformed session key: {raw}"))
}

/// Shallow-recursive JSON merge: objects merge key-by-key, everything else
/// replaces.
fn json_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                json_merge(d.entry(k).or_insert(Value::Null), v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
