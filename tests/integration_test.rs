// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Workspace-level integration tests: the RPC surface wired to the real
//! core, store, and a scripted provider — everything short of the socket.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use courier_channels::{ChannelRegistry, MockAdapter, OwnerStore};
use courier_config::GatewayConfig;
use courier_core::{Dispatcher, GatewayContext};
use courier_gateway::fswatch::WatchRegistry;
use courier_gateway::rpc::{self, ClientState, RpcState};
use courier_provider::{ScriptedProvider, ScriptStep};
use courier_store::Store;

struct Harness {
    state: RpcState,
    sub: courier_core::fanout::Subscriber,
}

async fn harness(provider: ScriptedProvider) -> Harness {
    let dir = std::env::temp_dir().join(format!("courier-it-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();

    let adapter = MockAdapter::new("telegram");
    let mut channels = ChannelRegistry::new();
    channels.register(adapter);

    let ctx = GatewayContext::new(
        GatewayConfig::default(),
        Arc::new(Store::open_in_memory().unwrap()),
        Arc::new(provider),
        channels,
        OwnerStore::load(dir.join("owner-chat-ids.json")),
    )
    .await;
    let watches = WatchRegistry::new(ctx.bus.clone());
    let dispatcher = Dispatcher::new(ctx.clone());
    let sub = ctx.bus.register().await;

    Harness {
        state: RpcState {
            dispatcher,
            watches,
        },
        sub,
    }
}

impl Harness {
    async fn call(&self, method: &str, params: Value) -> Result<Value, String> {
        let mut client = ClientState::default();
        rpc::dispatch(&self.state, &self.sub.shared, &mut client, method, &params).await
    }

    /// Drain frames until `event` appears (flattening stream batches), or
    /// panic after ~2 s.
    async fn frames_until(&mut self, event: &str) -> Vec<Value> {
        let mut seen = Vec::new();
        for _ in 0..100 {
            while let Some(frame) = self.sub.try_next_frame() {
                let v: Value = serde_json::from_str(&frame).unwrap();
                if v["event"] == "agent.stream_batch" {
                    for item in v["data"].as_array().unwrap() {
                        seen.push(item.clone());
                    }
                } else {
                    seen.push(v);
                }
            }
            if seen.iter().any(|v| v["event"] == event) {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("never saw {event}; frames: {seen:?}");
    }
}

#[tokio::test]
async fn chat_send_streams_to_a_subscribed_client() {
    let mut h = harness(ScriptedProvider::always_text("hello from the agent")).await;

    let resp = h
        .call("chat.send", json!({"prompt": "hello", "chatId": "it-1"}))
        .await
        .unwrap();
    let key = resp["sessionKey"].as_str().unwrap().to_string();
    assert_eq!(resp["queued"], true);

    h.call("sessions.subscribe", json!({"keys": [key], "lastSeq": 0}))
        .await
        .unwrap();

    let frames = h.frames_until("agent.result").await;
    let keyed: Vec<&Value> = frames
        .iter()
        .filter(|f| f.get("seq").is_some())
        .collect();

    assert_eq!(keyed.first().unwrap()["event"], "agent.user_message");
    assert_eq!(keyed.last().unwrap()["event"], "agent.result");
    // Monotone seq with no duplicates across replay + live.
    let seqs: Vec<i64> = keyed.iter().map(|f| f["seq"].as_i64().unwrap()).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seqs: {seqs:?}");
}

#[tokio::test]
async fn approval_round_trip_over_rpc() {
    let mut h = harness(ScriptedProvider::tool_then_text(
        "toolu_9",
        "Bash",
        json!({"command": "cargo build"}),
        "built",
    ))
    .await;

    let resp = h
        .call("chat.send", json!({"prompt": "build it", "chatId": "it-2"}))
        .await
        .unwrap();
    let key = resp["sessionKey"].as_str().unwrap().to_string();
    h.call("sessions.subscribe", json!({"keys": [key], "lastSeq": 0}))
        .await
        .unwrap();

    let frames = h.frames_until("agent.tool_approval").await;
    let approval = frames
        .iter()
        .find(|f| f["event"] == "agent.tool_approval")
        .unwrap();
    let request_id = approval["data"]["requestId"].as_str().unwrap().to_string();

    // The pending list agrees.
    let pending = h.call("tool.pending", json!({})).await.unwrap();
    assert_eq!(pending["pending"][0]["requestId"], request_id.as_str());

    h.call("tool.approve", json!({"requestId": request_id}))
        .await
        .unwrap();

    let frames = h.frames_until("agent.result").await;
    let tool_result = frames
        .iter()
        .find(|f| f["event"] == "agent.tool_result")
        .expect("tool result after approval");
    assert_eq!(tool_result["data"]["isError"], false);
}

#[tokio::test]
async fn resubscribe_with_cursor_fills_the_gap_exactly() {
    let mut h = harness(ScriptedProvider::new(vec![
        vec![ScriptStep::Text("one".into())],
        vec![ScriptStep::Text("two".into())],
    ]))
    .await;

    let resp = h
        .call("chat.send", json!({"prompt": "first", "chatId": "it-3"}))
        .await
        .unwrap();
    let key = resp["sessionKey"].as_str().unwrap().to_string();
    h.call("sessions.subscribe", json!({"keys": [key.clone()], "lastSeq": 0}))
        .await
        .unwrap();

    let frames = h.frames_until("agent.result").await;
    let cursor = frames
        .iter()
        .filter_map(|f| f["seq"].as_i64())
        .max()
        .unwrap();

    // Drop the subscription, let the second turn run "unseen".
    h.call("sessions.unsubscribe", json!({"keys": [key.clone()]}))
        .await
        .unwrap();
    h.call("chat.send", json!({"prompt": "second", "chatId": "it-3"}))
        .await
        .unwrap();

    // Wait until the second result is in the log.
    let ctx = h.state.dispatcher.ctx().clone();
    for _ in 0..100 {
        let events = ctx.store.query(&[key.clone()], cursor).unwrap();
        if events.iter().any(|e| e.event_type == "agent.result") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Resubscribing at the cursor replays exactly the missed events.
    while h.sub.try_next_frame().is_some() {}
    h.call(
        "sessions.subscribe",
        json!({"keys": [key.clone()], "lastSeq": cursor}),
    )
    .await
    .unwrap();
    let frames = h.frames_until("agent.result").await;
    let seqs: Vec<i64> = frames.iter().filter_map(|f| f["seq"].as_i64()).collect();
    assert!(seqs.iter().all(|s| *s > cursor), "replayed stale seqs: {seqs:?}");
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn session_reset_issues_a_new_identity() {
    let h = harness(ScriptedProvider::always_text("ok")).await;
    let resp = h
        .call("chat.send", json!({"prompt": "hi", "chatId": "it-4"}))
        .await
        .unwrap();
    let key = resp["sessionKey"].as_str().unwrap();
    let first_id = resp["sessionId"].as_str().unwrap().to_string();

    let reset = h.call("sessions.reset", json!({"key": key})).await.unwrap();
    assert_ne!(reset["sessionId"].as_str().unwrap(), first_id);
    assert_eq!(reset["messageCount"], 0);
}
