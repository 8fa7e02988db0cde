// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! A pre-scripted provider for tests.  Each turn is a list of
//! [`ScriptStep`]s; the provider emits the wire shapes a streaming provider
//! would produce — including tool-use content blocks with `input_json_delta`
//! chunks — and consults the [`ToolGate`] exactly like a real provider.
//! This lets tests specify exact event sequences without network access.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    run::{InputEvent, RunControl, RunDriver},
    AgentProvider, AgentRun, ProviderError, ProviderMessage, RunRequest, ToolCall, ToolDecision,
    ToolGate,
};

/// One step inside a scripted turn.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Streamed assistant text (start/delta/stop block events).
    Text(String),
    /// A tool call: streamed authoring events, an assistant message, a gate
    /// check, then the matching `tool_result`.
    ToolUse {
        id: String,
        name: String,
        input: Value,
        output: String,
        /// Set for sub-agent activity; `None` for top-level calls.
        parent_tool_use_id: Option<String>,
    },
    /// A raw message forwarded verbatim (edge-case shapes).
    Raw(ProviderMessage),
}

impl ScriptStep {
    pub fn tool(
        id: impl Into<String>,
        name: impl Into<String>,
        input: Value,
        output: impl Into<String>,
    ) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
            output: output.into(),
            parent_tool_use_id: None,
        }
    }
}

#[derive(Default)]
struct ScriptedState {
    /// Turns not yet played.  The first is consumed on start; each injected
    /// input consumes one more.
    turns: VecDeque<Vec<ScriptStep>>,
    /// Errors returned by the next `start()` calls, in order.
    start_failures: VecDeque<ProviderError>,
    /// Codes passed to `exchange_code`, for assertions.
    exchanged_codes: Vec<String>,
    /// Resume ids observed across `start()` calls, for assertions.
    seen_resume_ids: Vec<Option<String>>,
}

/// Deterministic scripted provider.
#[derive(Clone)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ScriptedState>>,
    session_id: String,
    /// Keep the run open after the scripted turns, echoing injected input.
    stay_open: bool,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptedState {
                turns: turns.into(),
                ..Default::default()
            })),
            session_id: format!("mock-session-{}", Uuid::new_v4()),
            stay_open: false,
        }
    }

    /// Convenience: a provider that replies with a single text turn.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![ScriptStep::Text(reply.into())]])
    }

    /// Convenience: one tool call followed by a text reply, in one turn.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![vec![
            ScriptStep::tool(tool_id, tool_name, input, "ok"),
            ScriptStep::Text(final_text.into()),
        ]])
    }

    /// Keep the handle active after the last scripted turn; injected inputs
    /// produce echo turns.
    pub fn with_stay_open(mut self) -> Self {
        self.stay_open = true;
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = id.into();
        self
    }

    /// Queue an error for the next `start()` call (consumed in order).
    pub fn fail_next_start(self, err: ProviderError) -> Self {
        self.state.lock().unwrap().start_failures.push_back(err);
        self
    }

    /// Codes handed to [`AgentProvider::exchange_code`] so far.
    pub fn exchanged_codes(&self) -> Vec<String> {
        self.state.lock().unwrap().exchanged_codes.clone()
    }

    /// Resume ids seen by each `start()` call so far.
    pub fn seen_resume_ids(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().seen_resume_ids.clone()
    }
}

#[async_trait]
impl AgentProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(
        &self,
        req: RunRequest,
        gate: Arc<dyn ToolGate>,
    ) -> Result<AgentRun, ProviderError> {
        {
            let mut st = self.state.lock().unwrap();
            st.seen_resume_ids.push(req.resume_id.clone());
            if let Some(err) = st.start_failures.pop_front() {
                return Err(err);
            }
        }

        let (run, driver) = RunDriver::new_pair(32);
        let state = self.state.clone();
        let session_id = self.session_id.clone();
        let stay_open = self.stay_open;

        tokio::spawn(async move {
            play_run(driver, state, gate, session_id, stay_open).await;
        });

        Ok(run)
    }

    fn auth_url(&self) -> anyhow::Result<String> {
        Ok("https://auth.example.com/authorize?code=true".to_string())
    }

    async fn exchange_code(&self, code: &str) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .exchanged_codes
            .push(code.to_string());
        Ok(())
    }
}

async fn play_run(
    mut driver: RunDriver,
    state: Arc<Mutex<ScriptedState>>,
    gate: Arc<dyn ToolGate>,
    session_id: String,
    stay_open: bool,
) {
    let init = ProviderMessage::Init {
        session_id: session_id.clone(),
        raw: json!({"type": "system", "subtype": "init", "session_id": session_id}),
    };
    if driver.msg_tx.send(Ok(init)).await.is_err() {
        return;
    }

    let first = state.lock().unwrap().turns.pop_front();
    if let Some(steps) = first {
        if !play_turn(&mut driver, &gate, steps).await {
            return;
        }
    }

    // Further turns are driven by injected input.
    loop {
        let exhausted = state.lock().unwrap().turns.is_empty();
        if exhausted && !stay_open {
            break;
        }
        tokio::select! {
            input = driver.input_rx.recv() => {
                match input {
                    Some(InputEvent::Text(text)) => {
                        let next = state.lock().unwrap().turns.pop_front();
                        let steps = match next {
                            Some(s) => s,
                            None if stay_open => vec![ScriptStep::Text(format!("echo: {text}"))],
                            None => break,
                        };
                        if !play_turn(&mut driver, &gate, steps).await {
                            return;
                        }
                    }
                    Some(InputEvent::Close) | None => break,
                }
            }
            ctrl = driver.control_rx.recv() => {
                match ctrl {
                    Some(RunControl::Interrupt) => break,
                    Some(RunControl::McpServerStatus(reply)) => {
                        let _ = reply.send(json!({"servers": []})).await;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }

    driver.set_active(false);
}

/// Play one turn's steps; returns false when the receiver is gone.
async fn play_turn(driver: &mut RunDriver, gate: &Arc<dyn ToolGate>, steps: Vec<ScriptStep>) -> bool {
    let mut final_text = String::new();
    let mut index = 0u32;

    for step in steps {
        match step {
            ScriptStep::Text(text) => {
                final_text.push_str(&text);
                let events = vec![
                    json!({"type": "stream_event", "event": {
                        "type": "content_block_start", "index": index,
                        "content_block": {"type": "text", "text": ""}}}),
                    json!({"type": "stream_event", "event": {
                        "type": "content_block_delta", "index": index,
                        "delta": {"type": "text_delta", "text": text}}}),
                    json!({"type": "stream_event", "event": {
                        "type": "content_block_stop", "index": index}}),
                ];
                for raw in events {
                    if !send(driver, ProviderMessage::Stream { raw }).await {
                        return false;
                    }
                }
                index += 1;
            }
            ScriptStep::ToolUse {
                id,
                name,
                input,
                output,
                parent_tool_use_id,
            } => {
                let input_json = input.to_string();
                // Authoring events: the input JSON arrives in two delta chunks.
                let mut mid = input_json.len() / 2;
                while !input_json.is_char_boundary(mid) {
                    mid -= 1;
                }
                let events = vec![
                    json!({"type": "stream_event", "event": {
                        "type": "content_block_start", "index": index,
                        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}}}),
                    json!({"type": "stream_event", "event": {
                        "type": "content_block_delta", "index": index,
                        "delta": {"type": "input_json_delta", "partial_json": &input_json[..mid]}}}),
                    json!({"type": "stream_event", "event": {
                        "type": "content_block_delta", "index": index,
                        "delta": {"type": "input_json_delta", "partial_json": &input_json[mid..]}}}),
                    json!({"type": "stream_event", "event": {
                        "type": "content_block_stop", "index": index}}),
                ];
                for raw in events {
                    if !send(driver, ProviderMessage::Stream { raw }).await {
                        return false;
                    }
                }
                index += 1;

                let assistant = json!({
                    "type": "assistant",
                    "parent_tool_use_id": parent_tool_use_id,
                    "message": {"content": [
                        {"type": "tool_use", "id": id, "name": name, "input": input}
                    ]},
                });
                if !send(driver, ProviderMessage::Assistant { raw: assistant }).await {
                    return false;
                }

                let decision = gate
                    .check(&ToolCall {
                        tool_use_id: id.clone(),
                        tool_name: name.clone(),
                        input: input.clone(),
                    })
                    .await;

                let (content, is_error) = match decision {
                    ToolDecision::Allow { .. } => (output, false),
                    ToolDecision::Deny { reason } => (reason, true),
                };
                let result = json!({
                    "type": "user",
                    "parent_tool_use_id": parent_tool_use_id,
                    "message": {"content": [
                        {"type": "tool_result", "tool_use_id": id,
                         "content": content, "is_error": is_error}
                    ]},
                });
                if !send(driver, ProviderMessage::User { raw: result }).await {
                    return false;
                }
            }
            ScriptStep::Raw(msg) => {
                if !send(driver, msg).await {
                    return false;
                }
            }
        }
    }

    let result = json!({
        "type": "result",
        "subtype": "success",
        "result": final_text,
        "usage": {"input_tokens": 10, "output_tokens": 10},
        "total_cost_usd": 0.001,
    });
    send(driver, ProviderMessage::Result { raw: result }).await
}

async fn send(driver: &mut RunDriver, msg: ProviderMessage) -> bool {
    driver.msg_tx.send(Ok(msg)).await.is_ok()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct AllowAll;
    #[async_trait]
    impl ToolGate for AllowAll {
        async fn check(&self, _call: &ToolCall) -> ToolDecision {
            ToolDecision::Allow {
                updated_input: None,
            }
        }
    }

    struct DenyAll;
    #[async_trait]
    impl ToolGate for DenyAll {
        async fn check(&self, _call: &ToolCall) -> ToolDecision {
            ToolDecision::Deny {
                reason: "not today".to_string(),
            }
        }
    }

    async fn drain(run: &mut AgentRun) -> Vec<ProviderMessage> {
        let mut out = Vec::new();
        while let Some(msg) = run.messages.recv().await {
            out.push(msg.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn text_turn_emits_init_stream_and_result() {
        let p = ScriptedProvider::always_text("hello");
        let mut run = p
            .start(RunRequest::default(), Arc::new(AllowAll))
            .await
            .unwrap();
        let msgs = drain(&mut run).await;
        assert!(matches!(msgs.first(), Some(ProviderMessage::Init { .. })));
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ProviderMessage::Stream { .. })));
        match msgs.last() {
            Some(ProviderMessage::Result { raw }) => {
                assert_eq!(raw["result"], "hello");
            }
            other => panic!("expected Result last, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_turn_consults_gate_and_reports_result() {
        let p = ScriptedProvider::tool_then_text(
            "toolu_1",
            "Bash",
            json!({"command": "ls"}),
            "done",
        );
        let mut run = p
            .start(RunRequest::default(), Arc::new(AllowAll))
            .await
            .unwrap();
        let msgs = drain(&mut run).await;
        let tool_result = msgs
            .iter()
            .find_map(|m| match m {
                ProviderMessage::User { raw } => Some(raw),
                _ => None,
            })
            .expect("no tool_result message");
        assert_eq!(
            tool_result["message"]["content"][0]["is_error"],
            Value::Bool(false)
        );
    }

    #[tokio::test]
    async fn denied_tool_produces_error_result() {
        let p = ScriptedProvider::tool_then_text("toolu_1", "Bash", json!({"command": "rm"}), "x");
        let mut run = p
            .start(RunRequest::default(), Arc::new(DenyAll))
            .await
            .unwrap();
        let msgs = drain(&mut run).await;
        let tool_result = msgs
            .iter()
            .find_map(|m| match m {
                ProviderMessage::User { raw } => Some(raw),
                _ => None,
            })
            .unwrap();
        let block = &tool_result["message"]["content"][0];
        assert_eq!(block["is_error"], Value::Bool(true));
        assert_eq!(block["content"], "not today");
    }

    #[tokio::test]
    async fn start_failure_is_consumed_once() {
        let p = ScriptedProvider::always_text("ok").fail_next_start(ProviderError::ResumeStale);
        let err = p
            .start(RunRequest::default(), Arc::new(AllowAll))
            .await
            .err()
            .expect("first start must fail");
        assert!(matches!(err, ProviderError::ResumeStale));
        // Second start succeeds.
        assert!(p.start(RunRequest::default(), Arc::new(AllowAll)).await.is_ok());
    }

    #[tokio::test]
    async fn injection_drives_a_second_turn() {
        let p = ScriptedProvider::new(vec![
            vec![ScriptStep::Text("first".into())],
            vec![ScriptStep::Text("second".into())],
        ]);
        let mut run = p
            .start(RunRequest::default(), Arc::new(AllowAll))
            .await
            .unwrap();

        // Drain the first turn up to its Result.
        loop {
            match run.messages.recv().await.unwrap().unwrap() {
                ProviderMessage::Result { .. } => break,
                _ => continue,
            }
        }
        assert!(run.handle.active());
        run.handle.inject("go on").unwrap();

        let mut saw_second = false;
        while let Some(Ok(msg)) = run.messages.recv().await {
            if let ProviderMessage::Result { raw } = &msg {
                assert_eq!(raw["result"], "second");
                saw_second = true;
            }
        }
        assert!(saw_second);
    }

    #[tokio::test]
    async fn resume_ids_are_recorded() {
        let p = ScriptedProvider::always_text("ok");
        let req = RunRequest {
            resume_id: Some("r-1".to_string()),
            ..Default::default()
        };
        let _ = p.start(req, Arc::new(AllowAll)).await.unwrap();
        assert_eq!(p.seen_resume_ids(), vec![Some("r-1".to_string())]);
    }
}
