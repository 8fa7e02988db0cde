// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Subprocess provider — drives an agent CLI over line-delimited JSON.
//!
//! One process per run: user turns go in as `{"type":"user",…}` lines on
//! stdin (which is also how mid-run injection works), stream output comes
//! back as JSON lines on stdout.  Tool permission checks arrive as
//! `control_request` lines; each is answered with a `control_response`
//! after consulting the [`ToolGate`].
//!
//! Resume-stale and auth failures must be distinguishable *at start* so
//! the gateway can retry or open the re-auth flow: `start` therefore waits
//! for the first stdout line before returning and maps early error results
//! onto [`ProviderError`].

use std::process::Stdio;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, warn};

use crate::{
    run::{InputEvent, RunControl, RunDriver},
    AgentProvider, AgentRun, ProviderError, ProviderMessage, RunRequest, ToolCall, ToolDecision,
    ToolGate,
};

/// How long to wait for the process's first output line.
const FIRST_LINE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

pub struct CliProvider {
    command: String,
    base_args: Vec<String>,
    default_model: Option<String>,
}

impl CliProvider {
    pub fn new(command: &str, base_args: Vec<String>, default_model: Option<String>) -> Self {
        Self {
            command: command.to_string(),
            base_args,
            default_model,
        }
    }

    fn build_command(&self, req: &RunRequest) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.base_args);
        cmd.args([
            "-p",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
        ]);
        if let Some(model) = req.model.as_ref().or(self.default_model.as_ref()) {
            cmd.args(["--model", model]);
        }
        if let Some(resume) = &req.resume_id {
            cmd.args(["--resume", resume]);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl AgentProvider for CliProvider {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(
        &self,
        req: RunRequest,
        gate: Arc<dyn ToolGate>,
    ) -> Result<AgentRun, ProviderError> {
        let mut child = self
            .build_command(&req)
            .spawn()
            .map_err(|e| ProviderError::Other(format!("spawning {}: {e}", self.command)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Other("no stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Other("no stdout pipe".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        // First user turn.
        let mut prompt = req.prompt.clone();
        if let Some(extra) = &req.extra_context {
            prompt.push_str("\n\n");
            prompt.push_str(extra);
        }
        write_user_turn(&mut stdin, &prompt)
            .await
            .map_err(|e| ProviderError::Other(format!("writing prompt: {e}")))?;

        // Wait for the first line so start-time failures are typed.
        let first = tokio::time::timeout(FIRST_LINE_TIMEOUT, lines.next_line())
            .await
            .map_err(|_| ProviderError::Other("provider produced no output".into()))
            .and_then(|r| r.map_err(|e| ProviderError::Other(format!("reading stdout: {e}"))))?;
        let Some(first) = first else {
            return Err(ProviderError::Other("provider exited with no output".into()));
        };
        let first_msg: Value = serde_json::from_str(&first)
            .map_err(|e| ProviderError::Other(format!("unparseable first line: {e}")))?;
        if let Some(err) = classify_error(&first_msg) {
            return Err(err);
        }

        let (run, driver) = RunDriver::new_pair(32);
        tokio::spawn(pump(child, stdin, lines, first_msg, driver, gate));
        Ok(run)
    }
}

async fn pump(
    mut child: Child,
    mut stdin: ChildStdin,
    mut lines: tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    first_msg: Value,
    mut driver: RunDriver,
    gate: Arc<dyn ToolGate>,
) {
    if deliver(&driver, &mut stdin, first_msg, &gate).await.is_err() {
        driver.set_active(false);
        let _ = child.kill().await;
        return;
    }

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("provider stdout error: {e}");
                        break;
                    }
                };
                let msg: Value = match serde_json::from_str(&line) {
                    Ok(msg) => msg,
                    Err(_) => {
                        debug!("skipping non-JSON provider line");
                        continue;
                    }
                };
                if deliver(&driver, &mut stdin, msg, &gate).await.is_err() {
                    break;
                }
            }
            input = driver.input_rx.recv() => {
                match input {
                    Some(InputEvent::Text(text)) => {
                        if let Err(e) = write_user_turn(&mut stdin, &text).await {
                            warn!("provider stdin write failed: {e}");
                            break;
                        }
                    }
                    Some(InputEvent::Close) | None => {
                        let _ = stdin.shutdown().await;
                    }
                }
            }
            ctrl = driver.control_rx.recv() => {
                match ctrl {
                    Some(RunControl::Interrupt) => {
                        let _ = write_line(&mut stdin, &json!({
                            "type": "control_request",
                            "request_id": uuid::Uuid::new_v4().to_string(),
                            "request": {"subtype": "interrupt"},
                        })).await;
                    }
                    Some(RunControl::SetModel(model)) => {
                        let _ = write_line(&mut stdin, &json!({
                            "type": "control_request",
                            "request_id": uuid::Uuid::new_v4().to_string(),
                            "request": {"subtype": "set_model", "model": model},
                        })).await;
                    }
                    Some(RunControl::StopTask(task_id)) => {
                        let _ = write_line(&mut stdin, &json!({
                            "type": "control_request",
                            "request_id": uuid::Uuid::new_v4().to_string(),
                            "request": {"subtype": "stop_task", "task_id": task_id},
                        })).await;
                    }
                    Some(RunControl::McpServerStatus(reply)) => {
                        let _ = reply.send(json!({"servers": []})).await;
                    }
                    None => break,
                }
            }
        }
    }

    driver.set_active(false);
    let _ = child.kill().await;
}

/// Route one stdout message: answer control requests locally, surface
/// typed errors, forward everything else classified.
async fn deliver(
    driver: &RunDriver,
    stdin: &mut ChildStdin,
    msg: Value,
    gate: &Arc<dyn ToolGate>,
) -> Result<(), ()> {
    let msg_type = msg.get("type").and_then(|t| t.as_str()).unwrap_or("");

    if msg_type == "control_request" {
        let response = answer_control_request(&msg, gate).await;
        if let Some(response) = response {
            if let Err(e) = write_line(stdin, &response).await {
                warn!("control response write failed: {e}");
                return Err(());
            }
        }
        return Ok(());
    }

    if let Some(err) = classify_error(&msg) {
        let _ = driver.msg_tx.send(Err(err)).await;
        return Err(());
    }

    let classified = match msg_type {
        "system" => {
            let session_id = msg
                .get("session_id")
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string();
            if msg.get("subtype").and_then(|s| s.as_str()) == Some("init") {
                ProviderMessage::Init {
                    session_id,
                    raw: msg,
                }
            } else {
                ProviderMessage::Stream { raw: msg }
            }
        }
        "stream_event" => ProviderMessage::Stream { raw: msg },
        "assistant" => ProviderMessage::Assistant { raw: msg },
        "user" => ProviderMessage::User { raw: msg },
        "result" => ProviderMessage::Result { raw: msg },
        _ => ProviderMessage::Stream { raw: msg },
    };
    driver.msg_tx.send(Ok(classified)).await.map_err(|_| ())
}

async fn answer_control_request(msg: &Value, gate: &Arc<dyn ToolGate>) -> Option<Value> {
    let request_id = msg.get("request_id")?.as_str()?.to_string();
    let request = msg.get("request")?;
    if request.get("subtype").and_then(|s| s.as_str()) != Some("can_use_tool") {
        return None;
    }

    let call = ToolCall {
        tool_use_id: request
            .get("tool_use_id")
            .and_then(|i| i.as_str())
            .unwrap_or_default()
            .to_string(),
        tool_name: request
            .get("tool_name")
            .and_then(|n| n.as_str())
            .unwrap_or_default()
            .to_string(),
        input: request.get("input").cloned().unwrap_or(Value::Null),
    };

    let body = match gate.check(&call).await {
        ToolDecision::Allow { updated_input } => {
            let mut body = json!({"behavior": "allow"});
            if let Some(input) = updated_input {
                body["updatedInput"] = input;
            }
            body
        }
        ToolDecision::Deny { reason } => json!({"behavior": "deny", "message": reason}),
    };

    Some(json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": body,
        },
    }))
}

/// Map an error-shaped message onto the provider error taxonomy.
fn classify_error(msg: &Value) -> Option<ProviderError> {
    let is_error_result = msg.get("type").and_then(|t| t.as_str()) == Some("result")
        && msg.get("is_error").and_then(|e| e.as_bool()).unwrap_or(false);
    if !is_error_result {
        return None;
    }
    let text = msg
        .get("result")
        .and_then(|r| r.as_str())
        .unwrap_or_default()
        .to_lowercase();
    if text.contains("401")
        || text.contains("authentication")
        || text.contains("oauth token has expired")
    {
        return Some(ProviderError::AuthRequired);
    }
    if text.contains("no conversation found") || text.contains("session not found") {
        return Some(ProviderError::ResumeStale);
    }
    Some(ProviderError::Other(if text.is_empty() {
        "provider reported an error".to_string()
    } else {
        text
    }))
}

async fn write_user_turn(stdin: &mut ChildStdin, text: &str) -> std::io::Result<()> {
    write_line(
        stdin,
        &json!({
            "type": "user",
            "message": {"role": "user", "content": [{"type": "text", "text": text}]},
        }),
    )
    .await
}

async fn write_line(stdin: &mut ChildStdin, value: &Value) -> std::io::Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification_maps_auth_and_resume() {
        let auth = json!({"type": "result", "is_error": true,
                          "result": "API error 401: authentication_error"});
        assert!(matches!(
            classify_error(&auth),
            Some(ProviderError::AuthRequired)
        ));

        let stale = json!({"type": "result", "is_error": true,
                           "result": "No conversation found with session ID abc"});
        assert!(matches!(
            classify_error(&stale),
            Some(ProviderError::ResumeStale)
        ));

        let ok = json!({"type": "result", "is_error": false, "result": "fine"});
        assert!(classify_error(&ok).is_none());

        let other = json!({"type": "result", "is_error": true, "result": "rate limited"});
        assert!(matches!(classify_error(&other), Some(ProviderError::Other(m)) if m.contains("rate")));
    }

    #[tokio::test]
    async fn control_request_is_answered_with_gate_decision() {
        struct DenyAll;
        #[async_trait::async_trait]
        impl ToolGate for DenyAll {
            async fn check(&self, _call: &ToolCall) -> ToolDecision {
                ToolDecision::Deny {
                    reason: "nope".to_string(),
                }
            }
        }

        let request = json!({
            "type": "control_request",
            "request_id": "req-1",
            "request": {"subtype": "can_use_tool", "tool_name": "Bash",
                        "input": {"command": "ls"}, "tool_use_id": "toolu_1"},
        });
        let gate: Arc<dyn ToolGate> = Arc::new(DenyAll);
        let response = answer_control_request(&request, &gate).await.unwrap();
        assert_eq!(response["response"]["request_id"], "req-1");
        assert_eq!(response["response"]["response"]["behavior"], "deny");
        assert_eq!(response["response"]["response"]["message"], "nope");
    }

    #[test]
    fn command_includes_resume_flag_only_when_set() {
        let provider = CliProvider::new("agent-cli", vec![], None);
        let with = provider.build_command(&RunRequest {
            resume_id: Some("r-1".to_string()),
            ..Default::default()
        });
        let args: Vec<String> = with
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"--resume".to_string()));
        assert!(args.contains(&"r-1".to_string()));

        let without = provider.build_command(&RunRequest::default());
        let args: Vec<String> = without
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(!args.contains(&"--resume".to_string()));
    }
}
