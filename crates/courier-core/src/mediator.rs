// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Tool mediator — policy and the approval rendezvous.
//!
//! Every tool call the agent attempts flows through [`ToolMediator::check`]
//! (the provider invokes it as its [`ToolGate`]).  Layers, in order:
//!
//! 1. the unconditional deny list (credential access and friends);
//! 2. the per-channel allow/deny policy for the run's source channel;
//! 3. the global allow/deny lists;
//! 4. tier classification — `auto-allow` (read-only), `notify`
//!    (side-effecting, low-risk, inside the workspace), `require-approval`
//!    (everything else);
//! 5. the operating-mode overlay (autonomous / accept-edits / lockdown).
//!
//! `require-approval` suspends the call on a one-shot rendezvous that can
//! be resolved by an RPC (`tool.approve` / `tool.deny`), a channel
//! callback, or a timeout — whichever writes first.
//!
//! `AskUserQuestion` bypasses the tiers entirely: it serializes into the
//! same rendezvous substrate and returns the chosen labels keyed by
//! question text.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_channels::{ApprovalRequest, QuestionRequest};
use courier_config::{GatewayMode, ToolsConfig};
use courier_provider::{ToolCall, ToolDecision, ToolGate};

use crate::context::{ChannelMeta, GatewayContext};
use crate::events::{
    GatewayEvent, EV_ASK_USER, EV_QUESTION_DISMISSED, EV_TOOL_APPROVAL, EV_TOOL_NOTIFY,
};
use crate::pending::{ApprovalVerdict, QuestionSpec};
use crate::registry::SessionKey;
use crate::status::tool_detail;

const DESKTOP_QUESTION_TIMEOUT: Duration = Duration::from_secs(300);
const CHANNEL_QUESTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Risk tier of a single tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    AutoAllow,
    Notify,
    RequireApproval,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::AutoAllow => "auto_allow",
            Tier::Notify => "notify",
            Tier::RequireApproval => "require_approval",
        }
    }
}

/// Strip a provider prefix like `mcp__server__toolname`.
pub fn strip_provider_prefix(name: &str) -> &str {
    if let Some(rest) = name.strip_prefix("mcp__") {
        if let Some((_, tool)) = rest.split_once("__") {
            return tool;
        }
    }
    name
}

const READ_ONLY_TOOLS: &[&str] = &[
    "Read",
    "NotebookRead",
    "Grep",
    "Glob",
    "LS",
    "ListDir",
    "WebFetch",
    "WebSearch",
    "TodoRead",
];

const FILE_EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

const LOW_RISK_TOOLS: &[&str] = &["TodoWrite", "message"];

/// Classify a tool call.  File edits are low-risk only when the target
/// stays inside `workspace_root`; an absolute path elsewhere (or no path
/// at all) escalates to approval.
pub fn classify(name: &str, input: &Value, workspace_root: &Path) -> Tier {
    if READ_ONLY_TOOLS.contains(&name) {
        return Tier::AutoAllow;
    }
    if LOW_RISK_TOOLS.contains(&name) {
        return Tier::Notify;
    }
    if FILE_EDIT_TOOLS.contains(&name) {
        let path = input
            .get("file_path")
            .or_else(|| input.get("path"))
            .or_else(|| input.get("notebook_path"))
            .and_then(|v| v.as_str());
        return match path {
            Some(p) if path_within(Path::new(p), workspace_root) => Tier::Notify,
            _ => Tier::RequireApproval,
        };
    }
    Tier::RequireApproval
}

fn path_within(path: &Path, root: &Path) -> bool {
    if path.is_relative() {
        return !path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
    }
    path.starts_with(root)
}

pub struct ToolMediator {
    ctx: Arc<GatewayContext>,
    session_key: SessionKey,
    channel: Option<ChannelMeta>,
    workspace_root: std::path::PathBuf,
    /// Optional deadline on approvals; none by default — an explicit
    /// response is required.
    approval_timeout: Option<Duration>,
    question_timeouts: (Duration, Duration),
}

impl ToolMediator {
    pub fn new(
        ctx: Arc<GatewayContext>,
        session_key: SessionKey,
        channel: Option<ChannelMeta>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            session_key,
            channel,
            workspace_root: std::env::current_dir().unwrap_or_else(|_| "/".into()),
            approval_timeout: None,
            question_timeouts: (DESKTOP_QUESTION_TIMEOUT, CHANNEL_QUESTION_TIMEOUT),
        })
    }

    #[cfg(test)]
    fn with_timeouts(
        mut self,
        approval: Option<Duration>,
        desktop_q: Duration,
        channel_q: Duration,
    ) -> Arc<Self> {
        self.approval_timeout = approval;
        self.question_timeouts = (desktop_q, channel_q);
        Arc::new(self)
    }

    async fn tools_config(&self) -> ToolsConfig {
        self.ctx.config.read().await.tools.clone()
    }

    fn key_str(&self) -> String {
        self.session_key.to_string()
    }

    async fn emit_notify(&self, name: &str, input: &Value) {
        self.ctx
            .bus
            .publish(GatewayEvent::keyed(
                EV_TOOL_NOTIFY,
                self.key_str(),
                json!({"toolName": name, "input": input}),
            ))
            .await;
    }

    // ── Approval rendezvous ──────────────────────────────────────────────────

    async fn require_approval(&self, name: &str, call: &ToolCall) -> ToolDecision {
        let request_id = Uuid::new_v4().to_string();
        let rx = self
            .ctx
            .pending
            .create_approval(&request_id, &self.key_str(), name, call.input.clone())
            .await;

        self.ctx
            .snapshots
            .update(&self.key_str(), |s| {
                s.pending_approval = Some(json!({
                    "requestId": request_id,
                    "toolName": name,
                    "input": call.input,
                }));
            })
            .await;

        self.ctx
            .bus
            .publish(GatewayEvent::keyed(
                EV_TOOL_APPROVAL,
                self.key_str(),
                json!({
                    "requestId": request_id,
                    "toolName": name,
                    "input": call.input,
                    "tier": Tier::RequireApproval.as_str(),
                }),
            ))
            .await;

        if let Some(meta) = &self.channel {
            if let Some(adapter) = self.ctx.adapter(&meta.channel) {
                let req = ApprovalRequest {
                    request_id: request_id.clone(),
                    chat_id: meta.chat_id.clone(),
                    tool_name: name.to_string(),
                    summary: summarize_input(name, &call.input),
                };
                if let Err(e) = adapter.send_approval_request(&req).await {
                    debug!("channel approval request failed: {e}");
                }
            }
        }

        info!(session_key = %self.key_str(), tool = name, request_id, "awaiting tool approval");

        let verdict = match self.approval_timeout {
            Some(deadline) => match timeout(deadline, rx).await {
                Ok(result) => result,
                Err(_) => {
                    self.ctx.pending.cancel_approval(&request_id).await;
                    self.clear_pending_approval().await;
                    return ToolDecision::Deny {
                        reason: "approval timeout".to_string(),
                    };
                }
            },
            None => rx.await,
        };

        self.clear_pending_approval().await;

        match verdict {
            Ok(ApprovalVerdict {
                approved: true,
                updated_input,
                ..
            }) => ToolDecision::Allow { updated_input },
            Ok(ApprovalVerdict {
                approved: false,
                reason,
                ..
            }) => ToolDecision::Deny {
                reason: reason.unwrap_or_else(|| "denied by user".to_string()),
            },
            // Rendezvous dropped (run aborted, shutdown).
            Err(_) => ToolDecision::Deny {
                reason: "approval cancelled".to_string(),
            },
        }
    }

    async fn clear_pending_approval(&self) {
        self.ctx
            .snapshots
            .update(&self.key_str(), |s| s.pending_approval = None)
            .await;
    }

    // ── AskUserQuestion ──────────────────────────────────────────────────────

    async fn ask_user(&self, call: &ToolCall) -> ToolDecision {
        let questions = parse_questions(&call.input);
        if questions.is_empty() {
            return ToolDecision::Deny {
                reason: "no questions provided".to_string(),
            };
        }
        let answers = match &self.channel {
            None => self.ask_on_desktop(questions).await,
            Some(meta) => self.ask_on_channel(meta.clone(), questions).await,
        };
        match answers {
            Some(answers) => ToolDecision::Allow {
                updated_input: Some(json!({"answers": answers})),
            },
            None => ToolDecision::Deny {
                reason: "question timed out".to_string(),
            },
        }
    }

    /// Desktop: one event with every question, answered as a set.
    async fn ask_on_desktop(
        &self,
        questions: Vec<QuestionSpec>,
    ) -> Option<HashMap<String, String>> {
        let request_id = Uuid::new_v4().to_string();
        let rx = self
            .ctx
            .pending
            .create_question(&request_id, questions.clone())
            .await;

        let payload = json!({
            "requestId": request_id,
            "questions": questions.iter().map(|q| json!({
                "question": q.question,
                "options": q.options,
            })).collect::<Vec<_>>(),
        });
        self.ctx
            .snapshots
            .update(&self.key_str(), |s| {
                s.pending_question = Some(payload.clone())
            })
            .await;
        self.ctx
            .bus
            .publish(GatewayEvent::keyed(EV_ASK_USER, self.key_str(), payload))
            .await;

        let result = timeout(self.question_timeouts.0, rx).await;
        self.ctx
            .snapshots
            .update(&self.key_str(), |s| s.pending_question = None)
            .await;

        match result {
            Ok(Ok(answers)) => Some(answers),
            _ => {
                self.ctx.pending.cancel_question(&request_id).await;
                self.ctx
                    .bus
                    .publish(GatewayEvent::keyed(
                        EV_QUESTION_DISMISSED,
                        self.key_str(),
                        json!({"requestId": request_id}),
                    ))
                    .await;
                None
            }
        }
    }

    /// Channel: one sequential request per question; on timeout the first
    /// option wins.
    async fn ask_on_channel(
        &self,
        meta: ChannelMeta,
        questions: Vec<QuestionSpec>,
    ) -> Option<HashMap<String, String>> {
        let adapter = self.ctx.adapter(&meta.channel)?;
        let mut answers = HashMap::new();

        for spec in questions {
            let request_id = Uuid::new_v4().to_string();
            let rx = self
                .ctx
                .pending
                .create_channel_question(&request_id, spec.options.clone())
                .await;

            let req = QuestionRequest {
                request_id: request_id.clone(),
                chat_id: meta.chat_id.clone(),
                question: spec.question.clone(),
                options: spec.options.clone(),
            };
            if let Err(e) = adapter.send_question(&req).await {
                debug!("channel question send failed: {e}");
            }

            let label = match timeout(self.question_timeouts.1, rx).await {
                Ok(Ok((_, label))) => label,
                _ => {
                    self.ctx.pending.cancel_channel_question(&request_id).await;
                    let fallback = spec.options.first().cloned().unwrap_or_default();
                    warn!(
                        question = %spec.question,
                        "channel question timed out, first option wins"
                    );
                    fallback
                }
            };
            answers.insert(spec.question, label);
        }
        Some(answers)
    }
}

#[async_trait]
impl ToolGate for ToolMediator {
    async fn check(&self, call: &ToolCall) -> ToolDecision {
        let name = strip_provider_prefix(&call.tool_name).to_string();

        if name == "AskUserQuestion" {
            return self.ask_user(call).await;
        }

        let tools = self.tools_config().await;

        if tools.hard_deny.iter().any(|t| t == &name) {
            return ToolDecision::Deny {
                reason: format!("tool {name} is disabled"),
            };
        }

        if let Some(meta) = &self.channel {
            if let Some(policy) = tools.channel_policies.get(&meta.channel) {
                if policy.deny.iter().any(|t| t == &name) {
                    return ToolDecision::Deny {
                        reason: format!("tool {name} is not allowed on {}", meta.channel),
                    };
                }
                if policy.allow.iter().any(|t| t == &name) {
                    return ToolDecision::Allow {
                        updated_input: None,
                    };
                }
            }
        }

        if tools.deny.iter().any(|t| t == &name) {
            return ToolDecision::Deny {
                reason: format!("tool {name} is denied by policy"),
            };
        }
        if tools.allow.iter().any(|t| t == &name) {
            return ToolDecision::Allow {
                updated_input: None,
            };
        }

        let tier = classify(&name, &call.input, &self.workspace_root);
        match (tools.mode, tier) {
            (_, Tier::AutoAllow) => ToolDecision::Allow {
                updated_input: None,
            },
            (GatewayMode::Autonomous, tier) => {
                if tier == Tier::Notify {
                    self.emit_notify(&name, &call.input).await;
                }
                ToolDecision::Allow {
                    updated_input: None,
                }
            }
            (GatewayMode::AcceptEdits, Tier::RequireApproval)
                if FILE_EDIT_TOOLS.contains(&name.as_str()) =>
            {
                self.emit_notify(&name, &call.input).await;
                ToolDecision::Allow {
                    updated_input: None,
                }
            }
            (GatewayMode::Lockdown, _) => self.require_approval(&name, call).await,
            (_, Tier::Notify) => {
                self.emit_notify(&name, &call.input).await;
                ToolDecision::Allow {
                    updated_input: None,
                }
            }
            (_, Tier::RequireApproval) => self.require_approval(&name, call).await,
        }
    }
}

/// Short human summary of a tool input for channel approval prompts.
fn summarize_input(name: &str, input: &Value) -> String {
    let detail = tool_detail(name, input);
    if !detail.is_empty() {
        return detail;
    }
    let compact = input.to_string();
    if compact.chars().count() > 120 {
        let cut: String = compact.chars().take(120).collect();
        format!("{cut}…")
    } else {
        compact
    }
}

/// Accept both `{"questions": [...]}` and a single `{"question": ...}`.
/// Options may be plain strings or `{"label": ...}` objects.
fn parse_questions(input: &Value) -> Vec<QuestionSpec> {
    let mut specs = Vec::new();
    let items: Vec<&Value> = match input.get("questions").and_then(|q| q.as_array()) {
        Some(list) => list.iter().collect(),
        None => {
            if input.get("question").is_some() {
                vec![input]
            } else {
                Vec::new()
            }
        }
    };
    for item in items {
        let Some(question) = item.get("question").and_then(|q| q.as_str()) else {
            continue;
        };
        let options: Vec<String> = item
            .get("options")
            .and_then(|o| o.as_array())
            .map(|opts| {
                opts.iter()
                    .filter_map(|o| {
                        o.as_str()
                            .map(str::to_string)
                            .or_else(|| o.get("label")?.as_str().map(str::to_string))
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !options.is_empty() {
            specs.push(QuestionSpec {
                question: question.to_string(),
                options,
            });
        }
    }
    specs
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use courier_channels::{ChannelRegistry, MockAdapter, MockCall, OwnerStore};
    use courier_config::GatewayConfig;
    use courier_provider::ScriptedProvider;
    use courier_store::Store;

    async fn test_ctx(config: GatewayConfig) -> (Arc<GatewayContext>, Arc<MockAdapter>) {
        let adapter = MockAdapter::new("telegram");
        let mut channels = ChannelRegistry::new();
        channels.register(adapter.clone());
        let dir = std::env::temp_dir().join(format!("courier-test-{}", Uuid::new_v4()));
        let ctx = GatewayContext::new(
            config,
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(ScriptedProvider::always_text("ok")),
            channels,
            OwnerStore::load(dir.join("owner-chat-ids.json")),
        )
        .await;
        (ctx, adapter)
    }

    fn mediator(ctx: &Arc<GatewayContext>, channel: bool) -> ToolMediator {
        ToolMediator {
            ctx: ctx.clone(),
            session_key: SessionKey::dm("telegram", "42"),
            channel: channel.then(|| ChannelMeta {
                channel: "telegram".to_string(),
                chat_id: "42".to_string(),
            }),
            workspace_root: std::path::PathBuf::from("/workspace"),
            approval_timeout: None,
            question_timeouts: (DESKTOP_QUESTION_TIMEOUT, CHANNEL_QUESTION_TIMEOUT),
        }
    }

    fn call(name: &str, input: Value) -> ToolCall {
        ToolCall {
            tool_use_id: "toolu_1".to_string(),
            tool_name: name.to_string(),
            input,
        }
    }

    // ── Classification ────────────────────────────────────────────────────────

    #[test]
    fn read_only_tools_auto_allow() {
        let root = Path::new("/workspace");
        assert_eq!(classify("Read", &json!({}), root), Tier::AutoAllow);
        assert_eq!(classify("Grep", &json!({}), root), Tier::AutoAllow);
    }

    #[test]
    fn workspace_edit_is_notify_outside_is_approval() {
        let root = Path::new("/workspace");
        assert_eq!(
            classify("Edit", &json!({"file_path": "/workspace/src/main.rs"}), root),
            Tier::Notify
        );
        assert_eq!(
            classify("Edit", &json!({"file_path": "src/main.rs"}), root),
            Tier::Notify
        );
        assert_eq!(
            classify("Edit", &json!({"file_path": "/etc/passwd"}), root),
            Tier::RequireApproval
        );
        assert_eq!(
            classify("Edit", &json!({"file_path": "../outside.txt"}), root),
            Tier::RequireApproval
        );
    }

    #[test]
    fn shell_requires_approval() {
        let root = Path::new("/workspace");
        assert_eq!(
            classify("Bash", &json!({"command": "ls"}), root),
            Tier::RequireApproval
        );
    }

    #[test]
    fn provider_prefix_is_stripped() {
        assert_eq!(strip_provider_prefix("mcp__browser__click"), "click");
        assert_eq!(strip_provider_prefix("Bash"), "Bash");
    }

    // ── Policy layers ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn hard_deny_beats_everything() {
        let mut config = GatewayConfig::default();
        config.tools.mode = courier_config::GatewayMode::Autonomous;
        let (ctx, _) = test_ctx(config).await;
        let m = mediator(&ctx, false);
        let decision = m.check(&call("ReadCredentials", json!({}))).await;
        assert!(matches!(decision, ToolDecision::Deny { .. }));
    }

    #[tokio::test]
    async fn channel_policy_denies_before_classification() {
        let mut config = GatewayConfig::default();
        config
            .tools
            .channel_policies
            .insert("telegram".to_string(), courier_config::ChannelPolicy {
                allow: vec![],
                deny: vec!["Read".to_string()],
            });
        let (ctx, _) = test_ctx(config).await;
        let m = mediator(&ctx, true);
        // Read is auto-allow by tier, but the channel policy wins.
        let decision = m.check(&call("Read", json!({}))).await;
        assert!(matches!(decision, ToolDecision::Deny { .. }));
    }

    #[tokio::test]
    async fn channel_allow_list_forces_allow() {
        let mut config = GatewayConfig::default();
        config
            .tools
            .channel_policies
            .insert("telegram".to_string(), courier_config::ChannelPolicy {
                allow: vec!["Bash".to_string()],
                deny: vec![],
            });
        let (ctx, _) = test_ctx(config).await;
        let m = mediator(&ctx, true);
        let decision = m.check(&call("Bash", json!({"command": "ls"}))).await;
        assert!(matches!(decision, ToolDecision::Allow { .. }));
    }

    #[tokio::test]
    async fn autonomous_mode_allows_shell() {
        let mut config = GatewayConfig::default();
        config.tools.mode = courier_config::GatewayMode::Autonomous;
        let (ctx, _) = test_ctx(config).await;
        let m = mediator(&ctx, false);
        let decision = m.check(&call("Bash", json!({"command": "ls"}))).await;
        assert!(matches!(decision, ToolDecision::Allow { .. }));
    }

    #[tokio::test]
    async fn notify_tier_emits_event_and_allows() {
        let (ctx, _) = test_ctx(GatewayConfig::default()).await;
        let mut sub = ctx.bus.register().await;
        ctx.bus
            .subscribe(&sub.shared, &["telegram:dm:42".to_string()], None)
            .await
            .unwrap();

        let m = mediator(&ctx, false);
        let decision = m
            .check(&call("Edit", json!({"file_path": "src/lib.rs"})))
            .await;
        assert!(matches!(decision, ToolDecision::Allow { .. }));

        tokio::time::sleep(Duration::from_millis(40)).await;
        let frame: Value =
            serde_json::from_str(&sub.try_next_frame().expect("no notify frame")).unwrap();
        assert_eq!(frame["event"], "agent.tool_notify");
    }

    // ── Approval rendezvous ───────────────────────────────────────────────────

    #[tokio::test]
    async fn approval_flow_approve_path() {
        let (ctx, _) = test_ctx(GatewayConfig::default()).await;
        let mut sub = ctx.bus.register().await;
        ctx.bus
            .subscribe(&sub.shared, &["telegram:dm:42".to_string()], None)
            .await
            .unwrap();

        let m = Arc::new(mediator(&ctx, false));
        let check = {
            let m = m.clone();
            tokio::spawn(async move { m.check(&call("Bash", json!({"command": "ls"}))).await })
        };

        // The approval event appears; grab its request id.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let frame: Value =
            serde_json::from_str(&sub.try_next_frame().expect("no approval event")).unwrap();
        assert_eq!(frame["event"], "agent.tool_approval");
        let request_id = frame["data"]["requestId"].as_str().unwrap().to_string();

        // No tool_result can exist yet: check is still suspended.
        assert!(!check.is_finished());

        ctx.pending
            .resolve_approval(
                &request_id,
                ApprovalVerdict {
                    approved: true,
                    reason: None,
                    updated_input: None,
                },
            )
            .await
            .unwrap();

        let decision = check.await.unwrap();
        assert!(matches!(decision, ToolDecision::Allow { .. }));
        // Rendezvous is single-shot: the id is gone.
        assert!(ctx.pending.pending_approvals().await.is_empty());
    }

    #[tokio::test]
    async fn approval_flow_deny_carries_reason() {
        let (ctx, _) = test_ctx(GatewayConfig::default()).await;
        let m = Arc::new(mediator(&ctx, false));
        let check = {
            let m = m.clone();
            tokio::spawn(async move { m.check(&call("Bash", json!({"command": "rm -rf /"}))).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        let pending = ctx.pending.pending_approvals().await;
        let request_id = pending[0]["requestId"].as_str().unwrap().to_string();
        ctx.pending
            .resolve_approval(
                &request_id,
                ApprovalVerdict {
                    approved: false,
                    reason: Some("too dangerous".to_string()),
                    updated_input: None,
                },
            )
            .await
            .unwrap();

        match check.await.unwrap() {
            ToolDecision::Deny { reason } => assert_eq!(reason, "too dangerous"),
            other => panic!("expected Deny, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn channel_run_also_prompts_on_the_channel() {
        let (ctx, adapter) = test_ctx(GatewayConfig::default()).await;
        let m = Arc::new(mediator(&ctx, true));
        let check = {
            let m = m.clone();
            tokio::spawn(async move { m.check(&call("Bash", json!({"command": "ls"}))).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(adapter
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::Approval { tool_name, .. } if tool_name == "Bash")));

        let pending = ctx.pending.pending_approvals().await;
        let request_id = pending[0]["requestId"].as_str().unwrap().to_string();
        ctx.pending
            .resolve_approval(
                &request_id,
                ApprovalVerdict {
                    approved: true,
                    reason: None,
                    updated_input: None,
                },
            )
            .await
            .unwrap();
        check.await.unwrap();
    }

    #[tokio::test]
    async fn approval_timeout_denies() {
        let (ctx, _) = test_ctx(GatewayConfig::default()).await;
        let m = mediator(&ctx, false).with_timeouts(
            Some(Duration::from_millis(50)),
            DESKTOP_QUESTION_TIMEOUT,
            CHANNEL_QUESTION_TIMEOUT,
        );
        match m.check(&call("Bash", json!({"command": "ls"}))).await {
            ToolDecision::Deny { reason } => assert_eq!(reason, "approval timeout"),
            other => panic!("expected Deny, got {other:?}"),
        }
        assert!(ctx.pending.pending_approvals().await.is_empty());
    }

    #[tokio::test]
    async fn lockdown_escalates_notify_tier() {
        let mut config = GatewayConfig::default();
        config.tools.mode = courier_config::GatewayMode::Lockdown;
        let (ctx, _) = test_ctx(config).await;
        let m = mediator(&ctx, false).with_timeouts(
            Some(Duration::from_millis(50)),
            DESKTOP_QUESTION_TIMEOUT,
            CHANNEL_QUESTION_TIMEOUT,
        );
        // A workspace edit would normally be notify; lockdown prompts.
        let decision = m
            .check(&call("Edit", json!({"file_path": "src/lib.rs"})))
            .await;
        assert!(matches!(decision, ToolDecision::Deny { reason } if reason == "approval timeout"));
    }

    #[tokio::test]
    async fn accept_edits_auto_allows_out_of_workspace_edit() {
        let mut config = GatewayConfig::default();
        config.tools.mode = courier_config::GatewayMode::AcceptEdits;
        let (ctx, _) = test_ctx(config).await;
        let m = mediator(&ctx, false);
        let decision = m
            .check(&call("Edit", json!({"file_path": "/etc/motd"})))
            .await;
        assert!(matches!(decision, ToolDecision::Allow { .. }));
        // Shell still prompts under accept-edits; verified by the pending
        // table filling up rather than resolving.
        let m2 = mediator(&ctx, false).with_timeouts(
            Some(Duration::from_millis(50)),
            DESKTOP_QUESTION_TIMEOUT,
            CHANNEL_QUESTION_TIMEOUT,
        );
        let decision = m2.check(&call("Bash", json!({"command": "ls"}))).await;
        assert!(matches!(decision, ToolDecision::Deny { .. }));
    }

    // ── AskUserQuestion ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn desktop_question_returns_labels_keyed_by_text() {
        let (ctx, _) = test_ctx(GatewayConfig::default()).await;
        let m = Arc::new(mediator(&ctx, false));
        let input = json!({"questions": [
            {"question": "Color?", "options": ["red", "green"]},
        ]});
        let check = {
            let m = m.clone();
            tokio::spawn(async move { m.check(&call("AskUserQuestion", input)).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        // The request id is discoverable from the persisted ask_user event.
        let mut sub = ctx.bus.register().await;
        ctx.bus
            .subscribe(&sub.shared, &["telegram:dm:42".to_string()], Some(0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let mut request_id = None;
        while let Some(frame) = sub.try_next_frame() {
            let v: Value = serde_json::from_str(&frame).unwrap();
            if v["event"] == "agent.ask_user" {
                request_id = v["data"]["requestId"].as_str().map(str::to_string);
            }
        }
        let request_id = request_id.expect("no ask_user event");

        let mut answers = HashMap::new();
        answers.insert("Color?".to_string(), "green".to_string());
        ctx.pending
            .resolve_question(&request_id, answers)
            .await
            .unwrap();

        match check.await.unwrap() {
            ToolDecision::Allow { updated_input } => {
                let v = updated_input.unwrap();
                assert_eq!(v["answers"]["Color?"], "green");
            }
            other => panic!("expected Allow, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn channel_question_timeout_picks_first_option() {
        let (ctx, adapter) = test_ctx(GatewayConfig::default()).await;
        let m = mediator(&ctx, true).with_timeouts(
            None,
            DESKTOP_QUESTION_TIMEOUT,
            Duration::from_millis(50),
        );
        let input = json!({"questions": [
            {"question": "Proceed?", "options": ["yes", "no"]},
        ]});
        match m.check(&call("AskUserQuestion", input)).await {
            ToolDecision::Allow { updated_input } => {
                let v = updated_input.unwrap();
                assert_eq!(v["answers"]["Proceed?"], "yes");
            }
            other => panic!("expected Allow, got {other:?}"),
        }
        assert!(adapter
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::Question { question, .. } if question == "Proceed?")));
    }

    #[tokio::test]
    async fn channel_questions_are_sequential() {
        let (ctx, adapter) = test_ctx(GatewayConfig::default()).await;
        let m = mediator(&ctx, true).with_timeouts(
            None,
            DESKTOP_QUESTION_TIMEOUT,
            Duration::from_millis(50),
        );
        let input = json!({"questions": [
            {"question": "One?", "options": ["a"]},
            {"question": "Two?", "options": [{"label": "b"}]},
        ]});
        match m.check(&call("AskUserQuestion", input)).await {
            ToolDecision::Allow { updated_input } => {
                let v = updated_input.unwrap();
                assert_eq!(v["answers"]["One?"], "a");
                assert_eq!(v["answers"]["Two?"], "b");
            }
            other => panic!("expected Allow, got {other:?}"),
        }
        let questions: Vec<_> = adapter
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Question { question, .. } => Some(question),
                _ => None,
            })
            .collect();
        assert_eq!(questions, vec!["One?".to_string(), "Two?".to_string()]);
    }

    #[test]
    fn question_parsing_accepts_both_shapes() {
        let specs = parse_questions(&json!({"question": "A?", "options": ["x"]}));
        assert_eq!(specs.len(), 1);
        let specs = parse_questions(&json!({"questions": [
            {"question": "A?", "options": [{"label": "x"}, "y"]},
        ]}));
        assert_eq!(specs[0].options, vec!["x", "y"]);
        assert!(parse_questions(&json!({})).is_empty());
    }
}
