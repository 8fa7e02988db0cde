// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Channel status messages — the ephemeral placeholder a channel sees
//! while a run is in flight.
//!
//! Lifecycle per run: send a placeholder, keep a typing heartbeat going,
//! re-compose a markdown tool log on every tool-use start (edit throttled
//! to one per 2.5 s, forced when a fresh tool detail arrives), then delete
//! the placeholder at turn end and post the final text if the agent did not
//! send one itself.  All transport calls are best-effort: a failed edit or
//! delete never disturbs the run.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use courier_channels::ChannelAdapter;

/// Heartbeat cadence for the typing indicator.
const TYPING_INTERVAL: Duration = Duration::from_millis(4_500);
/// Minimum spacing between status edits (unless forced).
const EDIT_THROTTLE: Duration = Duration::from_millis(2_500);
/// Show at most this many finished groups; older ones collapse.
const MAX_VISIBLE_GROUPS: usize = 4;

// ── Display tables ────────────────────────────────────────────────────────────

struct ToolStyle {
    past: &'static str,
    active: &'static str,
    emoji: &'static str,
    noun: &'static str,
    noun_plural: &'static str,
}

fn style_for(tool: &str) -> ToolStyle {
    match tool {
        "Read" | "NotebookRead" => ToolStyle {
            past: "Read",
            active: "Reading",
            emoji: "📖",
            noun: "file",
            noun_plural: "files",
        },
        "Edit" | "Write" | "MultiEdit" | "NotebookEdit" => ToolStyle {
            past: "Edited",
            active: "Editing",
            emoji: "✏️",
            noun: "file",
            noun_plural: "files",
        },
        "Bash" | "Shell" => ToolStyle {
            past: "Ran",
            active: "Running",
            emoji: "💻",
            noun: "command",
            noun_plural: "commands",
        },
        "Grep" | "Glob" | "LS" => ToolStyle {
            past: "Searched",
            active: "Searching",
            emoji: "🔍",
            noun: "search",
            noun_plural: "searches",
        },
        "WebFetch" | "WebSearch" => ToolStyle {
            past: "Fetched",
            active: "Fetching",
            emoji: "🌐",
            noun: "page",
            noun_plural: "pages",
        },
        "Task" => ToolStyle {
            past: "Delegated",
            active: "Delegating",
            emoji: "🤖",
            noun: "task",
            noun_plural: "tasks",
        },
        "message" => ToolStyle {
            past: "Sent",
            active: "Sending",
            emoji: "💬",
            noun: "message",
            noun_plural: "messages",
        },
        _ => ToolStyle {
            past: "Used",
            active: "Using",
            emoji: "🔧",
            noun: "tool call",
            noun_plural: "tool calls",
        },
    }
}

/// "Read 3 files", "Ran 2 commands", "Edited 1 file".
pub fn pluralize(tool: &str, count: usize) -> String {
    let style = style_for(tool);
    let noun = if count == 1 {
        style.noun
    } else {
        style.noun_plural
    };
    format!("{} {count} {noun}", style.past)
}

// ── Tool detail extraction ────────────────────────────────────────────────────

/// Extract a short human-readable detail from a completed tool input.
/// Malformed or empty input degrades to an empty string — never an error.
pub fn tool_detail(tool: &str, input: &Value) -> String {
    let get = |field: &str| input.get(field).and_then(|v| v.as_str());

    if let Some(path) = get("file_path").or_else(|| get("path")).or_else(|| get("notebook_path")) {
        return path.to_string();
    }
    if let Some(command) = get("command") {
        let first_line = command.lines().next().unwrap_or("");
        return truncate(first_line, 80);
    }
    if let Some(url) = get("url") {
        return host_of(url).unwrap_or_else(|| truncate(url, 60));
    }
    if let Some(pattern) = get("pattern").or_else(|| get("query")) {
        return truncate(pattern, 60);
    }
    if tool == "Task" {
        if let Some(desc) = get("description") {
            return truncate(desc, 60);
        }
    }
    String::new()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1)?;
    let host = rest.split(['/', '?', '#']).next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

// ── Tool log grouping ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ToolLogGroup {
    pub name: String,
    pub count: usize,
    pub last_detail: String,
}

/// Ordered log of finished tool calls, grouped by *immediately*
/// consecutive name — a different tool in between starts a new group.
#[derive(Debug, Default, Clone)]
pub struct ToolLog {
    groups: Vec<ToolLogGroup>,
}

impl ToolLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, detail: &str) {
        match self.groups.last_mut() {
            Some(last) if last.name == name => {
                last.count += 1;
                last.last_detail = detail.to_string();
            }
            _ => self.groups.push(ToolLogGroup {
                name: name.to_string(),
                count: 1,
                last_detail: detail.to_string(),
            }),
        }
    }

    pub fn groups(&self) -> &[ToolLogGroup] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Compose the markdown status text: finished groups (older ones collapsed)
/// plus a trailing line for the tool currently running.
pub fn compose_status(log: &ToolLog, current: Option<(&str, &str)>) -> String {
    let mut lines = Vec::new();
    let groups = log.groups();

    if groups.len() > MAX_VISIBLE_GROUPS {
        let hidden = groups.len() - MAX_VISIBLE_GROUPS;
        lines.push(format!("_…{hidden} earlier steps_"));
    }
    let visible_from = groups.len().saturating_sub(MAX_VISIBLE_GROUPS);
    for group in &groups[visible_from..] {
        let style = style_for(&group.name);
        if group.count == 1 && !group.last_detail.is_empty() {
            lines.push(format!(
                "{} {} `{}`",
                style.emoji, style.past, group.last_detail
            ));
        } else {
            lines.push(format!("{} {}", style.emoji, pluralize(&group.name, group.count)));
        }
    }

    if let Some((name, detail)) = current {
        let style = style_for(name);
        if detail.is_empty() {
            lines.push(format!("⏳ {}…", style.active));
        } else {
            lines.push(format!("⏳ {} `{}`…", style.active, detail));
        }
    }

    if lines.is_empty() {
        "🤔 Thinking…".to_string()
    } else {
        lines.join("\n")
    }
}

// ── Status message driver ─────────────────────────────────────────────────────

pub struct StatusDriver {
    adapter: Arc<dyn ChannelAdapter>,
    chat_id: String,
    message_id: Option<String>,
    log: ToolLog,
    current: Option<(String, String)>,
    last_edit: Option<Instant>,
    last_text: String,
    typing: Option<tokio::task::JoinHandle<()>>,
}

impl StatusDriver {
    /// Send the placeholder and start the typing heartbeat.
    pub async fn start(adapter: Arc<dyn ChannelAdapter>, chat_id: &str) -> Self {
        let message_id = match adapter.send(chat_id, "🤔 Thinking…").await {
            Ok(receipt) => Some(receipt.message_id),
            Err(e) => {
                debug!("status placeholder send failed: {e}");
                None
            }
        };

        let typing = {
            let adapter = adapter.clone();
            let chat_id = chat_id.to_string();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(TYPING_INTERVAL);
                loop {
                    tick.tick().await;
                    if let Err(e) = adapter.typing(&chat_id).await {
                        debug!("typing indicator failed: {e}");
                    }
                }
            })
        };

        Self {
            adapter,
            chat_id: chat_id.to_string(),
            message_id,
            log: ToolLog::new(),
            current: None,
            last_edit: None,
            last_text: String::new(),
            typing: Some(typing),
        }
    }

    /// A tool block opened: the previous tool is finished, the new one
    /// becomes the trailing "⏳" line.
    pub async fn on_tool_start(&mut self, name: &str) {
        if let Some((prev_name, prev_detail)) = self.current.take() {
            self.log.push(&prev_name, &prev_detail);
        }
        self.current = Some((name.to_string(), String::new()));
        self.recompose(false).await;
    }

    /// The tool input finished streaming and a detail is available: update
    /// the trailing line and force an edit past the throttle.
    pub async fn on_tool_detail(&mut self, detail: &str) {
        if let Some((_, d)) = self.current.as_mut() {
            if d == detail {
                return;
            }
            *d = detail.to_string();
        }
        self.recompose(true).await;
    }

    async fn recompose(&mut self, force: bool) {
        let Some(message_id) = self.message_id.clone() else {
            return;
        };
        if !force {
            if let Some(last) = self.last_edit {
                if last.elapsed() < EDIT_THROTTLE {
                    return;
                }
            }
        }
        let current = self
            .current
            .as_ref()
            .map(|(n, d)| (n.as_str(), d.as_str()));
        let text = compose_status(&self.log, current);
        if text == self.last_text {
            return;
        }
        if let Err(e) = self.adapter.edit(&self.chat_id, &message_id, &text).await {
            debug!("status edit failed: {e}");
        }
        self.last_text = text;
        self.last_edit = Some(Instant::now());
    }

    /// Turn complete: stop the heartbeat, delete the placeholder, and send
    /// the final text unless the agent already messaged the chat itself.
    pub async fn finish(mut self, final_text: Option<&str>) {
        self.stop_heartbeat();
        if let Some(message_id) = self.message_id.take() {
            if let Err(e) = self.adapter.delete(&self.chat_id, &message_id).await {
                debug!("status delete failed: {e}");
            }
        }
        if let Some(text) = final_text {
            if !text.is_empty() {
                if let Err(e) = self.adapter.send(&self.chat_id, text).await {
                    debug!("final reply send failed: {e}");
                }
            }
        }
    }

    /// Auth-error path: stop the heartbeat but leave the placeholder in
    /// place until the user retries.
    pub fn suspend(mut self) {
        self.stop_heartbeat();
        self.message_id = None;
    }

    fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.typing.take() {
            handle.abort();
        }
    }
}

impl Drop for StatusDriver {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
