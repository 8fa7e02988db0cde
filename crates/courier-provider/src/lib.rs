// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Agent-provider contract.
//!
//! A provider owns the LLM conversation: the gateway starts a *run*, feeds
//! it user input (including mid-run injection), and consumes a stream of
//! [`ProviderMessage`]s until the provider closes the run.  Tool execution
//! happens inside the provider; every tool call is first offered to the
//! gateway through the [`ToolGate`] callback, which is how the tool
//! mediator gets to allow, rewrite, or deny it.
//!
//! # Run lifecycle
//!
//! ```text
//! Gateway                                Provider
//!    │── start(RunRequest, gate) ───────────►│
//!    │◄─ AgentRun { messages, handle } ──────│
//!    │                                       │
//!    │◄─ Init { session_id } ────────────────│   (resume id for next run)
//!    │◄─ Stream { content blocks } × N ──────│
//!    │        gate.check(tool call) ◄────────│   (suspends the turn)
//!    │◄─ User { tool_result } ───────────────│
//!    │◄─ Result { … } ───────────────────────│   (turn complete)
//!    │── handle.inject("more input") ───────►│   (while handle.active())
//!    │◄─ … further turns … ──────────────────│
//!    │── handle.close() ────────────────────►│   (end of input)
//! ```
//!
//! The input side is a bounded queue: `inject` never blocks the caller, and
//! the provider reads it with a cancellable receive.  `close()` signals
//! end-of-input; the provider finishes the current turn and ends the stream.

mod run;
mod scripted;
mod subprocess;

pub use run::{AgentRun, InputEvent, RunControl, RunDriver, RunHandle};
pub use scripted::{ScriptStep, ScriptedProvider};
pub use subprocess::CliProvider;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// One classified message from the provider stream.  The payload stays
/// opaque JSON — the streaming loop digs into the shapes it recognizes and
/// forwards the rest verbatim.
#[derive(Debug, Clone)]
pub enum ProviderMessage {
    /// `system/init` — carries the provider-side session id used for resume.
    Init { session_id: String, raw: Value },
    /// A raw `stream_event` tick (content_block_start / delta / stop).
    Stream { raw: Value },
    /// A complete assistant message (non-streaming providers, sub-agents).
    Assistant { raw: Value },
    /// A user message carrying `tool_result` blocks.
    User { raw: Value },
    /// Per-turn completion with final text, usage, and cost.
    Result { raw: Value },
}

impl ProviderMessage {
    /// The raw JSON payload, whatever the variant.
    pub fn raw(&self) -> &Value {
        match self {
            Self::Init { raw, .. }
            | Self::Stream { raw }
            | Self::Assistant { raw }
            | Self::User { raw }
            | Self::Result { raw } => raw,
        }
    }
}

/// Provider failure taxonomy.  The gateway reacts differently to each kind:
/// stale resume ids are retried once with a fresh start, auth failures start
/// the re-auth flow, everything else terminates the run.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication required")]
    AuthRequired,

    #[error("resume token not found or stale")]
    ResumeStale,

    #[error("{0}")]
    Other(String),
}

/// What the gateway asks a provider to run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// The fully-framed prompt (already sanitized by the gateway).
    pub prompt: String,
    /// Provider-side resume token from a previous run, when available.
    pub resume_id: Option<String>,
    /// Optional model override for this run.
    pub model: Option<String>,
    /// Extra context appended to the prompt (channel metadata etc.).
    pub extra_context: Option<String>,
}

/// Decision returned by the gate for a single tool call.
#[derive(Debug, Clone)]
pub enum ToolDecision {
    /// Proceed; `updated_input` replaces the tool input when present.
    Allow { updated_input: Option<Value> },
    /// Refuse; the reason is surfaced to the model as the tool result.
    Deny { reason: String },
}

/// A tool call the provider is about to execute.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
}

/// Callback the provider invokes before executing any tool.
///
/// The gateway's tool mediator implements this; the call may suspend for a
/// long time while a human decides.
#[async_trait]
pub trait ToolGate: Send + Sync {
    async fn check(&self, call: &ToolCall) -> ToolDecision;
}

/// The agent provider: starts runs and handles the OAuth surface the
/// gateway needs for mid-run re-auth.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Start a run.  Returns the message stream plus a live handle.
    async fn start(
        &self,
        req: RunRequest,
        gate: Arc<dyn ToolGate>,
    ) -> Result<AgentRun, ProviderError>;

    /// Build an OAuth authorization URL for the re-auth flow.
    fn auth_url(&self) -> anyhow::Result<String> {
        anyhow::bail!("provider {} does not support OAuth", self.name())
    }

    /// Exchange a pasted OAuth code (PKCE) for fresh credentials.
    async fn exchange_code(&self, _code: &str) -> anyhow::Result<()> {
        anyhow::bail!("provider {} does not support OAuth", self.name())
    }
}
