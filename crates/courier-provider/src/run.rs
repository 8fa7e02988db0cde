// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Live run plumbing shared by every provider implementation.
//!
//! [`RunDriver`] is the provider-side half: it owns the message sender, the
//! input receiver, and the shared `active` flag.  [`RunHandle`] is the
//! gateway-side half; it is cheap to clone and safe to poke from any task.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::{ProviderError, ProviderMessage};

/// Input fed into a live run.
#[derive(Debug, Clone)]
pub enum InputEvent {
    /// An additional user turn injected without ending the run.
    Text(String),
    /// End-of-input: finish the current turn and close the stream.
    Close,
}

/// Out-of-band control for a live run.
#[derive(Debug, Clone)]
pub enum RunControl {
    Interrupt,
    SetModel(String),
    StopTask(String),
    McpServerStatus(tokio::sync::mpsc::Sender<Value>),
}

/// Gateway-side handle on an executing run.
#[derive(Clone)]
pub struct RunHandle {
    active: Arc<AtomicBool>,
    input_tx: mpsc::Sender<InputEvent>,
    control_tx: mpsc::UnboundedSender<RunControl>,
}

impl RunHandle {
    /// True while the provider keeps the conversation open for injection.
    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Push a user message into the running conversation without ending the
    /// turn.  Never blocks: the queue is bounded and a full queue is an error.
    pub fn inject(&self, text: impl Into<String>) -> anyhow::Result<()> {
        self.input_tx
            .try_send(InputEvent::Text(text.into()))
            .map_err(|_| anyhow::anyhow!("run input queue is full or closed"))
    }

    /// Signal end-of-input.  The provider finishes the current turn and
    /// closes the message stream.
    pub fn close(&self) {
        let _ = self.input_tx.try_send(InputEvent::Close);
    }

    pub fn interrupt(&self) {
        let _ = self.control_tx.send(RunControl::Interrupt);
    }

    pub fn set_model(&self, name: impl Into<String>) {
        let _ = self.control_tx.send(RunControl::SetModel(name.into()));
    }

    pub fn stop_task(&self, task_id: impl Into<String>) {
        let _ = self.control_tx.send(RunControl::StopTask(task_id.into()));
    }

    /// Ask the provider for its MCP server status table.
    pub async fn mcp_server_status(&self) -> anyhow::Result<Value> {
        let (tx, mut rx) = mpsc::channel(1);
        self.control_tx
            .send(RunControl::McpServerStatus(tx))
            .map_err(|_| anyhow::anyhow!("run control channel closed"))?;
        rx.recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("provider dropped status request"))
    }
}

/// A started run, as seen by the gateway.
pub struct AgentRun {
    /// Ordered provider messages; `Err` terminates the run.
    pub messages: mpsc::Receiver<Result<ProviderMessage, ProviderError>>,
    pub handle: RunHandle,
}

/// Provider-side half of a run.  Created together with [`AgentRun`] via
/// [`RunDriver::new_pair`].
pub struct RunDriver {
    pub msg_tx: mpsc::Sender<Result<ProviderMessage, ProviderError>>,
    pub input_rx: mpsc::Receiver<InputEvent>,
    pub control_rx: mpsc::UnboundedReceiver<RunControl>,
    active: Arc<AtomicBool>,
}

impl RunDriver {
    /// Build the connected (gateway, provider) pair.  `input_capacity`
    /// bounds the injection queue.
    pub fn new_pair(input_capacity: usize) -> (AgentRun, RunDriver) {
        let (msg_tx, msg_rx) = mpsc::channel(256);
        let (input_tx, input_rx) = mpsc::channel(input_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));

        let handle = RunHandle {
            active: active.clone(),
            input_tx,
            control_tx,
        };
        let run = AgentRun {
            messages: msg_rx,
            handle,
        };
        let driver = RunDriver {
            msg_tx,
            input_rx,
            control_rx,
            active,
        };
        (run, driver)
    }

    /// Flip the shared `active` flag (visible through `RunHandle::active`).
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
