// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Rendezvous tables for approvals and questions.
//!
//! Every entry is a one-shot: the first resolver wins (RPC, channel
//! callback, or timeout), later attempts get `UnknownRequest`.  The party
//! that awaits the receiver applies its own timeout and calls `cancel` so
//! abandoned entries do not leak.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum PendingError {
    #[error("unknown request id: {0}")]
    UnknownRequest(String),
}

/// Outcome of an approval rendezvous.
#[derive(Debug)]
pub struct ApprovalVerdict {
    pub approved: bool,
    pub reason: Option<String>,
    /// Replacement tool input supplied by the approver.
    pub updated_input: Option<Value>,
}

struct PendingApproval {
    session_key: String,
    tool_name: String,
    input: Value,
    tx: oneshot::Sender<ApprovalVerdict>,
}

/// One question with its option labels.
#[derive(Debug, Clone)]
pub struct QuestionSpec {
    pub question: String,
    pub options: Vec<String>,
}

struct PendingQuestion {
    questions: Vec<QuestionSpec>,
    /// Answers keyed by question text.
    tx: oneshot::Sender<HashMap<String, String>>,
}

struct PendingChannelQuestion {
    options: Vec<String>,
    tx: oneshot::Sender<(usize, String)>,
}

#[derive(Default)]
pub struct PendingTables {
    approvals: Mutex<HashMap<String, PendingApproval>>,
    questions: Mutex<HashMap<String, PendingQuestion>>,
    channel_questions: Mutex<HashMap<String, PendingChannelQuestion>>,
}

impl PendingTables {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Approvals ────────────────────────────────────────────────────────────

    pub async fn create_approval(
        &self,
        request_id: &str,
        session_key: &str,
        tool_name: &str,
        input: Value,
    ) -> oneshot::Receiver<ApprovalVerdict> {
        let (tx, rx) = oneshot::channel();
        self.approvals.lock().await.insert(
            request_id.to_string(),
            PendingApproval {
                session_key: session_key.to_string(),
                tool_name: tool_name.to_string(),
                input,
                tx,
            },
        );
        rx
    }

    /// Resolve an approval.  First writer wins; an unknown id (already
    /// resolved, timed out, or never created) is an error for the caller.
    pub async fn resolve_approval(
        &self,
        request_id: &str,
        verdict: ApprovalVerdict,
    ) -> Result<(), PendingError> {
        let pending = self
            .approvals
            .lock()
            .await
            .remove(request_id)
            .ok_or_else(|| PendingError::UnknownRequest(request_id.to_string()))?;
        // The waiter may have given up; that is not the resolver's problem.
        let _ = pending.tx.send(verdict);
        Ok(())
    }

    pub async fn cancel_approval(&self, request_id: &str) {
        self.approvals.lock().await.remove(request_id);
    }

    /// Snapshot of outstanding approvals for `tool.pending`.
    pub async fn pending_approvals(&self) -> Vec<Value> {
        self.approvals
            .lock()
            .await
            .iter()
            .map(|(id, p)| {
                json!({
                    "requestId": id,
                    "sessionKey": p.session_key,
                    "toolName": p.tool_name,
                    "input": p.input,
                })
            })
            .collect()
    }

    // ── Desktop questions ────────────────────────────────────────────────────

    pub async fn create_question(
        &self,
        request_id: &str,
        questions: Vec<QuestionSpec>,
    ) -> oneshot::Receiver<HashMap<String, String>> {
        let (tx, rx) = oneshot::channel();
        self.questions
            .lock()
            .await
            .insert(request_id.to_string(), PendingQuestion { questions, tx });
        rx
    }

    pub async fn resolve_question(
        &self,
        request_id: &str,
        answers: HashMap<String, String>,
    ) -> Result<(), PendingError> {
        let pending = self
            .questions
            .lock()
            .await
            .remove(request_id)
            .ok_or_else(|| PendingError::UnknownRequest(request_id.to_string()))?;
        let _ = pending.tx.send(answers);
        Ok(())
    }

    pub async fn cancel_question(&self, request_id: &str) -> Option<Vec<QuestionSpec>> {
        self.questions
            .lock()
            .await
            .remove(request_id)
            .map(|p| p.questions)
    }

    // ── Channel questions ────────────────────────────────────────────────────

    pub async fn create_channel_question(
        &self,
        request_id: &str,
        options: Vec<String>,
    ) -> oneshot::Receiver<(usize, String)> {
        let (tx, rx) = oneshot::channel();
        self.channel_questions
            .lock()
            .await
            .insert(request_id.to_string(), PendingChannelQuestion { options, tx });
        rx
    }

    /// Resolve by index; the label is looked up from the stored options when
    /// the transport only carries the index (inline keyboards).
    pub async fn resolve_channel_question(
        &self,
        request_id: &str,
        index: usize,
        label: Option<String>,
    ) -> Result<(), PendingError> {
        let pending = self
            .channel_questions
            .lock()
            .await
            .remove(request_id)
            .ok_or_else(|| PendingError::UnknownRequest(request_id.to_string()))?;
        let label = label
            .filter(|l| !l.is_empty())
            .or_else(|| pending.options.get(index).cloned())
            .unwrap_or_default();
        let _ = pending.tx.send((index, label));
        Ok(())
    }

    pub async fn cancel_channel_question(&self, request_id: &str) {
        self.channel_questions.lock().await.remove(request_id);
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
