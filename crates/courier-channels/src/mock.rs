// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Recording mock adapter for tests.  Every outbound call is appended to a
//! shared log; messages get deterministic ids (`m1`, `m2`, …).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{
    ApprovalRequest, ChannelAdapter, ChannelError, QuestionRequest, SendReceipt,
};

/// One recorded outbound call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Send { chat_id: String, text: String, message_id: String },
    Edit { chat_id: String, message_id: String, text: String },
    Delete { chat_id: String, message_id: String },
    Typing { chat_id: String },
    Approval { chat_id: String, request_id: String, tool_name: String },
    Question { chat_id: String, request_id: String, question: String, options: Vec<String> },
}

#[derive(Default)]
pub struct MockAdapter {
    name: String,
    calls: Mutex<Vec<MockCall>>,
    next_id: AtomicU64,
    /// When true, `send` fails — for exercising best-effort paths.
    pub fail_sends: std::sync::atomic::AtomicBool,
}

impl MockAdapter {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            fail_sends: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Texts of all `Send` calls, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Send { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ChannelAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<SendReceipt, ChannelError> {
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(ChannelError::NotConnected);
        }
        let message_id = format!("m{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.record(MockCall::Send {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            message_id: message_id.clone(),
        });
        Ok(SendReceipt { message_id })
    }

    async fn edit(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.record(MockCall::Edit {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, chat_id: &str, message_id: &str) -> Result<(), ChannelError> {
        self.record(MockCall::Delete {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    async fn typing(&self, chat_id: &str) -> Result<(), ChannelError> {
        self.record(MockCall::Typing {
            chat_id: chat_id.to_string(),
        });
        Ok(())
    }

    async fn send_approval_request(&self, req: &ApprovalRequest) -> Result<(), ChannelError> {
        self.record(MockCall::Approval {
            chat_id: req.chat_id.clone(),
            request_id: req.request_id.clone(),
            tool_name: req.tool_name.clone(),
        });
        Ok(())
    }

    async fn send_question(&self, q: &QuestionRequest) -> Result<(), ChannelError> {
        self.record(MockCall::Question {
            chat_id: q.chat_id.clone(),
            request_id: q.request_id.clone(),
            question: q.question.clone(),
            options: q.options.clone(),
        });
        Ok(())
    }
}
