// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-session run queues.
//!
//! Each session key owns one FIFO and one executor task; at most one run
//! executes per key, ever.  Enqueue is fire-and-forget.  When a task
//! finishes and more tasks queued up behind it, the executor drains them
//! into a single consolidated prompt before starting the next run.
//!
//! Mid-run injection goes around the queue: if the key's run holds a live
//! provider handle, the new text is pushed straight into the running
//! conversation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

use courier_provider::RunHandle;

use crate::context::{ChannelMeta, GatewayContext};
use crate::registry::SessionKey;
use crate::stream::run_streaming_loop;

/// One enqueued prompt (plus context) on a session key.
#[derive(Debug, Clone)]
pub struct RunTask {
    pub session_key: SessionKey,
    pub prompt: String,
    /// Present when the run originated on a messaging channel.
    pub channel: Option<ChannelMeta>,
    pub extra_context: Option<String>,
}

struct KeyQueue {
    tx: mpsc::UnboundedSender<RunTask>,
    /// The provider handle of the executing run, while one is open.
    live: Arc<Mutex<Option<RunHandle>>>,
    /// Cancels the executing run.
    cancel: Arc<std::sync::Mutex<Option<oneshot::Sender<()>>>>,
}

pub struct RunQueues {
    ctx: Arc<GatewayContext>,
    queues: Mutex<HashMap<String, KeyQueue>>,
}

impl RunQueues {
    pub fn new(ctx: Arc<GatewayContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            queues: Mutex::new(HashMap::new()),
        })
    }

    /// Append a run task to its key's FIFO, spawning the key's executor on
    /// first use.
    pub async fn enqueue(&self, task: RunTask) {
        let key_str = task.session_key.to_string();
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(key_str.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let live = Arc::new(Mutex::new(None));
            let cancel = Arc::new(std::sync::Mutex::new(None));
            tokio::spawn(run_executor(
                self.ctx.clone(),
                key_str.clone(),
                rx,
                live.clone(),
                cancel.clone(),
            ));
            KeyQueue { tx, live, cancel }
        });
        debug!(session_key = %key_str, "run task enqueued");
        let _ = queue.tx.send(task);
    }

    /// Push text into the key's live run, if one is open.  Returns false
    /// when there is no live handle — the caller should queue instead.
    pub async fn try_inject(&self, key: &SessionKey, text: &str) -> bool {
        let queues = self.queues.lock().await;
        let Some(queue) = queues.get(&key.to_string()) else {
            return false;
        };
        let live = queue.live.lock().await;
        match live.as_ref() {
            Some(handle) if handle.active() => handle.inject(text).is_ok(),
            _ => false,
        }
    }

    /// Abort the key's executing run, if any.  Queued tasks behind it are
    /// untouched.
    pub async fn abort(&self, key: &SessionKey) -> bool {
        let queues = self.queues.lock().await;
        let Some(queue) = queues.get(&key.to_string()) else {
            return false;
        };
        let cancel = queue.cancel.lock().expect("cancel mutex poisoned").take();
        match cancel {
            Some(tx) => {
                info!(session_key = %key, "abort requested");
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// The live handle for a key, when its run keeps the conversation open.
    pub async fn live_handle(&self, key: &SessionKey) -> Option<RunHandle> {
        let queues = self.queues.lock().await;
        let queue = queues.get(&key.to_string())?;
        let live = queue.live.lock().await;
        live.clone().filter(|h| h.active())
    }
}

async fn run_executor(
    ctx: Arc<GatewayContext>,
    key_str: String,
    mut rx: mpsc::UnboundedReceiver<RunTask>,
    live: Arc<Mutex<Option<RunHandle>>>,
    cancel: Arc<std::sync::Mutex<Option<oneshot::Sender<()>>>>,
) {
    while let Some(mut task) = rx.recv().await {
        // Consolidate the queued batch into a single prompt.
        let mut extra = 0usize;
        while let Ok(next) = rx.try_recv() {
            task.prompt.push_str("\n\n");
            task.prompt.push_str(&next.prompt);
            extra += 1;
        }
        if extra > 0 {
            debug!(session_key = %key_str, queued = extra, "consolidated queued prompts");
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        *cancel.lock().expect("cancel mutex poisoned") = Some(cancel_tx);

        run_streaming_loop(ctx.clone(), task, cancel_rx, live.clone()).await;

        *cancel.lock().expect("cancel mutex poisoned") = None;
    }
}
