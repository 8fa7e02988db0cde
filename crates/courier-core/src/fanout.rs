// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Client fan-out: persist-then-broadcast with batching, backpressure, and
//! cursor replay.
//!
//! # Ordering discipline
//!
//! `publish` appends keyed events to the store *first*; the assigned `seq`
//! is stamped onto the event and only then is the event offered to
//! subscribers — all of them under one lock, so per-subscriber delivery
//! order equals seq order.  `subscribe` takes the same lock while it
//! replays the log and extends the subscription set, which is what makes
//! replay-then-live seamless: no event can slip between the replayed tail
//! and the first live delivery, and a per-key floor drops the one race that
//! remains (an append that finished before the replay query but whose
//! broadcast was still waiting on the lock).
//!
//! # Backpressure
//!
//! Each subscriber counts the bytes sitting in its outbound frame queue.
//! Above the high watermark, `agent.stream` events for a key are skipped
//! and the key is marked stale; everything else is still delivered.  A
//! ~500 ms sweep watches for drained queues and heals stale keys with a
//! `session.snapshot`, after which live streaming resumes.
//!
//! # Batching
//!
//! `agent.stream` ticks coalesce per subscriber for up to 16 ms; a single
//! pending event flushes verbatim, several flush as one
//! `agent.stream_batch` envelope.  Any other event type flushes the
//! pending batch ahead of itself so relative order is preserved.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use courier_store::{Store, StoreError, StoredEvent};

use crate::events::{GatewayEvent, EV_SESSION_SNAPSHOT, EV_STREAM_BATCH};
use crate::snapshot::SnapshotTable;

/// Skip stream events for a subscriber buffering more than this.
pub const HIGH_WATERMARK: usize = 64 * 1024;
/// Heal stale keys once the buffer drains below this.
pub const LOW_WATERMARK: usize = 8 * 1024;
/// Stream coalescing window.
pub const BATCH_DEADLINE: Duration = Duration::from_millis(16);
/// Backpressure recovery sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Shared per-subscriber state, touched by `publish`, the batcher task,
/// the recovery sweep, and the transport writer.
pub struct SubscriberShared {
    pub id: u64,
    subscribed_keys: StdMutex<HashSet<String>>,
    stale_keys: StdMutex<HashSet<String>>,
    /// Per-key replay floor: live events at or below it were already
    /// replayed and must not be delivered again.
    replay_floor: StdMutex<HashMap<String, i64>>,
    buffered_bytes: AtomicUsize,
    batch_tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl SubscriberShared {
    fn offer(&self, event: &GatewayEvent, high_watermark: usize) {
        if let Some(key) = &event.session_key {
            if !self.subscribed_keys.lock().unwrap().contains(key) {
                return;
            }
            if let (Some(seq), Some(floor)) =
                (event.seq, self.replay_floor.lock().unwrap().get(key))
            {
                if seq <= *floor {
                    return;
                }
            }
            if event.is_stream() && self.buffered_bytes.load(Ordering::Relaxed) > high_watermark {
                self.stale_keys.lock().unwrap().insert(key.clone());
                return;
            }
        }
        let _ = self.batch_tx.send(event.clone());
    }

    fn is_subscribed(&self, key: &str) -> bool {
        self.subscribed_keys.lock().unwrap().contains(key)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Relaxed)
    }

    pub fn stale_keys(&self) -> Vec<String> {
        self.stale_keys.lock().unwrap().iter().cloned().collect()
    }
}

/// The receiving half handed to the transport: serialized frames ready to
/// write.  Popping a frame releases its bytes from the backpressure
/// accounting.
pub struct Subscriber {
    pub shared: Arc<SubscriberShared>,
    frames: mpsc::UnboundedReceiver<String>,
}

impl Subscriber {
    /// Next frame to write, or `None` once the bus dropped the subscriber.
    pub async fn next_frame(&mut self) -> Option<String> {
        let frame = self.frames.recv().await?;
        self.shared
            .buffered_bytes
            .fetch_sub(frame.len(), Ordering::Relaxed);
        Some(frame)
    }

    /// Non-blocking variant for tests and shutdown drains.
    pub fn try_next_frame(&mut self) -> Option<String> {
        let frame = self.frames.try_recv().ok()?;
        self.shared
            .buffered_bytes
            .fetch_sub(frame.len(), Ordering::Relaxed);
        Some(frame)
    }
}

pub struct EventBus {
    store: Arc<Store>,
    snapshots: Arc<SnapshotTable>,
    subscribers: Mutex<HashMap<u64, Arc<SubscriberShared>>>,
    next_id: AtomicU64,
    high_watermark: usize,
    low_watermark: usize,
}

impl EventBus {
    pub fn new(store: Arc<Store>, snapshots: Arc<SnapshotTable>) -> Arc<Self> {
        Arc::new(Self {
            store,
            snapshots,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            high_watermark: HIGH_WATERMARK,
            low_watermark: LOW_WATERMARK,
        })
    }

    /// Test constructor with tiny watermarks.
    pub fn with_watermarks(
        store: Arc<Store>,
        snapshots: Arc<SnapshotTable>,
        high: usize,
        low: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            snapshots,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            high_watermark: high,
            low_watermark: low,
        })
    }

    /// Register an (already authenticated) subscriber and spawn its batcher.
    pub async fn register(&self) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(SubscriberShared {
            id,
            subscribed_keys: StdMutex::new(HashSet::new()),
            stale_keys: StdMutex::new(HashSet::new()),
            replay_floor: StdMutex::new(HashMap::new()),
            buffered_bytes: AtomicUsize::new(0),
            batch_tx,
        });

        tokio::spawn(run_batcher(shared.clone(), batch_rx, frame_tx));

        self.subscribers.lock().await.insert(id, shared.clone());
        debug!(subscriber = id, "subscriber registered");
        Subscriber {
            shared,
            frames: frame_rx,
        }
    }

    /// Drop a subscriber and everything buffered for it.
    pub async fn unregister(&self, id: u64) {
        self.subscribers.lock().await.remove(&id);
        debug!(subscriber = id, "subscriber unregistered");
    }

    /// Persist (when keyed) and deliver one event.
    ///
    /// A store failure drops this event with a log line; it never
    /// propagates into the run that produced it.
    pub async fn publish(&self, mut event: GatewayEvent) {
        if event.is_persisted() {
            let key = event.session_key.as_deref().unwrap_or_default();
            match self.store.append(key, &event.event, &event.data) {
                Ok(seq) => event.seq = Some(seq),
                Err(e) => {
                    warn!(event = %event.event, "event append failed, dropping: {e}");
                    return;
                }
            }
        }
        let subs = self.subscribers.lock().await;
        for sub in subs.values() {
            sub.offer(&event, self.high_watermark);
        }
    }

    /// Update a subscriber's key set and replay the log after `last_seq`.
    ///
    /// Holds the subscriber lock across the replay so no live event can
    /// interleave; returns the number of replayed events.
    pub async fn subscribe(
        &self,
        shared: &Arc<SubscriberShared>,
        keys: &[String],
        last_seq: Option<i64>,
    ) -> Result<usize, StoreError> {
        let subs = self.subscribers.lock().await;

        let replayed: Vec<StoredEvent> = match last_seq {
            Some(after) => self.store.query(keys, after)?,
            None => Vec::new(),
        };
        let floor = replayed.iter().map(|e| e.seq).max();

        for event in &replayed {
            let wire = GatewayEvent {
                event: event.event_type.clone(),
                session_key: Some(event.session_key.clone()),
                seq: Some(event.seq),
                data: event.payload.clone(),
            };
            let _ = shared.batch_tx.send(wire);
        }

        {
            let mut subscribed = shared.subscribed_keys.lock().unwrap();
            let mut floors = shared.replay_floor.lock().unwrap();
            for key in keys {
                subscribed.insert(key.clone());
                if let Some(floor) = floor {
                    floors.insert(key.clone(), floor);
                }
            }
        }

        // Rehydrate any key with a live run.
        for key in keys {
            if let Some(snapshot) = self.snapshots.get(key).await {
                let _ = shared.batch_tx.send(GatewayEvent::keyed(
                    EV_SESSION_SNAPSHOT,
                    key.clone(),
                    snapshot.to_json(key),
                ));
            }
        }

        drop(subs);
        Ok(replayed.len())
    }

    /// Remove keys from a subscription.  Unknown keys are fine.
    pub async fn unsubscribe(&self, shared: &Arc<SubscriberShared>, keys: &[String]) {
        let _subs = self.subscribers.lock().await;
        let mut subscribed = shared.subscribed_keys.lock().unwrap();
        let mut stale = shared.stale_keys.lock().unwrap();
        let mut floors = shared.replay_floor.lock().unwrap();
        for key in keys {
            subscribed.remove(key);
            stale.remove(key);
            floors.remove(key);
        }
    }

    /// One pass of the backpressure recovery sweep.
    pub async fn sweep_once(&self) {
        let subs: Vec<Arc<SubscriberShared>> =
            self.subscribers.lock().await.values().cloned().collect();
        for sub in subs {
            if sub.buffered_bytes.load(Ordering::Relaxed) >= self.low_watermark {
                continue;
            }
            let stale: Vec<String> = {
                let mut set = sub.stale_keys.lock().unwrap();
                set.drain().collect()
            };
            for key in stale {
                if !sub.is_subscribed(&key) {
                    continue;
                }
                let data = match self.snapshots.get(&key).await {
                    Some(snapshot) => snapshot.to_json(&key),
                    // The run may have ended while the client was stale;
                    // an idle snapshot still tells it to re-render.
                    None => json!({"sessionKey": key, "status": "idle"}),
                };
                debug!(subscriber = sub.id, session_key = %key, "backpressure recovered");
                let _ = sub
                    .batch_tx
                    .send(GatewayEvent::keyed(EV_SESSION_SNAPSHOT, key, data));
            }
        }
    }

    /// Background sweep loop; spawn once at startup.
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.sweep_once().await;
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

// ── Per-subscriber batcher ────────────────────────────────────────────────────

async fn run_batcher(
    shared: Arc<SubscriberShared>,
    mut rx: mpsc::UnboundedReceiver<GatewayEvent>,
    frames: mpsc::UnboundedSender<String>,
) {
    let mut batch: Vec<GatewayEvent> = Vec::new();
    let mut deadline = tokio::time::Instant::now();

    loop {
        let event = if batch.is_empty() {
            match rx.recv().await {
                Some(e) => e,
                None => break,
            }
        } else {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(e)) => e,
                Ok(None) => {
                    flush(&shared, &frames, &mut batch);
                    break;
                }
                Err(_) => {
                    flush(&shared, &frames, &mut batch);
                    continue;
                }
            }
        };

        if event.is_stream() {
            if batch.is_empty() {
                deadline = tokio::time::Instant::now() + BATCH_DEADLINE;
            }
            batch.push(event);
        } else {
            flush(&shared, &frames, &mut batch);
            emit(&shared, &frames, event.to_wire().to_string());
        }
    }
}

fn flush(
    shared: &Arc<SubscriberShared>,
    frames: &mpsc::UnboundedSender<String>,
    batch: &mut Vec<GatewayEvent>,
) {
    match batch.len() {
        0 => {}
        1 => emit(shared, frames, batch[0].to_wire().to_string()),
        _ => {
            let data: Vec<serde_json::Value> = batch.iter().map(|e| e.to_wire()).collect();
            let wire = json!({"event": EV_STREAM_BATCH, "data": data});
            emit(shared, frames, wire.to_string());
        }
    }
    batch.clear();
}

fn emit(shared: &Arc<SubscriberShared>, frames: &mpsc::UnboundedSender<String>, frame: String) {
    shared
        .buffered_bytes
        .fetch_add(frame.len(), Ordering::Relaxed);
    if frames.send(frame).is_err() {
        // Transport gone; the batcher will exit when the bus drops us.
        shared.buffered_bytes.store(0, Ordering::Relaxed);
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EV_RESULT, EV_STREAM};

    fn bus() -> (Arc<EventBus>, Arc<SnapshotTable>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let snapshots = Arc::new(SnapshotTable::new());
        (EventBus::new(store, snapshots.clone()), snapshots)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    fn parse(frame: &str) -> serde_json::Value {
        serde_json::from_str(frame).unwrap()
    }

    #[tokio::test]
    async fn stream_events_coalesce_into_one_batch() {
        let (bus, _) = bus();
        let mut sub = bus.register().await;
        bus.subscribe(&sub.shared, &["k1".to_string()], None)
            .await
            .unwrap();

        for n in 0..3 {
            bus.publish(GatewayEvent::keyed(EV_STREAM, "k1", json!({"n": n})))
                .await;
        }
        settle().await;

        let frame = parse(&sub.try_next_frame().expect("no frame"));
        assert_eq!(frame["event"], "agent.stream_batch");
        let items = frame["data"].as_array().unwrap();
        assert_eq!(items.len(), 3);
        // In-order, strictly increasing seq.
        let seqs: Vec<i64> = items.iter().map(|i| i["seq"].as_i64().unwrap()).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert!(sub.try_next_frame().is_none());
    }

    #[tokio::test]
    async fn single_stream_event_flushes_verbatim() {
        let (bus, _) = bus();
        let mut sub = bus.register().await;
        bus.subscribe(&sub.shared, &["k1".to_string()], None)
            .await
            .unwrap();

        bus.publish(GatewayEvent::keyed(EV_STREAM, "k1", json!({"n": 1})))
            .await;
        settle().await;

        let frame = parse(&sub.try_next_frame().unwrap());
        assert_eq!(frame["event"], "agent.stream");
        assert_eq!(frame["data"]["n"], 1);
    }

    #[tokio::test]
    async fn non_stream_event_flushes_pending_batch_first() {
        let (bus, _) = bus();
        let mut sub = bus.register().await;
        bus.subscribe(&sub.shared, &["k1".to_string()], None)
            .await
            .unwrap();

        bus.publish(GatewayEvent::keyed(EV_STREAM, "k1", json!({"n": 1})))
            .await;
        bus.publish(GatewayEvent::keyed(EV_STREAM, "k1", json!({"n": 2})))
            .await;
        bus.publish(GatewayEvent::keyed(EV_RESULT, "k1", json!({"ok": true})))
            .await;
        settle().await;

        let first = parse(&sub.try_next_frame().unwrap());
        assert_eq!(first["event"], "agent.stream_batch");
        let second = parse(&sub.try_next_frame().unwrap());
        assert_eq!(second["event"], "agent.result");
    }

    #[tokio::test]
    async fn events_for_unsubscribed_keys_are_skipped() {
        let (bus, _) = bus();
        let mut sub = bus.register().await;
        bus.subscribe(&sub.shared, &["k1".to_string()], None)
            .await
            .unwrap();

        bus.publish(GatewayEvent::keyed(EV_RESULT, "other", json!({})))
            .await;
        settle().await;
        assert!(sub.try_next_frame().is_none());
    }

    #[tokio::test]
    async fn global_events_reach_every_subscriber() {
        let (bus, _) = bus();
        let mut a = bus.register().await;
        let mut b = bus.register().await;

        bus.publish(GatewayEvent::global(
            crate::events::EV_STATUS_UPDATE,
            json!({"activeRun": false}),
        ))
        .await;
        settle().await;

        assert!(a.try_next_frame().is_some());
        assert!(b.try_next_frame().is_some());
    }

    #[tokio::test]
    async fn replay_then_live_has_no_gaps_or_duplicates() {
        let (bus, _) = bus();

        // Three events land before anyone subscribes.
        for n in 0..3 {
            bus.publish(GatewayEvent::keyed(EV_STREAM, "k1", json!({"n": n})))
                .await;
        }

        let mut sub = bus.register().await;
        let replayed = bus
            .subscribe(&sub.shared, &["k1".to_string()], Some(0))
            .await
            .unwrap();
        assert_eq!(replayed, 3);

        // Two live events follow.
        bus.publish(GatewayEvent::keyed(EV_STREAM, "k1", json!({"n": 3})))
            .await;
        bus.publish(GatewayEvent::keyed(EV_RESULT, "k1", json!({"n": 4})))
            .await;
        settle().await;

        let mut seqs = Vec::new();
        while let Some(frame) = sub.try_next_frame() {
            let v = parse(&frame);
            if v["event"] == "agent.stream_batch" {
                for item in v["data"].as_array().unwrap() {
                    seqs.push(item["seq"].as_i64().unwrap());
                }
            } else if let Some(seq) = v["seq"].as_i64() {
                seqs.push(seq);
            }
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn resubscribe_at_current_cursor_produces_no_duplicates() {
        let (bus, _) = bus();
        let mut sub = bus.register().await;
        bus.subscribe(&sub.shared, &["k1".to_string()], Some(0))
            .await
            .unwrap();

        bus.publish(GatewayEvent::keyed(EV_RESULT, "k1", json!({"n": 1})))
            .await;
        settle().await;
        let frame = parse(&sub.try_next_frame().unwrap());
        let cursor = frame["seq"].as_i64().unwrap();

        bus.unsubscribe(&sub.shared, &["k1".to_string()]).await;
        let replayed = bus
            .subscribe(&sub.shared, &["k1".to_string()], Some(cursor))
            .await
            .unwrap();
        assert_eq!(replayed, 0);
        settle().await;
        assert!(sub.try_next_frame().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_goes_stale_and_recovers_with_snapshot() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let snapshots = Arc::new(SnapshotTable::new());
        let bus = EventBus::with_watermarks(store, snapshots.clone(), 0, 1);

        let mut slow = bus.register().await;
        let mut healthy = bus.register().await;
        for sub in [&slow, &healthy] {
            bus.subscribe(&sub.shared, &["k1".to_string()], None)
                .await
                .unwrap();
        }
        snapshots.create("k1").await;

        // First event lands in both queues (nothing buffered yet).
        bus.publish(GatewayEvent::keyed(EV_STREAM, "k1", json!({"n": 1})))
            .await;
        settle().await;

        // The slow client has not drained: the next stream event is skipped
        // for it and the key goes stale.
        bus.publish(GatewayEvent::keyed(EV_STREAM, "k1", json!({"n": 2})))
            .await;
        settle().await;
        assert_eq!(slow.shared.stale_keys(), vec!["k1".to_string()]);

        // The healthy client saw both.
        let mut healthy_count = 0;
        while let Some(frame) = healthy.try_next_frame() {
            let v = parse(&frame);
            healthy_count += if v["event"] == "agent.stream_batch" {
                v["data"].as_array().unwrap().len()
            } else {
                1
            };
        }
        assert_eq!(healthy_count, 2);

        // Drain the slow client, sweep, and expect a snapshot.
        while slow.try_next_frame().is_some() {}
        bus.sweep_once().await;
        settle().await;
        let frame = parse(&slow.try_next_frame().expect("no recovery frame"));
        assert_eq!(frame["event"], "session.snapshot");
        assert!(slow.shared.stale_keys().is_empty());
    }

    #[tokio::test]
    async fn agent_error_is_delivered_but_not_persisted() {
        let (bus, _) = bus();
        let mut sub = bus.register().await;
        bus.subscribe(&sub.shared, &["k1".to_string()], None)
            .await
            .unwrap();

        bus.publish(GatewayEvent::keyed(
            crate::events::EV_ERROR,
            "k1",
            json!({"message": "boom"}),
        ))
        .await;
        settle().await;

        let frame = parse(&sub.try_next_frame().unwrap());
        assert_eq!(frame["event"], "agent.error");
        assert!(frame.get("seq").is_none());
        assert_eq!(bus.store().last_seq().unwrap(), 0);
    }

    #[tokio::test]
    async fn subscribe_sends_snapshot_for_live_keys() {
        let (bus, snapshots) = bus();
        snapshots.create("k1").await;
        let mut sub = bus.register().await;
        bus.subscribe(&sub.shared, &["k1".to_string()], None)
            .await
            .unwrap();
        settle().await;
        let frame = parse(&sub.try_next_frame().unwrap());
        assert_eq!(frame["event"], "session.snapshot");
    }
}
