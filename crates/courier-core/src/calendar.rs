// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Calendar entries — cron-scheduled prompts.
//!
//! Each entry fires its prompt onto the session key `calendar:dm:<id>`.
//! Expressions are standard 5-field cron; a seconds field of `0` is
//! prepended internally because the `cron` crate parses 6/7 fields.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CalendarEntry {
    pub id: String,
    /// The 5-field expression as the user wrote it.
    pub cron: String,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

impl CalendarEntry {
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "cron": self.cron,
            "prompt": self.prompt,
            "createdAt": self.created_at.to_rfc3339(),
        })
    }

    fn schedule(&self) -> Option<Schedule> {
        parse_cron(&self.cron).ok()
    }
}

/// Parse a 5-field cron expression (minute hour dom month dow).
pub fn parse_cron(expr: &str) -> anyhow::Result<Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {expr}"),
        6 | 7 => expr.to_string(),
        _ => anyhow::bail!("cron expression must have 5 fields: {expr}"),
    };
    Schedule::from_str(&normalized).map_err(|e| anyhow::anyhow!("invalid cron {expr:?}: {e}"))
}

#[derive(Default)]
pub struct CalendarStore {
    entries: Mutex<HashMap<String, CalendarEntry>>,
}

impl CalendarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, cron: &str, prompt: &str) -> anyhow::Result<CalendarEntry> {
        parse_cron(cron)?;
        let entry = CalendarEntry {
            id: Uuid::new_v4().to_string(),
            cron: cron.to_string(),
            prompt: prompt.to_string(),
            created_at: Utc::now(),
        };
        info!(id = %entry.id, cron = %entry.cron, "calendar entry added");
        self.entries
            .lock()
            .await
            .insert(entry.id.clone(), entry.clone());
        Ok(entry)
    }

    /// Idempotent: removing an unknown id returns false.
    pub async fn remove(&self, id: &str) -> bool {
        self.entries.lock().await.remove(id).is_some()
    }

    pub async fn list(&self) -> Vec<Value> {
        let entries = self.entries.lock().await;
        let mut list: Vec<&CalendarEntry> = entries.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list.iter().map(|e| e.to_json()).collect()
    }

    /// Entries whose schedule fires in `(after, until]`.
    pub async fn due_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<CalendarEntry> {
        let entries = self.entries.lock().await;
        entries
            .values()
            .filter(|e| match e.schedule() {
                Some(schedule) => schedule
                    .after(&after)
                    .next()
                    .map(|t| t <= until)
                    .unwrap_or(false),
                None => {
                    warn!(id = %e.id, "calendar entry has an unparseable expression");
                    false
                }
            })
            .cloned()
            .collect()
    }
}

/// Scheduler loop: checks for due entries twice a minute and dispatches
/// their prompts.  Spawned once at startup.
pub async fn run_scheduler(
    store: Arc<CalendarStore>,
    dispatcher: Arc<crate::dispatch::Dispatcher>,
) {
    let mut last_check = Utc::now();
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(30));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let now = Utc::now();
        for entry in store.due_between(last_check, now).await {
            info!(id = %entry.id, "calendar entry firing");
            dispatcher.dispatch_calendar(&entry).await;
        }
        last_check = now;
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_parse() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 9 * * 1").is_ok());
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("* * *").is_err());
    }

    #[tokio::test]
    async fn add_rejects_invalid_expressions() {
        let store = CalendarStore::new();
        assert!(store.add("nope", "hello").await.is_err());
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn add_list_remove_round_trip() {
        let store = CalendarStore::new();
        let entry = store.add("0 9 * * *", "daily report").await.unwrap();
        let list = store.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["prompt"], "daily report");

        assert!(store.remove(&entry.id).await);
        assert!(!store.remove(&entry.id).await);
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn due_between_finds_entries_in_window() {
        let store = CalendarStore::new();
        store.add("*/1 * * * *", "every minute").await.unwrap();

        let after = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 30).unwrap();
        let until = Utc.with_ymd_and_hms(2026, 1, 1, 12, 2, 0).unwrap();
        assert_eq!(store.due_between(after, until).await.len(), 1);

        // A 10-second window between minute marks has nothing due.
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 10).unwrap();
        let until = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 20).unwrap();
        assert!(store.due_between(after, until).await.is_empty());
    }
}
