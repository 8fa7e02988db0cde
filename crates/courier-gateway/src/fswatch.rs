// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The `fs.*` RPC surface: path-allowlisted file operations and a
//! refcounted watcher registry.
//!
//! Every path is normalized lexically and must fall under one of the
//! configured roots; anything else is rejected with `path not allowed`.
//! Watches are refcounted per path — subscribers track their own refs and
//! release them on disconnect, so one client closing never silences
//! another's watch.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use notify::{RecursiveMode, Watcher};
use serde_json::{json, Value};
use tracing::{debug, warn};

use courier_core::events::GatewayEvent;
use courier_core::fanout::EventBus;

/// Maximum file size `fs.read` returns.
const MAX_READ_BYTES: u64 = 1024 * 1024;

/// Validate `requested` against the allow-list and return the normalized
/// path.  The error string is the RPC error verbatim.
pub fn check_path(roots: &[PathBuf], requested: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(shellexpand_tilde(requested));
    let normalized = normalize(&path).ok_or_else(|| format!("path not allowed: {requested}"))?;
    if roots.iter().any(|root| normalized.starts_with(root)) {
        Ok(normalized)
    } else {
        Err(format!("path not allowed: {requested}"))
    }
}

fn shellexpand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Lexical normalization: resolve `.` and reject `..` without touching
/// the filesystem (targets may not exist yet).
fn normalize(path: &Path) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => return None,
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    Some(out)
}

// ── File operations ───────────────────────────────────────────────────────────

pub fn list(path: &Path) -> Result<Value, String> {
    let entries = std::fs::read_dir(path).map_err(|e| format!("listing {path:?}: {e}"))?;
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let meta = entry.metadata().ok();
        out.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "isDir": meta.as_ref().map(|m| m.is_dir()).unwrap_or(false),
            "size": meta.map(|m| m.len()).unwrap_or(0),
        }));
    }
    out.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Ok(json!({"entries": out}))
}

pub fn read(path: &Path) -> Result<Value, String> {
    let meta = std::fs::metadata(path).map_err(|e| format!("reading {path:?}: {e}"))?;
    if meta.len() > MAX_READ_BYTES {
        return Err(format!("file too large: {} bytes", meta.len()));
    }
    let content = std::fs::read_to_string(path).map_err(|e| format!("reading {path:?}: {e}"))?;
    Ok(json!({"content": content}))
}

pub fn write(path: &Path, content: &str) -> Result<Value, String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("creating {parent:?}: {e}"))?;
    }
    std::fs::write(path, content).map_err(|e| format!("writing {path:?}: {e}"))?;
    Ok(json!({"ok": true}))
}

pub fn mkdir(path: &Path) -> Result<Value, String> {
    std::fs::create_dir_all(path).map_err(|e| format!("creating {path:?}: {e}"))?;
    Ok(json!({"ok": true}))
}

pub fn delete(path: &Path) -> Result<Value, String> {
    let meta = std::fs::metadata(path).map_err(|e| format!("deleting {path:?}: {e}"))?;
    if meta.is_dir() {
        // Only empty directories; recursive deletion stays manual.
        std::fs::remove_dir(path).map_err(|e| format!("deleting {path:?}: {e}"))?;
    } else {
        std::fs::remove_file(path).map_err(|e| format!("deleting {path:?}: {e}"))?;
    }
    Ok(json!({"ok": true}))
}

pub fn rename(from: &Path, to: &Path) -> Result<Value, String> {
    std::fs::rename(from, to).map_err(|e| format!("renaming {from:?}: {e}"))?;
    Ok(json!({"ok": true}))
}

// ── Watcher registry ──────────────────────────────────────────────────────────

struct WatchEntry {
    refcount: usize,
    // Held for its Drop: dropping the watcher stops the native watch.
    _watcher: notify::RecommendedWatcher,
}

pub struct WatchRegistry {
    inner: StdMutex<HashMap<PathBuf, WatchEntry>>,
    event_tx: tokio::sync::mpsc::UnboundedSender<(PathBuf, String)>,
}

impl WatchRegistry {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        let (event_tx, mut event_rx) =
            tokio::sync::mpsc::unbounded_channel::<(PathBuf, String)>();
        tokio::spawn(async move {
            while let Some((path, kind)) = event_rx.recv().await {
                bus.publish(GatewayEvent::global(
                    "fs.change",
                    json!({"path": path.to_string_lossy(), "kind": kind}),
                ))
                .await;
            }
        });
        Arc::new(Self {
            inner: StdMutex::new(HashMap::new()),
            event_tx,
        })
    }

    /// Add a ref for `path`, creating the native watcher on the first one.
    pub fn start(&self, path: &Path) -> Result<(), String> {
        let mut inner = self.inner.lock().expect("watch registry poisoned");
        if let Some(entry) = inner.get_mut(path) {
            entry.refcount += 1;
            return Ok(());
        }

        let tx = self.event_tx.clone();
        let watched = path.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let kind = format!("{:?}", event.kind);
                    for path in event.paths {
                        let _ = tx.send((path, kind.clone()));
                    }
                }
                Err(e) => warn!("watch error on {}: {e}", watched.display()),
            }
        })
        .map_err(|e| format!("creating watcher: {e}"))?;

        watcher
            .watch(path, RecursiveMode::Recursive)
            .map_err(|e| format!("watching {path:?}: {e}"))?;

        debug!(path = %path.display(), "fs watch started");
        inner.insert(
            path.to_path_buf(),
            WatchEntry {
                refcount: 1,
                _watcher: watcher,
            },
        );
        Ok(())
    }

    /// Drop one ref; the native watcher dies with the last one.
    pub fn stop(&self, path: &Path) {
        let mut inner = self.inner.lock().expect("watch registry poisoned");
        if let Some(entry) = inner.get_mut(path) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                inner.remove(path);
                debug!(path = %path.display(), "fs watch stopped");
            }
        }
    }

    pub fn refcount(&self, path: &Path) -> usize {
        self.inner
            .lock()
            .expect("watch registry poisoned")
            .get(path)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
