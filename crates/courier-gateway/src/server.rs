// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Gateway startup — assembles the HTTP/WS surface and the background
//! housekeeping tasks, then serves until shutdown.
//!
//! # Startup sequence
//!
//! 1. Ensure the data directory exists.
//! 2. Load or generate the gateway token (0600, refuse loose permissions).
//! 3. Load or generate the TLS certificate (unless TLS is disabled).
//! 4. Bind the port — if a stale instance holds it, one kill-and-retry
//!    after 500 ms, then give up with a configuration error.
//! 5. Write the pid file.
//! 6. Spawn housekeeping: fan-out backpressure sweeper, event-log
//!    retention sweep (5 min), owner-store flusher, calendar scheduler.
//! 7. Serve `/ws` and `/health` until SIGINT, then flush and exit 0.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use tracing::{info, warn};

use courier_core::Dispatcher;

use crate::rpc::RpcState;
use crate::token::GatewayToken;
use crate::ws::{health_handler, ws_handler, GatewayState};
use crate::{fswatch::WatchRegistry, tls};

/// Serve the gateway until shutdown.  Consumes the calling task.
pub async fn serve(dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let ctx = dispatcher.ctx().clone();
    let (bind, tls_enabled, data_dir, token_path, cert_dir, allowed_origins, retention_hours) = {
        let config = ctx.config.read().await;
        let data_dir = config.data_dir();
        (
            config.http.bind.clone(),
            config.http.tls,
            data_dir.clone(),
            config
                .http
                .token_file
                .clone()
                .unwrap_or_else(|| data_dir.join("gateway-token")),
            config
                .http
                .tls_cert_dir
                .clone()
                .unwrap_or_else(|| data_dir.join("tls")),
            config.http.allowed_origins.clone(),
            config.session.retention_hours,
        )
    };

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let token = GatewayToken::load_or_generate(&token_path)?;
    info!(token_file = %token_path.display(), "gateway token ready");

    // ── Bind, with one stale-instance takeover ───────────────────────────────
    let pid_path = data_dir.join("courier.pid");
    let listener = bind_with_takeover(&bind, &pid_path).await?;
    listener
        .set_nonblocking(true)
        .context("configuring listener")?;
    std::fs::write(&pid_path, std::process::id().to_string())
        .with_context(|| format!("writing pid file {}", pid_path.display()))?;

    // ── Housekeeping tasks ───────────────────────────────────────────────────
    tokio::spawn(ctx.bus.clone().run_sweeper());
    tokio::spawn(ctx.owners.clone().run_flusher());
    tokio::spawn(courier_core::calendar::run_scheduler(
        ctx.calendar.clone(),
        dispatcher.clone(),
    ));
    {
        let store = ctx.store.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(300));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let cutoff = Utc::now().timestamp_millis() - (retention_hours as i64) * 3_600_000;
                if let Err(e) = store.cleanup_older_than(cutoff) {
                    warn!("retention sweep failed: {e}");
                }
            }
        });
    }

    // ── Router ───────────────────────────────────────────────────────────────
    let state = Arc::new(GatewayState {
        rpc: RpcState {
            dispatcher: dispatcher.clone(),
            watches: WatchRegistry::new(ctx.bus.clone()),
        },
        token,
        allowed_origins,
        started_at: std::time::Instant::now(),
        tls: tls_enabled,
    });
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    info!(bind = %bind, tls = tls_enabled, "gateway listening");

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        let owners = ctx.owners.clone();
        let pid_path = pid_path.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                let _ = owners.flush().await;
                let _ = std::fs::remove_file(&pid_path);
                handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
            }
        });
    }

    if tls_enabled {
        let runtime = tls::load_or_generate(&cert_dir)?;
        info!(fingerprint = %runtime.fingerprint_sha256, "TLS enabled");
        let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &runtime.cert_path,
            &runtime.key_path,
        )
        .await
        .context("loading TLS material")?;
        axum_server::from_tcp_rustls(listener, rustls)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("HTTPS server failed")?;
    } else {
        warn!("TLS is disabled — plain WebSocket only, local development mode");
        axum_server::from_tcp(listener)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("HTTP server failed")?;
    }

    Ok(())
}

/// Bind the listener.  When the port is taken by a stale instance (its pid
/// recorded in our pid file), send it a TERM, wait 500 ms, and retry once.
async fn bind_with_takeover(
    bind: &str,
    pid_path: &Path,
) -> anyhow::Result<std::net::TcpListener> {
    match std::net::TcpListener::bind(bind) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            warn!(bind, "port in use — attempting stale-instance takeover");
            kill_stale_instance(pid_path);
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            std::net::TcpListener::bind(bind)
                .with_context(|| format!("port {bind} is still in use after takeover attempt"))
        }
        Err(e) => Err(e).with_context(|| format!("binding {bind}")),
    }
}

fn kill_stale_instance(pid_path: &Path) {
    let Ok(raw) = std::fs::read_to_string(pid_path) else {
        return;
    };
    let Ok(pid) = raw.trim().parse::<u32>() else {
        return;
    };
    if pid == std::process::id() {
        return;
    }
    info!(pid, "terminating stale gateway instance");
    let _ = std::process::Command::new("kill")
        .arg(pid.to_string())
        .status();
}

/// Default pid-file path helper for the CLI.
pub fn pid_path(data_dir: &Path) -> PathBuf {
    data_dir.join("courier.pid")
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_succeeds_on_a_free_port() {
        let dir = tempfile::tempdir().unwrap();
        let listener = bind_with_takeover("127.0.0.1:0", &dir.path().join("courier.pid"))
            .await
            .unwrap();
        assert!(listener.local_addr().is_ok());
    }

    #[tokio::test]
    async fn bind_reports_busy_port_after_retry() {
        let dir = tempfile::tempdir().unwrap();
        // Hold the port with no pid file to kill.
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap().to_string();
        let err = bind_with_takeover(&addr, &dir.path().join("courier.pid"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("still in use"));
    }

    #[test]
    fn stale_pid_parsing_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("courier.pid");
        std::fs::write(&pid_file, "not-a-pid").unwrap();
        // Must not panic or kill anything.
        kill_stale_instance(&pid_file);
    }
}
