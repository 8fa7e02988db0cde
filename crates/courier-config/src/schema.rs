// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_http_bind() -> String {
    "127.0.0.1:18789".to_string()
}
fn default_true() -> bool {
    true
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub fs: FsConfig,
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Data directory for the token file, TLS material, the event database,
    /// the owner chat-id store, and the pid file.
    /// Defaults to `~/.courier/`.
    pub data_dir: Option<PathBuf>,
}

/// The agent-provider subprocess the gateway drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Agent CLI binary. The gateway speaks line-delimited stream JSON to
    /// it over stdin/stdout.
    #[serde(default = "default_provider_command")]
    pub command: String,

    /// Extra arguments prepended before the built-in stream flags.
    #[serde(default)]
    pub args: Vec<String>,

    /// Default model override passed on each run, when set.
    pub model: Option<String>,
}

fn default_provider_command() -> String {
    "claude".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: default_provider_command(),
            args: Vec::new(),
            model: None,
        }
    }
}

impl GatewayConfig {
    /// Resolved data directory (`data_dir` or `~/.courier/`).
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".courier")
}

/// HTTP/WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// `host:port` to listen on. Default: `127.0.0.1:18789` (loopback only).
    #[serde(default = "default_http_bind")]
    pub bind: String,

    /// TLS is **enabled by default** with an auto-generated self-signed
    /// ECDSA P-256 certificate. Disable only for local development.
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Directory where the auto-generated certificate and private key are
    /// stored. Defaults to `<data_dir>/tls/`.
    pub tls_cert_dir: Option<PathBuf>,

    /// Path to the gateway token file (64 hex chars, mode 0600).
    /// Defaults to `<data_dir>/gateway-token`.
    pub token_file: Option<PathBuf>,

    /// Origins allowed for browser clients. Connections without an `Origin`
    /// header (native clients) are always accepted.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
            tls: true,
            tls_cert_dir: None,
            token_file: None,
            allowed_origins: Vec::new(),
        }
    }
}

/// Messaging channel transports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    pub telegram: Option<TelegramConfig>,
    pub whatsapp: Option<WhatsAppConfig>,
}

/// Telegram Bot API transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token from @BotFather (`123456:ABC-…`).
    pub bot_token: String,

    /// When true (the default), messages from chats not in the owner
    /// chat-id store are ignored.
    #[serde(default = "default_true")]
    pub owner_only: bool,
}

/// WhatsApp transport — a local bridge process owns the QR/link session;
/// the gateway speaks JSON to it over a WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    /// WebSocket URL of the bridge, e.g. `ws://127.0.0.1:3001/ws`.
    pub bridge_url: String,

    #[serde(default = "default_true")]
    pub owner_only: bool,
}

/// Tool mediation: operating mode plus layered allow/deny policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Operating mode overlay applied after classification.
    #[serde(default)]
    pub mode: GatewayMode,

    /// Tool names that are always denied, before any other layer.
    /// Credential access stays here even in autonomous mode.
    #[serde(default = "default_hard_deny")]
    pub hard_deny: Vec<String>,

    /// Global allow/deny lists by tool name, applied after per-channel
    /// policies and before classification.
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,

    /// Per-channel policies keyed by channel name (`telegram`, `whatsapp`,
    /// `desktop`, …). Applied first.
    #[serde(default)]
    pub channel_policies: HashMap<String, ChannelPolicy>,
}

fn default_hard_deny() -> Vec<String> {
    vec!["ReadCredentials".to_string(), "Keychain".to_string()]
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mode: GatewayMode::default(),
            hard_deny: default_hard_deny(),
            allow: Vec::new(),
            deny: Vec::new(),
            channel_policies: HashMap::new(),
        }
    }
}

/// Allow/deny lists for a single channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelPolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Operating mode overlay for the tool mediator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayMode {
    /// Classify each call and prompt for approval where required.
    #[default]
    Standard,
    /// Allow everything; `notify`-tier calls still emit an event.
    Autonomous,
    /// Auto-allow file edits that would otherwise require approval.
    AcceptEdits,
    /// Everything except read-only tools requires approval.
    Lockdown,
}

/// Session lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Hours of inactivity after which the next inbound message starts a
    /// fresh session (same key, new session id).
    #[serde(default = "default_idle_hours")]
    pub idle_timeout_hours: u64,

    /// Hours of event history to retain for replay.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

fn default_idle_hours() -> u64 {
    4
}
fn default_retention_hours() -> u64 {
    24
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_hours: default_idle_hours(),
            retention_hours: default_retention_hours(),
        }
    }
}

/// Filesystem RPC surface (`fs.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsConfig {
    /// Roots under which `fs.*` operations are permitted. Paths are
    /// `~`-expanded at load time. Empty means the fs surface is disabled.
    #[serde(default)]
    pub allowed_roots: Vec<String>,
}

impl FsConfig {
    /// Expanded allow-list roots.
    pub fn roots(&self) -> Vec<PathBuf> {
        self.allowed_roots
            .iter()
            .map(|r| PathBuf::from(shellexpand::tilde(r).into_owned()))
            .collect()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
