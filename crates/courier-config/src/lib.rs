// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Gateway configuration loaded from YAML.
//!
//! Configuration is YAML (never TOML).  Layers are **deep-merged** — you can
//! override only the fields you care about in each file.
//!
//! Search order (later overrides earlier):
//! 1. `/etc/courier/gateway.yaml`
//! 2. `~/.config/courier/gateway.yaml`
//! 3. `.courier/gateway.yaml` (workspace-local)
//! 4. Path given to [`load`] explicitly.
//!
//! **All defaults are production-safe.** Running `load(None)` with no config
//! file gives you TLS on, loopback bind, no channels, and tool approval in
//! standard (classify-and-ask) mode.

mod loader;
mod schema;

pub use loader::{load, merge_yaml};
pub use schema::{
    ChannelPolicy, ChannelsConfig, FsConfig, GatewayConfig, GatewayMode, HttpConfig,
    ProviderConfig, SessionConfig, TelegramConfig, ToolsConfig, WhatsAppConfig,
};
