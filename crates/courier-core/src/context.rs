// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `GatewayContext` — the one value that carries all shared state.
//!
//! Built once at startup and threaded through construction; there are no
//! module-level singletons.  Mutable pieces live behind their own
//! synchronization (the registry's mutex, the fan-out's subscriber lock,
//! the pending tables) so holders of the context never contend on one big
//! lock.

use std::sync::Arc;

use tokio::sync::RwLock;

use courier_channels::{ChannelRegistry, OwnerStore};
use courier_config::GatewayConfig;
use courier_provider::AgentProvider;
use courier_store::Store;

use crate::calendar::CalendarStore;
use crate::fanout::EventBus;
use crate::pending::PendingTables;
use crate::reauth::ReauthTable;
use crate::registry::Registry;
use crate::snapshot::SnapshotTable;

/// Where a run came from, when it came from a messaging channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMeta {
    pub channel: String,
    pub chat_id: String,
}

pub struct GatewayContext {
    pub config: RwLock<GatewayConfig>,
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
    pub snapshots: Arc<SnapshotTable>,
    pub bus: Arc<EventBus>,
    pub pending: Arc<PendingTables>,
    pub provider: Arc<dyn AgentProvider>,
    pub channels: ChannelRegistry,
    pub owners: Arc<OwnerStore>,
    pub reauth: Arc<ReauthTable>,
    pub calendar: Arc<CalendarStore>,
}

impl GatewayContext {
    pub async fn new(
        config: GatewayConfig,
        store: Arc<Store>,
        provider: Arc<dyn AgentProvider>,
        channels: ChannelRegistry,
        owners: Arc<OwnerStore>,
    ) -> Arc<Self> {
        let snapshots = Arc::new(SnapshotTable::new());
        let bus = EventBus::new(store.clone(), snapshots.clone());
        let registry = Registry::new(store.clone(), config.session.idle_timeout_hours);
        registry.attach_bus(bus.clone()).await;

        Arc::new(Self {
            config: RwLock::new(config),
            store,
            registry,
            snapshots,
            bus,
            pending: Arc::new(PendingTables::new()),
            provider,
            channels,
            owners,
            reauth: Arc::new(ReauthTable::new()),
            calendar: Arc::new(CalendarStore::new()),
        })
    }

    /// Adapter for a channel name, when one is configured.
    pub fn adapter(
        &self,
        channel: &str,
    ) -> Option<Arc<dyn courier_channels::ChannelAdapter>> {
        self.channels.get(channel)
    }
}
