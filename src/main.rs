// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, TokenCommands};
use courier_channels::{ChannelRegistry, OwnerStore, TelegramAdapter, WhatsAppAdapter};
use courier_core::{Dispatcher, GatewayContext};
use courier_provider::CliProvider;
use courier_store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => start(cli.config.as_deref()).await,
        Commands::Token { command } => match command {
            TokenCommands::Regenerate => regenerate_token(cli.config.as_deref()),
            TokenCommands::Show => show_token(cli.config.as_deref()),
        },
        Commands::ShowConfig => {
            let config = courier_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
    }
}

async fn start(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = courier_config::load(config_path)?;
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let store = Arc::new(
        Store::open(&data_dir.join("courier.db")).context("opening the event database")?,
    );

    let provider = Arc::new(CliProvider::new(
        &config.provider.command,
        config.provider.args.clone(),
        config.provider.model.clone(),
    ));

    // ── Channels ─────────────────────────────────────────────────────────────
    let (channel_tx, channel_rx) = tokio::sync::mpsc::channel(64);
    let mut channels = ChannelRegistry::new();

    if let Some(telegram) = &config.channels.telegram {
        let adapter = TelegramAdapter::new(&telegram.bot_token, channel_tx.clone());
        channels.register(adapter.clone());
        tokio::spawn(adapter.run());
        tracing::info!("telegram channel enabled");
    }
    if let Some(whatsapp) = &config.channels.whatsapp {
        let adapter = WhatsAppAdapter::new(&whatsapp.bridge_url, channel_tx.clone());
        channels.register(adapter.clone());
        tokio::spawn(adapter.run());
        tracing::info!(bridge = %whatsapp.bridge_url, "whatsapp channel enabled");
    }

    let owners = OwnerStore::load(data_dir.join("owner-chat-ids.json"));

    let ctx = GatewayContext::new(config, store, provider, channels, owners).await;
    let dispatcher = Dispatcher::new(ctx);
    tokio::spawn(dispatcher.clone().run_channel_pump(channel_rx));

    courier_gateway::serve(dispatcher).await
}

fn regenerate_token(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = courier_config::load(config_path)?;
    let path = config
        .http
        .token_file
        .clone()
        .unwrap_or_else(|| config.data_dir().join("gateway-token"));
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("removing old token {}", path.display()))?;
    }
    let token = courier_gateway::token::GatewayToken::load_or_generate(&path)?;
    println!("New gateway token:");
    println!("  {}", token.as_str());
    println!();
    println!(
        "Clients authenticate with: {{\"method\": \"auth\", \"params\": {{\"token\": \"…\"}}}}"
    );
    Ok(())
}

fn show_token(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = courier_config::load(config_path)?;
    let path = config
        .http
        .token_file
        .clone()
        .unwrap_or_else(|| config.data_dir().join("gateway-token"));
    let token = courier_gateway::token::GatewayToken::load_or_generate(&path)?;
    println!("{}", token.as_str());
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "courier={default},courier_core={default},courier_gateway={default},\
             courier_channels={default},courier_provider={default}"
        ))
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}
