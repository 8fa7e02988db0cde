// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Local agent gateway: one LLM agent, many channels.
#[derive(Parser)]
#[command(name = "courier", version, about)]
pub struct Cli {
    /// Explicit config file (merged over the default search paths).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging (debug level; RUST_LOG overrides).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway daemon (the default).
    Start,

    /// Gateway token management.
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Print the merged configuration as YAML.
    ShowConfig,
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Replace the token with a fresh one and print it.
    Regenerate,
    /// Print the current token (generating one on first use).
    Show,
}
