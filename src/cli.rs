// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "hamn",
    version,
    about = "Relay station for a decentralized end-to-end-encrypted messaging mesh"
)]
pub struct Cli {
    /// Explicit configuration file, merged on top of the discovered layers.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay station (the default when no subcommand is given).
    Serve,
    /// Print the merged configuration and exit.
    ShowConfig,
}
