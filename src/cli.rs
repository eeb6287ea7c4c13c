// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "dswarm",
    about = "Join peer swarms by topic over pluggable transports",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to an additional config file (applied last)
    #[arg(long, short = 'c', global = true, env = "DSWARM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a swarm node until interrupted
    Run(RunArgs),
    /// Print the effective configuration and exit
    ShowConfig,
    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Flags given here override the loaded configuration.
#[derive(clap::Args, Debug, Default)]
pub struct RunArgs {
    /// Topics to join, in addition to the configured ones
    #[arg(value_name = "TOPIC")]
    pub topics: Vec<String>,

    /// TCP port to listen on (0 = OS-assigned)
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Static peer URI (tcp://host:port or wrtc://host/id); repeatable
    #[arg(long = "peer", value_name = "URI")]
    pub peers: Vec<String>,

    /// Maximum simultaneous dialing plus connected peers (0 = unbounded)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Announce this node for every joined topic
    #[arg(long)]
    pub announce: bool,

    /// Log peer lifecycle at info level
    #[arg(long)]
    pub debug: bool,
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "dswarm", &mut std::io::stdout());
}
